//! Self-describing plugin metadata: identity, capabilities and the endpoint
//! configuration schema every plugin declares.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub author: String,
    pub version: String,
    pub features: Features,
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Example endpoint configuration, as JSON text.
    #[serde(default)]
    pub example: String,
    /// Default endpoint configuration, as JSON text.
    #[serde(default)]
    pub defaults: String,
}

impl PluginInfo {
    pub fn new(name: &str, author: &str, version: &str, features: Features) -> Self {
        Self {
            name: name.to_string(),
            author: author.to_string(),
            version: version.to_string(),
            features,
            fields: Vec::new(),
            example: String::new(),
            defaults: String::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields_for(&self, mode: FieldMode) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(move |f| f.mode == mode)
    }

    pub fn supports(&self, mode: FieldMode) -> bool {
        match mode {
            FieldMode::Target => self.features.target,
            FieldMode::Store => self.features.store,
        }
    }
}

/// Which roles a plugin can play. Serialized as `"yes"` / `"no"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features {
    #[serde(with = "yes_no")]
    pub target: bool,
    #[serde(with = "yes_no")]
    pub store: bool,
}

impl Features {
    pub fn target() -> Self {
        Self { target: true, store: false }
    }

    pub fn store() -> Self {
        Self { target: false, store: true }
    }

    pub fn both() -> Self {
        Self { target: true, store: true }
    }
}

mod yes_no {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(if *v { "yes" } else { "no" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Text(String),
        }
        Ok(match Raw::deserialize(d)? {
            Raw::Flag(b) => b,
            Raw::Text(s) => matches!(s.to_ascii_lowercase().as_str(), "yes" | "true" | "y"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMode {
    Target,
    Store,
}

impl FieldMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Target => "target",
            FieldMode::Store => "store",
        }
    }
}

impl std::str::FromStr for FieldMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target" => Ok(FieldMode::Target),
            "store" => Ok(FieldMode::Store),
            other => Err(format!("unknown field mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "enum")]
    Enum,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "port")]
    Port,
    #[serde(rename = "abspath")]
    AbsPath,
    #[serde(rename = "pem-x509")]
    PemX509,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub mode: FieldMode,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    pub title: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    /// Allowed values for `enum` fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

impl Field {
    pub fn new(mode: FieldMode, name: &str, kind: FieldType, title: &str) -> Self {
        Self {
            mode,
            name: name.to_string(),
            kind,
            title: title.to_string(),
            help: String::new(),
            required: false,
            default: None,
            example: None,
            choices: Vec::new(),
        }
    }

    pub fn target(name: &str, kind: FieldType, title: &str) -> Self {
        Self::new(FieldMode::Target, name, kind, title)
    }

    pub fn store(name: &str, kind: FieldType, title: &str) -> Self {
        Self::new(FieldMode::Store, name, kind, title)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn help(mut self, help: &str) -> Self {
        self.help = help.to_string();
        self
    }

    pub fn default_value(mut self, value: &str) -> Self {
        self.default = Some(value.to_string());
        self
    }

    pub fn example(mut self, value: &str) -> Self {
        self.example = Some(value.to_string());
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_serialization_matches_wire_format() {
        let info = PluginInfo::new("WebDAV", "ops", "0.1.0", Features::store()).with_field(
            Field::store("url", FieldType::String, "WebDAV Host")
                .required()
                .help("Root URL"),
        );
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["features"]["store"], "yes");
        assert_eq!(json["features"]["target"], "no");
        assert_eq!(json["fields"][0]["type"], "string");
        assert_eq!(json["fields"][0]["mode"], "store");
        assert_eq!(json["fields"][0]["required"], true);
    }

    #[test]
    fn test_features_accept_legacy_values() {
        let f: Features = serde_json::from_str(r#"{"target":"YES","store":false}"#).unwrap();
        assert!(f.target);
        assert!(!f.store);
    }

    #[test]
    fn test_field_types_parse() {
        let t: FieldType = serde_json::from_str("\"pem-x509\"").unwrap();
        assert_eq!(t, FieldType::PemX509);
        let t: FieldType = serde_json::from_str("\"abspath\"").unwrap();
        assert_eq!(t, FieldType::AbsPath);
    }

    #[test]
    fn test_fields_for_mode() {
        let info = PluginInfo::new("x", "a", "1", Features::both())
            .with_field(Field::target("path", FieldType::AbsPath, "Path"))
            .with_field(Field::store("bucket", FieldType::String, "Bucket"));
        assert_eq!(info.fields_for(FieldMode::Target).count(), 1);
        assert_eq!(info.fields_for(FieldMode::Store).next().unwrap().name, "bucket");
        assert!(info.supports(FieldMode::Store));
    }
}
