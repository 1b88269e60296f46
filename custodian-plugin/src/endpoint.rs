//! Endpoint configuration: an opaque JSON object validated at runtime against
//! the [`Field`] schema a plugin declares.

use crate::errors::{FieldViolation, ValidationError};
use crate::meta::{Field, FieldMode, FieldType, PluginInfo};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(Map<String, Value>);

impl Endpoint {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.trim().is_empty() {
            return Ok(Self::new());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            _ => Err(ValidationError::NotAnObject),
        }
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn string_value(&self, key: &str) -> Result<String, ValidationError> {
        match self.get(key) {
            None => Err(ValidationError::MissingField(key.to_string())),
            Some(Value::String(s)) if s.is_empty() => {
                Err(ValidationError::MissingField(key.to_string()))
            }
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(bad(key, "must be a string")),
        }
    }

    pub fn string_value_default(&self, key: &str, default: &str) -> Result<String, ValidationError> {
        match self.string_value(key) {
            Err(ValidationError::MissingField(_)) => Ok(default.to_string()),
            other => other,
        }
    }

    pub fn bool_value_default(&self, key: &str, default: bool) -> Result<bool, ValidationError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => as_bool(v).ok_or_else(|| bad(key, "must be a boolean")),
        }
    }

    pub fn port_value_default(&self, key: &str, default: u16) -> Result<u16, ValidationError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => as_port(v).ok_or_else(|| bad(key, "must be a port number (1-65535)")),
        }
    }

    /// Checks every field declared for `mode`, collecting all violations.
    pub fn validate(&self, info: &PluginInfo, mode: FieldMode) -> Result<(), ValidationError> {
        let mut violations: Vec<FieldViolation> = info
            .fields_for(mode)
            .filter_map(|field| check_field(field, self.get(&field.name)))
            .collect();

        if violations.len() > 1 {
            return Err(ValidationError::Multiple(violations));
        }
        match violations.pop() {
            None => Ok(()),
            Some(v) if v.problem == REQUIRED => Err(ValidationError::MissingField(v.field)),
            Some(v) => Err(ValidationError::BadData { field: v.field, problem: v.problem }),
        }
    }

    /// Returns a copy with declared defaults filled in for absent fields.
    pub fn with_defaults(&self, info: &PluginInfo, mode: FieldMode) -> Endpoint {
        let mut map = self.0.clone();
        for field in info.fields_for(mode) {
            if self.get(&field.name).is_some() {
                continue;
            }
            if let Some(default) = &field.default {
                map.insert(field.name.clone(), typed_default(field.kind, default));
            }
        }
        Endpoint(map)
    }
}

const REQUIRED: &str = "is required";

fn bad(key: &str, problem: &str) -> ValidationError {
    ValidationError::BadData {
        field: key.to_string(),
        problem: problem.to_string(),
    }
}

fn violation(field: &Field, problem: impl Into<String>) -> Option<FieldViolation> {
    Some(FieldViolation {
        field: field.name.clone(),
        problem: problem.into(),
    })
}

fn check_field(field: &Field, value: Option<&Value>) -> Option<FieldViolation> {
    let value = match value {
        Some(Value::String(s)) if s.is_empty() => None,
        other => other,
    };
    let Some(value) = value else {
        if field.required && field.default.is_none() {
            return violation(field, REQUIRED);
        }
        return None;
    };

    match field.kind {
        FieldType::String | FieldType::Password => {
            if !value.is_string() {
                return violation(field, "must be a string");
            }
        }
        FieldType::Enum => {
            let Some(s) = value.as_str() else {
                return violation(field, "must be a string");
            };
            if !field.choices.is_empty() && !field.choices.iter().any(|c| c == s) {
                return violation(field, format!("must be one of: {}", field.choices.join(", ")));
            }
        }
        FieldType::Bool => {
            if as_bool(value).is_none() {
                return violation(field, "must be a boolean");
            }
        }
        FieldType::Port => {
            if as_port(value).is_none() {
                return violation(field, "must be a port number (1-65535)");
            }
        }
        FieldType::AbsPath => match value.as_str() {
            Some(s) if s.starts_with('/') => {}
            Some(_) => return violation(field, "must be an absolute path"),
            None => return violation(field, "must be a string"),
        },
        FieldType::PemX509 => match value.as_str() {
            Some(s)
                if s.contains("-----BEGIN CERTIFICATE-----")
                    && s.contains("-----END CERTIFICATE-----") => {}
            Some(_) => return violation(field, "must be a PEM-encoded X.509 certificate"),
            None => return violation(field, "must be a string"),
        },
    }
    None
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_port(v: &Value) -> Option<u16> {
    let n = match v {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u16::try_from(n).ok().filter(|p| *p > 0)
}

fn typed_default(kind: FieldType, raw: &str) -> Value {
    match kind {
        FieldType::Bool => as_bool(&Value::String(raw.into()))
            .map(Value::Bool)
            .unwrap_or_else(|| Value::String(raw.into())),
        FieldType::Port => raw
            .parse::<u16>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.into())),
        _ => Value::String(raw.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Features;

    fn info() -> PluginInfo {
        PluginInfo::new("pg", "ops", "1.0", Features::target())
            .with_field(Field::target("host", FieldType::String, "Host").required())
            .with_field(Field::target("port", FieldType::Port, "Port").default_value("5432"))
            .with_field(Field::target("password", FieldType::Password, "Password"))
            .with_field(Field::target("dump_dir", FieldType::AbsPath, "Dump Dir"))
            .with_field(
                Field::target("mode", FieldType::Enum, "Mode").choices(&["full", "schema"]),
            )
            .with_field(Field::target("tls", FieldType::Bool, "TLS"))
            .with_field(Field::store("bucket", FieldType::String, "Bucket").required())
    }

    #[test]
    fn test_valid_endpoint_passes() {
        let ep = Endpoint::parse(r#"{"host":"db1","port":"6432","tls":true,"mode":"full"}"#).unwrap();
        assert!(ep.validate(&info(), FieldMode::Target).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let ep = Endpoint::parse(r#"{"port":5432}"#).unwrap();
        let err = ep.validate(&info(), FieldMode::Target).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("host".into()));
    }

    #[test]
    fn test_store_fields_are_not_checked_for_target_mode() {
        let ep = Endpoint::parse(r#"{"host":"db1"}"#).unwrap();
        assert!(ep.validate(&info(), FieldMode::Target).is_ok());
        assert!(ep.validate(&info(), FieldMode::Store).is_err());
    }

    #[test]
    fn test_type_violations_are_collected() {
        let ep = Endpoint::parse(
            r#"{"host":"db1","port":70000,"dump_dir":"relative/dir","mode":"partial","tls":"maybe"}"#,
        )
        .unwrap();
        match ep.validate(&info(), FieldMode::Target).unwrap_err() {
            ValidationError::Multiple(v) => {
                let names: Vec<_> = v.iter().map(|f| f.field.as_str()).collect();
                assert_eq!(names, vec!["port", "dump_dir", "mode", "tls"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_pem_field() {
        let info = PluginInfo::new("x", "a", "1", Features::store())
            .with_field(Field::store("ca", FieldType::PemX509, "CA"));
        let bad = Endpoint::new().set("ca", "not a cert");
        assert!(bad.validate(&info, FieldMode::Store).is_err());
        let good = Endpoint::new().set(
            "ca",
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
        );
        assert!(good.validate(&info, FieldMode::Store).is_ok());
    }

    #[test]
    fn test_defaults_are_typed() {
        let ep = Endpoint::parse(r#"{"host":"db1"}"#).unwrap();
        let filled = ep.with_defaults(&info(), FieldMode::Target);
        assert_eq!(filled.get("port"), Some(&Value::from(5432)));
        assert_eq!(filled.port_value_default("port", 1).unwrap(), 5432);
    }

    #[test]
    fn test_accessors() {
        let ep = Endpoint::new().set("url", "https://dav").set("skip", "yes");
        assert_eq!(ep.string_value("url").unwrap(), "https://dav");
        assert!(ep.bool_value_default("skip", false).unwrap());
        assert_eq!(ep.string_value_default("user", "anon").unwrap(), "anon");
        assert!(matches!(ep.string_value("missing"), Err(ValidationError::MissingField(_))));
    }

    #[test]
    fn test_non_object_rejected() {
        assert_eq!(Endpoint::parse("[1,2]").unwrap_err(), ValidationError::NotAnObject);
        assert!(Endpoint::parse("").unwrap().get("x").is_none());
    }
}
