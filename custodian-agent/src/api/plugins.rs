use axum::{extract::State, response::IntoResponse, Json};
use custodian_plugin::{discard_log, PluginInfo, PluginResolver};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct PluginListing {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<PluginInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /plugins: runs `<plugin> info` for everything in the plugin directory.
pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    let mut listings = Vec::new();
    for name in state.plugins.list() {
        let meta = match state.plugins.resolve(&name, discard_log()) {
            Ok(plugin) => plugin.meta().await,
            Err(e) => Err(e),
        };
        listings.push(match meta {
            Ok(info) => PluginListing {
                name,
                info: Some(info),
                error: None,
            },
            Err(e) => PluginListing {
                name,
                info: None,
                error: Some(e.to_string()),
            },
        });
    }
    Json(listings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use custodian_plugin::PluginDir;
    use std::os::unix::fs::PermissionsExt;
    use tower::ServiceExt;

    fn script(dir: &std::path::Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_lists_plugin_metadata_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        script(
            dir.path(),
            "fs",
            r#"echo '{"name":"fs","author":"ops","version":"1.2","features":{"target":true,"store":false},"fields":[]}'"#,
        );
        script(dir.path(), "broken", "echo nope >&2; exit 2");

        let state = AppState::new("agent-1", PluginDir::new(dir.path()), 1);
        let response = create_router(state)
            .oneshot(Request::get("/plugins").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed[0]["name"], "broken");
        assert!(listed[0]["error"].is_string());
        assert_eq!(listed[1]["name"], "fs");
        assert_eq!(listed[1]["info"]["version"], "1.2");
    }
}
