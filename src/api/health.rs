use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const CLIENT_VERSION_HEADER: &str = "x-client-version";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<&'static str>,
}

/// GET /health
///
/// Unauthenticated liveness endpoint. A client that sends its own version
/// is told when it lags behind the server.
pub async fn health(headers: HeaderMap) -> Json<HealthResponse> {
    let mut response = HealthResponse {
        status: "ok",
        version: VERSION,
        timestamp: Utc::now(),
        update_required: None,
        latest_version: None,
    };

    if let Some(client) = headers
        .get(CLIENT_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| semver::Version::parse(v.trim_start_matches('v')).ok())
    {
        if let Ok(server) = semver::Version::parse(VERSION) {
            if client < server {
                response.update_required = Some(true);
                response.latest_version = Some(VERSION);
            }
        }
    }

    Json(response)
}
