//! Version endpoint.

use axum::Json;
use ovm_protocol::VersionInfo;

/// GET /version
pub async fn version() -> Json<VersionInfo> {
    Json(VersionInfo::new(crate::VERSION))
}
