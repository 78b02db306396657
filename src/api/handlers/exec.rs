//! Command execution handler.

use axum::{extract::State, Json};
use ovm_protocol::{ExecRequest, ExecResponse};
use std::sync::Arc;
use std::time::Duration;

use crate::api::error::ApiError;
use crate::api::ProxyState;

/// POST /exec - Run a shell command in the guest.
pub async fn exec_command(
    State(state): State<Arc<ProxyState>>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command cannot be empty".into()));
    }

    let timeout = req
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(state.default_timeout);

    tracing::debug!(machine = %state.machine, command = %req.command, "exec");
    let output = crate::ssh::run(&state.target, &req.command, timeout).await?;

    Ok(Json(ExecResponse {
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
    }))
}
