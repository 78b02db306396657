//! Wire types shared between ovm and the processes that talk to it.
//!
//! Three channels use these types:
//! - the control plane started alongside a machine (`GET /version`)
//! - the command proxy (`POST /exec`)
//! - progress reports POSTed to the supervising parent's `--report-url`
//!
//! All payloads are JSON.

use serde::{Deserialize, Serialize};

/// Protocol version, bumped on incompatible payload changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known local ports.
pub mod ports {
    /// Default port the command proxy listens on.
    pub const CMD_PROXY: u16 = 38_271;
}

/// Response body of `GET /version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Tool name.
    pub name: String,
    /// Tool version.
    pub version: String,
    /// Wire protocol version.
    pub protocol: u32,
}

impl VersionInfo {
    /// Build the payload for a given tool version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            name: "ovm".to_string(),
            version: version.into(),
            protocol: PROTOCOL_VERSION,
        }
    }
}

/// Request body of `POST /exec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Shell command line executed by `sh -c` in the guest.
    pub command: String,
    /// Optional timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Response body of `POST /exec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    /// Exit code of the guest command (-1 if killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Stage of a machine start, as reported to the supervising parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Config loaded, networking about to start.
    Starting,
    /// Network proxy is up.
    NetworkReady,
    /// Hypervisor helper launched.
    VmLaunched,
    /// Guest API answered a ping.
    Ready,
    /// The start operation is exiting.
    Exit,
    /// The start operation failed.
    Error,
}

/// Body POSTed to `--report-url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEvent {
    /// Machine name.
    pub machine: String,
    /// Start stage.
    pub stage: Stage,
    /// Free-form detail.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_timeout_is_optional() {
        let req: ExecRequest = serde_json::from_str(r#"{"command":"uname -a"}"#).unwrap();
        assert_eq!(req.command, "uname -a");
        assert_eq!(req.timeout_secs, None);

        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("timeout_secs"));
    }

    #[test]
    fn test_report_event_wire_shape() {
        let event = ReportEvent {
            machine: "default".to_string(),
            stage: Stage::NetworkReady,
            message: String::new(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["stage"], "network_ready");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_version_info() {
        let info = VersionInfo::new("1.2.3");
        assert_eq!(info.name, "ovm");
        assert_eq!(info.protocol, PROTOCOL_VERSION);
    }
}
