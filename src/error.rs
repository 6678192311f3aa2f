//! Request-level error type. Each variant carries enough context for the
//! HTTP layer to pick a status code without inspecting the message.

use axum::http::StatusCode;
use uuid::Uuid;

/// Errors surfaced by node, NIO and capture operations.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("Node ID {0} doesn't exist")]
    NodeNotFound(Uuid),

    #[error("Node ID {node} doesn't belong to project {project}")]
    NodeNotInProject { node: Uuid, project: Uuid },

    #[error("Node ID {0} already exists")]
    NodeExists(Uuid),

    #[error("Port {port} is not allocated on node {node}")]
    PortNotFound { node: Uuid, port: u32 },

    #[error("Port {port} on node {node} has no NIO attached")]
    NioNotFound { node: Uuid, port: u32 },

    #[error("Port {port} on node {node} is already connected")]
    PortOccupied { node: Uuid, port: u32 },

    #[error("Packet capture is already active on port {port} of node {node}")]
    CaptureAlreadyRunning { node: Uuid, port: u32 },

    #[error("No packet capture is active on port {port} of node {node}")]
    CaptureNotRunning { node: Uuid, port: u32 },

    #[error("Capture file '{0}' not found")]
    CaptureFileNotFound(String),

    #[error("Can't modify the ports of hub {0} while it is connected")]
    HubInUse(Uuid),

    #[error("UDP port {port} is already in use on project {project}")]
    UdpPortInUse { port: u16, project: String },

    #[error("UDP port {port} belongs to project {owner}, not {project}")]
    UdpPortNotOwned { port: u16, project: String, owner: String },

    #[error("UDP port {port} is outside of the range {start}-{end}")]
    UdpPortOutOfRange { port: u16, start: u16, end: u16 },

    #[error("No free UDP port in range {start}-{end}")]
    NoFreeUdpPort { start: u16, end: u16 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NodeNotFound(_)
            | Self::NodeNotInProject { .. }
            | Self::PortNotFound { .. }
            | Self::NioNotFound { .. }
            | Self::CaptureNotRunning { .. }
            | Self::CaptureFileNotFound(_) => StatusCode::NOT_FOUND,
            Self::NodeExists(_)
            | Self::PortOccupied { .. }
            | Self::CaptureAlreadyRunning { .. }
            | Self::HubInUse(_)
            | Self::UdpPortInUse { .. }
            | Self::UdpPortNotOwned { .. }
            | Self::UdpPortOutOfRange { .. }
            | Self::NoFreeUdpPort { .. } => StatusCode::CONFLICT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) | Self::NodeNotInProject { .. } => "NODE_NOT_FOUND",
            Self::NodeExists(_) => "NODE_EXISTS",
            Self::PortNotFound { .. } => "PORT_NOT_FOUND",
            Self::NioNotFound { .. } => "NIO_NOT_FOUND",
            Self::PortOccupied { .. } => "PORT_OCCUPIED",
            Self::CaptureAlreadyRunning { .. } => "CAPTURE_ALREADY_RUNNING",
            Self::CaptureNotRunning { .. } => "CAPTURE_NOT_RUNNING",
            Self::CaptureFileNotFound(_) => "CAPTURE_FILE_NOT_FOUND",
            Self::HubInUse(_) => "HUB_IN_USE",
            Self::UdpPortInUse { .. } => "UDP_PORT_IN_USE",
            Self::UdpPortNotOwned { .. } => "UDP_PORT_NOT_OWNED",
            Self::UdpPortOutOfRange { .. } => "UDP_PORT_OUT_OF_RANGE",
            Self::NoFreeUdpPort { .. } => "NO_FREE_UDP_PORT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code() == StatusCode::CONFLICT
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

/// Lets handlers return `Result<_, ControlError>` directly.
impl axum::response::IntoResponse for ControlError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {:#}", self);
        }
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
