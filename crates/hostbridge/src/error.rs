use hostbridge_protocol::{FrameError, RequestId};
use thiserror::Error;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("not connected to the execution host")]
    NotConnected,
    #[error("no channel joined; join a channel before sending commands")]
    NoChannel,
    #[error("request {command} ({id}) timed out after {timeout_ms}ms")]
    Timeout {
        command: String,
        id: RequestId,
        timeout_ms: u64,
    },
    #[error("connection closed")]
    ConnectionClosed,
    /// Error string reported by the host, unchanged.
    #[error("{0}")]
    HostError(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {message}")]
    Io { message: String },
}

impl BridgeError {
    /// Errors that may go away on retry once the link recovers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionClosed | Self::Timeout { .. } | Self::Transport(_)
        )
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParams(reason.into())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<FrameError> for BridgeError {
    fn from(err: FrameError) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BridgeError::NotConnected.is_transient());
        assert!(BridgeError::ConnectionClosed.is_transient());
        assert!(BridgeError::Transport("reset".into()).is_transient());
        assert!(
            BridgeError::Timeout {
                command: "scan_text_nodes".into(),
                id: "abc".into(),
                timeout_ms: 10,
            }
            .is_transient()
        );
        assert!(!BridgeError::NoChannel.is_transient());
        assert!(!BridgeError::HostError("Node not found".into()).is_transient());
        assert!(!BridgeError::invalid("scale must be > 0").is_transient());
    }

    #[test]
    fn host_error_is_verbatim() {
        let err = BridgeError::HostError("Node not found: 1:2".into());
        assert_eq!(err.to_string(), "Node not found: 1:2");
    }

    #[test]
    fn timeout_names_command_and_id() {
        let err = BridgeError::Timeout {
            command: "get_styles".into(),
            id: "r-1".into(),
            timeout_ms: 120_000,
        };
        let text = err.to_string();
        assert!(text.contains("get_styles"));
        assert!(text.contains("r-1"));
        assert!(text.contains("120000ms"));
    }
}
