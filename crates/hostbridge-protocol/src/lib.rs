pub mod chunking;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Correlation key shared by the envelope, `message.id` and `params.commandId`.
pub type RequestId = String;

/// Default port of the local relay when the server is `localhost`.
pub const DEFAULT_PORT: u16 = 3055;

/// Timeout for host-bound commands before any progress arrives.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 120_000;

/// Timeout for the bootstrap `join` command.
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 30_000;

/// Silence allowed between two progress frames of the same request.
pub const INACTIVITY_TIMEOUT_MS: u64 = 60_000;

/// Fixed pause before each reconnect attempt.
pub const RECONNECT_DELAY_MS: u64 = 2_000;

/// `type` tag of progress frames.
pub const PROGRESS_UPDATE: &str = "progress_update";

/// `type` tag carried inside every progress payload.
pub const COMMAND_PROGRESS: &str = "command_progress";

/// Params key the request id is mirrored into.
pub const COMMAND_ID_PARAM: &str = "commandId";

// ---------------------------------------------------------------------------
// Command vocabulary
// ---------------------------------------------------------------------------

/// Command names understood by the execution host.
///
/// The vocabulary is open: anything not listed travels as [`HostCommand::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostCommand {
    Join,
    GetDocumentInfo,
    GetSelection,
    GetNodeInfo,
    GetNodesInfo,
    GetStyles,
    GetLocalComponents,
    GetTeamComponents,
    ExportNodeAsImage,
    ScanTextNodes,
    GetAnnotations,
    ScanNodesByTypes,
    Other(String),
}

impl HostCommand {
    pub fn as_str(&self) -> &str {
        match self {
            HostCommand::Join => "join",
            HostCommand::GetDocumentInfo => "get_document_info",
            HostCommand::GetSelection => "get_selection",
            HostCommand::GetNodeInfo => "get_node_info",
            HostCommand::GetNodesInfo => "get_nodes_info",
            HostCommand::GetStyles => "get_styles",
            HostCommand::GetLocalComponents => "get_local_components",
            HostCommand::GetTeamComponents => "get_team_components",
            HostCommand::ExportNodeAsImage => "export_node_as_image",
            HostCommand::ScanTextNodes => "scan_text_nodes",
            HostCommand::GetAnnotations => "get_annotations",
            HostCommand::ScanNodesByTypes => "scan_nodes_by_types",
            HostCommand::Other(name) => name,
        }
    }

    /// Bootstrap commands are allowed before a channel is joined.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, HostCommand::Join)
    }
}

impl From<&str> for HostCommand {
    fn from(name: &str) -> Self {
        match name {
            "join" => HostCommand::Join,
            "get_document_info" => HostCommand::GetDocumentInfo,
            "get_selection" => HostCommand::GetSelection,
            "get_node_info" => HostCommand::GetNodeInfo,
            "get_nodes_info" => HostCommand::GetNodesInfo,
            "get_styles" => HostCommand::GetStyles,
            "get_local_components" => HostCommand::GetLocalComponents,
            "get_team_components" => HostCommand::GetTeamComponents,
            "export_node_as_image" => HostCommand::ExportNodeAsImage,
            "scan_text_nodes" => HostCommand::ScanTextNodes,
            "get_annotations" => HostCommand::GetAnnotations,
            "scan_nodes_by_types" => HostCommand::ScanNodesByTypes,
            other => HostCommand::Other(other.to_string()),
        }
    }
}

impl From<String> for HostCommand {
    fn from(name: String) -> Self {
        HostCommand::from(name.as_str())
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HostCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HostCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(HostCommand::from(String::deserialize(deserializer)?))
    }
}

// ---------------------------------------------------------------------------
// Outgoing (client -> host)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Join,
    Message,
}

/// The command carried inside an [`OutgoingEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub id: RequestId,
    pub command: HostCommand,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// A command as written to the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEnvelope {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub channel: String,
    pub message: CommandMessage,
}

impl OutgoingEnvelope {
    /// Build an envelope, mirroring `id` into `message.id` and `params.commandId`.
    pub fn new(
        id: RequestId,
        command: HostCommand,
        channel: impl Into<String>,
        mut params: Map<String, Value>,
    ) -> Self {
        let kind = if command.is_bootstrap() {
            EnvelopeType::Join
        } else {
            EnvelopeType::Message
        };
        params.insert(COMMAND_ID_PARAM.to_string(), Value::String(id.clone()));
        Self {
            id: id.clone(),
            kind,
            channel: channel.into(),
            message: CommandMessage {
                id,
                command,
                params,
            },
        }
    }

    pub fn command_id(&self) -> Option<&str> {
        self.message
            .params
            .get(COMMAND_ID_PARAM)
            .and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Progress payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
    Error,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::Started => write!(f, "started"),
            ProgressStatus::InProgress => write!(f, "in_progress"),
            ProgressStatus::Completed => write!(f, "completed"),
            ProgressStatus::Error => write!(f, "error"),
        }
    }
}

/// Status report for a long-running command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    #[serde(rename = "type", default = "default_progress_kind")]
    pub kind: String,
    #[serde(default)]
    pub command_id: RequestId,
    #[serde(default)]
    pub command_type: String,
    pub status: ProgressStatus,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub processed_items: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chunk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub timestamp: u64,
}

fn default_progress_kind() -> String {
    COMMAND_PROGRESS.to_string()
}

impl ProgressPayload {
    /// The host considers the operation done. The caller still waits for the
    /// terminal frame.
    pub fn is_finished(&self) -> bool {
        self.status == ProgressStatus::Completed && self.progress == 100
    }
}

// ---------------------------------------------------------------------------
// Incoming (host -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressBody {
    pub data: ProgressPayload,
}

/// `{ "type": "progress_update", "id": .., "message": { "data": .. } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub message: ProgressBody,
}

impl ProgressFrame {
    pub fn new(id: impl Into<RequestId>, data: ProgressPayload) -> Self {
        Self {
            kind: PROGRESS_UPDATE.to_string(),
            id: Some(id.into()),
            message: ProgressBody { data },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `{ "message": { "id": .., "result"?: .., "error"?: .. } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub message: ResponseBody,
}

impl ResponseFrame {
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            message: ResponseBody {
                id: id.into(),
                result: Some(result),
                error: None,
            },
        }
    }

    pub fn error(id: impl Into<RequestId>, error: impl Into<String>) -> Self {
        Self {
            message: ResponseBody {
                id: id.into(),
                result: None,
                error: Some(error.into()),
            },
        }
    }
}

/// Final outcome reported by a terminal frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Result(Value),
    Error(String),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Progress {
        id: RequestId,
        payload: ProgressPayload,
    },
    Terminal {
        id: RequestId,
        outcome: TerminalOutcome,
    },
    /// Anything that cannot complete a request: relay echoes, system notices,
    /// messages without `result` or `error`.
    Broadcast(Value),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Shape(&'static str),
}

impl InboundFrame {
    /// Classify one text frame received from the host.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: Value = serde_json::from_str(text)?;
        let Some(object) = raw.as_object() else {
            return Err(FrameError::Shape("frame is not a JSON object"));
        };

        if object.get("type").and_then(Value::as_str) == Some(PROGRESS_UPDATE) {
            let frame: ProgressFrame = serde_json::from_value(raw)?;
            let payload = frame.message.data;
            // The top-level id is authoritative; commandId is the same token.
            let id = frame
                .id
                .filter(|id| !id.is_empty())
                .or_else(|| Some(payload.command_id.clone()).filter(|id| !id.is_empty()))
                .ok_or(FrameError::Shape("progress frame without id"))?;
            return Ok(InboundFrame::Progress { id, payload });
        }

        let Some(message) = object.get("message") else {
            return Err(FrameError::Shape("frame has no message"));
        };
        let Some(body) = message.as_object() else {
            return Ok(InboundFrame::Broadcast(raw));
        };

        let id = body.get("id").and_then(Value::as_str).filter(|id| !id.is_empty());
        let error = body.get("error").filter(|v| !v.is_null());
        let result = body.get("result").filter(|v| !v.is_null());

        match (id, error, result) {
            (Some(id), Some(error), _) => Ok(InboundFrame::Terminal {
                id: id.to_string(),
                outcome: TerminalOutcome::Error(match error {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            }),
            (Some(id), None, Some(result)) => Ok(InboundFrame::Terminal {
                id: id.to_string(),
                outcome: TerminalOutcome::Result(result.clone()),
            }),
            _ => Ok(InboundFrame::Broadcast(raw)),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
