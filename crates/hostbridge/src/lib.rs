//! Client for driving a remote execution host over a websocket relay.
//!
//! Commands are correlated with their replies by request id; progress frames
//! keep long-running commands alive and are published to subscribers, and only
//! a terminal result or error completes the caller.

pub mod bridge;
pub mod commands;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod interpreter;
pub mod session;

pub use bridge::HostBridge;
pub use commands::{
    ExportFormat, ExportImage, ExportedImage, GetAnnotations, HostRequest, NodeIds, ScanNodesByTypes,
    ScanReport, ScanTextNodes,
};
pub use config::BridgeConfig;
pub use connection::LinkState;
pub use error::{BridgeError, BridgeResult};
pub use interpreter::{Disposition, ProgressEvent};

pub use hostbridge_protocol as protocol;
pub use hostbridge_protocol::HostCommand;
