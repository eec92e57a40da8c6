//! Wire messages of the installer agent control protocol.
//!
//! The agent exposes three calls: a server-streaming `Execute` that reports
//! [`ProgressMessage`]s, and unary `Shutdown` and `Abort` calls. Messages
//! use the proto3 binary layout. Encoding goes through `prost::encoding`,
//! but the messages are written by hand so that unknown fields are carried
//! through a decode and re-encode unchanged.

pub mod encoding;
pub mod error;
pub mod frame;
pub mod message;

pub use error::{CodecError, Result};
pub use frame::{encode_frame, FrameDecoder, MAX_FRAME_LEN};
pub use message::{
    AbortRequest, AbortResponse, Error, ExecuteRequest, Message, ProgressMessage,
    ShutdownRequest, ShutdownResponse,
};

/// Route prefix of the agent service.
pub const SERVICE_NAME: &str = "installer.Agent";
/// Content type of encoded messages and frame streams.
pub const CONTENT_TYPE: &str = "application/x-installer-proto";

pub fn execute_path() -> String {
    format!("/{}/Execute", SERVICE_NAME)
}

pub fn shutdown_path() -> String {
    format!("/{}/Shutdown", SERVICE_NAME)
}

pub fn abort_path() -> String {
    format!("/{}/Abort", SERVICE_NAME)
}
