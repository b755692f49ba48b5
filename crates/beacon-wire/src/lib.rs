//! Wire protocol shared by the beacon controller and agent.
//!
//! Layers, bottom up: [`frame`] moves length-prefixed bodies through a
//! [`transform::FrameTransform`], [`codec`] turns bodies into typed messages,
//! and [`session::Session`] runs one request/response exchange at a time over a
//! stream.

pub mod codec;
pub mod frame;
pub mod kind;
pub mod payload;
pub mod session;
pub mod transform;

pub use codec::{
    decode, decode_envelope, encode, CodecError, Envelope, ErrorCode, Message, PayloadDecoder,
    Request, Response,
};
pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use kind::{KindClass, MessageKind};
pub use payload::{
    BasicIdentity, DownloadAndExecuteRequest, DownloadAndExecuteResult, DownloadFileRequest,
    DownloadFileResult, RunCommandRequest, RunCommandResult, SystemInfo,
};
pub use session::{Session, SessionConfig, SessionError, SessionStream, DEFAULT_REQUEST_TIMEOUT};
pub use transform::{
    transform_for, FrameTransform, Plaintext, SealedTransform, TransformError, SEALED_OVERHEAD,
};
