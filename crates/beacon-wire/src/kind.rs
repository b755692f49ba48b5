//! Message kind tags.
//!
//! The first byte of every message body identifies its kind. Tags are split
//! into three disjoint ranges so a receiver can classify a message before it
//! knows anything about the payload shape.

use std::fmt;

const REQUEST_MIN: u8 = 0x01;
const REQUEST_MAX: u8 = 0x3F;
const RESPONSE_MIN: u8 = 0x40;
const RESPONSE_MAX: u8 = 0x7F;
const ERROR_MIN: u8 = 0xE0;

/// Bit set on a request tag to obtain its response tag.
const RESPONSE_BIT: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x01,
    GetBasicIdentity = 0x02,
    GetFullSystemInfo = 0x03,
    RunCommand = 0x04,
    DownloadFile = 0x05,
    DownloadAndExecute = 0x06,

    Pong = 0x41,
    BasicIdentity = 0x42,
    FullSystemInfo = 0x43,
    RunCommandResult = 0x44,
    DownloadFileResult = 0x45,
    DownloadAndExecuteResult = 0x46,

    MessageTooSmall = 0xE0,
    MessageNotHandled = 0xE1,
    PayloadDecodeError = 0xE2,
    FrameTooLarge = 0xE3,
}

impl MessageKind {
    pub const ALL: [MessageKind; 16] = [
        MessageKind::Ping,
        MessageKind::GetBasicIdentity,
        MessageKind::GetFullSystemInfo,
        MessageKind::RunCommand,
        MessageKind::DownloadFile,
        MessageKind::DownloadAndExecute,
        MessageKind::Pong,
        MessageKind::BasicIdentity,
        MessageKind::FullSystemInfo,
        MessageKind::RunCommandResult,
        MessageKind::DownloadFileResult,
        MessageKind::DownloadAndExecuteResult,
        MessageKind::MessageTooSmall,
        MessageKind::MessageNotHandled,
        MessageKind::PayloadDecodeError,
        MessageKind::FrameTooLarge,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn class(self) -> KindClass {
        match self.tag() {
            REQUEST_MIN..=REQUEST_MAX => KindClass::Request,
            RESPONSE_MIN..=RESPONSE_MAX => KindClass::Response,
            _ => KindClass::Error,
        }
    }

    /// The only response kind that may answer this request kind.
    ///
    /// Returns `None` for response and error kinds.
    pub fn expected_response(self) -> Option<MessageKind> {
        if self.class() != KindClass::Request {
            return None;
        }
        MessageKind::from_tag(self.tag() | RESPONSE_BIT)
    }

    /// Whether messages of this kind must carry a payload.
    pub fn carries_payload(self) -> bool {
        matches!(
            self,
            MessageKind::RunCommand
                | MessageKind::DownloadFile
                | MessageKind::DownloadAndExecute
                | MessageKind::BasicIdentity
                | MessageKind::FullSystemInfo
                | MessageKind::RunCommandResult
                | MessageKind::DownloadFileResult
                | MessageKind::DownloadAndExecuteResult
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::GetBasicIdentity => "get_basic_identity",
            MessageKind::GetFullSystemInfo => "get_full_system_info",
            MessageKind::RunCommand => "run_command",
            MessageKind::DownloadFile => "download_file",
            MessageKind::DownloadAndExecute => "download_and_execute",
            MessageKind::Pong => "pong",
            MessageKind::BasicIdentity => "basic_identity",
            MessageKind::FullSystemInfo => "full_system_info",
            MessageKind::RunCommandResult => "run_command_result",
            MessageKind::DownloadFileResult => "download_file_result",
            MessageKind::DownloadAndExecuteResult => "download_and_execute_result",
            MessageKind::MessageTooSmall => "message_too_small",
            MessageKind::MessageNotHandled => "message_not_handled",
            MessageKind::PayloadDecodeError => "payload_decode_error",
            MessageKind::FrameTooLarge => "frame_too_large",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02x})", self.name(), self.tag())
    }
}
