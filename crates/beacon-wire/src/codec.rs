//! Message envelope codec.
//!
//! Body layout: `[kind tag: u8][payload: JSON, optional]`. Decoding happens in
//! two steps: [`decode_envelope`] only reads the tag, then the caller picks a
//! typed target ([`Request::from_envelope`], [`Response::from_envelope`] or a
//! dispatcher keyed on [`MessageKind`]) and calls [`PayloadDecoder::decode`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::kind::{KindClass, MessageKind};
use crate::payload::{
    BasicIdentity, DownloadAndExecuteRequest, DownloadAndExecuteResult, DownloadFileRequest,
    DownloadFileResult, RunCommandRequest, RunCommandResult, SystemInfo,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message too small")]
    TooSmall,
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("{0} expects a payload")]
    MissingPayload(MessageKind),
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: MessageKind, reason: String },
    #[error("{0} is not a {1:?} kind")]
    WrongClass(MessageKind, KindClass),
    #[error("failed to encode {kind} payload: {reason}")]
    Encode { kind: MessageKind, reason: String },
}

impl CodecError {
    /// Error kind a request receiver answers with when decoding fails.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            CodecError::TooSmall => ErrorCode::MessageTooSmall,
            CodecError::UnknownKind(_) | CodecError::WrongClass(..) => {
                ErrorCode::MessageNotHandled
            }
            CodecError::MissingPayload(_)
            | CodecError::MalformedPayload { .. }
            | CodecError::Encode { .. } => ErrorCode::PayloadDecodeError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    GetBasicIdentity,
    GetFullSystemInfo,
    RunCommand(RunCommandRequest),
    DownloadFile(DownloadFileRequest),
    DownloadAndExecute(DownloadAndExecuteRequest),
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::Ping => MessageKind::Ping,
            Request::GetBasicIdentity => MessageKind::GetBasicIdentity,
            Request::GetFullSystemInfo => MessageKind::GetFullSystemInfo,
            Request::RunCommand(_) => MessageKind::RunCommand,
            Request::DownloadFile(_) => MessageKind::DownloadFile,
            Request::DownloadAndExecute(_) => MessageKind::DownloadAndExecute,
        }
    }

    pub fn expected_response(&self) -> MessageKind {
        match self {
            Request::Ping => MessageKind::Pong,
            Request::GetBasicIdentity => MessageKind::BasicIdentity,
            Request::GetFullSystemInfo => MessageKind::FullSystemInfo,
            Request::RunCommand(_) => MessageKind::RunCommandResult,
            Request::DownloadFile(_) => MessageKind::DownloadFileResult,
            Request::DownloadAndExecute(_) => MessageKind::DownloadAndExecuteResult,
        }
    }

    pub fn from_envelope(envelope: &Envelope<'_>) -> Result<Self, CodecError> {
        let payload = &envelope.payload;
        match envelope.kind {
            MessageKind::Ping => Ok(Request::Ping),
            MessageKind::GetBasicIdentity => Ok(Request::GetBasicIdentity),
            MessageKind::GetFullSystemInfo => Ok(Request::GetFullSystemInfo),
            MessageKind::RunCommand => payload.decode().map(Request::RunCommand),
            MessageKind::DownloadFile => payload.decode().map(Request::DownloadFile),
            MessageKind::DownloadAndExecute => payload.decode().map(Request::DownloadAndExecute),
            other => Err(CodecError::WrongClass(other, KindClass::Request)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong,
    BasicIdentity(BasicIdentity),
    FullSystemInfo(SystemInfo),
    RunCommandResult(RunCommandResult),
    DownloadFileResult(DownloadFileResult),
    DownloadAndExecuteResult(DownloadAndExecuteResult),
}

impl Response {
    pub fn kind(&self) -> MessageKind {
        match self {
            Response::Pong => MessageKind::Pong,
            Response::BasicIdentity(_) => MessageKind::BasicIdentity,
            Response::FullSystemInfo(_) => MessageKind::FullSystemInfo,
            Response::RunCommandResult(_) => MessageKind::RunCommandResult,
            Response::DownloadFileResult(_) => MessageKind::DownloadFileResult,
            Response::DownloadAndExecuteResult(_) => MessageKind::DownloadAndExecuteResult,
        }
    }

    pub fn from_envelope(envelope: &Envelope<'_>) -> Result<Self, CodecError> {
        let payload = &envelope.payload;
        match envelope.kind {
            MessageKind::Pong => Ok(Response::Pong),
            MessageKind::BasicIdentity => payload.decode().map(Response::BasicIdentity),
            MessageKind::FullSystemInfo => payload.decode().map(Response::FullSystemInfo),
            MessageKind::RunCommandResult => payload.decode().map(Response::RunCommandResult),
            MessageKind::DownloadFileResult => payload.decode().map(Response::DownloadFileResult),
            MessageKind::DownloadAndExecuteResult => {
                payload.decode().map(Response::DownloadAndExecuteResult)
            }
            other => Err(CodecError::WrongClass(other, KindClass::Response)),
        }
    }
}

/// Payload-less error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MessageTooSmall,
    MessageNotHandled,
    PayloadDecodeError,
    FrameTooLarge,
}

impl ErrorCode {
    pub fn kind(self) -> MessageKind {
        match self {
            ErrorCode::MessageTooSmall => MessageKind::MessageTooSmall,
            ErrorCode::MessageNotHandled => MessageKind::MessageNotHandled,
            ErrorCode::PayloadDecodeError => MessageKind::PayloadDecodeError,
            ErrorCode::FrameTooLarge => MessageKind::FrameTooLarge,
        }
    }

    pub fn from_kind(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::MessageTooSmall => Some(ErrorCode::MessageTooSmall),
            MessageKind::MessageNotHandled => Some(ErrorCode::MessageNotHandled),
            MessageKind::PayloadDecodeError => Some(ErrorCode::PayloadDecodeError),
            MessageKind::FrameTooLarge => Some(ErrorCode::FrameTooLarge),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind().name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorCode),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(request) => request.kind(),
            Message::Response(response) => response.kind(),
            Message::Error(code) => code.kind(),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<ErrorCode> for Message {
    fn from(code: ErrorCode) -> Self {
        Message::Error(code)
    }
}

/// A message whose kind is known but whose payload has not been decoded yet.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub kind: MessageKind,
    pub payload: PayloadDecoder<'a>,
}

/// Structural decoder bound to the bytes following the kind tag.
#[derive(Debug, Clone, Copy)]
pub struct PayloadDecoder<'a> {
    kind: MessageKind,
    bytes: &'a [u8],
}

impl<'a> PayloadDecoder<'a> {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        if self.bytes.is_empty() {
            return Err(CodecError::MissingPayload(self.kind));
        }
        serde_json::from_slice(self.bytes).map_err(|err| CodecError::MalformedPayload {
            kind: self.kind,
            reason: err.to_string(),
        })
    }
}

/// Reads the kind tag without touching the payload.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope<'_>, CodecError> {
    let (&tag, rest) = bytes.split_first().ok_or(CodecError::TooSmall)?;
    let kind = MessageKind::from_tag(tag).ok_or(CodecError::UnknownKind(tag))?;
    Ok(Envelope {
        kind,
        payload: PayloadDecoder { kind, bytes: rest },
    })
}

pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let envelope = decode_envelope(bytes)?;
    match envelope.kind.class() {
        KindClass::Request => Request::from_envelope(&envelope).map(Message::Request),
        KindClass::Response => Response::from_envelope(&envelope).map(Message::Response),
        KindClass::Error => ErrorCode::from_kind(envelope.kind)
            .map(Message::Error)
            .ok_or(CodecError::UnknownKind(envelope.kind.tag())),
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    match message {
        Message::Request(request) => request.encode(),
        Message::Response(response) => response.encode(),
        Message::Error(code) => Ok(vec![code.kind().tag()]),
    }
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let kind = self.kind();
        let mut buf = vec![kind.tag()];
        match self {
            Request::Ping | Request::GetBasicIdentity | Request::GetFullSystemInfo => {}
            Request::RunCommand(payload) => write_payload(&mut buf, kind, payload)?,
            Request::DownloadFile(payload) => write_payload(&mut buf, kind, payload)?,
            Request::DownloadAndExecute(payload) => write_payload(&mut buf, kind, payload)?,
        }
        Ok(buf)
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let kind = self.kind();
        let mut buf = vec![kind.tag()];
        match self {
            Response::Pong => {}
            Response::BasicIdentity(payload) => write_payload(&mut buf, kind, payload)?,
            Response::FullSystemInfo(payload) => write_payload(&mut buf, kind, payload)?,
            Response::RunCommandResult(payload) => write_payload(&mut buf, kind, payload)?,
            Response::DownloadFileResult(payload) => write_payload(&mut buf, kind, payload)?,
            Response::DownloadAndExecuteResult(payload) => {
                write_payload(&mut buf, kind, payload)?
            }
        }
        Ok(buf)
    }
}

fn write_payload<T: Serialize>(
    buf: &mut Vec<u8>,
    kind: MessageKind,
    payload: &T,
) -> Result<(), CodecError> {
    serde_json::to_writer(buf, payload).map_err(|err| CodecError::Encode {
        kind,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn identity() -> BasicIdentity {
        BasicIdentity {
            fingerprint: "m1".into(),
            hostname: "build-07".into(),
            os: "linux".into(),
            username: "ops".into(),
            administrator: false,
            language: "en_US.UTF-8".into(),
            started_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("timestamp"),
        }
    }

    fn sample_messages() -> Vec<Message> {
        vec![
            Request::Ping.into(),
            Request::GetBasicIdentity.into(),
            Request::GetFullSystemInfo.into(),
            Request::RunCommand(RunCommandRequest {
                command: "echo hi".into(),
                background: false,
            })
            .into(),
            Request::DownloadFile(DownloadFileRequest {
                url: "http://10.0.0.1/tool".into(),
                location: "/tmp/tool".into(),
            })
            .into(),
            Request::DownloadAndExecute(DownloadAndExecuteRequest {
                url: "http://10.0.0.1/setup".into(),
                args: vec!["--quiet".into()],
            })
            .into(),
            Response::Pong.into(),
            Response::BasicIdentity(identity()).into(),
            Response::FullSystemInfo(SystemInfo {
                identity: identity(),
                os_version: "Debian 12".into(),
                architecture: "x86_64".into(),
                cpu: "AMD EPYC".into(),
                logical_cores: 8,
                memory_mib: 16_000,
                agent_version: "0.1.0".into(),
            })
            .into(),
            Response::RunCommandResult(RunCommandResult {
                success: true,
                output: "hi\n".into(),
            })
            .into(),
            Response::DownloadFileResult(DownloadFileResult::failed("bad status: 404")).into(),
            Response::DownloadAndExecuteResult(DownloadAndExecuteResult::launched(Some(42)))
                .into(),
            ErrorCode::MessageTooSmall.into(),
            ErrorCode::MessageNotHandled.into(),
            ErrorCode::PayloadDecodeError.into(),
            ErrorCode::FrameTooLarge.into(),
        ]
    }

    #[test]
    fn every_kind_round_trips() {
        let messages = sample_messages();
        assert_eq!(messages.len(), MessageKind::ALL.len());
        for message in messages {
            let bytes = encode(&message).expect("encode");
            assert_eq!(bytes[0], message.kind().tag());
            assert_eq!(decode(&bytes).expect("decode"), message);
        }
    }

    #[test]
    fn zero_payload_kinds_are_a_single_byte() {
        let bytes = encode(&Request::Ping.into()).expect("encode");
        assert_eq!(bytes, vec![MessageKind::Ping.tag()]);
    }

    #[test]
    fn empty_input_is_too_small() {
        let err = decode_envelope(&[]).unwrap_err();
        assert_eq!(err, CodecError::TooSmall);
        assert_eq!(err.wire_code(), ErrorCode::MessageTooSmall);
    }

    #[test]
    fn envelope_exposes_kind_before_payload_decode() {
        let mut bytes = vec![MessageKind::RunCommand.tag()];
        bytes.extend_from_slice(b"{not json");
        let envelope = decode_envelope(&bytes).expect("tag decodes");
        assert_eq!(envelope.kind, MessageKind::RunCommand);
        let err = Request::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload { .. }));
        assert_eq!(err.wire_code(), ErrorCode::PayloadDecodeError);
    }

    #[test]
    fn missing_payload_is_a_decode_error() {
        let err = decode(&[MessageKind::RunCommandResult.tag()]).unwrap_err();
        assert_eq!(err, CodecError::MissingPayload(MessageKind::RunCommandResult));
        assert_eq!(err.wire_code(), ErrorCode::PayloadDecodeError);
    }

    #[test]
    fn unknown_tag_is_not_handled() {
        let err = decode(&[0x3E]).unwrap_err();
        assert_eq!(err, CodecError::UnknownKind(0x3E));
        assert_eq!(err.wire_code(), ErrorCode::MessageNotHandled);
    }

    #[test]
    fn response_decode_rejects_request_kinds() {
        let bytes = encode(&Request::Ping.into()).expect("encode");
        let envelope = decode_envelope(&bytes).expect("envelope");
        assert_eq!(
            Response::from_envelope(&envelope).unwrap_err(),
            CodecError::WrongClass(MessageKind::Ping, KindClass::Response)
        );
    }
}
