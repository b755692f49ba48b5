//! Request/response sessions over a single duplex stream.
//!
//! A [`Session`] allows exactly one exchange at a time: the request is written
//! and its response read while the session lock is held. Any transport or
//! framing failure retires the session for good; callers open a new session
//! instead of retrying on a retired one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{decode_envelope, CodecError, ErrorCode, Request, Response};
use crate::frame::{read_frame, write_frame, FrameError};
use crate::kind::MessageKind;
use crate::payload::{
    BasicIdentity, DownloadAndExecuteRequest, DownloadAndExecuteResult, DownloadFileRequest,
    DownloadFileResult, RunCommandRequest, RunCommandResult, SystemInfo,
};
use crate::transform::{FrameTransform, Plaintext};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on one full round trip (write plus read).
    pub request_timeout: Duration,
    pub transform: Arc<dyn FrameTransform>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transform: Arc::new(Plaintext),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is retired")]
    Retired,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("undecodable response: {0}")]
    Codec(#[from] CodecError),
    #[error("expected {expected} but peer answered {actual}")]
    UnexpectedResponse {
        expected: MessageKind,
        actual: MessageKind,
    },
    #[error("peer rejected request: {0}")]
    Remote(ErrorCode),
}

impl SessionError {
    /// Errors that leave the stream in an unknown state.
    fn retires_session(&self) -> bool {
        !matches!(self, SessionError::Remote(_) | SessionError::Retired)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            SessionError::Retired => "retired",
            SessionError::Timeout(_) => "timeout",
            SessionError::Frame(FrameError::Closed) => "closed",
            SessionError::Frame(FrameError::TooLarge { .. }) => "frame_too_large",
            SessionError::Frame(FrameError::Io(_)) => "io",
            SessionError::Frame(FrameError::Transform(_)) => "transform",
            SessionError::Codec(_) => "codec",
            SessionError::UnexpectedResponse { .. } => "unexpected_response",
            SessionError::Remote(_) => "remote",
        }
    }
}

pub struct Session {
    id: Uuid,
    peer: String,
    io: Mutex<Option<Box<dyn SessionStream>>>,
    config: SessionConfig,
    alive: AtomicBool,
    retired_tx: watch::Sender<bool>,
    identity: parking_lot::RwLock<Option<BasicIdentity>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new<S: SessionStream>(stream: S, peer: impl Into<String>, config: SessionConfig) -> Self {
        let (retired_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            io: Mutex::new(Some(Box::new(stream))),
            config,
            alive: AtomicBool::new(true),
            retired_tx,
            identity: parking_lot::RwLock::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Identity reported by the peer, cached by [`Session::basic_identity`].
    pub fn identity(&self) -> Option<BasicIdentity> {
        self.identity.read().clone()
    }

    /// Closes the connection and wakes any in-flight [`Session::send`].
    ///
    /// Returns `false` if the session was already retired.
    pub fn retire(&self) -> bool {
        self.retire_with("requested")
    }

    fn retire_with(&self, reason: &'static str) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.retired_tx.send_replace(true);
        // A busy session drops its stream when the in-flight send observes
        // the retirement.
        if let Ok(mut guard) = self.io.try_lock() {
            guard.take();
        }
        debug!(
            session_id = %self.id,
            peer = %self.peer,
            reason,
            "session retired"
        );
        true
    }

    pub async fn send(&self, request: &Request) -> Result<Response, SessionError> {
        let body = request.encode()?;
        let mut retired = self.retired_tx.subscribe();
        let mut guard = self.io.lock().await;
        if !self.is_alive() {
            self.release_if_retired(&mut guard);
            return Err(SessionError::Retired);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(SessionError::Retired);
        };

        let deadline = self.config.request_timeout;
        let outcome = tokio::select! {
            biased;
            _ = async { retired.wait_for(|retired| *retired).await.is_ok() } => {
                Err(SessionError::Retired)
            }
            result = timeout(deadline, self.round_trip(stream, body, request)) => {
                result.unwrap_or(Err(SessionError::Timeout(deadline)))
            }
        };

        if let Err(err) = &outcome {
            if err.retires_session() {
                self.retire_with(err.reason());
            }
        }
        self.release_if_retired(&mut guard);
        outcome
    }

    /// Drops the stream of a retired session. Runs with the lock held at the
    /// end of every exchange: `retire` cannot take a stream that is in use.
    fn release_if_retired(&self, io: &mut Option<Box<dyn SessionStream>>) {
        if !self.is_alive() && io.take().is_some() {
            debug!(session_id = %self.id, "stream closed");
        }
    }

    async fn round_trip(
        &self,
        stream: &mut Box<dyn SessionStream>,
        body: Vec<u8>,
        request: &Request,
    ) -> Result<Response, SessionError> {
        let transform = self.config.transform.as_ref();
        write_frame(stream, body, transform).await?;
        let frame = read_frame(stream, transform).await?;

        let envelope = decode_envelope(&frame)?;
        if let Some(code) = ErrorCode::from_kind(envelope.kind) {
            return Err(SessionError::Remote(code));
        }
        let expected = request.expected_response();
        if envelope.kind != expected {
            return Err(SessionError::UnexpectedResponse {
                expected,
                actual: envelope.kind,
            });
        }
        Ok(Response::from_envelope(&envelope)?)
    }

    /// Liveness probe; returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration, SessionError> {
        let started = Instant::now();
        match self.send(&Request::Ping).await? {
            Response::Pong => Ok(started.elapsed()),
            other => Err(unexpected(MessageKind::Pong, &other)),
        }
    }

    pub async fn basic_identity(&self) -> Result<BasicIdentity, SessionError> {
        match self.send(&Request::GetBasicIdentity).await? {
            Response::BasicIdentity(identity) => {
                *self.identity.write() = Some(identity.clone());
                Ok(identity)
            }
            other => Err(unexpected(MessageKind::BasicIdentity, &other)),
        }
    }

    pub async fn system_info(&self) -> Result<SystemInfo, SessionError> {
        match self.send(&Request::GetFullSystemInfo).await? {
            Response::FullSystemInfo(info) => Ok(info),
            other => Err(unexpected(MessageKind::FullSystemInfo, &other)),
        }
    }

    pub async fn run_command(
        &self,
        command: impl Into<String>,
        background: bool,
    ) -> Result<RunCommandResult, SessionError> {
        let request = Request::RunCommand(RunCommandRequest {
            command: command.into(),
            background,
        });
        match self.send(&request).await? {
            Response::RunCommandResult(result) => Ok(result),
            other => Err(unexpected(MessageKind::RunCommandResult, &other)),
        }
    }

    pub async fn download_file(
        &self,
        url: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<DownloadFileResult, SessionError> {
        let request = Request::DownloadFile(DownloadFileRequest {
            url: url.into(),
            location: location.into(),
        });
        match self.send(&request).await? {
            Response::DownloadFileResult(result) => Ok(result),
            other => Err(unexpected(MessageKind::DownloadFileResult, &other)),
        }
    }

    pub async fn download_and_execute(
        &self,
        url: impl Into<String>,
        args: Vec<String>,
    ) -> Result<DownloadAndExecuteResult, SessionError> {
        let request = Request::DownloadAndExecute(DownloadAndExecuteRequest {
            url: url.into(),
            args,
        });
        match self.send(&request).await? {
            Response::DownloadAndExecuteResult(result) => Ok(result),
            other => Err(unexpected(MessageKind::DownloadAndExecuteResult, &other)),
        }
    }
}

// `send` already checks the response kind, so this only guards the match arms.
fn unexpected(expected: MessageKind, actual: &Response) -> SessionError {
    SessionError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
}
