//! Request routing for the agent.
//!
//! A [`Dispatcher`] maps each request kind to a handler. Handlers come in two
//! shapes: bare handlers for kinds without a payload, and payload handlers
//! that receive the typed request decoded from the frame. Dispatch always
//! produces a message to send back, either the handler's response or one of
//! the wire error kinds.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use beacon_wire::{
    decode_envelope, CodecError, DownloadAndExecuteRequest, DownloadFileRequest, ErrorCode,
    KindClass, Message, MessageKind, PayloadDecoder, Response, RunCommandRequest,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::capability::Capability;
use crate::identity::IdentitySource;

type BareHandler = Arc<dyn Fn() -> BoxFuture<'static, Response> + Send + Sync>;
type PayloadHandler = Arc<
    dyn Fn(&PayloadDecoder<'_>) -> Result<BoxFuture<'static, Response>, CodecError> + Send + Sync,
>;

#[derive(Clone)]
enum Handler {
    Bare(BareHandler),
    Payload(PayloadHandler),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0} is not a request kind")]
    NotARequest(MessageKind),
}

#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageKind, Handler>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(|kind| kind.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("Dispatcher").field("kinds", &kinds).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard table: every request kind the protocol defines.
    pub fn standard(identity: Arc<dyn IdentitySource>, capability: Arc<dyn Capability>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.insert_bare(MessageKind::Ping, || async { Response::Pong });

        let source = Arc::clone(&identity);
        dispatcher.insert_bare(MessageKind::GetBasicIdentity, move || {
            let identity = source.basic();
            async move { Response::BasicIdentity(identity) }
        });

        dispatcher.insert_bare(MessageKind::GetFullSystemInfo, move || {
            let info = identity.full();
            async move { Response::FullSystemInfo(info) }
        });

        let cap = Arc::clone(&capability);
        dispatcher.insert_payload(MessageKind::RunCommand, move |request: RunCommandRequest| {
            let cap = Arc::clone(&cap);
            async move { Response::RunCommandResult(cap.run_command(request).await) }
        });

        let cap = Arc::clone(&capability);
        dispatcher.insert_payload(MessageKind::DownloadFile, move |request: DownloadFileRequest| {
            let cap = Arc::clone(&cap);
            async move { Response::DownloadFileResult(cap.download_file(request).await) }
        });

        dispatcher.insert_payload(
            MessageKind::DownloadAndExecute,
            move |request: DownloadAndExecuteRequest| {
                let cap = Arc::clone(&capability);
                async move {
                    Response::DownloadAndExecuteResult(cap.download_and_execute(request).await)
                }
            },
        );
        dispatcher
    }

    /// Registers a handler for a kind that carries no payload.
    pub fn register_bare<F, Fut>(
        &mut self,
        kind: MessageKind,
        handler: F,
    ) -> Result<(), DispatchError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        ensure_request(kind)?;
        self.insert_bare(kind, handler);
        Ok(())
    }

    /// Registers a handler that receives the request payload decoded as `T`.
    pub fn register<T, F, Fut>(&mut self, kind: MessageKind, handler: F) -> Result<(), DispatchError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        ensure_request(kind)?;
        self.insert_payload(kind, handler);
        Ok(())
    }

    fn insert_bare<F, Fut>(&mut self, kind: MessageKind, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: BareHandler = Arc::new(move || handler().boxed());
        self.handlers.insert(kind, Handler::Bare(handler));
    }

    fn insert_payload<T, F, Fut>(&mut self, kind: MessageKind, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: PayloadHandler = Arc::new(move |payload: &PayloadDecoder<'_>| {
            let request = payload.decode::<T>()?;
            Ok(handler(request).boxed())
        });
        self.handlers.insert(kind, Handler::Payload(handler));
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Decodes one inbound frame and runs its handler.
    pub async fn dispatch(&self, frame: &[u8]) -> Message {
        let envelope = match decode_envelope(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "undecodable frame");
                return err.wire_code().into();
            }
        };
        let kind = envelope.kind;
        if kind.class() != KindClass::Request {
            debug!(kind = %kind, "ignoring non-request frame");
            return ErrorCode::MessageNotHandled.into();
        }
        let future = match self.handlers.get(&kind) {
            None => {
                debug!(kind = %kind, "no handler registered");
                return ErrorCode::MessageNotHandled.into();
            }
            // Trailing bytes on bare kinds are tolerated.
            Some(Handler::Bare(handler)) => handler(),
            Some(Handler::Payload(handler)) => match handler(&envelope.payload) {
                Ok(future) => future,
                Err(err) => {
                    debug!(kind = %kind, error = %err, "bad request payload");
                    return err.wire_code().into();
                }
            },
        };

        let response = future.await;
        if kind.expected_response() != Some(response.kind()) {
            warn!(
                request = %kind,
                response = %response.kind(),
                "handler produced the wrong response kind"
            );
            return ErrorCode::MessageNotHandled.into();
        }
        response.into()
    }
}

fn ensure_request(kind: MessageKind) -> Result<(), DispatchError> {
    if kind.class() == KindClass::Request {
        Ok(())
    } else {
        Err(DispatchError::NotARequest(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_wire::{
        encode, BasicIdentity, DownloadAndExecuteResult, DownloadFileResult, Request,
        RunCommandResult, SystemInfo,
    };
    use time::OffsetDateTime;

    struct FixedIdentity;

    impl IdentitySource for FixedIdentity {
        fn basic(&self) -> BasicIdentity {
            BasicIdentity {
                fingerprint: "m1".into(),
                hostname: "host".into(),
                os: "linux".into(),
                username: "ops".into(),
                administrator: false,
                language: "C".into(),
                started_at: OffsetDateTime::UNIX_EPOCH,
            }
        }

        fn full(&self) -> SystemInfo {
            SystemInfo {
                identity: self.basic(),
                os_version: "test".into(),
                architecture: "x86_64".into(),
                cpu: "cpu".into(),
                logical_cores: 1,
                memory_mib: 512,
                agent_version: "0.0.0".into(),
            }
        }
    }

    struct EchoCapability;

    #[async_trait]
    impl Capability for EchoCapability {
        async fn run_command(&self, request: RunCommandRequest) -> RunCommandResult {
            RunCommandResult {
                success: true,
                output: format!("ran {}", request.command),
            }
        }

        async fn download_file(&self, _request: DownloadFileRequest) -> DownloadFileResult {
            DownloadFileResult::failed("offline")
        }

        async fn download_and_execute(
            &self,
            _request: DownloadAndExecuteRequest,
        ) -> DownloadAndExecuteResult {
            DownloadAndExecuteResult::launched(Some(7))
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::standard(Arc::new(FixedIdentity), Arc::new(EchoCapability))
    }

    async fn roundtrip(dispatcher: &Dispatcher, request: Request) -> Message {
        let frame = encode(&request.into()).expect("encode");
        dispatcher.dispatch(&frame).await
    }

    #[tokio::test]
    async fn standard_table_covers_every_request() {
        let dispatcher = dispatcher();
        for kind in MessageKind::ALL {
            assert_eq!(dispatcher.handles(kind), kind.class() == KindClass::Request, "{kind}");
        }
    }

    #[tokio::test]
    async fn bare_and_payload_requests_are_answered() {
        let dispatcher = dispatcher();
        assert_eq!(roundtrip(&dispatcher, Request::Ping).await, Response::Pong.into());

        let reply = roundtrip(
            &dispatcher,
            Request::RunCommand(RunCommandRequest {
                command: "uptime".into(),
                background: false,
            }),
        )
        .await;
        assert_eq!(
            reply,
            Response::RunCommandResult(RunCommandResult {
                success: true,
                output: "ran uptime".into(),
            })
            .into()
        );

        match roundtrip(&dispatcher, Request::GetBasicIdentity).await {
            Message::Response(Response::BasicIdentity(identity)) => {
                assert_eq!(identity.fingerprint, "m1")
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn capability_failures_travel_in_band() {
        let reply = roundtrip(
            &dispatcher(),
            Request::DownloadFile(DownloadFileRequest {
                url: "http://example.invalid/x".into(),
                location: "/tmp/x".into(),
            }),
        )
        .await;
        assert_eq!(
            reply,
            Response::DownloadFileResult(DownloadFileResult::failed("offline")).into()
        );
    }

    #[tokio::test]
    async fn malformed_frames_map_to_error_kinds() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.dispatch(&[]).await, ErrorCode::MessageTooSmall.into());
        assert_eq!(
            dispatcher.dispatch(&[0x3E]).await,
            ErrorCode::MessageNotHandled.into()
        );
        assert_eq!(
            dispatcher.dispatch(&[MessageKind::Pong.tag()]).await,
            ErrorCode::MessageNotHandled.into()
        );
        assert_eq!(
            dispatcher.dispatch(&[MessageKind::RunCommand.tag()]).await,
            ErrorCode::PayloadDecodeError.into()
        );
        let mut garbage = vec![MessageKind::RunCommand.tag()];
        garbage.extend_from_slice(b"{\"command\":");
        assert_eq!(
            dispatcher.dispatch(&garbage).await,
            ErrorCode::PayloadDecodeError.into()
        );
    }

    #[tokio::test]
    async fn trailing_bytes_on_bare_kinds_are_ignored() {
        let frame = [MessageKind::Ping.tag(), b'{', b'}'];
        assert_eq!(dispatcher().dispatch(&frame).await, Response::Pong.into());
    }

    #[tokio::test]
    async fn unregistered_kinds_are_not_handled() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_bare(MessageKind::Ping, || async { Response::Pong })
            .expect("register");
        assert_eq!(
            roundtrip(&dispatcher, Request::GetFullSystemInfo).await,
            ErrorCode::MessageNotHandled.into()
        );
        assert_eq!(
            dispatcher.register_bare(MessageKind::Pong, || async { Response::Pong }),
            Err(DispatchError::NotARequest(MessageKind::Pong))
        );
    }

    #[tokio::test]
    async fn mismatched_handler_response_is_rejected() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_bare(MessageKind::GetFullSystemInfo, || async { Response::Pong })
            .expect("register");
        assert_eq!(
            roundtrip(&dispatcher, Request::GetFullSystemInfo).await,
            ErrorCode::MessageNotHandled.into()
        );
    }
}
