use std::sync::Arc;
use std::time::Duration;

use beacon_wire::{
    encode, read_frame, write_frame, ErrorCode, FrameError, FrameTransform, Message,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::dispatch::Dispatcher;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("no request for {0:?}")]
    Idle(Duration),
    #[error("controller sent a {len} byte frame")]
    FrameTooLarge { len: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Dials the controller and serves it, reconnecting forever.
pub async fn run(config: AgentConfig, dispatcher: Arc<Dispatcher>) {
    loop {
        match connect(&config).await {
            Ok(mut stream) => {
                info!(controller = %config.controller_addr, "connected to controller");
                match serve_connection(
                    &mut stream,
                    &dispatcher,
                    config.transform.as_ref(),
                    config.idle_timeout,
                )
                .await
                {
                    Ok(served) => info!(served, "controller closed the connection"),
                    Err(err) => warn!(error = %err, "connection dropped"),
                }
            }
            Err(err) => debug!(error = %err, "controller unreachable"),
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn connect(config: &AgentConfig) -> Result<TcpStream, ConnectionError> {
    let addr = config.controller_addr.clone();
    let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(addr.clone()))?
        .map_err(|source| ConnectionError::Connect {
            addr: addr.clone(),
            source,
        })?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// Answers requests one at a time until the peer closes the stream.
///
/// Returns the number of requests served. Every inbound frame gets exactly one
/// reply; an oversize frame is answered with `FrameTooLarge` and ends the
/// connection, since its body is still sitting unread on the stream.
pub async fn serve_connection<S>(
    stream: &mut S,
    dispatcher: &Dispatcher,
    transform: &dyn FrameTransform,
    idle_timeout: Duration,
) -> Result<u64, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut served = 0u64;
    loop {
        let frame = match timeout(idle_timeout, read_frame(stream, transform)).await {
            Err(_) => return Err(ConnectionError::Idle(idle_timeout)),
            Ok(Err(FrameError::Closed)) => return Ok(served),
            Ok(Err(FrameError::TooLarge { len, .. })) => {
                let _ = reply(stream, ErrorCode::FrameTooLarge.into(), transform).await;
                return Err(ConnectionError::FrameTooLarge { len });
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(frame)) => frame,
        };

        let message = dispatcher.dispatch(&frame).await;
        debug!(kind = %message.kind(), "replying");
        reply(stream, message, transform).await?;
        served += 1;
    }
}

async fn reply<S>(
    stream: &mut S,
    message: Message,
    transform: &dyn FrameTransform,
) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let body = match encode(&message) {
        Ok(body) => body,
        Err(err) => {
            warn!(kind = %message.kind(), error = %err, "failed to encode reply");
            vec![ErrorCode::MessageNotHandled.kind().tag()]
        }
    };
    match write_frame(stream, body, transform).await {
        Err(FrameError::TooLarge { len, .. }) => {
            warn!(kind = %message.kind(), len, "reply exceeds frame limit");
            let body = vec![ErrorCode::FrameTooLarge.kind().tag()];
            write_frame(stream, body, transform).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_wire::{
        decode, MessageKind, Plaintext, Response, RunCommandRequest, RunCommandResult, Session,
        SessionConfig, SessionError, MAX_FRAME_LEN,
    };
    use tokio::io::AsyncWriteExt;

    fn dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_bare(MessageKind::Ping, || async { Response::Pong })
            .expect("ping");
        dispatcher
            .register(MessageKind::RunCommand, |request: RunCommandRequest| async move {
                Response::RunCommandResult(RunCommandResult {
                    success: true,
                    output: format!("{}\n", request.command.trim_start_matches("echo ")),
                })
            })
            .expect("run");
        dispatcher
    }

    #[tokio::test]
    async fn serves_session_requests_until_close() {
        let (controller, mut agent) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            serve_connection(&mut agent, &dispatcher(), &Plaintext, Duration::from_secs(5)).await
        });

        let session = Session::new(controller, "agent", SessionConfig::default());
        session.ping().await.expect("ping");
        let result = session.run_command("echo hi", false).await.expect("run");
        assert_eq!(result.output, "hi\n");
        let err = session.system_info().await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(ErrorCode::MessageNotHandled)));

        drop(session);
        let served = server.await.expect("join").expect("clean close");
        assert_eq!(served, 3);
    }

    #[tokio::test]
    async fn oversize_frame_is_answered_then_dropped() {
        let (mut controller, mut agent) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            serve_connection(&mut agent, &dispatcher(), &Plaintext, Duration::from_secs(5)).await
        });

        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        controller.write_all(&header).await.expect("header");
        let reply = read_frame(&mut controller, &Plaintext).await.expect("reply");
        assert_eq!(decode(&reply).expect("decode"), ErrorCode::FrameTooLarge.into());

        let err = server.await.expect("join").unwrap_err();
        assert!(matches!(err, ConnectionError::FrameTooLarge { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let (_controller, mut agent) = tokio::io::duplex(64);
        let err = serve_connection(&mut agent, &dispatcher(), &Plaintext, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Idle(_)));
    }
}
