//! Connection lifecycle: handshake (panel id discovery, encryption
//! enable, authentication), keep-alive, and graceful teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{OperationErrorKind, RiscoError, RiscoResult};
use crate::multiplexer::{Dispatch, Multiplexer};
use crate::transport::{self, Shared};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const POST_DISCONNECT_QUIESCENCE: Duration = Duration::from_secs(5);

/// Something pulled off the background reader that the event router
/// needs to see: either an unsolicited push payload or a failure.
pub(crate) enum RouterMessage {
    Push(String),
    Error(RiscoError),
}

/// The handshake-and-keep-alive-managed socket. Wraps [`Multiplexer`]
/// with the tasks that keep it alive and the teardown sequence the
/// panel expects.
pub(crate) struct Connection {
    mux: Arc<Multiplexer>,
    reader_task: JoinHandle<()>,
    keep_alive_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Open the TCP connection and run the handshake described in
    /// §4.4: discover the panel id, enable encryption, authenticate.
    pub async fn connect(
        host: &str,
        port: u16,
        code: &str,
        config: &Config,
    ) -> RiscoResult<(Self, mpsc::UnboundedReceiver<RouterMessage>)> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| RiscoError::CannotConnect(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        tokio::time::sleep(config.communication_delay).await;

        let (mut read_half, write_half) = stream.into_split();
        let shared = Shared::new(write_half, config.encoding);
        let mux = Arc::new(Multiplexer::new(shared.clone(), config.concurrency));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        if let Err(e) = handshake(&mut read_half, &shared, &mux, code).await {
            drop(read_half);
            return Err(e);
        }

        let reader_task = tokio::spawn(reader_loop(
            read_half,
            shared.clone(),
            mux.clone(),
            events_tx.clone(),
        ));
        let keep_alive_task = tokio::spawn(keep_alive_loop(mux.clone(), events_tx));

        Ok((
            Self {
                mux,
                reader_task,
                keep_alive_task: AsyncMutex::new(Some(keep_alive_task)),
            },
            events_rx,
        ))
    }

    pub async fn send(&self, command: &str) -> RiscoResult<String> {
        self.mux.send(command).await
    }

    pub async fn send_ack(&self, command: &str) -> RiscoResult<bool> {
        self.mux.send_ack(command).await
    }

    pub async fn send_result(&self, command: &str) -> RiscoResult<String> {
        self.mux.send_result(command).await
    }

    /// Best-effort `DCN`, then cancel the background tasks and pause
    /// long enough for the panel to reset its encryption state before
    /// the next `connect`.
    pub async fn disconnect(&self) {
        let _ = self.mux.send_ack("DCN").await;
        if let Some(task) = self.keep_alive_task.lock().await.take() {
            task.abort();
        }
        self.reader_task.abort();
        self.mux
            .fail_all(&OperationErrorKind::ConnectionLost)
            .await;
        tokio::time::sleep(POST_DISCONNECT_QUIESCENCE).await;
    }
}

/// `RID` -> panel id (installs the keystream), `LCL` -> enables
/// encryption, `RMT=<code>` -> authenticates. Every step before the
/// listener is running, so the handshake reads frames directly.
async fn handshake(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    shared: &Arc<Shared>,
    mux: &Arc<Multiplexer>,
    code: &str,
) -> RiscoResult<()> {
    let (panel_id_hex, ()) =
        tokio::try_join!(mux.send_result("RID"), read_and_dispatch_once(read_half, shared, mux))
            .map_err(|e| classify_handshake_error(e, false))?;

    let panel_id = u32::from_str_radix(panel_id_hex.trim(), 16)
        .map_err(|_| RiscoError::CannotConnect(format!("malformed panel id {panel_id_hex:?}")))?;
    shared.set_panel_id(panel_id).await;

    let (lcl_ok, ()) =
        tokio::try_join!(mux.send_ack("LCL"), read_and_dispatch_once(read_half, shared, mux))
            .map_err(|e| classify_handshake_error(e, false))?;
    if !lcl_ok {
        return Err(RiscoError::CannotConnect("panel refused LCL".into()));
    }
    shared.set_encrypted(true).await;

    let auth_command = format!("RMT={code}");
    let (auth_ok, ()) = tokio::try_join!(
        mux.send_ack(&auth_command),
        read_and_dispatch_once(read_half, shared, mux)
    )
    .map_err(|e| classify_handshake_error(e, true))?;
    if !auth_ok {
        return Err(RiscoError::Unauthorized);
    }
    Ok(())
}

/// I/O failures are connection-level regardless of which step they hit;
/// a failure on the `RMT=` step specifically means the code was
/// rejected. Anything else propagates as whatever typed error it
/// already was, per the reimplementation note on the source's bare
/// exception handler around the whole handshake.
fn classify_handshake_error(error: RiscoError, is_auth_step: bool) -> RiscoError {
    match error {
        RiscoError::Io(io_err) => RiscoError::CannotConnect(io_err.to_string()),
        RiscoError::Operation(_) if is_auth_step => RiscoError::Unauthorized,
        other => other,
    }
}

/// Read exactly one frame and feed it through the dispatcher — used
/// only during the handshake, before the reader task exists, so each
/// request's own response can be picked up by the same code path the
/// reader will use once it's running.
async fn read_and_dispatch_once(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    shared: &Arc<Shared>,
    mux: &Arc<Multiplexer>,
) -> RiscoResult<()> {
    loop {
        let frame = transport::read_frame_timeout(read_half, Duration::from_secs(3))
            .await
            .map_err(RiscoError::Io)?
            .ok_or_else(|| {
                RiscoError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ))
            })?;
        let Some(decoded) = shared.decode(&frame).await else {
            continue;
        };
        if let Dispatch::Completed = mux.dispatch(decoded).await {
            return Ok(());
        }
        // An unsolicited frame arriving mid-handshake is vanishingly
        // unlikely but not impossible; keep reading for our own reply.
    }
}

async fn reader_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    shared: Arc<Shared>,
    mux: Arc<Multiplexer>,
    events_tx: mpsc::UnboundedSender<RouterMessage>,
) {
    loop {
        let frame = match transport::read_frame(&mut read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => {
                let _ = events_tx.send(RouterMessage::Error(RiscoError::Operation(
                    OperationErrorKind::ConnectionLost,
                )));
                mux.fail_all(&OperationErrorKind::ConnectionLost).await;
                return;
            }
        };

        let Some(decoded) = shared.decode(&frame).await else {
            tracing::warn!("dropped malformed frame");
            continue;
        };

        match mux.dispatch(decoded).await {
            Dispatch::Completed => {}
            Dispatch::Unsolicited(decoded) => {
                if let Some(id) = decoded.id {
                    if let Err(e) = shared.write_command(id, "ACK", false).await {
                        tracing::warn!(error = %e, "failed to ack unsolicited frame");
                    }
                }
                let message = if decoded.crc_ok {
                    RouterMessage::Push(decoded.payload)
                } else {
                    RouterMessage::Error(RiscoError::Operation(OperationErrorKind::CrcMismatch))
                };
                if events_tx.send(message).is_err() {
                    return;
                }
            }
        }
    }
}

async fn keep_alive_loop(mux: Arc<Multiplexer>, events_tx: mpsc::UnboundedSender<RouterMessage>) {
    loop {
        if let Err(e) = mux.send_result("CLOCK").await {
            if events_tx.send(RouterMessage::Error(e)).is_err() {
                return;
            }
        }
        tokio::time::sleep(KEEP_ALIVE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_one_frame(socket: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            socket.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
            if byte[0] == 0x03 {
                return buf;
            }
        }
    }

    async fn write_frame(socket: &mut TcpStream, command: &str) {
        let body = format!("{command}\x17");
        let crc = crate::crc::hex4(body.as_bytes());
        let mut frame = vec![0x02u8];
        frame.extend_from_slice(body.as_bytes());
        frame.extend_from_slice(crc.as_bytes());
        frame.push(0x03);
        socket.write_all(&frame).await.unwrap();
    }

    fn fast_config() -> Config {
        Config {
            communication_delay: Duration::from_millis(0),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn handshake_happy_path_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let fake_panel = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_one_frame(&mut socket).await;
            write_frame(&mut socket, "01RID=1234").await;
            read_one_frame(&mut socket).await;
            write_frame(&mut socket, "02ACK").await;
            read_one_frame(&mut socket).await;
            write_frame(&mut socket, "03ACK").await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let (_connection, _events_rx) =
            Connection::connect("127.0.0.1", addr.port(), "1234", &fast_config())
                .await
                .expect("handshake should succeed");

        fake_panel.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_auth_code_fails_unauthorized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let fake_panel = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_one_frame(&mut socket).await;
            write_frame(&mut socket, "01RID=1234").await;
            read_one_frame(&mut socket).await;
            write_frame(&mut socket, "02ACK").await;
            read_one_frame(&mut socket).await;
            write_frame(&mut socket, "03N01").await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let result = Connection::connect("127.0.0.1", addr.port(), "0000", &fast_config()).await;
        assert!(matches!(result, Err(RiscoError::Unauthorized)));

        fake_panel.await.unwrap();
    }
}
