//! Allocates command ids, matches responses to the request that
//! triggered them, and bounds the number of requests in flight.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{oneshot, Mutex, Semaphore};

use crate::codec::Decoded;
use crate::error::{OperationErrorKind, RiscoError, RiscoResult};
use crate::transport::Shared;

const MIN_CMD_ID: u16 = 1;
const MAX_CMD_ID: u16 = 49;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Slot = Option<oneshot::Sender<Result<String, OperationErrorKind>>>;

/// A frame the reader loop decoded that did not resolve a pending
/// request, handed back to the connection's dispatch loop to ACK and
/// forward to the event router.
pub(crate) enum Dispatch {
    /// Matched and completed a pending request; nothing further to do.
    Completed,
    /// Needs to be ACKed (if it carried an id) and routed as an event.
    Unsolicited(Decoded),
}

pub(crate) struct Multiplexer {
    shared: Arc<Shared>,
    next_id: SyncMutex<u16>,
    pending: Mutex<[Slot; MAX_CMD_ID as usize]>,
    semaphore: Semaphore,
}

impl Multiplexer {
    pub fn new(shared: Arc<Shared>, concurrency: usize) -> Self {
        Self {
            shared,
            next_id: SyncMutex::new(0),
            pending: Mutex::new(std::array::from_fn(|_| None)),
            semaphore: Semaphore::new(concurrency.max(1)),
        }
    }

    /// Send `command`, wait for its matching response (or time out).
    pub async fn send(&self, command: &str) -> RiscoResult<String> {
        self.send_with(command, false).await
    }

    /// Same as [`Multiplexer::send`] but forces encryption even if the
    /// session hasn't been marked encrypted yet (used by the handshake
    /// to probe before `LCL` completes, if ever needed).
    pub async fn send_forced_encrypt(&self, command: &str) -> RiscoResult<String> {
        self.send_with(command, true).await
    }

    pub async fn send_ack(&self, command: &str) -> RiscoResult<bool> {
        Ok(self.send(command).await? == "ACK")
    }

    pub async fn send_result(&self, command: &str) -> RiscoResult<String> {
        let response = self.send(command).await?;
        response
            .split_once('=')
            .map(|(_, value)| value.to_string())
            .ok_or_else(|| RiscoError::Operation(OperationErrorKind::Refused(response.clone())))
    }

    async fn send_with(&self, command: &str, force_encrypt: bool) -> RiscoResult<String> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| RiscoError::Operation(OperationErrorKind::ConnectionLost))?;

        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending[slot_index(id)] = Some(tx);
        }

        if let Err(io_err) = self.shared.write_command(id, command, force_encrypt).await {
            self.clear_slot(id).await;
            self.rollback_id();
            return Err(RiscoError::Io(io_err));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result.map_err(RiscoError::Operation),
            Ok(Err(_dropped)) => Err(RiscoError::Operation(OperationErrorKind::ConnectionLost)),
            Err(_elapsed) => {
                self.clear_slot(id).await;
                Err(RiscoError::Operation(OperationErrorKind::Timeout))
            }
        }
        // `_permit` is dropped here regardless of which arm returned,
        // releasing the semaphore whether we succeeded, failed, or the
        // future above was itself dropped partway through.
    }

    /// Called by the reader loop for every decoded frame. Completes a
    /// matching pending request, or hands the frame back for ACK +
    /// event routing.
    pub async fn dispatch(&self, decoded: Decoded) -> Dispatch {
        if let Some(id) = decoded.id {
            if (MIN_CMD_ID..=MAX_CMD_ID).contains(&id) {
                let sender = {
                    let mut pending = self.pending.lock().await;
                    pending[slot_index(id)].take()
                };
                if let Some(tx) = sender {
                    let result = if !decoded.crc_ok {
                        Err(OperationErrorKind::CrcMismatch)
                    } else if decoded.payload.starts_with('N') || decoded.payload.starts_with('B')
                    {
                        Err(OperationErrorKind::Refused(decoded.payload.clone()))
                    } else {
                        Ok(decoded.payload.clone())
                    };
                    let _ = tx.send(result);
                    return Dispatch::Completed;
                }
            }
        }
        Dispatch::Unsolicited(decoded)
    }

    /// Fail every outstanding request with `error` (connection lost).
    pub async fn fail_all(&self, error: &OperationErrorKind) {
        let mut pending = self.pending.lock().await;
        for slot in pending.iter_mut() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    async fn clear_slot(&self, id: u16) {
        let mut pending = self.pending.lock().await;
        pending[slot_index(id)] = None;
    }

    fn allocate_id(&self) -> u16 {
        let mut next = self.next_id.lock();
        *next += 1;
        if *next > MAX_CMD_ID {
            *next = MIN_CMD_ID;
        }
        *next
    }

    /// Undo the last [`Multiplexer::allocate_id`]: the write for that
    /// id never made it onto the wire, so the slot is free again. This
    /// mirrors the reference client's id-counter decrement on a failed
    /// send, which keeps long-running sessions from losing ids.
    fn rollback_id(&self) {
        let mut next = self.next_id.lock();
        *next = if *next <= MIN_CMD_ID {
            MAX_CMD_ID
        } else {
            *next - 1
        };
    }
}

fn slot_index(id: u16) -> usize {
    (id - MIN_CMD_ID) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Encoding;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn loopback_shared() -> (Arc<Shared>, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (server, (client, _)) = tokio::join!(connect, listener.accept());
        let client = client.unwrap();
        let server = server.unwrap();
        let (_read, write) = client.into_split();
        (Shared::new(write, Encoding::Utf8), server)
    }

    #[tokio::test]
    async fn id_allocation_wraps_and_stays_bounded() {
        let (shared, _server) = loopback_shared().await;
        let mux = Multiplexer::new(shared, 1);
        let seen = AtomicUsize::new(0);
        for _ in 0..60 {
            let id = mux.allocate_id();
            assert!((MIN_CMD_ID..=MAX_CMD_ID).contains(&id));
            seen.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(seen.load(Ordering::Relaxed), 60);
    }

    #[tokio::test]
    async fn rollback_reuses_the_wasted_id() {
        let (shared, _server) = loopback_shared().await;
        let mux = Multiplexer::new(shared, 4);
        let first = mux.allocate_id();
        mux.rollback_id();
        let second = mux.allocate_id();
        assert_eq!(first, second);
    }
}
