//! Per-TCP-connection receiver/dispatcher pair (spec §4.3).
//!
//! A [`Session`] owns an outbound queue and the wake signal that guards
//! it; the socket itself lives inside the two tasks spawned by
//! [`Session::spawn`] and is dropped (closing the connection) when both
//! exit. Framing on the wire is the Z85-encoded string produced by
//! `codec::frame::encode` — the receiver only decodes enough of it to
//! learn the frame's length and source identifier; the full decode (and
//! signature verification) happens one layer up, in whatever
//! [`crate::context::MessageSink`] the owning proxy has enabled.

use crate::identifier::Identifier;
use crate::proxy::OutboundMessage;
use crate::wake::{WakeResult, WakeSignal};
use codec::address::Address;
use codec::frame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Defends against a peer declaring an implausibly large frame before any
/// signature has been checked. Spec §4.1 only requires rejecting sizes
/// beyond 2^32-1 (already enforced by `frame_size`'s `u32` type); this is
/// a stricter, locally-chosen ceiling.
const MAX_FRAME_Z85_LEN: usize = 16 * 1024 * 1024;

/// Why a session stopped (spec §3). `collect_message` returning `false`
/// (the message sink rejecting the session as fatal, spec §6) is folded
/// into `UnexpectedError` here — the three-value enum in spec §3 has no
/// distinct "peer-induced" member, and a rejected message is, from the
/// session's point of view, the same kind of unrecoverable condition as
/// an I/O failure (an Open Question resolution, see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Requested,
    Closed,
    UnexpectedError,
}

pub type OnReceived = Arc<dyn Fn(&Arc<Session>, &[u8]) -> bool + Send + Sync>;
pub type OnStopped = Arc<dyn Fn(StopCause) + Send + Sync>;

/// A session's outbound queue, dispatcher wake signal and liveness flag.
/// The socket halves are owned by the two spawned tasks, not by this
/// struct, so stopping a session never needs to reach across a task
/// boundary to close anything — dropping the halves on task exit does it.
pub struct Session {
    id: u64,
    remote: Address,
    active: AtomicBool,
    stopped_once: AtomicBool,
    outbound: parking_lot::Mutex<VecDeque<OutboundMessage>>,
    queue_wake: WakeSignal,
    stop_notify: tokio::sync::Notify,
    on_stopped: OnStopped,
    sent: AtomicU64,
}

impl Session {
    /// Splits `stream` and spawns the receiver and dispatcher tasks
    /// described in spec §4.3. `id` is also used as the endpoint
    /// identifier the owning proxy registers this session under.
    /// `idle_timeout` bounds how long the receiver will wait for a new
    /// frame to start arriving before treating the connection as dead.
    pub fn spawn(id: u64, remote: Address, stream: TcpStream, idle_timeout: std::time::Duration, on_received: OnReceived, on_stopped: OnStopped) -> Arc<Session> {
        let (read_half, write_half) = stream.into_split();

        let session = Arc::new(Session {
            id,
            remote,
            active: AtomicBool::new(true),
            stopped_once: AtomicBool::new(false),
            outbound: parking_lot::Mutex::new(VecDeque::new()),
            queue_wake: WakeSignal::new(),
            stop_notify: tokio::sync::Notify::new(),
            on_stopped,
            sent: AtomicU64::new(0),
        });

        tokio::spawn(run_receiver(session.clone(), read_half, idle_timeout, on_received));
        tokio::spawn(run_dispatcher(session.clone(), write_half));

        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_address(&self) -> &Address {
        &self.remote
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Fire-and-forget enqueue (spec §4.2): dropped silently if the
    /// session is no longer active.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        if !self.is_active() {
            return false;
        }
        self.outbound.lock().push_back(message);
        self.queue_wake.notify();
        true
    }

    /// Idempotent: closes the socket (by letting both tasks exit and drop
    /// their halves), cancels the dispatcher's wait and invokes the
    /// stop callback exactly once.
    pub fn stop(&self, cause: StopCause) {
        if self.stopped_once.swap(true, Ordering::AcqRel) {
            return;
        }
        self.active.store(false, Ordering::Release);
        self.queue_wake.cancel();
        self.stop_notify.notify_waiters();
        (self.on_stopped)(cause);
    }
}

async fn run_receiver(session: Arc<Session>, mut read_half: OwnedReadHalf, idle_timeout: std::time::Duration, on_received: OnReceived) {
    let mut peek_buf = [0u8; frame::PEEK_Z85_LEN];

    loop {
        if !session.is_active() {
            return;
        }

        let read = tokio::select! {
            result = tokio::time::timeout(idle_timeout, read_half.read_exact(&mut peek_buf)) => result,
            _ = session.stop_notify.notified() => {
                return;
            }
        };

        let read = match read {
            Ok(read) => read,
            Err(_) => {
                session.stop(StopCause::Closed);
                return;
            }
        };

        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                session.stop(StopCause::Closed);
                return;
            }
            Err(_) => {
                session.stop(StopCause::UnexpectedError);
                return;
            }
        }

        let peek_str = match std::str::from_utf8(&peek_buf) {
            Ok(s) => s,
            Err(_) => {
                session.stop(StopCause::UnexpectedError);
                return;
            }
        };

        let peek = match frame::decode_peek(peek_str) {
            Ok(p) => p,
            Err(_) => {
                session.stop(StopCause::UnexpectedError);
                return;
            }
        };

        let total_len = frame::z85_len_for_frame_size(peek.frame_size);
        if total_len < frame::PEEK_Z85_LEN || total_len > MAX_FRAME_Z85_LEN {
            session.stop(StopCause::UnexpectedError);
            return;
        }

        let mut buffer = vec![0u8; total_len];
        buffer[..frame::PEEK_Z85_LEN].copy_from_slice(&peek_buf);

        let rest = &mut buffer[frame::PEEK_Z85_LEN..];
        let read = tokio::select! {
            result = read_half.read_exact(rest) => result,
            _ = session.stop_notify.notified() => {
                return;
            }
        };

        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                session.stop(StopCause::Closed);
                return;
            }
            Err(_) => {
                session.stop(StopCause::UnexpectedError);
                return;
            }
        }

        let full_str = match std::str::from_utf8(&buffer) {
            Ok(s) => s,
            Err(_) => {
                session.stop(StopCause::UnexpectedError);
                return;
            }
        };

        // Decoded here only to validate the frame parses and to confirm
        // the source identifier is well-formed (spec §4.3 step "verify
        // source-identifier can be peeked"); the buffer handed to
        // `on_received` stays Z85-encoded, since that's what a proxy's
        // `MessageSink` expects (it decodes again to reach the payload).
        let decoded = match frame::decode(full_str) {
            Ok(d) => d,
            Err(_) => {
                session.stop(StopCause::UnexpectedError);
                return;
            }
        };
        if Identifier::from_slice(&decoded.header.source_identifier).is_none() {
            session.stop(StopCause::UnexpectedError);
            return;
        }

        if !on_received(&session, &buffer) {
            session.stop(StopCause::UnexpectedError);
            return;
        }
    }
}

async fn run_dispatcher(session: Arc<Session>, mut write_half: OwnedWriteHalf) {
    loop {
        if !session.is_active() {
            return;
        }

        let front = session.outbound.lock().front().cloned();
        match front {
            None => {
                if session.queue_wake.wait().await == WakeResult::Aborted {
                    return;
                }
            }
            Some(message) => {
                if write_half.write_all(message.as_str().as_bytes()).await.is_err() {
                    session.stop(StopCause::UnexpectedError);
                    return;
                }
                session.outbound.lock().pop_front();
                session.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::address::Protocol;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    fn sample_frame_str() -> String {
        let header = frame::Header::new(0, 0, Identifier::from_bytes([1u8; 32]).internal().to_vec());
        let frame = frame::Frame {
            header,
            payload: b"hello".to_vec(),
            validator: Vec::new(),
        };
        frame::encode(&frame).unwrap()
    }

    #[tokio::test]
    async fn receiver_delivers_full_frame_and_dispatcher_writes_enqueued_message() {
        let (server_stream, client_stream) = loopback_pair().await;

        let received: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        let stop_count = Arc::new(AtomicUsize::new(0));
        let stop_clone = stop_count.clone();

        let address = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        let session = Session::spawn(
            1,
            address,
            server_stream,
            std::time::Duration::from_secs(5),
            Arc::new(move |_session, buf| {
                received_clone.lock().unwrap().push(buf.to_vec());
                true
            }),
            Arc::new(move |_cause| {
                stop_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let encoded = sample_frame_str();
        let mut client = client_stream;
        client.write_all(encoded.as_bytes()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(received.lock().unwrap()[0], encoded.as_bytes());

        assert!(session.enqueue(OutboundMessage::Owned(encoded.clone())));
        let mut readback = vec![0u8; encoded.len()];
        client.read_exact(&mut readback).await.unwrap();
        assert_eq!(readback, encoded.as_bytes());

        session.stop(StopCause::Requested);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(stop_count.load(Ordering::SeqCst), 1);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (server_stream, _client_stream) = loopback_pair().await;
        let stop_count = Arc::new(AtomicUsize::new(0));
        let stop_clone = stop_count.clone();
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        let session = Session::spawn(
            1,
            address,
            server_stream,
            std::time::Duration::from_secs(5),
            Arc::new(|_s, _b| true),
            Arc::new(move |_cause| {
                stop_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        session.stop(StopCause::Requested);
        session.stop(StopCause::Requested);
        assert_eq!(stop_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_dropped() {
        let (server_stream, _client_stream) = loopback_pair().await;
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        let session = Session::spawn(1, address, server_stream, std::time::Duration::from_secs(5), Arc::new(|_s, _b| true), Arc::new(|_cause| {}));
        session.stop(StopCause::Requested);
        assert!(!session.enqueue(OutboundMessage::Owned("x".into())));
    }
}
