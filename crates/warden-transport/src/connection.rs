use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::events::{LogLevel, RouterEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Opening,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

struct SharedState(AtomicU8);

impl SharedState {
    fn new(state: ConnState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnState) {
        self.0.store(state as u8, Ordering::Release)
    }
}

struct SendItem {
    payload: Bytes,
    done: oneshot::Sender<Result<(), String>>,
}

/// An outbound (client-initiated) connection to a peer broker. Requests
/// queued before the socket connects simply sit in the command channel's
/// buffer until the writer loop starts draining it, which gives FIFO
/// flush-on-open for free; the state is tracked separately so `Router`
/// can tell a live handle from a dead one without touching the channel.
pub struct OutboundConnection {
    state: Arc<SharedState>,
    sender: mpsc::UnboundedSender<SendItem>,
}

impl OutboundConnection {
    pub fn connect(
        addr: String,
        idle_timeout: Duration,
        events: mpsc::UnboundedSender<RouterEvent>,
    ) -> Self {
        let state = Arc::new(SharedState::new(ConnState::Opening));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(addr, idle_timeout, state.clone(), rx, events));
        Self { state, sender: tx }
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.state(), ConnState::Opening | ConnState::Open)
    }

    /// Enqueues a payload for send; resolves once written to the socket,
    /// not once a response is observed.
    pub async fn send(&self, payload: Bytes) -> Result<(), String> {
        let (done, done_rx) = oneshot::channel();
        self.sender
            .send(SendItem { payload, done })
            .map_err(|_| "connection actor is gone".to_string())?;
        done_rx
            .await
            .unwrap_or_else(|_| Err("connection closed before flushing".to_string()))
    }

    async fn run(
        addr: String,
        idle_timeout: Duration,
        state: Arc<SharedState>,
        mut rx: mpsc::UnboundedReceiver<SendItem>,
        events: mpsc::UnboundedSender<RouterEvent>,
    ) {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                state.set(ConnState::Closed);
                Self::reject_all(&mut rx, &err.to_string());
                let _ = events.send(RouterEvent::Log {
                    level: LogLevel::Warn,
                    message: format!("connect to {addr} failed: {err}"),
                });
                return;
            }
        };
        state.set(ConnState::Open);
        let mut framed = Framed::new(stream, FrameCodec);

        loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some(item) = item else {
                        // Sender side dropped: the Router discarded us.
                        break;
                    };
                    let result = timeout(idle_timeout, framed.send(item.payload))
                        .await
                        .map_err(|_| "write timed out".to_string())
                        .and_then(|r| r.map_err(|e| e.to_string()));
                    let failed = result.is_err();
                    let _ = item.done.send(result);
                    if failed {
                        state.set(ConnState::Closing);
                        break;
                    }
                }
                incoming = timeout(idle_timeout, framed.next()) => {
                    match incoming {
                        Ok(Some(Ok(bytes))) => {
                            let _ = events.send(RouterEvent::Response { payload: bytes.freeze() });
                        }
                        Ok(Some(Err(err))) => {
                            let _ = events.send(RouterEvent::Log {
                                level: LogLevel::Error,
                                message: format!("frame decode error from {addr}: {err}"),
                            });
                            break;
                        }
                        Ok(None) => break,
                        Err(_elapsed) => {
                            // Idle timeout: move to closing and tear down.
                            break;
                        }
                    }
                }
            }
        }

        state.set(ConnState::Closed);
        Self::reject_all(&mut rx, "connection closed");
        let _ = events.send(RouterEvent::Disconnect { remote_addr: addr });
    }

    fn reject_all(rx: &mut mpsc::UnboundedReceiver<SendItem>, reason: &str) {
        while let Ok(item) = rx.try_recv() {
            let _ = item.done.send(Err(reason.to_string()));
        }
    }
}

/// An inbound (server-accepted) connection, tagged with the monotonic
/// `requesterId` used to route a later `Respond` back onto the same
/// socket.
pub struct InboundConnection {
    pub requester_id: u64,
    sender: mpsc::UnboundedSender<Bytes>,
}

impl InboundConnection {
    pub fn new(requester_id: u64, sender: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { requester_id, sender }
    }

    pub fn send(&self, payload: Bytes) -> Result<(), String> {
        self.sender
            .send(payload)
            .map_err(|_| "inbound connection is gone".to_string())
    }
}

pub fn split_read_write(
    stream: TcpStream,
) -> (
    futures::stream::SplitStream<Framed<TcpStream, FrameCodec>>,
    futures::stream::SplitSink<Framed<TcpStream, FrameCodec>, Bytes>,
) {
    Framed::new(stream, FrameCodec).split()
}

pub type DecodedFrame = Result<BytesMut, crate::codec::FrameError>;
