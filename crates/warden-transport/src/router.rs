use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use warden_common::CyclicCounter;

use crate::connection::{split_read_write, ConnState, OutboundConnection};
use crate::events::{LogLevel, RouterEvent};

/// Outbound-client + inbound-server sockets, connection reuse, and
/// request/response event demultiplexing (the only thing peers ever talk
/// directly to each other over).
pub struct Router {
    outbound: Mutex<HashMap<String, Arc<OutboundConnection>>>,
    inbound: Mutex<HashMap<u64, mpsc::UnboundedSender<Bytes>>>,
    requester_ids: Mutex<CyclicCounter>,
    events_tx: mpsc::UnboundedSender<RouterEvent>,
    soc_timeout: Duration,
    server_soc_timeout: Duration,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    pub fn new(
        soc_timeout: Duration,
        server_soc_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RouterEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            requester_ids: Mutex::new(CyclicCounter::new()),
            events_tx,
            soc_timeout,
            server_soc_timeout,
            listener_task: Mutex::new(None),
        });
        (router, events_rx)
    }

    /// Opens a server socket bound to `host` on an OS-assigned port and
    /// returns the effective bound port. The caller is responsible for
    /// treating a bound host that differs from the requested one as a
    /// failure — the router itself only reports what the OS gave back.
    pub async fn listen(self: &Arc<Self>, host: &str) -> std::io::Result<u16> {
        let listener = TcpListener::bind((host, 0)).await?;
        let local_addr = listener.local_addr()?;
        let router = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            router.serve_inbound(stream, peer_addr.to_string()).await;
                        });
                    }
                    Err(err) => {
                        let _ = router.events_tx.send(RouterEvent::Log {
                            level: LogLevel::Error,
                            message: format!("accept failed: {err}"),
                        });
                        break;
                    }
                }
            }
        });
        *self.listener_task.lock().await = Some(task);
        Ok(local_addr.port())
    }

    async fn serve_inbound(self: Arc<Self>, stream: tokio::net::TcpStream, remote_addr: String) {
        let requester_id = {
            let mut counter = self.requester_ids.lock().await;
            counter.next()
        };
        let (mut read_half, mut write_half) = split_read_write(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        self.inbound.lock().await.insert(requester_id, tx);

        let write_events = self.events_tx.clone();
        let writer = tokio::spawn(async move {
            use futures::SinkExt;
            while let Some(payload) = rx.recv().await {
                if let Err(err) = write_half.send(payload).await {
                    let _ = write_events.send(RouterEvent::Log {
                        level: LogLevel::Warn,
                        message: format!("write to inbound connection failed: {err}"),
                    });
                    break;
                }
            }
        });

        loop {
            let next = tokio::time::timeout(self.server_soc_timeout, read_half.next()).await;
            match next {
                Ok(Some(Ok(bytes))) => {
                    let _ = self.events_tx.send(RouterEvent::Request {
                        payload: bytes.freeze(),
                        requester_id,
                    });
                }
                Ok(Some(Err(err))) => {
                    let _ = self.events_tx.send(RouterEvent::Log {
                        level: LogLevel::Error,
                        message: format!("frame decode error from {remote_addr}: {err}"),
                    });
                    break;
                }
                Ok(None) => break,
                Err(_elapsed) => break,
            }
        }

        self.inbound.lock().await.remove(&requester_id);
        writer.abort();
        let _ = self.events_tx.send(RouterEvent::Disconnect { remote_addr });
    }

    /// Sends to a peer identified by `host:port`. Reuses an existing
    /// connection unless it's `closing`/`closed`, in which case it's
    /// discarded and a fresh one opened. Resolves once the payload is
    /// written to the socket, not once a response arrives.
    pub async fn request(self: &Arc<Self>, address: &str, payload: Bytes) -> Result<(), String> {
        let conn = self.connection_for(address).await;
        conn.send(payload).await
    }

    async fn connection_for(self: &Arc<Self>, address: &str) -> Arc<OutboundConnection> {
        let mut outbound = self.outbound.lock().await;
        if let Some(existing) = outbound.get(address) {
            if existing.is_usable() {
                return existing.clone();
            }
        }
        let conn = Arc::new(OutboundConnection::connect(
            address.to_string(),
            self.soc_timeout,
            self.events_tx.clone(),
        ));
        outbound.insert(address.to_string(), conn.clone());
        conn
    }

    /// Looks up the inbound connection that carried a prior request and
    /// writes the response on it; drops silently (with a log) if it's
    /// gone.
    pub async fn respond(&self, requester_id: u64, payload: Bytes) {
        let inbound = self.inbound.lock().await;
        match inbound.get(&requester_id) {
            Some(sender) => {
                if sender.send(payload).is_err() {
                    let _ = self.events_tx.send(RouterEvent::Log {
                        level: LogLevel::Warn,
                        message: format!("requester {requester_id} already disconnected"),
                    });
                }
            }
            None => {
                let _ = self.events_tx.send(RouterEvent::Log {
                    level: LogLevel::Warn,
                    message: format!("no inbound connection for requester {requester_id}"),
                });
            }
        }
    }

    /// Destroys all client and server connections and stops accepting.
    pub async fn close(&self) {
        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }
        self.outbound.lock().await.clear();
        self.inbound.lock().await.clear();
    }

    #[cfg(test)]
    pub async fn outbound_state(&self, address: &str) -> Option<ConnState> {
        self.outbound.lock().await.get(address).map(|c| c.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn listen_reports_the_bound_port() {
        let (router, _events) = Router::new(Duration::from_secs(5), Duration::from_secs(10));
        let port = router.listen("127.0.0.1").await.unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn request_delivers_bytes_to_an_accepted_connection() {
        let (router, mut events) = Router::new(Duration::from_secs(5), Duration::from_secs(10));
        let port = router.listen("127.0.0.1").await.unwrap();
        let addr = format!("127.0.0.1:{port}");

        router
            .request(&addr, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RouterEvent::Request { payload, .. } => assert_eq!(&payload[..], b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn respond_writes_back_on_the_same_socket() {
        let (router, mut events) = Router::new(Duration::from_secs(5), Duration::from_secs(10));
        let port = router.listen("127.0.0.1").await.unwrap();
        let addr = format!("127.0.0.1:{port}");

        // Connect a raw client so we can read the response bytes directly.
        let mut client = tokio::net::TcpStream::connect(&addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        client.write_all(&[0, 5]).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let requester_id = loop {
            match events.recv().await.unwrap() {
                RouterEvent::Request { requester_id, .. } => break requester_id,
                _ => continue,
            }
        };

        router.respond(requester_id, Bytes::from_static(b"ok")).await;

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0, 2, b'o', b'k']);
    }

    #[tokio::test]
    async fn a_dead_outbound_connection_is_replaced() {
        let (router, _events) = Router::new(Duration::from_secs(5), Duration::from_secs(10));
        // Nothing listens here; the connect attempt fails and the handle
        // should be recreated (and fail again) on the next request rather
        // than reusing the dead one.
        let addr = "127.0.0.1:1".to_string();
        let first = router.request(&addr, Bytes::from_static(b"x")).await;
        assert!(first.is_err());
        assert_eq!(router.outbound_state(&addr).await, Some(ConnState::Closed));
    }
}
