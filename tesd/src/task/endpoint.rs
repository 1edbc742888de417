//! Client endpoints owned by a task's reactor.
//!
//! Two kinds, matching the two socket patterns of the protocol:
//!
//! - request/reply: strict lockstep. The endpoint reads one framed
//!   request, hands it to the reactor, and reads nothing further until the
//!   reactor supplies the reply. A task that only answers when its job is
//!   done therefore accepts no new work in between.
//! - publish: fan-out to every connected subscriber. Connecting is
//!   subscribing; the reactor is told whenever the subscriber count
//!   changes so it can activate on the first and deactivate on the last.
//!
//! Every message on the wire is a u32 little-endian length prefix
//! followed by the payload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Largest message a client may send.
const MAX_MSG: u32 = 1 << 20;
/// Messages a slow subscriber may fall behind before it starts losing
/// them.
const PUB_BACKLOG: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Rep,
    Pub,
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointSpec {
    pub kind: EndpointKind,
    pub port: u16,
}

impl EndpointSpec {
    pub fn rep(port: u16) -> Self {
        EndpointSpec { kind: EndpointKind::Rep, port }
    }

    pub fn publish(port: u16) -> Self {
        EndpointSpec { kind: EndpointKind::Pub, port }
    }
}

/// What an endpoint delivers to the task's reactor.
#[derive(Debug)]
pub enum TaskEvent {
    Request { endpoint: usize, payload: Bytes },
    Subscribers { endpoint: usize, count: usize },
}

pub async fn read_frame(rd: &mut OwnedReadHalf) -> std::io::Result<Option<Bytes>> {
    let mut lenbuf = [0u8; 4];
    match rd.read_exact(&mut lenbuf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(lenbuf);
    if len > MAX_MSG {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "oversized message"));
    }
    let mut payload = vec![0u8; len as usize];
    rd.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

pub async fn write_frame(wr: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    wr.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    wr.write_all(payload).await?;
    wr.flush().await
}

/// Serve a request/reply endpoint. One client at a time, one request in
/// flight at a time.
pub async fn rep_loop(
    listener: TcpListener,
    endpoint: usize,
    ev_tx: mpsc::Sender<TaskEvent>,
    mut reply_rx: mpsc::Receiver<Bytes>,
) {
    loop {
        let stream = match listener.accept().await {
            Ok((s, _)) => s,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();
        loop {
            let payload = match read_frame(&mut rd).await {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("client read failed: {e}");
                    break;
                }
            };
            // a reply owed to a client that has since disconnected must
            // not be paired with this request
            while reply_rx.try_recv().is_ok() {}
            if ev_tx.send(TaskEvent::Request { endpoint, payload }).await.is_err() {
                return; // reactor is gone
            }
            let Some(reply) = reply_rx.recv().await else {
                return;
            };
            if let Err(e) = write_frame(&mut wr, &reply).await {
                log::debug!("client write failed: {e}");
                break;
            }
        }
    }
}

/// Handle to a publish endpoint, held by the task through its context.
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<Bytes>,
    count: Arc<AtomicUsize>,
}

impl Publisher {
    pub fn publish(&self, payload: Bytes) {
        // no subscribers is not an error
        let _ = self.tx.send(payload);
    }

    pub fn subscriber_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// Serve a publish endpoint: track subscribers and fan published
/// messages out to them.
pub fn pub_endpoint(
    listener: TcpListener,
    endpoint: usize,
    ev_tx: mpsc::Sender<TaskEvent>,
) -> Publisher {
    let (tx, _) = broadcast::channel(PUB_BACKLOG);
    let count = Arc::new(AtomicUsize::new(0));
    let publisher = Publisher { tx: tx.clone(), count: Arc::clone(&count) };

    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((s, _)) => s,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            // subscribe before announcing, so nothing published on the
            // strength of this subscriber can be missed by it
            let rx = tx.subscribe();
            let n = count.fetch_add(1, Ordering::Relaxed) + 1;
            if ev_tx.send(TaskEvent::Subscribers { endpoint, count: n }).await.is_err() {
                return;
            }
            let ev_tx = ev_tx.clone();
            let count = Arc::clone(&count);
            tokio::spawn(async move {
                subscriber_loop(stream, rx).await;
                let n = count.fetch_sub(1, Ordering::Relaxed) - 1;
                let _ = ev_tx.send(TaskEvent::Subscribers { endpoint, count: n }).await;
            });
        }
    });

    publisher
}

async fn subscriber_loop(stream: TcpStream, mut rx: broadcast::Receiver<Bytes>) {
    let (_rd, mut wr) = stream.into_split();
    loop {
        let msg = match rx.recv().await {
            Ok(m) => m,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("subscriber lagged, {n} message(s) lost");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if write_frame(&mut wr, &msg).await.is_err() {
            return;
        }
    }
}
