#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use tesd::coordinator;
use tesd::ifring::mem::MemBackend;
use tesd::ifring::Rings;
use tesd::task::{TaskLogic, TaskSet};
use tespkt::McaSizeMode;

pub fn rings(nrings: usize) -> Arc<Rings<MemBackend>> {
    rings_with(nrings, 64)
}

pub fn rings_with(nrings: usize, slots: u32) -> Arc<Rings<MemBackend>> {
    Arc::new(Rings::new(MemBackend::new(nrings, slots, 2048)))
}

/// Start the tasks and the coordinator over an in-memory ring set.
/// Returns the coordinator handle and a shutdown trigger.
pub async fn start_server(
    rings: &Arc<Rings<MemBackend>>,
    logics: Vec<Box<dyn TaskLogic>>,
) -> (JoinHandle<anyhow::Result<()>>, oneshot::Sender<()>) {
    let (tasks, monitor) = TaskSet::start(rings, logics, McaSizeMode::FromLastBin)
        .await
        .expect("tasks failed to start");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let rings = Arc::clone(rings);
    let handle = tokio::spawn(coordinator::run(
        rings,
        tasks,
        monitor,
        std::time::Duration::ZERO,
        async move {
            let _ = stop_rx.await;
        },
    ));
    (handle, stop_tx)
}

pub async fn connect(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(s) = TcpStream::connect(("127.0.0.1", port)).await {
            return s;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("cannot connect to port {port}");
}

pub async fn send_msg(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
}

pub async fn recv_msg(stream: &mut TcpStream) -> Bytes {
    let fut = async {
        let mut lenbuf = [0u8; 4];
        stream.read_exact(&mut lenbuf).await.unwrap();
        let len = u32::from_le_bytes(lenbuf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        Bytes::from(payload)
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), fut)
        .await
        .expect("timed out waiting for a message")
}

/// Give the task threads a moment to react (activation, endpoint setup).
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
}
