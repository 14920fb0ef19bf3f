//! IP/UDP transport for the matter unicast port. Binds one socket, exposes
//! per-peer virtual connections and demultiplexes incoming datagrams onto
//! them by source address.

use anyhow::{Context, Result};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// fits the matter maximum UDP payload with headroom
const RECEIVE_BUFFER_SIZE: usize = 1583;
const CONNECTION_QUEUE: usize = 32;

pub struct Transport {
    socket: Arc<UdpSocket>,
    connections: std::sync::Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    stop: CancellationToken,
}

pub struct Connection {
    transport: Arc<Transport>,
    remote: SocketAddr,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Transport {
    pub async fn new(local: &str) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local).await?;
        let stop = CancellationToken::new();
        let o = Arc::new(Self {
            socket: Arc::new(socket),
            connections: std::sync::Mutex::new(HashMap::new()),
            stop: stop.clone(),
        });
        let self_weak = Arc::downgrade(&o);
        let socket = o.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
            loop {
                let (n, addr) = tokio::select! {
                    recv_resp = socket.recv_from(&mut buf) => {
                        match recv_resp {
                            Ok(v) => v,
                            Err(e) => {
                                log::debug!("transport recv error: {}", e);
                                continue;
                            }
                        }
                    }
                    _ = stop.cancelled() => break,
                };
                let Some(transport) = self_weak.upgrade() else {
                    break;
                };
                let sender = {
                    let cons = transport.connections.lock().unwrap();
                    cons.get(&addr).cloned()
                };
                if let Some(s) = sender {
                    let _ = s.send(buf[..n].to_vec()).await;
                } else {
                    log::trace!("dropping datagram from unknown peer {}", addr);
                }
            }
        });
        Ok(o)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Register a virtual connection for a remote peer. Messages from that
    /// peer are routed to the returned handle from now on.
    pub fn create_connection(self: &Arc<Self>, remote: SocketAddr) -> Arc<Connection> {
        let (sender, receiver) = mpsc::channel(CONNECTION_QUEUE);
        self.connections.lock().unwrap().insert(remote, sender);
        Arc::new(Connection {
            transport: self.clone(),
            remote,
            receiver: tokio::sync::Mutex::new(receiver),
        })
    }
}

impl Connection {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.transport.socket.send_to(data, self.remote).await?;
        Ok(())
    }
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut ch = self.receiver.lock().await;
        tokio::time::timeout(timeout, ch.recv())
            .await?
            .context("connection closed")
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.transport
            .connections
            .lock()
            .unwrap()
            .remove(&self.remote);
    }
}
