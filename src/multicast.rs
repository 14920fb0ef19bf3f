//! UDP multicast transport for mDNS: joins the well-known groups on the
//! selected interfaces, demultiplexes inbound datagrams with the interface
//! they arrived on, and sends multicast or unicast replies.
//!
//! The receive side feeds a fixed-size queue with drop-oldest overflow; the
//! number of dropped datagrams is observable via [UdpMulticastServer::dropped_packets].

use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::MatterError;

pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Interface label used for the shared IPv4 socket.
pub const IPV4_INTERFACE: &str = "ipv4";

const RECEIVE_QUEUE_LIMIT: usize = 128;

#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub data: Vec<u8>,
    pub source: SocketAddr,
    pub interface: String,
}

/// Fixed-capacity inbound queue, drop-oldest under backpressure.
pub(crate) struct PacketQueue {
    inner: Mutex<VecDeque<InboundPacket>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    limit: usize,
}

impl PacketQueue {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            limit,
        }
    }

    pub(crate) async fn push(&self, pkt: InboundPacket) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut q = self.inner.lock().await;
            q.push_back(pkt);
            if q.len() > self.limit {
                q.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_waiters();
    }

    pub(crate) async fn recv(&self) -> Option<InboundPacket> {
        loop {
            let notified = self.notify.notified();
            {
                let mut q = self.inner.lock().await;
                if let Some(pkt) = q.pop_front() {
                    return Some(pkt);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct McastSocket {
    sock: Arc<UdpSocket>,
    interface: String,
    if_index: Option<u32>,
    multicast_target: SocketAddr,
}

/// Multicast server bound to the mDNS port on the selected interfaces.
pub struct UdpMulticastServer {
    sockets: Vec<McastSocket>,
    queue: Arc<PacketQueue>,
    cancel: CancellationToken,
}

fn create_socket_v4(port: u16, group: Ipv4Addr) -> Result<std::net::UdpSocket> {
    let sock = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    sock.bind(&socket2::SockAddr::from(addr))?;
    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

fn create_socket_v6(port: u16, group: Ipv6Addr, interface: u32) -> Result<std::net::UdpSocket> {
    let sock = socket2::Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)?;
    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    sock.bind(&socket2::SockAddr::from(addr))?;
    sock.join_multicast_v6(&group, interface)?;
    sock.set_multicast_if_v6(interface)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

async fn recv_loop(
    sock: Arc<UdpSocket>,
    interface: String,
    queue: Arc<PacketQueue>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 9000];
    loop {
        let (n, source) = tokio::select! {
            result = sock.recv_from(&mut buf) => {
                match result {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("multicast recv error on {}: {}", interface, e);
                        continue;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        };
        queue
            .push(InboundPacket {
                data: buf[..n].to_vec(),
                source,
                interface: interface.clone(),
            })
            .await;
    }
}

impl UdpMulticastServer {
    /// Bind the mDNS port, join ff02::fb on each selected interface and
    /// optionally 224.0.0.251.
    pub fn bind(config: &NodeConfig) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let queue = Arc::new(PacketQueue::new(RECEIVE_QUEUE_LIMIT));
        let mut sockets = Vec::new();

        let ifaces = if_addrs::get_if_addrs().unwrap_or_default();
        let mut seen_indices = std::collections::HashSet::new();
        for iface in &ifaces {
            if !iface.ip().is_ipv6() || iface.ip().is_loopback() {
                continue;
            }
            if let Some(want) = &config.interface {
                if &iface.name != want {
                    continue;
                }
            }
            let Some(idx) = iface.index else { continue };
            if !seen_indices.insert(idx) {
                continue;
            }
            match create_socket_v6(config.mdns_port, MDNS_GROUP_V6, idx) {
                Ok(std_sock) => match UdpSocket::from_std(std_sock) {
                    Ok(s) => sockets.push(McastSocket {
                        sock: Arc::new(s),
                        interface: iface.name.clone(),
                        if_index: Some(idx),
                        multicast_target: SocketAddr::V6(SocketAddrV6::new(
                            MDNS_GROUP_V6,
                            config.mdns_port,
                            0,
                            0,
                        )),
                    }),
                    Err(e) => log::debug!("failed to wrap v6 socket {}: {}", iface.name, e),
                },
                Err(e) => log::debug!("failed to create v6 socket {}: {}", iface.name, e),
            }
        }

        if config.enable_ipv4 {
            match create_socket_v4(config.mdns_port, MDNS_GROUP_V4) {
                Ok(std_sock) => match UdpSocket::from_std(std_sock) {
                    Ok(s) => sockets.push(McastSocket {
                        sock: Arc::new(s),
                        interface: IPV4_INTERFACE.to_owned(),
                        if_index: None,
                        multicast_target: SocketAddr::V4(SocketAddrV4::new(
                            MDNS_GROUP_V4,
                            config.mdns_port,
                        )),
                    }),
                    Err(e) => log::warn!("failed to wrap v4 socket: {}", e),
                },
                Err(e) => log::warn!("failed to create v4 socket: {}", e),
            }
        }

        if sockets.is_empty() {
            return Err(MatterError::Transport("no multicast sockets could be created".into()).into());
        }

        for ms in &sockets {
            let sock = ms.sock.clone();
            let interface = ms.interface.clone();
            let queue = queue.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                recv_loop(sock, interface, queue, cancel).await;
            });
        }

        Ok(Arc::new(Self {
            sockets,
            queue,
            cancel,
        }))
    }

    /// Next inbound datagram, None after close.
    pub async fn recv(&self) -> Option<InboundPacket> {
        self.queue.recv().await
    }

    /// Send a datagram. With `unicast` set it goes to that address on the
    /// matching interface's socket; otherwise it is multicast on the named
    /// interface, or on every interface when none is given.
    pub async fn send(
        &self,
        data: &[u8],
        interface: Option<&str>,
        unicast: Option<SocketAddr>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MatterError::Transport("multicast server is closed".into()).into());
        }
        if let Some(target) = unicast {
            let ms = self
                .sockets
                .iter()
                .find(|s| {
                    interface.map(|i| s.interface == i).unwrap_or(true)
                        && s.sock.local_addr().map(|a| a.is_ipv6()).unwrap_or(false)
                            == target.is_ipv6()
                })
                .or(self.sockets.first())
                .ok_or_else(|| MatterError::Transport("no socket for unicast send".into()))?;
            ms.sock.send_to(data, target).await?;
            return Ok(());
        }
        let mut sent = false;
        for ms in &self.sockets {
            if let Some(want) = interface {
                if ms.interface != want {
                    continue;
                }
            }
            if let Err(e) = ms.sock.send_to(data, ms.multicast_target).await {
                log::debug!("multicast send on {} failed: {}", ms.interface, e);
            } else {
                sent = true;
            }
        }
        if !sent {
            return Err(MatterError::Transport("multicast send reached no interface".into()).into());
        }
        Ok(())
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.sockets.iter().map(|s| s.interface.clone()).collect()
    }

    /// Datagrams discarded because the receive queue was full.
    pub fn dropped_packets(&self) -> u64 {
        self.queue.dropped()
    }

    /// Leave the groups, stop the receive loops and wake any pending recv.
    pub fn close(&self) {
        self.cancel.cancel();
        for ms in &self.sockets {
            match (ms.if_index, ms.multicast_target) {
                (Some(idx), SocketAddr::V6(t)) => {
                    let _ = ms.sock.leave_multicast_v6(t.ip(), idx);
                }
                (None, SocketAddr::V4(t)) => {
                    let _ = ms.sock.leave_multicast_v4(*t.ip(), Ipv4Addr::UNSPECIFIED);
                }
                _ => {}
            }
        }
        self.queue.close();
    }
}

impl Drop for UdpMulticastServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(n: u8) -> InboundPacket {
        InboundPacket {
            data: vec![n],
            source: "127.0.0.1:5353".parse().unwrap(),
            interface: "lo".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_queue_in_order() {
        let q = PacketQueue::new(8);
        q.push(pkt(1)).await;
        q.push(pkt(2)).await;
        assert_eq!(q.recv().await.unwrap().data, vec![1]);
        assert_eq!(q.recv().await.unwrap().data, vec![2]);
    }

    #[tokio::test]
    async fn test_queue_drop_oldest_overflow() {
        let q = PacketQueue::new(2);
        q.push(pkt(1)).await;
        q.push(pkt(2)).await;
        q.push(pkt(3)).await;
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.recv().await.unwrap().data, vec![2]);
        assert_eq!(q.recv().await.unwrap().data, vec![3]);
    }

    #[tokio::test]
    async fn test_queue_close_wakes_receiver() {
        let q = Arc::new(PacketQueue::new(8));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.close();
        assert!(handle.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_drains_after_close() {
        let q = PacketQueue::new(8);
        q.push(pkt(7)).await;
        q.close();
        // already-queued datagrams are still delivered
        assert_eq!(q.recv().await.unwrap().data, vec![7]);
        assert!(q.recv().await.is_none());
    }
}
