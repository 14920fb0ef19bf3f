//! Wires the scanner and the responder onto one multicast server: a single
//! receive loop demultiplexes inbound mdns traffic (responses feed the
//! scanner cache, queries go to the responder) and a pump carries the
//! responder's jittered packets out.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dns;
use crate::multicast::UdpMulticastServer;
use crate::responder::MdnsResponder;
use crate::scanner::MatterScanner;

pub struct MdnsService {
    pub scanner: Arc<MatterScanner>,
    pub responder: Arc<MdnsResponder>,
    server: Arc<UdpMulticastServer>,
    cancel: CancellationToken,
}

impl MdnsService {
    /// Bind the multicast groups and start discovery and advertisement.
    pub fn start(config: &NodeConfig) -> Result<Arc<Self>> {
        let server = UdpMulticastServer::bind(config)?;
        Ok(Self::start_on(server, config))
    }

    pub fn start_on(server: Arc<UdpMulticastServer>, config: &NodeConfig) -> Arc<Self> {
        let scanner = MatterScanner::start(server.clone(), config);
        let (responder, mut responder_rx) = MdnsResponder::new();
        let cancel = CancellationToken::new();

        {
            let server = server.clone();
            let scanner = scanner.clone();
            let responder = responder.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                loop {
                    let packet = tokio::select! {
                        p = server.recv() => match p {
                            Some(p) => p,
                            None => return,
                        },
                        _ = cancel.cancelled() => return,
                    };
                    let msg = match dns::decode_message(&packet.data) {
                        Ok(m) => m,
                        Err(e) => {
                            log::trace!("undecodable mdns packet from {}: {:?}", packet.source, e);
                            continue;
                        }
                    };
                    if msg.message_type.is_response() {
                        scanner.handle_dns_message(msg, &packet.interface);
                    } else {
                        responder.handle_query(&msg, &packet.interface, packet.source);
                    }
                }
            });
        }

        {
            let server = server.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                loop {
                    let packet = tokio::select! {
                        p = responder_rx.recv() => match p {
                            Some(p) => p,
                            None => return,
                        },
                        _ = cancel.cancelled() => {
                            // flush queued goodbyes before shutting down
                            while let Ok(packet) = responder_rx.try_recv() {
                                let _ = server
                                    .send(&packet.data, Some(&packet.interface), packet.unicast)
                                    .await;
                            }
                            return;
                        }
                    };
                    if let Err(e) = server
                        .send(&packet.data, Some(&packet.interface), packet.unicast)
                        .await
                    {
                        log::debug!("responder send failed: {:?}", e);
                    }
                }
            });
        }

        Arc::new(Self {
            scanner,
            responder,
            server,
            cancel,
        })
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.server.interfaces()
    }

    /// Goodbye our announcements, stop all loops and leave the groups.
    pub async fn close(&self) {
        self.responder.expire_announcements(&self.server.interfaces());
        self.responder.close();
        self.scanner.close();
        // let the pump flush the goodbyes before the socket goes away
        self.cancel.cancel();
        tokio::task::yield_now().await;
        self.server.close();
    }
}
