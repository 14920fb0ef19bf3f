//! Unsecured message exchange used to carry the CASE handshake: frames
//! payloads with the matter message header, acknowledges reliable messages,
//! drops duplicates and retransmits its own unacknowledged tail.

use anyhow::Result;
use byteorder::WriteBytesExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::MatterError;
use crate::messages::{self, Message, MessageHeader, ProtocolMessageHeader};
use crate::transport;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);
const RETRANSMIT_THRESHOLD: Duration = Duration::from_millis(1500);
const MAX_CACHED_COUNTERS: usize = 32;

/// Bounded set of received message counters for duplicate detection.
struct ReceivedCounters {
    set: HashSet<u32>,
    order: VecDeque<u32>,
}

impl ReceivedCounters {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }
    /// Returns true when the counter was new.
    fn insert(&mut self, counter: u32) -> bool {
        if !self.set.insert(counter) {
            return false;
        }
        self.order.push_back(counter);
        while self.order.len() > MAX_CACHED_COUNTERS {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

struct Unacked {
    data: Vec<u8>,
    last_sent: Instant,
}

pub struct MessageExchange {
    connection: Arc<transport::Connection>,
    exchange_id: u16,
    counter: AtomicU32,
    source_node_id: Vec<u8>,
    received: Mutex<ReceivedCounters>,
    unacked: Mutex<HashMap<u32, Unacked>>,
    last_received_counter: AtomicU32,
    is_initiator: bool,
}

impl MessageExchange {
    pub fn new(
        connection: Arc<transport::Connection>,
        exchange_id: u16,
        is_initiator: bool,
    ) -> Self {
        let mut source_node_id = Vec::with_capacity(8);
        let _ = source_node_id.write_u64::<byteorder::LittleEndian>(rand::random());
        Self {
            connection,
            exchange_id,
            counter: AtomicU32::new(rand::random()),
            source_node_id,
            received: Mutex::new(ReceivedCounters::new()),
            unacked: Mutex::new(HashMap::new()),
            last_received_counter: AtomicU32::new(0),
            is_initiator,
        }
    }

    pub fn exchange_id(&self) -> u16 {
        self.exchange_id
    }

    /// Counter of the most recently delivered peer message, for piggyback
    /// acks in protocol payload builders.
    pub fn last_received_counter(&self) -> u32 {
        self.last_received_counter.load(Ordering::Relaxed)
    }

    fn frame(&self, protocol_payload: &[u8]) -> Result<(u32, Vec<u8>)> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let header = MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: 0,
            message_counter: counter,
            source_node_id: Some(self.source_node_id.clone()),
            destination_node_id: None,
        };
        let mut out = header.encode()?;
        out.extend_from_slice(protocol_payload);
        Ok((counter, out))
    }

    /// Frame and send a protocol payload, tracking it for retransmit.
    pub async fn send(&self, protocol_payload: &[u8]) -> Result<()> {
        let (counter, framed) = self.frame(protocol_payload)?;
        {
            let mut unacked = self.unacked.lock().unwrap();
            unacked.insert(
                counter,
                Unacked {
                    data: framed.clone(),
                    last_sent: Instant::now(),
                },
            );
        }
        log::trace!("exchange {}: send counter {}", self.exchange_id, counter);
        self.connection.send(&framed).await?;
        Ok(())
    }

    /// Send a payload without reliability tracking (status reports on the
    /// way out of a failed handshake).
    pub async fn send_untracked(&self, protocol_payload: &[u8]) -> Result<()> {
        let (_, framed) = self.frame(protocol_payload)?;
        self.connection.send(&framed).await?;
        Ok(())
    }

    async fn send_ack_for(&self, message: &Message) -> Result<()> {
        let ack = messages::ack(
            message.protocol_header.exchange_id,
            self.is_initiator,
            message.message_header.message_counter,
        )?;
        self.send_untracked(&ack).await
    }

    fn retransmit_candidate(&self) -> Option<Vec<u8>> {
        let mut unacked = self.unacked.lock().unwrap();
        for (counter, msg) in unacked.iter_mut() {
            if msg.last_sent.elapsed() >= RETRANSMIT_THRESHOLD {
                log::trace!("exchange {}: retransmit counter {}", self.exchange_id, counter);
                msg.last_sent = Instant::now();
                return Some(msg.data.clone());
            }
        }
        None
    }

    /// Wait for the next message addressed to this exchange. Acks and
    /// duplicates are consumed internally; own unacked messages are
    /// retransmitted while waiting. Fails with [MatterError::Timeout] once
    /// `deadline` elapses.
    pub async fn next_message(&self, deadline: Duration) -> Result<Message> {
        let started = Instant::now();
        loop {
            if started.elapsed() > deadline {
                return Err(MatterError::Timeout.into());
            }
            let raw = match self.connection.receive(RECEIVE_TIMEOUT).await {
                Ok(v) => v,
                Err(_) => {
                    if let Some(data) = self.retransmit_candidate() {
                        self.connection.send(&data).await?;
                    }
                    continue;
                }
            };
            let decoded = match Message::decode(&raw) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("exchange {}: undecodable message: {:?}", self.exchange_id, e);
                    continue;
                }
            };

            // acks release our retransmit entries
            if decoded.protocol_header.exchange_flags & ProtocolMessageHeader::FLAG_ACK != 0 {
                self.unacked
                    .lock()
                    .unwrap()
                    .remove(&decoded.protocol_header.ack_counter);
            }

            let is_new = self
                .received
                .lock()
                .unwrap()
                .insert(decoded.message_header.message_counter);
            if !is_new {
                // ack again, the peer may have lost ours
                self.send_ack_for(&decoded).await?;
                log::trace!(
                    "exchange {}: duplicate counter {}",
                    self.exchange_id,
                    decoded.message_header.message_counter
                );
                continue;
            }

            if decoded.protocol_header.protocol_id
                == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
                && decoded.protocol_header.opcode == ProtocolMessageHeader::OPCODE_ACK
            {
                continue;
            }

            if decoded.protocol_header.exchange_flags & ProtocolMessageHeader::FLAG_RELIABILITY != 0
            {
                self.send_ack_for(&decoded).await?;
            }

            if decoded.protocol_header.exchange_id != self.exchange_id {
                log::trace!(
                    "exchange {}: ignoring message for exchange {}",
                    self.exchange_id,
                    decoded.protocol_header.exchange_id
                );
                continue;
            }

            self.last_received_counter
                .store(decoded.message_header.message_counter, Ordering::Relaxed);
            return Ok(decoded);
        }
    }
}
