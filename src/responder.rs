//! mdns responder: advertises this node's matter services and answers
//! incoming queries with known-answer suppression, duplicate suppression
//! and the RFC 6762 response jitter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dns::{
    self, DnsMessage, DnsRecord, MessageType, RecordValue, TYPE_A, TYPE_AAAA, TYPE_ANY, TYPE_PTR,
};

/// Produces the records to advertise on a given interface. A node typically
/// registers one generator per published service (operational instance,
/// commissionable instance while in pairing mode).
pub type RecordGenerator = Arc<dyn Fn(&str) -> Vec<DnsRecord> + Send + Sync>;

/// Outbound packet queued by the responder; `unicast` is set for QU replies.
#[derive(Debug)]
pub struct ResponderPacket {
    pub data: Vec<u8>,
    pub interface: String,
    pub unicast: Option<SocketAddr>,
}

const JITTER_MIN_MS: u64 = 20;
const JITTER_MAX_MS: u64 = 120;

type RecordKey = (String, u16, RecordValue);

fn record_key(rr: &DnsRecord) -> RecordKey {
    (rr.name.to_lowercase(), rr.typ, rr.value.clone())
}

fn push_unique(list: &mut Vec<DnsRecord>, answers: &[DnsRecord], rr: &DnsRecord) {
    if !answers.iter().any(|a| a.same_data(rr)) && !list.iter().any(|a| a.same_data(rr)) {
        list.push(rr.clone());
    }
}

struct ResponderInner {
    generators: Vec<RecordGenerator>,
    /// When each owned record was last multicast, for duplicate suppression
    /// and the QU rule.
    last_multicast_ms: HashMap<RecordKey, u64>,
}

pub struct MdnsResponder {
    inner: Mutex<ResponderInner>,
    send_tx: mpsc::UnboundedSender<ResponderPacket>,
    cancel: CancellationToken,
}

impl MdnsResponder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ResponderPacket>) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: Mutex::new(ResponderInner {
                    generators: Vec::new(),
                    last_multicast_ms: HashMap::new(),
                }),
                send_tx,
                cancel: CancellationToken::new(),
            }),
            send_rx,
        )
    }

    /// Register a record generator and announce its records right away.
    pub fn add_generator(&self, generator: RecordGenerator, interfaces: &[String]) {
        self.inner.lock().unwrap().generators.push(generator);
        self.announce(interfaces);
    }

    fn owned_records(&self, interface: &str) -> Vec<DnsRecord> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<DnsRecord> = Vec::new();
        for generator in &inner.generators {
            for rr in generator(interface) {
                if !out.iter().any(|o| o.same_data(&rr)) {
                    out.push(rr);
                }
            }
        }
        out
    }

    /// Gratuitous announcement of all owned records on each interface.
    pub fn announce(&self, interfaces: &[String]) {
        for interface in interfaces {
            let records = self.owned_records(interface);
            if records.is_empty() {
                continue;
            }
            let mut msg = DnsMessage::new(MessageType::Response);
            for rr in records {
                if rr.typ == TYPE_PTR {
                    msg.answers.push(rr);
                } else {
                    msg.additionals.push(rr);
                }
            }
            self.stamp_multicast(msg.answers.iter().chain(msg.additionals.iter()));
            self.queue(msg, interface, None);
        }
    }

    /// Send ttl=0 goodbyes for everything we advertised and stop announcing.
    pub fn expire_announcements(&self, interfaces: &[String]) {
        for interface in interfaces {
            let mut records = self.owned_records(interface);
            if records.is_empty() {
                continue;
            }
            for rr in &mut records {
                rr.ttl = 0;
            }
            let mut msg = DnsMessage::new(MessageType::Response);
            msg.answers = records;
            self.queue(msg, interface, None);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.generators.clear();
        inner.last_multicast_ms.clear();
    }

    /// Answer an incoming query, if any owned record matches. The reply is
    /// queued with the RFC 6762 20-120 ms jitter.
    pub fn handle_query(&self, msg: &DnsMessage, interface: &str, source: SocketAddr) {
        if msg.message_type.is_response() {
            return;
        }
        let Some((response, unicast)) = self.build_response(msg, interface, source) else {
            return;
        };
        let Ok(bytes) = dns::encode_message(&response) else {
            return;
        };
        let packet = ResponderPacket {
            data: bytes,
            interface: interface.to_owned(),
            unicast,
        };
        let tx = self.send_tx.clone();
        let cancel = self.cancel.child_token();
        let jitter = rand::thread_rng().gen_range(JITTER_MIN_MS..=JITTER_MAX_MS);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(jitter)) => {
                    let _ = tx.send(packet);
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Compute the response for a query: matching answers minus known-answer
    /// and duplicate suppression, with related records as additionals.
    /// Returns the message and the unicast target when the QU rule applies.
    fn build_response(
        &self,
        query: &DnsMessage,
        interface: &str,
        source: SocketAddr,
    ) -> Option<(DnsMessage, Option<SocketAddr>)> {
        let records = self.owned_records(interface);
        if records.is_empty() {
            return None;
        }

        let mut answers: Vec<DnsRecord> = Vec::new();
        let mut unicast_requested = false;
        for q in &query.queries {
            if q.unicast_response() {
                unicast_requested = true;
            }
            for rr in &records {
                if rr.name.eq_ignore_ascii_case(&q.name)
                    && (q.typ == TYPE_ANY || q.typ == rr.typ)
                    && !answers.iter().any(|a| a.same_data(rr))
                {
                    answers.push(rr.clone());
                }
            }
        }

        // known-answer suppression: the querier already holds these
        answers.retain(|a| !query.answers.iter().any(|known| known.same_data(a)));
        if answers.is_empty() {
            return None;
        }

        let now = crate::timer::now_ms();
        // duplicate suppression: drop answers multicast within the last
        // second or ttl/4, whichever is longer
        let suppressed_since = |rr: &DnsRecord| {
            let window_ms = (rr.ttl as u64 * 1000 / 4).max(1000);
            now.saturating_sub(window_ms)
        };
        let inner = self.inner.lock().unwrap();
        let recently_multicast = |rr: &DnsRecord| {
            inner
                .last_multicast_ms
                .get(&record_key(rr))
                .map(|last| *last >= suppressed_since(rr))
                .unwrap_or(false)
        };
        // a QU query is answered via unicast as long as every answer went
        // out on multicast recently enough
        let unicast = if unicast_requested && answers.iter().all(&recently_multicast) {
            Some(source)
        } else {
            None
        };
        if unicast.is_none() {
            answers.retain(|a| !recently_multicast(a));
        }
        drop(inner);
        if answers.is_empty() {
            return None;
        }

        // related records ride along as additionals
        let mut additionals: Vec<DnsRecord> = Vec::new();
        for answer in &answers {
            if let RecordValue::Ptr(target) = &answer.value {
                // instance srv/txt plus the glue underneath
                for rr in &records {
                    if rr.name.eq_ignore_ascii_case(target) {
                        push_unique(&mut additionals, &answers, rr);
                    }
                }
            }
        }
        if answers.iter().any(|a| a.typ != TYPE_A && a.typ != TYPE_AAAA) {
            let srv_targets: Vec<String> = answers
                .iter()
                .chain(additionals.iter())
                .filter_map(|rr| match &rr.value {
                    RecordValue::Srv { target, .. } => Some(target.to_lowercase()),
                    _ => None,
                })
                .collect();
            for rr in &records {
                let is_address = rr.typ == TYPE_A || rr.typ == TYPE_AAAA;
                if is_address
                    && (srv_targets.is_empty()
                        || srv_targets.contains(&rr.name.to_lowercase()))
                {
                    push_unique(&mut additionals, &answers, rr);
                }
            }
        }

        if unicast.is_none() {
            self.stamp_multicast(answers.iter().chain(additionals.iter()));
        }

        let mut response = DnsMessage::new(MessageType::Response);
        response.answers = answers;
        response.additionals = additionals;
        Some((response, unicast))
    }

    fn queue(&self, msg: DnsMessage, interface: &str, unicast: Option<SocketAddr>) {
        let Ok(bytes) = dns::encode_message(&msg) else {
            return;
        };
        let _ = self.send_tx.send(ResponderPacket {
            data: bytes,
            interface: interface.to_owned(),
            unicast,
        });
    }

    fn stamp_multicast<'a>(&self, records: impl Iterator<Item = &'a DnsRecord>) {
        let now = crate::timer::now_ms();
        let mut inner = self.inner.lock().unwrap();
        for rr in records {
            inner.last_multicast_ms.insert(record_key(rr), now);
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MdnsResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Standard record set for one advertised dns-sd service instance.
pub fn service_records(
    service: &str,
    instance: &str,
    hostname: &str,
    port: u16,
    txt_entries: Vec<String>,
    addresses: Vec<std::net::IpAddr>,
    ttl: u32,
) -> Vec<DnsRecord> {
    let instance_qname = format!("{}.{}", instance, service);
    let mut records = vec![
        DnsRecord {
            name: service.to_owned(),
            typ: dns::TYPE_PTR,
            class: dns::CLASS_IN,
            ttl,
            value: RecordValue::Ptr(instance_qname.clone()),
        },
        DnsRecord {
            name: instance_qname.clone(),
            typ: dns::TYPE_SRV,
            class: dns::CLASS_IN,
            ttl,
            value: RecordValue::Srv {
                priority: 0,
                weight: 0,
                port,
                target: hostname.to_owned(),
            },
        },
        DnsRecord {
            name: instance_qname,
            typ: dns::TYPE_TXT,
            class: dns::CLASS_IN,
            ttl,
            value: RecordValue::Txt(txt_entries),
        },
    ];
    for ip in addresses {
        records.push(DnsRecord {
            name: hostname.to_owned(),
            typ: match ip {
                std::net::IpAddr::V4(_) => TYPE_A,
                std::net::IpAddr::V6(_) => TYPE_AAAA,
            },
            class: dns::CLASS_IN,
            ttl,
            value: match ip {
                std::net::IpAddr::V4(v4) => RecordValue::A(v4),
                std::net::IpAddr::V6(v6) => RecordValue::Aaaa(v6),
            },
        });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsQuery, CLASS_HIGH_BIT, CLASS_IN, TYPE_SRV};

    fn source() -> SocketAddr {
        "[fe80::9]:5353".parse().unwrap()
    }

    fn test_generator() -> RecordGenerator {
        Arc::new(|_interface: &str| {
            service_records(
                "_matter._tcp.local",
                "A1B2C3D4E5F60718-00000000DEADBEEF",
                "node.local",
                5540,
                vec!["SII=500".to_owned()],
                vec!["fe80::1".parse().unwrap()],
                120,
            )
        })
    }

    fn responder_with_service() -> Arc<MdnsResponder> {
        let (r, _rx) = MdnsResponder::new();
        r.inner.lock().unwrap().generators.push(test_generator());
        r
    }

    fn ptr_query() -> DnsMessage {
        let mut q = DnsMessage::new(MessageType::Query);
        q.queries
            .push(DnsQuery::new("_matter._tcp.local", TYPE_PTR));
        q
    }

    #[test]
    fn test_service_query_answered_with_additionals() {
        let r = responder_with_service();
        let (response, unicast) = r.build_response(&ptr_query(), "eth0", source()).unwrap();
        assert!(unicast.is_none());
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].typ, TYPE_PTR);
        let add_types: Vec<u16> = response.additionals.iter().map(|r| r.typ).collect();
        assert!(add_types.contains(&TYPE_SRV));
        assert!(add_types.contains(&dns::TYPE_TXT));
        assert!(add_types.contains(&TYPE_AAAA));
    }

    #[test]
    fn test_unrelated_query_ignored() {
        let r = responder_with_service();
        let mut q = DnsMessage::new(MessageType::Query);
        q.queries.push(DnsQuery::new("_other._tcp.local", TYPE_PTR));
        assert!(r.build_response(&q, "eth0", source()).is_none());
    }

    #[test]
    fn test_known_answer_suppression() {
        let r = responder_with_service();
        let mut q = ptr_query();
        // the querier already knows our ptr, even with a different ttl
        q.answers.push(DnsRecord {
            name: "_matter._tcp.local".to_owned(),
            typ: TYPE_PTR,
            class: CLASS_IN,
            ttl: 4000,
            value: RecordValue::Ptr(
                "A1B2C3D4E5F60718-00000000DEADBEEF._matter._tcp.local".to_owned(),
            ),
        });
        assert!(r.build_response(&q, "eth0", source()).is_none());
    }

    #[test]
    fn test_duplicate_suppression_window() {
        let r = responder_with_service();
        assert!(r.build_response(&ptr_query(), "eth0", source()).is_some());
        // immediately asked again: inside the 1 s / ttl/4 window
        assert!(r.build_response(&ptr_query(), "eth0", source()).is_none());
    }

    #[test]
    fn test_qu_answered_unicast_after_multicast() {
        let r = responder_with_service();
        // first answer goes to multicast and is stamped
        assert!(r.build_response(&ptr_query(), "eth0", source()).is_some());
        let mut q = ptr_query();
        q.queries[0].class = CLASS_IN | CLASS_HIGH_BIT;
        let (_, unicast) = r.build_response(&q, "eth0", source()).unwrap();
        assert_eq!(unicast, Some(source()));
    }

    #[test]
    fn test_qu_before_any_multicast_goes_multicast() {
        let r = responder_with_service();
        let mut q = ptr_query();
        q.queries[0].class = CLASS_IN | CLASS_HIGH_BIT;
        let (_, unicast) = r.build_response(&q, "eth0", source()).unwrap();
        assert!(unicast.is_none());
    }

    #[test]
    fn test_srv_query_pulls_address_glue() {
        let r = responder_with_service();
        let mut q = DnsMessage::new(MessageType::Query);
        q.queries.push(DnsQuery::new(
            "A1B2C3D4E5F60718-00000000DEADBEEF._matter._tcp.local",
            TYPE_SRV,
        ));
        let (response, _) = r.build_response(&q, "eth0", source()).unwrap();
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].typ, TYPE_SRV);
        assert!(response
            .additionals
            .iter()
            .any(|rr| rr.typ == TYPE_AAAA && rr.name == "node.local"));
    }

    #[tokio::test]
    async fn test_expire_emits_goodbyes() {
        let (r, mut rx) = MdnsResponder::new();
        r.inner.lock().unwrap().generators.push(test_generator());
        r.expire_announcements(&["eth0".to_owned()]);
        let packet = rx.recv().await.unwrap();
        let msg = dns::decode_message(&packet.data).unwrap();
        assert!(!msg.answers.is_empty());
        assert!(msg.answers.iter().all(|rr| rr.ttl == 0));
        // generators are gone, further queries are unanswered
        assert!(r.build_response(&ptr_query(), "eth0", source()).is_none());
    }

    #[tokio::test]
    async fn test_announce_on_registration() {
        let (r, mut rx) = MdnsResponder::new();
        r.add_generator(test_generator(), &["eth0".to_owned()]);
        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.interface, "eth0");
        let msg = dns::decode_message(&packet.data).unwrap();
        assert_eq!(msg.message_type, MessageType::Response);
        assert!(msg.answers.iter().any(|rr| rr.typ == TYPE_PTR));
    }

    #[tokio::test]
    async fn test_handle_query_applies_jitter() {
        let (r, mut rx) = MdnsResponder::new();
        r.inner.lock().unwrap().generators.push(test_generator());
        let started = std::time::Instant::now();
        r.handle_query(&ptr_query(), "eth0", source());
        let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(JITTER_MIN_MS));
        let msg = dns::decode_message(&packet.data).unwrap();
        assert!(msg.answers.iter().any(|rr| rr.typ == TYPE_PTR));
    }
}
