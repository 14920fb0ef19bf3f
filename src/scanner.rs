//! mdns scanner for matter: active discovery of operational and
//! commissionable devices.
//!
//! The scanner keeps a table of active queries with an exponential announce
//! schedule (1.5 s doubling up to an hour), budgets outgoing packets to the
//! multicast MTU with TC chaining, caches discovered records with per-address
//! ttls and coordinates callers through per-query waiters.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dns::{
    self, DnsMessage, DnsQuery, DnsRecord, MessageType, RecordValue, MAX_MDNS_MESSAGE_SIZE,
    TYPE_A, TYPE_AAAA, TYPE_ANY, TYPE_SRV,
};
use crate::error::MatterError;
use crate::fabric::Fabric;
use crate::multicast::UdpMulticastServer;
use crate::timer::{self, PeriodicTimer};

pub const SERVICE_OPERATIONAL: &str = "_matter._tcp.local";
pub const SERVICE_COMMISSIONABLE: &str = "_matterc._udp.local";

const START_ANNOUNCE_INTERVAL_MS: u64 = 1500;
const MAX_ANNOUNCE_INTERVAL_MS: u64 = 3600 * 1000;
const CACHE_SWEEP_INTERVAL_MS: u64 = 60 * 1000;
const DEFAULT_COMMISSIONABLE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_CONTINUOUS_TIMEOUT_SECS: u64 = 900;

/// One ip a device was seen on, scoped to the interface that saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub interface: String,
}

impl DeviceAddress {
    /// Link-local addresses need the zone id to be usable.
    pub fn to_display(&self) -> String {
        match self.ip {
            IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80 => {
                format!("{}%{}", v6, self.interface)
            }
            ip => ip.to_string(),
        }
    }
}

fn address_rank(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V6(v6) if v6.segments()[0] >> 8 == 0xfd => 0,
        IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80 => 1,
        IpAddr::V6(_) => 2,
        IpAddr::V4(_) => 3,
    }
}

/// Stable sort: ULA first, then link-local, other v6, v4 last.
pub fn sort_addresses(addresses: &mut [DeviceAddress]) {
    addresses.sort_by_key(|a| address_rank(&a.ip));
}

/// Recognized operational/commissionable TXT values plus unknown keys kept
/// as raw strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryData {
    pub session_idle_interval_ms: Option<u32>,
    pub session_active_interval_ms: Option<u32>,
    pub session_active_threshold_ms: Option<u32>,
    pub tcp_supported: Option<u32>,
    pub device_type: Option<u32>,
    pub pairing_hint: Option<u32>,
    pub icd_operating_mode: Option<u32>,
    pub vendor_product: Option<String>,
    pub device_name: Option<String>,
    pub rotating_id: Option<String>,
    pub pairing_instruction: Option<String>,
    pub unknown: HashMap<String, String>,
}

fn parse_txt_entries(entries: &[String]) -> DiscoveryData {
    let mut data = DiscoveryData::default();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        let int = || value.parse::<u32>().ok();
        match key {
            "SII" => data.session_idle_interval_ms = int(),
            "SAI" => data.session_active_interval_ms = int(),
            "SAT" => data.session_active_threshold_ms = int(),
            "T" => data.tcp_supported = int(),
            "DT" => data.device_type = int(),
            "PH" => data.pairing_hint = int(),
            "ICD" => data.icd_operating_mode = int(),
            "VP" => data.vendor_product = Some(value.to_owned()),
            "DN" => data.device_name = Some(value.to_owned()),
            "RI" => data.rotating_id = Some(value.to_owned()),
            "PI" => data.pairing_instruction = Some(value.to_owned()),
            // experimental keys stay strings, no type guessing
            other => {
                data.unknown.insert(other.to_owned(), value.to_owned());
            }
        }
    }
    data
}

/// Discovered operational (commissioned) device.
#[derive(Debug, Clone)]
pub struct OperationalDevice {
    /// The matter instance qname, `<opIdHex>-<nodeIdHex>._matter._tcp.local`.
    pub device_identifier: String,
    pub addresses: Vec<DeviceAddress>,
    pub discovery_data: DiscoveryData,
}

/// Discovered device in commissioning mode.
#[derive(Debug, Clone)]
pub struct CommissionableDevice {
    /// Full instance qname.
    pub device_identifier: String,
    pub instance_id: String,
    pub long_discriminator: u16,
    pub short_discriminator: u8,
    pub commissioning_mode: u8,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub device_type: Option<u32>,
    pub device_name: Option<String>,
    pub pairing_hint: Option<u32>,
    pub addresses: Vec<DeviceAddress>,
    pub discovery_data: DiscoveryData,
}

/// Target of a commissionable discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommissionableIdentity {
    Instance(String),
    LongDiscriminator(u16),
    ShortDiscriminator(u8),
    Vendor(u16),
    DeviceType(u32),
    Product(u16),
    /// Any device with commissioning mode open.
    CommissioningMode,
}

impl CommissionableIdentity {
    /// Key into the active-query table.
    fn query_id(&self) -> String {
        match self {
            CommissionableIdentity::Instance(id) => {
                format!("{}.{}", id, SERVICE_COMMISSIONABLE)
            }
            CommissionableIdentity::LongDiscriminator(d) => {
                format!("_L{}._sub.{}", d, SERVICE_COMMISSIONABLE)
            }
            CommissionableIdentity::ShortDiscriminator(s) => {
                format!("_S{}._sub.{}", s, SERVICE_COMMISSIONABLE)
            }
            CommissionableIdentity::Vendor(v) => {
                format!("_V{}._sub.{}", v, SERVICE_COMMISSIONABLE)
            }
            CommissionableIdentity::DeviceType(t) => {
                format!("_T{}._sub.{}", t, SERVICE_COMMISSIONABLE)
            }
            // no dns-sd subtype exists for products; the base service is
            // browsed and results are filtered on TXT P
            CommissionableIdentity::Product(p) => {
                format!("_P{}._sub.{}", p, SERVICE_COMMISSIONABLE)
            }
            CommissionableIdentity::CommissioningMode => {
                format!("_CM._sub.{}", SERVICE_COMMISSIONABLE)
            }
        }
    }

    fn queries(&self) -> Vec<DnsQuery> {
        match self {
            CommissionableIdentity::Instance(_) => {
                vec![DnsQuery::new(&self.query_id(), TYPE_ANY)]
            }
            CommissionableIdentity::Product(_) => {
                vec![DnsQuery::new(SERVICE_COMMISSIONABLE, dns::TYPE_PTR)]
            }
            _ => vec![DnsQuery::new(&self.query_id(), dns::TYPE_PTR)],
        }
    }

    fn matches(&self, device: &CommissionableDevice) -> bool {
        match self {
            CommissionableIdentity::Instance(id) => device.instance_id == *id,
            CommissionableIdentity::LongDiscriminator(d) => device.long_discriminator == *d,
            CommissionableIdentity::ShortDiscriminator(s) => device.short_discriminator == *s,
            CommissionableIdentity::Vendor(v) => device.vendor_id == Some(*v),
            CommissionableIdentity::DeviceType(t) => device.device_type == Some(*t),
            CommissionableIdentity::Product(p) => device.product_id == Some(*p),
            CommissionableIdentity::CommissioningMode => device.commissioning_mode != 0,
        }
    }
}

/// The matter operational instance qname for a node on a fabric.
pub fn operational_instance_name(fabric: &Fabric, node_id: u64) -> Result<String> {
    let op_id = fabric.operational_id()?;
    Ok(format!(
        "{}-{:016X}.{}",
        hex::encode_upper(op_id),
        node_id,
        SERVICE_OPERATIONAL
    ))
}

struct ActiveQuery {
    query_id: String,
    queries: Vec<DnsQuery>,
    known_answers: Vec<DnsRecord>,
}

struct Waiter {
    tx: oneshot::Sender<()>,
    has_timeout: bool,
    /// When false, only a device identifier that was unknown at
    /// registration resolves the waiter.
    resolve_on_updated_records: bool,
    known_ids: HashSet<String>,
}

#[derive(Clone)]
struct AddressEntry {
    port: u16,
    interface: String,
    expires_at_ms: u64,
}

#[derive(Default)]
struct OperationalEntry {
    addresses: HashMap<IpAddr, AddressEntry>,
    expires_at_ms: u64,
    data: DiscoveryData,
}

struct CommissionableTxt {
    long_discriminator: u16,
    short_discriminator: u8,
    commissioning_mode: u8,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    data: DiscoveryData,
}

struct CommissionableEntry {
    txt: CommissionableTxt,
    addresses: HashMap<IpAddr, AddressEntry>,
    expires_at_ms: u64,
}

struct ScannerInner {
    active_queries: Vec<ActiveQuery>,
    operational: HashMap<String, OperationalEntry>,
    commissionable: HashMap<String, CommissionableEntry>,
    waiters: HashMap<String, Waiter>,
    announce_interval_ms: u64,
    next_send_at_ms: Option<u64>,
}

/// Active matter service discovery over one multicast server.
pub struct MatterScanner {
    inner: Mutex<ScannerInner>,
    send_tx: mpsc::UnboundedSender<Vec<u8>>,
    reschedule: Notify,
    cancel: CancellationToken,
    closing: AtomicBool,
    enable_ipv4: bool,
}

impl MatterScanner {
    /// Start the scanner on a bound multicast server: spawns the send,
    /// scheduler and cache-sweep tasks. Inbound packets are fed by the
    /// owner (see [crate::service::MdnsService]), which demultiplexes the
    /// server's receive queue between scanner and responder.
    pub fn start(server: Arc<UdpMulticastServer>, config: &NodeConfig) -> Arc<Self> {
        let (scanner, mut send_rx) = Self::with_sender(config.enable_ipv4);

        // outbound: every packet is multicast on all interfaces
        {
            let server = server.clone();
            let cancel = scanner.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    let packet = tokio::select! {
                        p = send_rx.recv() => match p {
                            Some(p) => p,
                            None => return,
                        },
                        _ = cancel.cancelled() => return,
                    };
                    if let Err(e) = server.send(&packet, None, None).await {
                        log::debug!("scanner send failed: {:?}", e);
                    }
                }
            });
        }

        // announce scheduler
        {
            let scanner = scanner.clone();
            let cancel = scanner.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    let delay = {
                        let inner = scanner.inner.lock().unwrap();
                        inner
                            .next_send_at_ms
                            .map(|at| at.saturating_sub(timer::now_ms()))
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = scanner.reschedule.notified() => continue,
                        _ = tokio::time::sleep(Duration::from_millis(delay.unwrap_or(60_000))) => {
                            if delay.is_none() {
                                continue;
                            }
                        }
                    }
                    for packet in scanner.run_send_cycle() {
                        let _ = scanner.send_tx.send(packet);
                    }
                }
            });
        }

        // periodic cache sweep; the timer service keeps it cancellable
        {
            let scanner = scanner.clone();
            let sweep = {
                let scanner = scanner.clone();
                PeriodicTimer::new(CACHE_SWEEP_INTERVAL_MS, move || {
                    scanner.sweep_cache();
                })
            };
            sweep.start();
            let cancel = scanner.cancel.child_token();
            tokio::spawn(async move {
                cancel.cancelled().await;
                sweep.stop();
            });
        }

        scanner
    }

    /// Construct without background tasks; outgoing packets appear on the
    /// returned channel. Used by [MatterScanner::start] and by tests that
    /// drive cycles by hand.
    pub(crate) fn with_sender(
        enable_ipv4: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: Mutex::new(ScannerInner {
                    active_queries: Vec::new(),
                    operational: HashMap::new(),
                    commissionable: HashMap::new(),
                    waiters: HashMap::new(),
                    announce_interval_ms: START_ANNOUNCE_INTERVAL_MS,
                    next_send_at_ms: None,
                }),
                send_tx,
                reschedule: Notify::new(),
                cancel: CancellationToken::new(),
                closing: AtomicBool::new(false),
                enable_ipv4,
            }),
            send_rx,
        )
    }

    fn check_open(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(MatterError::Implementation("scanner is closing".into()).into());
        }
        Ok(())
    }

    /// Merge query tuples for `query_id`, reset the announce interval to
    /// 1.5 s and schedule an immediate send. A union identical to the
    /// already-known set leaves the schedule untouched.
    pub fn set_query_records(
        &self,
        query_id: &str,
        queries: Vec<DnsQuery>,
        known_answers: Vec<DnsRecord>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let mut changed = true;
        if let Some(aq) = inner
            .active_queries
            .iter_mut()
            .find(|aq| aq.query_id == query_id)
        {
            changed = false;
            for q in queries {
                if !aq.queries.contains(&q) {
                    aq.queries.push(q);
                    changed = true;
                }
            }
            aq.known_answers.extend(known_answers);
        } else {
            inner.active_queries.push(ActiveQuery {
                query_id: query_id.to_owned(),
                queries,
                known_answers,
            });
        }
        if changed {
            inner.announce_interval_ms = START_ANNOUNCE_INTERVAL_MS;
            inner.next_send_at_ms = Some(timer::now_ms());
            drop(inner);
            self.reschedule.notify_waiters();
        }
    }

    fn remove_query(&self, query_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_queries.retain(|aq| aq.query_id != query_id);
        if inner.active_queries.is_empty() {
            inner.next_send_at_ms = None;
        }
        inner.waiters.remove(query_id);
    }

    /// One announce cycle: build the packets for all active queries, then
    /// double the interval (capped at one hour).
    pub(crate) fn run_send_cycle(&self) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active_queries.is_empty() {
            inner.next_send_at_ms = None;
            return Vec::new();
        }
        let packets = match build_query_packets(&inner.active_queries) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("scanner: building query packets failed: {:?}", e);
                Vec::new()
            }
        };
        inner.announce_interval_ms =
            (inner.announce_interval_ms * 2).min(MAX_ANNOUNCE_INTERVAL_MS);
        inner.next_send_at_ms = Some(timer::now_ms() + inner.announce_interval_ms);
        packets
    }

    pub(crate) fn announce_interval_ms(&self) -> u64 {
        self.inner.lock().unwrap().announce_interval_ms
    }

    /// Drop addresses whose ttl elapsed, then records that expired or lost
    /// their last address.
    pub(crate) fn sweep_cache(&self) {
        let now = timer::now_ms();
        let mut inner = self.inner.lock().unwrap();
        inner.operational.retain(|name, entry| {
            entry.addresses.retain(|_, a| a.expires_at_ms > now);
            let keep = entry.expires_at_ms > now && !entry.addresses.is_empty();
            if !keep {
                log::debug!("operational record {} expired", name);
            }
            keep
        });
        inner.commissionable.retain(|name, entry| {
            entry.addresses.retain(|_, a| a.expires_at_ms > now);
            let keep = entry.expires_at_ms > now && !entry.addresses.is_empty();
            if !keep {
                log::debug!("commissionable record {} expired", name);
            }
            keep
        });
    }

    /// Ingest one mdns message received on `interface`.
    pub fn handle_dns_message(&self, msg: DnsMessage, interface: &str) {
        if !msg.message_type.is_response() {
            return;
        }
        let records: Vec<DnsRecord> = msg
            .answers
            .iter()
            .chain(msg.additionals.iter())
            .cloned()
            .collect();

        let mut inner = self.inner.lock().unwrap();
        let mut followups: Vec<DnsQuery> = Vec::new();
        // (query id, device identifier) pairs whose waiters may fire
        let mut resolved: Vec<(String, String)> = Vec::new();

        for rr in &records {
            if rr.ttl == 0 {
                Self::apply_goodbye(&mut inner, rr);
                continue;
            }
            let lower = rr.name.to_lowercase();
            if lower.ends_with(SERVICE_OPERATIONAL) && lower != SERVICE_OPERATIONAL {
                self.ingest_operational(&mut inner, rr, &records, interface, &mut followups);
                if inner
                    .operational
                    .get(&rr.name)
                    .map(|e| !e.addresses.is_empty())
                    .unwrap_or(false)
                {
                    resolved.push((rr.name.clone(), rr.name.clone()));
                }
            } else if lower.ends_with(SERVICE_COMMISSIONABLE)
                && lower != SERVICE_COMMISSIONABLE
                && !lower.contains("._sub.")
            {
                Self::ingest_commissionable(&mut inner, rr, &records, interface);
                if let Some(query_id) = Self::commissionable_query_id(&inner, &rr.name) {
                    resolved.push((query_id, rr.name.clone()));
                }
            }
        }

        for (query_id, device_id) in resolved {
            Self::resolve_waiter(&mut inner, &query_id, Some(&device_id));
        }
        drop(inner);

        if !followups.is_empty() {
            let mut q = DnsMessage::new(MessageType::Query);
            q.queries = followups;
            if let Ok(bytes) = dns::encode_message(&q) {
                let _ = self.send_tx.send(bytes);
            }
        }
    }

    fn apply_goodbye(inner: &mut ScannerInner, rr: &DnsRecord) {
        match &rr.value {
            RecordValue::A(ip) => {
                let ip = IpAddr::V4(*ip);
                for entry in inner.operational.values_mut() {
                    entry.addresses.remove(&ip);
                }
                for entry in inner.commissionable.values_mut() {
                    entry.addresses.remove(&ip);
                }
            }
            RecordValue::Aaaa(ip) => {
                let ip = IpAddr::V6(*ip);
                for entry in inner.operational.values_mut() {
                    entry.addresses.remove(&ip);
                }
                for entry in inner.commissionable.values_mut() {
                    entry.addresses.remove(&ip);
                }
            }
            _ => {
                log::debug!("goodbye for {}", rr.name);
                inner.operational.remove(&rr.name);
                inner.commissionable.remove(&rr.name);
            }
        }
    }

    /// Collect the addresses of `target` visible in this message or in the
    /// known answers accumulated on the active queries.
    fn collect_addresses(
        inner: &ScannerInner,
        records: &[DnsRecord],
        target: &str,
        port: u16,
        interface: &str,
    ) -> Vec<(IpAddr, AddressEntry)> {
        let now = timer::now_ms();
        let mut out = Vec::new();
        let known = inner
            .active_queries
            .iter()
            .flat_map(|aq| aq.known_answers.iter());
        for rr in records.iter().chain(known) {
            if rr.ttl == 0 || !rr.name.eq_ignore_ascii_case(target) {
                continue;
            }
            let ip = match &rr.value {
                RecordValue::A(ip) => IpAddr::V4(*ip),
                RecordValue::Aaaa(ip) => IpAddr::V6(*ip),
                _ => continue,
            };
            out.push((
                ip,
                AddressEntry {
                    port,
                    interface: interface.to_owned(),
                    expires_at_ms: now + rr.ttl as u64 * 1000,
                },
            ));
        }
        out
    }

    fn ingest_operational(
        &self,
        inner: &mut ScannerInner,
        rr: &DnsRecord,
        records: &[DnsRecord],
        interface: &str,
        followups: &mut Vec<DnsQuery>,
    ) {
        let now = timer::now_ms();
        match &rr.value {
            RecordValue::Txt(entries) => {
                let entry = inner.operational.entry(rr.name.clone()).or_default();
                entry.data = parse_txt_entries(entries);
                entry.expires_at_ms = now + rr.ttl as u64 * 1000;
            }
            RecordValue::Srv { port, target, .. } => {
                let addresses =
                    Self::collect_addresses(inner, records, target, *port, interface);
                let has_waiter = inner.waiters.contains_key(&rr.name);
                let entry = inner.operational.entry(rr.name.clone()).or_default();
                entry.expires_at_ms = now + rr.ttl as u64 * 1000;
                for (ip, addr) in addresses {
                    entry.addresses.insert(ip, addr);
                }
                if entry.addresses.is_empty() && has_waiter {
                    // the answer did not carry the glue; chase the hostname
                    followups.push(DnsQuery::new(target, TYPE_AAAA));
                    if self.enable_ipv4 {
                        followups.push(DnsQuery::new(target, TYPE_A));
                    }
                }
            }
            _ => {}
        }
    }

    fn ingest_commissionable(
        inner: &mut ScannerInner,
        rr: &DnsRecord,
        records: &[DnsRecord],
        interface: &str,
    ) {
        let now = timer::now_ms();
        match &rr.value {
            RecordValue::Txt(entries) => {
                let data = parse_txt_entries(entries);
                let mut long_discriminator = None;
                let mut short_discriminator = None;
                let mut commissioning_mode = None;
                for entry in entries {
                    let Some((key, value)) = entry.split_once('=') else {
                        continue;
                    };
                    match key {
                        "D" => long_discriminator = value.parse::<u16>().ok(),
                        "SD" => short_discriminator = value.parse::<u8>().ok(),
                        "CM" => commissioning_mode = value.parse::<u8>().ok(),
                        _ => {}
                    }
                }
                // D and CM are mandatory for a commissionable record
                let (Some(d), Some(cm)) = (long_discriminator, commissioning_mode) else {
                    log::debug!("dropping commissionable {} without D/CM", rr.name);
                    return;
                };
                let sd = short_discriminator.unwrap_or(((d >> 8) & 0x0f) as u8);
                let (vendor_id, product_id) = match &data.vendor_product {
                    Some(vp) => {
                        let mut split = vp.split('+');
                        (
                            split.next().and_then(|v| v.parse().ok()),
                            split.next().and_then(|p| p.parse().ok()),
                        )
                    }
                    None => (None, None),
                };
                let txt = CommissionableTxt {
                    long_discriminator: d,
                    short_discriminator: sd,
                    commissioning_mode: cm,
                    vendor_id,
                    product_id,
                    data,
                };
                match inner.commissionable.get_mut(&rr.name) {
                    Some(entry) => {
                        entry.txt = txt;
                        entry.expires_at_ms = now + rr.ttl as u64 * 1000;
                    }
                    None => {
                        inner.commissionable.insert(
                            rr.name.clone(),
                            CommissionableEntry {
                                txt,
                                addresses: HashMap::new(),
                                expires_at_ms: now + rr.ttl as u64 * 1000,
                            },
                        );
                    }
                }
            }
            RecordValue::Srv { port, target, .. } => {
                let addresses =
                    Self::collect_addresses(inner, records, target, *port, interface);
                if let Some(entry) = inner.commissionable.get_mut(&rr.name) {
                    entry.expires_at_ms = now + rr.ttl as u64 * 1000;
                    for (ip, addr) in addresses {
                        entry.addresses.insert(ip, addr);
                    }
                }
            }
            _ => {}
        }
    }

    /// Which active query does a freshly completed commissionable record
    /// satisfy? Tried in priority order; the first registered query wins.
    fn commissionable_query_id(inner: &ScannerInner, instance_qname: &str) -> Option<String> {
        let entry = inner.commissionable.get(instance_qname)?;
        if entry.addresses.is_empty() {
            return None;
        }
        let txt = &entry.txt;
        let mut candidates = vec![
            instance_qname.to_owned(),
            CommissionableIdentity::LongDiscriminator(txt.long_discriminator).query_id(),
            CommissionableIdentity::ShortDiscriminator(txt.short_discriminator).query_id(),
        ];
        if let Some(v) = txt.vendor_id {
            candidates.push(CommissionableIdentity::Vendor(v).query_id());
        }
        if let Some(t) = txt.data.device_type {
            candidates.push(CommissionableIdentity::DeviceType(t).query_id());
        }
        if let Some(p) = txt.product_id {
            candidates.push(CommissionableIdentity::Product(p).query_id());
        }
        candidates.push(CommissionableIdentity::CommissioningMode.query_id());
        candidates
            .into_iter()
            .find(|c| inner.active_queries.iter().any(|aq| &aq.query_id == c))
    }

    fn resolve_waiter(inner: &mut ScannerInner, query_id: &str, device_identifier: Option<&str>) {
        let resolve = match inner.waiters.get(query_id) {
            None => return,
            Some(w) if !w.resolve_on_updated_records => match device_identifier {
                Some(id) => !w.known_ids.contains(id),
                None => false,
            },
            Some(_) => true,
        };
        if resolve {
            if let Some(w) = inner.waiters.remove(query_id) {
                let _ = w.tx.send(());
            }
        }
    }

    fn register_waiter(
        &self,
        query_id: &str,
        has_timeout: bool,
        resolve_on_updated_records: bool,
        known_ids: HashSet<String>,
    ) -> Result<oneshot::Receiver<()>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.waiters.contains_key(query_id) {
            return Err(MatterError::Implementation(format!(
                "waiter already registered for {}",
                query_id
            ))
            .into());
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(
            query_id.to_owned(),
            Waiter {
                tx,
                has_timeout,
                resolve_on_updated_records,
                known_ids,
            },
        );
        Ok(rx)
    }

    /// Await a waiter until it is resolved or the timeout fires. A closed
    /// scanner surfaces as an implementation error.
    async fn await_waiter(
        &self,
        rx: oneshot::Receiver<()>,
        timeout_secs: Option<u64>,
    ) -> Result<()> {
        let outcome = match timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), rx).await {
                Err(_) => return Ok(()), // timeout resolves with cache content
                Ok(r) => r,
            },
            None => rx.await,
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(_) => Err(MatterError::Implementation("scanner is closing".into()).into()),
        }
    }

    fn operational_from_cache(&self, qname: &str) -> Option<OperationalDevice> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.operational.get(qname)?;
        if entry.addresses.is_empty() {
            return None;
        }
        let mut addresses: Vec<DeviceAddress> = entry
            .addresses
            .iter()
            .map(|(ip, a)| DeviceAddress {
                ip: *ip,
                port: a.port,
                interface: a.interface.clone(),
            })
            .collect();
        sort_addresses(&mut addresses);
        Some(OperationalDevice {
            device_identifier: qname.to_owned(),
            addresses,
            discovery_data: entry.data.clone(),
        })
    }

    fn commissionable_from_cache(
        &self,
        identity: &CommissionableIdentity,
    ) -> Vec<CommissionableDevice> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (qname, entry) in &inner.commissionable {
            if entry.addresses.is_empty() {
                continue;
            }
            let txt = &entry.txt;
            let mut addresses: Vec<DeviceAddress> = entry
                .addresses
                .iter()
                .map(|(ip, a)| DeviceAddress {
                    ip: *ip,
                    port: a.port,
                    interface: a.interface.clone(),
                })
                .collect();
            sort_addresses(&mut addresses);
            let device = CommissionableDevice {
                device_identifier: qname.clone(),
                instance_id: qname
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_owned(),
                long_discriminator: txt.long_discriminator,
                short_discriminator: txt.short_discriminator,
                commissioning_mode: txt.commissioning_mode,
                vendor_id: txt.vendor_id,
                product_id: txt.product_id,
                device_type: txt.data.device_type,
                device_name: txt.data.device_name.clone(),
                pairing_hint: txt.data.pairing_hint,
                addresses,
                discovery_data: txt.data.clone(),
            };
            if identity.matches(&device) {
                out.push(device);
            }
        }
        out
    }

    /// Find a commissioned node, waiting up to `timeout_secs` for mdns
    /// answers. Returns None when nothing was discovered in time.
    pub async fn find_operational_device(
        &self,
        fabric: &Fabric,
        node_id: u64,
        timeout_secs: Option<u64>,
    ) -> Result<Option<OperationalDevice>> {
        self.check_open()?;
        let qname = operational_instance_name(fabric, node_id)?;
        if let Some(found) = self.operational_from_cache(&qname) {
            return Ok(Some(found));
        }
        let rx = self.register_waiter(&qname, timeout_secs.is_some(), true, HashSet::new())?;
        self.set_query_records(&qname, vec![DnsQuery::new(&qname, TYPE_SRV)], Vec::new());
        let waited = self.await_waiter(rx, timeout_secs).await;
        let result = self.operational_from_cache(&qname);
        self.remove_query(&qname);
        waited?;
        Ok(result)
    }

    /// Resolve a pending operational discovery immediately; the caller gets
    /// whatever the cache currently holds.
    pub fn cancel_operational_device_discovery(&self, fabric: &Fabric, node_id: u64) {
        if let Ok(qname) = operational_instance_name(fabric, node_id) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(w) = inner.waiters.remove(&qname) {
                let _ = w.tx.send(());
            }
        }
    }

    /// Discover commissionable devices matching `identity`.
    pub async fn find_commissionable_devices(
        &self,
        identity: &CommissionableIdentity,
        timeout_secs: Option<u64>,
    ) -> Result<Vec<CommissionableDevice>> {
        self.check_open()?;
        let cached = self.commissionable_from_cache(identity);
        if !cached.is_empty() {
            return Ok(cached);
        }
        let query_id = identity.query_id();
        let timeout = timeout_secs.unwrap_or(DEFAULT_COMMISSIONABLE_TIMEOUT_SECS);
        let rx = self.register_waiter(&query_id, true, true, HashSet::new())?;
        self.set_query_records(&query_id, identity.queries(), Vec::new());
        let waited = self.await_waiter(rx, Some(timeout)).await;
        let result = self.commissionable_from_cache(identity);
        self.remove_query(&query_id);
        waited?;
        Ok(result)
    }

    /// Long-running discovery window: `on_discovered` fires exactly once per
    /// distinct device identifier as matches arrive.
    pub async fn find_commissionable_devices_continuously(
        &self,
        identity: &CommissionableIdentity,
        timeout_secs: Option<u64>,
        mut on_discovered: impl FnMut(CommissionableDevice),
    ) -> Result<Vec<CommissionableDevice>> {
        self.check_open()?;
        let query_id = identity.query_id();
        let window = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_CONTINUOUS_TIMEOUT_SECS));
        let deadline = tokio::time::Instant::now() + window;
        let mut reported: HashSet<String> = HashSet::new();
        let mut all: Vec<CommissionableDevice> = Vec::new();

        self.set_query_records(&query_id, identity.queries(), Vec::new());
        loop {
            for device in self.commissionable_from_cache(identity) {
                if reported.insert(device.device_identifier.clone()) {
                    on_discovered(device.clone());
                    all.push(device);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            // resolve only on identifiers we have not reported yet
            let rx =
                self.register_waiter(&query_id, true, false, reported.clone())?;
            let waited = self
                .await_waiter(rx, Some(remaining.as_secs().max(1)))
                .await;
            if waited.is_err() {
                self.remove_query(&query_id);
                return waited.map(|_| all);
            }
            if self.closing.load(Ordering::Acquire) {
                break;
            }
        }
        self.remove_query(&query_id);
        Ok(all)
    }

    /// Resolve a pending commissionable discovery immediately.
    pub fn cancel_commissionable_device_discovery(&self, identity: &CommissionableIdentity) {
        let query_id = identity.query_id();
        let mut inner = self.inner.lock().unwrap();
        if let Some(w) = inner.waiters.remove(&query_id) {
            let _ = w.tx.send(());
        }
    }

    /// Stop all timers and loops. Waiters with a timeout are resolved (their
    /// callers see the current cache), waiters without one are dropped.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.cancel.cancel();
        let mut inner = self.inner.lock().unwrap();
        for (_, w) in inner.waiters.drain() {
            if w.has_timeout {
                let _ = w.tx.send(());
            }
            // timerless waiters are dropped; their receivers observe closure
        }
        inner.active_queries.clear();
        inner.next_send_at_ms = None;
    }
}

/// Build the announce-cycle packets: one message chain holding every active
/// query's questions and known answers, split at the 1500-byte budget with
/// TC=1 on every packet but the last.
fn build_query_packets(active_queries: &[ActiveQuery]) -> Result<Vec<Vec<u8>>> {
    const HEADER_SIZE: usize = 12;
    let mut questions: Vec<DnsQuery> = Vec::new();
    let mut answers: Vec<DnsRecord> = Vec::new();
    for aq in active_queries {
        for q in &aq.queries {
            if !questions.contains(q) {
                questions.push(q.clone());
            }
        }
        answers.extend(aq.known_answers.iter().cloned());
    }

    let mut packets: Vec<DnsMessage> = Vec::new();
    let mut current = DnsMessage::new(MessageType::Query);
    let mut current_size = HEADER_SIZE;
    for q in questions {
        let mut buf = Vec::new();
        dns::encode_query(&q, &mut buf)?;
        current_size += buf.len();
        current.queries.push(q);
    }
    for rr in answers {
        let size = dns::record_size(&rr)?;
        if current_size + size > MAX_MDNS_MESSAGE_SIZE {
            if current_size == HEADER_SIZE {
                // a single known answer larger than the mtu: emit it anyway
                log::warn!(
                    "known answer for {} exceeds the mdns message budget ({} bytes)",
                    rr.name,
                    size
                );
                current.answers.push(rr);
                current_size += size;
                continue;
            }
            current.message_type = MessageType::TruncatedQuery;
            packets.push(std::mem::replace(
                &mut current,
                DnsMessage::new(MessageType::Query),
            ));
            current_size = HEADER_SIZE + size;
            current.answers.push(rr);
        } else {
            current_size += size;
            current.answers.push(rr);
        }
    }
    packets.push(current);

    packets.iter().map(dns::encode_message).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{CLASS_IN as IN, TYPE_TXT};

    fn scanner() -> Arc<MatterScanner> {
        MatterScanner::with_sender(false).0
    }

    fn txt(name: &str, entries: &[&str], ttl: u32) -> DnsRecord {
        DnsRecord {
            name: name.to_owned(),
            typ: TYPE_TXT,
            class: IN,
            ttl,
            value: RecordValue::Txt(entries.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn srv(name: &str, target: &str, port: u16, ttl: u32) -> DnsRecord {
        DnsRecord {
            name: name.to_owned(),
            typ: TYPE_SRV,
            class: IN,
            ttl,
            value: RecordValue::Srv {
                priority: 0,
                weight: 0,
                port,
                target: target.to_owned(),
            },
        }
    }

    fn aaaa(name: &str, ip: &str, ttl: u32) -> DnsRecord {
        DnsRecord {
            name: name.to_owned(),
            typ: TYPE_AAAA,
            class: IN,
            ttl,
            value: RecordValue::Aaaa(ip.parse().unwrap()),
        }
    }

    fn response(answers: Vec<DnsRecord>, additionals: Vec<DnsRecord>) -> DnsMessage {
        let mut m = DnsMessage::new(MessageType::Response);
        m.answers = answers;
        m.additionals = additionals;
        m
    }

    const OP_QNAME: &str = "A1B2C3D4E5F60718-00000000DEADBEEF._matter._tcp.local";

    fn inject_operational(s: &MatterScanner) {
        s.handle_dns_message(
            response(
                vec![
                    txt(OP_QNAME, &["SII=500", "SAI=300", "T=1"], 4500),
                    srv(OP_QNAME, "node.local", 5540, 120),
                ],
                vec![aaaa("node.local", "fe80::1", 120)],
            ),
            "eth0",
        );
    }

    #[tokio::test]
    async fn test_operational_discovery_happy_path() {
        let s = scanner();
        inject_operational(&s);
        let found = s.operational_from_cache(OP_QNAME).unwrap();
        assert_eq!(found.addresses.len(), 1);
        assert_eq!(found.addresses[0].port, 5540);
        assert_eq!(found.addresses[0].to_display(), "fe80::1%eth0");
        assert_eq!(found.discovery_data.session_idle_interval_ms, Some(500));
        assert_eq!(found.discovery_data.tcp_supported, Some(1));

        // record was cached unsolicited, the finder returns it immediately
        let fabric = Fabric::generate(1, 0x77, 0x11).unwrap();
        let qname = operational_instance_name(&fabric, 0x11).unwrap();
        assert_ne!(qname, OP_QNAME);
        assert!(s
            .find_operational_device(&fabric, 0x11, Some(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_waiter_resolution_on_late_answer() {
        let s = scanner();
        let fabric = Fabric::generate(1, 0x77, 0x11).unwrap();
        let qname = operational_instance_name(&fabric, 0xDEAD).unwrap();

        let s2 = s.clone();
        let qname2 = qname.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            s2.handle_dns_message(
                response(
                    vec![srv(&qname2, "late.local", 5540, 120)],
                    vec![aaaa("late.local", "fd00::7", 120)],
                ),
                "eth1",
            );
        });

        let found = s
            .find_operational_device(&fabric, 0xDEAD, Some(5))
            .await
            .unwrap()
            .expect("device discovered by waiter");
        assert_eq!(found.addresses[0].ip, "fd00::7".parse::<IpAddr>().unwrap());
        // active query cleaned up afterwards
        assert!(s.inner.lock().unwrap().active_queries.is_empty());
        assert!(s.inner.lock().unwrap().waiters.is_empty());
    }

    #[tokio::test]
    async fn test_goodbye_removes_record() {
        let s = scanner();
        inject_operational(&s);
        assert!(s.operational_from_cache(OP_QNAME).is_some());
        s.handle_dns_message(
            response(vec![srv(OP_QNAME, "node.local", 5540, 0)], vec![]),
            "eth0",
        );
        assert!(s.operational_from_cache(OP_QNAME).is_none());
    }

    #[tokio::test]
    async fn test_goodbye_removes_single_address() {
        let s = scanner();
        s.handle_dns_message(
            response(
                vec![srv(OP_QNAME, "node.local", 5540, 120)],
                vec![
                    aaaa("node.local", "fe80::1", 120),
                    aaaa("node.local", "fd00::2", 120),
                ],
            ),
            "eth0",
        );
        assert_eq!(s.operational_from_cache(OP_QNAME).unwrap().addresses.len(), 2);
        s.handle_dns_message(
            response(vec![aaaa("node.local", "fe80::1", 0)], vec![]),
            "eth0",
        );
        let left = s.operational_from_cache(OP_QNAME).unwrap();
        assert_eq!(left.addresses.len(), 1);
        assert_eq!(left.addresses[0].ip, "fd00::2".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_cache_sweep_expires() {
        let s = scanner();
        s.handle_dns_message(
            response(
                vec![srv(OP_QNAME, "node.local", 5540, 0x7fff_ffff)],
                vec![aaaa("node.local", "fd00::2", 0)],
            ),
            "eth0",
        );
        // the only address arrived as a goodbye, so nothing was stored
        assert!(s.operational_from_cache(OP_QNAME).is_none());

        inject_operational(&s);
        // expire the address by hand, then sweep
        {
            let mut inner = s.inner.lock().unwrap();
            for e in inner.operational.values_mut() {
                for a in e.addresses.values_mut() {
                    a.expires_at_ms = 0;
                }
            }
        }
        s.sweep_cache();
        assert!(s.operational_from_cache(OP_QNAME).is_none());
    }

    #[tokio::test]
    async fn test_commissionable_with_long_discriminator() {
        let s = scanner();
        s.handle_dns_message(
            response(
                vec![
                    txt(
                        "inst1._matterc._udp.local",
                        &["D=3840", "CM=1", "VP=65521+32768"],
                        4500,
                    ),
                    srv("inst1._matterc._udp.local", "host1.local", 5540, 120),
                ],
                vec![aaaa("host1.local", "fd00::2", 120)],
            ),
            "eth0",
        );
        let found = s
            .find_commissionable_devices(
                &CommissionableIdentity::LongDiscriminator(3840),
                Some(1),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(d.instance_id, "inst1");
        assert_eq!(d.short_discriminator, 15);
        assert_eq!(d.vendor_id, Some(65521));
        assert_eq!(d.product_id, Some(32768));
        assert_eq!(d.commissioning_mode, 1);
    }

    #[tokio::test]
    async fn test_commissionable_requires_d_and_cm() {
        let s = scanner();
        s.handle_dns_message(
            response(
                vec![
                    txt("bad1._matterc._udp.local", &["CM=1"], 4500),
                    txt("bad2._matterc._udp.local", &["D=77"], 4500),
                ],
                vec![],
            ),
            "eth0",
        );
        assert!(s.inner.lock().unwrap().commissionable.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_priority_resolution() {
        let s = scanner();
        // register a vendor query; a record matching both _CM and _V must
        // resolve through the vendor query because no instance/L/S query
        // exists
        let identity = CommissionableIdentity::Vendor(55);
        let query_id = identity.query_id();
        let rx = s
            .register_waiter(&query_id, true, true, HashSet::new())
            .unwrap();
        s.set_query_records(&query_id, identity.queries(), Vec::new());
        s.handle_dns_message(
            response(
                vec![
                    txt("i9._matterc._udp.local", &["D=10", "CM=2", "VP=55+9"], 4500),
                    srv("i9._matterc._udp.local", "h9.local", 5540, 120),
                ],
                vec![aaaa("h9.local", "fd00::9", 120)],
            ),
            "eth0",
        );
        tokio::time::timeout(Duration::from_millis(100), rx)
            .await
            .expect("waiter resolved")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_resolves_immediately() {
        let s = scanner();
        let fabric = Arc::new(Fabric::generate(1, 0x77, 0x11).unwrap());
        let s2 = s.clone();
        let f2 = fabric.clone();
        let handle =
            tokio::spawn(async move { s2.find_operational_device(&f2, 0xBEEF, None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.cancel_operational_device_discovery(&fabric, 0xBEEF);
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancel resolves the pending discovery")
            .unwrap()
            .unwrap();
        assert!(result.is_none());

        // a later discovery for the same target works normally
        let found = s
            .find_operational_device(&fabric, 0xBEEF, Some(1))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let s = scanner();
        s.close();
        let fabric = Fabric::generate(1, 0x77, 0x11).unwrap();
        let err = s
            .find_operational_device(&fabric, 1, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(
            MatterError::of(&err),
            Some(MatterError::Implementation(_))
        ));
    }

    #[test]
    fn test_address_sort_order() {
        let mk = |ip: &str| DeviceAddress {
            ip: ip.parse().unwrap(),
            port: 5540,
            interface: "eth0".to_owned(),
        };
        let mut addrs = vec![
            mk("10.0.0.1"),
            mk("2001:db8::1"),
            mk("fe80::1"),
            mk("fd00::1"),
            mk("2001:db8::2"),
        ];
        sort_addresses(&mut addrs);
        let order: Vec<String> = addrs.iter().map(|a| a.ip.to_string()).collect();
        assert_eq!(
            order,
            vec!["fd00::1", "fe80::1", "2001:db8::1", "2001:db8::2", "10.0.0.1"]
        );
    }

    #[test]
    fn test_announce_interval_doubles_and_resets() {
        let s = scanner();
        s.set_query_records(
            "q1",
            vec![DnsQuery::new("x.local", TYPE_SRV)],
            Vec::new(),
        );
        assert_eq!(s.announce_interval_ms(), 1500);
        s.run_send_cycle();
        assert_eq!(s.announce_interval_ms(), 3000);
        s.run_send_cycle();
        assert_eq!(s.announce_interval_ms(), 6000);
        for _ in 0..20 {
            s.run_send_cycle();
        }
        assert_eq!(s.announce_interval_ms(), MAX_ANNOUNCE_INTERVAL_MS);

        // new query tuple resets the schedule
        s.set_query_records(
            "q1",
            vec![DnsQuery::new("y.local", TYPE_SRV)],
            Vec::new(),
        );
        assert_eq!(s.announce_interval_ms(), 1500);

        // identical union does not
        s.run_send_cycle();
        s.set_query_records(
            "q1",
            vec![DnsQuery::new("y.local", TYPE_SRV)],
            Vec::new(),
        );
        assert_eq!(s.announce_interval_ms(), 3000);
    }

    #[test]
    fn test_truncated_query_split_at_mtu() {
        let s = scanner();
        // 40 queries with bulky known answers totaling well over one mtu
        for i in 0..40 {
            let name = format!("svc{}.example.local", i);
            let answers = vec![DnsRecord {
                name: name.clone(),
                typ: TYPE_TXT,
                class: IN,
                ttl: 4500,
                value: RecordValue::Txt(vec!["x".repeat(60), "k=v".to_owned()]),
            }];
            s.set_query_records(
                &format!("q{}", i),
                vec![DnsQuery::new(&name, TYPE_SRV)],
                answers,
            );
        }
        let packets = s.run_send_cycle();
        assert!(packets.len() >= 2, "expected a split, got {}", packets.len());
        for p in &packets {
            assert!(p.len() <= MAX_MDNS_MESSAGE_SIZE, "packet size {}", p.len());
        }
        for (i, p) in packets.iter().enumerate() {
            let msg = dns::decode_message(p).unwrap();
            if i + 1 < packets.len() {
                assert_eq!(msg.message_type, MessageType::TruncatedQuery);
            } else {
                assert_eq!(msg.message_type, MessageType::Query);
            }
        }
    }

    #[test]
    fn test_followup_address_query_when_glue_missing() {
        let (s, mut rx) = MatterScanner::with_sender(true);
        let query_id = OP_QNAME;
        let _waiter = s
            .register_waiter(query_id, true, true, HashSet::new())
            .unwrap();
        // srv without any A/AAAA glue
        s.handle_dns_message(
            response(vec![srv(OP_QNAME, "elsewhere.local", 5540, 120)], vec![]),
            "eth0",
        );
        let packet = rx.try_recv().expect("follow-up query emitted");
        let msg = dns::decode_message(&packet).unwrap();
        assert_eq!(msg.message_type, MessageType::Query);
        let types: Vec<u16> = msg.queries.iter().map(|q| q.typ).collect();
        assert!(types.contains(&TYPE_AAAA));
        assert!(types.contains(&TYPE_A)); // ipv4 enabled here
        assert!(msg.queries.iter().all(|q| q.name == "elsewhere.local"));
    }

    #[tokio::test]
    async fn test_continuous_discovery_reports_once_per_device() {
        let s = scanner();
        s.handle_dns_message(
            response(
                vec![
                    txt("c1._matterc._udp.local", &["D=5", "CM=1"], 4500),
                    srv("c1._matterc._udp.local", "h1.local", 5540, 120),
                ],
                vec![aaaa("h1.local", "fd00::1", 120)],
            ),
            "eth0",
        );
        let s2 = s.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            // duplicate of c1 plus a new device
            s2.handle_dns_message(
                response(
                    vec![
                        txt("c1._matterc._udp.local", &["D=5", "CM=1"], 4500),
                        srv("c1._matterc._udp.local", "h1.local", 5540, 120),
                        txt("c2._matterc._udp.local", &["D=6", "CM=1"], 4500),
                        srv("c2._matterc._udp.local", "h2.local", 5540, 120),
                    ],
                    vec![
                        aaaa("h1.local", "fd00::1", 120),
                        aaaa("h2.local", "fd00::2", 120),
                    ],
                ),
                "eth0",
            );
        });

        let mut seen = Vec::new();
        let all = s
            .find_commissionable_devices_continuously(
                &CommissionableIdentity::CommissioningMode,
                Some(1),
                |d| seen.push(d.device_identifier),
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&"c1._matterc._udp.local".to_owned()));
        assert!(seen.contains(&"c2._matterc._udp.local".to_owned()));
    }
}
