//! Matter node protocol engine
//!
//! This library implements the two core subsystems a matter node needs to
//! reach and authenticate its peers. Library uses asynchronous Rust and
//! depends on Tokio. Following are the main parts of the api:
//! - [MdnsService](service::MdnsService) - joins the mdns multicast groups and runs the
//!   [MatterScanner](scanner::MatterScanner) (discovery of operational and
//!   commissionable devices with ttl-driven caching and waiters) and the
//!   [MdnsResponder](responder::MdnsResponder) (advertisement of this node's
//!   services with known-answer suppression).
//! - [case] - CASE session establishment: the certificate-authenticated
//!   sigma1/sigma2/sigma3 exchange including session resumption, run over a
//!   [MessageExchange](exchange::MessageExchange) on an unsecured
//!   [Transport](transport::Transport) connection. Successful handshakes
//!   produce a [SecureSession](session::SecureSession) registered with the
//!   [SessionManager](session::SessionManager).
//! - [FabricStore](fabric::FabricStore) - the commissioned operational
//!   credentials CASE authenticates against.
//! - [tlv] - matter tlv encoders and decoders.
//! - [dns] - DNS/mDNS wire codec with name-compression aware decoding.
//!
//! Example: discover a commissioned node and establish a CASE session to it:
//! ```no_run
//! # use std::sync::Arc;
//! # use anyhow::Result;
//! # use matn::{case, config, exchange, fabric, service, session, transport};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let fabric = Arc::new(fabric::Fabric::generate(1, 0x2906, 0x11)?);
//! let peer_node_id = 0x22;
//!
//! let mdns = service::MdnsService::start(&config::NodeConfig::default())?;
//! let device = mdns
//!     .scanner
//!     .find_operational_device(&fabric, peer_node_id, Some(5))
//!     .await?
//!     .expect("peer is on the network");
//! let address = &device.addresses[0];
//!
//! let sessions = session::SessionManager::new();
//! let resumptions: Arc<dyn session::ResumptionStore> = session::MemResumptionStore::new();
//! let transport = transport::Transport::new("[::]:5540").await?;
//! let connection = transport.create_connection((address.ip, address.port).into());
//! let exchange = exchange::MessageExchange::new(connection, rand::random(), true);
//! let session =
//!     case::establish(fabric, sessions, resumptions, peer_node_id, &exchange).await?;
//! let encrypted = session.encode_message(b"first secured payload")?;
//! # let _ = encrypted;
//! # Ok(())
//! # }
//! ```

pub mod case;
pub mod cert_matter;
pub mod config;
pub mod dns;
pub mod error;
pub mod exchange;
pub mod fabric;
pub mod messages;
pub mod multicast;
pub mod responder;
pub mod scanner;
pub mod service;
pub mod session;
pub mod timer;
pub mod tlv;
pub mod transport;
mod util;
