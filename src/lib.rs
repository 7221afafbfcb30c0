//! # dhcpcore
//!
//! The lease engine of a DHCPv4/DHCPv6 server: address and prefix pools,
//! client bindings, and the per-message rules that move them through their
//! lifecycle (RFC 2131, RFC 8415).
//!
//! ## Features
//!
//! - DHCPv6 Solicit, Request, Renew, Rebind, Release, Decline, Confirm and
//!   Information-Request; DHCPv4 Discover, Request, Release, Decline, Inform
//! - IA_NA, IA_TA and IA_PD bindings with prefix delegation
//! - Static reservations by DUID, MAC address or client identifier
//! - Layered policies and options (global, link, pool) with client filters
//! - Rapid Commit for both protocols
//! - Pluggable lease stores; in-memory and JSON file stores included
//! - Background expiry of leases
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dhcpcore::{Config, JsonFileStore, MessageHandler, NoopDdns, ServerContext};
//!
//! #[tokio::main]
//! async fn main() -> dhcpcore::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let store = Arc::new(JsonFileStore::open(&config.leases_file).await?);
//!     let context = ServerContext::build(config, store, Arc::new(NoopDdns), None).await?;
//!     let context = Arc::new(context);
//!     let _reapers = context.start_reapers();
//!     let handler = MessageHandler::new(context);
//!     // Feed decoded messages to handler.handle_v4 / handler.handle_v6.
//!     # let _ = handler;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - JSON configuration: links, pools, reservations, policies
//! - [`ServerContext`] - Links, policies, store and binding managers built
//!   from a configuration
//! - [`MessageHandler`] - Dispatches decoded messages to their processors
//! - [`BindingManager`] - Creates, renews, releases and expires bindings
//! - [`IaStore`] - Lease persistence ([`MemoryStore`], [`JsonFileStore`])

pub mod binding;
pub mod config;
pub mod context;
pub mod ddns;
pub mod error;
pub mod file_store;
pub mod free_pool;
pub mod handler;
pub mod link;
pub mod manager;
pub mod message;
pub mod options;
pub mod policy;
pub mod pool;
pub mod processor;
pub mod range;
pub mod reaper;
pub mod static_binding;
pub mod store;

pub use config::Config;
pub use context::ServerContext;
pub use ddns::{DdnsRequest, DdnsUpdater, NoopDdns};
pub use error::{Error, Result};
pub use file_store::JsonFileStore;
pub use handler::MessageHandler;
pub use manager::{BindingManager, ClientRequest};
pub use message::{ClientId, DhcpV4Message, DhcpV6Message, IaOption};
pub use options::{DhcpOption, StatusCode};
pub use pool::ReachabilityProbe;
pub use range::AddressRange;
pub use store::{IaKey, IaStore, IaType, IdentityAssoc, LeaseState, MemoryStore};
