//! Dynamic DNS hook.
//!
//! The engine decides when forward and reverse records should change; the
//! record transport belongs to a [`DdnsUpdater`] implementation. Failures are
//! logged by the caller and never abort a lease transition.

use std::net::IpAddr;

use tracing::debug;

use crate::error::Result;
use crate::message::ClientId;

/// A DNS change for one leased address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdnsRequest {
    pub fqdn: String,
    pub ip: IpAddr,
    pub client_id: ClientId,
    /// Record TTL in seconds, normally the valid lifetime.
    pub lifetime: u32,
}

/// Performs forward (name to address) and reverse (address to name) updates.
pub trait DdnsUpdater: Send + Sync {
    fn update(&self, request: &DdnsRequest) -> Result<()>;

    fn delete(&self, request: &DdnsRequest) -> Result<()>;
}

/// Updater that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDdns;

impl DdnsUpdater for NoopDdns {
    fn update(&self, request: &DdnsRequest) -> Result<()> {
        debug!("DDNS update skipped: {} -> {}", request.fqdn, request.ip);
        Ok(())
    }

    fn delete(&self, request: &DdnsRequest) -> Result<()> {
        debug!("DDNS delete skipped: {} -> {}", request.fqdn, request.ip);
        Ok(())
    }
}
