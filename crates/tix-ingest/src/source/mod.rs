//! Upstream paged data
//!
//! A [`PagedSource`] answers two questions for one resource of one tenant:
//! how many items exist, and what a given `(offset, limit)` window contains.
//! Both calls apply the same filter, so the windows planned from `total`
//! line up with what `page` returns.

pub mod http;

pub use http::{HttpSource, TicketApi};

use crate::config::Tenant;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One item exactly as the upstream API returned it
pub type RawItem = serde_json::Value;

/// Paged collections ingested per tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Tickets,
    Coupons,
}

impl Resource {
    pub const ALL: [Resource; 2] = [Resource::Tickets, Resource::Coupons];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tickets => "tickets",
            Self::Coupons => "coupons",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Resource {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tickets" | "ticket" => Ok(Self::Tickets),
            "coupons" | "coupon" => Ok(Self::Coupons),
            other => Err(IngestError::config(format!("unknown resource '{other}'"))),
        }
    }
}

#[async_trait]
pub trait PagedSource: Send + Sync {
    /// Total number of items matching the filter, from a single cheap call
    async fn total(&self, tenant: &Tenant) -> Result<u64>;

    /// Items `offset..offset + limit` under the same filter as [`total`]
    ///
    /// [`total`]: PagedSource::total
    async fn page(&self, tenant: &Tenant, offset: u64, limit: u64) -> Result<Vec<RawItem>>;
}
