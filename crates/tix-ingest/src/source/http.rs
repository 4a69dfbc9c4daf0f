//! Ticketing REST API client
//!
//! One [`TicketApi`] (and therefore one connection pool) is built per run and
//! shared by every batch task. Each request waits `request_delay` first to
//! stay under the upstream rate limit.

use super::{PagedSource, RawItem, Resource};
use crate::config::{HttpConfig, Tenant};
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Ticket statuses included in every ticket query
pub const TICKET_STATUS_FILTER: &str = "VALID,DETAILSREQUIRED";

/// How long an idle keep-alive connection stays in the pool
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const USER_AGENT: &str = concat!("tix-ingest/", env!("CARGO_PKG_VERSION"));

/// Envelope shared by the list endpoints
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub rows: Vec<RawItem>,
    pub total: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TicketApi {
    client: Client,
    request_delay: Duration,
}

impl TicketApi {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            request_delay: config.request_delay,
        })
    }

    /// Paged source over one resource, sharing this client's pool
    pub fn source(&self, resource: Resource) -> HttpSource {
        HttpSource {
            api: self.clone(),
            resource,
        }
    }

    async fn get_page(
        &self,
        tenant: &Tenant,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Page> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let url = format!("{}/{}", tenant.base_url, path);
        debug!(url = %url, ?query, "GET");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&tenant.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| IngestError::Malformed(format!("{url}: {e}")))
    }

    /// One window of `resource`, filtered to the tenant's event
    pub async fn fetch(
        &self,
        tenant: &Tenant,
        resource: Resource,
        offset: u64,
        limit: u64,
    ) -> Result<Page> {
        let mut query = match resource {
            Resource::Tickets => vec![("status", TICKET_STATUS_FILTER.to_string())],
            Resource::Coupons => vec![("active", "true".to_string())],
        };
        query.extend([
            ("eventId", tenant.event_id.clone()),
            ("skip", offset.to_string()),
            ("top", limit.to_string()),
        ]);

        let path = match resource {
            Resource::Tickets => "tickets",
            Resource::Coupons => "coupon/rich",
        };
        self.get_page(tenant, path, &query).await
    }

    /// The tenant's event record. A tenant whose event is not listed
    /// upstream cannot be ingested, so that is a permanent failure.
    pub async fn event(&self, tenant: &Tenant) -> Result<RawItem> {
        let page = self.get_page(tenant, "events", &[]).await?;
        page.rows
            .into_iter()
            .find(|event| {
                event.get("_id").and_then(|id| id.as_str()) == Some(tenant.event_id.as_str())
            })
            .ok_or_else(|| {
                IngestError::permanent(format!(
                    "event {} not found for tenant {}",
                    tenant.event_id, tenant.region
                ))
            })
    }
}

/// [`PagedSource`] over a single resource of the ticketing API
#[derive(Debug, Clone)]
pub struct HttpSource {
    api: TicketApi,
    resource: Resource,
}

#[async_trait]
impl PagedSource for HttpSource {
    async fn total(&self, tenant: &Tenant) -> Result<u64> {
        let page = self.api.fetch(tenant, self.resource, 0, 1).await?;
        page.total.ok_or_else(|| {
            IngestError::Malformed(format!("{} response without 'total'", self.resource))
        })
    }

    async fn page(&self, tenant: &Tenant, offset: u64, limit: u64) -> Result<Vec<RawItem>> {
        Ok(self.api.fetch(tenant, self.resource, offset, limit).await?.rows)
    }
}
