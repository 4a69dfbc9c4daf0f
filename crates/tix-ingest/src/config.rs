//! Run configuration
//!
//! Everything a run needs is read once, up front, into [`IngestConfig`] and
//! passed down explicitly. Values come from the process environment (after
//! loading `.env` when present) and fall back to the defaults below.
//!
//! Tenants are declared with one variable per field:
//!
//! ```text
//! EVENT_CONFIGS__EMEA__token=...
//! EVENT_CONFIGS__EMEA__event_id=64f0c...
//! EVENT_CONFIGS__EMEA__schema_name=emea
//! EVENT_CONFIGS__EMEA__base_url=https://vivenu.com/api   # optional
//! ```
//!
//! Other keys under a region (`field_*` mappings, report switches) belong to
//! other tools sharing the same `.env` and are ignored. A region missing its
//! token, event id or schema is skipped with a warning.

use crate::error::{IngestError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of items fetched and committed per batch
pub const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Default number of batches in flight at once
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default number of retries after the first failed attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Default wall-clock ceiling for a single fetch or commit attempt
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 120;

/// Default pause before every upstream request
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 500;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HTTP_MAX_IDLE_PER_HOST: usize = 20;

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_API_BASE_URL: &str = "https://vivenu.com/api";

const TENANT_PREFIX: &str = "EVENT_CONFIGS__";
const SCHEMA_NAME_PATTERN: &str = r"^[a-z_][a-z0-9_]{0,62}$";

static SCHEMA_NAME: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(SCHEMA_NAME_PATTERN));

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub batch: BatchConfig,
    pub tenants: Vec<Tenant>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_idle_per_host: usize,
    pub request_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS),
            max_idle_per_host: DEFAULT_HTTP_MAX_IDLE_PER_HOST,
            request_delay: Duration::from_millis(DEFAULT_REQUEST_DELAY_MS),
        }
    }
}

/// Knobs for planning, concurrency and retry of batches
#[derive(Debug, Clone, Serialize)]
pub struct BatchConfig {
    pub batch_size: u64,
    /// Upper bound on concurrent batch tasks; also the chunk size
    pub max_workers: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub batch_timeout: Duration,
    /// Stop dispatching new chunks once any batch has failed
    pub stop_on_failure: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            batch_timeout: Duration::from_secs(DEFAULT_BATCH_TIMEOUT_SECS),
            stop_on_failure: true,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::config("batch_size must be greater than 0"));
        }
        if self.max_workers == 0 {
            return Err(IngestError::config("max_workers must be greater than 0"));
        }
        if self.base_delay > self.max_delay {
            return Err(IngestError::config(format!(
                "base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        if self.batch_timeout.is_zero() {
            return Err(IngestError::config("batch_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// One upstream event ingested into its own Postgres schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenant {
    /// Key used in the environment, lower-cased
    pub region: String,
    pub schema: String,
    pub event_id: String,
    #[serde(skip)]
    pub token: String,
    pub base_url: String,
}

impl IngestConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let env = Env(&vars);

        let database = DatabaseConfig {
            url: env.required("DATABASE_URL")?,
            max_connections: env.parse_or("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            min_connections: env.parse_or("DB_MIN_CONNECTIONS", DEFAULT_DB_MIN_CONNECTIONS)?,
            acquire_timeout: Duration::from_secs(
                env.parse_or("DB_ACQUIRE_TIMEOUT", DEFAULT_DB_ACQUIRE_TIMEOUT_SECS)?,
            ),
        };

        let http = HttpConfig {
            timeout: Duration::from_secs(env.parse_or("HTTP_TIMEOUT", DEFAULT_HTTP_TIMEOUT_SECS)?),
            connect_timeout: Duration::from_secs(
                env.parse_or("HTTP_CONNECT_TIMEOUT", DEFAULT_HTTP_CONNECT_TIMEOUT_SECS)?,
            ),
            max_idle_per_host: env
                .parse_or("HTTP_MAX_IDLE_PER_HOST", DEFAULT_HTTP_MAX_IDLE_PER_HOST)?,
            request_delay: Duration::from_millis(
                env.parse_or("HTTP_REQUEST_DELAY_MS", DEFAULT_REQUEST_DELAY_MS)?,
            ),
        };

        let batch = BatchConfig {
            batch_size: env.parse_or("BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            max_workers: env.parse_or("BATCH_MAX_WORKERS", DEFAULT_MAX_WORKERS)?,
            max_retries: env.parse_or("BATCH_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            base_delay: Duration::from_millis(
                env.parse_or("BATCH_BASE_DELAY_MS", DEFAULT_BASE_DELAY_MS)?,
            ),
            max_delay: Duration::from_millis(
                env.parse_or("BATCH_MAX_DELAY_MS", DEFAULT_MAX_DELAY_MS)?,
            ),
            batch_timeout: Duration::from_secs(
                env.parse_or("BATCH_TIMEOUT_SECS", DEFAULT_BATCH_TIMEOUT_SECS)?,
            ),
            stop_on_failure: env.parse_or("BATCH_STOP_ON_FAILURE", true)?,
        };

        let default_base_url = vars
            .get("EVENT_API_BASE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let tenants = parse_tenants(&vars, &default_base_url)?;

        let config = Self {
            database,
            http,
            batch,
            tenants,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(IngestError::config("DATABASE_URL must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(IngestError::config("DB_MAX_CONNECTIONS must be greater than 0"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(IngestError::config(format!(
                "DB_MIN_CONNECTIONS ({}) cannot exceed DB_MAX_CONNECTIONS ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        self.batch.validate()?;

        if self.tenants.is_empty() {
            return Err(IngestError::config(format!(
                "no tenants configured; set {TENANT_PREFIX}<region>__token, __event_id and __schema_name"
            )));
        }
        for tenant in &self.tenants {
            validate_schema_name(&tenant.schema)?;
        }
        Ok(())
    }

    /// Tenants whose region is in `regions`, or all when `regions` is empty.
    pub fn select_tenants(&self, regions: &[String]) -> Result<Vec<Tenant>> {
        if regions.is_empty() {
            return Ok(self.tenants.clone());
        }
        regions
            .iter()
            .map(|region| {
                let region = region.to_lowercase();
                self.tenants
                    .iter()
                    .find(|t| t.region == region)
                    .cloned()
                    .ok_or_else(|| IngestError::config(format!("unknown tenant region '{region}'")))
            })
            .collect()
    }
}

/// Reject anything that is not a plain lower-case identifier, since schema
/// names are spliced into SQL.
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let pattern = SCHEMA_NAME
        .as_ref()
        .map_err(|e| IngestError::config(format!("schema name pattern: {e}")))?;
    if !pattern.is_match(schema) {
        return Err(IngestError::config(format!(
            "invalid schema name '{schema}': expected lower-case letters, digits and underscores"
        )));
    }
    Ok(())
}

fn parse_tenants(vars: &HashMap<String, String>, default_base_url: &str) -> Result<Vec<Tenant>> {
    #[derive(Default)]
    struct Partial {
        token: Option<String>,
        event_id: Option<String>,
        schema: Option<String>,
        base_url: Option<String>,
    }

    let mut partials: BTreeMap<String, Partial> = BTreeMap::new();
    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(TENANT_PREFIX) else {
            continue;
        };
        let Some((region, field)) = rest.split_once("__") else {
            warn!(variable = %key, "Ignoring malformed tenant variable");
            continue;
        };
        let entry = partials.entry(region.to_lowercase()).or_default();
        let value = Some(value.trim().to_string());
        match field.to_lowercase().as_str() {
            "token" => entry.token = value,
            "event_id" => entry.event_id = value,
            "schema_name" => entry.schema = value,
            "base_url" => entry.base_url = value,
            other => debug!(region = %region, field = %other, "Ignoring tenant variable"),
        }
    }

    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    let mut tenants = Vec::with_capacity(partials.len());
    for (region, p) in partials {
        let (Some(token), Some(event_id), Some(schema)) =
            (non_empty(p.token), non_empty(p.event_id), non_empty(p.schema))
        else {
            warn!(
                region = %region,
                "Skipping tenant without token, event_id and schema_name"
            );
            continue;
        };
        let base_url = non_empty(p.base_url)
            .unwrap_or_else(|| default_base_url.to_string())
            .trim_end_matches('/')
            .to_string();
        tenants.push(Tenant {
            region,
            schema,
            event_id,
            token,
            base_url,
        });
    }
    Ok(tenants)
}

struct Env<'a>(&'a HashMap<String, String>);

impl Env<'_> {
    fn required(&self, name: &str) -> Result<String> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| tix_common::Error::MissingEnv(name.to_string()).into())
    }

    fn parse_or<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.0.get(name) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| tix_common::Error::invalid_env(name, raw.as_str()).into()),
        }
    }
}
