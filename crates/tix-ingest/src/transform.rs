//! Raw upstream JSON to typed upsert rows
//!
//! Transforms are pure: they never touch the network or the database. A
//! record that cannot be transformed is rejected with a [`RecordError`] and
//! counted by the caller; it never fails the batch it belongs to.

use crate::config::Tenant;
use crate::source::{RawItem, Resource};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why a single record was skipped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("record belongs to event {actual}, expected {expected}")]
    EventMismatch { expected: String, actual: String },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A typed column value. Nulls keep their type so they bind correctly.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(Option<String>),
    Int(Option<i64>),
    Bool(Option<bool>),
    Timestamp(Option<DateTime<Utc>>),
    Json(Option<Value>),
}

/// Target table and conflict handling for one kind of row.
///
/// `columns` lists every column written, in the order of
/// [`UpsertRow::values`]. On conflict every column outside `conflict_key`
/// is overwritten with the incoming value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertSpec {
    pub table: &'static str,
    pub conflict_key: &'static [&'static str],
    pub columns: &'static [&'static str],
}

impl UpsertSpec {
    pub fn update_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .copied()
            .filter(|c| !self.conflict_key.contains(c))
    }
}

/// One row ready to upsert; `id` is the upstream natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRow {
    pub id: String,
    pub values: Vec<ColumnValue>,
}

pub trait RecordTransform: Send + Sync {
    fn spec(&self) -> &'static UpsertSpec;

    fn transform(&self, tenant: &Tenant, raw: &RawItem) -> Result<UpsertRow, RecordError>;
}

/// Rows that transformed cleanly plus how many records were skipped
#[derive(Debug, Default)]
pub struct TransformOutcome {
    pub rows: Vec<UpsertRow>,
    pub rejected: u64,
}

/// Transform a fetched page, skipping (and counting) invalid records.
pub fn transform_all(
    transform: &dyn RecordTransform,
    tenant: &Tenant,
    items: &[RawItem],
) -> TransformOutcome {
    let mut outcome = TransformOutcome {
        rows: Vec::with_capacity(items.len()),
        rejected: 0,
    };
    for item in items {
        match transform.transform(tenant, item) {
            Ok(row) => outcome.rows.push(row),
            Err(err) => {
                let id = item.get("_id").and_then(Value::as_str).unwrap_or("<none>");
                debug!(
                    table = transform.spec().table,
                    id,
                    error = %err,
                    "Skipping record"
                );
                outcome.rejected += 1;
            },
        }
    }
    outcome
}

/// The transform for a paged resource
pub fn for_resource(resource: Resource) -> Arc<dyn RecordTransform> {
    match resource {
        Resource::Tickets => Arc::new(TicketTransform::new()),
        Resource::Coupons => Arc::new(CouponTransform),
    }
}

// ============================================================================
// Field helpers
// ============================================================================

fn text(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required(raw: &Value, key: &'static str) -> Result<String, RecordError> {
    text(raw, key).ok_or(RecordError::MissingField(key))
}

fn flag(raw: &Value, key: &str) -> Option<bool> {
    raw.get(key).and_then(Value::as_bool)
}

fn timestamp(raw: &Value, key: &str) -> Option<DateTime<Utc>> {
    let s = raw.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `Male` / `Female` from the first word of a free-text (often bilingual)
/// answer such as `"Female 女性"`.
pub fn standardize_gender(value: Option<&str>) -> Option<&'static str> {
    let first = value?.split_whitespace().next()?.to_lowercase();
    match first.as_str() {
        "male" | "men" | "man" => Some("Male"),
        "female" | "woman" | "women" => Some("Female"),
        _ => None,
    }
}

/// `true` / `false` from answers that start with `Yes` / `No`.
pub fn normalize_yes_no(value: Option<&str>) -> Option<bool> {
    let first = value?.split_whitespace().next()?.to_lowercase();
    match first.as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// How a registrant answered the training club question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GymMembership {
    /// Member of a club in another territory
    MemberOther,
    Member,
    NotMember,
}

impl GymMembership {
    /// Match the known answer phrases anywhere in the text, most specific first.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        let normalized = value?.trim().to_lowercase().replace('\u{2019}', "'");
        if normalized.contains("i'm a member of another") {
            Some(Self::MemberOther)
        } else if normalized.contains("i'm a member") {
            Some(Self::Member)
        } else if normalized.contains("i'm not a member") {
            Some(Self::NotMember)
        } else {
            None
        }
    }
}

/// Free-text club names reduced to letters, digits and single spaces.
/// Placeholder answers (`NA`, `none`, `other`, ...) and single characters
/// become `None`.
pub fn normalize_free_text(value: Option<&str>) -> Option<String> {
    let cleaned: String = value?
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();
    let normalized = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() <= 1 {
        return None;
    }
    match normalized.to_lowercase().as_str() {
        "na" | "none" | "no" | "nil" | "other" => None,
        _ => Some(normalized),
    }
}

/// Club name for the registrant's membership answer
pub fn gym_affiliate(extra: &Value) -> Option<String> {
    let field = |key: &str| extra.get(key).and_then(Value::as_str);
    match GymMembership::parse(field("hyrox_training_clubs"))? {
        GymMembership::MemberOther => {
            normalize_free_text(field("hyrox_training_club_other_territory_name"))
        },
        GymMembership::Member => normalize_free_text(field("local_territory_training_club")),
        GymMembership::NotMember => normalize_free_text(field("gym_club_community")),
    }
}

/// Where the registrant's club is; only known for members
pub fn gym_affiliate_location(extra: &Value) -> Option<String> {
    let key = match GymMembership::parse(extra.get("hyrox_training_clubs").and_then(Value::as_str))? {
        GymMembership::MemberOther => "region_training",
        GymMembership::Member => "local_territory_training",
        GymMembership::NotMember => return None,
    };
    text(extra, key)
}

/// Whole years between `birth` and `today`
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i64 {
    let mut age = i64::from(today.year() - birth.year());
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}

/// Coarse ticket grouping derived from the ticket name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketCategory {
    Single,
    Double,
    Relay,
    Spectator,
    Extra,
}

impl TicketCategory {
    pub fn from_ticket_name(name: &str) -> Self {
        let name = name.to_lowercase();
        let has = |needle: &str| name.contains(needle);
        if has("friend") || has("sportograf") || has("transfer") || has("complimentary") {
            Self::Extra
        } else if has("double") {
            Self::Double
        } else if has("relay") {
            Self::Relay
        } else if has("spectator") {
            Self::Spectator
        } else {
            Self::Single
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
            Self::Relay => "relay",
            Self::Spectator => "spectator",
            Self::Extra => "extra",
        }
    }
}

// ============================================================================
// Tickets
// ============================================================================

pub static TICKETS: UpsertSpec = UpsertSpec {
    table: "tickets",
    conflict_key: &["id", "region_schema"],
    columns: &[
        "id",
        "region_schema",
        "event_id",
        "transaction_id",
        "ticket_type_id",
        "ticket_name",
        "ticket_category",
        "category_name",
        "status",
        "currency",
        "personalized",
        "expired",
        "barcode",
        "city",
        "country",
        "customer_id",
        "gender",
        "birthday",
        "age",
        "nationality",
        "region_of_residence",
        "is_returning_athlete",
        "is_returning_athlete_to_city",
        "is_gym_affiliate",
        "gym_affiliate",
        "gym_affiliate_location",
        "created_at",
        "updated_at",
    ],
};

#[derive(Debug, Clone)]
pub struct TicketTransform {
    today: NaiveDate,
}

impl TicketTransform {
    pub fn new() -> Self {
        Self::as_of(Utc::now().date_naive())
    }

    /// Compute ages relative to a fixed date
    pub fn as_of(today: NaiveDate) -> Self {
        Self { today }
    }
}

impl Default for TicketTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordTransform for TicketTransform {
    fn spec(&self) -> &'static UpsertSpec {
        &TICKETS
    }

    fn transform(&self, tenant: &Tenant, raw: &RawItem) -> Result<UpsertRow, RecordError> {
        let id = required(raw, "_id")?;

        let event_id = required(raw, "eventId")?;
        if event_id != tenant.event_id {
            return Err(RecordError::EventMismatch {
                expected: tenant.event_id.clone(),
                actual: event_id,
            });
        }
        let ticket_name = required(raw, "ticketName")?;
        let category = TicketCategory::from_ticket_name(&ticket_name);

        let extra = raw.get("extraFields").cloned().unwrap_or(Value::Null);
        let extra_str = |key: &str| extra.get(key).and_then(Value::as_str);

        let birthday = extra_str("birth_date").filter(|s| !s.is_empty());
        let age = match birthday {
            Some(s) => {
                let birth = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
                    RecordError::Invalid {
                        field: "birth_date",
                        reason: format!("'{s}': {e}"),
                    }
                })?;
                Some(age_on(birth, self.today))
            },
            None => None,
        };

        let values = vec![
            ColumnValue::Text(Some(id.clone())),
            ColumnValue::Text(Some(tenant.schema.clone())),
            ColumnValue::Text(Some(event_id)),
            ColumnValue::Text(text(raw, "transactionId")),
            ColumnValue::Text(text(raw, "ticketTypeId")),
            ColumnValue::Text(Some(ticket_name)),
            ColumnValue::Text(Some(category.as_str().to_string())),
            ColumnValue::Text(text(raw, "categoryName")),
            ColumnValue::Text(text(raw, "status")),
            ColumnValue::Text(text(raw, "currency")),
            ColumnValue::Bool(Some(flag(raw, "personalized").unwrap_or(false))),
            ColumnValue::Bool(Some(flag(raw, "expired").unwrap_or(false))),
            ColumnValue::Text(text(raw, "barcode")),
            ColumnValue::Text(text(raw, "city")),
            ColumnValue::Text(text(raw, "country")),
            ColumnValue::Text(text(raw, "customerId")),
            ColumnValue::Text(standardize_gender(extra_str("gender")).map(str::to_string)),
            ColumnValue::Text(birthday.map(str::to_string)),
            ColumnValue::Int(age),
            ColumnValue::Text(extra_str("nationality").map(str::to_string)),
            ColumnValue::Text(extra_str("region_of_residence").map(str::to_string)),
            ColumnValue::Bool(normalize_yes_no(extra_str("returning_athlete"))),
            ColumnValue::Bool(normalize_yes_no(extra_str("returning_athlete_city"))),
            ColumnValue::Text(text(&extra, "hyrox_training_clubs")),
            ColumnValue::Text(gym_affiliate(&extra)),
            ColumnValue::Text(gym_affiliate_location(&extra)),
            ColumnValue::Timestamp(timestamp(raw, "createdAt")),
            ColumnValue::Timestamp(timestamp(raw, "updatedAt")),
        ];

        Ok(UpsertRow { id, values })
    }
}

// ============================================================================
// Coupons
// ============================================================================

pub static COUPONS: UpsertSpec = UpsertSpec {
    table: "coupons",
    conflict_key: &["id", "region_schema"],
    columns: &[
        "id",
        "region_schema",
        "code",
        "name",
        "active",
        "used",
        "is_used",
        "coupon_series_id",
    ],
};

#[derive(Debug, Clone, Copy, Default)]
pub struct CouponTransform;

impl RecordTransform for CouponTransform {
    fn spec(&self) -> &'static UpsertSpec {
        &COUPONS
    }

    fn transform(&self, tenant: &Tenant, raw: &RawItem) -> Result<UpsertRow, RecordError> {
        let id = required(raw, "_id")?;
        let used = match raw.get("used") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| RecordError::Invalid {
                field: "used",
                reason: format!("expected an integer, got {v}"),
            })?,
        };

        let values = vec![
            ColumnValue::Text(Some(id.clone())),
            ColumnValue::Text(Some(tenant.schema.clone())),
            ColumnValue::Text(Some(text(raw, "code").unwrap_or_default())),
            ColumnValue::Text(text(raw, "name")),
            ColumnValue::Bool(Some(flag(raw, "active").unwrap_or(true))),
            ColumnValue::Int(Some(used)),
            ColumnValue::Bool(Some(used > 0)),
            ColumnValue::Text(text(raw, "couponSeriesId")),
        ];

        Ok(UpsertRow { id, values })
    }
}

// ============================================================================
// Events
// ============================================================================

pub static EVENTS: UpsertSpec = UpsertSpec {
    table: "events",
    conflict_key: &["id", "region_schema"],
    columns: &[
        "id",
        "region_schema",
        "name",
        "seller_id",
        "location_name",
        "start_date",
        "end_date",
        "sell_start",
        "sell_end",
        "timezone",
        "groups",
        "ticket_types",
    ],
};

#[derive(Debug, Clone, Copy, Default)]
pub struct EventTransform;

impl RecordTransform for EventTransform {
    fn spec(&self) -> &'static UpsertSpec {
        &EVENTS
    }

    fn transform(&self, tenant: &Tenant, raw: &RawItem) -> Result<UpsertRow, RecordError> {
        let id = required(raw, "_id")?;

        // Only the id/name pairs of the ticket types are kept
        let ticket_types: Vec<Value> = raw
            .get("tickets")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(|t| {
                        let id = text(t, "_id")?;
                        Some(serde_json::json!({ "id": id, "name": text(t, "name") }))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let values = vec![
            ColumnValue::Text(Some(id.clone())),
            ColumnValue::Text(Some(tenant.schema.clone())),
            ColumnValue::Text(text(raw, "name")),
            ColumnValue::Text(text(raw, "sellerId")),
            ColumnValue::Text(text(raw, "locationName")),
            ColumnValue::Timestamp(timestamp(raw, "start")),
            ColumnValue::Timestamp(timestamp(raw, "end")),
            ColumnValue::Timestamp(timestamp(raw, "sellStart")),
            ColumnValue::Timestamp(timestamp(raw, "sellEnd")),
            ColumnValue::Text(text(raw, "timezone")),
            ColumnValue::Json(Some(raw.get("groups").cloned().unwrap_or(Value::Array(vec![])))),
            ColumnValue::Json(Some(Value::Array(ticket_types))),
        ];

        Ok(UpsertRow { id, values })
    }
}
