//! Run log types.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::GrabberError;

/// Collection the run records live in unless configured otherwise.
pub const DEFAULT_COLLECTION: &str = "grabber_log";

/// Text form of `start`/`end` boundaries stored on a run record.
pub const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Record keys an extra field may not use.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "vendor_code",
    "agent",
    "record_type",
    "operator_code",
    "status",
    "start",
    "end",
    "fail_count",
    "error",
    "created_at",
    "updated_at",
];

/// Offset of the default record zone (UTC+08:00).
const DEFAULT_ZONE_OFFSET_SECS: i32 = 8 * 3600;

/// Zone record boundaries are written and read in unless configured otherwise.
pub fn default_zone() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_ZONE_OFFSET_SECS).expect("UTC+08:00 is a valid offset")
}

/// Parse a stored boundary in the given zone.
pub fn parse_record_time(value: &str, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), RECORD_TIME_FORMAT).ok()?;
    zone.from_local_datetime(&naive).single()
}

/// Format a boundary the way it is stored on a run record.
pub fn format_record_time(at: &DateTime<FixedOffset>) -> String {
    at.format(RECORD_TIME_FORMAT).to_string()
}

/// Status of a single grab attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The attempt is in flight.
    Running,
    /// The attempt finished and its window is covered.
    Complete,
    /// The attempt failed; its window must be retried.
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one independent sequence of grab windows.
///
/// `agent`, `record_type` and `operator_code` are optional; empty values are
/// left out of history lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Vendor (game provider) code.
    pub vendor_code: String,
    /// Agent line, e.g. an operator code or a named line.
    #[serde(default)]
    pub agent: String,
    /// Vendor endpoint or record family, e.g. `settled_status`.
    #[serde(default)]
    pub record_type: String,
    /// Operator the records belong to.
    #[serde(default)]
    pub operator_code: String,
}

impl Lineage {
    pub fn new(vendor_code: impl Into<String>) -> Self {
        Self {
            vendor_code: vendor_code.into(),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = record_type.into();
        self
    }

    pub fn with_operator_code(mut self, operator_code: impl Into<String>) -> Self {
        self.operator_code = operator_code.into();
        self
    }

    /// Filter selecting every record of this lineage.
    pub fn filter(&self) -> RunFilter {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        RunFilter {
            vendor_code: Some(self.vendor_code.clone()),
            agent: non_empty(&self.agent),
            record_type: non_empty(&self.record_type),
            operator_code: non_empty(&self.operator_code),
            ..RunFilter::default()
        }
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vendor_code)?;
        for part in [&self.agent, &self.record_type, &self.operator_code] {
            if !part.is_empty() {
                write!(f, "/{}", part)?;
            }
        }
        Ok(())
    }
}

/// Caller-supplied fields merged into a record at creation or closing time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunExtra {
    /// Upper boundary of the window this attempt covered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Error message describing a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Any other fields to persist verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RunExtra {
    pub fn with_end(mut self, end: impl Into<String>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Reject extra fields that would collide with a record field when stored.
    pub fn check_fields(&self) -> Result<(), GrabberError> {
        match self
            .fields
            .keys()
            .find(|key| RESERVED_FIELDS.contains(&key.as_str()))
        {
            Some(key) => Err(GrabberError::InvalidConfig(format!(
                "extra field `{}` is reserved",
                key
            ))),
            None => Ok(()),
        }
    }
}

/// One persisted grab attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Store-assigned identifier.
    pub id: String,
    pub vendor_code: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub operator_code: String,
    pub status: RunStatus,
    /// Lower boundary, in [`RECORD_TIME_FORMAT`].
    #[serde(default)]
    pub start: String,
    /// Upper boundary, in [`RECORD_TIME_FORMAT`], when the caller supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Consecutive failures in the lineage; only set on escalated failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Materialize a new record as a store would persist it.
    pub fn from_new(id: String, new: NewRunRecord, now: DateTime<Utc>) -> Self {
        let NewRunRecord {
            lineage,
            status,
            start,
            extra,
        } = new;
        let mut record = Self {
            id,
            vendor_code: lineage.vendor_code,
            agent: lineage.agent,
            record_type: lineage.record_type,
            operator_code: lineage.operator_code,
            status,
            start,
            end: None,
            fail_count: None,
            error: None,
            fields: Map::new(),
            created_at: now,
            updated_at: now,
        };
        record.merge_extra(extra);
        record
    }

    pub fn lineage(&self) -> Lineage {
        Lineage {
            vendor_code: self.vendor_code.clone(),
            agent: self.agent.clone(),
            record_type: self.record_type.clone(),
            operator_code: self.operator_code.clone(),
        }
    }

    /// Apply a status update the way a store does.
    pub fn apply(&mut self, patch: RunPatch, now: DateTime<Utc>) {
        self.status = patch.status;
        if let Some(count) = patch.fail_count {
            self.fail_count = Some(count);
        }
        self.merge_extra(patch.extra);
        self.updated_at = now;
    }

    fn merge_extra(&mut self, extra: RunExtra) {
        if let Some(end) = extra.end {
            self.end = Some(end);
        }
        if let Some(error) = extra.error {
            self.error = Some(error);
        }
        self.fields.extend(extra.fields);
    }
}

/// A record to insert; the store assigns `id` and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunRecord {
    pub lineage: Lineage,
    pub status: RunStatus,
    pub start: String,
    pub extra: RunExtra,
}

/// A status transition written to an existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPatch {
    pub status: RunStatus,
    pub fail_count: Option<u32>,
    pub extra: RunExtra,
}

/// Equality filter for history lookups. Unset parts match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    /// Skip this record id, e.g. the attempt currently being closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_id: Option<String>,
    /// Required values of extra fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl RunFilter {
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn excluding(mut self, id: impl Into<String>) -> Self {
        self.exclude_id = Some(id.into());
        self
    }

    /// Narrow this filter with every constraint set on `other`.
    pub fn merged(mut self, other: &RunFilter) -> Self {
        let pick = |own: &mut Option<String>, theirs: &Option<String>| {
            if theirs.is_some() {
                own.clone_from(theirs);
            }
        };
        pick(&mut self.vendor_code, &other.vendor_code);
        pick(&mut self.agent, &other.agent);
        pick(&mut self.record_type, &other.record_type);
        pick(&mut self.operator_code, &other.operator_code);
        pick(&mut self.exclude_id, &other.exclude_id);
        if other.status.is_some() {
            self.status = other.status;
        }
        self.fields
            .extend(other.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn matches(&self, record: &RunRecord) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);

        eq(&self.vendor_code, &record.vendor_code)
            && eq(&self.agent, &record.agent)
            && eq(&self.record_type, &record.record_type)
            && eq(&self.operator_code, &record.operator_code)
            && self.status.is_none_or(|s| s == record.status)
            && self.exclude_id.as_deref() != Some(record.id.as_str())
            && self
                .fields
                .iter()
                .all(|(k, v)| record.fields.get(k) == Some(v))
    }
}
