//! Next-window calculation.
//!
//! A lineage pulls vendor data in bounded windows. Each tick asks for the next
//! window given the most recent run record:
//!
//! - no history: start `past_minutes` before now
//! - last run completed: resume from its `end` (with a small overlap) when
//!   that leaves a gap, otherwise start `past_minutes` before now
//! - last run still running or failed: retry from its own `start`
//!
//! The upper bound is now (less `buffer_now_minutes`), and a window is never
//! wider than `max_window_minutes`; a larger backlog drains across ticks.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    GrabberError, RunFilter, RunRecord, RunStatus, default_zone, format_record_time,
    parse_record_time,
};

/// Overlap re-included when resuming after a completed run.
pub const DEFAULT_COVER_TIME_RANGE_MINUTES: i64 = 1;

/// Inputs of the window calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// How far back from now the default lower bound sits.
    pub past_minutes: i64,
    /// Hard cap on the span of a single window.
    pub max_window_minutes: i64,
    /// Pull the upper bound back from now by this much.
    pub buffer_now_minutes: i64,
    /// Overlap applied when resuming after a completed run.
    pub cover_time_range_minutes: i64,
    /// Narrows which record counts as "last" beyond the lineage.
    pub last_log_filter: Option<RunFilter>,
    /// Zone record boundaries are expressed in.
    pub zone: FixedOffset,
}

impl WindowConfig {
    pub fn new(past_minutes: i64, max_window_minutes: i64) -> Self {
        Self {
            past_minutes,
            max_window_minutes,
            buffer_now_minutes: 0,
            cover_time_range_minutes: DEFAULT_COVER_TIME_RANGE_MINUTES,
            last_log_filter: None,
            zone: default_zone(),
        }
    }

    pub fn with_buffer_now_minutes(mut self, minutes: i64) -> Self {
        self.buffer_now_minutes = minutes;
        self
    }

    pub fn with_cover_time_range_minutes(mut self, minutes: i64) -> Self {
        self.cover_time_range_minutes = minutes;
        self
    }

    pub fn with_last_log_filter(mut self, filter: RunFilter) -> Self {
        self.last_log_filter = Some(filter);
        self
    }

    pub fn with_zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }

    /// Reject values that cannot describe a window.
    pub fn validate(&self) -> Result<(), GrabberError> {
        let non_negative = [
            ("past_minutes", self.past_minutes),
            ("buffer_now_minutes", self.buffer_now_minutes),
            ("cover_time_range_minutes", self.cover_time_range_minutes),
        ];
        for (name, value) in non_negative {
            if value < 0 {
                return Err(GrabberError::InvalidConfig(format!(
                    "{} must be >= 0, got {}",
                    name, value
                )));
            }
        }
        if self.max_window_minutes <= 0 {
            return Err(GrabberError::InvalidConfig(format!(
                "max_window_minutes must be > 0, got {}",
                self.max_window_minutes
            )));
        }
        Ok(())
    }
}

/// A `[start, end]` range to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl Window {
    pub fn start_timestamp(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_timestamp(&self) -> i64 {
        self.end.timestamp()
    }

    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }

    /// True when the window covers no time (start at or after end).
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// `start` in the text form stored on run records.
    pub fn start_field(&self) -> String {
        format_record_time(&self.start)
    }

    /// `end` in the text form stored on run records.
    pub fn end_field(&self) -> String {
        format_record_time(&self.end)
    }
}

/// Compute the next window for a lineage whose most recent record is `last`.
pub fn compute_window(
    now: DateTime<Utc>,
    config: &WindowConfig,
    last: Option<&RunRecord>,
) -> Result<Window, GrabberError> {
    config.validate()?;

    let now = now.with_timezone(&config.zone);
    let proposed_start = shift_back(now, config.past_minutes)?;
    let upper_bound = shift_back(now, config.buffer_now_minutes)?;

    let start = match last {
        None => proposed_start,
        Some(last) => resume_start(last, proposed_start, config)?,
    };

    let mut end = upper_bound;
    if (end - start).num_minutes() >= config.max_window_minutes {
        end = start
            .checked_add_signed(minutes(config.max_window_minutes)?)
            .ok_or_else(|| out_of_range("max_window_minutes"))?;
    }

    let window = Window { start, end };
    if window.is_empty() {
        warn!(
            start = %window.start,
            end = %window.end,
            "computed window is empty; start is not before the upper bound"
        );
    } else {
        debug!(start = %window.start, end = %window.end, "computed next window");
    }
    Ok(window)
}

/// Lower bound when there is a prior record to resume from.
fn resume_start(
    last: &RunRecord,
    proposed_start: DateTime<FixedOffset>,
    config: &WindowConfig,
) -> Result<DateTime<FixedOffset>, GrabberError> {
    let last_start = record_time(last, "start", Some(&last.start), &config.zone)?;
    let checkpoint = match last.status {
        RunStatus::Complete => record_time(last, "end", last.end.as_deref(), &config.zone)?,
        RunStatus::Running | RunStatus::Fail => last_start,
    };

    let mut start = if checkpoint < proposed_start {
        match last.status {
            RunStatus::Complete => checkpoint
                .checked_sub_signed(minutes(config.cover_time_range_minutes)?)
                .ok_or_else(|| out_of_range("cover_time_range_minutes"))?,
            RunStatus::Running | RunStatus::Fail => last_start,
        }
    } else {
        proposed_start
    };

    // A failed window is retried in full.
    if last.status == RunStatus::Fail {
        start = start.min(last_start);
    }

    Ok(start)
}

fn record_time(
    record: &RunRecord,
    field: &'static str,
    value: Option<&str>,
    zone: &FixedOffset,
) -> Result<DateTime<FixedOffset>, GrabberError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GrabberError::MissingField {
            id: record.id.clone(),
            field,
        })?;
    parse_record_time(value, zone).ok_or_else(|| GrabberError::MalformedTimestamp {
        id: record.id.clone(),
        field,
        value: value.to_string(),
    })
}

fn shift_back(at: DateTime<FixedOffset>, mins: i64) -> Result<DateTime<FixedOffset>, GrabberError> {
    at.checked_sub_signed(minutes(mins)?)
        .ok_or_else(|| out_of_range("minutes"))
}

fn minutes(mins: i64) -> Result<TimeDelta, GrabberError> {
    TimeDelta::try_minutes(mins).ok_or_else(|| out_of_range("minutes"))
}

fn out_of_range(what: &str) -> GrabberError {
    GrabberError::InvalidConfig(format!("{} moves the window out of the representable range", what))
}
