use chrono::{DateTime, LocalResult, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_types::ToolRef;

use crate::SchedError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Daily,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ok,
    Error,
}

/// Persisted unit of recurring work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub schedule_type: ScheduleType,
    /// Local wall-clock time, `HH:MM`.
    pub time: String,
    pub tool_ref: ToolRef,
    pub tool_input: Value,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<JobStatus>,
    #[serde(default)]
    pub last_output_preview: Option<String>,
}

impl ScheduledJob {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.schedule_type == ScheduleType::Daily && self.next_run_at <= now
    }
}

pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Parse `HH:MM` in `00:00`..=`23:59`.
pub fn parse_hhmm(raw: &str) -> Result<NaiveTime, SchedError> {
    let invalid = || SchedError::InvalidTime(raw.to_string());
    let s = raw.trim();
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return Err(invalid());
    }
    if !bytes[..2].iter().chain(&bytes[3..]).all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    let hour: u32 = s[..2].parse().map_err(|_| invalid())?;
    let minute: u32 = s[3..].parse().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0)
        .filter(|_| hour < 24 && minute < 60)
        .ok_or_else(invalid)
}

/// Next instant strictly after `now` whose wall-clock time in `tz` is `at`.
pub fn next_daily_run<Tz: TimeZone>(at: NaiveTime, now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let mut date = now.with_timezone(tz).date_naive();
    // a DST gap can swallow one day's occurrence; three days always finds one
    for _ in 0..3 {
        let naive = date.and_time(at);
        let local = match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => Some(t),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => tz
                .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest(),
        };
        if let Some(candidate) = local.map(|t| t.with_timezone(&Utc)) {
            if candidate > now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now + chrono::Duration::days(1)
}
