//! Core domain model for the operations dashboard: raw events, merged
//! entities, daily snapshots and the record processing state machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "opsdash-core";

/// Set-field value that never contributes to a merged set.
pub const UNSPECIFIED: &str = "unspecified";

/// Incoming unit of data before merging: a CSV row, an ingested conversation
/// or a complaint record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub scalars: BTreeMap<String, String>,
    #[serde(default)]
    pub texts: BTreeMap<String, String>,
    #[serde(default)]
    pub sets: BTreeMap<String, Vec<String>>,
}

impl RawEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn with_identifier(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.scalars.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.texts.insert(name.into(), value.into());
        self
    }

    pub fn with_set<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sets
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Identifier value, trimmed; blank values count as absent.
    pub fn identifier(&self, name: &str) -> Option<&str> {
        non_blank(self.identifiers.get(name).map(String::as_str))
    }

    pub fn record_id(&self) -> Option<&str> {
        non_blank(self.record_id.as_deref())
    }

    pub fn category(&self) -> Option<&str> {
        non_blank(self.category.as_deref())
    }

    pub fn scalar(&self, name: &str) -> Option<&str> {
        non_blank(self.scalars.get(name).map(String::as_str))
    }
}

pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Deterministic grouping key derived from the identifiers of a [`RawEvent`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event placed into a [`Period`], with its timestamp already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodMember {
    pub at: DateTime<Utc>,
    pub event: RawEvent,
}

/// Time-windowed group of events sharing an [`IdentityKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub key: IdentityKey,
    /// Zero-based position of this period among the periods of its key.
    pub sequence: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub members: Vec<PeriodMember>,
}

impl Period {
    pub fn open(key: IdentityKey, sequence: usize, member: PeriodMember) -> Self {
        Self {
            key,
            sequence,
            start: member.at,
            end: member.at,
            members: vec![member],
        }
    }

    pub fn push(&mut self, member: PeriodMember) {
        if member.at < self.start {
            self.start = member.at;
        }
        if member.at > self.end {
            self.end = member.at;
        }
        self.members.push(member);
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.members.iter().map(|m| m.at).collect()
    }
}

/// Reconciled record produced from a [`Period`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEntity {
    pub key: IdentityKey,
    pub sequence: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub event_times: Vec<DateTime<Utc>>,
    pub record_ids: Vec<String>,
    pub categories: Vec<String>,
    pub scalars: BTreeMap<String, String>,
    pub texts: BTreeMap<String, String>,
    pub sets: BTreeMap<String, Vec<String>>,
}

impl MergedEntity {
    pub fn scalar(&self, name: &str) -> Option<&str> {
        non_blank(self.scalars.get(name).map(String::as_str))
    }

    pub fn set(&self, name: &str) -> &[String] {
        self.sets.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }

    pub fn event_count(&self) -> usize {
        self.event_times.len()
    }
}

/// Household-deduplicated counts for one dashboard category.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryCount {
    pub total: usize,
    pub converted: usize,
    #[serde(default)]
    pub by_dimension: BTreeMap<String, usize>,
    #[serde(default)]
    pub converted_by_dimension: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total_entities: usize,
    pub total_households: usize,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryCount>,
    /// Per set-valued field (e.g. countries): distinct value -> household count.
    #[serde(default)]
    pub set_breakdowns: BTreeMap<String, BTreeMap<String, usize>>,
}

/// Fixed result schema returned by the external conversation classifier.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(default)]
    pub prospect_services: Vec<String>,
    #[serde(default)]
    pub converted_services: Vec<String>,
    #[serde(default)]
    pub contract_type: Option<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Processing state carried on every snapshot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Processing { run_id: Uuid },
    Success,
    Failed { retryable: bool },
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Success | RecordStatus::Failed { retryable: false }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processing { .. } => "processing",
            RecordStatus::Success => "success",
            RecordStatus::Failed { retryable: true } => "failed_retryable",
            RecordStatus::Failed { retryable: false } => "failed_terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {record_id}: cannot {action} from state {from}")]
pub struct TransitionError {
    pub record_id: String,
    pub action: &'static str,
    pub from: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub event: RawEvent,
    pub status: RecordStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<ClassificationResult>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl SnapshotRecord {
    pub fn pending(id: impl Into<String>, event: RawEvent) -> Self {
        Self {
            id: id.into(),
            event,
            status: RecordStatus::Pending,
            retry_count: 0,
            last_error: None,
            result: None,
            processed_at: None,
        }
    }

    fn reject(&self, action: &'static str) -> TransitionError {
        TransitionError {
            record_id: self.id.clone(),
            action,
            from: self.status.label(),
        }
    }

    /// `failed(retryable) -> pending`.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        match self.status {
            RecordStatus::Failed { retryable: true } => {
                self.status = RecordStatus::Pending;
                Ok(())
            }
            _ => Err(self.reject("requeue")),
        }
    }

    /// `pending -> processing`.
    pub fn claim(&mut self, run_id: Uuid) -> Result<(), TransitionError> {
        match self.status {
            RecordStatus::Pending => {
                self.status = RecordStatus::Processing { run_id };
                Ok(())
            }
            _ => Err(self.reject("claim")),
        }
    }

    pub fn is_claimed_by(&self, run_id: Uuid) -> bool {
        self.status == RecordStatus::Processing { run_id }
    }

    /// `processing -> success`.
    pub fn succeed(
        &mut self,
        run_id: Uuid,
        result: ClassificationResult,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.is_claimed_by(run_id) {
            return Err(self.reject("succeed"));
        }
        self.status = RecordStatus::Success;
        self.result = Some(result);
        self.last_error = None;
        self.processed_at = Some(at);
        Ok(())
    }

    /// `processing -> failed`; terminal once `retry_count` reaches `retry_limit`.
    pub fn fail(
        &mut self,
        run_id: Uuid,
        error: impl Into<String>,
        retry_limit: u32,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.is_claimed_by(run_id) {
            return Err(self.reject("fail"));
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.status = RecordStatus::Failed {
            retryable: self.retry_count < retry_limit,
        };
        self.last_error = Some(error.into());
        self.processed_at = Some(at);
        Ok(())
    }

    /// `processing -> pending` for records a run could not finish.
    pub fn release(&mut self, run_id: Uuid) -> Result<(), TransitionError> {
        if !self.is_claimed_by(run_id) {
            return Err(self.reject("release"));
        }
        self.status = RecordStatus::Pending;
        Ok(())
    }

    /// `processing -> pending` for a record whose run is no longer alive.
    /// Only valid while the caller holds the date's processing slot.
    pub fn abandon(&mut self) -> bool {
        if matches!(self.status, RecordStatus::Processing { .. }) {
            self.status = RecordStatus::Pending;
            return true;
        }
        false
    }

    /// Administrative reset back to `pending`, clearing results and retries.
    pub fn reset(&mut self) {
        self.status = RecordStatus::Pending;
        self.retry_count = 0;
        self.last_error = None;
        self.result = None;
        self.processed_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Processing,
    Success,
    Failed,
}

/// One batch-processing attempt against a [`DailySnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRun {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Claimed records returned to `pending` (budget exhausted or changed underneath).
    pub released: usize,
    pub skipped: usize,
    pub cost_usd: f64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProcessingRun {
    pub fn start(run_id: Uuid, claimed: usize, at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Processing,
            started_at: at,
            completed_at: None,
            claimed,
            succeeded: 0,
            failed: 0,
            released: 0,
            skipped: 0,
            cost_usd: 0.0,
            timed_out: false,
            error: None,
        }
    }
}

/// Date-keyed aggregate document for one day of ingested conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_records: usize,
    pub processed_records: usize,
    #[serde(default)]
    pub success_records: usize,
    #[serde(default)]
    pub failed_records: usize,
    #[serde(default)]
    pub records: Vec<SnapshotRecord>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub runs: Vec<ProcessingRun>,
}

impl DailySnapshot {
    pub fn new(date: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            date: date.into(),
            created_at: at,
            updated_at: at,
            total_records: 0,
            processed_records: 0,
            success_records: 0,
            failed_records: 0,
            records: Vec::new(),
            summary: Summary::default(),
            runs: Vec::new(),
        }
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.records.iter().any(|r| r.id == record_id)
    }

    pub fn record_mut(&mut self, record_id: &str) -> Option<&mut SnapshotRecord> {
        self.records.iter_mut().find(|r| r.id == record_id)
    }

    pub fn run_mut(&mut self, run_id: Uuid) -> Option<&mut ProcessingRun> {
        self.runs.iter_mut().find(|r| r.run_id == run_id)
    }

    pub fn count_in(&self, label: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.status.label() == label)
            .count()
    }

    /// Return records left in `processing` by a dead run to `pending` and
    /// close that run's entry as failed. Returns the number of records moved.
    pub fn recover_abandoned(&mut self, at: DateTime<Utc>) -> usize {
        let recovered = self.records.iter_mut().map(|r| r.abandon()).filter(|moved| *moved).count();
        for run in self.runs.iter_mut().filter(|r| r.status == RunStatus::Processing) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(at);
            run.error = Some("run ended before applying its results".to_string());
        }
        recovered
    }

    /// Recompute the stored counters from record states.
    pub fn refresh_counts(&mut self, at: DateTime<Utc>) {
        self.total_records = self.records.len();
        self.success_records = self.count_in("success");
        self.failed_records = self.count_in("failed_terminal");
        self.processed_records = self.records.iter().filter(|r| r.status.is_terminal()).count();
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("invalid date `{0}`, expected YYYY-MM-DD")]
    Invalid(String),
}

/// Strict `YYYY-MM-DD` parser used for every date-scoped key.
pub fn parse_date(value: &str) -> Result<NaiveDate, DateError> {
    let trimmed = value.trim();
    if trimmed.len() != 10 {
        return Err(DateError::Invalid(value.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| DateError::Invalid(value.to_string()))
}

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Normalise the timestamp spellings seen in uploads to UTC.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (with a space or `T`,
/// interpreted as UTC) and bare `YYYY-MM-DD` (midnight UTC). Returns `None`
/// for anything else; callers decide the fallback.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).single().unwrap()
    }

    #[test]
    fn timestamp_spellings_normalise_to_the_same_instant() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 10, 8, 15, 30).single().unwrap();
        assert_eq!(parse_timestamp("2026-01-10T08:15:30Z"), Some(expected));
        assert_eq!(parse_timestamp("2026-01-10T10:15:30+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-01-10 08:15:30"), Some(expected));
        assert_eq!(
            parse_timestamp("2026-01-10 08:15:30.250").map(|t| t.timestamp()),
            Some(expected.timestamp())
        );
        assert_eq!(
            parse_timestamp("2026-01-10"),
            Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("   "), None);
    }

    #[test]
    fn date_keys_must_be_strict() {
        assert!(parse_date("2026-02-28").is_ok());
        assert!(parse_date("2026-2-28").is_err());
        assert!(parse_date("2026-02-30").is_err());
        assert!(parse_date("../etc").is_err());
    }

    #[test]
    fn record_walks_the_retry_state_machine() {
        let run = Uuid::new_v4();
        let mut record = SnapshotRecord::pending("c-1", RawEvent::new());

        record.claim(run).unwrap();
        record.fail(run, "timeout", 2, ts(2026, 1, 1)).unwrap();
        assert_eq!(record.status, RecordStatus::Failed { retryable: true });

        record.requeue().unwrap();
        let second = Uuid::new_v4();
        record.claim(second).unwrap();
        record.fail(second, "timeout", 2, ts(2026, 1, 1)).unwrap();
        assert_eq!(record.status, RecordStatus::Failed { retryable: false });
        assert!(record.status.is_terminal());
        assert!(record.requeue().is_err());
        assert_eq!(record.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn only_the_claiming_run_may_complete_a_record() {
        let run = Uuid::new_v4();
        let mut record = SnapshotRecord::pending("c-2", RawEvent::new());
        record.claim(run).unwrap();

        let err = record
            .succeed(Uuid::new_v4(), ClassificationResult::default(), ts(2026, 1, 2))
            .unwrap_err();
        assert_eq!(err.from, "processing");

        record.succeed(run, ClassificationResult::default(), ts(2026, 1, 2)).unwrap();
        assert_eq!(record.status, RecordStatus::Success);
        assert!(record.claim(run).is_err());
    }

    #[test]
    fn status_is_serialised_as_a_tagged_field() {
        let json = serde_json::to_value(RecordStatus::Failed { retryable: true }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "retryable": true}));
        let back: RecordStatus = serde_json::from_value(serde_json::json!({"state": "pending"})).unwrap();
        assert_eq!(back, RecordStatus::Pending);
    }

    #[test]
    fn snapshot_counts_follow_record_states() {
        let run = Uuid::new_v4();
        let mut snapshot = DailySnapshot::new("2026-01-10", ts(2026, 1, 10));
        for id in ["a", "b", "c"] {
            snapshot.records.push(SnapshotRecord::pending(id, RawEvent::new()));
        }
        let a = snapshot.record_mut("a").unwrap();
        a.claim(run).unwrap();
        a.succeed(run, ClassificationResult::default(), ts(2026, 1, 10)).unwrap();
        let b = snapshot.record_mut("b").unwrap();
        b.claim(run).unwrap();
        b.fail(run, "bad", 1, ts(2026, 1, 10)).unwrap();

        snapshot.refresh_counts(ts(2026, 1, 11));
        assert_eq!(snapshot.total_records, 3);
        assert_eq!(snapshot.success_records, 1);
        assert_eq!(snapshot.failed_records, 1);
        assert_eq!(snapshot.processed_records, 2);
        assert_eq!(snapshot.count_in("pending"), 1);
    }

    #[test]
    fn abandoned_claims_return_to_pending_and_close_their_run() {
        let dead = Uuid::new_v4();
        let mut snapshot = DailySnapshot::new("2026-01-10", ts(2026, 1, 10));
        for id in ["a", "b", "c"] {
            snapshot.records.push(SnapshotRecord::pending(id, RawEvent::new()));
        }
        snapshot.record_mut("a").unwrap().claim(dead).unwrap();
        snapshot.record_mut("b").unwrap().claim(dead).unwrap();
        let c = snapshot.record_mut("c").unwrap();
        c.claim(dead).unwrap();
        c.succeed(dead, ClassificationResult::default(), ts(2026, 1, 10)).unwrap();
        snapshot.runs.push(ProcessingRun::start(dead, 3, ts(2026, 1, 10)));

        assert_eq!(snapshot.recover_abandoned(ts(2026, 1, 11)), 2);
        assert_eq!(snapshot.count_in("pending"), 2);
        assert_eq!(snapshot.count_in("success"), 1);
        assert_eq!(snapshot.runs[0].status, RunStatus::Failed);
        assert_eq!(snapshot.runs[0].completed_at, Some(ts(2026, 1, 11)));
        assert_eq!(snapshot.recover_abandoned(ts(2026, 1, 12)), 0);
    }
}
