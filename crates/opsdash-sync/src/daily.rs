//! Daily conversation snapshots: ingest, processing runs, reset and delete.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use opsdash_adapters::{fields, normalize_contract_type, ConversationAdapter, SourceAdapter};
use opsdash_core::{
    non_blank, parse_timestamp, ClassificationResult, DailySnapshot, ProcessingRun, RawEvent, RecordStatus,
    RunStatus, SnapshotRecord, Summary,
};
use opsdash_storage::{get_json, put_json, ClassifyItem, ClassifyOutcome, Classifier};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::config::ProcessingSettings;
use crate::identity::resolve_identity;
use crate::profile::MergeProfile;
use crate::rules::DashboardRules;
use crate::{canonical_date, Dashboard, DashboardError};

pub const DAILY_PREFIX: &str = "daily/";

pub fn daily_key(date: &str) -> String {
    format!("{DAILY_PREFIX}{date}.json")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub date: String,
    pub received: usize,
    pub added: usize,
    pub duplicates: usize,
    pub total_records: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Failed records (retryable or terminal) go back to pending.
    #[default]
    Failed,
    /// Every record goes back to pending and loses its result.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    pub date: String,
    pub scope: ResetScope,
    pub reset: usize,
}

/// Fold the classifier's answer into the conversation event. Values already
/// on the event win over classifier guesses.
pub fn classified_event(event: &RawEvent, result: &ClassificationResult) -> RawEvent {
    let mut event = event.clone();
    for (field, values) in [
        (fields::PROSPECT_SERVICES, &result.prospect_services),
        (fields::CONVERTED_SERVICES, &result.converted_services),
        (fields::COUNTRIES, &result.countries),
    ] {
        if values.is_empty() {
            continue;
        }
        let set = event.sets.entry(field.to_string()).or_default();
        for value in values {
            if !set.contains(value) {
                set.push(value.clone());
            }
        }
    }
    if event.scalar(fields::CONTRACT_TYPE).is_none() {
        if let Some(contract_type) = result.contract_type.as_deref().and_then(normalize_contract_type) {
            event
                .scalars
                .insert(fields::CONTRACT_TYPE.to_string(), contract_type);
        }
    }
    if event.category().is_none() {
        if let Some(skill) = non_blank(result.skill.as_deref()) {
            event.scalars.insert(fields::SKILL.to_string(), skill.to_string());
            event.category = Some(skill.to_string());
        }
    }
    event
}

/// Summary over the successfully classified records of a snapshot. Records
/// without a timestamp are placed at midnight of the snapshot's date.
pub fn conversation_summary(snapshot: &DailySnapshot, rules: &DashboardRules) -> Summary {
    let events = snapshot
        .records
        .iter()
        .filter(|r| r.status == RecordStatus::Success)
        .filter_map(|r| r.result.as_ref().map(|result| classified_event(&r.event, result)))
        .collect::<Vec<_>>();
    let fallback = parse_timestamp(&snapshot.date).unwrap_or(snapshot.created_at);
    let entities = MergeProfile::conversations().merge(events, fallback);
    aggregate(&entities, &rules.aggregator)
}

fn classify_text(event: &RawEvent) -> String {
    event
        .texts
        .get(fields::MESSAGE)
        .cloned()
        .unwrap_or_default()
}

enum Applied {
    Succeeded,
    Failed,
    Released,
}

struct ClassifiedBatch {
    outcomes: HashMap<String, Result<ClassificationResult, String>>,
    timed_out: bool,
}

/// Fan the items out in `batch_size` chunks with at most `max_in_flight`
/// requests outstanding. Stops collecting at the budget deadline; items
/// without an outcome are simply absent from the map.
async fn classify_bounded(
    classifier: Arc<dyn Classifier>,
    items: Vec<ClassifyItem>,
    settings: &ProcessingSettings,
) -> ClassifiedBatch {
    let deadline = tokio::time::Instant::now() + settings.budget;
    let limit = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
    let mut tasks = JoinSet::new();

    for chunk in items.chunks(settings.batch_size.max(1)) {
        let batch = chunk.to_vec();
        let classifier = classifier.clone();
        let limit = limit.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await;
            let response = classifier.classify(&batch).await;
            (batch, response)
        });
    }

    let mut outcomes = HashMap::new();
    let mut timed_out = false;
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok((batch, Ok(results))))) => {
                let mut by_id: HashMap<String, ClassifyOutcome> =
                    results.into_iter().map(|o| (o.id.clone(), o)).collect();
                for item in batch {
                    let outcome = match by_id.remove(&item.id) {
                        Some(outcome) => outcome.into_result(),
                        None => Err("classifier returned no result for this record".to_string()),
                    };
                    outcomes.insert(item.id, outcome);
                }
            }
            Ok(Some(Ok((batch, Err(err))))) => {
                warn!(error = %err, items = batch.len(), "classifier batch failed");
                for item in batch {
                    outcomes.insert(item.id, Err(err.to_string()));
                }
            }
            Ok(Some(Err(err))) => {
                warn!(error = %err, "classifier task aborted");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(remaining = tasks.len(), "processing budget exhausted");
                tasks.abort_all();
                timed_out = true;
                break;
            }
        }
    }

    ClassifiedBatch {
        outcomes,
        timed_out,
    }
}

impl Dashboard {
    async fn load_snapshot(&self, date: &str) -> Result<Option<DailySnapshot>, DashboardError> {
        Ok(get_json::<DailySnapshot>(self.store.as_ref(), &daily_key(date)).await?)
    }

    async fn save_snapshot(&self, snapshot: &DailySnapshot) -> Result<(), DashboardError> {
        put_json(self.store.as_ref(), &daily_key(&snapshot.date), snapshot).await?;
        Ok(())
    }

    /// Append conversation rows to the date's snapshot as `pending` records.
    /// Records already present (same record id) are left untouched.
    pub async fn ingest_conversations(
        &self,
        date: &str,
        rows: &[JsonValue],
    ) -> Result<IngestReport, DashboardError> {
        let date = canonical_date(date)?;
        let events = ConversationAdapter.normalize_rows(rows)?;

        let _guard = self.locks.write_guard(&date).await;
        let now = Utc::now();
        let mut snapshot = self
            .load_snapshot(&date)
            .await?
            .unwrap_or_else(|| DailySnapshot::new(date.clone(), now));

        let (mut added, mut duplicates) = (0, 0);
        for event in events {
            let id = event
                .record_id()
                .map(ToString::to_string)
                .unwrap_or_else(|| resolve_identity(&event).to_string());
            if snapshot.contains(&id) {
                duplicates += 1;
                continue;
            }
            snapshot.records.push(SnapshotRecord::pending(id, event));
            added += 1;
        }
        snapshot.refresh_counts(now);
        self.save_snapshot(&snapshot).await?;

        info!(%date, added, duplicates, "ingested conversations");
        Ok(IngestReport {
            date,
            received: rows.len(),
            added,
            duplicates,
            total_records: snapshot.total_records,
        })
    }

    /// Classify the date's pending (and retryable failed) records.
    ///
    /// Rejected with [`DashboardError::Busy`] while another run for the same
    /// date is in flight. Results are applied to a freshly read snapshot and
    /// only to records this run still owns; anything else is skipped.
    /// Records left unfinished at the budget deadline return to `pending`.
    pub async fn process_date(&self, date: &str) -> Result<ProcessingRun, DashboardError> {
        let date = canonical_date(date)?;
        let classifier = self
            .classifier
            .clone()
            .ok_or(DashboardError::ClassifierUnavailable)?;
        let _slot = self
            .locks
            .try_begin_processing(&date)
            .await
            .ok_or_else(|| DashboardError::Busy { date: date.clone() })?;

        let run_id = Uuid::new_v4();
        let span = info_span!("process_date", %date, %run_id);
        self.run_processing(&date, run_id, classifier).instrument(span).await
    }

    async fn run_processing(
        &self,
        date: &str,
        run_id: Uuid,
        classifier: Arc<dyn Classifier>,
    ) -> Result<ProcessingRun, DashboardError> {
        let rules = self.effective_rules().await?;
        let (items, mut run) = {
            let _guard = self.locks.write_guard(date).await;
            let started = Utc::now();
            let mut snapshot = self
                .load_snapshot(date)
                .await?
                .ok_or_else(|| DashboardError::NotFound { date: date.to_string() })?;

            // The processing slot is ours, so any claim still on disk is from a
            // run that was cancelled or failed before applying its results.
            let recovered = snapshot.recover_abandoned(started);
            if recovered > 0 {
                warn!(recovered, "returned abandoned claims to pending");
            }

            let mut items = Vec::new();
            for record in &mut snapshot.records {
                if matches!(record.status, RecordStatus::Failed { retryable: true }) {
                    record.status = RecordStatus::Pending;
                }
                if record.claim(run_id).is_ok() {
                    items.push(ClassifyItem {
                        id: record.id.clone(),
                        text: classify_text(&record.event),
                    });
                }
            }

            let mut run = ProcessingRun::start(run_id, items.len(), started);
            if items.is_empty() {
                info!("nothing to process");
                if recovered > 0 {
                    snapshot.refresh_counts(started);
                    self.save_snapshot(&snapshot).await?;
                }
                run.status = RunStatus::Success;
                run.completed_at = Some(started);
                return Ok(run);
            }
            snapshot.runs.push(run.clone());
            snapshot.refresh_counts(started);
            self.save_snapshot(&snapshot).await?;
            (items, run)
        };

        info!(claimed = items.len(), "classifying records");
        let claimed_ids = items.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        let ClassifiedBatch {
            mut outcomes,
            timed_out,
        } = classify_bounded(classifier, items, &self.settings).await;

        let _guard = self.locks.write_guard(date).await;
        let now = Utc::now();
        run.timed_out = timed_out;
        run.cost_usd = outcomes
            .values()
            .filter_map(|o| o.as_ref().ok())
            .map(|r| r.cost_usd)
            .sum();

        let Some(mut snapshot) = self.load_snapshot(date).await? else {
            warn!("snapshot deleted while processing; discarding results");
            run.skipped = claimed_ids.len();
            run.status = RunStatus::Failed;
            run.completed_at = Some(now);
            run.error = Some("snapshot deleted during processing".to_string());
            return Ok(run);
        };

        for id in &claimed_ids {
            let Some(record) = snapshot.record_mut(id) else {
                run.skipped += 1;
                continue;
            };
            if !record.is_claimed_by(run_id) {
                run.skipped += 1;
                continue;
            }
            let applied = match outcomes.remove(id) {
                Some(Ok(result)) => record.succeed(run_id, result, now).map(|()| Applied::Succeeded),
                Some(Err(error)) => record
                    .fail(run_id, error, self.settings.max_retries, now)
                    .map(|()| Applied::Failed),
                None => record.release(run_id).map(|()| Applied::Released),
            };
            match applied {
                Ok(Applied::Succeeded) => run.succeeded += 1,
                Ok(Applied::Failed) => run.failed += 1,
                Ok(Applied::Released) => run.released += 1,
                Err(err) => {
                    warn!(error = %err, "record changed state while applying results");
                    run.skipped += 1;
                }
            }
        }

        run.completed_at = Some(now);
        if run.failed == 0 && !run.timed_out {
            run.status = RunStatus::Success;
        } else {
            run.status = RunStatus::Failed;
            run.error = Some(format!(
                "{} failed, {} released{}",
                run.failed,
                run.released,
                if run.timed_out { ", budget exhausted" } else { "" }
            ));
        }

        match snapshot.run_mut(run_id) {
            Some(stored) => *stored = run.clone(),
            None => snapshot.runs.push(run.clone()),
        }
        snapshot.summary = conversation_summary(&snapshot, &rules);
        snapshot.refresh_counts(now);
        self.save_snapshot(&snapshot).await?;

        info!(
            succeeded = run.succeeded,
            failed = run.failed,
            released = run.released,
            skipped = run.skipped,
            timed_out = run.timed_out,
            "processing run finished"
        );
        Ok(run)
    }

    pub async fn reset_date(&self, date: &str, scope: ResetScope) -> Result<ResetReport, DashboardError> {
        let date = canonical_date(date)?;
        let rules = self.effective_rules().await?;
        // Holding the slot keeps a run from starting mid-reset and tells us
        // whether claims on disk belong to a live run.
        let idle = self.locks.try_begin_processing(&date).await;
        let _guard = self.locks.write_guard(&date).await;
        let mut snapshot = self
            .load_snapshot(&date)
            .await?
            .ok_or_else(|| DashboardError::NotFound { date: date.clone() })?;

        let mut reset = 0;
        if idle.is_some() && scope == ResetScope::Failed {
            reset += snapshot.recover_abandoned(Utc::now());
        }
        for record in &mut snapshot.records {
            let selected = match scope {
                ResetScope::Failed => matches!(record.status, RecordStatus::Failed { .. }),
                ResetScope::All => true,
            };
            if selected {
                record.reset();
                reset += 1;
            }
        }
        snapshot.summary = conversation_summary(&snapshot, &rules);
        snapshot.refresh_counts(Utc::now());
        self.save_snapshot(&snapshot).await?;

        info!(%date, ?scope, reset, "reset records");
        Ok(ResetReport { date, scope, reset })
    }

    /// Explicit admin delete; snapshots are never removed otherwise.
    pub async fn delete_date(&self, date: &str) -> Result<(), DashboardError> {
        let date = canonical_date(date)?;
        let _guard = self.locks.write_guard(&date).await;
        if !self.store.delete(&daily_key(&date)).await? {
            return Err(DashboardError::NotFound { date });
        }
        warn!(%date, "deleted daily snapshot");
        Ok(())
    }

    pub async fn list_dates(&self) -> Result<Vec<String>, DashboardError> {
        let keys = self.store.list(DAILY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(DAILY_PREFIX)?.strip_suffix(".json"))
            .map(ToString::to_string)
            .collect())
    }

    pub async fn get_snapshot(&self, date: &str) -> Result<DailySnapshot, DashboardError> {
        let date = canonical_date(date)?;
        match self.load_snapshot(&date).await? {
            Some(snapshot) => Ok(snapshot),
            None => Err(DashboardError::NotFound { date }),
        }
    }

    /// Summary recomputed with the current configuration (not persisted).
    pub async fn snapshot_summary(&self, date: &str) -> Result<Summary, DashboardError> {
        let snapshot = self.get_snapshot(date).await?;
        let rules = self.effective_rules().await?;
        Ok(conversation_summary(&snapshot, &rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_answers_fill_gaps_without_overwriting() {
        let event = RawEvent::new()
            .with_record_id("c-1")
            .with_scalar(fields::CONTRACT_TYPE, "CC")
            .with_set(fields::COUNTRIES, ["Kenya"]);
        let result = ClassificationResult {
            prospect_services: vec!["oec".into()],
            contract_type: Some("maid visa".into()),
            countries: vec!["Kenya".into(), "Philippines".into()],
            skill: Some("Sales".into()),
            ..ClassificationResult::default()
        };
        let merged = classified_event(&event, &result);
        assert_eq!(merged.scalar(fields::CONTRACT_TYPE), Some("CC"));
        assert_eq!(merged.sets[fields::COUNTRIES], vec!["Kenya", "Philippines"]);
        assert_eq!(merged.sets[fields::PROSPECT_SERVICES], vec!["oec"]);
        assert_eq!(merged.category(), Some("Sales"));
    }

    #[test]
    fn untimed_records_fall_on_the_snapshot_date() {
        use chrono::TimeZone;

        let run = Uuid::new_v4();
        let created = Utc.with_ymd_and_hms(2026, 1, 12, 8, 0, 0).single().unwrap();
        let mut snapshot = DailySnapshot::new("2026-01-10", created);
        let timed = RawEvent::new()
            .with_record_id("c-1")
            .with_identifier(fields::CLIENT_ID, "C-1")
            .with_timestamp(Utc.with_ymd_and_hms(2026, 1, 10, 15, 0, 0).single().unwrap());
        let untimed = RawEvent::new()
            .with_record_id("c-2")
            .with_identifier(fields::CLIENT_ID, "C-1");
        for (id, event) in [("c-1", timed), ("c-2", untimed)] {
            let mut record = SnapshotRecord::pending(id, event);
            record.claim(run).unwrap();
            record.succeed(run, ClassificationResult::default(), created).unwrap();
            snapshot.records.push(record);
        }

        let rules = DashboardRules::default();
        let summary = conversation_summary(&snapshot, &rules);
        assert_eq!(summary.total_entities, 1);
        assert_eq!(conversation_summary(&snapshot, &rules), summary);
    }

    #[test]
    fn daily_keys_are_date_scoped() {
        assert_eq!(daily_key("2026-01-10"), "daily/2026-01-10.json");
    }
}
