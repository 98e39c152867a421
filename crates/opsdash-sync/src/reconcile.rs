//! Field reconciliation: fold the members of a period into one entity.

use std::collections::{BTreeMap, BTreeSet};

use opsdash_core::{MergedEntity, Period, UNSPECIFIED};
use serde::{Deserialize, Serialize};

use crate::grouping::ordered_members;

pub const DEFAULT_TEXT_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePolicy {
    pub text_separator: String,
    /// Set value (case-insensitive) that never enters a merged set.
    pub set_sentinel: String,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            text_separator: DEFAULT_TEXT_SEPARATOR.to_string(),
            set_sentinel: UNSPECIFIED.to_string(),
        }
    }
}

/// Merge a period into a [`MergedEntity`].
///
/// Members are folded in (timestamp, content) order:
/// - scalars: first non-empty value wins, later values never overwrite it;
/// - texts: every non-empty text, joined with the separator, untruncated;
/// - sets, categories, record ids: union, emitted sorted;
/// - start/end: earliest and latest member timestamps.
///
/// The result depends only on the multiset of members, so reconciling the
/// same period twice (or in another member order) yields identical output.
pub fn reconcile(period: &Period, policy: &ReconcilePolicy) -> MergedEntity {
    let members = ordered_members(period.members.iter().cloned());

    let mut scalars: BTreeMap<String, String> = BTreeMap::new();
    let mut texts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut categories: BTreeSet<String> = BTreeSet::new();
    let mut record_ids: BTreeSet<String> = BTreeSet::new();

    for member in &members {
        let event = &member.event;
        for (name, value) in &event.scalars {
            let value = value.trim();
            if !value.is_empty() && !scalars.contains_key(name) {
                scalars.insert(name.clone(), value.to_string());
            }
        }
        for (name, value) in &event.texts {
            if !value.trim().is_empty() {
                texts.entry(name.clone()).or_default().push(value.clone());
            }
        }
        for (name, values) in &event.sets {
            let bucket = sets.entry(name.clone()).or_default();
            bucket.extend(
                values
                    .iter()
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(&policy.set_sentinel))
                    .map(ToString::to_string),
            );
        }
        if let Some(category) = event.category() {
            categories.insert(category.to_string());
        }
        if let Some(id) = event.record_id() {
            record_ids.insert(id.to_string());
        }
    }

    let event_times = members.iter().map(|m| m.at).collect::<Vec<_>>();
    let start_time = event_times.first().copied().unwrap_or(period.start);
    let end_time = event_times.last().copied().unwrap_or(start_time);

    MergedEntity {
        key: period.key.clone(),
        sequence: period.sequence,
        start_time,
        end_time,
        event_times,
        record_ids: record_ids.into_iter().collect(),
        categories: categories.into_iter().collect(),
        scalars,
        texts: texts
            .into_iter()
            .map(|(name, parts)| (name, parts.join(&policy.text_separator)))
            .collect(),
        sets: sets
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| (name, values.into_iter().collect()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use opsdash_adapters::fields;
    use opsdash_core::{IdentityKey, PeriodMember, RawEvent};

    fn at(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, 12, 0, 0).single().unwrap()
    }

    fn member(d: u32, event: RawEvent) -> PeriodMember {
        PeriodMember { at: at(d), event }
    }

    fn sample_period() -> Period {
        let mut period = Period::open(
            IdentityKey::new("client:C-1"),
            0,
            member(
                3,
                RawEvent::new()
                    .with_record_id("conv-2")
                    .with_scalar(fields::CLIENT_NAME, "")
                    .with_scalar(fields::CONTRACT_TYPE, "CC")
                    .with_text(fields::MESSAGE, "second")
                    .with_set(fields::COUNTRIES, ["Kenya", "unspecified"]),
            ),
        );
        period.push(member(
            1,
            RawEvent::new()
                .with_record_id("conv-1")
                .with_category("sales")
                .with_scalar(fields::CLIENT_NAME, "Amal")
                .with_text(fields::MESSAGE, "first")
                .with_set(fields::COUNTRIES, ["Philippines", "Kenya"]),
        ));
        period.push(member(
            5,
            RawEvent::new()
                .with_record_id("conv-3")
                .with_scalar(fields::CLIENT_NAME, "Amal B.")
                .with_scalar(fields::CONTRACT_TYPE, "MV")
                .with_text(fields::MESSAGE, "first"),
        ));
        period
    }

    #[test]
    fn first_non_empty_scalar_wins_in_time_order() {
        let entity = reconcile(&sample_period(), &ReconcilePolicy::default());
        assert_eq!(entity.scalar(fields::CLIENT_NAME), Some("Amal"));
        assert_eq!(entity.scalar(fields::CONTRACT_TYPE), Some("CC"));
    }

    #[test]
    fn texts_concatenate_without_dedup_and_sets_union() {
        let entity = reconcile(&sample_period(), &ReconcilePolicy::default());
        assert_eq!(
            entity.texts.get(fields::MESSAGE).map(String::as_str),
            Some("first\n---\nsecond\n---\nfirst")
        );
        assert_eq!(entity.set(fields::COUNTRIES), ["Kenya", "Philippines"]);
        assert_eq!(entity.record_ids, vec!["conv-1", "conv-2", "conv-3"]);
        assert_eq!(entity.categories, vec!["sales"]);
    }

    #[test]
    fn time_span_covers_min_and_max() {
        let entity = reconcile(&sample_period(), &ReconcilePolicy::default());
        assert_eq!(entity.start_time, at(1));
        assert_eq!(entity.end_time, at(5));
        assert_eq!(entity.event_count(), 3);

        let single = Period::open(IdentityKey::new("maid:M-1"), 0, member(7, RawEvent::new()));
        let entity = reconcile(&single, &ReconcilePolicy::default());
        assert_eq!(entity.start_time, entity.end_time);
    }

    #[test]
    fn reconciliation_is_idempotent_and_order_independent() {
        let period = sample_period();
        let policy = ReconcilePolicy::default();
        let first = serde_json::to_vec(&reconcile(&period, &policy)).unwrap();
        let second = serde_json::to_vec(&reconcile(&period, &policy)).unwrap();
        assert_eq!(first, second);

        let mut shuffled = period.clone();
        shuffled.members.reverse();
        let third = serde_json::to_vec(&reconcile(&shuffled, &policy)).unwrap();
        assert_eq!(first, third);
    }
}
