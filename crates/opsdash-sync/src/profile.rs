//! One merge pipeline, parameterised per data source.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use opsdash_adapters::SourceKind;
use opsdash_core::{MergedEntity, RawEvent};
use serde::{Deserialize, Serialize};

use crate::grouping::group_by_identity;
use crate::identity::IdentityPolicy;
use crate::reconcile::{reconcile, ReconcilePolicy};

/// Same contract, client and housemaid within this many calendar months is one sale.
pub const SALE_WINDOW_MONTHS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeProfile {
    pub identity: IdentityPolicy,
    pub window_months: u32,
    #[serde(default)]
    pub reconcile: ReconcilePolicy,
}

impl MergeProfile {
    /// Conversations of one client (or maid) on the same day form one entity.
    pub fn conversations() -> Self {
        Self {
            identity: IdentityPolicy::default(),
            window_months: 0,
            reconcile: ReconcilePolicy::default(),
        }
    }

    pub fn oec_sales() -> Self {
        Self {
            identity: IdentityPolicy::sale(),
            window_months: SALE_WINDOW_MONTHS,
            reconcile: ReconcilePolicy::default(),
        }
    }

    /// Repeated complaints of one type by one client inside the window count once.
    pub fn complaints() -> Self {
        Self {
            identity: IdentityPolicy::default().per_category(),
            window_months: SALE_WINDOW_MONTHS,
            reconcile: ReconcilePolicy::default(),
        }
    }

    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Conversation => Self::conversations(),
            SourceKind::OecSale => Self::oec_sales(),
            SourceKind::Complaint => Self::complaints(),
        }
    }

    /// Resolve, group and reconcile. Exact duplicate events (same canonical
    /// content) collapse to one before grouping, so feeding an overlapping
    /// batch twice does not change the output.
    pub fn merge(&self, events: Vec<RawEvent>, now: DateTime<Utc>) -> Vec<MergedEntity> {
        let mut seen = BTreeSet::new();
        let events = events
            .into_iter()
            .filter(|event| seen.insert(serde_json::to_string(event).unwrap_or_default()))
            .collect::<Vec<_>>();

        group_by_identity(events, &self.identity, self.window_months, now)
            .iter()
            .map(|period| reconcile(period, &self.reconcile))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use opsdash_adapters::{fields, DEFAULT_OEC_TYPE};

    fn day(m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, m, d, 0, 0, 0).single().unwrap()
    }

    fn sale(at: DateTime<Utc>) -> RawEvent {
        RawEvent::new()
            .with_identifier(fields::CLIENT_ID, "client_1")
            .with_category(DEFAULT_OEC_TYPE)
            .with_timestamp(at)
    }

    #[test]
    fn oec_rows_across_the_window_yield_two_sales() {
        let sales = MergeProfile::oec_sales().merge(
            vec![sale(day(1, 10)), sale(day(2, 15)), sale(day(4, 15))],
            day(6, 1),
        );
        assert_eq!(sales.len(), 2);
        assert_eq!(sales[0].start_time, day(1, 10));
        assert_eq!(sales[0].end_time, day(2, 15));
        assert_eq!(sales[1].start_time, day(4, 15));
    }

    #[test]
    fn replaying_an_overlapping_batch_is_idempotent() {
        let profile = MergeProfile::oec_sales();
        let batch = vec![sale(day(1, 10)), sale(day(2, 15))];
        let once = profile.merge(batch.clone(), day(6, 1));
        let mut doubled = batch.clone();
        doubled.extend(batch);
        assert_eq!(profile.merge(doubled, day(6, 1)), once);
    }

    #[test]
    fn complaints_of_different_types_stay_apart() {
        let event = |kind: &str| {
            RawEvent::new()
                .with_identifier(fields::CLIENT_ID, "C-1")
                .with_category(kind)
                .with_timestamp(day(3, 1))
        };
        let merged = MergeProfile::complaints().merge(vec![event("Visa delay"), event("Salary")], day(6, 1));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn conversations_merge_within_a_day_only() {
        let conv = |id: &str, at: DateTime<Utc>| {
            RawEvent::new()
                .with_record_id(id)
                .with_identifier(fields::CLIENT_ID, "C-1")
                .with_timestamp(at)
        };
        let merged = MergeProfile::for_source(SourceKind::Conversation).merge(
            vec![
                conv("a", day(3, 1)),
                conv("b", Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).single().unwrap()),
                conv("c", day(3, 2)),
            ],
            day(6, 1),
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].record_ids, vec!["a", "b"]);
    }
}
