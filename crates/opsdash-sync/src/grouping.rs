//! Temporal grouping of events that share an identity into sale periods.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use opsdash_core::{IdentityKey, Period, PeriodMember, RawEvent};

use crate::identity::IdentityPolicy;

/// Calendar-month distance from `anchor` to `at` (day-of-month ignored).
pub fn calendar_months_between(anchor: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    (i64::from(at.year()) - i64::from(anchor.year())) * 12 + i64::from(at.month())
        - i64::from(anchor.month())
}

/// Whether `at` still belongs to a period anchored at `anchor`.
///
/// Fewer than `window_months` calendar months always qualifies; exactly
/// `window_months` qualifies up to and including the anchor's day-of-month.
/// A window of 0 therefore means "same calendar day".
pub fn within_window(anchor: DateTime<Utc>, at: DateTime<Utc>, window_months: u32) -> bool {
    if at < anchor {
        return false;
    }
    match calendar_months_between(anchor, at).cmp(&i64::from(window_months)) {
        Ordering::Less => true,
        Ordering::Equal => at.day() <= anchor.day(),
        Ordering::Greater => false,
    }
}

/// Timestamp order with a content tiebreak so equal-time events sort the same
/// way regardless of arrival order.
pub(crate) fn ordered_members(members: impl IntoIterator<Item = PeriodMember>) -> Vec<PeriodMember> {
    let mut members: Vec<PeriodMember> = members.into_iter().collect();
    members.sort_by_cached_key(|m| (m.at, serde_json::to_string(&m.event).unwrap_or_default()));
    members
}

/// Partition the events of one identity into periods.
///
/// Events are sorted ascending (missing timestamps become `now`). Each event
/// joins the earliest open period whose anchor is within the window, or opens
/// a new period. Once an event falls outside a period's window every later
/// event does too, so that period is closed for good.
pub fn group(
    key: &IdentityKey,
    events: Vec<RawEvent>,
    window_months: u32,
    now: DateTime<Utc>,
) -> Vec<Period> {
    let members = ordered_members(events.into_iter().map(|event| PeriodMember {
        at: event.timestamp.unwrap_or(now),
        event,
    }));

    let mut periods: Vec<Period> = Vec::new();
    let mut first_open = 0usize;

    for member in members {
        while first_open < periods.len()
            && !within_window(periods[first_open].start, member.at, window_months)
        {
            first_open += 1;
        }

        let slot = periods[first_open..]
            .iter()
            .position(|p| within_window(p.start, member.at, window_months))
            .map(|offset| first_open + offset);

        match slot {
            Some(index) => periods[index].push(member),
            None => {
                let sequence = periods.len();
                periods.push(Period::open(key.clone(), sequence, member));
            }
        }
    }

    periods
}

/// Resolve identities, then group each identity's events. Output is ordered
/// by key, then by period sequence.
pub fn group_by_identity(
    events: Vec<RawEvent>,
    policy: &IdentityPolicy,
    window_months: u32,
    now: DateTime<Utc>,
) -> Vec<Period> {
    let mut by_key: BTreeMap<IdentityKey, Vec<RawEvent>> = BTreeMap::new();
    for event in events {
        by_key.entry(policy.resolve(&event)).or_default().push(event);
    }

    by_key
        .into_iter()
        .flat_map(|(key, events)| group(&key, events, window_months, now))
        .collect()
}
