//! Per-date coordination.
//!
//! Two separate locks per date:
//! - a processing slot (one permit, acquire-or-reject) so at most one run is
//!   in flight for a date;
//! - a write mutex held around every read-modify-write of the date's
//!   snapshot document, including ingest and reset.
//!
//! A run holds the processing slot for its whole duration but takes the
//! write mutex only for its claim and apply phases, so ingest and reset stay
//! responsive while classification is in flight.
//!
//! Entries live only while a guard, permit or waiter still references them;
//! idle ones are pruned on the next lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
pub struct DateLocks {
    processing: Mutex<HashMap<String, Arc<Semaphore>>>,
    writes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn processing_slot(&self, date: &str) -> Arc<Semaphore> {
        let mut map = self.processing.lock().await;
        map.retain(|_, slot| Arc::strong_count(slot) > 1);
        map.entry(date.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    async fn write_mutex(&self, date: &str) -> Arc<Mutex<()>> {
        let mut map = self.writes.lock().await;
        map.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        map.entry(date.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn tracked(&self) -> (usize, usize) {
        (self.processing.lock().await.len(), self.writes.lock().await.len())
    }

    /// `None` when a run for `date` already holds the slot.
    pub async fn try_begin_processing(&self, date: &str) -> Option<OwnedSemaphorePermit> {
        self.processing_slot(date).await.try_acquire_owned().ok()
    }

    pub async fn write_guard(&self, date: &str) -> OwnedMutexGuard<()> {
        self.write_mutex(date).await.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_run_for_a_date_is_rejected_until_the_first_ends() {
        let locks = DateLocks::new();
        let first = locks.try_begin_processing("2026-01-10").await;
        assert!(first.is_some());
        assert!(locks.try_begin_processing("2026-01-10").await.is_none());
        assert!(locks.try_begin_processing("2026-01-11").await.is_some());

        drop(first);
        assert!(locks.try_begin_processing("2026-01-10").await.is_some());
    }

    #[tokio::test]
    async fn write_guard_serialises_per_date() {
        let locks = Arc::new(DateLocks::new());
        let guard = locks.write_guard("2026-01-10").await;

        let other_date = locks.write_guard("2026-01-11").await;
        drop(other_date);

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.write_guard("2026-01-10").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn idle_dates_are_pruned() {
        let locks = DateLocks::new();
        for day in 1..=5 {
            let date = format!("2026-01-{day:02}");
            let _slot = locks.try_begin_processing(&date).await;
            let _guard = locks.write_guard(&date).await;
        }
        let held = locks.try_begin_processing("2026-02-01").await;
        let _guard = locks.write_guard("2026-02-01").await;
        assert_eq!(locks.tracked().await, (1, 1));

        // A held slot survives pruning and still rejects a second run.
        assert!(locks.try_begin_processing("2026-02-02").await.is_some());
        assert!(locks.try_begin_processing("2026-02-01").await.is_none());
        drop(held);
        assert!(locks.try_begin_processing("2026-02-01").await.is_some());
    }
}
