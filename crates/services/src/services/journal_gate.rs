//! Journal cadence gating: at most one entry per (user, plant) pair in any
//! rolling 7-day window, plus assembly of entries with their asynchronously
//! produced AI feedback.

use std::{collections::HashMap, ops::Deref, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use db::{
    models::{
        journal_cadence::{CadenceMarker, StoredCadenceMarker},
        journal_entry::{CreateJournalEntry, JournalEntry},
        journal_feedback::{CreateJournalFeedback, GrowthRating, JournalFeedback},
    },
    store::{DocumentStore, StoreError},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::{Clock, now_millis};

/// Length of the cadence window: 7 days
pub const CADENCE_WINDOW_MS: i64 = 604_800_000;

/// How often a lost compare-and-set on the cadence marker is re-evaluated
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// How long a claim may exist before its entry is written. Past this, a
/// marker whose entry is missing no longer locks the pair.
pub const CLAIM_LEASE_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum JournalGateError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("journal entry not allowed before {next_eligible_at}")]
    CadenceViolation { next_eligible_at: DateTime<Utc> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("concurrent journal writes for this plant, try again")]
    Contended,
}

/// Whether a new entry may be created for a (user, plant) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub allowed: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl Eligibility {
    pub fn open() -> Self {
        Self {
            allowed: true,
            next_eligible_at: None,
        }
    }

    pub fn locked_until(next_eligible_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            next_eligible_at: Some(next_eligible_at),
        }
    }
}

/// A journal entry paired with its feedback, if the evaluation has landed yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntryWithFeedback {
    #[serde(flatten)]
    pub entry: JournalEntry,
    pub feedback: Option<JournalFeedback>,
}

impl Deref for JournalEntryWithFeedback {
    type Target = JournalEntry;
    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

pub fn cadence_window() -> TimeDelta {
    TimeDelta::milliseconds(CADENCE_WINDOW_MS)
}

/// Cadence rule for a pair whose latest entry was written at `last_entry_at`
pub fn eligibility_at(last_entry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Eligibility {
    match last_entry_at {
        None => Eligibility::open(),
        Some(last) => {
            let next = last + cadence_window();
            if now >= next {
                Eligibility::open()
            } else {
                Eligibility::locked_until(next)
            }
        }
    }
}

pub struct JournalGate {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl JournalGate {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Check whether `user_id` may add a journal entry for `plant_id` now.
    ///
    /// Store failures are returned as errors, never as an allowed result.
    pub async fn check_eligibility(
        &self,
        user_id: &str,
        plant_id: &str,
    ) -> Result<Eligibility, JournalGateError> {
        require_non_empty("user_id", user_id)?;
        require_non_empty("plant_id", plant_id)?;

        let now = now_millis(self.clock.as_ref());
        let eligibility = eligibility_at(self.last_entry_at(user_id, plant_id, now).await?, now);

        debug!(
            user_id = %user_id,
            plant_id = %plant_id,
            allowed = eligibility.allowed,
            next_eligible_at = ?eligibility.next_eligible_at,
            "Journal eligibility checked"
        );

        Ok(eligibility)
    }

    /// Persist a new entry if the pair's cadence window is open.
    ///
    /// The pair's cadence marker is claimed with compare-and-set before the
    /// entry is written, so two concurrent creations cannot both succeed.
    pub async fn create_entry(
        &self,
        data: CreateJournalEntry,
    ) -> Result<JournalEntry, JournalGateError> {
        require_non_empty("user_id", &data.user_id)?;
        require_non_empty("plant_id", &data.plant_id)?;
        require_non_empty("content", &data.content)?;

        let store = self.store.as_ref();
        let now = now_millis(self.clock.as_ref());

        let last_entry_at = self
            .last_entry_at(&data.user_id, &data.plant_id, now)
            .await?;
        if let Some(next_eligible_at) = eligibility_at(last_entry_at, now).next_eligible_at {
            info!(
                user_id = %data.user_id,
                plant_id = %data.plant_id,
                next_eligible_at = %next_eligible_at,
                "Journal entry rejected: cadence window still locked"
            );
            return Err(JournalGateError::CadenceViolation { next_eligible_at });
        }

        let entry_id = JournalEntry::new_id();
        let previous = self.claim_cadence(&data, &entry_id, now).await?;

        match JournalEntry::create(store, &entry_id, &data, now).await {
            Ok(Some(entry)) => {
                info!(
                    entry_id = %entry.id,
                    user_id = %entry.user_id,
                    plant_id = %entry.plant_id,
                    "Journal entry created"
                );
                Ok(entry)
            }
            Ok(None) => {
                self.release_cadence(&data, previous).await;
                Err(JournalGateError::Contended)
            }
            Err(e) => {
                self.release_cadence(&data, previous).await;
                Err(e.into())
            }
        }
    }

    /// Entries for the pair newest first, each with its feedback or `None`
    pub async fn list_entries_with_feedback(
        &self,
        user_id: &str,
        plant_id: &str,
    ) -> Result<Vec<JournalEntryWithFeedback>, JournalGateError> {
        require_non_empty("user_id", user_id)?;
        require_non_empty("plant_id", plant_id)?;

        let store = self.store.as_ref();
        let entries = JournalEntry::find_all_for_plant(store, user_id, plant_id).await?;
        let feedback = JournalFeedback::find_by_plant_id(store, plant_id).await?;

        // Feedback arrives oldest first, so a later duplicate replaces an earlier one.
        let mut by_entry: HashMap<String, JournalFeedback> = HashMap::with_capacity(feedback.len());
        for item in feedback {
            by_entry.insert(item.journal_id.clone(), item);
        }

        Ok(entries
            .into_iter()
            .map(|entry| {
                let feedback = by_entry.remove(&entry.id);
                JournalEntryWithFeedback { entry, feedback }
            })
            .collect())
    }

    /// Store an evaluation for an existing entry. Called by the evaluation job.
    pub async fn record_feedback(
        &self,
        data: CreateJournalFeedback,
    ) -> Result<JournalFeedback, JournalGateError> {
        require_non_empty("journal_id", &data.journal_id)?;
        require_non_empty("plant_id", &data.plant_id)?;
        require_non_empty("summary", &data.summary)?;
        let growth_rating = GrowthRating::new(data.growth_rating)
            .map_err(|e| JournalGateError::InvalidInput(e.to_string()))?;

        let store = self.store.as_ref();
        let entry = JournalEntry::find_by_id(store, &data.journal_id)
            .await?
            .ok_or_else(|| {
                JournalGateError::NotFound(format!("journal entry {}", data.journal_id))
            })?;

        if entry.plant_id != data.plant_id {
            return Err(JournalGateError::InvalidInput(format!(
                "journal entry {} belongs to plant {}, not {}",
                entry.id, entry.plant_id, data.plant_id
            )));
        }

        let now = now_millis(self.clock.as_ref());
        let feedback = JournalFeedback::create(store, &data, growth_rating, now).await?;

        info!(
            feedback_id = %feedback.id,
            journal_id = %feedback.journal_id,
            growth_rating = feedback.growth_rating.value(),
            "Journal feedback recorded"
        );

        Ok(feedback)
    }

    /// Creation time of the pair's latest entry, or of a claim whose entry
    /// may still be in flight, whichever is later
    async fn last_entry_at(
        &self,
        user_id: &str,
        plant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JournalGateError> {
        let store = self.store.as_ref();
        let latest = JournalEntry::find_latest_for_plant(store, user_id, plant_id)
            .await?
            .map(|e| e.created_at);
        let claimed = match CadenceMarker::find(store, user_id, plant_id).await? {
            Some(stored) if self.marker_holds_lock(&stored.marker, now).await? => {
                Some(stored.marker.last_entry_at)
            }
            _ => None,
        };
        Ok(latest.max(claimed))
    }

    /// A marker locks the pair inside the cadence window while its entry
    /// exists or could still be written. A marker left behind by a failed
    /// write, or pointing at a removed entry, is stale once the lease ends.
    async fn marker_holds_lock(
        &self,
        marker: &CadenceMarker,
        now: DateTime<Utc>,
    ) -> Result<bool, JournalGateError> {
        if eligibility_at(Some(marker.last_entry_at), now).allowed {
            return Ok(false);
        }
        if now < marker.last_entry_at + TimeDelta::milliseconds(CLAIM_LEASE_MS) {
            return Ok(true);
        }
        Ok(JournalEntry::find_by_id(self.store.as_ref(), &marker.entry_id)
            .await?
            .is_some())
    }

    /// Claim the pair's cadence marker for `entry_id`, written at `now`.
    /// Returns the marker that was replaced, for rollback.
    async fn claim_cadence(
        &self,
        data: &CreateJournalEntry,
        entry_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredCadenceMarker>, JournalGateError> {
        let store = self.store.as_ref();
        let claim = CadenceMarker {
            user_id: data.user_id.clone(),
            plant_id: data.plant_id.clone(),
            entry_id: entry_id.to_string(),
            last_entry_at: now,
        };

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let current = CadenceMarker::find(store, &data.user_id, &data.plant_id).await?;

            if let Some(stored) = &current {
                if self.marker_holds_lock(&stored.marker, now).await? {
                    let next_eligible_at = stored.marker.last_entry_at + cadence_window();
                    info!(
                        user_id = %data.user_id,
                        plant_id = %data.plant_id,
                        next_eligible_at = %next_eligible_at,
                        "Journal entry rejected: cadence marker already claimed"
                    );
                    return Err(JournalGateError::CadenceViolation { next_eligible_at });
                }
                if !eligibility_at(Some(stored.marker.last_entry_at), now).allowed {
                    warn!(
                        user_id = %data.user_id,
                        plant_id = %data.plant_id,
                        stale_entry_id = %stored.marker.entry_id,
                        "Replacing stale cadence marker with no entry behind it"
                    );
                }
            }

            if claim
                .swap(store, current.as_ref().map(|c| c.revision))
                .await?
            {
                return Ok(current);
            }

            debug!(
                user_id = %data.user_id,
                plant_id = %data.plant_id,
                attempt = attempt,
                "Cadence marker changed concurrently, re-reading"
            );
        }

        warn!(
            user_id = %data.user_id,
            plant_id = %data.plant_id,
            "Gave up claiming cadence marker after {} attempts",
            MAX_CLAIM_ATTEMPTS
        );
        Err(JournalGateError::Contended)
    }

    /// Best-effort undo of [`Self::claim_cadence`] after the entry write failed
    async fn release_cadence(
        &self,
        data: &CreateJournalEntry,
        previous: Option<StoredCadenceMarker>,
    ) {
        let store = self.store.as_ref();
        let result = match previous {
            Some(stored) => stored.marker.swap(store, Some(stored.revision + 1)).await,
            None => CadenceMarker::remove(store, &data.user_id, &data.plant_id).await,
        };

        match result {
            Ok(true) => debug!(
                user_id = %data.user_id,
                plant_id = %data.plant_id,
                "Released cadence marker after failed entry write"
            ),
            Ok(false) => warn!(
                user_id = %data.user_id,
                plant_id = %data.plant_id,
                "Cadence marker changed before it could be released"
            ),
            Err(e) => warn!(
                user_id = %data.user_id,
                plant_id = %data.plant_id,
                error = %e,
                "Failed to release cadence marker"
            ),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), JournalGateError> {
    if value.trim().is_empty() {
        Err(JournalGateError::InvalidInput(format!(
            "{} must not be empty",
            field
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use db::{
        DBService,
        store::{Document, Filter, MemoryDocumentStore, OrderBy, SqliteDocumentStore},
    };
    use serde_json::Value;

    use super::*;
    use crate::services::clock::ManualClock;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn gate_with(store: Arc<dyn DocumentStore>) -> (JournalGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        (JournalGate::new(store, clock.clone()), clock)
    }

    fn gate() -> (JournalGate, Arc<ManualClock>) {
        gate_with(Arc::new(MemoryDocumentStore::new()))
    }

    fn entry(user_id: &str, plant_id: &str) -> CreateJournalEntry {
        CreateJournalEntry {
            user_id: user_id.to_string(),
            plant_id: plant_id.to_string(),
            content: "Leaves look greener after repotting".to_string(),
            mood: Some("happy".to_string()),
            growth_stage: Some("vegetative".to_string()),
            image_url: None,
        }
    }

    fn feedback(journal_id: &str, plant_id: &str, rating: i64) -> CreateJournalFeedback {
        CreateJournalFeedback {
            journal_id: journal_id.to_string(),
            plant_id: plant_id.to_string(),
            summary: "Healthy new growth".to_string(),
            growth_rating: rating,
            tips: vec!["Rotate the pot weekly".to_string()],
        }
    }

    /// Delegates to a memory store, yielding before every call so concurrent
    /// futures interleave. Entry writes and deletes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryDocumentStore,
        fail_entry_inserts: AtomicBool,
        fail_deletes: AtomicBool,
    }

    impl FlakyStore {
        fn fails_entry_write(&self, collection: &str) -> bool {
            collection == JournalEntry::COLLECTION && self.fail_entry_inserts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn insert(&self, collection: &str, record: Value) -> Result<String, StoreError> {
            tokio::task::yield_now().await;
            if self.fails_entry_write(collection) {
                return Err(StoreError::InvalidQuery("store offline".to_string()));
            }
            self.inner.insert(collection, record).await
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.get(collection, id).await
        }

        async fn query_top_n(
            &self,
            collection: &str,
            filters: &[Filter],
            order_by: Option<&OrderBy>,
            limit: usize,
        ) -> Result<Vec<Document>, StoreError> {
            tokio::task::yield_now().await;
            self.inner
                .query_top_n(collection, filters, order_by, limit)
                .await
        }

        async fn query_all(
            &self,
            collection: &str,
            filters: &[Filter],
            order_by: Option<&OrderBy>,
        ) -> Result<Vec<Document>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.query_all(collection, filters, order_by).await
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidQuery("store offline".to_string()));
            }
            self.inner.delete(collection, id).await
        }

        async fn compare_and_set(
            &self,
            collection: &str,
            id: &str,
            expected_revision: Option<i64>,
            record: Value,
        ) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            if self.fails_entry_write(collection) {
                return Err(StoreError::InvalidQuery("store offline".to_string()));
            }
            self.inner
                .compare_and_set(collection, id, expected_revision, record)
                .await
        }
    }

    /// Every call fails
    struct OfflineStore;

    #[async_trait]
    impl DocumentStore for OfflineStore {
        async fn insert(&self, _: &str, _: Value) -> Result<String, StoreError> {
            Err(StoreError::InvalidQuery("offline".to_string()))
        }
        async fn get(&self, _: &str, _: &str) -> Result<Option<Document>, StoreError> {
            Err(StoreError::InvalidQuery("offline".to_string()))
        }
        async fn query_top_n(
            &self,
            _: &str,
            _: &[Filter],
            _: Option<&OrderBy>,
            _: usize,
        ) -> Result<Vec<Document>, StoreError> {
            Err(StoreError::InvalidQuery("offline".to_string()))
        }
        async fn query_all(
            &self,
            _: &str,
            _: &[Filter],
            _: Option<&OrderBy>,
        ) -> Result<Vec<Document>, StoreError> {
            Err(StoreError::InvalidQuery("offline".to_string()))
        }
        async fn delete(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::InvalidQuery("offline".to_string()))
        }
        async fn compare_and_set(
            &self,
            _: &str,
            _: &str,
            _: Option<i64>,
            _: Value,
        ) -> Result<bool, StoreError> {
            Err(StoreError::InvalidQuery("offline".to_string()))
        }
    }

    #[test]
    fn test_eligibility_at_boundaries() {
        let window = cadence_window();
        assert_eq!(window, TimeDelta::days(7));
        assert_eq!(eligibility_at(None, t0()), Eligibility::open());
        assert_eq!(
            eligibility_at(Some(t0()), t0() + window - TimeDelta::milliseconds(1)),
            Eligibility::locked_until(t0() + window)
        );
        assert_eq!(eligibility_at(Some(t0()), t0() + window), Eligibility::open());
    }

    #[tokio::test]
    async fn test_no_prior_entries_is_allowed() {
        let (gate, _) = gate();
        let eligibility = gate.check_eligibility("u1", "p1").await.unwrap();
        assert_eq!(eligibility, Eligibility::open());
    }

    #[tokio::test]
    async fn test_cadence_window_scenario() {
        let (gate, clock) = gate();
        gate.create_entry(entry("u1", "p1")).await.unwrap();

        clock.set(t0() + TimeDelta::days(3));
        let eligibility = gate.check_eligibility("u1", "p1").await.unwrap();
        assert!(!eligibility.allowed);
        assert_eq!(eligibility.next_eligible_at, Some(t0() + TimeDelta::days(7)));

        clock.set(t0() + TimeDelta::days(7) + TimeDelta::milliseconds(1));
        let eligibility = gate.check_eligibility("u1", "p1").await.unwrap();
        assert_eq!(eligibility, Eligibility::open());
    }

    #[tokio::test]
    async fn test_create_entry_rejected_while_locked() {
        let (gate, clock) = gate();
        let first = gate.create_entry(entry("u1", "p1")).await.unwrap();
        assert_eq!(first.created_at, t0());

        clock.advance(TimeDelta::days(6));
        let err = gate.create_entry(entry("u1", "p1")).await.unwrap_err();
        match err {
            JournalGateError::CadenceViolation { next_eligible_at } => {
                assert_eq!(next_eligible_at, t0() + TimeDelta::days(7));
            }
            other => panic!("expected cadence violation, got {other:?}"),
        }

        let entries = gate.list_entries_with_feedback("u1", "p1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_create_entry_allowed_after_window() {
        let (gate, clock) = gate();
        gate.create_entry(entry("u1", "p1")).await.unwrap();

        clock.advance(TimeDelta::days(7));
        let second = gate.create_entry(entry("u1", "p1")).await.unwrap();
        assert_eq!(second.created_at, t0() + TimeDelta::days(7));

        clock.advance(TimeDelta::days(1));
        assert!(matches!(
            gate.create_entry(entry("u1", "p1")).await,
            Err(JournalGateError::CadenceViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_cadence_is_scoped_per_user_and_plant() {
        let (gate, _) = gate();
        gate.create_entry(entry("u1", "p1")).await.unwrap();

        assert!(gate.check_eligibility("u2", "p1").await.unwrap().allowed);
        assert!(gate.check_eligibility("u1", "p2").await.unwrap().allowed);
        gate.create_entry(entry("u2", "p1")).await.unwrap();
        gate.create_entry(entry("u1", "p2")).await.unwrap();
        assert!(!gate.check_eligibility("u1", "p1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_list_entries_with_feedback_scenario() {
        let (gate, clock) = gate();
        let older = gate.create_entry(entry("u1", "p1")).await.unwrap();
        clock.set(t0() + TimeDelta::days(8));
        let newer = gate.create_entry(entry("u1", "p1")).await.unwrap();

        let recorded = gate.record_feedback(feedback(&older.id, "p1", 7)).await.unwrap();

        let listed = gate.list_entries_with_feedback("u1", "p1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].entry, newer);
        assert!(listed[0].feedback.is_none());
        assert_eq!(listed[1].entry, older);
        assert_eq!(listed[1].feedback.as_ref(), Some(&recorded));
        assert!(listed[0].created_at > listed[1].created_at);
    }

    #[tokio::test]
    async fn test_latest_duplicate_feedback_wins() {
        let (gate, clock) = gate();
        let created = gate.create_entry(entry("u1", "p1")).await.unwrap();

        gate.record_feedback(feedback(&created.id, "p1", 3)).await.unwrap();
        clock.advance(TimeDelta::minutes(5));
        gate.record_feedback(feedback(&created.id, "p1", 8)).await.unwrap();

        let listed = gate.list_entries_with_feedback("u1", "p1").await.unwrap();
        let attached = listed[0].feedback.as_ref().unwrap();
        assert_eq!(attached.growth_rating.value(), 8);
    }

    #[tokio::test]
    async fn test_record_feedback_validation() {
        let (gate, _) = gate();
        let created = gate.create_entry(entry("u1", "p1")).await.unwrap();

        assert!(matches!(
            gate.record_feedback(feedback("missing", "p1", 5)).await,
            Err(JournalGateError::NotFound(_))
        ));
        assert!(matches!(
            gate.record_feedback(feedback(&created.id, "p2", 5)).await,
            Err(JournalGateError::InvalidInput(_))
        ));
        assert!(matches!(
            gate.record_feedback(feedback(&created.id, "p1", 0)).await,
            Err(JournalGateError::InvalidInput(_))
        ));
        assert!(matches!(
            gate.record_feedback(feedback(&created.id, "p1", 11)).await,
            Err(JournalGateError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_identifiers_rejected() {
        let (gate, _) = gate();
        assert!(matches!(
            gate.check_eligibility("", "p1").await,
            Err(JournalGateError::InvalidInput(_))
        ));
        assert!(matches!(
            gate.list_entries_with_feedback("u1", " ").await,
            Err(JournalGateError::InvalidInput(_))
        ));
        let mut blank = entry("u1", "p1");
        blank.content = "   ".to_string();
        assert!(matches!(
            gate.create_entry(blank).await,
            Err(JournalGateError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_never_treated_as_allowed() {
        let (gate, _) = gate_with(Arc::new(OfflineStore));
        assert!(matches!(
            gate.check_eligibility("u1", "p1").await,
            Err(JournalGateError::StoreUnavailable(_))
        ));
        assert!(matches!(
            gate.create_entry(entry("u1", "p1")).await,
            Err(JournalGateError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_insert_releases_cadence_marker() {
        let store = Arc::new(FlakyStore::default());
        let (gate, _) = gate_with(store.clone());

        store.fail_entry_inserts.store(true, Ordering::SeqCst);
        assert!(matches!(
            gate.create_entry(entry("u1", "p1")).await,
            Err(JournalGateError::StoreUnavailable(_))
        ));
        assert!(
            CadenceMarker::find(&store.inner, "u1", "p1")
                .await
                .unwrap()
                .is_none()
        );

        store.fail_entry_inserts.store(false, Ordering::SeqCst);
        gate.create_entry(entry("u1", "p1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_insert_restores_previous_marker() {
        let store = Arc::new(FlakyStore::default());
        let (gate, clock) = gate_with(store.clone());
        gate.create_entry(entry("u1", "p1")).await.unwrap();

        clock.advance(TimeDelta::days(10));
        store.fail_entry_inserts.store(true, Ordering::SeqCst);
        assert!(gate.create_entry(entry("u1", "p1")).await.is_err());

        let marker = CadenceMarker::find(&store.inner, "u1", "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.marker.last_entry_at, t0());
        assert_eq!(marker.revision, 3);
    }

    #[tokio::test]
    async fn test_concurrent_creates_persist_exactly_one_entry() {
        let store = Arc::new(FlakyStore::default());
        let (gate, _) = gate_with(store);

        let (a, b) = tokio::join!(
            gate.create_entry(entry("u1", "p1")),
            gate.create_entry(entry("u1", "p1"))
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        for result in [a, b] {
            if let Err(e) = result {
                assert!(matches!(e, JournalGateError::CadenceViolation { .. }));
            }
        }

        let entries = gate.list_entries_with_feedback("u1", "p1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_claim_does_not_lock_pair() {
        let store = Arc::new(FlakyStore::default());
        let (gate, clock) = gate_with(store.clone());

        // Entry write fails and the marker cannot be released either
        store.fail_entry_inserts.store(true, Ordering::SeqCst);
        store.fail_deletes.store(true, Ordering::SeqCst);
        assert!(matches!(
            gate.create_entry(entry("u1", "p1")).await,
            Err(JournalGateError::StoreUnavailable(_))
        ));
        assert!(
            CadenceMarker::find(&store.inner, "u1", "p1")
                .await
                .unwrap()
                .is_some()
        );
        store.fail_entry_inserts.store(false, Ordering::SeqCst);
        store.fail_deletes.store(false, Ordering::SeqCst);

        // Inside the lease the claim might still land, so both paths agree it locks
        let eligibility = gate.check_eligibility("u1", "p1").await.unwrap();
        assert_eq!(
            eligibility,
            Eligibility::locked_until(t0() + TimeDelta::days(7))
        );
        assert!(matches!(
            gate.create_entry(entry("u1", "p1")).await,
            Err(JournalGateError::CadenceViolation { .. })
        ));

        clock.advance(TimeDelta::hours(1));
        assert_eq!(
            gate.check_eligibility("u1", "p1").await.unwrap(),
            Eligibility::open()
        );
        let created = gate.create_entry(entry("u1", "p1")).await.unwrap();
        assert_eq!(created.created_at, t0() + TimeDelta::hours(1));

        let stored = CadenceMarker::find(&store.inner, "u1", "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.marker.entry_id, created.id);
        assert_eq!(stored.revision, 2);

        let entries = gate.list_entries_with_feedback("u1", "p1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_entry_unlocks_pair() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (gate, clock) = gate_with(store.clone());
        let created = gate.create_entry(entry("u1", "p1")).await.unwrap();

        assert!(store.delete(JournalEntry::COLLECTION, &created.id).await.unwrap());
        clock.advance(TimeDelta::days(1));

        assert!(gate.check_eligibility("u1", "p1").await.unwrap().allowed);
        gate.create_entry(entry("u1", "p1")).await.unwrap();
        assert!(!gate.check_eligibility("u1", "p1").await.unwrap().allowed);
    }

    async fn sqlite_gate() -> (JournalGate, Arc<ManualClock>) {
        let db = DBService::new_in_memory().await.unwrap();
        gate_with(Arc::new(SqliteDocumentStore::new(db.pool)))
    }

    #[tokio::test]
    async fn test_sqlite_cadence_window() {
        let (gate, clock) = sqlite_gate().await;
        gate.create_entry(entry("u1", "p1")).await.unwrap();

        clock.set(t0() + TimeDelta::days(3));
        assert_eq!(
            gate.check_eligibility("u1", "p1").await.unwrap(),
            Eligibility::locked_until(t0() + TimeDelta::days(7))
        );
        assert!(matches!(
            gate.create_entry(entry("u1", "p1")).await,
            Err(JournalGateError::CadenceViolation { .. })
        ));
        assert!(gate.check_eligibility("u2", "p1").await.unwrap().allowed);

        clock.set(t0() + TimeDelta::days(7) + TimeDelta::milliseconds(1));
        assert_eq!(
            gate.check_eligibility("u1", "p1").await.unwrap(),
            Eligibility::open()
        );
        gate.create_entry(entry("u1", "p1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_list_entries_with_feedback() {
        let (gate, clock) = sqlite_gate().await;
        let older = gate.create_entry(entry("u1", "p1")).await.unwrap();
        clock.set(t0() + TimeDelta::days(8));
        let newer = gate.create_entry(entry("u1", "p1")).await.unwrap();

        gate.record_feedback(feedback(&newer.id, "p1", 4)).await.unwrap();
        clock.advance(TimeDelta::minutes(1));
        let latest = gate.record_feedback(feedback(&newer.id, "p1", 9)).await.unwrap();

        let listed = gate.list_entries_with_feedback("u1", "p1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].entry, newer);
        assert_eq!(listed[0].feedback.as_ref(), Some(&latest));
        assert_eq!(listed[1].entry, older);
        assert!(listed[1].feedback.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_creates_persist_exactly_one_entry() {
        let (gate, _) = sqlite_gate().await;

        let (a, b) = tokio::join!(
            gate.create_entry(entry("u1", "p1")),
            gate.create_entry(entry("u1", "p1"))
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        for result in [a, b] {
            if let Err(e) = result {
                assert!(matches!(e, JournalGateError::CadenceViolation { .. }));
            }
        }
        let entries = gate.list_entries_with_feedback("u1", "p1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_eligibility_serialization() {
        let open = serde_json::to_value(Eligibility::open()).unwrap();
        assert_eq!(open, serde_json::json!({ "allowed": true }));

        let locked = serde_json::to_value(Eligibility::locked_until(t0())).unwrap();
        assert_eq!(locked["allowed"], serde_json::json!(false));
        assert_eq!(
            locked["next_eligible_at"],
            serde_json::json!(t0().timestamp_millis())
        );
    }
}
