use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{DocumentStore, StoreError, to_record};

/// Time of the last journal entry for one (user, plant) pair.
///
/// Entry creation claims this document with compare-and-set, so concurrent
/// writers for the same pair are serialized by the store. `entry_id` names
/// the entry the claim was made for; a marker whose entry never landed can
/// be checked against the entries collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CadenceMarker {
    pub user_id: String,
    pub plant_id: String,
    pub entry_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_entry_at: DateTime<Utc>,
}

/// A marker as read from the store, with the revision needed to replace it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCadenceMarker {
    pub marker: CadenceMarker,
    pub revision: i64,
}

impl CadenceMarker {
    pub const COLLECTION: &'static str = "journal_cadence";

    /// Document id for a pair. The user id is length-prefixed so that ids
    /// containing ':' cannot collide.
    pub fn key(user_id: &str, plant_id: &str) -> String {
        format!("{}:{}:{}", user_id.len(), user_id, plant_id)
    }

    pub async fn find(
        store: &dyn DocumentStore,
        user_id: &str,
        plant_id: &str,
    ) -> Result<Option<StoredCadenceMarker>, StoreError> {
        let Some(doc) = store
            .get(Self::COLLECTION, &Self::key(user_id, plant_id))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(StoredCadenceMarker {
            marker: serde_json::from_value(doc.data)?,
            revision: doc.revision,
        }))
    }

    /// Replace the stored marker if it is still at `expected_revision`
    /// (`None`: no marker yet). Returns false when another writer got there first.
    pub async fn swap(
        &self,
        store: &dyn DocumentStore,
        expected_revision: Option<i64>,
    ) -> Result<bool, StoreError> {
        store
            .compare_and_set(
                Self::COLLECTION,
                &Self::key(&self.user_id, &self.plant_id),
                expected_revision,
                to_record(self)?,
            )
            .await
    }

    pub async fn remove(
        store: &dyn DocumentStore,
        user_id: &str,
        plant_id: &str,
    ) -> Result<bool, StoreError> {
        store
            .delete(Self::COLLECTION, &Self::key(user_id, plant_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::MemoryDocumentStore;

    fn marker(at: DateTime<Utc>) -> CadenceMarker {
        CadenceMarker {
            user_id: "u1".to_string(),
            plant_id: "mint".to_string(),
            entry_id: "e1".to_string(),
            last_entry_at: at,
        }
    }

    #[test]
    fn test_key_is_unambiguous() {
        assert_ne!(CadenceMarker::key("a:b", "c"), CadenceMarker::key("a", "b:c"));
        assert_eq!(CadenceMarker::key("u1", "mint"), "2:u1:mint");
    }

    #[tokio::test]
    async fn test_swap_round_trip() {
        let store = MemoryDocumentStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        assert!(CadenceMarker::find(&store, "u1", "mint").await.unwrap().is_none());
        assert!(marker(t0).swap(&store, None).await.unwrap());
        assert!(!marker(t0).swap(&store, None).await.unwrap());

        let stored = CadenceMarker::find(&store, "u1", "mint").await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.marker, marker(t0));

        assert!(CadenceMarker::remove(&store, "u1", "mint").await.unwrap());
        assert!(CadenceMarker::find(&store, "u1", "mint").await.unwrap().is_none());
    }
}
