use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{DocumentStore, Filter, OrderBy, StoreError, to_record};

/// A user's journal note about one of their plants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub id: String,
    pub user_id: String,
    pub plant_id: String,
    pub content: String,
    pub mood: Option<String>,
    pub growth_stage: Option<String>,
    pub image_url: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the caller when creating an entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateJournalEntry {
    pub user_id: String,
    pub plant_id: String,
    pub content: String,
    pub mood: Option<String>,
    pub growth_stage: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Serialize)]
struct JournalEntryRecord<'a> {
    #[serde(flatten)]
    data: &'a CreateJournalEntry,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub const COLLECTION: &'static str = "journal_entries";

    /// Fresh id for an entry about to be written with [`Self::create`]
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Persist the entry under `id`. Returns `None` if that id is already taken.
    pub async fn create(
        store: &dyn DocumentStore,
        id: &str,
        data: &CreateJournalEntry,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Self>, StoreError> {
        let record = to_record(&JournalEntryRecord { data, created_at })?;
        if !store
            .compare_and_set(Self::COLLECTION, id, None, record)
            .await?
        {
            return Ok(None);
        }

        Ok(Some(Self {
            id: id.to_string(),
            user_id: data.user_id.clone(),
            plant_id: data.plant_id.clone(),
            content: data.content.clone(),
            mood: data.mood.clone(),
            growth_stage: data.growth_stage.clone(),
            image_url: data.image_url.clone(),
            created_at,
        }))
    }

    pub async fn find_by_id(
        store: &dyn DocumentStore,
        id: &str,
    ) -> Result<Option<Self>, StoreError> {
        store
            .get(Self::COLLECTION, id)
            .await?
            .map(|doc| doc.decode())
            .transpose()
    }

    /// Most recent entry for the exact (user, plant) pair
    pub async fn find_latest_for_plant(
        store: &dyn DocumentStore,
        user_id: &str,
        plant_id: &str,
    ) -> Result<Option<Self>, StoreError> {
        let docs = store
            .query_top_n(
                Self::COLLECTION,
                &pair_filters(user_id, plant_id),
                Some(&OrderBy::desc("created_at")),
                1,
            )
            .await?;
        docs.first().map(|doc| doc.decode()).transpose()
    }

    /// All entries for the (user, plant) pair, newest first
    pub async fn find_all_for_plant(
        store: &dyn DocumentStore,
        user_id: &str,
        plant_id: &str,
    ) -> Result<Vec<Self>, StoreError> {
        store
            .query_all(
                Self::COLLECTION,
                &pair_filters(user_id, plant_id),
                Some(&OrderBy::desc("created_at")),
            )
            .await?
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }
}

fn pair_filters(user_id: &str, plant_id: &str) -> [Filter; 2] {
    [
        Filter::eq("user_id", user_id),
        Filter::eq("plant_id", plant_id),
    ]
}
