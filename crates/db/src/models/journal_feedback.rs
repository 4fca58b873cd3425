use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{DocumentStore, Filter, OrderBy, StoreError, to_record};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error(
    "growth rating {0} is outside {min}..={max}",
    min = GrowthRating::MIN,
    max = GrowthRating::MAX
)]
pub struct GrowthRatingOutOfRange(pub i64);

/// Growth score in `1..=10` assigned by the feedback evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct GrowthRating(u8);

impl GrowthRating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: i64) -> Result<Self, GrowthRatingOutOfRange> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(GrowthRatingOutOfRange(value))
        }
    }

    /// Clamp an arbitrary score into the valid range
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(i64::from(Self::MIN), i64::from(Self::MAX)) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for GrowthRating {
    type Error = GrowthRatingOutOfRange;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GrowthRating> for i64 {
    fn from(rating: GrowthRating) -> Self {
        i64::from(rating.0)
    }
}

/// AI-generated evaluation of a journal entry, linked by `journal_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalFeedback {
    pub id: String,
    pub journal_id: String,
    pub plant_id: String,
    pub summary: String,
    pub growth_rating: GrowthRating,
    pub tips: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Feedback as submitted by the evaluation job; the rating is validated on record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateJournalFeedback {
    pub journal_id: String,
    pub plant_id: String,
    pub summary: String,
    pub growth_rating: i64,
    #[serde(default)]
    pub tips: Vec<String>,
}

#[derive(Serialize)]
struct JournalFeedbackRecord<'a> {
    journal_id: &'a str,
    plant_id: &'a str,
    summary: &'a str,
    growth_rating: GrowthRating,
    tips: &'a [String],
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
}

impl JournalFeedback {
    pub const COLLECTION: &'static str = "journal_feedback";

    pub async fn create(
        store: &dyn DocumentStore,
        data: &CreateJournalFeedback,
        growth_rating: GrowthRating,
        created_at: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let record = to_record(&JournalFeedbackRecord {
            journal_id: &data.journal_id,
            plant_id: &data.plant_id,
            summary: &data.summary,
            growth_rating,
            tips: &data.tips,
            created_at,
        })?;
        let id = store.insert(Self::COLLECTION, record).await?;

        Ok(Self {
            id,
            journal_id: data.journal_id.clone(),
            plant_id: data.plant_id.clone(),
            summary: data.summary.clone(),
            growth_rating,
            tips: data.tips.clone(),
            created_at,
        })
    }

    /// All feedback recorded for a plant, oldest first
    pub async fn find_by_plant_id(
        store: &dyn DocumentStore,
        plant_id: &str,
    ) -> Result<Vec<Self>, StoreError> {
        store
            .query_all(
                Self::COLLECTION,
                &[Filter::eq("plant_id", plant_id)],
                Some(&OrderBy::asc("created_at")),
            )
            .await?
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }
}
