//! Globally Unique Id Generator
//!
//! Composes `(now - ID_EPOCH) << 32 | sequence`, where `sequence` is an
//! atomic `INCR` on `icr:{business_prefix}:{yyyy:MM:dd}` in the shared
//! key-value store. Every process minting ids for the same prefix shares
//! the counter, so no coordination beyond the store is needed.
//!
//! # Limits
//!
//! - At most 2^32 ids per prefix per UTC day. Exceeding it is not guarded.
//! - Wall-clock based. A clock stepping backwards can reuse a timestamp;
//!   the shared daily counter still keeps ids distinct within one day.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::trace;

use crate::domain::ports::{GeneratedId, KeyValueStore, ID_EPOCH_SECONDS};
use crate::error::{Error, Result};

/// Key namespace for sequence counters
pub const SEQUENCE_KEY_PREFIX: &str = "icr:";

/// Counter key for one business prefix on one UTC day.
pub fn sequence_key(business_prefix: &str, date: NaiveDate) -> String {
    format!(
        "{}{}:{}",
        SEQUENCE_KEY_PREFIX,
        business_prefix,
        date.format("%Y:%m:%d")
    )
}

/// Mints `GeneratedId`s backed by a shared key-value store
#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn KeyValueStore>,
}

impl IdGenerator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Mint the next id for `business_prefix` at the current time.
    pub async fn next_id(&self, business_prefix: &str) -> Result<GeneratedId> {
        self.next_id_at(business_prefix, Utc::now()).await
    }

    /// Mint the next id as if the current time were `now`.
    pub async fn next_id_at(
        &self,
        business_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<GeneratedId> {
        let relative_seconds = now.timestamp() - ID_EPOCH_SECONDS;
        if relative_seconds < 0 {
            return Err(Error::Internal(format!(
                "clock {} precedes the id epoch",
                now
            )));
        }

        let key = sequence_key(business_prefix, now.date_naive());
        let sequence = self.store.increment(&key).await?;
        let id = GeneratedId::compose(relative_seconds, sequence);

        trace!(key = %key, sequence, id = %id, "Minted id");
        Ok(id)
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
