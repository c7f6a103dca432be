//! Delivery ledger port: durable, idempotent intake.
//!
//! The ledger is the only place deduplication happens. `register` is a
//! conditional insert; under any number of concurrent callers with the same
//! delivery id exactly one receives [`RegisterOutcome::Accepted`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Delivery, DeliveryId, MalformedEvent, RunCheckpoint, RunId, RunKey, StorageError, Timestamp,
};

/// What became of a delivery when it was first seen. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// A run was started for it.
    Accepted {
        /// The run started for this delivery.
        run_id: RunId,
    },
    /// The payload was malformed; no run was started.
    Rejected {
        /// Why it was rejected.
        reason: String,
    },
}

/// Ledger entry for one delivery id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Transport-assigned id.
    pub delivery_id: DeliveryId,
    /// First-seen time; drives retention.
    pub received_at: Timestamp,
    /// First-seen outcome.
    pub outcome: DeliveryOutcome,
}

/// Result of [`DeliveryLedger::register`].
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    /// First sighting. The returned checkpoint is already durable in
    /// state `Registered`.
    Accepted(RunCheckpoint),
    /// First sighting of a malformed delivery, now recorded; no run exists.
    Rejected(DeliveryRecord),
    /// Already seen; the caller acknowledges and does nothing else.
    Duplicate(DeliveryRecord),
}

impl RegisterOutcome {
    /// True for [`RegisterOutcome::Duplicate`].
    pub fn is_duplicate(&self) -> bool {
        matches!(self, RegisterOutcome::Duplicate(_))
    }
}

/// Durable store of processed delivery ids.
///
/// A record for an id implies its run has started (the `Registered`
/// checkpoint is written in the same transaction) or the delivery was
/// rejected as malformed.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Inserts the delivery if absent and creates its run.
    ///
    /// `Err` means nothing was written; the caller must not proceed and
    /// relies on upstream redelivery.
    async fn register(
        &self,
        delivery: &Delivery,
        run_key: &RunKey,
    ) -> Result<RegisterOutcome, StorageError>;

    /// Records a malformed delivery (with its payload, for inspection) so that
    /// redeliveries are acknowledged as duplicates.
    async fn reject(
        &self,
        delivery: &Delivery,
        error: &MalformedEvent,
    ) -> Result<RegisterOutcome, StorageError>;

    /// Looks up a delivery record.
    async fn record(&self, delivery_id: &DeliveryId)
        -> Result<Option<DeliveryRecord>, StorageError>;

    /// Deletes records first seen before `cutoff` whose runs are terminal.
    /// Returns how many records were removed.
    async fn prune_expired(&self, cutoff: Timestamp) -> Result<u64, StorageError>;
}
