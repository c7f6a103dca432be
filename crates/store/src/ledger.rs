//! [`DeliveryLedger`] and [`RunStore`] on SQLite.
//!
//! Registration inserts the delivery row and the `Registered` run row in one
//! `IMMEDIATE` transaction, so a delivery record always implies a run.

use async_trait::async_trait;
use pipeline::{
    Delivery, DeliveryId, DeliveryLedger, DeliveryOutcome, DeliveryRecord, MalformedEvent,
    RegisterOutcome, RunCheckpoint, RunId, RunKey, RunState, RunStore, StorageError, Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::sqlite::{json_error, sql_error, SqliteStore};

const TERMINAL_STATES: &str = "('completed', 'failed', 'cancelled')";

#[async_trait]
impl DeliveryLedger for SqliteStore {
    async fn register(
        &self,
        delivery: &Delivery,
        run_key: &RunKey,
    ) -> Result<RegisterOutcome, StorageError> {
        let checkpoint = RunCheckpoint::registered(RunId::new_random(), run_key.clone(), delivery.clone());
        let checkpoint_json =
            serde_json::to_string(&checkpoint).map_err(json_error("run checkpoint"))?;
        let payload = serde_json::to_string(&delivery.payload).map_err(json_error("payload"))?;
        let delivery_id = delivery.delivery_id.clone();
        let event = delivery.event.clone();
        let received_at = delivery.received_at.unix_millis();

        self.blocking("register delivery", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| sql_error("register delivery", e))?;

            let inserted = tx
                .execute(
                    "INSERT INTO deliveries (delivery_id, event, received_at, outcome, run_id, reason, payload)
                     VALUES (?1, ?2, ?3, 'accepted', ?4, NULL, ?5)
                     ON CONFLICT(delivery_id) DO NOTHING",
                    params![
                        delivery_id.as_str(),
                        event,
                        received_at,
                        checkpoint.run_id.to_string(),
                        payload
                    ],
                )
                .map_err(|e| sql_error("register delivery", e))?;

            if inserted == 0 {
                let record = read_record(&tx, &delivery_id)?.ok_or_else(|| {
                    StorageError::corruption("delivery record vanished during registration")
                })?;
                return Ok(RegisterOutcome::Duplicate(record));
            }

            tx.execute(
                "INSERT INTO runs (run_id, delivery_id, run_key, state, checkpoint, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    checkpoint.run_id.to_string(),
                    delivery_id.as_str(),
                    checkpoint.run_key.to_string(),
                    checkpoint.state.as_str(),
                    checkpoint_json,
                    checkpoint.created_at.unix_millis()
                ],
            )
            .map_err(|e| sql_error("create run", e))?;

            tx.commit().map_err(|e| sql_error("register delivery", e))?;
            Ok(RegisterOutcome::Accepted(checkpoint))
        })
        .await
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        error: &MalformedEvent,
    ) -> Result<RegisterOutcome, StorageError> {
        let payload = serde_json::to_string(&delivery.payload).map_err(json_error("payload"))?;
        let delivery_id = delivery.delivery_id.clone();
        let event = delivery.event.clone();
        let received_at = delivery.received_at;
        let reason = error.to_string();

        self.blocking("reject delivery", move |conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO deliveries (delivery_id, event, received_at, outcome, run_id, reason, payload)
                     VALUES (?1, ?2, ?3, 'rejected', NULL, ?4, ?5)
                     ON CONFLICT(delivery_id) DO NOTHING",
                    params![delivery_id.as_str(), event, received_at.unix_millis(), reason, payload],
                )
                .map_err(|e| sql_error("reject delivery", e))?;

            if inserted == 0 {
                let record = read_record(conn, &delivery_id)?.ok_or_else(|| {
                    StorageError::corruption("delivery record vanished during rejection")
                })?;
                return Ok(RegisterOutcome::Duplicate(record));
            }
            Ok(RegisterOutcome::Rejected(DeliveryRecord {
                delivery_id,
                received_at,
                outcome: DeliveryOutcome::Rejected { reason },
            }))
        })
        .await
    }

    async fn record(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeliveryRecord>, StorageError> {
        let delivery_id = delivery_id.clone();
        self.blocking("read delivery", move |conn| read_record(conn, &delivery_id))
            .await
    }

    async fn prune_expired(&self, cutoff: Timestamp) -> Result<u64, StorageError> {
        let cutoff_millis = cutoff.unix_millis();
        let removed = self
            .blocking("prune deliveries", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| sql_error("prune deliveries", e))?;

                tx.execute(
                    &format!(
                        "DELETE FROM runs
                         WHERE state IN {TERMINAL_STATES}
                           AND delivery_id IN (SELECT delivery_id FROM deliveries WHERE received_at < ?1)"
                    ),
                    params![cutoff_millis],
                )
                .map_err(|e| sql_error("prune runs", e))?;

                let removed = tx
                    .execute(
                        "DELETE FROM deliveries
                         WHERE received_at < ?1
                           AND NOT EXISTS (SELECT 1 FROM runs r WHERE r.delivery_id = deliveries.delivery_id)",
                        params![cutoff_millis],
                    )
                    .map_err(|e| sql_error("prune deliveries", e))?;

                tx.commit().map_err(|e| sql_error("prune deliveries", e))?;
                Ok(removed as u64)
            })
            .await?;

        tracing::info!(removed, cutoff = %cutoff, "Pruned expired delivery records");
        Ok(removed)
    }
}

fn read_record(
    conn: &Connection,
    delivery_id: &DeliveryId,
) -> Result<Option<DeliveryRecord>, StorageError> {
    let row: Option<(i64, String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT received_at, outcome, run_id, reason FROM deliveries WHERE delivery_id = ?1",
            params![delivery_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(|e| sql_error("read delivery", e))?;

    let Some((received_at, outcome, run_id, reason)) = row else {
        return Ok(None);
    };
    let received_at = Timestamp::from_unix_millis(received_at)
        .ok_or_else(|| StorageError::corruption("delivery received_at"))?;
    let outcome = match (outcome.as_str(), run_id, reason) {
        ("accepted", Some(run_id), _) => DeliveryOutcome::Accepted {
            run_id: RunId::parse(&run_id)
                .ok_or_else(|| StorageError::corruption("delivery run_id"))?,
        },
        ("rejected", _, reason) => DeliveryOutcome::Rejected {
            reason: reason.unwrap_or_default(),
        },
        _ => return Err(StorageError::corruption("delivery outcome")),
    };
    Ok(Some(DeliveryRecord {
        delivery_id: delivery_id.clone(),
        received_at,
        outcome,
    }))
}

// ---------------------------------------------------------------------------
// Run store
// ---------------------------------------------------------------------------

#[async_trait]
impl RunStore for SqliteStore {
    async fn load(&self, run_id: RunId) -> Result<Option<RunCheckpoint>, StorageError> {
        self.blocking("load run", move |conn| {
            conn.query_row(
                "SELECT checkpoint FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| sql_error("load run", e))?
            .map(|json| decode_checkpoint(&json))
            .transpose()
        })
        .await
    }

    async fn save(
        &self,
        checkpoint: &RunCheckpoint,
        expected: RunState,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(checkpoint).map_err(json_error("run checkpoint"))?;
        let run_id = checkpoint.run_id;
        let state = checkpoint.state;
        let updated_at = checkpoint.updated_at.unix_millis();

        self.blocking("save run", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE runs SET state = ?1, checkpoint = ?2, updated_at = ?3
                     WHERE run_id = ?4 AND state = ?5",
                    params![
                        state.as_str(),
                        json,
                        updated_at,
                        run_id.to_string(),
                        expected.as_str()
                    ],
                )
                .map_err(|e| sql_error("save run", e))?;
            if changed == 1 {
                return Ok(());
            }
            let actual: Option<String> = conn
                .query_row(
                    "SELECT state FROM runs WHERE run_id = ?1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| sql_error("save run", e))?;
            match actual {
                Some(actual) => Err(StorageError::conflict(
                    "save run",
                    format!("run {run_id} is '{actual}', expected '{expected}'"),
                )),
                None => Err(StorageError::DanglingReference {
                    message: format!("run {run_id} does not exist"),
                }),
            }
        })
        .await
    }

    async fn unfinished(&self) -> Result<Vec<RunCheckpoint>, StorageError> {
        self.blocking("list unfinished runs", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT checkpoint FROM runs WHERE state NOT IN {TERMINAL_STATES}
                     ORDER BY created_at, rowid"
                ))
                .map_err(|e| sql_error("list unfinished runs", e))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| sql_error("list unfinished runs", e))?;

            let mut runs = Vec::new();
            for row in rows {
                let json = row.map_err(|e| sql_error("list unfinished runs", e))?;
                runs.push(decode_checkpoint(&json)?);
            }
            Ok(runs)
        })
        .await
    }

    async fn by_delivery(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<RunCheckpoint>, StorageError> {
        let delivery_id = delivery_id.clone();
        self.blocking("load run by delivery", move |conn| {
            conn.query_row(
                "SELECT checkpoint FROM runs WHERE delivery_id = ?1",
                params![delivery_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| sql_error("load run by delivery", e))?
            .map(|json| decode_checkpoint(&json))
            .transpose()
        })
        .await
    }
}

fn decode_checkpoint(json: &str) -> Result<RunCheckpoint, StorageError> {
    serde_json::from_str(json).map_err(json_error("run checkpoint"))
}
