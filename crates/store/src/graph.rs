//! [`KnowledgeGraph`] on SQLite.
//!
//! A batch is applied inside one `IMMEDIATE` transaction: entity upserts
//! first (in batch order, so edge endpoints exist), then edges, stale
//! marks, and policy evaluations. Attribute merge is done in Rust over the
//! row read inside the same transaction, so concurrent writers serialise on
//! the write lock and the last one wins per attribute key.

use async_trait::async_trait;
use pipeline::{
    Direction, EdgeKind, Embedding, EntityId, EntityKind, EntityRecord, EvaluationResult,
    FilePath, GraphStats, GraphWriteBatch, GraphWriteReceipt, KnowledgeGraph, NaturalKey,
    Neighbor, PolicyEvaluation, PolicyId, RepositoryName, SimilarEntity, StorageError,
    Timestamp,
};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::sqlite::{json_error, sql_error, SqliteStore};

const ENTITY_COLUMNS: &str =
    "n.id, n.kind, n.natural_key, n.repository, n.file_path, n.attributes, n.stale, n.updated_at";

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct EntityRow {
    id: i64,
    kind: String,
    key: String,
    repository: Option<String>,
    file_path: Option<String>,
    attributes: String,
    stale: bool,
    updated_at: i64,
}

impl EntityRow {
    /// Reads the [`ENTITY_COLUMNS`] starting at column `offset`.
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            kind: row.get(offset + 1)?,
            key: row.get(offset + 2)?,
            repository: row.get(offset + 3)?,
            file_path: row.get(offset + 4)?,
            attributes: row.get(offset + 5)?,
            stale: row.get(offset + 6)?,
            updated_at: row.get(offset + 7)?,
        })
    }

    fn into_record(self) -> Result<EntityRecord, StorageError> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| StorageError::corruption(format!("entity kind '{}'", self.kind)))?;
        let attributes: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.attributes).map_err(json_error("entity attributes"))?;
        Ok(EntityRecord {
            id: EntityId::new(self.id as u64),
            kind,
            key: NaturalKey::from_raw(self.key),
            repository: self.repository.and_then(RepositoryName::new),
            file_path: self.file_path.and_then(FilePath::new),
            attributes,
            stale: self.stale,
            updated_at: Timestamp::from_unix_millis(self.updated_at)
                .ok_or_else(|| StorageError::corruption("entity updated_at"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

fn apply_batch(tx: &Transaction<'_>, batch: &GraphWriteBatch) -> Result<GraphWriteReceipt, StorageError> {
    let now = Timestamp::now().unix_millis();
    let mut receipt = GraphWriteReceipt::default();

    for upsert in batch.entities() {
        let existing: Option<String> = tx
            .query_row(
                "SELECT attributes FROM entities WHERE kind = ?1 AND natural_key = ?2",
                params![upsert.kind.as_str(), upsert.key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sql_error("read entity", e))?;

        let mut attributes = match existing {
            Some(json) => serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&json)
                .map_err(json_error("entity attributes"))?,
            None => serde_json::Map::new(),
        };
        attributes.extend(upsert.attributes.clone());
        let attributes =
            serde_json::to_string(&attributes).map_err(json_error("entity attributes"))?;
        let embedding = upsert
            .embedding
            .as_ref()
            .map(|e| serde_json::to_string(e.as_slice()))
            .transpose()
            .map_err(json_error("embedding"))?;

        let id: i64 = tx
            .query_row(
                "INSERT INTO entities (kind, natural_key, repository, file_path, attributes, embedding, stale, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
                 ON CONFLICT(kind, natural_key) DO UPDATE SET
                     repository = COALESCE(excluded.repository, entities.repository),
                     file_path = COALESCE(excluded.file_path, entities.file_path),
                     attributes = excluded.attributes,
                     embedding = COALESCE(excluded.embedding, entities.embedding),
                     stale = 0,
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    upsert.kind.as_str(),
                    upsert.key.as_str(),
                    upsert.repository.as_ref().map(|r| r.as_str()),
                    upsert.file_path.as_ref().map(|p| p.as_str()),
                    attributes,
                    embedding,
                    now
                ],
                |row| row.get(0),
            )
            .map_err(|e| sql_error("upsert entity", e))?;
        receipt.entity_ids.push(EntityId::new(id as u64));
    }

    for edge in batch.edges() {
        let resolve = |index: usize| {
            receipt.entity_ids.get(index).copied().ok_or_else(|| StorageError::DanglingReference {
                message: format!("edge endpoint #{index} is not part of the batch"),
            })
        };
        let from = resolve(edge.from.index())?;
        let to = resolve(edge.to.index())?;
        let created = tx
            .execute(
                "INSERT INTO edges (src, dst, kind, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(src, dst, kind) DO NOTHING",
                params![from.as_u64() as i64, to.as_u64() as i64, edge.kind.as_str(), now],
            )
            .map_err(|e| sql_error("upsert edge", e))?;
        receipt.edges_created += created;
    }

    for mark in batch.stale_marks() {
        tx.execute(
            "UPDATE entities SET stale = 1, updated_at = ?1
             WHERE repository = ?2 AND file_path = ?3 AND kind IN ('file', 'symbol')",
            params![now, mark.repository.as_str(), mark.file_path.as_str()],
        )
        .map_err(|e| sql_error("mark stale", e))?;
    }

    for evaluation in batch.evaluations() {
        let pr_exists: bool = tx
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM entities WHERE kind = 'pull_request' AND natural_key = ?1)",
                params![evaluation.pull_request.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| sql_error("record evaluation", e))?;
        if !pr_exists {
            return Err(StorageError::DanglingReference {
                message: format!(
                    "policy evaluation references unknown pull request {}",
                    evaluation.pull_request
                ),
            });
        }
        tx.execute(
            "INSERT INTO policy_evaluations (pull_request, policy_id, result, reason, evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pull_request, policy_id) DO UPDATE SET
                 result = excluded.result,
                 reason = excluded.reason,
                 evaluated_at = excluded.evaluated_at",
            params![
                evaluation.pull_request.as_str(),
                evaluation.policy_id.as_str(),
                evaluation.result.as_str(),
                evaluation.reason,
                evaluation.evaluated_at.unix_millis()
            ],
        )
        .map_err(|e| sql_error("record evaluation", e))?;
    }

    Ok(receipt)
}

// ---------------------------------------------------------------------------
// Port implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl KnowledgeGraph for SqliteStore {
    async fn apply(&self, batch: &GraphWriteBatch) -> Result<GraphWriteReceipt, StorageError> {
        if batch.is_empty() {
            return Ok(GraphWriteReceipt::default());
        }
        let batch = batch.clone();
        let receipt = self
            .blocking("apply graph batch", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| sql_error("apply graph batch", e))?;
                // Dropping the transaction on error rolls it back.
                let receipt = apply_batch(&tx, &batch)?;
                tx.commit().map_err(|e| sql_error("apply graph batch", e))?;
                Ok(receipt)
            })
            .await?;
        tracing::debug!(
            entities = receipt.entity_ids.len(),
            edges_created = receipt.edges_created,
            "Graph batch committed"
        );
        Ok(receipt)
    }

    async fn entity(
        &self,
        kind: EntityKind,
        key: &NaturalKey,
    ) -> Result<Option<EntityRecord>, StorageError> {
        let key = key.clone();
        self.blocking("read entity", move |conn| {
            conn.query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities n WHERE n.kind = ?1 AND n.natural_key = ?2"),
                params![kind.as_str(), key.as_str()],
                |row| EntityRow::from_row(row, 0),
            )
            .optional()
            .map_err(|e| sql_error("read entity", e))?
            .map(EntityRow::into_record)
            .transpose()
        })
        .await
    }

    async fn entities_in(
        &self,
        kind: EntityKind,
        repository: &RepositoryName,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        let repository = repository.clone();
        self.blocking("list entities", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities n
                     WHERE n.kind = ?1 AND n.repository = ?2 AND n.stale = 0
                     ORDER BY n.id"
                ))
                .map_err(|e| sql_error("list entities", e))?;
            let rows = stmt
                .query_map(params![kind.as_str(), repository.as_str()], |row| {
                    EntityRow::from_row(row, 0)
                })
                .map_err(|e| sql_error("list entities", e))?;
            let records = rows
                .map(|row| row.map_err(|e| sql_error("list entities", e))?.into_record())
                .collect::<Result<Vec<_>, _>>();
            records
        })
        .await
    }

    async fn neighbors(
        &self,
        id: EntityId,
        direction: Direction,
        edge: Option<EdgeKind>,
    ) -> Result<Vec<Neighbor>, StorageError> {
        let (anchor, other) = match direction {
            Direction::Outgoing => ("src", "dst"),
            Direction::Incoming => ("dst", "src"),
        };
        self.blocking("traverse edges", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT e.kind, {ENTITY_COLUMNS}
                     FROM edges e JOIN entities n ON n.id = e.{other}
                     WHERE e.{anchor} = ?1 AND (?2 IS NULL OR e.kind = ?2)
                     ORDER BY e.kind, n.id"
                ))
                .map_err(|e| sql_error("traverse edges", e))?;
            let rows = stmt
                .query_map(
                    params![id.as_u64() as i64, edge.map(EdgeKind::as_str)],
                    |row| Ok((row.get::<_, String>(0)?, EntityRow::from_row(row, 1)?)),
                )
                .map_err(|e| sql_error("traverse edges", e))?;

            let mut neighbors = Vec::new();
            for row in rows {
                let (kind, entity) = row.map_err(|e| sql_error("traverse edges", e))?;
                let edge = EdgeKind::parse(&kind)
                    .ok_or_else(|| StorageError::corruption(format!("edge kind '{kind}'")))?;
                neighbors.push(Neighbor {
                    edge,
                    entity: entity.into_record()?,
                });
            }
            Ok(neighbors)
        })
        .await
    }

    async fn nearest(
        &self,
        kind: EntityKind,
        query: &Embedding,
        repository: Option<&RepositoryName>,
        limit: usize,
    ) -> Result<Vec<SimilarEntity>, StorageError> {
        let query = query.clone();
        let repository = repository.cloned();
        self.blocking("nearest entities", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT n.embedding, {ENTITY_COLUMNS} FROM entities n
                     WHERE n.kind = ?1 AND n.stale = 0 AND n.embedding IS NOT NULL
                       AND (?2 IS NULL OR n.repository = ?2)"
                ))
                .map_err(|e| sql_error("nearest entities", e))?;
            let rows = stmt
                .query_map(
                    params![kind.as_str(), repository.as_ref().map(|r| r.as_str())],
                    |row| Ok((row.get::<_, String>(0)?, EntityRow::from_row(row, 1)?)),
                )
                .map_err(|e| sql_error("nearest entities", e))?;

            let mut scored = Vec::new();
            for row in rows {
                let (vector, entity) = row.map_err(|e| sql_error("nearest entities", e))?;
                let values: Vec<f32> =
                    serde_json::from_str(&vector).map_err(json_error("embedding"))?;
                let Some(score) = Embedding::new(values).and_then(|e| e.cosine_similarity(&query))
                else {
                    continue;
                };
                scored.push(SimilarEntity {
                    entity: entity.into_record()?,
                    score,
                });
            }
            scored.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.entity.id.cmp(&b.entity.id))
            });
            scored.truncate(limit);
            Ok(scored)
        })
        .await
    }

    async fn evaluations(
        &self,
        pull_request: &NaturalKey,
    ) -> Result<Vec<PolicyEvaluation>, StorageError> {
        let pull_request = pull_request.clone();
        self.blocking("read evaluations", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT policy_id, result, reason, evaluated_at FROM policy_evaluations
                     WHERE pull_request = ?1 ORDER BY policy_id",
                )
                .map_err(|e| sql_error("read evaluations", e))?;
            let rows = stmt
                .query_map(params![pull_request.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|e| sql_error("read evaluations", e))?;

            let mut evaluations = Vec::new();
            for row in rows {
                let (policy_id, result, reason, evaluated_at) =
                    row.map_err(|e| sql_error("read evaluations", e))?;
                let result = match result.as_str() {
                    "allow" => EvaluationResult::Allow,
                    "deny" => EvaluationResult::Deny,
                    other => {
                        return Err(StorageError::corruption(format!(
                            "evaluation result '{other}'"
                        )))
                    }
                };
                evaluations.push(PolicyEvaluation {
                    pull_request: pull_request.clone(),
                    policy_id: PolicyId::new(policy_id)
                        .ok_or_else(|| StorageError::corruption("evaluation policy_id"))?,
                    result,
                    reason,
                    evaluated_at: Timestamp::from_unix_millis(evaluated_at)
                        .ok_or_else(|| StorageError::corruption("evaluation evaluated_at"))?,
                });
            }
            Ok(evaluations)
        })
        .await
    }

    async fn stats(&self) -> Result<GraphStats, StorageError> {
        self.blocking("graph stats", |conn| {
            conn.query_row(
                "SELECT (SELECT COUNT(*) FROM entities),
                        (SELECT COUNT(*) FROM edges),
                        (SELECT COUNT(*) FROM policy_evaluations)",
                [],
                |row| {
                    Ok(GraphStats {
                        entities: row.get::<_, i64>(0)? as u64,
                        edges: row.get::<_, i64>(1)? as u64,
                        evaluations: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .map_err(|e| sql_error("graph stats", e))
        })
        .await
    }
}
