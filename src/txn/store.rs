//! Durable coordinator documents.

use super::participant_list::CommitDecision;
use crate::error::StoreError;
use crate::types::{ShardId, TxnId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Persisted state of one coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    pub txn: TxnId,
    /// Sorted participant list.
    pub participants: Vec<ShardId>,
    pub decision: Option<CommitDecision>,
}

/// Storage for coordinator documents, typically a replicated collection.
#[async_trait::async_trait]
pub trait CoordinatorStore: Send + Sync + std::fmt::Debug {
    /// Upsert the participant list.
    ///
    /// Succeeds if no document exists or the existing one has the same list.
    async fn persist_participant_list(
        &self,
        txn: TxnId,
        participants: &[ShardId],
    ) -> Result<(), StoreError>;

    /// Record the decision.
    ///
    /// Requires a document with the same participant list and either no
    /// decision or the same decision.
    async fn persist_decision(
        &self,
        txn: TxnId,
        participants: &[ShardId],
        decision: CommitDecision,
    ) -> Result<(), StoreError>;

    /// Delete the document. Requires a recorded decision.
    async fn delete(&self, txn: TxnId) -> Result<(), StoreError>;

    /// All stored documents, for recovery.
    async fn read_all(&self) -> Result<Vec<CoordinatorDocument>, StoreError>;
}

fn sorted(participants: &[ShardId]) -> Vec<ShardId> {
    let mut list = participants.to_vec();
    list.sort();
    list.dedup();
    list
}

/// Coordinator store keeping bincode-encoded documents in memory.
#[derive(Debug, Default)]
pub struct InMemoryCoordinatorStore {
    documents: Mutex<HashMap<TxnId, Vec<u8>>>,
}

impl InMemoryCoordinatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    /// Read one document.
    pub fn get(&self, txn: TxnId) -> Result<Option<CoordinatorDocument>, StoreError> {
        self.documents
            .lock()
            .get(&txn)
            .map(|bytes| decode(bytes))
            .transpose()
    }

    /// Store a document as-is.
    pub fn insert(&self, doc: &CoordinatorDocument) -> Result<(), StoreError> {
        let bytes = bincode::serialize(doc)?;
        self.documents.lock().insert(doc.txn, bytes);
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<CoordinatorDocument, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

#[async_trait::async_trait]
impl CoordinatorStore for InMemoryCoordinatorStore {
    async fn persist_participant_list(
        &self,
        txn: TxnId,
        participants: &[ShardId],
    ) -> Result<(), StoreError> {
        let participants = sorted(participants);
        let mut documents = self.documents.lock();

        if let Some(bytes) = documents.get(&txn) {
            let existing = decode(bytes)?;
            if existing.participants != participants {
                return Err(StoreError::DocumentConflict {
                    txn,
                    reason: format!(
                        "participant list {:?} differs from stored {:?}",
                        participants, existing.participants
                    ),
                });
            }
            return Ok(());
        }

        let doc = CoordinatorDocument {
            txn,
            participants,
            decision: None,
        };
        documents.insert(txn, bincode::serialize(&doc)?);
        Ok(())
    }

    async fn persist_decision(
        &self,
        txn: TxnId,
        participants: &[ShardId],
        decision: CommitDecision,
    ) -> Result<(), StoreError> {
        let participants = sorted(participants);
        let mut documents = self.documents.lock();

        let bytes = documents
            .get(&txn)
            .ok_or(StoreError::DocumentNotFound(txn))?;
        let mut doc = decode(bytes)?;
        if doc.participants != participants {
            return Err(StoreError::DocumentConflict {
                txn,
                reason: "participant list differs from stored document".to_string(),
            });
        }
        match doc.decision {
            Some(existing) if existing != decision => {
                return Err(StoreError::DocumentConflict {
                    txn,
                    reason: format!("decision {} differs from stored {}", decision, existing),
                });
            }
            Some(_) => return Ok(()),
            None => {}
        }

        doc.decision = Some(decision);
        documents.insert(txn, bincode::serialize(&doc)?);
        Ok(())
    }

    async fn delete(&self, txn: TxnId) -> Result<(), StoreError> {
        let mut documents = self.documents.lock();
        let bytes = documents
            .get(&txn)
            .ok_or(StoreError::DocumentNotFound(txn))?;
        if decode(bytes)?.decision.is_none() {
            return Err(StoreError::MissingDecision(txn));
        }
        documents.remove(&txn);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<CoordinatorDocument>, StoreError> {
        self.documents
            .lock()
            .values()
            .map(|bytes| decode(bytes))
            .collect()
    }
}
