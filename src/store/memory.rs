//! In-memory key store backing a database handle.
//!
//! One mutex guards all state. Transactions snapshot the record map at
//! `begin`; abort swaps the snapshot back, commit drops it. That gives
//! the contract the core needs: no partially applied mutation survives
//! an abort, and sequences observed outside a transaction lag committed
//! state by at most one transaction.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::config::VersioningScheme;

use super::{ContentOption, DocumentFlags, KeyStore, Record, RecordUpdate, StoreError};

#[derive(Clone, Debug)]
struct StoredRecord {
    doc_type: Option<String>,
    flags: DocumentFlags,
    body: Bytes,
    extra: Bytes,
    version: Bytes,
    sequence: u64,
}

#[derive(Clone, Debug, Default)]
struct Inner {
    records: BTreeMap<String, StoredRecord>,
    last_sequence: u64,
    versioning: Option<VersioningScheme>,
    local_peer_id: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    inner: Inner,
    snapshot: Option<Inner>,
    read_only: bool,
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    state: Mutex<State>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        MemoryKeyStore::default()
    }

    pub fn read_only(read_only: bool) -> Self {
        MemoryKeyStore {
            state: Mutex::new(State {
                read_only,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("key store mutex poisoned")
    }

    pub fn record_count(&self) -> usize {
        self.lock().inner.records.len()
    }
}

fn to_record(key: &str, stored: &StoredRecord, content: ContentOption) -> Record {
    Record {
        key: key.to_string(),
        doc_type: stored.doc_type.clone(),
        flags: stored.flags,
        body: if content >= ContentOption::CurrentRevOnly {
            stored.body.clone()
        } else {
            Bytes::new()
        },
        extra: if content >= ContentOption::EntireBody {
            stored.extra.clone()
        } else {
            Bytes::new()
        },
        version: stored.version.clone(),
        sequence: stored.sequence,
        exists: true,
        content,
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key: &str, content: ContentOption) -> Result<Record, StoreError> {
        let state = self.lock();
        Ok(match state.inner.records.get(key) {
            Some(stored) => to_record(key, stored, content),
            None => Record::absent(key),
        })
    }

    fn get_by_sequence(
        &self,
        sequence: u64,
        content: ContentOption,
    ) -> Result<Option<Record>, StoreError> {
        let state = self.lock();
        Ok(state
            .inner
            .records
            .iter()
            .find(|(_, r)| r.sequence == sequence)
            .map(|(key, stored)| to_record(key, stored, content)))
    }

    fn set(&self, update: RecordUpdate) -> Result<Option<u64>, StoreError> {
        let mut state = self.lock();
        if state.read_only {
            return Err(StoreError::ReadOnly);
        }
        if state.snapshot.is_none() {
            return Err(StoreError::NotInTransaction);
        }

        let current_sequence = state
            .inner
            .records
            .get(&update.key)
            .map(|r| r.sequence)
            .unwrap_or(0);
        if update.update_sequence && current_sequence != update.sequence {
            return Ok(None);
        }

        let sequence = if update.update_sequence {
            state.inner.last_sequence += 1;
            state.inner.last_sequence
        } else {
            state.inner.last_sequence = state.inner.last_sequence.max(update.sequence);
            update.sequence
        };
        state.inner.records.insert(
            update.key,
            StoredRecord {
                doc_type: update.doc_type,
                flags: update.flags,
                body: update.body,
                extra: update.extra,
                version: update.version,
                sequence,
            },
        );
        Ok(Some(sequence))
    }

    fn purge(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.read_only {
            return Err(StoreError::ReadOnly);
        }
        if state.snapshot.is_none() {
            return Err(StoreError::NotInTransaction);
        }
        Ok(state.inner.records.remove(key).is_some())
    }

    fn enumerate_all(&self) -> Result<Vec<Record>, StoreError> {
        let state = self.lock();
        Ok(state
            .inner
            .records
            .iter()
            .map(|(key, stored)| to_record(key, stored, ContentOption::EntireBody))
            .collect())
    }

    fn begin(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.read_only {
            return Err(StoreError::ReadOnly);
        }
        if state.snapshot.is_some() {
            return Err(StoreError::TransactionBusy);
        }
        state.snapshot = Some(state.inner.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.snapshot.take().is_none() {
            return Err(StoreError::NotInTransaction);
        }
        Ok(())
    }

    fn abort(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state.snapshot.take() {
            Some(snapshot) => {
                state.inner = snapshot;
                Ok(())
            }
            None => Err(StoreError::NotInTransaction),
        }
    }

    fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    fn last_sequence(&self) -> u64 {
        self.lock().inner.last_sequence
    }

    fn versioning(&self) -> Option<VersioningScheme> {
        self.lock().inner.versioning
    }

    fn set_versioning(&self, scheme: VersioningScheme) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.read_only {
            return Err(StoreError::ReadOnly);
        }
        state.inner.versioning = Some(scheme);
        Ok(())
    }

    fn local_peer_id(&self) -> Option<u64> {
        self.lock().inner.local_peer_id
    }

    fn set_local_peer_id(&self, id: u64) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.read_only {
            return Err(StoreError::ReadOnly);
        }
        state.inner.local_peer_id = Some(id);
        Ok(())
    }
}
