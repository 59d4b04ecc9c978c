//! Durable uuid-keyed predicate registry on top of the `predicate_registry`
//! and `predicate_status` column families.
//!
//! Reads are lock-free (RocksDB snapshot semantics); writes for a given
//! uuid are serialized through `db.put_cf`, which RocksDB already makes
//! atomic per key - no separate mutex needed for single-key updates. The
//! `AtomicBatchWriter` is reserved for operations that must touch both CFs
//! together (register/deregister).

use std::sync::Arc;

use rocksdb::DB;

use crate::atomic_writer::AtomicBatchWriter;
use crate::error::EngineError;

use super::types::{Predicate, PredicateStatus};

const CF_REGISTRY: &str = "predicate_registry";
const CF_STATUS: &str = "predicate_status";

pub struct PredicateStore {
    db: Arc<DB>,
}

impl PredicateStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    /// Registers a predicate with status `New`. Errors if the uuid is
    /// already present - re-registration is deregister-then-register.
    pub async fn register(&self, predicate: Predicate) -> Result<(), EngineError> {
        if self.get(&predicate.uuid).await?.is_some() {
            return Err(EngineError::predicate_authoring(format!(
                "predicate {} is already registered",
                predicate.uuid
            )));
        }

        let predicate_bytes = serde_json::to_vec(&predicate)?;
        let status_bytes = serde_json::to_vec(&PredicateStatus::New)?;

        let mut writer = AtomicBatchWriter::new(self.db.clone(), 2);
        writer.put(CF_REGISTRY, predicate.uuid.as_bytes().to_vec(), predicate_bytes);
        writer.put(CF_STATUS, predicate.uuid.as_bytes().to_vec(), status_bytes);
        writer
            .flush()
            .await
            .map_err(|e| EngineError::transient(e.to_string()))
    }

    pub async fn deregister(&self, uuid: &str) -> Result<(), EngineError> {
        let mut writer = AtomicBatchWriter::new(self.db.clone(), 2);
        writer.delete(CF_REGISTRY, uuid.as_bytes().to_vec());
        writer.delete(CF_STATUS, uuid.as_bytes().to_vec());
        writer
            .flush()
            .await
            .map_err(|e| EngineError::transient(e.to_string()))
    }

    pub async fn get(&self, uuid: &str) -> Result<Option<Predicate>, EngineError> {
        let db = self.db.clone();
        let uuid = uuid.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Predicate>, EngineError> {
            let cf = db
                .cf_handle(CF_REGISTRY)
                .ok_or_else(|| EngineError::transient("predicate_registry cf missing"))?;
            match db.get_cf(&cf, uuid.as_bytes())? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| EngineError::transient(e.to_string()))?
    }

    pub async fn get_status(&self, uuid: &str) -> Result<Option<PredicateStatus>, EngineError> {
        let db = self.db.clone();
        let uuid = uuid.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<PredicateStatus>, EngineError> {
            let cf = db
                .cf_handle(CF_STATUS)
                .ok_or_else(|| EngineError::transient("predicate_status cf missing"))?;
            match db.get_cf(&cf, uuid.as_bytes())? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| EngineError::transient(e.to_string()))?
    }

    pub async fn set_status(&self, uuid: &str, status: &PredicateStatus) -> Result<(), EngineError> {
        let db = self.db.clone();
        let uuid_bytes = uuid.as_bytes().to_vec();
        let status_bytes = serde_json::to_vec(status)?;
        tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
            let cf = db
                .cf_handle(CF_STATUS)
                .ok_or_else(|| EngineError::transient("predicate_status cf missing"))?;
            db.put_cf(&cf, uuid_bytes, status_bytes)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::transient(e.to_string()))?
    }

    /// Lists every registered predicate paired with its current status.
    /// Used by the management surface and by the lifecycle controller on
    /// startup to rehydrate in-flight scans/streams.
    pub async fn list(&self) -> Result<Vec<(Predicate, PredicateStatus)>, EngineError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(Predicate, PredicateStatus)>, EngineError> {
            let registry_cf = db
                .cf_handle(CF_REGISTRY)
                .ok_or_else(|| EngineError::transient("predicate_registry cf missing"))?;
            let status_cf = db
                .cf_handle(CF_STATUS)
                .ok_or_else(|| EngineError::transient("predicate_status cf missing"))?;

            let mut out = Vec::new();
            let iter = db.iterator_cf(&registry_cf, rocksdb::IteratorMode::Start);
            for item in iter {
                let (key, value) = item?;
                let predicate: Predicate = serde_json::from_slice(&value)?;
                let status = match db.get_cf(&status_cf, &key)? {
                    Some(bytes) => serde_json::from_slice(&bytes)?,
                    None => PredicateStatus::New,
                };
                out.push((predicate, status));
            }
            Ok(out)
        })
        .await
        .map_err(|e| EngineError::transient(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicates::types::{ActionSpec, MatchSpec, PayloadShaping};
    use crate::types::Chain;
    use rocksdb::{ColumnFamilyDescriptor, Options};
    use tempfile::TempDir;

    fn test_db() -> (Arc<DB>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_REGISTRY, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATUS, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, dir.path(), cfs).unwrap();
        (Arc::new(db), dir)
    }

    fn sample_predicate(uuid: &str) -> Predicate {
        Predicate {
            uuid: uuid.to_string(),
            name: "test".to_string(),
            version: 1,
            chain: Chain::Bitcoin,
            network: "mainnet".to_string(),
            owner_uuid: None,
            enabled: true,
            start_block: None,
            end_block: None,
            expire_after_occurrence: None,
            payload_shaping: PayloadShaping::default(),
            if_this: MatchSpec::Bitcoin(crate::predicates::types::BitcoinMatchSpec::Txid(
                crate::predicates::types::ExactMatchingRule { equals: "abc".to_string() },
            )),
            then_that: ActionSpec::Noop,
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let (db, _dir) = test_db();
        let store = PredicateStore::new(db);
        store.register(sample_predicate("p1")).await.unwrap();

        let fetched = store.get("p1").await.unwrap().unwrap();
        assert_eq!(fetched.uuid, "p1");
        assert!(matches!(store.get_status("p1").await.unwrap(), Some(PredicateStatus::New)));
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let (db, _dir) = test_db();
        let store = PredicateStore::new(db);
        store.register(sample_predicate("p1")).await.unwrap();
        assert!(store.register(sample_predicate("p1")).await.is_err());
    }

    #[tokio::test]
    async fn deregister_removes_both_cfs() {
        let (db, _dir) = test_db();
        let store = PredicateStore::new(db);
        store.register(sample_predicate("p1")).await.unwrap();
        store.deregister("p1").await.unwrap();
        assert!(store.get("p1").await.unwrap().is_none());
        assert!(store.get_status("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_all_registered() {
        let (db, _dir) = test_db();
        let store = PredicateStore::new(db);
        store.register(sample_predicate("p1")).await.unwrap();
        store.register(sample_predicate("p2")).await.unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
