//! Persistent record store
//!
//! Keeps one automation [`Record`] per address, partitioned by cadence tier so a
//! scheduler tick reads its accounts with a single prefix scan, plus the table
//! of [`ActiveJob`]s installed by the scheduler.

pub mod keys;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use std::path::Path;
use tracing::{debug, info};

use crate::chain::address;
use crate::error::{Error, Result};
use crate::types::{ActiveJob, Cadence, Record};

/// File name of the store inside the home directory
pub const DEFAULT_STORE_NAME: &str = "store.db";

const TREE_NAME: &str = "autostaker";

/// Sled backed record store, safe to share between tasks
pub struct RecordStore {
    db: sled::Db,
    tree: sled::Tree,
    /// Writers move records between partitions; readers must never see a half move
    partitions: RwLock<()>,
}

fn ser<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn de<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

fn tx_error(e: TransactionError<Error>) -> Error {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

impl RecordStore {
    /// Open (or create) the store under `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(DEFAULT_STORE_NAME);
        let db = sled::open(&path)
            .map_err(|e| Error::Store(format!("Failed to open {}: {}", path.display(), e)))?;
        let tree = db.open_tree(TREE_NAME)?;

        info!("Opened record store at {}", path.display());

        Ok(Self {
            db,
            tree,
            partitions: RwLock::new(()),
        })
    }

    /// Insert or replace the record for an address. A copy filed under a
    /// different cadence is removed in the same transaction. Addresses must be
    /// in canonical lower-case form so one account has one key.
    pub fn put(&self, record: &Record) -> Result<()> {
        address::require_canonical(&record.address)?;
        let value = ser(record)?;
        let index = keys::index_key(&record.address);
        let key = keys::record_key(record.cadence, &record.address);
        let cadence = [record.cadence.as_byte()];

        let _guard = self.partitions.write();
        self.tree
            .transaction(|tx| -> ConflictableTransactionResult<(), Error> {
                if let Some(previous) = tx.get(&index)? {
                    let previous = previous.first().copied().unwrap_or_default();
                    if previous != cadence[0] {
                        tx.remove(keys::record_key_raw(previous, &record.address))?;
                    }
                }
                tx.insert(key.as_slice(), value.as_slice())?;
                tx.insert(index.as_slice(), &cadence[..])?;
                Ok(())
            })
            .map_err(tx_error)?;

        debug!(address = %record.address, cadence = %record.cadence, "Stored record");
        Ok(())
    }

    /// Point lookup; a missing address is [`Error::RecordNotFound`]
    pub fn get(&self, address: &str) -> Result<Record> {
        address::require_canonical(address)?;
        let _guard = self.partitions.read();
        let cadence = self
            .tree
            .get(keys::index_key(address))?
            .and_then(|v| v.first().copied())
            .ok_or_else(|| Error::RecordNotFound(address.to_string()))?;

        let bytes = self
            .tree
            .get(keys::record_key_raw(cadence, address))?
            .ok_or_else(|| Error::RecordNotFound(address.to_string()))?;
        de(&bytes)
    }

    /// All records filed under a tier, in address order
    pub fn scan_by_cadence(&self, cadence: Cadence) -> Result<Vec<Record>> {
        let _guard = self.partitions.read();
        let mut records = Vec::new();
        for item in self.tree.scan_prefix(keys::record_prefix(cadence)) {
            let (_, value) = item?;
            records.push(de(&value)?);
        }
        Ok(records)
    }

    /// Apply `f` to the stored record of `address` atomically. The cadence
    /// cannot be changed this way; use [`RecordStore::put`] for that.
    pub fn update<F>(&self, address: &str, f: F) -> Result<Record>
    where
        F: Fn(&mut Record),
    {
        address::require_canonical(address)?;
        let index = keys::index_key(address);
        let _guard = self.partitions.write();
        self.tree
            .transaction(|tx| -> ConflictableTransactionResult<Record, Error> {
                let not_found =
                    || ConflictableTransactionError::Abort(Error::RecordNotFound(address.to_string()));

                let cadence = tx
                    .get(&index)?
                    .and_then(|v| v.first().copied())
                    .ok_or_else(not_found)?;
                let key = keys::record_key_raw(cadence, address);
                let bytes = tx.get(&key)?.ok_or_else(not_found)?;

                let mut record: Record = de(&bytes).map_err(ConflictableTransactionError::Abort)?;
                let cadence = record.cadence;
                f(&mut record);
                record.cadence = cadence;

                let value = ser(&record).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(key.as_slice(), value)?;
                Ok(record)
            })
            .map_err(tx_error)
    }

    /// Remove every copy of the record. Returns whether anything was removed.
    pub fn delete(&self, address: &str) -> Result<bool> {
        address::require_canonical(address)?;
        let index = keys::index_key(address);
        let _guard = self.partitions.write();
        self.tree
            .transaction(|tx| -> ConflictableTransactionResult<bool, Error> {
                let mut removed = tx.remove(index.as_slice())?.is_some();
                for cadence in [Cadence::Unset].into_iter().chain(Cadence::SCHEDULED) {
                    removed |= tx.remove(keys::record_key(cadence, address))?.is_some();
                }
                Ok(removed)
            })
            .map_err(tx_error)
    }

    pub fn put_active_job(&self, job: &ActiveJob) -> Result<()> {
        self.tree.insert(keys::job_key(job.cadence), ser(job)?)?;
        Ok(())
    }

    pub fn get_active_job(&self, cadence: Cadence) -> Result<Option<ActiveJob>> {
        match self.tree.get(keys::job_key(cadence))? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn active_jobs(&self) -> Result<Vec<ActiveJob>> {
        let mut jobs = Vec::new();
        for item in self.tree.scan_prefix(keys::job_prefix()) {
            let (_, value) = item?;
            jobs.push(de(&value)?);
        }
        Ok(jobs)
    }

    /// Drop the whole active job table. Returns the number of jobs removed.
    pub fn clear_all_active_jobs(&self) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in self.tree.scan_prefix(keys::job_prefix()) {
            let (key, _) = item?;
            batch.remove(key);
            count += 1;
        }
        self.tree.apply_batch(batch)?;
        Ok(count)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
