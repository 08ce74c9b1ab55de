//! In-memory snapshot of every known face signature.
//!
//! Reload builds a complete new collection outside any lock and installs it
//! with a single `Arc` swap. Matching clones the current `Arc` and never
//! holds the lock while comparing, so a reload in flight cannot change the
//! records an in-progress match is reading.

use crate::types::SignatureRecord;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("signature source unavailable: {0}")]
    SourceUnavailable(String),
}

/// Backing store the catalog is rebuilt from.
pub trait SignatureSource: Send + Sync {
    fn load_all_signatures(&self) -> Result<Vec<SignatureRecord>, CatalogError>;
}

/// Immutable view of the catalog for one matching pass.
pub type CatalogSnapshot = Arc<Vec<SignatureRecord>>;

pub struct SignatureCatalog {
    source: Arc<dyn SignatureSource>,
    current: RwLock<CatalogSnapshot>,
}

impl SignatureCatalog {
    /// Create an empty catalog. Call [`reload`](Self::reload) to populate it.
    pub fn new(source: Arc<dyn SignatureSource>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the whole collection from the backing store.
    ///
    /// Returns the number of signatures installed. On error the previous
    /// snapshot stays in place. An empty result is installed like any other.
    pub fn reload(&self) -> Result<usize, CatalogError> {
        let records = retain_consistent_length(self.source.load_all_signatures()?);
        let count = records.len();
        let next = Arc::new(records);

        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }

        tracing::info!(count, "signature catalog reloaded");
        Ok(count)
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> CatalogSnapshot {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drop records whose signature length differs from the most common length.
fn retain_consistent_length(records: Vec<SignatureRecord>) -> Vec<SignatureRecord> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for r in &records {
        *counts.entry(r.signature.len()).or_default() += 1;
    }
    let Some((&expected, _)) = counts.iter().max_by_key(|(len, n)| (**n, **len)) else {
        return records;
    };

    records
        .into_iter()
        .filter(|r| {
            let ok = r.signature.len() == expected && !r.signature.is_empty();
            if !ok {
                tracing::warn!(
                    source_id = r.source_id,
                    len = r.signature.len(),
                    expected,
                    "skipping signature with unexpected length"
                );
            }
            ok
        })
        .collect()
}
