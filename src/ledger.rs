//! The build product ledger.
//!
//! A process-scoped registry of everything a build run has verifiably
//! produced. The coordinator inserts build products only after a fully
//! successful execution, so the ledger never reflects a partial build; a
//! failed attempt cleans its files up directly and the ledger is never
//! told about them. Entries accumulate across build calls on one
//! orchestrator and are only dropped when the orchestrator is.

use std::collections::HashSet;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::LedgerError;

#[derive(Debug, Default)]
struct Shelves {
    products: Vec<Utf8PathBuf>,
    seen: HashSet<String>,
    libraries: Vec<Utf8PathBuf>,
    seen_libraries: HashSet<String>,
}

/// De-duplicated, insertion-ordered record of produced files. Paths are
/// compared case-insensitively. Insertions are internally serialized, so
/// concurrent driver paths may share one ledger.
#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<Shelves>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a produced file. Idempotent for paths differing only in
    /// case; fails fast if the path does not exist, since registering a
    /// phantom product is a contract violation rather than an
    /// environmental hiccup.
    pub fn add(&self, path: impl AsRef<Utf8Path>) -> Result<(), LedgerError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LedgerError::Missing(path.to_owned()));
        }

        let mut shelves = self.inner.lock().unwrap();
        if shelves.seen.insert(fold_case(path)) {
            shelves.products.push(path.to_owned());
        }

        Ok(())
    }

    /// Register a library product. Library products may be intermediate
    /// artifacts rather than final files, so existence is not checked.
    pub fn add_library(&self, path: impl AsRef<Utf8Path>) {
        let path = path.as_ref();

        let mut shelves = self.inner.lock().unwrap();
        if shelves.seen_libraries.insert(fold_case(path)) {
            shelves.libraries.push(path.to_owned());
        }
    }

    /// Whether a product path was registered, compared case-insensitively.
    pub fn has(&self, path: impl AsRef<Utf8Path>) -> bool {
        let key = fold_case(path.as_ref());
        self.inner.lock().unwrap().seen.contains(&key)
    }

    /// Every registered product, in insertion order.
    pub fn all(&self) -> Vec<Utf8PathBuf> {
        self.inner.lock().unwrap().products.clone()
    }

    /// Every registered library product, in insertion order.
    pub fn libraries(&self) -> Vec<Utf8PathBuf> {
        self.inner.lock().unwrap().libraries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().products.is_empty()
    }
}

fn fold_case(path: &Utf8Path) -> String {
    path.as_str().to_lowercase()
}
