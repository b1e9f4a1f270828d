//! Flag store contract and a sled-backed implementation
//!
//! Flags are presence markers: a key with any value is set, an absent key is
//! unset. Each namespace (read state, thread subscriptions) is its own store.

use crate::error::{Result, ViewError};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Value written for a set flag
pub const FLAG_SET: &[u8] = &[1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

impl FlagOp {
    pub fn set(key: impl Into<String>) -> Self {
        FlagOp::Put {
            key: key.into(),
            value: FLAG_SET.to_vec(),
        }
    }

    pub fn clear(key: impl Into<String>) -> Self {
        FlagOp::Del { key: key.into() }
    }
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Apply all ops atomically
    async fn batch(&self, ops: Vec<FlagOp>) -> Result<()>;

    async fn is_set(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Flag namespace stored in one sled tree
#[derive(Clone)]
pub struct SledFlagStore {
    tree: sled::Tree,
    name: String,
}

impl SledFlagStore {
    /// Read-state namespace
    pub const READ_TREE: &'static str = "isread";
    /// Thread subscription namespace
    pub const SUBSCRIBED_TREE: &'static str = "subscribed";

    pub fn open_tree(db: &sled::Db, name: &str) -> Result<Self> {
        let tree = db.open_tree(name)?;
        debug!(tree = name, entries = tree.len(), "Opened flag tree");
        Ok(Self {
            tree,
            name: name.to_string(),
        })
    }

    /// Open the read and subscription namespaces of the database at `path`
    pub fn open_pair<P: AsRef<Path>>(path: P) -> Result<(Self, Self)> {
        let db = sled::open(path)?;
        Ok((
            Self::open_tree(&db, Self::READ_TREE)?,
            Self::open_tree(&db, Self::SUBSCRIBED_TREE)?,
        ))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn error(&self, e: sled::Error) -> ViewError {
        ViewError::FlagStore(format!("{}: {}", self.name, e))
    }
}

#[async_trait]
impl FlagStore for SledFlagStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.tree.get(key.as_bytes()).map_err(|e| self.error(e))?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.tree
            .insert(key.as_bytes(), value)
            .map_err(|e| self.error(e))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes()).map_err(|e| self.error(e))?;
        Ok(())
    }

    async fn batch(&self, ops: Vec<FlagOp>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                FlagOp::Put { key, value } => batch.insert(key.as_bytes(), value),
                FlagOp::Del { key } => batch.remove(key.as_bytes()),
            }
        }
        self.tree.apply_batch(batch).map_err(|e| self.error(e))?;
        Ok(())
    }
}
