//! Timestamp-ordered index with per-row attributes
//!
//! Rows are kept newest first (non-increasing `ts`). Keys are unique within
//! one index: `upsert` repositions an existing row instead of duplicating it.
//! Every placement notifies live listeners with a snapshot of the row.
//!
//! Scans are linear. Indexes grow with the local social graph, not with the
//! whole log.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRow {
    pub ts: i64,
    pub key: String,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_msg: Option<String>,
}

impl IndexRow {
    fn new(ts: i64, key: impl Into<String>) -> Self {
        Self {
            ts,
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Row attribute used as the lookup key in [`SortedIndex::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowField {
    Key,
    VoteMsg,
    FollowMsg,
}

impl RowField {
    fn matches(self, row: &IndexRow, value: &str) -> bool {
        match self {
            RowField::Key => row.key == value,
            RowField::VoteMsg => row.vote_msg.as_deref() == Some(value),
            RowField::FollowMsg => row.follow_msg.as_deref() == Some(value),
        }
    }
}

/// What an upsert did to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Moved,
    Unchanged,
}

impl Upsert {
    pub fn changed(self) -> bool {
        self != Upsert::Unchanged
    }
}

#[derive(Debug, Default)]
pub struct SortedIndex {
    rows: Vec<IndexRow>,
    listeners: Vec<mpsc::UnboundedSender<IndexRow>>,
}

impl SortedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[IndexRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert a new row unconditionally
    pub fn insert(&mut self, ts: i64, key: impl Into<String>) -> &mut IndexRow {
        self.insert_with(ts, key, |_| {})
    }

    /// Insert a new row, filling attributes before listeners see it
    pub fn insert_with<F>(&mut self, ts: i64, key: impl Into<String>, init: F) -> &mut IndexRow
    where
        F: FnOnce(&mut IndexRow),
    {
        let mut row = IndexRow::new(ts, key);
        init(&mut row);
        let pos = self.place(row);
        &mut self.rows[pos]
    }

    /// Insert `key`, or move it to `ts` if `ts` is newer than the stored one.
    /// A moved row keeps its attributes.
    pub fn upsert(&mut self, ts: i64, key: &str) -> (Upsert, &mut IndexRow) {
        self.upsert_with(ts, key, |_| {})
    }

    /// Like [`SortedIndex::upsert`], running `update` on an inserted or moved
    /// row before it is placed. Unchanged rows are left alone.
    pub fn upsert_with<F>(&mut self, ts: i64, key: &str, update: F) -> (Upsert, &mut IndexRow)
    where
        F: FnOnce(&mut IndexRow),
    {
        match self.position(key, RowField::Key) {
            Some(pos) if self.rows[pos].ts < ts => {
                let mut row = self.rows.remove(pos);
                row.ts = ts;
                update(&mut row);
                let pos = self.place(row);
                (Upsert::Moved, &mut self.rows[pos])
            }
            Some(pos) => (Upsert::Unchanged, &mut self.rows[pos]),
            None => {
                let mut row = IndexRow::new(ts, key);
                update(&mut row);
                let pos = self.place(row);
                (Upsert::Inserted, &mut self.rows[pos])
            }
        }
    }

    pub fn position(&self, value: &str, field: RowField) -> Option<usize> {
        self.rows.iter().position(|row| field.matches(row, value))
    }

    pub fn find(&self, value: &str, field: RowField) -> Option<&IndexRow> {
        self.position(value, field).map(|pos| &self.rows[pos])
    }

    pub fn find_mut(&mut self, value: &str, field: RowField) -> Option<&mut IndexRow> {
        self.position(value, field).map(move |pos| &mut self.rows[pos])
    }

    pub fn filter<F>(&self, mut predicate: F) -> Vec<&IndexRow>
    where
        F: FnMut(&IndexRow) -> bool,
    {
        self.rows.iter().filter(|row| predicate(row)).collect()
    }

    pub fn count<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&IndexRow) -> bool,
    {
        self.rows.iter().filter(|row| predicate(row)).count()
    }

    /// Receive a snapshot of every row placed from now on. Dropping the
    /// receiver deregisters the listener on the next placement.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<IndexRow> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // First slot whose timestamp is strictly older; equal timestamps keep
    // insertion order.
    fn place(&mut self, row: IndexRow) -> usize {
        let pos = self
            .rows
            .iter()
            .position(|existing| existing.ts < row.ts)
            .unwrap_or(self.rows.len());

        self.listeners.retain(|tx| tx.send(row.clone()).is_ok());
        self.rows.insert(pos, row);
        pos
    }
}
