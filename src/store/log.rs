//! Log store contract and an in-memory implementation

use crate::error::{Result, ViewError};
use crate::links;
use crate::message::{Message, MessageValue};
use crate::query::RangeOptions;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

/// Entry yielded by [`LogStore::stream_live`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Key of a message, in log order
    Message(String),
    /// Every message that existed when the stream opened has been yielded
    Synced,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Fetch a message body by key
    async fn get(&self, key: &str) -> Result<Option<MessageValue>>;

    /// All existing keys in log order, then [`LogEntry::Synced`], then new
    /// keys as they are appended. Each entry is yielded exactly once.
    fn stream_live(&self) -> BoxStream<'static, LogEntry>;

    /// One author's messages filtered by timestamp bounds
    fn stream_feed_range(
        &self,
        author: &str,
        options: &RangeOptions,
    ) -> BoxStream<'static, Result<Message>>;

    /// Append a message, returning it with its key
    async fn append(&self, value: MessageValue) -> Result<Message>;
}

#[derive(Default)]
struct LogInner {
    order: Vec<String>,
    values: HashMap<String, MessageValue>,
    latest_sequence: HashMap<String, u64>,
    /// Key of an unsequenced value as submitted, to the key it was stored under
    unsequenced: HashMap<String, String>,
    subscribers: Vec<mpsc::UnboundedSender<LogEntry>>,
}

/// Content-addressed, in-memory log
///
/// Keys are derived from the encoded message value, so appending the same
/// value twice is a no-op. Values appended without a sequence get the next
/// one for their author; resubmitting such a value returns the message it
/// was first stored as.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: Mutex<LogInner>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a log from a file holding one JSON message value per line
    pub fn load_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let store = Self::new();

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            serde_json::from_str::<MessageValue>(&line)
                .map_err(ViewError::from)
                .and_then(|value| store.append_value(value))
                .map_err(|e| ViewError::LogStore(format!("line {}: {}", line_no + 1, e)))?;
        }

        info!(
            path = %path.as_ref().display(),
            messages = store.len(),
            "Loaded log"
        );
        Ok(store)
    }

    fn inner(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.inner().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner().values.contains_key(key)
    }

    pub fn latest_sequence(&self, author: &str) -> u64 {
        self.inner()
            .latest_sequence
            .get(author)
            .copied()
            .unwrap_or(0)
    }

    pub fn append_value(&self, mut value: MessageValue) -> Result<Message> {
        if !links::is_feed_id(&value.author) {
            return Err(ViewError::InvalidMessage(format!(
                "author is not a feed id: {}",
                value.author
            )));
        }

        let mut inner = self.inner();
        let submitted = if value.sequence == 0 {
            let submitted = value.key()?;
            if let Some(existing) = inner.unsequenced.get(&submitted) {
                if let Some(stored) = inner.values.get(existing) {
                    return Ok(Message {
                        key: existing.clone(),
                        value: stored.clone(),
                    });
                }
            }
            Some(submitted)
        } else {
            None
        };

        let latest = inner
            .latest_sequence
            .get(&value.author)
            .copied()
            .unwrap_or(0);
        if value.sequence == 0 {
            value.sequence = latest + 1;
        }

        let key = value.key()?;
        if inner.values.contains_key(&key) {
            return Ok(Message { key, value });
        }
        if let Some(submitted) = submitted {
            inner.unsequenced.insert(submitted, key.clone());
        }

        inner
            .latest_sequence
            .insert(value.author.clone(), latest.max(value.sequence));
        inner.order.push(key.clone());
        inner.values.insert(key.clone(), value.clone());
        inner
            .subscribers
            .retain(|tx| tx.send(LogEntry::Message(key.clone())).is_ok());

        debug!(key = %key, author = %value.author, seq = value.sequence, "Appended message");
        Ok(Message { key, value })
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn get(&self, key: &str) -> Result<Option<MessageValue>> {
        Ok(self.inner().values.get(key).cloned())
    }

    fn stream_live(&self) -> BoxStream<'static, LogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner();

        // Backlog and registration happen under one lock so no append slips
        // between them
        for key in &inner.order {
            let _ = tx.send(LogEntry::Message(key.clone()));
        }
        let _ = tx.send(LogEntry::Synced);
        inner.subscribers.push(tx);

        UnboundedReceiverStream::new(rx).boxed()
    }

    fn stream_feed_range(
        &self,
        author: &str,
        options: &RangeOptions,
    ) -> BoxStream<'static, Result<Message>> {
        let mut messages: Vec<Message> = {
            let inner = self.inner();
            inner
                .order
                .iter()
                .filter_map(|key| inner.values.get(key).map(|value| (key, value)))
                .filter(|(_, value)| value.author == author && options.contains(value.timestamp))
                .map(|(key, value)| Message {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect()
        };

        messages.sort_by_key(|m| m.value.sequence);
        if options.reverse {
            messages.reverse();
        }
        if let Some(cap) = options.cap() {
            messages.truncate(cap);
        }

        stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    async fn append(&self, value: MessageValue) -> Result<Message> {
        self.append_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::RangeBound;
    use serde_json::json;
    use std::io::Write;

    fn alice() -> String {
        links::feed_id(&[1; 32])
    }

    fn post(ts: i64, text: &str) -> MessageValue {
        MessageValue::new(alice(), ts, json!({ "type": "post", "text": text }))
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_and_dedupes() {
        let store = MemoryLogStore::new();
        let first = store.append(post(1, "one")).await.unwrap();
        let second = store.append(post(2, "two")).await.unwrap();
        assert_eq!(first.value.sequence, 1);
        assert_eq!(second.value.sequence, 2);

        let again = store.append(first.value.clone()).await.unwrap();
        assert_eq!(again.key, first.key);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&first.key).await.unwrap(), Some(first.value));
    }

    #[tokio::test]
    async fn test_append_unsequenced_value_twice() {
        let store = MemoryLogStore::new();
        let first = store.append(post(1, "x")).await.unwrap();
        let second = store.append(post(1, "x")).await.unwrap();

        assert_eq!(second.key, first.key);
        assert_eq!(second.value.sequence, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest_sequence(&alice()), 1);

        // Different content still gets the next sequence
        let third = store.append(post(1, "y")).await.unwrap();
        assert_ne!(third.key, first.key);
        assert_eq!(third.value.sequence, 2);
    }

    #[tokio::test]
    async fn test_append_rejects_bad_author() {
        let store = MemoryLogStore::new();
        let value = MessageValue::new("alice", 1, json!({ "type": "post" }));
        assert!(matches!(
            store.append(value).await,
            Err(ViewError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_live_marks_caught_up() {
        let store = MemoryLogStore::new();
        let first = store.append(post(1, "old")).await.unwrap();

        let mut live = store.stream_live();
        let second = store.append(post(2, "new")).await.unwrap();

        assert_eq!(live.next().await, Some(LogEntry::Message(first.key)));
        assert_eq!(live.next().await, Some(LogEntry::Synced));
        assert_eq!(live.next().await, Some(LogEntry::Message(second.key)));
    }

    #[tokio::test]
    async fn test_feed_range() {
        let store = MemoryLogStore::new();
        for ts in 1..=5 {
            store.append(post(ts, &format!("post {}", ts))).await.unwrap();
        }
        store
            .append(MessageValue::new(
                links::feed_id(&[2; 32]),
                3,
                json!({ "type": "post" }),
            ))
            .await
            .unwrap();

        let options = RangeOptions {
            gt: Some(RangeBound::new(1)),
            limit: Some(2),
            reverse: true,
            ..Default::default()
        };
        let found: Vec<i64> = store
            .stream_feed_range(&alice(), &options)
            .map(|m| m.unwrap().value.timestamp)
            .collect()
            .await;
        assert_eq!(found, vec![5, 4]);
    }

    #[test]
    fn test_load_jsonl() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        for ts in 1..=3 {
            writeln!(file, "{}", serde_json::to_string(&post(ts, "x")).unwrap()).unwrap();
            writeln!(file).unwrap();
        }

        let store = MemoryLogStore::load_jsonl(&path).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.latest_sequence(&alice()), 3);
    }

    #[test]
    fn test_load_jsonl_reports_bad_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&post(1, "ok")).unwrap()).unwrap();
        writeln!(file, "{{ not json").unwrap();

        match MemoryLogStore::load_jsonl(&path) {
            Err(ViewError::LogStore(message)) => assert!(message.starts_with("line 2:")),
            other => panic!("expected log store error, got {:?}", other.map(|s| s.len())),
        }
    }
}
