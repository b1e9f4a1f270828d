//! Shared helpers for materializer integration tests

#![allow(dead_code)]

use feedview::links::feed_id;
use feedview::{
    FlagStore, Materializer, MemoryLogStore, Message, MessageValue, SledFlagStore, ViewConfig,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn id(n: u8) -> String {
    feed_id(&[n; 32])
}

pub fn me() -> String {
    id(0)
}

pub struct Harness {
    pub views: Materializer,
    pub log: Arc<MemoryLogStore>,
    pub read_flags: Arc<dyn FlagStore>,
    pub subscriptions: Arc<dyn FlagStore>,
    _temp: TempDir,
}

/// Flag stores in a fresh sled database
pub fn open_flags() -> (Arc<SledFlagStore>, Arc<SledFlagStore>, TempDir) {
    let temp = TempDir::new().unwrap();
    let (read, subscribed) = SledFlagStore::open_pair(temp.path().join("flags.sled")).unwrap();
    (Arc::new(read), Arc::new(subscribed), temp)
}

impl Harness {
    pub async fn start(log: Arc<MemoryLogStore>) -> Self {
        let (read, subscribed, temp) = open_flags();
        Self::with_flags(log, read, subscribed, temp).await
    }

    pub async fn with_flags(
        log: Arc<MemoryLogStore>,
        read_flags: Arc<dyn FlagStore>,
        subscriptions: Arc<dyn FlagStore>,
        temp: TempDir,
    ) -> Self {
        let views = Materializer::start(
            me(),
            ViewConfig::default(),
            log.clone(),
            read_flags.clone(),
            subscriptions.clone(),
        );
        views.synced().await;
        Self {
            views,
            log,
            read_flags,
            subscriptions,
            _temp: temp,
        }
    }

    pub fn append(&self, author: &str, ts: i64, content: Value) -> Message {
        self.log
            .append_value(MessageValue::new(author, ts, content))
            .unwrap()
    }

    /// Let the processor pick up live appends, then wait for it to drain
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.views.synced().await;
    }
}

pub fn log_with(messages: &[(String, i64, Value)]) -> Arc<MemoryLogStore> {
    let log = MemoryLogStore::new();
    for (author, ts, content) in messages {
        log.append_value(MessageValue::new(author.clone(), *ts, content.clone()))
            .unwrap();
    }
    Arc::new(log)
}
