//! Materializer: owns the view state and exposes the query surface
//!
//! ```text
//! LogStore ─► processor ─► ViewState (indexes, profile graph)
//!                │                  │
//!                └─► EventHub       └─► queries (gated by SyncBarrier)
//! ```
//!
//! Every read waits on the sync barrier, so callers never see a
//! half-replayed backlog or a half-applied message.

use crate::barrier::SyncBarrier;
use crate::config::ViewConfig;
use crate::error::Result;
use crate::events::{EventHub, ViewEvent};
use crate::lookup::{self, LookupEvent, PeerConnector};
use crate::message::Message;
use crate::profiles::{ActionItem, NameRank, Profile};
use crate::query::{self, IndexCounts, IndexName, Keys, RangeOptions, ResolvedRow};
use crate::store::flags::FLAG_SET;
use crate::store::{FlagOp, FlagStore, LogStore};
use crate::view::ViewState;
use futures::future::join_all;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub(crate) struct Shared {
    pub(crate) local_id: String,
    pub(crate) config: ViewConfig,
    pub(crate) log: Arc<dyn LogStore>,
    pub(crate) read_flags: Arc<dyn FlagStore>,
    pub(crate) subscriptions: Arc<dyn FlagStore>,
    pub(crate) barrier: Arc<SyncBarrier>,
    pub(crate) events: EventHub,
    pub(crate) state: Mutex<ViewState>,
}

/// Incremental views over one log, from the point of view of one identity
pub struct Materializer {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Materializer {
    /// Start consuming `log`. Must be called from within a tokio runtime.
    pub fn start(
        local_id: impl Into<String>,
        config: ViewConfig,
        log: Arc<dyn LogStore>,
        read_flags: Arc<dyn FlagStore>,
        subscriptions: Arc<dyn FlagStore>,
    ) -> Self {
        let local_id = local_id.into();
        let barrier = Arc::new(SyncBarrier::new());
        // Held until the log reports it has caught up
        barrier.begin();

        let shared = Arc::new(Shared {
            state: Mutex::new(ViewState::new(&local_id, config.max_alias_depth)),
            events: EventHub::new(config.event_channel_capacity, barrier.clone()),
            local_id,
            config,
            log,
            read_flags,
            subscriptions,
            barrier,
        });

        info!(local_id = %shared.local_id, "Starting materializer");
        let tasks = crate::processor::spawn(shared.clone());
        Self { shared, tasks }
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn config(&self) -> &ViewConfig {
        &self.shared.config
    }

    /// Wait until every dequeued log entry has been applied
    pub async fn synced(&self) {
        self.shared.barrier.synced().await;
    }

    pub fn is_backlog_replayed(&self) -> bool {
        self.shared.barrier.is_backlog_replayed()
    }

    /// Live view change notifications, until the stream is dropped
    pub fn subscribe_events(&self) -> impl Stream<Item = ViewEvent> + Send + 'static {
        self.shared.events.subscribe()
    }

    async fn read<R>(&self, f: impl FnOnce(&ViewState) -> R) -> R {
        self.shared.barrier.synced().await;
        let state = self.shared.state.lock().await;
        f(&state)
    }

    // ========================================================================
    // Profiles and names
    // ========================================================================

    pub async fn get_profile(&self, id: &str) -> Option<Profile> {
        self.read(|s| s.graph.profile(id).cloned()).await
    }

    pub async fn get_my_profile(&self) -> Option<Profile> {
        self.read(|s| s.graph.local_profile().cloned()).await
    }

    pub async fn get_all_profiles(&self) -> HashMap<String, Profile> {
        self.read(|s| s.graph.profiles().clone()).await
    }

    pub async fn get_names_by_id(&self) -> HashMap<String, String> {
        self.read(|s| s.graph.names().clone()).await
    }

    pub async fn get_name(&self, id: &str) -> Option<String> {
        self.read(|s| s.graph.name(id).map(str::to_string)).await
    }

    pub async fn get_ids_by_name(&self) -> HashMap<String, String> {
        self.read(|s| s.graph.ids().clone()).await
    }

    pub async fn get_id_by_name(&self, name: &str) -> Option<String> {
        self.read(|s| s.graph.id_by_name(name).map(str::to_string)).await
    }

    pub async fn get_name_trust_ranks(&self) -> HashMap<String, NameRank> {
        self.read(|s| s.graph.ranks().clone()).await
    }

    pub async fn get_name_trust_rank(&self, id: &str) -> Option<NameRank> {
        self.read(|s| s.graph.rank(id)).await
    }

    pub async fn get_action_items(&self) -> BTreeMap<String, ActionItem> {
        self.read(|s| s.graph.action_items().clone()).await
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    pub async fn get_index_counts(&self) -> IndexCounts {
        self.read(ViewState::counts).await
    }

    /// Keys of direct replies to `key`, in arrival order
    pub async fn get_replies(&self, key: &str) -> Vec<String> {
        self.read(|s| s.replies.get(key).cloned().unwrap_or_default())
            .await
    }

    pub async fn get_num_replies(&self, key: &str) -> usize {
        self.read(|s| s.replies.get(key).map(Vec::len).unwrap_or(0))
            .await
    }

    pub fn create_index_stream(
        &self,
        name: IndexName,
        options: RangeOptions,
    ) -> BoxStream<'static, ResolvedRow> {
        query::index_stream(self.shared.clone(), name, options)
    }

    pub fn create_home_stream(&self, options: RangeOptions) -> BoxStream<'static, ResolvedRow> {
        self.create_index_stream(IndexName::Home, options)
    }

    pub fn create_inbox_stream(&self, options: RangeOptions) -> BoxStream<'static, ResolvedRow> {
        self.create_index_stream(IndexName::Inbox, options)
    }

    pub fn create_vote_stream(&self, options: RangeOptions) -> BoxStream<'static, ResolvedRow> {
        self.create_index_stream(IndexName::Votes, options)
    }

    pub fn create_follow_stream(&self, options: RangeOptions) -> BoxStream<'static, ResolvedRow> {
        self.create_index_stream(IndexName::Follows, options)
    }

    pub fn create_advert_stream(&self, options: RangeOptions) -> BoxStream<'static, ResolvedRow> {
        self.create_index_stream(IndexName::Adverts, options)
    }

    /// One author's messages, straight from the log's feed range
    pub fn create_user_stream(
        &self,
        author: &str,
        options: RangeOptions,
    ) -> BoxStream<'static, Result<Message>> {
        let shared = self.shared.clone();
        let author = author.to_string();
        stream::once(async move {
            shared.barrier.synced().await;
            shared.log.stream_feed_range(&author, &options)
        })
        .flatten()
        .boxed()
    }

    /// Up to `count` adverts sampled from the newest `oldest`
    pub async fn random_adverts(&self, count: usize, oldest: usize) -> Vec<ResolvedRow> {
        let picked = self
            .read(|s| {
                let pool = &s.adverts.rows()[..s.adverts.len().min(oldest)];
                let amount = count.min(pool.len());
                let mut rng = rand::thread_rng();
                let mut picks = rand::seq::index::sample(&mut rng, pool.len(), amount).into_vec();
                picks.sort_unstable();
                picks
                    .into_iter()
                    .filter_map(|i| IndexName::Adverts.project(&pool[i]))
                    .collect::<Vec<_>>()
            })
            .await;

        query::resolve_rows(
            self.shared.log.clone(),
            picked,
            self.shared.config.resolve_concurrency,
        )
        .await
    }

    // ========================================================================
    // Read state
    // ========================================================================

    pub async fn mark_read(&self, keys: impl Into<Keys>) -> Result<()> {
        let keys = keys.into();
        let ops = keys.iter().map(FlagOp::set).collect();
        self.apply_read_state(&keys, ops).await
    }

    pub async fn mark_unread(&self, keys: impl Into<Keys>) -> Result<()> {
        let keys = keys.into();
        let ops = keys.iter().map(FlagOp::clear).collect();
        self.apply_read_state(&keys, ops).await
    }

    /// Flip each key's read state; returns the new states
    pub async fn toggle_read(&self, keys: impl Into<Keys>) -> Result<Vec<bool>> {
        let keys = keys.into();
        let current = self.is_read(keys.clone()).await;
        let ops = keys
            .iter()
            .zip(&current)
            .map(|(key, was_read)| {
                if *was_read {
                    FlagOp::clear(key)
                } else {
                    FlagOp::set(key)
                }
            })
            .collect();

        self.apply_read_state(&keys, ops).await?;
        Ok(current.into_iter().map(|was_read| !was_read).collect())
    }

    /// Read state per key; a failed lookup counts as unread
    pub async fn is_read(&self, keys: impl Into<Keys>) -> Vec<bool> {
        let keys = keys.into();
        let flags = &self.shared.read_flags;
        join_all(keys.iter().map(|key| async move {
            flags.is_set(key).await.unwrap_or_else(|e| {
                warn!(key = %key, "Read state lookup failed: {}", e);
                false
            })
        }))
        .await
    }

    // `ops` holds exactly one op per key, in key order
    async fn apply_read_state(&self, keys: &Keys, ops: Vec<FlagOp>) -> Result<()> {
        let events: Vec<_> = {
            let mut state = self.shared.state.lock().await;
            ops.iter()
                .flat_map(|op| match op {
                    FlagOp::Put { key, .. } => state.set_read(key, true),
                    FlagOp::Del { key } => state.set_read(key, false),
                })
                .collect()
        };
        for kind in events {
            self.shared.events.emit(kind);
        }

        let flags = &self.shared.read_flags;
        match keys {
            // Lists are written as one atomic batch
            Keys::Many(_) => flags.batch(ops).await,
            Keys::One(_) => match ops.into_iter().next() {
                Some(FlagOp::Put { key, value }) => flags.put(&key, value).await,
                Some(FlagOp::Del { key }) => flags.del(&key).await,
                None => Ok(()),
            },
        }
    }

    // ========================================================================
    // Thread subscriptions
    // ========================================================================

    pub async fn subscribe(&self, key: &str) -> Result<()> {
        self.shared.subscriptions.put(key, FLAG_SET.to_vec()).await
    }

    pub async fn unsubscribe(&self, key: &str) -> Result<()> {
        self.shared.subscriptions.del(key).await
    }

    /// Flip the subscription for `key`; returns the new state
    pub async fn toggle_subscribed(&self, key: &str) -> Result<bool> {
        if self.is_subscribed(key).await {
            self.unsubscribe(key).await?;
            Ok(false)
        } else {
            self.subscribe(key).await?;
            Ok(true)
        }
    }

    pub async fn is_subscribed(&self, key: &str) -> bool {
        self.shared
            .subscriptions
            .is_set(key)
            .await
            .unwrap_or_else(|e| {
                warn!(key = %key, "Subscription lookup failed: {}", e);
                false
            })
    }

    // ========================================================================
    // Peer lookup
    // ========================================================================

    /// Fetch the feed named by a lookup code from the peers it lists,
    /// falling back to the connector's known peers
    pub fn use_lookup_code(
        &self,
        code: &str,
        connector: Arc<dyn PeerConnector>,
    ) -> BoxStream<'static, LookupEvent> {
        lookup::use_lookup_code(code, connector, self.shared.log.clone())
    }
}

impl Drop for Materializer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
