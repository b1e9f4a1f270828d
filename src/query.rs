//! Range queries over the sorted indexes
//!
//! A query reads the historical rows matching its bounds (newest first,
//! capped by `limit`) once the sync barrier is clear, and with `live: true`
//! keeps yielding rows as they are added. Rows are resolved to message
//! bodies concurrently; output order always follows index order.

use crate::events::EventKind;
use crate::index::{IndexRow, RowField};
use crate::materializer::Shared;
use crate::message::MessageValue;
use crate::store::LogStore;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Range endpoint. Only the timestamp is compared; the author component is
/// carried for callers that page through author-scoped ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeBound {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl RangeBound {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            author: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeOptions {
    #[serde(default)]
    pub lt: Option<RangeBound>,
    #[serde(default)]
    pub lte: Option<RangeBound>,
    #[serde(default)]
    pub gt: Option<RangeBound>,
    #[serde(default)]
    pub gte: Option<RangeBound>,
    /// Cap on historical rows; live rows are not counted. Zero means no cap.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub live: bool,
    /// Oldest-first for author ranges. Index queries are always newest-first.
    #[serde(default)]
    pub reverse: bool,
}

impl RangeOptions {
    pub fn contains(&self, ts: i64) -> bool {
        self.lt.as_ref().map_or(true, |b| ts < b.timestamp)
            && self.lte.as_ref().map_or(true, |b| ts <= b.timestamp)
            && self.gt.as_ref().map_or(true, |b| ts > b.timestamp)
            && self.gte.as_ref().map_or(true, |b| ts >= b.timestamp)
    }

    /// Effective row cap, `None` when unlimited
    pub fn cap(&self) -> Option<usize> {
        self.limit.filter(|limit| *limit > 0)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn older_than(mut self, bound: RangeBound) -> Self {
        self.lt = Some(bound);
        self
    }

    pub fn newer_than(mut self, bound: RangeBound) -> Self {
        self.gt = Some(bound);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexName {
    Home,
    Inbox,
    Votes,
    Follows,
    Adverts,
}

impl IndexName {
    pub const ALL: [IndexName; 5] = [
        IndexName::Home,
        IndexName::Inbox,
        IndexName::Votes,
        IndexName::Follows,
        IndexName::Adverts,
    ];

    pub fn add_event(self) -> Option<EventKind> {
        match self {
            IndexName::Home => Some(EventKind::HomeAdd),
            IndexName::Inbox => Some(EventKind::InboxAdd),
            IndexName::Votes => Some(EventKind::VotesAdd),
            IndexName::Follows => Some(EventKind::FollowsAdd),
            IndexName::Adverts => None,
        }
    }

    pub fn remove_event(self) -> Option<EventKind> {
        match self {
            IndexName::Inbox => Some(EventKind::InboxRemove),
            IndexName::Votes => Some(EventKind::VotesRemove),
            IndexName::Follows => Some(EventKind::FollowsRemove),
            IndexName::Home | IndexName::Adverts => None,
        }
    }

    /// Attribute holding the message key whose read flag a row reflects
    pub fn read_field(self) -> RowField {
        match self {
            IndexName::Votes => RowField::VoteMsg,
            IndexName::Follows => RowField::FollowMsg,
            IndexName::Home | IndexName::Inbox | IndexName::Adverts => RowField::Key,
        }
    }

    /// Row as seen by readers of this index. Vote rows only count while the
    /// vote is positive and follow rows while following; both are keyed by
    /// the message that set them.
    pub fn project(self, row: &IndexRow) -> Option<ResolvedRow> {
        let key = match self {
            IndexName::Votes if row.vote.unwrap_or(0) > 0 => row.vote_msg.clone()?,
            IndexName::Votes => return None,
            IndexName::Follows if row.following == Some(true) => row.follow_msg.clone()?,
            IndexName::Follows => return None,
            IndexName::Home | IndexName::Inbox | IndexName::Adverts => row.key.clone(),
        };

        Some(ResolvedRow {
            key,
            ts: row.ts,
            is_read: row.is_read,
            vote: row.vote,
            vote_msg: row.vote_msg.clone(),
            following: row.following,
            follow_msg: row.follow_msg.clone(),
            value: None,
        })
    }
}

/// Index row joined with its message body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRow {
    pub key: String,
    pub ts: i64,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_msg: Option<String>,
    /// `None` when the log no longer holds the message
    pub value: Option<MessageValue>,
}

impl ResolvedRow {
    /// Bound for paging past this row
    pub fn bound(&self) -> RangeBound {
        RangeBound {
            timestamp: self.ts,
            author: self.value.as_ref().map(|v| v.author.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCounts {
    pub inbox: usize,
    pub inbox_unread: usize,
    pub upvotes: usize,
    pub upvotes_unread: usize,
    pub follows: usize,
    pub follows_unread: usize,
    pub home: usize,
}

/// One key or many, for read-state and flag operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keys {
    One(String),
    Many(Vec<String>),
}

impl Keys {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let keys: &[String] = match self {
            Keys::One(key) => std::slice::from_ref(key),
            Keys::Many(keys) => keys,
        };
        keys.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        match self {
            Keys::One(_) => 1,
            Keys::Many(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Keys {
    fn from(key: &str) -> Self {
        Keys::One(key.to_string())
    }
}

impl From<String> for Keys {
    fn from(key: String) -> Self {
        Keys::One(key)
    }
}

impl From<&String> for Keys {
    fn from(key: &String) -> Self {
        Keys::One(key.clone())
    }
}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Keys::Many(keys)
    }
}

impl From<&[String]> for Keys {
    fn from(keys: &[String]) -> Self {
        Keys::Many(keys.to_vec())
    }
}

impl From<Vec<&str>> for Keys {
    fn from(keys: Vec<&str>) -> Self {
        Keys::Many(keys.into_iter().map(str::to_string).collect())
    }
}

/// Historical rows of `name` under the barrier, then live rows if requested
pub(crate) fn index_stream(
    shared: Arc<Shared>,
    name: IndexName,
    options: RangeOptions,
) -> BoxStream<'static, ResolvedRow> {
    let concurrency = shared.config.resolve_concurrency.max(1);
    let log = shared.log.clone();
    let live_options = options.clone();

    let snapshot = async move {
        shared.barrier.synced().await;
        let mut state = shared.state.lock().await;
        let index = state.index_mut(name);

        let mut rows = Vec::new();
        for row in index.rows() {
            if options.cap().map_or(false, |cap| rows.len() >= cap) {
                break;
            }
            if !options.contains(row.ts) {
                continue;
            }
            rows.extend(name.project(row));
        }

        // Registered under the same lock as the snapshot: no gaps, no repeats
        let live = options.live.then(|| index.subscribe());
        debug!(index = ?name, rows = rows.len(), live = options.live, "Index query");
        (rows, live)
    };

    stream::once(snapshot)
        .flat_map(move |(rows, live)| {
            let live_rows = match live {
                Some(rx) => {
                    let options = live_options.clone();
                    UnboundedReceiverStream::new(rx)
                        .filter_map(move |row| {
                            let projected = if options.contains(row.ts) {
                                name.project(&row)
                            } else {
                                None
                            };
                            future::ready(projected)
                        })
                        .boxed()
                }
                None => stream::empty().boxed(),
            };
            stream::iter(rows).chain(live_rows)
        })
        .map(move |row| resolve_row(log.clone(), row))
        .buffered(concurrency)
        .boxed()
}

async fn resolve_row(log: Arc<dyn LogStore>, mut row: ResolvedRow) -> ResolvedRow {
    match log.get(&row.key).await {
        Ok(value) => row.value = value,
        Err(e) => warn!(key = %row.key, "Failed to resolve index row: {}", e),
    }
    row
}

/// Resolve a batch of rows, preserving order
pub(crate) async fn resolve_rows(
    log: Arc<dyn LogStore>,
    rows: Vec<ResolvedRow>,
    concurrency: usize,
) -> Vec<ResolvedRow> {
    stream::iter(rows)
        .map(|row| resolve_row(log.clone(), row))
        .buffered(concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let options = RangeOptions::default()
            .older_than(RangeBound::new(5))
            .newer_than(RangeBound::new(2));
        assert!(!options.contains(2));
        assert!(options.contains(3));
        assert!(options.contains(4));
        assert!(!options.contains(5));

        let inclusive = RangeOptions {
            lte: Some(RangeBound::new(5)),
            gte: Some(RangeBound::new(5)),
            ..Default::default()
        };
        assert!(inclusive.contains(5));
        assert!(!inclusive.contains(4));
        assert!(RangeOptions::default().contains(i64::MIN));
    }

    #[test]
    fn test_range_options_from_json() {
        let options: RangeOptions = serde_json::from_str(
            r#"{ "lt": { "timestamp": 10, "author": "@x" }, "limit": 2, "live": true }"#,
        )
        .unwrap();
        assert_eq!(options.lt.as_ref().map(|b| b.timestamp), Some(10));
        assert_eq!(options.limit, Some(2));
        assert!(options.live);
        assert!(!options.reverse);
    }

    #[test]
    fn test_zero_limit_means_no_cap() {
        assert_eq!(RangeOptions::default().cap(), None);
        assert_eq!(RangeOptions::default().with_limit(0).cap(), None);
        assert_eq!(RangeOptions::default().with_limit(3).cap(), Some(3));
    }

    #[test]
    fn test_project_votes_and_follows() {
        let mut row = IndexRow {
            ts: 3,
            key: "@voter:%target".to_string(),
            vote: Some(1),
            vote_msg: Some("%vote".to_string()),
            ..Default::default()
        };
        assert_eq!(IndexName::Votes.project(&row).unwrap().key, "%vote");
        row.vote = Some(0);
        assert!(IndexName::Votes.project(&row).is_none());
        assert_eq!(IndexName::Home.project(&row).unwrap().key, "@voter:%target");

        let follow = IndexRow {
            ts: 4,
            key: "@follower".to_string(),
            following: Some(false),
            follow_msg: Some("%unfollow".to_string()),
            ..Default::default()
        };
        assert!(IndexName::Follows.project(&follow).is_none());
    }

    #[test]
    fn test_keys_conversions() {
        assert_eq!(Keys::from("%a").iter().collect::<Vec<_>>(), vec!["%a"]);
        let many = Keys::from(vec!["%a", "%b"]);
        assert_eq!(many.len(), 2);
        assert_eq!(many.iter().collect::<Vec<_>>(), vec!["%a", "%b"]);
    }
}
