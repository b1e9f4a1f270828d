//! Log processor
//!
//! Two tasks share the work:
//!
//! ```text
//! LogStore::stream_live ─► intake (barrier.begin) ─► worker (fetch, apply, barrier.end)
//! ```
//!
//! Intake takes entries off the log as fast as they arrive so the barrier's
//! pending count covers everything dequeued but not yet applied. The worker
//! applies messages one at a time in log order. A failure while processing a
//! message is logged and the barrier is still released.

use crate::error::{Result, ViewError};
use crate::events::EventKind;
use crate::materializer::Shared;
use crate::message::{ContactContent, Content, Message, MessageValue, Trust, VoteContent};
use crate::query::IndexName;
use crate::store::LogEntry;
use crate::view::ViewState;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Side effects collected while applying one message under the view lock
#[derive(Debug, Default)]
struct Effects {
    events: Vec<EventKind>,
    /// Rows whose read state must be looked up: (index, read key)
    decorate: Vec<(IndexName, String)>,
}

/// Start the intake and worker tasks
pub(crate) fn spawn(shared: Arc<Shared>) -> Vec<JoinHandle<()>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let intake = tokio::spawn(run_intake(shared.clone(), tx));
    let worker = tokio::spawn(run_worker(shared, rx));
    vec![intake, worker]
}

async fn run_intake(shared: Arc<Shared>, tx: mpsc::UnboundedSender<LogEntry>) {
    let mut entries = shared.log.stream_live();
    let mut caught_up = false;

    while let Some(entry) = entries.next().await {
        match &entry {
            LogEntry::Message(_) => shared.barrier.begin(),
            LogEntry::Synced if caught_up => {
                warn!("Duplicate caught-up marker from log, ignoring");
                continue;
            }
            LogEntry::Synced => caught_up = true,
        }

        if let Err(mpsc::error::SendError(entry)) = tx.send(entry) {
            if matches!(entry, LogEntry::Message(_)) {
                shared.barrier.end();
            }
            warn!("Log worker gone, stopping intake");
            return;
        }
    }

    // Readers would otherwise wait on the backlog hold forever
    if !caught_up {
        warn!("Log stream ended before catching up");
        let _ = tx.send(LogEntry::Synced);
    }
    debug!("Log intake finished");
}

async fn run_worker(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<LogEntry>) {
    info!(local_id = %shared.local_id, "Log processor started");
    let mut processed: u64 = 0;

    while let Some(entry) = rx.recv().await {
        match entry {
            LogEntry::Message(key) => {
                if let Err(e) = process_message(&shared, &key).await {
                    warn!(key = %key, "Failed to process message: {}", e);
                }
                processed += 1;
                shared.barrier.end();
            }
            LogEntry::Synced => {
                info!(processed, "Log backlog dequeued, releasing barrier");
                shared.barrier.release_backlog();
            }
        }
    }

    info!(processed, "Log processor stopped");
}

async fn process_message(shared: &Shared, key: &str) -> Result<()> {
    let value = shared
        .log
        .get(key)
        .await?
        .ok_or_else(|| ViewError::NotFound(key.to_string()))?;
    let content = Content::parse(&value.content);

    // Thread ascent only reads the log, so it runs before taking the view lock
    let root = match &content {
        Content::Post(post) if post.replies_to.is_some() => find_thread_root(shared, &value).await,
        _ => None,
    };

    let message = Message {
        key: key.to_string(),
        value,
    };
    let rules = Rules {
        local_id: &shared.local_id,
        now_ms: Utc::now().timestamp_millis(),
        recent_window_ms: shared.config.recent_post_window().as_millis() as i64,
    };

    let mut effects = Effects::default();
    let mut state = shared.state.lock().await;
    rules.apply(&mut state, &message, &content, root, &mut effects);

    for (name, read_key) in &effects.decorate {
        match shared.read_flags.is_set(read_key).await {
            Ok(true) => {
                if let Some(row) = state.index_mut(*name).find_mut(read_key, name.read_field()) {
                    row.is_read = true;
                }
            }
            Ok(false) => {}
            Err(e) => warn!(key = %read_key, "Read state lookup failed, leaving unread: {}", e),
        }
    }
    drop(state);

    for kind in effects.events {
        shared.events.emit(kind);
    }

    debug!(key = %key, kind = ?message.value.content_type(), "Processed message");
    Ok(())
}

/// Follow `thread`/`repliesTo` links up to the first message without one
async fn find_thread_root(shared: &Shared, value: &MessageValue) -> Option<String> {
    let mut current = value.parent_hint()?;

    for _ in 0..shared.config.max_thread_depth {
        match shared.log.get(&current).await {
            Ok(Some(parent)) => match parent.parent_hint() {
                Some(next) => current = next,
                None => return Some(current),
            },
            Ok(None) => {
                debug!(key = %current, "Thread parent not in log");
                return None;
            }
            Err(e) => {
                warn!(key = %current, "Thread root lookup failed: {}", e);
                return None;
            }
        }
    }

    warn!(key = %current, "Thread root not reached within depth limit");
    None
}

struct Rules<'a> {
    local_id: &'a str,
    now_ms: i64,
    recent_window_ms: i64,
}

impl Rules<'_> {
    fn apply(
        &self,
        state: &mut ViewState,
        msg: &Message,
        content: &Content,
        root: Option<String>,
        effects: &mut Effects,
    ) {
        let author = msg.value.author.as_str();
        let ts = msg.value.timestamp;
        let by_me = author == self.local_id;

        if by_me {
            state.my_msgs.insert(msg.key.clone());
        }

        match content {
            Content::Init => state.graph.apply_init(author, ts),
            Content::Post(post) => {
                if let Some(parent) = &post.replies_to {
                    state
                        .replies
                        .entry(parent.clone())
                        .or_default()
                        .push(msg.key.clone());
                }
                if !by_me
                    && state.graph.local_follows(author)
                    && self.now_ms - ts < self.recent_window_ms
                {
                    effects.events.push(EventKind::Post);
                }
            }
            Content::Contact(contact) => {
                state.graph.apply_contact(author, contact);
                if !by_me {
                    self.apply_follow(state, msg, contact, effects);
                }
            }
            Content::Vote(vote) => {
                if !by_me {
                    apply_vote(state, msg, vote, effects);
                }
            }
            Content::Advert => {
                state.adverts.upsert(ts, &msg.key);
            }
            Content::Fact(_) | Content::Unrecognized(_) => {}
        }

        if !by_me {
            self.apply_inbox(state, msg, effects);
        }

        match content {
            Content::Post(post) | Content::Fact(post) if post.replies_to.is_none() => {
                upsert_home(state, ts, &msg.key, effects);
            }
            Content::Post(_) => {
                if let Some(root) = root {
                    upsert_home(state, ts, &root, effects);
                }
            }
            Content::Contact(contact)
                if contact.trust == Some(Trust::Flagged) && state.graph.local_follows(author) =>
            {
                let target_followed = contact
                    .targets
                    .first()
                    .map(|target| state.graph.local_follows(target))
                    .unwrap_or(false);
                if target_followed {
                    upsert_home(state, ts, &msg.key, effects);
                }
            }
            _ => {}
        }
    }

    // A reply to one of my messages, or else a mention of me; one row at most
    fn apply_inbox(&self, state: &mut ViewState, msg: &Message, effects: &mut Effects) {
        let replies_to_me = msg
            .value
            .reply_links()
            .iter()
            .any(|link| state.my_msgs.contains(link));
        let for_me = replies_to_me
            || msg
                .value
                .mentions()
                .iter()
                .any(|feed| feed == self.local_id);

        if for_me {
            state.inbox.insert(msg.value.timestamp, msg.key.clone());
            effects.decorate.push((IndexName::Inbox, msg.key.clone()));
            effects.events.push(EventKind::InboxAdd);
        }
    }

    // Someone else's follow or unfollow of the local identity
    fn apply_follow(
        &self,
        state: &mut ViewState,
        msg: &Message,
        contact: &ContactContent,
        effects: &mut Effects,
    ) {
        let Some(following) = contact.following else {
            return;
        };
        if !contact.targets.iter().any(|t| t == self.local_id) {
            return;
        }

        let mut was_following = false;
        let (result, _) = state
            .follows
            .upsert_with(msg.value.timestamp, &msg.value.author, |row| {
                was_following = row.following == Some(true);
                row.following = Some(following);
                row.follow_msg = Some(msg.key.clone());
                row.is_read = false;
            });
        if !result.changed() {
            return;
        }

        effects.decorate.push((IndexName::Follows, msg.key.clone()));
        match (was_following, following) {
            (false, true) => effects.events.push(EventKind::FollowsAdd),
            (true, false) => effects.events.push(EventKind::FollowsRemove),
            _ => {}
        }
    }
}

// Someone else's vote on one of my messages
fn apply_vote(state: &mut ViewState, msg: &Message, vote: &VoteContent, effects: &mut Effects) {
    let Some(target) = vote.target.as_deref() else {
        return;
    };
    if !state.my_msgs.contains(target) {
        return;
    }

    let row_key = format!("{}:{}", msg.value.author, target);
    let mut was_up = false;
    let (result, _) = state
        .votes
        .upsert_with(msg.value.timestamp, &row_key, |row| {
            was_up = row.vote.unwrap_or(0) > 0;
            row.vote = Some(vote.value);
            row.vote_msg = Some(msg.key.clone());
            row.is_read = false;
        });
    if !result.changed() {
        return;
    }

    effects.decorate.push((IndexName::Votes, msg.key.clone()));
    match (was_up, vote.value > 0) {
        (false, true) => effects.events.push(EventKind::VotesAdd),
        (true, false) => effects.events.push(EventKind::VotesRemove),
        _ => {}
    }
}

fn upsert_home(state: &mut ViewState, ts: i64, key: &str, effects: &mut Effects) {
    let (result, _) = state.home.upsert(ts, key);
    if result == crate::index::Upsert::Inserted {
        effects.decorate.push((IndexName::Home, key.to_string()));
    }
    if result.changed() {
        effects.events.push(EventKind::HomeAdd);
    }
}
