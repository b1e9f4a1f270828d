//! In-memory view state shared by the processor and the query layer

use crate::events::EventKind;
use crate::index::SortedIndex;
use crate::profiles::ProfileGraph;
use crate::query::{IndexCounts, IndexName};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub(crate) struct ViewState {
    /// Keys of messages authored by the local identity
    pub my_msgs: HashSet<String>,
    pub home: SortedIndex,
    pub inbox: SortedIndex,
    pub votes: SortedIndex,
    pub follows: SortedIndex,
    pub adverts: SortedIndex,
    /// Direct replies per parent key, in arrival order
    pub replies: HashMap<String, Vec<String>>,
    pub graph: ProfileGraph,
}

impl ViewState {
    pub fn new(local_id: &str, max_alias_depth: usize) -> Self {
        Self {
            my_msgs: HashSet::new(),
            home: SortedIndex::new(),
            inbox: SortedIndex::new(),
            votes: SortedIndex::new(),
            follows: SortedIndex::new(),
            adverts: SortedIndex::new(),
            replies: HashMap::new(),
            graph: ProfileGraph::new(local_id, max_alias_depth),
        }
    }

    pub fn index(&self, name: IndexName) -> &SortedIndex {
        match name {
            IndexName::Home => &self.home,
            IndexName::Inbox => &self.inbox,
            IndexName::Votes => &self.votes,
            IndexName::Follows => &self.follows,
            IndexName::Adverts => &self.adverts,
        }
    }

    pub fn index_mut(&mut self, name: IndexName) -> &mut SortedIndex {
        match name {
            IndexName::Home => &mut self.home,
            IndexName::Inbox => &mut self.inbox,
            IndexName::Votes => &mut self.votes,
            IndexName::Follows => &mut self.follows,
            IndexName::Adverts => &mut self.adverts,
        }
    }

    pub fn counts(&self) -> IndexCounts {
        let upvoted = |r: &crate::index::IndexRow| r.vote.unwrap_or(0) > 0;
        let followed = |r: &crate::index::IndexRow| r.following == Some(true);

        IndexCounts {
            inbox: self.inbox.len(),
            inbox_unread: self.inbox.count(|r| !r.is_read),
            upvotes: self.votes.count(upvoted),
            upvotes_unread: self.votes.count(|r| upvoted(r) && !r.is_read),
            follows: self.follows.count(followed),
            follows_unread: self.follows.count(|r| followed(r) && !r.is_read),
            home: self.home.len(),
        }
    }

    /// Set the read state of every row whose read key is `key`. Returns the
    /// events for rows whose state actually changed.
    pub fn set_read(&mut self, key: &str, read: bool) -> Vec<EventKind> {
        let mut events = Vec::new();

        for name in IndexName::ALL {
            let Some(row) = self.index_mut(name).find_mut(key, name.read_field()) else {
                continue;
            };
            if row.is_read == read {
                continue;
            }
            row.is_read = read;

            let event = if read {
                name.remove_event()
            } else {
                name.add_event()
            };
            events.extend(event);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_read_reports_changes_once() {
        let mut state = ViewState::new("@me", 16);
        state.inbox.insert(1, "%reply");
        state.home.insert(1, "%reply");
        state.votes.insert_with(2, "voter:%mine", |row| {
            row.vote = Some(1);
            row.vote_msg = Some("%vote".to_string());
        });

        assert_eq!(state.set_read("%reply", true), vec![EventKind::InboxRemove]);
        assert!(state.home.rows()[0].is_read);
        assert!(state.set_read("%reply", true).is_empty());
        assert_eq!(state.set_read("%reply", false), vec![EventKind::InboxAdd]);

        assert_eq!(state.set_read("%vote", true), vec![EventKind::VotesRemove]);
        assert_eq!(state.counts().upvotes_unread, 0);
        assert_eq!(state.counts().upvotes, 1);
    }

    #[test]
    fn test_counts() {
        let mut state = ViewState::new("@me", 16);
        state.inbox.insert(1, "%a").is_read = true;
        state.inbox.insert(2, "%b");
        state.follows.insert_with(3, "@f", |row| row.following = Some(true));
        state.follows.insert_with(4, "@g", |row| row.following = Some(false));
        state.home.insert(5, "%c");

        let counts = state.counts();
        assert_eq!(counts.inbox, 2);
        assert_eq!(counts.inbox_unread, 1);
        assert_eq!(counts.follows, 1);
        assert_eq!(counts.follows_unread, 1);
        assert_eq!(counts.upvotes, 0);
        assert_eq!(counts.home, 1);
    }
}
