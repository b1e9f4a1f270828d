//! Log messages and their typed content
//!
//! Messages are read-only as far as the materializer is concerned. The raw
//! JSON content is kept on [`MessageValue`] so resolved rows hand back exactly
//! what the log holds; [`Content::parse`] gives the closed, typed view the
//! processor dispatches on.

use crate::error::Result;
use crate::links::{self, is_falsy, LinkKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A keyed log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    pub value: MessageValue,
}

/// Message body as stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageValue {
    pub author: String,
    /// Position in the author's feed, starting at 1
    #[serde(default)]
    pub sequence: u64,
    /// Milliseconds since the Unix epoch, as claimed by the author
    pub timestamp: i64,
    pub content: JsonValue,
}

impl MessageValue {
    pub fn new(author: impl Into<String>, timestamp: i64, content: JsonValue) -> Self {
        Self {
            author: author.into(),
            sequence: 0,
            timestamp,
            content,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content.get("type").and_then(JsonValue::as_str)
    }

    /// Content-addressed key for this value
    pub fn key(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(links::message_key(&encoded))
    }

    /// Valid message links in `repliesTo`
    pub fn reply_links(&self) -> Vec<String> {
        self.field_links("repliesTo", LinkKind::Msg)
    }

    /// Valid feed links in `mentions`
    pub fn mentions(&self) -> Vec<String> {
        self.field_links("mentions", LinkKind::Feed)
    }

    /// Next hop towards the thread root: `thread` if present, else `repliesTo`
    pub fn parent_hint(&self) -> Option<String> {
        ["thread", "repliesTo"]
            .iter()
            .filter_map(|field| self.content.get(*field))
            .find_map(|v| links::link(v, LinkKind::Msg))
    }

    fn field_links(&self, field: &str, kind: LinkKind) -> Vec<String> {
        self.content
            .get(field)
            .map(|v| links::links(v, kind))
            .unwrap_or_default()
    }
}

/// Trust asserted by the local identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Trust {
    Flagged,
    #[default]
    Neutral,
    Trusted,
}

impl From<Trust> for i8 {
    fn from(trust: Trust) -> i8 {
        match trust {
            Trust::Flagged => -1,
            Trust::Neutral => 0,
            Trust::Trusted => 1,
        }
    }
}

impl TryFrom<i8> for Trust {
    type Error = String;

    fn try_from(value: i8) -> std::result::Result<Self, Self::Error> {
        match value {
            -1 => Ok(Trust::Flagged),
            0 => Ok(Trust::Neutral),
            1 => Ok(Trust::Trusted),
            other => Err(format!("trust out of range: {}", other)),
        }
    }
}

/// Role one identity declares for another in an alias pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasRole {
    Primary,
    Secondary,
}

/// Update of an optional field: either a new value or an explicit clear
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate<T> {
    Set(T),
    Clear,
}

/// Post or fact; only the thread link affects the views
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostContent {
    pub replies_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactContent {
    pub targets: Vec<String>,
    pub trust: Option<Trust>,
    pub name: Option<String>,
    pub profile_pic: Option<FieldUpdate<JsonValue>>,
    pub alias: Option<FieldUpdate<AliasRole>>,
    pub following: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteContent {
    pub target: Option<String>,
    pub value: i64,
}

/// Closed set of content types the materializer understands
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Init,
    Post(PostContent),
    Fact(PostContent),
    Contact(ContactContent),
    Vote(VoteContent),
    Advert,
    Unrecognized(Option<String>),
}

impl Content {
    /// Parse typed content. Malformed fields are dropped individually; the
    /// remaining fields still apply.
    pub fn parse(content: &JsonValue) -> Content {
        let kind = content.get("type").and_then(JsonValue::as_str);
        match kind {
            Some("init") => Content::Init,
            Some("post") => Content::Post(parse_post(content)),
            Some("fact") => Content::Fact(parse_post(content)),
            Some("contact") => Content::Contact(parse_contact(content)),
            Some("vote") => Content::Vote(parse_vote(content)),
            Some("advert") => Content::Advert,
            other => Content::Unrecognized(other.map(str::to_string)),
        }
    }
}

// Blank strings count as absent; the untrimmed string is kept
fn non_empty_str(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn parse_post(content: &JsonValue) -> PostContent {
    PostContent {
        replies_to: content
            .get("repliesTo")
            .and_then(|v| links::links(v, LinkKind::Msg).into_iter().next()),
    }
}

fn parse_contact(content: &JsonValue) -> ContactContent {
    let targets = content
        .get("contact")
        .map(|v| links::links(v, LinkKind::Feed))
        .unwrap_or_default();

    let trust = content.get("trust").and_then(|v| {
        if is_falsy(v) {
            return Some(Trust::Neutral);
        }
        v.as_i64()
            .and_then(|n| i8::try_from(n).ok())
            .and_then(|n| Trust::try_from(n).ok())
    });

    let profile_pic = content.get("profilePic").and_then(|v| {
        if is_falsy(v) {
            Some(FieldUpdate::Clear)
        } else if links::is_ext_link(v) {
            Some(FieldUpdate::Set(v.clone()))
        } else {
            None
        }
    });

    let alias = content.get("alias").and_then(|v| {
        if is_falsy(v) {
            return Some(FieldUpdate::Clear);
        }
        match v.as_str() {
            Some("primary") => Some(FieldUpdate::Set(AliasRole::Primary)),
            Some("secondary") => Some(FieldUpdate::Set(AliasRole::Secondary)),
            _ => None,
        }
    });

    ContactContent {
        targets,
        trust,
        name: non_empty_str(content.get("name")),
        profile_pic,
        alias,
        following: content.get("following").and_then(JsonValue::as_bool),
    }
}

fn parse_vote(content: &JsonValue) -> VoteContent {
    let vote = content.get("vote");
    VoteContent {
        target: vote.and_then(|v| links::link(v, LinkKind::Msg)),
        value: vote
            .and_then(|v| v.get("value"))
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64)))
            .unwrap_or(0),
    }
}
