//! Ref validation and link extraction
//!
//! Identities, messages and blobs are addressed by refs of the form
//! `<sigil><base64 of 32 bytes>.<suffix>`:
//!
//! - feeds: `@....ed25519`
//! - messages: `%....sha256`
//! - blobs: `&....sha256`
//!
//! Content fields may carry a ref directly as a string or wrapped in an
//! object (`{"feed": "@..."}`, `{"msg": "%..."}`, `{"link": "..."}`).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Which kind of ref a link field is expected to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Feed,
    Msg,
    Blob,
}

impl LinkKind {
    fn sigil(self) -> char {
        match self {
            LinkKind::Feed => '@',
            LinkKind::Msg => '%',
            LinkKind::Blob => '&',
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            LinkKind::Feed => ".ed25519",
            LinkKind::Msg | LinkKind::Blob => ".sha256",
        }
    }

    fn field(self) -> &'static str {
        match self {
            LinkKind::Feed => "feed",
            LinkKind::Msg => "msg",
            LinkKind::Blob => "ext",
        }
    }

    /// Check that `s` is a well-formed ref of this kind
    pub fn is_valid(self, s: &str) -> bool {
        s.strip_prefix(self.sigil())
            .and_then(|body| body.strip_suffix(self.suffix()))
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .map(|bytes| bytes.len() == 32)
            .unwrap_or(false)
    }
}

pub fn is_feed_id(s: &str) -> bool {
    LinkKind::Feed.is_valid(s)
}

pub fn is_msg_id(s: &str) -> bool {
    LinkKind::Msg.is_valid(s)
}

pub fn is_blob_id(s: &str) -> bool {
    LinkKind::Blob.is_valid(s)
}

/// Extract a single link of the given kind from a content field.
pub fn link(value: &JsonValue, kind: LinkKind) -> Option<String> {
    let candidate = match value {
        JsonValue::String(s) => Some(s.as_str()),
        JsonValue::Object(map) => map
            .get(kind.field())
            .or_else(|| map.get("link"))
            .and_then(JsonValue::as_str),
        _ => None,
    }?;

    kind.is_valid(candidate).then(|| candidate.to_string())
}

/// Extract every valid link of the given kind. Accepts a single link or an
/// array of them; malformed entries are skipped.
pub fn links(value: &JsonValue, kind: LinkKind) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(|v| link(v, kind)).collect(),
        other => link(other, kind).into_iter().collect(),
    }
}

/// An external (blob) link: an object whose `ext` field is a blob ref.
pub fn is_ext_link(value: &JsonValue) -> bool {
    value
        .get("ext")
        .and_then(JsonValue::as_str)
        .map(is_blob_id)
        .unwrap_or(false)
}

fn encode_ref(kind: LinkKind, bytes: &[u8]) -> String {
    format!("{}{}{}", kind.sigil(), STANDARD.encode(bytes), kind.suffix())
}

/// Feed id for a 32-byte public key
pub fn feed_id(public_key: &[u8; 32]) -> String {
    encode_ref(LinkKind::Feed, public_key)
}

/// Content-addressed message key: sha256 over the encoded message value
pub fn message_key(encoded_value: &[u8]) -> String {
    encode_ref(LinkKind::Msg, &Sha256::digest(encoded_value))
}

/// Blob ref for raw blob bytes
pub fn blob_id(data: &[u8]) -> String {
    encode_ref(LinkKind::Blob, &Sha256::digest(data))
}

/// Shortened id used as a fallback display name
pub fn short_id(id: &str) -> String {
    const LEN: usize = 6;
    if id.chars().count() > LEN + 3 {
        let prefix: String = id.chars().take(LEN).collect();
        format!("{}...", prefix)
    } else {
        id.to_string()
    }
}

/// JavaScript-style falsiness for optional content fields
pub(crate) fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64().map(|f| f == 0.0 || f.is_nan()).unwrap_or(false),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(seed: &str) -> String {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(seed.as_bytes()));
        feed_id(&key)
    }

    #[test]
    fn test_ref_validation() {
        let alice = feed("alice");
        assert!(is_feed_id(&alice));
        assert!(!is_msg_id(&alice));

        let key = message_key(b"{}");
        assert!(is_msg_id(&key));
        assert!(!is_feed_id(&key));

        assert!(is_blob_id(&blob_id(b"png bytes")));
        assert!(!is_feed_id("@short.ed25519"));
        assert!(!is_feed_id("alice"));
        assert!(!is_msg_id("%not base64!.sha256"));
    }

    #[test]
    fn test_link_forms() {
        let alice = feed("alice");
        let bob = feed("bob");

        assert_eq!(link(&json!(alice), LinkKind::Feed), Some(alice.clone()));
        assert_eq!(link(&json!({ "feed": bob }), LinkKind::Feed), Some(bob.clone()));
        assert_eq!(link(&json!({ "link": bob }), LinkKind::Feed), Some(bob.clone()));
        assert_eq!(link(&json!(42), LinkKind::Feed), None);

        let all = links(&json!([alice, { "feed": bob }, "garbage", null]), LinkKind::Feed);
        assert_eq!(all, vec![alice, bob]);
    }

    #[test]
    fn test_ext_link() {
        let blob = blob_id(b"avatar");
        assert!(is_ext_link(&json!({ "ext": blob, "mime": "image/png" })));
        assert!(!is_ext_link(&json!({ "ext": "nope" })));
        assert!(!is_ext_link(&json!(blob)));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("@abcdefghijk.ed25519"), "@abcde...");
        assert_eq!(short_id("@abcdefgh"), "@abcdefgh");
        assert_eq!(short_id("@abcde"), "@abcde");
    }

    #[test]
    fn test_falsy() {
        assert!(is_falsy(&json!(null)));
        assert!(is_falsy(&json!(false)));
        assert!(is_falsy(&json!(0)));
        assert!(is_falsy(&json!("")));
        assert!(!is_falsy(&json!("x")));
        assert!(!is_falsy(&json!(-1)));
        assert!(!is_falsy(&json!({})));
    }
}
