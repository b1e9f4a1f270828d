//! Lookup codes
//!
//! A lookup code names a feed and the peers that can serve it:
//!
//! ```text
//! @<feed key>.ed25519[via]host:port:key,host:port:key
//! ```
//!
//! Using one walks the listed peers, then any peers the connector already
//! knows about, pulling the feed's history from each until one of them
//! delivers at least one message. Progress is reported as a stream of
//! [`LookupEvent`]s that ends when a peer succeeds or candidates run out.

use crate::error::{Result, ViewError};
use crate::links::is_feed_id;
use crate::message::MessageValue;
use crate::store::LogStore;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

const VIA: &str = "[via]";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub key: String,
}

impl FromStr for PeerAddress {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            [host, port, key] if !host.is_empty() && !key.is_empty() => Ok(PeerAddress {
                host: host.to_string(),
                port: port
                    .parse()
                    .map_err(|_| ViewError::InvalidLookupCode(format!("bad port in {}", s)))?,
                key: key.to_string(),
            }),
            _ => Err(ViewError::InvalidLookupCode(format!("bad address {}", s))),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupCode {
    pub id: String,
    pub addresses: Vec<PeerAddress>,
}

impl FromStr for LookupCode {
    type Err = ViewError;

    /// Malformed addresses are dropped; a malformed feed id fails the code.
    fn from_str(code: &str) -> Result<Self> {
        let code = code.trim();
        let (id, via) = code.split_once(VIA).unwrap_or((code, ""));

        let id = id.trim();
        let id = if id.starts_with('@') {
            id.to_string()
        } else {
            format!("@{}", id)
        };
        if !is_feed_id(&id) {
            return Err(ViewError::InvalidLookupCode(code.to_string()));
        }

        let addresses = via
            .split(',')
            .filter(|a| !a.trim().is_empty())
            .filter_map(|a| match a.parse() {
                Ok(address) => Some(address),
                Err(e) => {
                    debug!("Skipping lookup address: {}", e);
                    None
                }
            })
            .collect();

        Ok(LookupCode { id, addresses })
    }
}

impl fmt::Display for LookupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if !self.addresses.is_empty() {
            let addresses: Vec<String> = self.addresses.iter().map(ToString::to_string).collect();
            write!(f, "{}{}", VIA, addresses.join(","))?;
        }
        Ok(())
    }
}

/// Progress of a lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LookupEvent {
    Connecting { address: PeerAddress },
    Syncing { id: String },
    Error { message: String },
    Finished { seq: u64 },
}

/// Opens sessions to remote peers
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, address: &PeerAddress) -> Result<Box<dyn PeerSession>>;

    /// Peers learned through gossip, tried after a code's own addresses
    fn known_peers(&self) -> Vec<PeerAddress>;
}

/// A connection to one peer
#[async_trait]
pub trait PeerSession: Send {
    /// The peer's copy of a feed, oldest first
    async fn history(&mut self, feed_id: &str) -> Result<BoxStream<'static, Result<MessageValue>>>;
}

pub fn use_lookup_code(
    code: &str,
    connector: Arc<dyn PeerConnector>,
    log: Arc<dyn LogStore>,
) -> BoxStream<'static, LookupEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    match code.parse::<LookupCode>() {
        Ok(lookup) => {
            tokio::spawn(run_lookup(lookup, connector, log, tx));
        }
        Err(e) => {
            warn!("{}", e);
            let _ = tx.send(LookupEvent::Error {
                message: "Invalid lookup code".to_string(),
            });
        }
    }

    UnboundedReceiverStream::new(rx).boxed()
}

async fn run_lookup(
    lookup: LookupCode,
    connector: Arc<dyn PeerConnector>,
    log: Arc<dyn LogStore>,
    tx: mpsc::UnboundedSender<LookupEvent>,
) {
    let mut candidates = lookup.addresses.clone();
    for peer in connector.known_peers() {
        if !candidates.contains(&peer) {
            candidates.push(peer);
        }
    }
    info!(id = %lookup.id, candidates = candidates.len(), "Starting lookup");

    // A failed send means the caller dropped the stream
    let send = |event: LookupEvent| tx.send(event).is_ok();

    for address in candidates {
        if !send(LookupEvent::Connecting {
            address: address.clone(),
        }) {
            return;
        }

        let mut session = match connector.connect(&address).await {
            Ok(session) => session,
            Err(e) => {
                debug!(peer = %address, "Connect failed: {}", e);
                if !send(LookupEvent::Error {
                    message: "Failed to connect".to_string(),
                }) {
                    return;
                }
                continue;
            }
        };

        if !send(LookupEvent::Syncing {
            id: lookup.id.clone(),
        }) {
            return;
        }

        match pull_feed(session.as_mut(), &lookup.id, log.as_ref()).await {
            Ok(seq) if seq > 0 => {
                info!(id = %lookup.id, peer = %address, seq, "Lookup finished");
                send(LookupEvent::Finished { seq });
                return;
            }
            Ok(_) => debug!(peer = %address, "Peer had no messages for feed"),
            Err(e) => {
                warn!(peer = %address, "Feed sync failed: {}", e);
                if !send(LookupEvent::Error {
                    message: format!("Failed to sync: {}", e),
                }) {
                    return;
                }
            }
        }
    }

    info!(id = %lookup.id, "Lookup ran out of peers");
}

/// Copy a feed's history into the log; returns the highest sequence stored
async fn pull_feed(session: &mut dyn PeerSession, id: &str, log: &dyn LogStore) -> Result<u64> {
    let mut history = session.history(id).await?;
    let mut seq = 0;

    while let Some(value) = history.next().await {
        let value = value?;
        if value.author != id {
            return Err(ViewError::Peer(format!(
                "peer sent message by {} for feed {}",
                value.author, id
            )));
        }
        let message = log.append(value).await?;
        seq = seq.max(message.value.sequence);
    }

    Ok(seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::feed_id;

    #[test]
    fn test_parse_code_with_peers() {
        let id = feed_id(&[7; 32]);
        let code = format!(" {}[via]pub.example:8008:@pubkey.ed25519,nope,10.0.0.2:9000:k2 ", id);

        let lookup: LookupCode = code.parse().unwrap();
        assert_eq!(lookup.id, id);
        assert_eq!(
            lookup.addresses,
            vec![
                PeerAddress {
                    host: "pub.example".to_string(),
                    port: 8008,
                    key: "@pubkey.ed25519".to_string(),
                },
                PeerAddress {
                    host: "10.0.0.2".to_string(),
                    port: 9000,
                    key: "k2".to_string(),
                },
            ]
        );
        assert_eq!(lookup.to_string().parse::<LookupCode>().unwrap(), lookup);
    }

    #[test]
    fn test_parse_bare_key_without_sigil() {
        let id = feed_id(&[8; 32]);
        let lookup: LookupCode = id.trim_start_matches('@').parse().unwrap();
        assert_eq!(lookup.id, id);
        assert!(lookup.addresses.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_id() {
        assert!(matches!(
            "@nope[via]a:1:b".parse::<LookupCode>(),
            Err(ViewError::InvalidLookupCode(_))
        ));
        assert!("host:notaport:key".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(LookupEvent::Finished { seq: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "finished", "seq": 3 }));
    }
}
