//! MetaInfo extension
//!
//! Lets the storage roles exchange small keyed messages with a named
//! peer. Inbound META_INFO messages are handed to the role's
//! [`MetaMessageHandler`], which is assigned once per node.

use crate::dht::KadDht;
use crate::record::LocalStore;
use crate::{DhtError, Result};
use async_trait::async_trait;
use keepnet_core::proto::{Message, MessageType, OpType, Record};
use keepnet_core::PeerId;
use std::sync::Arc;
use tracing::{debug, warn};

/// Middle path segment marking keys that are read by broadcast
pub const USER_INIT_SEGMENT: &str = "UserInit";

/// Whether `key` has the form `<id>/UserInit/<rest>`
pub fn is_user_init_key(key: &str) -> bool {
    let parts: Vec<&str> = key.splitn(3, '/').collect();
    parts.len() == 3 && parts[1] == USER_INIT_SEGMENT
}

/// An inbound META_INFO message
#[derive(Debug, Clone)]
pub struct MetaRequest {
    pub from: PeerId,
    pub key: String,
    pub value: Vec<u8>,
    /// Application operation name
    pub caller: String,
    pub op: OpType,
}

/// Role callback for inbound META_INFO messages.
///
/// Returning `Some` puts the bytes in the reply record; returning an
/// error resets the requester's stream.
#[async_trait]
pub trait MetaMessageHandler: Send + Sync {
    async fn handle_meta_message(&self, store: &LocalStore, req: MetaRequest) -> anyhow::Result<Option<Vec<u8>>>;
}

impl KadDht {
    /// Install the role handler; a node accepts only one
    pub fn assign_meta_handler(&self, handler: Arc<dyn MetaMessageHandler>) -> Result<()> {
        self.inner
            .meta_handler
            .set(handler)
            .map_err(|_| DhtError::HandlerAlreadyAssigned)
    }

    /// Send a META_INFO request to `peer` and return the value it replies with
    pub async fn send_meta_request(&self, key: &str, value: Vec<u8>, peer: &PeerId, caller: &str) -> Result<String> {
        self.ensure_open()?;
        let msg = meta_message(key, value, caller);
        let resp = self.send_request(peer, &msg).await?;

        match resp.record {
            Some(rec) => String::from_utf8(rec.value)
                .map_err(|_| DhtError::Protocol("meta reply is not valid UTF-8".to_string())),
            None => Err(DhtError::Protocol("meta reply carries no value".to_string())),
        }
    }

    /// Send a META_INFO message to `peer` without waiting for a reply
    pub async fn send_meta_message(&self, key: &str, value: Vec<u8>, peer: &PeerId, caller: &str) -> Result<()> {
        self.ensure_open()?;
        let msg = meta_message(key, value, caller);
        self.send_message(peer, &msg).await
    }

    pub(crate) async fn dispatch_meta(&self, req: MetaRequest) -> Result<Option<Vec<u8>>> {
        let handler = self.inner.meta_handler.get().cloned().ok_or(DhtError::NoMetaHandler)?;
        debug!("Meta {} for {} from {}", req.caller, req.key, req.from.short());
        handler
            .handle_meta_message(&self.inner.local, req)
            .await
            .map_err(|e| DhtError::Handler(e.to_string()))
    }

    pub fn append_local(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.local.append_local(key, value)
    }

    pub fn liter_local(&self, prefix: &str) -> Result<Option<Record>> {
        self.inner.local.liter_local(prefix)
    }
}

fn meta_message(key: &str, value: Vec<u8>, caller: &str) -> Message {
    let mut msg = Message::new(MessageType::MetaInfo, key);
    msg.record = Some(Record::new(key, value));
    msg.caller = caller.to_string();
    msg
}

impl LocalStore {
    /// Append `value` to the record at `key`, unless it already contains it
    pub fn append_local(&self, key: &str, value: &[u8]) -> Result<()> {
        let merged = match self.get_local(key)? {
            Some(old) if contains(&old.value, value) => return Ok(()),
            Some(mut old) => {
                old.value.extend_from_slice(value);
                old.value
            }
            None => value.to_vec(),
        };
        self.put_local(key, &Record::new(key, merged))
    }

    /// Every record under `prefix`, folded into one record whose key and
    /// value are the space-joined keys and values
    pub fn liter_local(&self, prefix: &str) -> Result<Option<Record>> {
        let mut keys = Vec::new();
        let mut values = Vec::new();

        for (key, buf) in self.datastore().query_prefix(prefix)? {
            match Record::from_bytes(&buf) {
                Ok(rec) => {
                    keys.push(key);
                    values.push(rec.value);
                }
                Err(e) => warn!("Skipping undecodable record {}: {}", key, e),
            }
        }

        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(Record::new(keys.join(" "), values.join(&b' '))))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDatastore;

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(MemoryDatastore::new()))
    }

    #[test]
    fn test_user_init_key() {
        assert!(is_user_init_key("abc/UserInit/rest"));
        assert!(is_user_init_key("abc/UserInit/a/b"));
        assert!(!is_user_init_key("abc/UserInit"));
        assert!(!is_user_init_key("abc/Other/rest"));
        assert!(!is_user_init_key("plain"));
    }

    #[test]
    fn test_append_local() {
        let store = store();
        store.append_local("k", b"a").unwrap();
        store.append_local("k", b"b").unwrap();
        assert_eq!(store.get_local("k").unwrap().unwrap().value, b"ab");

        store.append_local("k", b"a").unwrap();
        assert_eq!(store.get_local("k").unwrap().unwrap().value, b"ab");

        let listed = store.liter_local("k").unwrap().unwrap();
        assert_eq!(listed.key, b"k");
        assert_eq!(listed.value, b"ab");
    }

    #[test]
    fn test_liter_local() {
        let store = store();
        assert!(store.liter_local("/user/").unwrap().is_none());

        store.put_local("/user/1", &Record::new("/user/1", "x")).unwrap();
        store.put_local("/user/2", &Record::new("/user/2", "y")).unwrap();
        store.put_local("/other", &Record::new("/other", "z")).unwrap();
        store.datastore().put("/user/3", vec![0xff, 0xff, 0xff]).unwrap();

        let rec = store.liter_local("/user/").unwrap().unwrap();
        assert_eq!(rec.key, b"/user/1 /user/2");
        assert_eq!(rec.value, b"x y");
    }
}
