//! Storage roles and their MetaInfo handlers
//!
//! Every node runs one role. Keepers and providers accept writes pushed
//! by other peers; users only answer reads.

use async_trait::async_trait;
use clap::ValueEnum;
use keepnet_core::proto::Record;
use keepnet_dht::{LocalStore, MetaMessageHandler, MetaRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Keeper,
    Provider,
    User,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Keeper => write!(f, "keeper"),
            Role::Provider => write!(f, "provider"),
            Role::User => write!(f, "user"),
        }
    }
}

/// Operations a peer can ask for in a META_INFO message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    PutTo,
    GetFrom,
    AppendTo,
    ListFrom,
    DeleteFrom,
}

impl Caller {
    pub fn as_str(&self) -> &'static str {
        match self {
            Caller::PutTo => "putTo",
            Caller::GetFrom => "getFrom",
            Caller::AppendTo => "appendTo",
            Caller::ListFrom => "listFrom",
            Caller::DeleteFrom => "deleteFrom",
        }
    }

    pub fn writes(&self) -> bool {
        matches!(self, Caller::PutTo | Caller::AppendTo | Caller::DeleteFrom)
    }
}

impl FromStr for Caller {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "putTo" => Ok(Caller::PutTo),
            "getFrom" => Ok(Caller::GetFrom),
            "appendTo" => Ok(Caller::AppendTo),
            "listFrom" => Ok(Caller::ListFrom),
            "deleteFrom" => Ok(Caller::DeleteFrom),
            other => anyhow::bail!("unsupported caller: {}", other),
        }
    }
}

/// Reply sent for writes that carry no data back
pub const ACK: &[u8] = b"ok";

/// Serves META_INFO requests against the node's local store
pub struct RoleHandler {
    role: Role,
}

impl RoleHandler {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

#[async_trait]
impl MetaMessageHandler for RoleHandler {
    async fn handle_meta_message(&self, store: &LocalStore, req: MetaRequest) -> anyhow::Result<Option<Vec<u8>>> {
        let caller: Caller = req.caller.parse()?;
        if self.role == Role::User && caller.writes() {
            anyhow::bail!("{} role does not accept {}", self.role, caller.as_str());
        }
        debug!("{} {} {} from {}", self.role, caller.as_str(), req.key, req.from.short());

        match caller {
            Caller::PutTo => {
                store.put_local(&req.key, &Record::new(req.key.as_str(), req.value))?;
                Ok(Some(ACK.to_vec()))
            }
            Caller::GetFrom => Ok(store.get_local(&req.key)?.map(|r| r.value)),
            Caller::AppendTo => {
                store.append_local(&req.key, &req.value)?;
                Ok(Some(ACK.to_vec()))
            }
            Caller::ListFrom => Ok(store.liter_local(&req.key)?.map(|r| r.value)),
            Caller::DeleteFrom => {
                store.delete_local(&req.key)?;
                Ok(Some(ACK.to_vec()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepnet_core::proto::OpType;
    use keepnet_core::PeerId;
    use keepnet_dht::MemoryDatastore;
    use std::sync::Arc;

    fn request(caller: &str, key: &str, value: &[u8]) -> MetaRequest {
        MetaRequest {
            from: PeerId::random(),
            key: key.to_string(),
            value: value.to_vec(),
            caller: caller.to_string(),
            op: OpType::Unary,
        }
    }

    #[tokio::test]
    async fn test_keeper_put_get_list_delete() {
        let store = LocalStore::new(Arc::new(MemoryDatastore::new()));
        let keeper = RoleHandler::new(Role::Keeper);

        let ack = keeper.handle_meta_message(&store, request("putTo", "/b/1", b"one")).await.unwrap();
        assert_eq!(ack.unwrap(), ACK);
        keeper.handle_meta_message(&store, request("appendTo", "/b/2", b"two")).await.unwrap();

        let got = keeper.handle_meta_message(&store, request("getFrom", "/b/1", b"")).await.unwrap();
        assert_eq!(got.unwrap(), b"one");

        let listed = keeper.handle_meta_message(&store, request("listFrom", "/b/", b"")).await.unwrap();
        assert_eq!(listed.unwrap(), b"one two");

        keeper.handle_meta_message(&store, request("deleteFrom", "/b/1", b"")).await.unwrap();
        let gone = keeper.handle_meta_message(&store, request("getFrom", "/b/1", b"")).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_user_is_read_only() {
        let store = LocalStore::new(Arc::new(MemoryDatastore::new()));
        let user = RoleHandler::new(Role::User);

        assert!(user.handle_meta_message(&store, request("putTo", "k", b"v")).await.is_err());
        assert!(store.get_local("k").unwrap().is_none());
        assert!(user.handle_meta_message(&store, request("getFrom", "k", b"")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_caller_rejected() {
        let store = LocalStore::new(Arc::new(MemoryDatastore::new()));
        let provider = RoleHandler::new(Role::Provider);
        assert!(provider.handle_meta_message(&store, request("format", "k", b"")).await.is_err());
    }

    #[test]
    fn test_caller_names_roundtrip() {
        for c in [Caller::PutTo, Caller::GetFrom, Caller::AppendTo, Caller::ListFrom, Caller::DeleteFrom] {
            assert_eq!(c.as_str().parse::<Caller>().unwrap(), c);
        }
    }
}
