//! Client registry and server identity types

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque value attached by the embedding server to a channel or client
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Persisted part of a client registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub hb_inbox: String,
}

/// A registered client
pub struct Client {
    pub info: ClientInfo,
    pub user_data: Option<UserData>,
}

impl Client {
    /// Create a client registration
    pub fn new(id: impl Into<String>, hb_inbox: impl Into<String>, user_data: Option<UserData>) -> Self {
        Self {
            info: ClientInfo {
                id: id.into(),
                hb_inbox: hb_inbox.into(),
            },
            user_data,
        }
    }

    /// Client ID
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Heartbeat inbox
    pub fn hb_inbox(&self) -> &str {
        &self.info.hb_inbox
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.info.id)
            .field("hb_inbox", &self.info.hb_inbox)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

/// Identity and subject configuration of the embedding server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub cluster_id: String,
    pub discovery: String,
    pub publish: String,
    pub subscribe: String,
    pub unsubscribe: String,
    pub close: String,
}

impl ServerInfo {
    /// Server info for a cluster, with request subjects under `prefix`
    pub fn new(cluster_id: impl Into<String>, prefix: &str) -> Self {
        let cluster_id = cluster_id.into();
        Self {
            discovery: format!("{}.{}", prefix, cluster_id),
            publish: format!("{}.pub", prefix),
            subscribe: format!("{}.sub", prefix),
            unsubscribe: format!("{}.unsub", prefix),
            close: format!("{}.close", prefix),
            cluster_id,
        }
    }
}
