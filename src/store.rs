//! Persisted session records and the store adapter seam.
//!
//! Records are replaced wholesale on every save; atomicity per record is the
//! store's only guarantee. Serializing mutations per session is the room
//! actor's job, not the store's.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    /// Set once the host connects; cleared while the host is offline.
    pub transport_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub transport_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub user_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upvotes {
    pub count: u32,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub title: String,
    pub creator: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub upvotes: Upvotes,
    pub is_answered: bool,
}

impl Question {
    pub fn new(title: String, creator: String, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            creator,
            tags,
            upvotes: Upvotes {
                count: 0,
                users: Vec::new(),
            },
            is_answered: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub host: HostRecord,
    pub users: Vec<UserRecord>,
    pub chats: Vec<ChatEntry>,
    pub questions: Vec<Question>,
}

impl SessionRecord {
    pub fn new(id: String, name: String, host_name: String) -> Self {
        Self {
            id,
            name,
            host: HostRecord {
                transport_id: None,
                name: host_name,
            },
            users: Vec::new(),
            chats: Vec::new(),
            questions: Vec::new(),
        }
    }
}

/// CRUD access to persisted sessions. `update` replaces the whole record.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, record: SessionRecord) -> Result<(), BrokerError>;
    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, BrokerError>;
    async fn update(&self, record: SessionRecord) -> Result<(), BrokerError>;
    async fn delete(&self, id: &str) -> Result<(), BrokerError>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemStore {
    records: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

#[async_trait]
impl SessionStore for MemStore {
    async fn create(&self, record: SessionRecord) -> Result<(), BrokerError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, BrokerError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, record: SessionRecord) -> Result<(), BrokerError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), BrokerError> {
        self.records.write().await.remove(id);
        Ok(())
    }
}
