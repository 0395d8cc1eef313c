//! The underlying vector/relational store collaborator.
//!
//! Document ingestion, workspace/resource/conversation CRUD and the store's
//! own persistence engine are out of scope; this module only
//! defines the `Store` trait the rest of the pipeline reaches through, plus
//! an in-memory reference implementation used by tests and the example
//! binary. Grounded on `oriongraph`'s `SessionClient`/`MemoryClient`, which
//! are thin async collaborator clients behind their own structs -
//! generalized here into a trait so a real Postgres/pgvector-backed client
//! can implement the same surface.

use crate::types::{Chunk, Conversation, Message, Resource, Workspace};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>>;

    async fn resources_in_workspace(&self, workspace_id: Uuid) -> Result<Vec<Resource>>;
    async fn resources_by_title(&self, workspace_id: Uuid, titles: &[String]) -> Result<Vec<Resource>>;
    async fn bump_citation_count(&self, resource_id: Uuid) -> Result<()>;

    async fn chunks_for_resource(&self, resource_id: Uuid) -> Result<Vec<Chunk>>;
    async fn chunks_with_embeddings(&self, workspace_id: Uuid) -> Result<Vec<(Chunk, Resource)>>;
    async fn all_chunks(&self, workspace_id: Uuid) -> Result<Vec<(Chunk, Resource)>>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;
    async fn touch_conversation(&self, id: Uuid, tokens_used: u64) -> Result<()>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>>;
    async fn put_message(&self, message: Message) -> Result<()>;
    async fn preceding_user_message(&self, conversation_id: Uuid, before: Uuid) -> Result<Option<Message>>;
}

/// Reference implementation: an in-process map, adequate for tests and for
/// driving the example binary without a live database.
#[derive(Default)]
pub struct InMemoryStore {
    workspaces: DashMap<Uuid, Workspace>,
    resources: DashMap<Uuid, Resource>,
    chunks: DashMap<Uuid, Vec<Chunk>>, // keyed by resource_id
    conversations: DashMap<Uuid, Conversation>,
    messages: DashMap<Uuid, Message>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_workspace(&self, ws: Workspace) {
        self.workspaces.insert(ws.id, ws);
    }

    pub fn insert_resource(&self, resource: Resource) {
        self.resources.insert(resource.id, resource);
    }

    pub fn insert_chunks(&self, resource_id: Uuid, chunks: Vec<Chunk>) {
        self.chunks.insert(resource_id, chunks);
    }

    pub fn insert_conversation(&self, conv: Conversation) {
        self.conversations.insert(conv.id, conv);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>> {
        Ok(self.workspaces.get(&id).map(|r| r.clone()))
    }

    async fn resources_in_workspace(&self, workspace_id: Uuid) -> Result<Vec<Resource>> {
        Ok(self
            .resources
            .iter()
            .filter(|r| r.workspace_id == workspace_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn resources_by_title(&self, workspace_id: Uuid, titles: &[String]) -> Result<Vec<Resource>> {
        let lowered: Vec<String> = titles.iter().map(|t| t.to_lowercase()).collect();
        Ok(self
            .resources
            .iter()
            .filter(|r| r.workspace_id == workspace_id && lowered.contains(&r.title.to_lowercase()))
            .map(|r| r.clone())
            .collect())
    }

    async fn bump_citation_count(&self, resource_id: Uuid) -> Result<()> {
        if let Some(mut r) = self.resources.get_mut(&resource_id) {
            r.citation_count += 1;
        }
        Ok(())
    }

    async fn chunks_for_resource(&self, resource_id: Uuid) -> Result<Vec<Chunk>> {
        Ok(self.chunks.get(&resource_id).map(|c| c.clone()).unwrap_or_default())
    }

    async fn chunks_with_embeddings(&self, workspace_id: Uuid) -> Result<Vec<(Chunk, Resource)>> {
        let mut out = Vec::new();
        for resource in self.resources_in_workspace(workspace_id).await? {
            for chunk in self.chunks_for_resource(resource.id).await? {
                if chunk.embedding.is_some() {
                    out.push((chunk, resource.clone()));
                }
            }
        }
        Ok(out)
    }

    async fn all_chunks(&self, workspace_id: Uuid) -> Result<Vec<(Chunk, Resource)>> {
        let mut out = Vec::new();
        for resource in self.resources_in_workspace(workspace_id).await? {
            for chunk in self.chunks_for_resource(resource.id).await? {
                out.push((chunk, resource.clone()));
            }
        }
        Ok(out)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    async fn touch_conversation(&self, id: Uuid, tokens_used: u64) -> Result<()> {
        if let Some(mut c) = self.conversations.get_mut(&id) {
            c.message_count += 1;
            c.token_usage += tokens_used;
            c.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn put_message(&self, message: Message) -> Result<()> {
        self.messages.insert(message.id, message);
        Ok(())
    }

    async fn preceding_user_message(&self, conversation_id: Uuid, before: Uuid) -> Result<Option<Message>> {
        let before_ts = match self.messages.get(&before) {
            Some(m) => m.timestamp,
            None => return Ok(None),
        };
        Ok(self
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.role == crate::types::MessageRole::User
                    && m.timestamp <= before_ts
                    && m.id != before
            })
            .max_by_key(|m| m.timestamp)
            .map(|m| m.clone()))
    }
}
