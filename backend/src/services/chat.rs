use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::COLLABORATOR_TIMEOUT_SECS;
use crate::error::{MatchError, MatchResult};
use crate::models::{ChatId, UserId};

/// External chat service. `create_or_get_chat` must be idempotent per pair:
/// calling it again for the same two users returns the same chat.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn create_or_get_chat(&self, user_a: UserId, user_b: UserId) -> MatchResult<ChatId>;
}

#[derive(Serialize)]
struct CreateChatRequest {
    participants: [UserId; 2],
}

#[derive(Deserialize)]
struct CreateChatResponse {
    chat_id: String,
}

pub struct HttpChatService {
    client: Client,
    base_url: String,
}

impl HttpChatService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(COLLABORATOR_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatService for HttpChatService {
    async fn create_or_get_chat(&self, user_a: UserId, user_b: UserId) -> MatchResult<ChatId> {
        let response = self
            .client
            .post(format!("{}/chats", self.base_url))
            .json(&CreateChatRequest {
                participants: ordered(user_a, user_b),
            })
            .send()
            .await
            .map_err(|e| MatchError::ChatUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MatchError::ChatUnavailable(format!(
                "chat service returned {}",
                response.status()
            )));
        }

        let body: CreateChatResponse = response
            .json()
            .await
            .map_err(|e| MatchError::ChatUnavailable(e.to_string()))?;
        Ok(body.chat_id)
    }
}

fn ordered(a: UserId, b: UserId) -> [UserId; 2] {
    if a <= b { [a, b] } else { [b, a] }
}

/// In-process chat registry for single-node mode and tests. Can be told to
/// fail the next few calls.
#[derive(Default)]
pub struct InMemoryChatService {
    chats: Mutex<HashMap<[UserId; 2], ChatId>>,
    failures_left: Mutex<u32>,
    calls: Mutex<u32>,
}

impl InMemoryChatService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        *self.failures_left.lock() = n;
    }

    pub fn chat_count(&self) -> usize {
        self.chats.lock().len()
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl ChatService for InMemoryChatService {
    async fn create_or_get_chat(&self, user_a: UserId, user_b: UserId) -> MatchResult<ChatId> {
        *self.calls.lock() += 1;
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(MatchError::ChatUnavailable("injected failure".to_string()));
            }
        }
        let mut chats = self.chats.lock();
        let id = chats
            .entry(ordered(user_a, user_b))
            .or_insert_with(|| format!("chat-{}", Uuid::new_v4()));
        Ok(id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_pair_reuses_chat() {
        let chat = InMemoryChatService::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = chat.create_or_get_chat(a, b).await.unwrap();
        let second = chat.create_or_get_chat(b, a).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(chat.chat_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let chat = InMemoryChatService::new();
        chat.fail_next(2);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(chat.create_or_get_chat(a, b).await.is_err());
        assert!(chat.create_or_get_chat(a, b).await.is_err());
        assert!(chat.create_or_get_chat(a, b).await.is_ok());
        assert_eq!(chat.calls(), 3);
    }
}
