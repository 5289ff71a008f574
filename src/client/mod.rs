//! Non-streaming chat-completion client for the backend's
//! `/api/chat/completions` endpoint, authenticated with a short-lived bearer
//! token minted per owning user.

use crate::errors::EngineError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const COMPLETIONS_PATH: &str = "/api/chat/completions";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Token lifetime for per-call bearer auth. Must stay within the 5–15 minute
/// window the auth layer accepts for service-minted tokens.
pub const TOKEN_TTL: Duration = Duration::from_secs(300);

/// Mints short-lived bearer tokens scoped to a user. The real implementation
/// lives in the auth layer; the engine only depends on this contract.
pub trait TokenMinter: Send + Sync {
    fn mint(&self, user_id: &str, ttl: Duration) -> String;
}

/// Function-calling hint passed through to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionParams {
    pub function_calling: String,
}

impl CompletionParams {
    pub fn default_mode() -> Self {
        Self {
            function_calling: "default".to_string(),
        }
    }

    pub fn native_mode() -> Self {
        Self {
            function_calling: "native".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMessage {
    pub role: String,
    pub content: String,
}

impl RequestMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<CompletionParams>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<RequestMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            tool_ids: None,
            params: None,
        }
    }
}

/// One retrieval/tool source attached to a response. Names may be bare
/// (`get_note`) or namespaced (`notes_manager/get_note`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub source: SourceRef,
    #[serde(default)]
    pub document: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<SourceMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<MetadataParameters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl CompletionResponse {
    pub fn message(&self) -> Option<&ResponseMessage> {
        self.choices.first().map(|c| &c.message)
    }

    /// Final assistant text: `content`, else `reasoning_content`, else empty.
    /// A present-but-empty `content` counts as absent, so reasoning-style
    /// backends that always emit the key still surface their text.
    pub fn assistant_content(&self) -> String {
        self.message()
            .and_then(|m| {
                m.content
                    .clone()
                    .filter(|content| !content.is_empty())
                    .or_else(|| m.reasoning_content.clone())
            })
            .unwrap_or_default()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.message().is_some_and(|m| !m.tool_calls.is_empty())
    }
}

pub struct ChatCompletionClient {
    base_url: String,
    client: Client,
    minter: Arc<dyn TokenMinter>,
}

impl ChatCompletionClient {
    pub fn new(base_url: impl Into<String>, minter: Arc<dyn TokenMinter>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            minter,
        }
    }

    /// Issue a non-streaming completion on behalf of `user_id`. Any non-2xx
    /// status is an error carrying the response body.
    pub async fn complete(
        &self,
        user_id: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, EngineError> {
        let token = self.minter.mint(user_id, TOKEN_TTL);
        let url = format!("{}{}", self.base_url, COMPLETIONS_PATH);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json::<CompletionResponse>().await?)
    }
}

/// Opaque random tokens for deployments where the engine shares an auth
/// allowlist with the backend rather than signing JWTs itself.
pub struct UuidTokenMinter;

impl TokenMinter for UuidTokenMinter {
    fn mint(&self, _user_id: &str, _ttl: Duration) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
