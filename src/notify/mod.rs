//! Per-run outcome fan-out: in-app socket sessions plus an optional
//! ntfy-compatible push endpoint configured per user. Delivery failures are
//! logged and swallowed; notifications never fail a job.

use crate::store::users::{NtfySettings, User};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const NTFY_TIMEOUT_SECS: u64 = 10;
/// Push bodies are clipped to this many characters, on word boundaries.
pub const PUSH_MESSAGE_MAX_CHARS: usize = 500;

pub const CHAT_PATH_PREFIX: &str = "/c/";
pub const SCHEDULED_PROMPTS_PATH: &str = "/workspace/scheduled-prompts";

/// In-app notification payload, emitted to every open session of the user.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_prompts_url: Option<String>,
    pub prompt_id: String,
}

impl Notification {
    pub fn scheduled_prompt(status: &str, title: &str, message: &str, prompt_id: &str) -> Self {
        Self {
            kind: "scheduled_prompt".to_string(),
            status: status.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            chat_id: None,
            chat_url: None,
            scheduled_prompts_url: None,
            prompt_id: prompt_id.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Shared pool of live socket sessions per user.
#[derive(Clone, Default)]
pub struct SessionPool {
    inner: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: &str, session_id: &str) {
        let mut pool = self.inner.write().await;
        let sessions = pool.entry(user_id.to_string()).or_default();
        if !sessions.iter().any(|s| s == session_id) {
            sessions.push(session_id.to_string());
        }
    }

    pub async fn unregister(&self, user_id: &str, session_id: &str) {
        let mut pool = self.inner.write().await;
        if let Some(sessions) = pool.get_mut(user_id) {
            sessions.retain(|s| s != session_id);
            if sessions.is_empty() {
                pool.remove(user_id);
            }
        }
    }

    pub async fn sessions_for(&self, user_id: &str) -> Vec<String> {
        let pool = self.inner.read().await;
        pool.get(user_id).cloned().unwrap_or_default()
    }
}

/// Socket emission contract. The transport itself lives outside the engine.
#[async_trait]
pub trait SocketBroadcaster: Send + Sync {
    async fn emit(&self, event: &str, payload: &Notification, session_id: &str) -> Result<()>;
}

/// Standalone fallback that logs instead of emitting; used when no socket
/// layer is wired in.
pub struct LogBroadcaster;

#[async_trait]
impl SocketBroadcaster for LogBroadcaster {
    async fn emit(&self, event: &str, payload: &Notification, session_id: &str) -> Result<()> {
        debug!(
            "{} -> session {}: {} ({})",
            event, session_id, payload.title, payload.status
        );
        Ok(())
    }
}

/// Build `<base>/<path>` ensuring exactly one slash at the join. Returns
/// `None` when no base URL is configured, in which case deep links are omitted.
pub fn build_webui_url(base: Option<&str>, path: &str) -> Option<String> {
    let base = base?.trim_end_matches('/');
    if base.is_empty() {
        return None;
    }
    if path.starts_with('/') {
        Some(format!("{}{}", base, path))
    } else {
        Some(format!("{}/{}", base, path))
    }
}

pub struct Notifier {
    pool: SessionPool,
    broadcaster: Arc<dyn SocketBroadcaster>,
    http: Client,
    webui_url: Option<String>,
}

impl Notifier {
    pub fn new(
        pool: SessionPool,
        broadcaster: Arc<dyn SocketBroadcaster>,
        webui_url: Option<String>,
    ) -> Self {
        Self {
            pool,
            broadcaster,
            http: Client::builder()
                .timeout(Duration::from_secs(NTFY_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            webui_url,
        }
    }

    pub fn chat_url(&self, chat_id: &str) -> Option<String> {
        build_webui_url(
            self.webui_url.as_deref(),
            &format!("{}{}", CHAT_PATH_PREFIX, chat_id),
        )
    }

    pub fn scheduled_prompts_url(&self) -> Option<String> {
        build_webui_url(self.webui_url.as_deref(), SCHEDULED_PROMPTS_PATH)
    }

    /// Deliver a run outcome to the user over both channels. Never fails.
    pub async fn notify(&self, user: &User, notification: &Notification) {
        self.send_in_app(&user.id, notification).await;
        if let Some(ntfy) = user.ntfy() {
            if ntfy.is_configured() {
                if let Err(e) = self.send_ntfy(ntfy, notification).await {
                    warn!("Failed to send ntfy notification for {}: {}", user.id, e);
                }
            }
        }
    }

    /// Emit to every open session; a user with no sessions is skipped.
    async fn send_in_app(&self, user_id: &str, notification: &Notification) {
        let sessions = self.pool.sessions_for(user_id).await;
        if sessions.is_empty() {
            debug!("User {} not online, skipping in-app notification", user_id);
            return;
        }
        for session_id in sessions {
            if let Err(e) = self
                .broadcaster
                .emit("notification", notification, &session_id)
                .await
            {
                warn!("Failed to emit notification to session {}: {}", session_id, e);
            }
        }
    }

    async fn send_ntfy(&self, settings: &NtfySettings, notification: &Notification) -> Result<()> {
        let url = format!(
            "{}/{}",
            settings.server_url.trim_end_matches('/'),
            settings.topic
        );

        let (tags, priority) = if notification.is_success() {
            ("calendar", "default")
        } else {
            ("warning", "high")
        };

        let mut request = self
            .http
            .post(&url)
            .header("Title", notification.title.clone())
            .header("Tags", tags)
            .header("Priority", priority);

        // Deep links ride in headers only; the body stays plain text.
        let click = notification
            .chat_url
            .as_deref()
            .or(notification.scheduled_prompts_url.as_deref());
        if let Some(click) = click {
            request = request.header("Click", click);
        }
        if let Some(actions) = build_actions_header(notification) {
            request = request.header("Actions", actions);
        }
        if let Some(token) = settings.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let body = crate::utils::truncate_words(&notification.message, PUSH_MESSAGE_MAX_CHARS);
        let resp = request.body(body.into_bytes()).send().await?;
        if !resp.status().is_success() {
            warn!(
                "ntfy endpoint {} returned status {}",
                url,
                resp.status().as_u16()
            );
        }
        Ok(())
    }
}

/// ntfy `Actions` header: view buttons for the chat and the scheduled
/// prompts page, when their links exist.
fn build_actions_header(notification: &Notification) -> Option<String> {
    let mut actions = Vec::new();
    if let Some(chat_url) = notification.chat_url.as_deref() {
        actions.push(format!("view, Open Chat, {}", chat_url));
    }
    if let Some(sp_url) = notification.scheduled_prompts_url.as_deref() {
        actions.push(format!("view, Scheduled Prompts, {}", sp_url));
    }
    if actions.is_empty() {
        None
    } else {
        Some(actions.join("; "))
    }
}
