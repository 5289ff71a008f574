//! Scheduled job records and the persistence contract the engine mutates
//! execution state through.

use crate::utils::{atomic_write, now_ts};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionCallingMode {
    #[default]
    Default,
    Native,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Running,
}

/// A persisted scheduled prompt. Identity, schedule, and payload are owned by
/// the CRUD layer; the execution-state block is mutated by the engine only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub user_id: String,
    pub name: String,

    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub model_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub prompt: String,

    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default = "default_true")]
    pub create_new_chat: bool,
    #[serde(default)]
    pub run_once: bool,

    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(default)]
    pub function_calling_mode: FunctionCallingMode,

    #[serde(default)]
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub next_run_at: Option<i64>,
    #[serde(default)]
    pub last_status: Option<RunStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_count: u32,

    pub created_at: i64,
    pub updated_at: i64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

/// Post-run state advance. `next_run_at` is stored verbatim: `Some` advances
/// the schedule, `None` clears it (one-shot completion).
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: RunStatus,
    pub error: Option<String>,
    pub chat_id: Option<String>,
    pub next_run_at: Option<i64>,
}

impl ExecutionUpdate {
    pub fn success(chat_id: Option<String>, next_run_at: Option<i64>) -> Self {
        Self {
            status: RunStatus::Success,
            error: None,
            chat_id,
            next_run_at,
        }
    }

    pub fn error(message: String, next_run_at: Option<i64>) -> Self {
        Self {
            status: RunStatus::Error,
            error: Some(message),
            chat_id: None,
            next_run_at,
        }
    }
}

/// Partial update from the CRUD layer. Fields set to `Some` are applied.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: Option<String>,
    pub create_new_chat: Option<bool>,
    pub run_once: Option<bool>,
    pub tool_ids: Option<Vec<String>>,
    pub function_calling_mode: Option<FunctionCallingMode>,
    pub next_run_at: Option<i64>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: ScheduledJob) -> Result<ScheduledJob>;

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>>;

    /// Enabled jobs whose `next_run_at` is set and has passed, ascending by
    /// `next_run_at`. A job keeps reappearing here until `update_execution`
    /// advances it past `now` or it is disabled.
    async fn due(&self, now: i64) -> Result<Vec<ScheduledJob>>;

    async fn list_enabled(&self) -> Result<Vec<ScheduledJob>>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ScheduledJob>>;

    async fn count_by_user(&self, user_id: &str) -> Result<usize>;

    async fn update(&self, id: &str, patch: JobPatch) -> Result<Option<ScheduledJob>>;

    /// Record one observed run attempt: stamps `last_run_at`, applies status
    /// and error, increments `run_count` exactly once, stores `chat_id` when
    /// given, and writes `next_run_at` verbatim from the update.
    async fn update_execution(
        &self,
        id: &str,
        update: ExecutionUpdate,
    ) -> Result<Option<ScheduledJob>>;

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Option<ScheduledJob>>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobFile {
    #[serde(default = "default_version")]
    version: i32,
    #[serde(default)]
    jobs: Vec<ScheduledJob>,
}

fn default_version() -> i32 {
    1
}

/// JSON-file backed job store. The whole document is rewritten atomically on
/// every mutation; a single `Mutex` makes each update atomic per record with
/// last-writer-wins semantics.
pub struct FileJobStore {
    path: PathBuf,
    state: Mutex<JobFile>,
}

impl FileJobStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            JobFile {
                version: 1,
                jobs: vec![],
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn save(&self, state: &JobFile) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        atomic_write(&self.path, &content)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        let mut state = self.state.lock().await;
        state.jobs.push(job.clone());
        self.save(&state)?;
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn due(&self, now: i64) -> Result<Vec<ScheduledJob>> {
        let state = self.state.lock().await;
        let mut due: Vec<ScheduledJob> = state
            .jobs
            .iter()
            .filter(|j| j.enabled && j.next_run_at.is_some_and(|next| next <= now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run_at);
        Ok(due)
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduledJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ScheduledJob> =
            state.jobs.iter().filter(|j| j.enabled).cloned().collect();
        jobs.sort_by_key(|j| j.next_run_at.unwrap_or(i64::MAX));
        Ok(jobs)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<ScheduledJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<ScheduledJob> = state
            .jobs
            .iter()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.updated_at));
        Ok(jobs)
    }

    async fn count_by_user(&self, user_id: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().filter(|j| j.user_id == user_id).count())
    }

    async fn update(&self, id: &str, patch: JobPatch) -> Result<Option<ScheduledJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(None);
        };

        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(expr) = patch.cron_expression {
            job.cron_expression = expr;
        }
        if let Some(tz) = patch.timezone {
            job.timezone = tz;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        if let Some(model_id) = patch.model_id {
            job.model_id = model_id;
        }
        if let Some(system_prompt) = patch.system_prompt {
            job.system_prompt = Some(system_prompt);
        }
        if let Some(prompt) = patch.prompt {
            job.prompt = prompt;
        }
        if let Some(create_new_chat) = patch.create_new_chat {
            job.create_new_chat = create_new_chat;
        }
        if let Some(run_once) = patch.run_once {
            job.run_once = run_once;
        }
        if let Some(tool_ids) = patch.tool_ids {
            job.tool_ids = tool_ids;
        }
        if let Some(mode) = patch.function_calling_mode {
            job.function_calling_mode = mode;
        }
        if let Some(next_run_at) = patch.next_run_at {
            job.next_run_at = Some(next_run_at);
        }
        job.updated_at = now_ts();

        let updated = job.clone();
        self.save(&state)?;
        Ok(Some(updated))
    }

    async fn update_execution(
        &self,
        id: &str,
        update: ExecutionUpdate,
    ) -> Result<Option<ScheduledJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(None);
        };

        let now = now_ts();
        job.last_run_at = Some(now);
        job.last_status = Some(update.status);
        job.last_error = update.error;
        job.run_count += 1;
        if let Some(chat_id) = update.chat_id {
            job.chat_id = Some(chat_id);
        }
        job.next_run_at = update.next_run_at;
        job.updated_at = now;

        let updated = job.clone();
        self.save(&state)?;
        Ok(Some(updated))
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Option<ScheduledJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(None);
        };
        job.enabled = enabled;
        job.updated_at = now_ts();
        let updated = job.clone();
        self.save(&state)?;
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != id);
        let removed = state.jobs.len() < before;
        if removed {
            self.save(&state)?;
        }
        Ok(removed)
    }
}
