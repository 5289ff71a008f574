//! The supervising scheduler loop: polls the job store for due jobs,
//! dispatches each through a bounded concurrency gate, and runs the model
//! call, repair turns, transcript persistence, state advance, and
//! notification in order. A failing job never disturbs its siblings or the loop.

use crate::client::{ChatCompletionClient, CompletionRequest, RequestMessage};
use crate::cron;
use crate::errors::EngineError;
use crate::models::ModelRegistry;
use crate::notify::{Notification, Notifier};
use crate::repair::{self, RepairPipeline};
use crate::store::chats::{ChatMessage, ChatStore, NoteAttachment};
use crate::store::jobs::{ExecutionUpdate, JobStore, ScheduledJob};
use crate::store::users::{User, UserStore};
use crate::utils::now_ts;
use crate::utils::task_tracker::TaskTracker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Gate size: simultaneous job executions per tick.
pub const CONCURRENT_JOB_LIMIT: usize = 5;
/// Title prefix of transcripts the engine creates.
pub const SCHEDULED_TITLE_PREFIX: &str = "[Scheduled] ";
/// Tool IDs containing this substring are stripped before dispatch so a
/// scheduled run can never schedule further prompts.
pub const SELF_SCHEDULING_TOOL_MARKER: &str = "prompt_scheduler";
/// Errors are clipped to this many characters in notifications.
const NOTIFY_ERROR_MAX_CHARS: usize = 200;
const TITLE_FROM_PROMPT_MAX_CHARS: usize = 50;

/// Transient result of one run; feeds logs and notification payloads.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub chat_id: Option<String>,
    pub response_preview: String,
    pub error: Option<String>,
}

struct EngineInner {
    jobs: Arc<dyn JobStore>,
    chats: Arc<dyn ChatStore>,
    users: Arc<dyn UserStore>,
    registry: Arc<ModelRegistry>,
    client: Arc<ChatCompletionClient>,
    notifier: Arc<Notifier>,
    check_interval: Duration,
    gate: Semaphore,
}

/// Process-wide scheduler state: one supervising task, a running flag, and
/// the concurrency gate. Started once; torn down on shutdown.
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
    running: Arc<AtomicBool>,
    tracker: TaskTracker,
}

impl SchedulerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        chats: Arc<dyn ChatStore>,
        users: Arc<dyn UserStore>,
        registry: Arc<ModelRegistry>,
        client: Arc<ChatCompletionClient>,
        notifier: Arc<Notifier>,
        check_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                jobs,
                chats,
                users,
                registry,
                client,
                notifier,
                check_interval,
                gate: Semaphore::new(CONCURRENT_JOB_LIMIT),
            }),
            running: Arc::new(AtomicBool::new(false)),
            tracker: TaskTracker::new(),
        }
    }

    /// Start the supervising loop. Safe to call once per engine.
    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            info!("Scheduler loop started (tick {:?})", inner.check_interval);
            while running.load(Ordering::SeqCst) {
                if let Err(e) = run_tick(&inner).await {
                    error!("Scheduler tick failed: {}", e);
                }
                tokio::time::sleep(inner.check_interval).await;
            }
            info!("Scheduler loop stopped");
        });
        self.tracker.register("scheduler_loop", handle).await;
    }

    /// Stop ticking and cancel the supervising task; gate tasks abort with
    /// it, while in-flight HTTP calls run out their own deadlines.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.tracker.abort_all().await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a single poll/dispatch cycle. Exposed for tests and manual
    /// triggering; `start` drives this on the configured interval.
    pub async fn tick(&self) -> anyhow::Result<()> {
        run_tick(&self.inner).await
    }
}

async fn run_tick(inner: &Arc<EngineInner>) -> anyhow::Result<()> {
    let now = now_ts();
    let due = inner.jobs.due(now).await?;
    if due.is_empty() {
        return Ok(());
    }
    info!("Found {} due scheduled job(s)", due.len());

    let mut batch = JoinSet::new();
    for job in due {
        let inner = inner.clone();
        batch.spawn(async move {
            // Gate closes only on engine teardown.
            let Ok(_permit) = inner.gate.acquire().await else {
                return;
            };
            run_job(&inner, job).await;
        });
    }
    while let Some(joined) = batch.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!("Scheduled job task panicked: {}", e);
            }
        }
    }
    Ok(())
}

/// Execute one job end to end, advance its state, and notify the owner.
/// All failures are absorbed here.
async fn run_job(inner: &EngineInner, job: ScheduledJob) {
    info!("Executing scheduled job '{}' ({})", job.name, job.id);

    let user = match inner.users.get(&job.user_id).await {
        Ok(user) => user,
        Err(e) => {
            warn!("User lookup failed for job {}: {}", job.id, e);
            None
        }
    };

    let result = match &user {
        Some(user) => execute(inner, &job, user).await,
        None => Err(EngineError::MissingUser(job.user_id.clone())),
    };

    let outcome = match result {
        Ok(record) => {
            info!(
                "Scheduled job {} succeeded, chat {}",
                job.id,
                record.chat_id.as_deref().unwrap_or("-")
            );
            record
        }
        Err(e) => {
            error!("Scheduled job {} failed: {}", job.id, e);
            RunOutcome {
                success: false,
                chat_id: None,
                response_preview: String::new(),
                error: Some(e.to_string()),
            }
        }
    };

    advance_job_state(inner, &job, &outcome).await;
    send_notifications(inner, &job, user.as_ref(), &outcome).await;
}

struct PreparedRun {
    model_id: String,
    action_tools: Vec<String>,
    messages: Vec<RequestMessage>,
    initial_tool_ids: Vec<String>,
}

/// Steps 2–4 of the per-job sequence: model resolution, tool filtering, and
/// system-prompt augmentation.
fn prepare_run(inner: &EngineInner, job: &ScheduledJob, user: &User) -> Result<PreparedRun, EngineError> {
    let model_id = inner
        .registry
        .resolve(&job.model_id, &user.settings.models)
        .ok_or_else(|| EngineError::ModelResolution(job.model_id.clone()))?;
    if model_id != job.model_id {
        info!(
            "Model {} not available for job {}, using {}",
            job.model_id, job.id, model_id
        );
    }

    let tool_ids = if job.tool_ids.is_empty() {
        inner.registry.default_tool_ids(&model_id)
    } else {
        job.tool_ids.clone()
    };
    let action_tools: Vec<String> = tool_ids
        .iter()
        .filter(|t| !t.to_lowercase().contains(SELF_SCHEDULING_TOOL_MARKER))
        .cloned()
        .collect();

    let mut messages = Vec::new();
    if let Some(system_prompt) = job.system_prompt.as_deref() {
        messages.push(RequestMessage::system(system_prompt));
    }
    messages.push(RequestMessage::user(job.prompt.clone()));
    augment_system_message(&mut messages, &action_tools);

    Ok(PreparedRun {
        model_id,
        action_tools,
        messages,
        initial_tool_ids: tool_ids,
    })
}

/// Append the automation instruction to the system message, inserting one
/// when the job has none.
fn augment_system_message(messages: &mut Vec<RequestMessage>, action_tools: &[String]) {
    let mut instruction = if action_tools.is_empty() {
        "\n\nIMPORTANT: This is an automated scheduled reminder. Respond helpfully to the user's request.".to_string()
    } else {
        format!(
            "\n\nIMPORTANT: This is an automated scheduled reminder. You have access to these tools: {}. \
             Use them to help the user with their request. For example, if this is about a todo list, \
             use the notes_manager tool to fetch the actual current data.",
            action_tools.join(", ")
        )
    };
    if repair::has_notes_tool(action_tools) {
        instruction.push_str(
            "\nWhen you list or search notes, you MUST follow up by calling get_note with the exact \
             note_id UUID from the results before answering.",
        );
    }

    if let Some(system) = messages.first_mut().filter(|m| m.role == "system") {
        system.content.push_str(&instruction);
    } else {
        messages.insert(
            0,
            RequestMessage::system(format!("You are a helpful assistant.{}", instruction)),
        );
    }
}

/// Steps 2–7: build the request, run the repair pipeline, persist the
/// transcript.
async fn execute(
    inner: &EngineInner,
    job: &ScheduledJob,
    user: &User,
) -> Result<RunOutcome, EngineError> {
    let prepared = prepare_run(inner, job, user)?;

    let initial = CompletionRequest {
        model: prepared.model_id.clone(),
        messages: prepared.messages.clone(),
        stream: false,
        tool_ids: if prepared.initial_tool_ids.is_empty() {
            None
        } else {
            Some(prepared.initial_tool_ids.clone())
        },
        params: repair::params_for_mode(job.function_calling_mode),
    };

    let pipeline = RepairPipeline::new(
        &inner.client,
        &job.user_id,
        &prepared.action_tools,
        job.function_calling_mode,
    );
    let outcome = pipeline.run(initial).await?;

    let chat_id = persist_transcript(
        inner,
        job,
        &prepared.model_id,
        &prepared.action_tools,
        &outcome.content,
        outcome.sources.clone(),
        outcome.note_attachments,
    )
    .await?;

    Ok(RunOutcome {
        success: true,
        chat_id: Some(chat_id),
        response_preview: crate::utils::truncate_chars(&outcome.content, 200, "..."),
        error: None,
    })
}

/// Step 7: create a fresh transcript or extend the linked one; a chat
/// deleted since the last run falls back to a fresh transcript.
async fn persist_transcript(
    inner: &EngineInner,
    job: &ScheduledJob,
    model_id: &str,
    action_tools: &[String],
    content: &str,
    sources: Vec<crate::client::Source>,
    note_attachments: Vec<NoteAttachment>,
) -> Result<String, EngineError> {
    let timestamp = now_ts();
    let chat_messages = vec![
        ChatMessage::user(job.prompt.clone(), timestamp, vec![job.model_id.clone()]),
        ChatMessage::assistant(
            content,
            timestamp,
            vec![job.model_id.clone()],
            sources,
            note_attachments,
        ),
    ];

    if !job.create_new_chat {
        if let Some(chat_id) = job.chat_id.as_deref() {
            if inner
                .chats
                .append_messages(chat_id, chat_messages.clone())
                .await?
            {
                return Ok(chat_id.to_string());
            }
            warn!(
                "Linked chat {} for job {} no longer exists, creating a new one",
                chat_id, job.id
            );
        }
    }

    let title = if job.name.is_empty() {
        let mut t = crate::utils::truncate_chars(&job.prompt, TITLE_FROM_PROMPT_MAX_CHARS, "...");
        if t.is_empty() {
            t = job.id.clone();
        }
        t
    } else {
        job.name.clone()
    };

    let chat = inner
        .chats
        .create(
            &job.user_id,
            &format!("{}{}", SCHEDULED_TITLE_PREFIX, title),
            chat_messages,
            vec![model_id.to_string()],
            action_tools.to_vec(),
        )
        .await?;
    Ok(chat.id)
}

/// Step 8: atomic status advance. Recurring jobs reschedule on success and
/// error alike; one-shots clear their schedule and disable.
async fn advance_job_state(inner: &EngineInner, job: &ScheduledJob, outcome: &RunOutcome) {
    let now = now_ts();
    let next_run_at = if job.run_once {
        None
    } else {
        cron::next_run_timestamp(&job.cron_expression, &job.timezone, now)
    };

    let update = if outcome.success {
        ExecutionUpdate::success(outcome.chat_id.clone(), next_run_at)
    } else {
        ExecutionUpdate::error(
            outcome.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            next_run_at,
        )
    };

    if let Err(e) = inner.jobs.update_execution(&job.id, update).await {
        error!("Failed to update execution state for job {}: {}", job.id, e);
    }
    if job.run_once {
        if let Err(e) = inner.jobs.set_enabled(&job.id, false).await {
            error!("Failed to disable one-shot job {}: {}", job.id, e);
        } else {
            info!("One-shot job {} completed and disabled", job.id);
        }
    }
}

/// Step 9: build the payload once and fan it out. Failures are swallowed by
/// the notifier.
async fn send_notifications(
    inner: &EngineInner,
    job: &ScheduledJob,
    user: Option<&User>,
    outcome: &RunOutcome,
) {
    // A missing user record still gets the in-app attempt (the session pool
    // keys on the ID alone); push settings default to disabled.
    let stub;
    let user = match user {
        Some(user) => user,
        None => {
            stub = User {
                id: job.user_id.clone(),
                name: String::new(),
                settings: Default::default(),
            };
            &stub
        }
    };

    let mut notification = if outcome.success {
        let mut message = format!("'{}' ran successfully", job.name);
        if job.run_once {
            message.push_str(" (one-off, now disabled)");
        }
        Notification::scheduled_prompt("success", "Scheduled prompt completed", &message, &job.id)
    } else {
        let error = outcome.error.as_deref().unwrap_or("unknown error");
        let message = format!(
            "'{}' failed: {}",
            job.name,
            crate::utils::truncate_chars(error, NOTIFY_ERROR_MAX_CHARS, "...")
        );
        Notification::scheduled_prompt("error", "Scheduled prompt failed", &message, &job.id)
    };

    if let Some(chat_id) = outcome.chat_id.as_deref() {
        notification.chat_id = Some(chat_id.to_string());
        notification.chat_url = inner.notifier.chat_url(chat_id);
    }
    notification.scheduled_prompts_url = inner.notifier.scheduled_prompts_url();

    inner.notifier.notify(user, &notification).await;
}

#[cfg(test)]
mod tests;
