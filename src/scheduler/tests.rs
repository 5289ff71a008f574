use super::*;
use crate::client::TokenMinter;
use crate::models::{ModelEntry, ModelInfo, ModelMeta};
use crate::notify::{SessionPool, SocketBroadcaster};
use crate::store::chats::FileChatStore;
use crate::store::jobs::{FileJobStore, FunctionCallingMode, JobPatch, RunStatus};
use crate::store::users::{FileUserStore, UserSettings};
use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestMinter;

impl TokenMinter for TestMinter {
    fn mint(&self, _user_id: &str, _ttl: Duration) -> String {
        "test-token".to_string()
    }
}

#[derive(Default)]
struct RecordingBroadcaster {
    emitted: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl SocketBroadcaster for RecordingBroadcaster {
    async fn emit(&self, _event: &str, payload: &Notification, session_id: &str) -> Result<()> {
        self.emitted.lock().unwrap().push((
            session_id.to_string(),
            payload.status.clone(),
            payload.message.clone(),
        ));
        Ok(())
    }
}

struct Harness {
    engine: SchedulerEngine,
    jobs: Arc<FileJobStore>,
    chats: Arc<FileChatStore>,
    pool: SessionPool,
    broadcaster: Arc<RecordingBroadcaster>,
    _tmp: TempDir,
}

fn registry_with(models: &[(&str, &[&str])]) -> ModelRegistry {
    let mut map = IndexMap::new();
    for (id, tools) in models {
        map.insert(
            (*id).to_string(),
            ModelEntry {
                info: ModelInfo {
                    meta: ModelMeta {
                        tool_ids: tools.iter().map(|t| (*t).to_string()).collect(),
                    },
                },
            },
        );
    }
    ModelRegistry::new(map)
}

fn default_user() -> User {
    User {
        id: "u1".to_string(),
        name: "Ada".to_string(),
        settings: UserSettings::default(),
    }
}

async fn harness(server: &MockServer, users: Vec<User>, registry: ModelRegistry) -> Harness {
    let tmp = TempDir::new().unwrap();
    let jobs = Arc::new(FileJobStore::open(tmp.path().join("jobs.json")).unwrap());
    let chats = Arc::new(FileChatStore::open(tmp.path().join("chats.json")).unwrap());
    let users = Arc::new(FileUserStore::from_users(users));
    let client = Arc::new(ChatCompletionClient::new(
        server.uri(),
        Arc::new(TestMinter),
    ));
    let pool = SessionPool::new();
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let notifier = Arc::new(Notifier::new(pool.clone(), broadcaster.clone(), None));

    let engine = SchedulerEngine::new(
        jobs.clone(),
        chats.clone(),
        users,
        Arc::new(registry),
        client,
        notifier,
        Duration::from_secs(60),
    );

    Harness {
        engine,
        jobs,
        chats,
        pool,
        broadcaster,
        _tmp: tmp,
    }
}

fn due_job(id: &str) -> ScheduledJob {
    let now = now_ts();
    ScheduledJob {
        id: id.to_string(),
        user_id: "u1".to_string(),
        name: "Morning digest".to_string(),
        cron_expression: "*/5 * * * *".to_string(),
        timezone: "UTC".to_string(),
        enabled: true,
        model_id: "gpt-x".to_string(),
        system_prompt: None,
        prompt: "hi".to_string(),
        chat_id: None,
        create_new_chat: true,
        run_once: false,
        tool_ids: vec![],
        function_calling_mode: FunctionCallingMode::Default,
        last_run_at: None,
        next_run_at: Some(now - 60),
        last_status: None,
        last_error: None,
        run_count: 0,
        created_at: now - 3600,
        updated_at: now - 3600,
    }
}

async fn mount_reply(server: &MockServer, content: &str) {
    Mock::given(method("POST"))
        .and(path("/api/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_happy_recurring_run() {
    let server = MockServer::start().await;
    mount_reply(&server, "hello").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    h.pool.register("u1", "s1").await;
    h.pool.register("u1", "s2").await;
    h.jobs.insert(due_job("j1")).await.unwrap();

    let before = now_ts();
    h.engine.tick().await.unwrap();

    let job = h.jobs.get("j1").await.unwrap().unwrap();
    assert_eq!(job.last_status, Some(RunStatus::Success));
    assert_eq!(job.run_count, 1);
    assert!(job.enabled);
    let next = job.next_run_at.unwrap();
    assert!(next > before);
    // UTC 5-minute boundaries are epoch-aligned.
    assert_eq!(next % 300, 0);

    let chat = h.chats.get(job.chat_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(chat.title, "[Scheduled] Morning digest");
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[0].role, "user");
    assert_eq!(chat.messages[0].content, "hi");
    assert_eq!(chat.messages[1].role, "assistant");
    assert_eq!(chat.messages[1].content, "hello");
    assert_eq!(chat.messages[0].timestamp, chat.messages[1].timestamp);

    // One notification per open session.
    let emitted = h.broadcaster.emitted.lock().unwrap();
    assert_eq!(emitted.len(), 2);
    assert!(emitted.iter().all(|(_, status, _)| status == "success"));
    assert!(emitted
        .iter()
        .all(|(_, _, msg)| msg == "'Morning digest' ran successfully"));
}

#[tokio::test]
async fn test_one_shot_error_disables_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend exploded"))
        .mount(&server)
        .await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    h.pool.register("u1", "s1").await;
    let mut job = due_job("once");
    job.run_once = true;
    h.jobs.insert(job).await.unwrap();

    h.engine.tick().await.unwrap();

    let job = h.jobs.get("once").await.unwrap().unwrap();
    assert!(!job.enabled);
    assert_eq!(job.next_run_at, None);
    assert_eq!(job.last_status, Some(RunStatus::Error));
    assert!(job.last_error.as_deref().unwrap().contains("backend exploded"));
    assert_eq!(job.chat_id, None);

    let emitted = h.broadcaster.emitted.lock().unwrap();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].1, "error");
    assert!(emitted[0].2.starts_with("'Morning digest' failed:"));
}

#[tokio::test]
async fn test_one_shot_success_disables_and_clears_schedule() {
    let server = MockServer::start().await;
    mount_reply(&server, "done").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    h.pool.register("u1", "s1").await;
    let mut job = due_job("once");
    job.run_once = true;
    h.jobs.insert(job).await.unwrap();

    h.engine.tick().await.unwrap();

    let job = h.jobs.get("once").await.unwrap().unwrap();
    assert!(!job.enabled);
    assert_eq!(job.next_run_at, None);
    assert_eq!(job.last_status, Some(RunStatus::Success));

    let emitted = h.broadcaster.emitted.lock().unwrap();
    assert_eq!(
        emitted[0].2,
        "'Morning digest' ran successfully (one-off, now disabled)"
    );
}

#[tokio::test]
async fn test_recurring_error_advances_schedule() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    h.jobs.insert(due_job("j1")).await.unwrap();

    let before = now_ts();
    h.engine.tick().await.unwrap();

    let job = h.jobs.get("j1").await.unwrap().unwrap();
    assert!(job.enabled);
    assert_eq!(job.last_status, Some(RunStatus::Error));
    assert!(job.next_run_at.unwrap() > before);
}

#[tokio::test]
async fn test_missing_user_marks_error() {
    let server = MockServer::start().await;
    mount_reply(&server, "never called").await;

    let h = harness(&server, vec![], registry_with(&[("gpt-x", &[])])).await;
    h.jobs.insert(due_job("j1")).await.unwrap();

    h.engine.tick().await.unwrap();

    let job = h.jobs.get("j1").await.unwrap().unwrap();
    assert_eq!(job.last_status, Some(RunStatus::Error));
    assert!(job.last_error.as_deref().unwrap().contains("not found"));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_model_fallback_to_user_default() {
    let server = MockServer::start().await;
    mount_reply(&server, "ok").await;

    let mut user = default_user();
    user.settings.models = vec!["fallback-model".to_string()];
    let h = harness(
        &server,
        vec![user],
        registry_with(&[("other", &[]), ("fallback-model", &[])]),
    )
    .await;
    let mut job = due_job("j1");
    job.model_id = "ghost-model".to_string();
    h.jobs.insert(job).await.unwrap();

    h.engine.tick().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "fallback-model");

    // The chat records the resolved model; messages keep the job's model id.
    let job = h.jobs.get("j1").await.unwrap().unwrap();
    let chat = h.chats.get(job.chat_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(chat.models, vec!["fallback-model"]);
    assert_eq!(chat.messages[0].models, vec!["ghost-model"]);
}

#[tokio::test]
async fn test_unresolvable_model_is_job_error() {
    let server = MockServer::start().await;
    mount_reply(&server, "never").await;

    let h = harness(&server, vec![default_user()], ModelRegistry::default()).await;
    h.jobs.insert(due_job("j1")).await.unwrap();

    h.engine.tick().await.unwrap();

    let job = h.jobs.get("j1").await.unwrap().unwrap();
    assert_eq!(job.last_status, Some(RunStatus::Error));
    assert!(job.last_error.as_deref().unwrap().contains("gpt-x"));
}

#[tokio::test]
async fn test_self_scheduling_tool_excluded_from_action_tools() {
    let server = MockServer::start().await;
    mount_reply(&server, "done").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    let mut job = due_job("j1");
    job.tool_ids = vec!["notes_manager".to_string(), "Prompt_Scheduler".to_string()];
    h.jobs.insert(job).await.unwrap();

    h.engine.tick().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    // The raw request keeps the configured tools; the automation instruction
    // and the persisted chat only carry action tools.
    assert_eq!(
        body["tool_ids"],
        json!(["notes_manager", "Prompt_Scheduler"])
    );
    let system = body["messages"][0]["content"].as_str().unwrap();
    assert!(system.contains("notes_manager"));
    assert!(!system.contains("Prompt_Scheduler"));

    let job = h.jobs.get("j1").await.unwrap().unwrap();
    let chat = h.chats.get(job.chat_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(chat.tool_ids, vec!["notes_manager"]);
}

#[tokio::test]
async fn test_tools_inherited_from_model_registry() {
    let server = MockServer::start().await;
    mount_reply(&server, "done").await;

    let h = harness(
        &server,
        vec![default_user()],
        registry_with(&[("gpt-x", &["web_search"])]),
    )
    .await;
    h.jobs.insert(due_job("j1")).await.unwrap();

    h.engine.tick().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["tool_ids"], json!(["web_search"]));
}

#[tokio::test]
async fn test_append_to_linked_chat() {
    let server = MockServer::start().await;
    mount_reply(&server, "appended answer").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    let existing = h
        .chats
        .create("u1", "[Scheduled] Morning digest", vec![], vec![], vec![])
        .await
        .unwrap();
    let mut job = due_job("j1");
    job.create_new_chat = false;
    job.chat_id = Some(existing.id.clone());
    h.jobs.insert(job).await.unwrap();

    h.engine.tick().await.unwrap();

    let chat = h.chats.get(&existing.id).await.unwrap().unwrap();
    assert_eq!(chat.messages.len(), 2);
    let job = h.jobs.get("j1").await.unwrap().unwrap();
    assert_eq!(job.chat_id.as_deref(), Some(existing.id.as_str()));
}

#[tokio::test]
async fn test_deleted_linked_chat_falls_back_to_new() {
    let server = MockServer::start().await;
    mount_reply(&server, "fresh answer").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    let mut job = due_job("j1");
    job.create_new_chat = false;
    job.chat_id = Some("deleted-elsewhere".to_string());
    h.jobs.insert(job).await.unwrap();

    h.engine.tick().await.unwrap();

    let job = h.jobs.get("j1").await.unwrap().unwrap();
    let new_chat_id = job.chat_id.as_deref().unwrap();
    assert_ne!(new_chat_id, "deleted-elsewhere");
    let chat = h.chats.get(new_chat_id).await.unwrap().unwrap();
    assert_eq!(chat.title, "[Scheduled] Morning digest");
    assert_eq!(chat.messages.len(), 2);
}

#[tokio::test]
async fn test_untitled_job_titles_chat_from_prompt() {
    let server = MockServer::start().await;
    mount_reply(&server, "ok").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    let mut job = due_job("j1");
    job.name = String::new();
    job.prompt = "p".repeat(80);
    h.jobs.insert(job).await.unwrap();

    h.engine.tick().await.unwrap();

    let job = h.jobs.get("j1").await.unwrap().unwrap();
    let chat = h.chats.get(job.chat_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(chat.title, format!("[Scheduled] {}...", "p".repeat(50)));
}

#[tokio::test]
async fn test_batch_of_twenty_jobs_all_complete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "done"}}]
                }))
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    for i in 0..20 {
        h.jobs.insert(due_job(&format!("j{}", i))).await.unwrap();
    }

    h.engine.tick().await.unwrap();

    for i in 0..20 {
        let job = h.jobs.get(&format!("j{}", i)).await.unwrap().unwrap();
        assert_eq!(job.run_count, 1, "job j{} should have run once", i);
        assert_eq!(job.last_status, Some(RunStatus::Success));
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_run_count_accumulates_across_ticks() {
    let server = MockServer::start().await;
    mount_reply(&server, "ok").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    h.jobs.insert(due_job("j1")).await.unwrap();

    h.engine.tick().await.unwrap();
    assert_eq!(h.jobs.get("j1").await.unwrap().unwrap().run_count, 1);

    // Second tick without rescheduling: the job is in the future, no run.
    h.engine.tick().await.unwrap();
    assert_eq!(h.jobs.get("j1").await.unwrap().unwrap().run_count, 1);

    // Force it due again.
    h.jobs
        .update(
            "j1",
            JobPatch {
                next_run_at: Some(now_ts() - 30),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.engine.tick().await.unwrap();
    assert_eq!(h.jobs.get("j1").await.unwrap().unwrap().run_count, 2);
}

#[tokio::test]
async fn test_start_and_stop_lifecycle() {
    let server = MockServer::start().await;
    mount_reply(&server, "ok").await;

    let h = harness(&server, vec![default_user()], registry_with(&[("gpt-x", &[])])).await;
    h.engine.start().await;
    assert!(h.engine.is_running());
    h.engine.stop().await;
    assert!(!h.engine.is_running());
}

#[test]
fn test_augment_inserts_system_message_when_absent() {
    let mut messages = vec![RequestMessage::user("do the thing")];
    augment_system_message(&mut messages, &[]);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "system");
    assert!(messages[0].content.starts_with("You are a helpful assistant."));
    assert!(messages[0].content.contains("automated scheduled reminder"));
}

#[test]
fn test_augment_appends_to_existing_system_message() {
    let mut messages = vec![
        RequestMessage::system("Be terse."),
        RequestMessage::user("do the thing"),
    ];
    augment_system_message(&mut messages, &["web_search".to_string()]);
    assert_eq!(messages.len(), 2);
    assert!(messages[0].content.starts_with("Be terse."));
    assert!(messages[0].content.contains("web_search"));
}

#[test]
fn test_augment_adds_notes_directive() {
    let mut messages = vec![RequestMessage::user("check notes")];
    augment_system_message(&mut messages, &["notes_manager".to_string()]);
    assert!(messages[0].content.contains("get_note"));
    assert!(messages[0].content.contains("note_id"));
}
