//! Multi-pass repair of model output.
//!
//! The backend sometimes returns responses that are not a usable final
//! answer: tool-call objects with no prose, raw tool-invocation JSON as
//! assistant text, leaked tool-routing chatter, or note listings whose
//! content was never fetched. Each repair is a fresh model turn with a
//! deterministically constructed context; nothing is fabricated locally.

pub mod notes;
pub mod sanitize;

use crate::client::{
    ChatCompletionClient, CompletionParams, CompletionRequest, RequestMessage, Source,
};
use crate::errors::EngineError;
use crate::store::chats::NoteAttachment;
use crate::store::jobs::FunctionCallingMode;
use serde_json::Value;
use tracing::debug;

pub use notes::{
    analyze_sources, extract_note_attachments, extract_uuids, has_notes_tool, source_name_matches,
};
pub use sanitize::{mentions_any_tool, sanitize_tool_chatter};

/// Hard cap on follow-up completions per run, across all stages.
pub const MAX_FOLLOW_UP_CALLS: usize = 4;
/// The notes follow-up loop alone is bounded tighter.
pub const MAX_NOTES_FOLLOW_UPS: usize = 2;
const MAX_HINTED_NOTE_IDS: usize = 5;

/// Substituted when every stage still leaves the assistant text empty.
pub const EMPTY_TOOL_CALL_FALLBACK: &str =
    "Scheduled prompt completed, but the model returned only tool calls and no final text.";

/// Continuation instruction after a raw tool-JSON leak.
pub const TOOL_JSON_CONTINUATION: &str = "Execute the requested tool call(s) above, then answer the original user request in plain language. Do not return tool-call JSON.";

/// Markers that flag leaked tool-routing chatter. The bare `json` entry also
/// matches benign mentions; the additional tool-mention requirement is what
/// keeps the detector from firing on most plain answers.
const CHATTER_MARKERS: [&str; 7] = [
    "to=",
    "tool call",
    "tool_call",
    "arguments",
    "need proper json",
    "do not output json",
    "json",
];

/// Discriminated shape of a model response, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    EmptyWithToolCalls,
    RawToolJson,
    MalformedChatter,
    PlainText,
}

pub fn classify(content: &str, has_tool_calls: bool, action_tools: &[String]) -> ResponseKind {
    if content.is_empty() && has_tool_calls {
        ResponseKind::EmptyWithToolCalls
    } else if is_raw_tool_json(content) {
        ResponseKind::RawToolJson
    } else if is_malformed_chatter(content, action_tools) {
        ResponseKind::MalformedChatter
    } else {
        ResponseKind::PlainText
    }
}

/// Assistant text that is nothing but a tool-invocation object.
pub fn is_raw_tool_json(content: &str) -> bool {
    match serde_json::from_str::<Value>(content.trim()) {
        Ok(Value::Object(map)) => map.contains_key("tool") || map.contains_key("tool_calls"),
        _ => false,
    }
}

/// Tool-routing chatter leaked into prose: a chatter marker plus a mention of
/// at least one configured tool.
pub fn is_malformed_chatter(content: &str, action_tools: &[String]) -> bool {
    let lower = content.to_lowercase();
    CHATTER_MARKERS.iter().any(|m| lower.contains(m))
        && mentions_any_tool(content, action_tools)
}

/// `params.function_calling` for the initial request: explicit for `default`
/// and `native`, omitted entirely for `auto`.
pub fn params_for_mode(mode: FunctionCallingMode) -> Option<CompletionParams> {
    match mode {
        FunctionCallingMode::Default => Some(CompletionParams::default_mode()),
        FunctionCallingMode::Native => Some(CompletionParams::native_mode()),
        FunctionCallingMode::Auto => None,
    }
}

/// The follow-up turn forcing `get_note` after an unfetched listing.
pub fn notes_follow_up_message(list_ids: &[String]) -> String {
    let ids = list_ids
        .iter()
        .take(MAX_HINTED_NOTE_IDS)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "The notes listed above were never fetched. You MUST call get_note with parameter note_id set to one of these UUIDs: {}. \
         Use the exact UUID from the ID column, not the note title. \
         Do not call list_my_notes or search_notes again unless every listed UUID fails.",
        ids
    )
}

/// Result of a settled pipeline: the final assistant text, the sources of
/// the response it came from, and any fetched notes.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub content: String,
    pub sources: Vec<Source>,
    pub note_attachments: Vec<NoteAttachment>,
    pub follow_up_calls: usize,
}

pub struct RepairPipeline<'a> {
    client: &'a ChatCompletionClient,
    user_id: &'a str,
    action_tools: &'a [String],
    mode: FunctionCallingMode,
}

impl<'a> RepairPipeline<'a> {
    pub fn new(
        client: &'a ChatCompletionClient,
        user_id: &'a str,
        action_tools: &'a [String],
        mode: FunctionCallingMode,
    ) -> Self {
        Self {
            client,
            user_id,
            action_tools,
            mode,
        }
    }

    /// Continuation/follow-up request: same model, forced `default`
    /// function calling, action tools only.
    fn forced_request(
        &self,
        initial: &CompletionRequest,
        messages: Vec<RequestMessage>,
    ) -> CompletionRequest {
        CompletionRequest {
            model: initial.model.clone(),
            messages,
            stream: false,
            tool_ids: Some(self.action_tools.to_vec()),
            params: Some(CompletionParams::default_mode()),
        }
    }

    fn chatter_continuation(&self, sources: &[Source]) -> String {
        let mut text = String::from(
            "Your previous reply contained malformed tool-call chatter instead of an answer. \
             Execute the intended tool call(s) now, then answer the original request in plain language. \
             Do not include tool-call syntax, commentary, or JSON in your reply.",
        );
        if has_notes_tool(self.action_tools) {
            let listed = analyze_sources(sources).list_ids;
            if !listed.is_empty() {
                let ids = listed
                    .iter()
                    .take(MAX_HINTED_NOTE_IDS)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                text.push_str(&format!(
                    "\nThe earlier tool results listed these note IDs: {}. \
                     Use the {} tool with one of these exact UUIDs to fetch note content.",
                    ids,
                    notes::GET_NOTE_TOOL
                ));
            }
        }
        text
    }

    /// Run the initial call plus bounded repair turns; settle on a usable
    /// final answer. Each stage consumes the current [`ResponseKind`] tag,
    /// recomputed whenever the content changes.
    pub async fn run(&self, initial: CompletionRequest) -> Result<RepairOutcome, EngineError> {
        let mut budget = MAX_FOLLOW_UP_CALLS;
        let mut calls = 0usize;

        let mut response = self.client.complete(self.user_id, &initial).await?;
        let mut content = response.assistant_content();
        let mut kind = classify(&content, response.has_tool_calls(), self.action_tools);

        // Empty final with pending tool calls: retry once with explicit
        // permission to synthesize text after tool execution.
        if kind == ResponseKind::EmptyWithToolCalls
            && self.mode != FunctionCallingMode::Default
            && budget > 0
        {
            debug!("Empty final with tool calls; retrying with function_calling=default");
            let mut retry = initial.clone();
            retry.params = Some(CompletionParams::default_mode());
            response = self.client.complete(self.user_id, &retry).await?;
            content = response.assistant_content();
            budget -= 1;
            calls += 1;
        }
        if content.is_empty() {
            content = EMPTY_TOOL_CALL_FALLBACK.to_string();
        }
        kind = classify(&content, response.has_tool_calls(), self.action_tools);

        // Raw tool-invocation JSON leaked as the answer.
        if kind == ResponseKind::RawToolJson && !self.action_tools.is_empty() && budget > 0 {
            debug!("Assistant returned raw tool JSON; issuing continuation turn");
            let mut messages = initial.messages.clone();
            messages.push(RequestMessage::assistant(content.clone()));
            messages.push(RequestMessage::user(TOOL_JSON_CONTINUATION));
            let continuation = self
                .client
                .complete(self.user_id, &self.forced_request(&initial, messages))
                .await?;
            budget -= 1;
            calls += 1;
            let continued = continuation.assistant_content();
            if !continued.is_empty() {
                response = continuation;
                content = continued;
            }
            kind = classify(&content, response.has_tool_calls(), self.action_tools);
        }

        // Malformed tool chatter: force a clean turn, then strip whatever
        // chatter survived.
        if kind == ResponseKind::MalformedChatter {
            if budget > 0 {
                debug!("Assistant produced tool chatter; issuing forced continuation");
                let mut messages = initial.messages.clone();
                messages.push(RequestMessage::user(
                    self.chatter_continuation(&response.sources),
                ));
                let continuation = self
                    .client
                    .complete(self.user_id, &self.forced_request(&initial, messages))
                    .await?;
                budget -= 1;
                calls += 1;
                let continued = continuation.assistant_content();
                if !continued.is_empty() {
                    response = continuation;
                    content = continued;
                }
            }
            content = sanitize_tool_chatter(&content, self.action_tools);
        }

        // Notes listed but never fetched: force get_note, at most twice.
        if has_notes_tool(self.action_tools) {
            for _ in 0..MAX_NOTES_FOLLOW_UPS {
                if budget == 0 {
                    break;
                }
                let analysis = analyze_sources(&response.sources);
                if !analysis.needs_follow_up() {
                    break;
                }
                debug!(
                    "Notes listed without a successful fetch ({} candidate ids); forcing get_note",
                    analysis.list_ids.len()
                );
                let mut messages = initial.messages.clone();
                messages.push(RequestMessage::assistant(content.clone()));
                messages.push(RequestMessage::user(notes_follow_up_message(
                    &analysis.list_ids,
                )));
                let follow = self
                    .client
                    .complete(self.user_id, &self.forced_request(&initial, messages))
                    .await?;
                budget -= 1;
                calls += 1;
                let followed = follow.assistant_content();
                if followed.is_empty() {
                    break;
                }
                response = follow;
                content = followed;
            }
        }

        let note_attachments = extract_note_attachments(&response.sources);
        Ok(RepairOutcome {
            content,
            sources: response.sources,
            note_attachments,
            follow_up_calls: calls,
        })
    }
}
