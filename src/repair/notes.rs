//! Notes-tool source analysis: detecting list/search runs that never fetched
//! note content, and extracting fetched notes as attachments.

use crate::client::Source;
use crate::store::chats::NoteAttachment;
use regex::Regex;
use std::sync::LazyLock;

pub const LIST_NOTES_TOOL: &str = "list_my_notes";
pub const SEARCH_NOTES_TOOL: &str = "search_notes";
pub const GET_NOTE_TOOL: &str = "get_note";

/// Canonical 8-4-4-4-12 hex UUID shape.
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("static regex")
});

/// Match a tool source name either bare (`get_note`) or namespaced
/// (`notes_manager/get_note`), case-insensitive.
pub fn source_name_matches(name: &str, target: &str) -> bool {
    let name = name.to_lowercase();
    let target = target.to_lowercase();
    name == target || name.ends_with(&format!("/{}", target))
}

/// Whether any configured tool is a notes manager.
pub fn has_notes_tool(tools: &[String]) -> bool {
    tools.iter().any(|t| {
        let lower = t.to_lowercase();
        lower.contains("notes_manager") || lower.contains("note_manager")
    })
}

/// UUID-shaped substrings in first-seen order, deduplicated
/// (case-insensitive, normalized to lowercase).
pub fn extract_uuids(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in UUID_RE.find_iter(text) {
        let id = m.as_str().to_lowercase();
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// What the current sources say about notes-tool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotesAnalysis {
    pub has_list: bool,
    pub has_get: bool,
    /// UUIDs surfaced by list/search documents, first-seen order.
    pub list_ids: Vec<String>,
    /// note_id parameters actually passed to get_note.
    pub used_get_ids: Vec<String>,
    /// A get_note document contained "note not found".
    pub has_not_found: bool,
}

impl NotesAnalysis {
    /// A follow-up turn is needed when notes were listed but content was
    /// never successfully fetched with one of the listed IDs.
    pub fn needs_follow_up(&self) -> bool {
        if !self.has_list || self.list_ids.is_empty() {
            return false;
        }
        let used_expected = self
            .used_get_ids
            .iter()
            .any(|id| self.list_ids.contains(&id.to_lowercase()));
        !self.has_get || self.has_not_found || !used_expected
    }
}

pub fn analyze_sources(sources: &[Source]) -> NotesAnalysis {
    let mut analysis = NotesAnalysis::default();

    for source in sources {
        let name = &source.source.name;
        if source_name_matches(name, LIST_NOTES_TOOL) || source_name_matches(name, SEARCH_NOTES_TOOL)
        {
            analysis.has_list = true;
            for doc in &source.document {
                for id in extract_uuids(doc) {
                    if !analysis.list_ids.contains(&id) {
                        analysis.list_ids.push(id);
                    }
                }
            }
        } else if source_name_matches(name, GET_NOTE_TOOL) {
            analysis.has_get = true;
            for meta in &source.metadata {
                if let Some(note_id) = meta.parameters.as_ref().and_then(|p| p.note_id.clone()) {
                    analysis.used_get_ids.push(note_id);
                }
            }
            if source
                .document
                .iter()
                .any(|doc| doc.to_lowercase().contains("note not found"))
            {
                analysis.has_not_found = true;
            }
        }
    }

    analysis
}

/// Pair every non-empty `get_note` document with the note_id from the
/// metadata entry at the same index.
pub fn extract_note_attachments(sources: &[Source]) -> Vec<NoteAttachment> {
    let mut attachments = Vec::new();
    for source in sources {
        if !source_name_matches(&source.source.name, GET_NOTE_TOOL) {
            continue;
        }
        for (idx, doc) in source.document.iter().enumerate() {
            let trimmed = doc.trim();
            if trimmed.is_empty() {
                continue;
            }
            let note_id = source
                .metadata
                .get(idx)
                .and_then(|m| m.parameters.as_ref())
                .and_then(|p| p.note_id.clone());
            attachments.push(NoteAttachment {
                note_id,
                content: trimmed.to_string(),
            });
        }
    }
    attachments
}
