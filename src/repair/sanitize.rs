//! Cleanup of "tool chatter": leaked tool-routing syntax such as
//! `to=notes_manager commentary json` left inside assistant text.

use regex::Regex;
use std::sync::LazyLock;

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("static regex"));

/// Longest token that can ride along between two chatter units (stray
/// fragments like `json` or truncated argument text).
const MAX_STRAY_TOKEN_LEN: usize = 12;

/// True when the content mentions any configured tool ID, case-insensitive.
pub fn mentions_any_tool(content: &str, tools: &[String]) -> bool {
    let lower = content.to_lowercase();
    tools
        .iter()
        .any(|tool| !tool.is_empty() && lower.contains(&tool.to_lowercase()))
}

fn looks_like_chatter(block: &str, tools: &[String]) -> bool {
    let lower = block.to_lowercase();
    (lower.contains("to=") && mentions_any_tool(block, tools))
        || lower.contains("need proper json")
        || lower.contains("commentary")
}

/// Drop runs of two or more `to=<tool>[ commentary][ <short-token>]` units,
/// keeping everything else and normalizing whitespace.
fn collapse_chatter_runs(content: &str) -> String {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    let mut out: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut i = 0;

    while i < tokens.len() {
        if tokens[i].to_lowercase().starts_with("to=") {
            let mut j = i;
            let mut units = 0;
            while j < tokens.len() && tokens[j].to_lowercase().starts_with("to=") {
                units += 1;
                j += 1;
                if j < tokens.len() && tokens[j].eq_ignore_ascii_case("commentary") {
                    j += 1;
                }
                // A short stray token is chatter only when sandwiched
                // before another unit.
                if j + 1 < tokens.len()
                    && tokens[j].len() <= MAX_STRAY_TOKEN_LEN
                    && !tokens[j].to_lowercase().starts_with("to=")
                    && tokens[j + 1].to_lowercase().starts_with("to=")
                {
                    j += 1;
                }
            }
            if units >= 2 {
                i = j;
                continue;
            }
        }
        out.push(tokens[i]);
        i += 1;
    }

    out.join(" ")
}

/// Strip residual tool chatter from `content`.
///
/// When blank-line-separated blocks exist, the last block that is not itself
/// chatter wins. Otherwise chatter runs are collapsed in place. Returns the
/// original content when cleaning would leave nothing. Idempotent.
pub fn sanitize_tool_chatter(content: &str, action_tools: &[String]) -> String {
    let lower = content.to_lowercase();
    if !lower.contains("to=") || !mentions_any_tool(content, action_tools) {
        return content.to_string();
    }

    let blocks: Vec<&str> = BLANK_LINE
        .split(content)
        .filter(|b| !b.trim().is_empty())
        .collect();
    if blocks.len() > 1 {
        if let Some(clean) = blocks
            .iter()
            .rev()
            .find(|b| !looks_like_chatter(b, action_tools))
        {
            return clean.trim().to_string();
        }
    }

    let collapsed = collapse_chatter_runs(content);
    let cleaned = collapsed.trim().to_string();
    if cleaned.is_empty() {
        content.to_string()
    } else {
        cleaned
    }
}
