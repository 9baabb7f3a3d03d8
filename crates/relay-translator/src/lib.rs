//! Relay Translator - OpenAI conversation to engine prompt
//!
//! The engine consumes a single prompt string, not a role-tagged message
//! list, so the gateway flattens the conversation here. Slash-commands must
//! pass through verbatim: prefixing them breaks command recognition in the
//! engine, which then misreads the command as plain text.

use once_cell::sync::Lazy;
use regex::Regex;
use relay_core::openai::{ChatMessage, Role};
use relay_core::GatewayError;

#[cfg(test)]
mod tests;

/// Build the engine prompt from an OpenAI message list.
///
/// Returns `(prompt, system_prompt)`. The first system message wins; any
/// later system messages are ignored. User turns are prefixed `Human: `
/// unless they are slash-commands, assistant turns `Assistant: `, and a
/// synthetic `Human: Please continue.` is appended when the conversation
/// does not end on a user turn.
pub fn build_prompt(
    messages: &[ChatMessage],
) -> Result<(String, Option<String>), GatewayError> {
    if messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages cannot be empty".to_string(),
        ));
    }

    let mut system_prompt: Option<String> = None;
    let mut parts: Vec<String> = Vec::new();
    let mut last_role = None;

    for msg in messages {
        match msg.role {
            Role::System => {
                // First-wins: duplicate system messages are dropped.
                if system_prompt.is_none() {
                    system_prompt = Some(msg.content.clone());
                }
            }
            Role::User => {
                if msg.content.trim_start().starts_with('/') {
                    parts.push(msg.content.clone());
                } else {
                    parts.push(format!("Human: {}", msg.content));
                }
                last_role = Some(Role::User);
            }
            Role::Assistant => {
                parts.push(format!("Assistant: {}", msg.content));
                last_role = Some(Role::Assistant);
            }
        }
    }

    if last_role != Some(Role::User) {
        parts.push("Human: Please continue.".to_string());
    }

    Ok((parts.join("\n\n"), system_prompt))
}

/// True when the prompt is a deep-research slash-command.
pub fn is_research_command(prompt: &str) -> bool {
    let trimmed = prompt.trim_start();
    trimmed.starts_with("/sc:research") || trimmed.starts_with("/research")
}

static RESEARCH_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)/(?:sc:)?research\s+(?:--depth\s+\w+\s+)?"?(.+?)"?\s*$"#)
        .expect("static regex")
});

/// Extract the research query from a `/sc:research` or `/research` command.
pub fn extract_research_query(prompt: &str) -> String {
    if let Some(caps) = RESEARCH_QUERY.captures(prompt) {
        if let Some(m) = caps.get(1) {
            return m.as_str().trim().to_string();
        }
    }
    prompt
        .replace("/sc:research", "")
        .replace("/research", "")
        .trim()
        .to_string()
}

static THINKING_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<thinking>.*?</thinking>").expect("static regex"));

/// Strip internal thinking blocks from engine text before it reaches the
/// client. Text with no markers passes through untouched.
pub fn filter_content(text: &str) -> String {
    let filtered = THINKING_BLOCK.replace_all(text, "");
    filtered.trim_matches(|c| c == '\n').to_string()
}

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

/// Streaming counterpart of [`filter_content`]: suppresses thinking blocks
/// even when the tags or their contents are split across content deltas.
///
/// Text between an opening tag and its close is withheld; an opening tag
/// that is never closed suppresses everything after it. A delta ending in
/// what could be the start of a tag is held back until the next delta
/// disambiguates it. Passed-through text is otherwise unmodified.
#[derive(Debug, Default)]
pub struct ThinkingFilter {
    inside: bool,
    carry: String,
}

impl ThinkingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta, returning the client-visible portion.
    pub fn push(&mut self, delta: &str) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(delta);

        let mut out = String::new();
        loop {
            if self.inside {
                match buf.find(THINKING_CLOSE) {
                    Some(idx) => {
                        buf.drain(..idx + THINKING_CLOSE.len());
                        self.inside = false;
                    }
                    None => {
                        // Suppressed, but a trailing partial close tag must
                        // survive to the next delta.
                        let keep = partial_tag_suffix(&buf, THINKING_CLOSE);
                        self.carry = buf[buf.len() - keep..].to_string();
                        return out;
                    }
                }
            } else {
                match buf.find(THINKING_OPEN) {
                    Some(idx) => {
                        out.push_str(&buf[..idx]);
                        buf.drain(..idx + THINKING_OPEN.len());
                        self.inside = true;
                    }
                    None => {
                        let keep = partial_tag_suffix(&buf, THINKING_OPEN);
                        out.push_str(&buf[..buf.len() - keep]);
                        self.carry = buf[buf.len() - keep..].to_string();
                        return out;
                    }
                }
            }
        }
    }
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
fn partial_tag_suffix(buf: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(buf.len());
    for len in (1..=max).rev() {
        let start = buf.len() - len;
        if buf.is_char_boundary(start) && buf[start..] == tag[..len] {
            return len;
        }
    }
    0
}
