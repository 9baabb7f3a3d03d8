//! Tests for prompt construction

use super::*;
use relay_core::openai::{ChatMessage, Role};

fn user(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: content.to_string(),
    }
}

fn assistant(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: content.to_string(),
    }
}

fn system(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::System,
        content: content.to_string(),
    }
}

#[test]
fn test_plain_user_message_gets_human_prefix() {
    let (prompt, sys) = build_prompt(&[user("Hello")]).expect("should build");
    assert_eq!(prompt, "Human: Hello");
    assert!(sys.is_none());
}

#[test]
fn test_slash_command_passes_through_verbatim() {
    // Prefixing a slash-command breaks command recognition downstream.
    let (prompt, _) = build_prompt(&[user("/sc:research topic X")]).expect("should build");
    assert_eq!(prompt, "/sc:research topic X");
    assert!(!prompt.contains("Human: "));
}

#[test]
fn test_slash_command_with_leading_whitespace_passes_through() {
    let (prompt, _) = build_prompt(&[user("  /research topic")]).expect("should build");
    assert!(!prompt.contains("Human: "));
}

#[test]
fn test_conversation_roles_and_separators() {
    let (prompt, _) = build_prompt(&[
        user("What is Rust?"),
        assistant("A systems language."),
        user("Tell me more"),
    ])
    .expect("should build");

    assert_eq!(
        prompt,
        "Human: What is Rust?\n\nAssistant: A systems language.\n\nHuman: Tell me more"
    );
}

#[test]
fn test_trailing_assistant_turn_gets_continuation() {
    let (prompt, _) =
        build_prompt(&[user("Hi"), assistant("Hello!")]).expect("should build");
    assert!(prompt.ends_with("Human: Please continue."));
}

#[test]
fn test_first_system_message_wins() {
    let (_, sys) = build_prompt(&[
        system("You are terse."),
        system("You are verbose."),
        user("Hi"),
    ])
    .expect("should build");
    assert_eq!(sys.as_deref(), Some("You are terse."));
}

#[test]
fn test_system_only_conversation_gets_continuation() {
    let (prompt, sys) = build_prompt(&[system("Be helpful.")]).expect("should build");
    assert_eq!(prompt, "Human: Please continue.");
    assert_eq!(sys.as_deref(), Some("Be helpful."));
}

#[test]
fn test_empty_messages_is_invalid_request() {
    let err = build_prompt(&[]).expect_err("should fail");
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
}

#[test]
fn test_research_command_detection() {
    assert!(is_research_command("/sc:research solar panels"));
    assert!(is_research_command("/research solar panels"));
    assert!(!is_research_command("research solar panels"));
    assert!(!is_research_command("Human: /sc:research x"));
}

#[test]
fn test_extract_research_query() {
    assert_eq!(
        extract_research_query("/sc:research \"heat pump sizing\""),
        "heat pump sizing"
    );
    assert_eq!(
        extract_research_query("/research --depth deep solar storage"),
        "solar storage"
    );
}

#[test]
fn test_filter_content_strips_thinking_blocks() {
    let raw = "<thinking>internal musings</thinking>\nThe answer is 42.";
    assert_eq!(filter_content(raw), "The answer is 42.");
}

#[test]
fn test_filter_content_passthrough_without_markers() {
    assert_eq!(filter_content("plain text"), "plain text");
}

#[test]
fn test_thinking_filter_passthrough_keeps_deltas_intact() {
    let mut filter = ThinkingFilter::new();
    assert_eq!(filter.push("line one\n"), "line one\n");
    assert_eq!(filter.push("line two"), "line two");
}

#[test]
fn test_thinking_filter_block_split_across_deltas() {
    let mut filter = ThinkingFilter::new();
    let mut out = String::new();
    out.push_str(&filter.push("before <thin"));
    out.push_str(&filter.push("king>secret</thi"));
    out.push_str(&filter.push("nking> after"));
    assert_eq!(out, "before  after");
}

#[test]
fn test_thinking_filter_unclosed_tag_suppresses_tail() {
    let mut filter = ThinkingFilter::new();
    assert_eq!(filter.push("visible <thinking>hidden"), "visible ");
    assert_eq!(filter.push(" still hidden"), "");
}

#[test]
fn test_thinking_filter_releases_false_partial_tag() {
    let mut filter = ThinkingFilter::new();
    assert_eq!(filter.push("a <thin"), "a ");
    assert_eq!(filter.push("g b"), "<thing b");
}

#[test]
fn test_thinking_filter_whole_block_in_one_delta() {
    let mut filter = ThinkingFilter::new();
    assert_eq!(
        filter.push("<thinking>musing</thinking>The answer."),
        "The answer."
    );
}
