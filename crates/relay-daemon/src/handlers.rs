//! HTTP handlers
//!
//! One endpoint does the real work: `POST /v1/chat/completions`. It flattens
//! the conversation into an engine prompt, runs one engine turn, and renders
//! the result either as an SSE stream or a single JSON body. Research
//! slash-commands get the transformed execution protocol, the relocated
//! working directory, the longer timeout and automatic file discovery.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::{
    ChatCompletionRequest, ClaudeMetadata, DiscoveryResult, EngineMessage, ErrorBody,
    GatewayError,
};
use relay_translator::{
    build_prompt, extract_research_query, filter_content, is_research_command, ThinkingFilter,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryEngine;
use crate::engine::EngineRequest;
use crate::session::{Session, TurnOutcome, TurnStatus};
use crate::sse::{collect_text, StreamContext, FALLBACK_TEXT, METADATA_EVENT};
use crate::AppState;

pub const HEADER_FILE_DISCOVERY: &str = "x-claude-file-discovery";
pub const HEADER_MAX_TURNS: &str = "x-claude-max-turns";
pub const HEADER_SESSION_ID: &str = "x-claude-session-id";

const DEFAULT_MAX_TURNS: u32 = 10;
/// Research needs room for search/write cycles, but unbounded turns blow
/// through the engine's context window.
const RESEARCH_MIN_TURNS: u32 = 20;
const RESEARCH_MAX_TURNS: u32 = 25;

/// Subdirectory the engine is told to write research output into.
const OUTPUT_SUBDIR: &str = "claudedocs";

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "relay-daemon" }))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let (prompt, system_prompt) = match build_prompt(&request.messages) {
        Ok(parts) => parts,
        Err(e) => return error_response(&e),
    };

    let is_research = is_research_command(&prompt);
    let (effective_tools, discovery_enabled) = discovery_gate(
        request.enable_tools.unwrap_or(false),
        is_research,
        header_flag(&headers, HEADER_FILE_DISCOVERY),
    );

    let mut max_turns = header_u32(&headers, HEADER_MAX_TURNS).unwrap_or(DEFAULT_MAX_TURNS);
    let mut prompt = prompt;
    if is_research {
        let query = extract_research_query(&prompt);
        info!(query = %truncate(&query, 100), "research command detected");
        prompt = research_protocol_prompt(&query);
        max_turns = max_turns.clamp(RESEARCH_MIN_TURNS, RESEARCH_MAX_TURNS);
    }

    let work_dir = state.config.resolve_work_dir(is_research);
    let output_dir = work_dir.join(OUTPUT_SUBDIR);
    if discovery_enabled {
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            warn!(dir = %output_dir.display(), error = %e, "could not create output directory");
        }
        prompt = inject_output_path(&prompt, &output_dir.join("output.md"));
    }

    debug!(
        research = is_research,
        tools = effective_tools,
        discovery = discovery_enabled,
        max_turns,
        work_dir = %work_dir.display(),
        "dispatching engine turn"
    );

    let prompt_for_usage = prompt.clone();
    let engine_request = EngineRequest {
        prompt,
        system_prompt,
        model: state.config.model.clone(),
        max_turns,
        cwd: work_dir.clone(),
        permission_mode: state.config.permission_mode,
    };

    let timeout = state.config.timeout_for(is_research);
    let session = state.runner.start(engine_request, timeout);
    let session_id = session.id.clone();
    let ctx = StreamContext::new(&request.model);

    let scan_dir = if output_dir.is_dir() { output_dir } else { work_dir };
    let discovery = discovery_enabled.then(|| state.discovery.clone());

    let mut response = if request.stream.unwrap_or(false) {
        stream_response(ctx, session, discovery, scan_dir)
    } else {
        json_response(ctx, session, discovery, scan_dir, &prompt_for_usage, timeout).await
    };

    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

/// Tool / discovery gating. Research implies tools; discovery additionally
/// needs either the opt-in header or research mode. Plain chat with tools
/// disabled never gets discovery, so no metadata ever reaches the client.
fn discovery_gate(enable_tools: bool, is_research: bool, header: bool) -> (bool, bool) {
    let effective_tools = enable_tools || is_research;
    let discovery = effective_tools && (header || is_research);
    (effective_tools, discovery)
}

async fn json_response(
    ctx: StreamContext,
    session: Session,
    discovery: Option<Arc<DiscoveryEngine>>,
    scan_dir: PathBuf,
    prompt: &str,
    timeout: std::time::Duration,
) -> Response {
    let started_at = session.started_at;
    let Session {
        messages: mut rx,
        outcome,
        ..
    } = session;

    // Keep the forwarding channel drained; the buffer arrives via `outcome`.
    while rx.recv().await.is_some() {}

    let outcome = outcome.await.unwrap_or_else(|_| TurnOutcome {
        buffer: Vec::new(),
        status: TurnStatus::Failed("session task ended unexpectedly".to_string()),
    });

    match outcome.status {
        TurnStatus::TimedOut => {
            // Discovery on the partial buffer is possible but the OpenAI
            // contract has no partial non-streaming response; report timeout.
            return error_response(&GatewayError::EngineTimeout(timeout.as_secs()));
        }
        TurnStatus::Failed(reason) => {
            return error_response(&GatewayError::Engine(reason));
        }
        TurnStatus::Completed(_) | TurnStatus::Cancelled => {}
    }

    let mut content = filter_content(&collect_text(&outcome.buffer));
    if content.is_empty() {
        warn!("turn completed without assistant text, using fallback");
        content = FALLBACK_TEXT.to_string();
    }

    let metadata = match discovery {
        Some(engine) => Some(run_discovery(engine, outcome.buffer, scan_dir, started_at).await),
        None => None,
    };

    Json(ctx.completion(content, prompt, metadata)).into_response()
}

fn stream_response(
    ctx: StreamContext,
    session: Session,
    discovery: Option<Arc<DiscoveryEngine>>,
    scan_dir: PathBuf,
) -> Response {
    let started_at = session.started_at;
    let Session {
        messages: mut rx,
        outcome,
        ..
    } = session;

    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(json_event(&ctx.role_chunk()));

        let mut sent_content = false;
        let mut thinking = ThinkingFilter::new();
        while let Some(msg) = rx.recv().await {
            if let EngineMessage::Text { text } = msg {
                let filtered = thinking.push(&text);
                if !filtered.is_empty() {
                    sent_content = true;
                    yield Ok(json_event(&ctx.content_chunk(&filtered)));
                }
            }
        }

        let outcome = outcome.await.unwrap_or_else(|_| TurnOutcome {
            buffer: Vec::new(),
            status: TurnStatus::Failed("session task ended unexpectedly".to_string()),
        });

        if let TurnStatus::Failed(reason) = &outcome.status {
            warn!(reason = %reason, "engine turn failed mid-stream");
            let body = ErrorBody::new(reason.clone(), "api_error");
            yield Ok(json_event(&body));
            yield Ok(Event::default().data("[DONE]"));
            return;
        }

        if !sent_content {
            warn!("turn produced no assistant text, streaming fallback");
            yield Ok(json_event(&ctx.content_chunk(FALLBACK_TEXT)));
        }
        yield Ok(json_event(&ctx.finish_chunk()));

        // Metadata comes strictly after the terminal content chunk. A
        // timed-out turn still gets discovery over its partial buffer.
        if let Some(engine) = discovery {
            let metadata = run_discovery(engine, outcome.buffer, scan_dir, started_at).await;
            yield Ok(json_event(&metadata).event(METADATA_EVENT));
        }

        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn run_discovery(
    engine: Arc<DiscoveryEngine>,
    buffer: Vec<EngineMessage>,
    scan_dir: PathBuf,
    started_at: chrono::DateTime<chrono::Utc>,
) -> ClaudeMetadata {
    let result = tokio::task::spawn_blocking(move || {
        engine.discover(&buffer, &scan_dir, started_at)
    })
    .await
    .unwrap_or_else(|e| {
        warn!(error = %e, "discovery task panicked");
        DiscoveryResult::failed("discovery task panicked")
    });
    result.into_metadata()
}

fn json_event<T: Serialize>(payload: &T) -> Event {
    match Event::default().json_data(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "failed to serialize SSE payload");
            Event::default().data("{}")
        }
    }
}

fn error_response(err: &GatewayError) -> Response {
    let status = match err {
        GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::EngineTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::EngineDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(ErrorBody::new(err.to_string(), err.error_type()))).into_response()
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "enabled" | "true" | "1"))
        .unwrap_or(false)
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// The engine expands slash-commands as context rather than executing them,
/// so research commands are rewritten into a direct execution protocol.
fn research_protocol_prompt(query: &str) -> String {
    format!(
        "Research this query and write output IMMEDIATELY:\n\
         \n\
         QUERY: {query}\n\
         \n\
         PROTOCOL (execute in order):\n\
         1. Run 2-3 TARGETED web searches only\n\
         2. Extract ONLY key findings (keep summaries under 150 words each)\n\
         3. Write report to {OUTPUT_SUBDIR}/research_output.md IMMEDIATELY after searches\n\
         4. DO NOT conduct additional searches after writing the file\n\
         \n\
         OUTPUT STRUCTURE:\n\
         # Research Report\n\
         \n\
         ## Summary\n\
         [2-3 sentences maximum]\n\
         \n\
         ## Key Findings\n\
         - [Finding with source]\n\
         \n\
         ## Analysis\n\
         [Brief analysis, max 200 words]\n\
         \n\
         ## Sources\n\
         [List URLs]\n\
         \n\
         CRITICAL: Write the file EARLY to avoid context overflow. \
         Use the Write tool for {OUTPUT_SUBDIR}/research_output.md."
    )
}

/// Tell the engine exactly where to put its output so Strategy 1 discovery
/// finds it. A slash-command on the first line must stay first.
fn inject_output_path(prompt: &str, output_file: &Path) -> String {
    let header = format!(
        "\n**CRITICAL: You MUST use the Write tool to complete this task.**\n\
         Write your complete analysis to OUTPUT_FILE_PATH:\n{}\n\n",
        output_file.display()
    );
    let footer = format!(
        "\n\nDo NOT reply in chat! Use the Write tool to WRITE your reply to OUTPUT_FILE_PATH.\n\
         OUTPUT_FILE_PATH: {}",
        output_file.display()
    );

    match prompt.split_once('\n') {
        Some((first, rest)) if first.trim_start().starts_with('/') => {
            format!("{first}{header}{rest}{footer}")
        }
        None if prompt.trim_start().starts_with('/') => format!("{prompt}{header}{footer}"),
        _ => format!("{header}{prompt}{footer}"),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
