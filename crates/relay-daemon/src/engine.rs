//! Engine abstraction
//!
//! The assistant engine is a black-box async message source. The gateway
//! only depends on the [`Engine`] trait; [`CliEngine`] is the production
//! adapter that spawns the engine CLI and parses its NDJSON stream.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use futures::Stream;
use relay_core::{EngineMessage, GatewayError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::PermissionMode;

/// One engine invocation. Working directory and permission mode are explicit
/// parameters, never ambient environment state.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: u32,
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<EngineMessage, GatewayError>> + Send>>;

pub trait Engine: Send + Sync {
    fn run(&self, request: EngineRequest) -> MessageStream;
}

/// Spawns the configured engine command and yields its message stream.
///
/// The prompt goes in over stdin (command lines have an ARG_MAX ceiling that
/// large prompts blow through). Stdout lines that fail to parse as engine
/// messages are skipped with a debug log, not treated as fatal.
pub struct CliEngine {
    cmd: String,
}

impl CliEngine {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

impl Engine for CliEngine {
    fn run(&self, request: EngineRequest) -> MessageStream {
        let cmd = self.cmd.clone();

        Box::pin(async_stream::stream! {
            let mut parts = cmd.split_whitespace();
            let program = match parts.next() {
                Some(p) => p.to_string(),
                None => {
                    yield Err(GatewayError::Engine("engine command is empty".to_string()));
                    return;
                }
            };

            let mut command = Command::new(program);
            command
                .args(parts)
                .arg("--permission-mode")
                .arg(request.permission_mode.as_flag())
                .arg("--max-turns")
                .arg(request.max_turns.to_string());
            if let Some(model) = &request.model {
                command.arg("--model").arg(model);
            }
            if let Some(system) = &request.system_prompt {
                command.arg("--append-system-prompt").arg(system);
            }
            command
                .current_dir(&request.cwd)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let mut child = match command.spawn() {
                Ok(c) => c,
                Err(e) => {
                    yield Err(GatewayError::Engine(format!("failed to spawn engine: {e}")));
                    return;
                }
            };

            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                    warn!(error = %e, "failed to write prompt to engine stdin");
                }
                // stdin drops here, closing the pipe so the engine starts.
            }

            let stdout = match child.stdout.take() {
                Some(s) => s,
                None => {
                    yield Err(GatewayError::Engine("engine stdout unavailable".to_string()));
                    return;
                }
            };

            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<EngineMessage>(line) {
                            Ok(msg) => yield Ok(msg),
                            Err(e) => {
                                debug!(error = %e, "skipping unrecognized engine output line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(GatewayError::Io(e));
                        break;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() => {
                    yield Err(GatewayError::Engine(format!("engine exited with {status}")));
                }
                Ok(_) => {}
                Err(e) => {
                    yield Err(GatewayError::Engine(format!("failed to reap engine: {e}")));
                }
            }
        })
    }
}
