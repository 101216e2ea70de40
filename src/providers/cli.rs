//! Provider sessions backed by the external LLM CLIs.
//!
//! Each turn spawns the provider binary in non-interactive mode inside the
//! agent's workspace, captures its JSON output, and remembers the session
//! handle for resumption. Cancellation signals the child (SIGTERM, then
//! SIGKILL after a bounded grace period).

use crate::errors::HibossResult;
use crate::providers::{
    CancelToken, ProviderError, ProviderFactory, ProviderSession, SessionConfig, ProviderKind,
    TurnOutcome, TurnUsage, scrub_provider_env,
};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL on cancellation.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Opens sessions that drive the `claude` / `codex` binaries.
#[derive(Debug, Default)]
pub struct CliProviderFactory;

#[async_trait]
impl ProviderFactory for CliProviderFactory {
    async fn open_session(&self, cfg: &SessionConfig) -> HibossResult<Box<dyn ProviderSession>> {
        Ok(Box::new(CliSession {
            cfg: cfg.clone(),
            resume: Mutex::new(None),
        }))
    }
}

struct CliSession {
    cfg: SessionConfig,
    /// Provider-native session handle captured from the first turn.
    resume: Mutex<Option<String>>,
}

struct ParsedTurn {
    final_response: String,
    usage: TurnUsage,
    session_id: Option<String>,
}

impl CliSession {
    fn binary(&self) -> &'static str {
        match self.cfg.provider {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
        }
    }

    fn build_command(&self, prompt: &str, resume: Option<&str>) -> Command {
        let mut cmd = Command::new(self.binary());
        match self.cfg.provider {
            ProviderKind::Claude => {
                cmd.arg("-p").arg(prompt).arg("--output-format").arg("json");
                if let Some(model) = &self.cfg.model {
                    cmd.arg("--model").arg(model);
                }
                if let Some(id) = resume {
                    cmd.arg("--resume").arg(id);
                }
            }
            ProviderKind::Codex => {
                cmd.arg("exec");
                if let Some(id) = resume {
                    cmd.arg("resume").arg(id);
                }
                cmd.arg("--json");
                if let Some(model) = &self.cfg.model {
                    cmd.arg("-m").arg(model);
                }
                if let Some(effort) = self.cfg.reasoning_effort {
                    cmd.arg("-c")
                        .arg(format!("model_reasoning_effort=\"{}\"", effort.as_str()));
                }
                cmd.arg(prompt);
            }
        }
        cmd.current_dir(&self.cfg.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        scrub_provider_env(&mut cmd);
        cmd
    }
}

#[async_trait]
impl ProviderSession for CliSession {
    async fn run_turn(
        &self,
        prompt: &str,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let resume = self.resume.lock().await.clone();
        let mut cmd = self.build_command(prompt, resume.as_deref());
        let mut child = cmd.spawn().map_err(|e| {
            ProviderError::Failed(format!("failed to spawn {}: {}", self.binary(), e))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(slurp(stdout));
        let err_task = tokio::spawn(slurp(stderr));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };
        let Some(status) = waited else {
            terminate(&mut child).await;
            out_task.abort();
            err_task.abort();
            return Err(ProviderError::Cancelled);
        };
        let status = status.map_err(|e| {
            ProviderError::Failed(format!("waiting for {} failed: {}", self.binary(), e))
        })?;

        let stdout = out_task.await.unwrap_or_default();
        let stderr = err_task.await.unwrap_or_default();
        if !status.success() {
            return Err(ProviderError::Failed(format!(
                "{} exited with {}: {}",
                self.binary(),
                status,
                tail(&stderr, 500)
            )));
        }

        let parsed = match self.cfg.provider {
            ProviderKind::Claude => parse_claude_output(&stdout),
            ProviderKind::Codex => parse_codex_output(&stdout),
        }
        .map_err(ProviderError::Failed)?;

        if let Some(id) = &parsed.session_id {
            debug!("agent {} session handle {}", self.cfg.agent_name, id);
            *self.resume.lock().await = Some(id.clone());
        }
        Ok(TurnOutcome {
            final_response: parsed.final_response,
            usage: parsed.usage,
        })
    }

    async fn close(&self) {
        // No persistent child between turns; dropping the resume handle is
        // what makes the next turn start fresh
        *self.resume.lock().await = None;
    }
}

/// Last `max_chars` of a string, trimmed, on a char boundary.
fn tail(s: &str, max_chars: usize) -> &str {
    let trimmed = s.trim();
    match trimmed.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) => &trimmed[idx..],
        None => trimmed,
    }
}

async fn slurp<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = String::new();
    if let Err(e) = reader.read_to_string(&mut buf).await {
        warn!("reading provider output failed: {}", e);
    }
    buf
}

/// SIGTERM, bounded grace, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a child process we spawned and still own
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("provider child ignored SIGTERM, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// `claude -p --output-format json` prints one JSON object.
fn parse_claude_output(stdout: &str) -> Result<ParsedTurn, String> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("unparseable claude output: {}", e))?;
    let final_response = value
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let usage = value.get("usage").cloned().unwrap_or(Value::Null);
    let input = u64_field(&usage, "input_tokens");
    let output = u64_field(&usage, "output_tokens");
    let cache_read = u64_field(&usage, "cache_read_input_tokens");
    let cache_write = u64_field(&usage, "cache_creation_input_tokens");
    Ok(ParsedTurn {
        final_response,
        usage: TurnUsage {
            input,
            output,
            total: input + output,
            cache_read,
            cache_write,
            context_length: input + cache_read + output,
        },
        session_id,
    })
}

/// `codex exec --json` prints one JSON event per line.
fn parse_codex_output(stdout: &str) -> Result<ParsedTurn, String> {
    let mut final_response = String::new();
    let mut usage = TurnUsage::default();
    let mut session_id = None;

    for line in stdout.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("thread.started") => {
                session_id = event
                    .get("thread_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Some("item.completed") => {
                let item = event.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(Value::as_str) == Some("agent_message") {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        final_response = text.to_string();
                    }
                }
            }
            Some("turn.completed") => {
                if let Some(u) = event.get("usage") {
                    let input = u64_field(u, "input_tokens");
                    let output = u64_field(u, "output_tokens");
                    let cached = u64_field(u, "cached_input_tokens");
                    usage = TurnUsage {
                        input,
                        output,
                        total: input + output,
                        cache_read: cached,
                        cache_write: 0,
                        context_length: input + cached + output,
                    };
                }
            }
            _ => {}
        }
    }

    if final_response.is_empty() && usage.total == 0 {
        return Err("codex output contained no agent message".to_string());
    }
    Ok(ParsedTurn {
        final_response,
        usage,
        session_id,
    })
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}
