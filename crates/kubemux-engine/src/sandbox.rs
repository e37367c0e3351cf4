use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

use kubemux_types::FilterEvent;

use crate::error::{EngineError, Result};
use crate::events::EventHub;

/// Text utilities a filter pipeline may invoke
const ALLOWED_COMMANDS: &[&str] = &[
    "grep", "awk", "sed", "cut", "sort", "uniq", "head", "tail", "jq", "tr", "wc", "cat",
];

/// Shell metacharacters that would break out of a plain pipe chain
const FORBIDDEN_SEQUENCES: &[&str] = &[";", "&", "`", "$(", ">", "<", "/dev/", ".."];

/// File-mutating commands rejected anywhere in the pipeline
const FORBIDDEN_TOKENS: &[&str] = &["rm", "mv", "cp"];

struct FilterProcess {
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    cancel: CancellationToken,
    generation: u64,
}

type ProcessTable = Arc<Mutex<HashMap<String, FilterProcess>>>;

/// Spawns and supervises one restricted external filter pipeline per session.
///
/// Raw log bytes are written to the process stdin; its stdout and
/// stderr/exit diagnostics are relayed tagged by session id over the event
/// hub. At most one live process exists per session.
pub struct FilterSandbox {
    processes: ProcessTable,
    events: Arc<EventHub<FilterEvent>>,
    next_generation: AtomicU64,
}

impl FilterSandbox {
    pub fn new(events: Arc<EventHub<FilterEvent>>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            events,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Validate and spawn a filter pipeline for a session.
    ///
    /// Validation rejects the whole command before anything is spawned.
    /// Starting a new filter for a session that already has one replaces
    /// it: the displaced process is killed when the new one registers, so
    /// concurrent starts cannot leak a child.
    pub fn start(&self, session_id: &str, command: &str) -> Result<()> {
        validate_command(command).map_err(EngineError::Validation)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Process(format!("failed to spawn filter: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Process("filter stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Process("filter stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Process("filter stderr unavailable".to_string()))?;

        let cancel = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // stdout relay
        {
            let events = Arc::clone(&self.events);
            let session = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    events.emit(
                        &session,
                        FilterEvent::Data {
                            session_id: session.clone(),
                            line,
                        },
                    );
                }
            });
        }

        // stderr relay
        {
            let events = Arc::clone(&self.events);
            let session = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(session = %session, "filter stderr: {}", line);
                    events.emit(
                        &session,
                        FilterEvent::Diagnostic {
                            session_id: session.clone(),
                            message: line,
                        },
                    );
                }
            });
        }

        self.spawn_supervisor(session_id, child, cancel.clone(), generation);

        let displaced = self.processes.lock().insert(
            session_id.to_string(),
            FilterProcess {
                stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
                cancel,
                generation,
            },
        );
        if let Some(prev) = displaced {
            prev.cancel.cancel();
        }

        tracing::debug!(session = session_id, command, "filter pipeline started");
        Ok(())
    }

    /// Watch the child: kill it on cancellation, or report an abnormal exit
    /// that happens while the process is still registered.
    fn spawn_supervisor(
        &self,
        session_id: &str,
        mut child: Child,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let events = Arc::clone(&self.events);
        let processes = Arc::clone(&self.processes);
        let session = session_id.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    let still_registered = {
                        let mut map = processes.lock();
                        match map.get(&session) {
                            Some(p) if p.generation == generation => {
                                map.remove(&session);
                                true
                            }
                            _ => false,
                        }
                    };
                    if still_registered && code != Some(0) {
                        tracing::warn!(session = %session, ?code, "filter process exited abnormally");
                        events.emit(
                            &session,
                            FilterEvent::Exited {
                                session_id: session.clone(),
                                code,
                            },
                        );
                    }
                }
            }
        });
    }

    /// Write raw bytes to the session's filter stdin.
    ///
    /// Returns false when no live filter exists for the session or the pipe
    /// is already closed.
    pub async fn write(&self, session_id: &str, data: &str) -> bool {
        let stdin = {
            let processes = self.processes.lock();
            match processes.get(session_id) {
                Some(p) => Arc::clone(&p.stdin),
                None => return false,
            }
        };

        let mut stdin = stdin.lock().await;
        stdin.write_all(data.as_bytes()).await.is_ok() && stdin.flush().await.is_ok()
    }

    /// Terminate the session's filter process and release its pipes.
    ///
    /// Idempotent: stopping a session with no filter is a no-op.
    pub fn stop(&self, session_id: &str) {
        if let Some(process) = self.processes.lock().remove(session_id) {
            process.cancel.cancel();
            tracing::debug!(session = session_id, "filter pipeline stopped");
        }
    }

    /// Whether a filter process is currently registered for the session
    pub fn is_active(&self, session_id: &str) -> bool {
        self.processes.lock().contains_key(session_id)
    }

    /// Stop every registered filter process
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.processes.lock().drain().collect();
        for (_, process) in drained {
            process.cancel.cancel();
        }
    }
}

/// Validate a filter pipeline command without spawning anything.
///
/// Every stage's leading token must be an allow-listed text utility and the
/// command may not contain shell chaining, redirection, subshells, device
/// paths, parent-directory traversal, or file-mutating commands.
pub fn validate_command(command: &str) -> std::result::Result<(), String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err("empty filter command".to_string());
    }

    // Newlines and other control characters chain commands under sh -c
    // just like ';' would
    if trimmed.chars().any(|c| c.is_control() && c != '\t') {
        return Err("control characters are not allowed in filter commands".to_string());
    }

    for seq in FORBIDDEN_SEQUENCES {
        if trimmed.contains(seq) {
            return Err(format!("'{}' is not allowed in filter commands", seq));
        }
    }

    for stage in trimmed.split('|') {
        let stage = stage.trim();
        if stage.is_empty() {
            return Err("empty pipeline stage".to_string());
        }

        let mut tokens = stage.split_whitespace();
        let head = tokens.next().unwrap_or_default();
        if !ALLOWED_COMMANDS.contains(&head) {
            return Err(format!(
                "'{}' is not an allowed filter command (allowed: {})",
                head,
                ALLOWED_COMMANDS.join(", ")
            ));
        }

        for token in tokens {
            if FORBIDDEN_TOKENS.contains(&token) {
                return Err(format!("'{}' is not allowed in filter commands", token));
            }
        }
    }

    Ok(())
}
