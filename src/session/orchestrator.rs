use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::{KeyClaim, SessionRegistry};
use super::signing::UrlSigner;
use super::state::{Session, SessionParts, SessionResources, Subscription};
use super::transcript::{Direction, Lifecycle, Transcript};
use super::types::{
    InputAck, InputRequest, LimitKind, SessionArtifacts, SessionDetails, SessionEvent, SessionSummary,
    StartSessionRequest, StartedSession, StopRequest, StreamRef,
};
use crate::config::{Config, SessionConfig};
use crate::container::{container_name, NetworkMode, NetworkPolicy};
use crate::error::{CodeboxError, ErrorCode, Result};
use crate::sandbox::{exit_code_of, InteractiveRequest, SharedBackend, SpawnedProcess};
use crate::workspace::{normalize_workdir, WorkspaceStager};

const READ_CHUNK: usize = 4096;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("sess_{}", hex::encode(bytes))
}

pub fn transcript_route(session_id: &str) -> String {
    format!("/api/sessions/{}/transcript.ndjson", session_id)
}

/// `KILL`/`SIGKILL` and `TERM`/`SIGTERM` are honored; anything else interrupts.
pub fn parse_signal(raw: Option<&str>) -> Signal {
    let name = raw.unwrap_or_default().trim().to_uppercase();
    match name.trim_start_matches("SIG") {
        "KILL" => Signal::SIGKILL,
        "TERM" => Signal::SIGTERM,
        _ => Signal::SIGINT,
    }
}

/// Registry of interactive sandboxed processes and the operations on them.
pub struct SessionOrchestrator {
    config: SessionConfig,
    backend: SharedBackend,
    stager: WorkspaceStager,
    signer: UrlSigner,
    network_policy: NetworkPolicy,
    registry: Arc<SessionRegistry>,
    /// Added to the wall budget before the process is killed.
    teardown_allowance: Duration,
}

impl SessionOrchestrator {
    /// Create a new orchestrator
    pub fn new(config: SessionConfig, backend: SharedBackend, stager: WorkspaceStager, signer: UrlSigner) -> Self {
        Self {
            config,
            backend,
            stager,
            signer,
            network_policy: NetworkPolicy::default(),
            registry: Arc::new(SessionRegistry::new()),
            teardown_allowance: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &Config, backend: SharedBackend) -> Result<Self> {
        let signer = UrlSigner::from_key_or_random(
            config.session.signing_key.as_deref(),
            Duration::from_secs(config.session.url_ttl_secs),
        )?;
        Ok(Self::new(
            config.session.clone(),
            backend,
            WorkspaceStager::from_config(&config.sandbox),
            signer,
        )
        .with_teardown_allowance(Duration::from_millis(config.sandbox.grace_ms))
        .with_network_policy(NetworkPolicy::from_config(&config.sandbox)))
    }

    /// Operator opt-ins checked before anything is staged or booted.
    pub fn with_network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.network_policy = policy;
        self
    }

    pub fn with_teardown_allowance(mut self, allowance: Duration) -> Self {
        self.teardown_allowance = allowance;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.registry
            .get(id)
            .ok_or_else(|| CodeboxError::not_found("session not found"))
    }

    /// Start a session, or replay the one bound to the request's idempotency key.
    pub async fn start(&self, request: StartSessionRequest) -> Result<StartedSession> {
        if request.cmd.first().map_or(true, |c| c.trim().is_empty()) {
            return Err(CodeboxError::bad_request("cmd is required"));
        }
        let network: NetworkMode = request.network.parse()?;
        self.network_policy.authorize(network)?;
        let workdir = match request.workdir.as_deref() {
            Some(raw) => normalize_workdir(raw)?,
            None => None,
        };

        let key = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        if let Some(key) = &key {
            match self.registry.claim_key(key) {
                KeyClaim::Existing(session) => return self.replay(&session),
                KeyClaim::InFlight => {
                    return Err(CodeboxError::conflict("idempotency key already used by a pending request"))
                }
                KeyClaim::Claimed => {}
            }
        }

        let result = self.launch(request, network, workdir, key.clone()).await;
        if result.is_err() {
            if let Some(key) = &key {
                self.registry.release_key(key);
            }
        }
        result
    }

    fn replay(&self, session: &Session) -> Result<StartedSession> {
        let summary = session.summary();
        let window = Duration::from_secs(self.config.idempotency_window_secs);
        if session.age() > window || summary.usage.stdin_bytes > 0 {
            return Err(CodeboxError::conflict(
                "idempotency key already used and session mutated",
            ));
        }
        debug!(session_id = %session.id(), "Replaying idempotent start");
        Ok(StartedSession {
            stream: StreamRef::sse(session.id()),
            session: summary,
            replayed: true,
        })
    }

    async fn launch(
        &self,
        request: StartSessionRequest,
        network: NetworkMode,
        workdir: Option<String>,
        key: Option<String>,
    ) -> Result<StartedSession> {
        let limits = request.limits.normalized();
        let workspace = self.stager.stage_detached(request.files).await?;
        let prepared = match self.backend.prepare(&workspace, network).await {
            Ok(prepared) => prepared,
            Err(e) => {
                workspace.remove().await;
                return Err(e);
            }
        };

        let id = new_session_id();
        let transcript = match Transcript::create(&self.config.transcript_dir, &id).await {
            Ok(transcript) => Some(transcript),
            Err(e) => {
                warn!(session_id = %id, "Transcript unavailable: {}", e);
                None
            }
        };

        let spawn_request = InteractiveRequest {
            name: container_name(&id),
            command: request.cmd.clone(),
            env: request.env,
            workdir,
            network,
            memory_mb: Some(limits.mem_mb as u64),
        };
        let SpawnedProcess { mut child, handle } = match self.backend.spawn(&prepared, &spawn_request).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.backend.teardown(prepared).await;
                workspace.remove().await;
                if let Some(transcript) = &transcript {
                    transcript.close().await;
                    let _ = tokio::fs::remove_file(transcript.path()).await;
                }
                if e.code() == ErrorCode::PolicyViolation {
                    return Err(e);
                }
                error!(session_id = %id, "Session process failed to start: {}", e);
                return Err(CodeboxError::container("container start failed"));
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (control_tx, control_rx) = mpsc::channel(8);
        let session = Arc::new(Session::new(SessionParts {
            id: id.clone(),
            cmd: request.cmd,
            network,
            limits,
            idempotency_key: key,
            handle,
            stdin,
            transcript,
            control: control_tx,
            resources: SessionResources { prepared, workspace },
            tail_bytes: self.config.tail_bytes,
        }));

        if let Some(transcript) = session.transcript() {
            transcript
                .lifecycle(&Lifecycle::Start {
                    cmd: session.cmd().to_vec(),
                    network,
                })
                .await;
        }
        session.mark_running();
        self.registry.insert(Arc::clone(&session));

        let supervisor = Supervisor {
            session: Arc::clone(&session),
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            deadline: limits.wall() + self.teardown_allowance,
        };
        tokio::spawn(supervisor.run(child, stdout, stderr, control_rx));

        info!(
            session_id = %id,
            network = ?network,
            wall_seconds = limits.wall_seconds,
            "▶️ Session started"
        );
        Ok(StartedSession {
            session: session.summary(),
            stream: StreamRef::sse(&id),
            replayed: false,
        })
    }

    pub fn subscribe(&self, id: &str) -> Result<Subscription> {
        Ok(self.get(id)?.subscribe(self.config.subscriber_buffer))
    }

    /// Write to the session's stdin within its remaining budget.
    pub async fn input(&self, id: &str, request: InputRequest) -> Result<InputAck> {
        let session = self.get(id)?;
        if request.eof {
            session.close_stdin().await;
            return Ok(InputAck { ok: true, written_bytes: 0 });
        }
        let encoded = request.data_b64.trim();
        if encoded.is_empty() {
            return Ok(InputAck { ok: true, written_bytes: 0 });
        }
        let data = STANDARD
            .decode(encoded)
            .map_err(|_| CodeboxError::bad_request("invalid base64"))?;

        // Holding the pipe lock serializes writers so the budget is exact.
        let mut pipe = session.stdin().lock().await;
        let remaining = session.stdin_remaining() as usize;
        let accepted = &data[..data.len().min(remaining)];
        let mut written = 0;
        if let Some(stdin) = pipe.as_mut() {
            if !accepted.is_empty() {
                stdin
                    .write_all(accepted)
                    .await
                    .map_err(|_| CodeboxError::container("stdin write failed"))?;
                stdin
                    .flush()
                    .await
                    .map_err(|_| CodeboxError::container("stdin write failed"))?;
                written = accepted.len();
            }
        }
        if written > 0 {
            session.add_stdin(written);
            if let Some(transcript) = session.transcript() {
                transcript.chunk(Direction::Stdin, &accepted[..written]).await;
            }
        }
        drop(pipe);

        if data.len() > remaining {
            let cap = session.limits().cap(LimitKind::StdinBytes);
            if session.flag_stdin_capped() {
                session.broadcast(SessionEvent::limit(LimitKind::StdinBytes, cap));
            }
            return Err(CodeboxError::resource_exceeded(format!("stdin_bytes cap {}", cap)));
        }
        Ok(InputAck {
            ok: true,
            written_bytes: written,
        })
    }

    /// Signal the session's process and schedule a forced removal.
    pub async fn stop(&self, id: &str, request: StopRequest) -> Result<SessionSummary> {
        let session = self.get(id)?;
        let signal = parse_signal(request.signal.as_deref());
        if session.request_stop() {
            info!(session_id = %id, signal = %signal, "⏹️ Stopping session");
            if let Some(transcript) = session.transcript() {
                transcript
                    .lifecycle(&Lifecycle::Stop {
                        signal: signal.as_str().to_string(),
                    })
                    .await;
            }
            session.signal(signal);
            if let Some(handle) = session.handle().map(str::to_string) {
                let backend = Arc::clone(&self.backend);
                let grace = Duration::from_millis(self.config.stop_grace_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    backend.release(&handle).await;
                });
            }
        }
        Ok(session.summary())
    }

    /// Summary plus output tails and a signed transcript URL.
    pub fn status(&self, id: &str) -> Result<SessionDetails> {
        let session = self.get(id)?;
        let (stdout, stderr) = session.tails();
        let transcript_url = match session.transcript() {
            Some(_) => self.signer.sign(&transcript_route(id)),
            None => String::new(),
        };
        Ok(SessionDetails {
            session: session.summary(),
            artifacts: SessionArtifacts {
                stdout_tail_b64: STANDARD.encode(stdout),
                stderr_tail_b64: STANDARD.encode(stderr),
                transcript_url,
                files: Vec::new(),
            },
        })
    }

    /// Resolve the transcript file for a signed request.
    pub fn transcript_path(&self, id: &str, exp: &str, sig: &str) -> Result<PathBuf> {
        if !self.signer.verify(&transcript_route(id), exp, sig) {
            return Err(CodeboxError::forbidden("bad signature"));
        }
        let session = self.get(id)?;
        session
            .transcript()
            .map(|t| t.path().to_path_buf())
            .ok_or_else(|| CodeboxError::not_found("transcript not found"))
    }

    /// Kill every live session.
    pub fn shutdown(&self) {
        for session in self.registry.all() {
            if !session.is_terminal() {
                session.signal(Signal::SIGKILL);
            }
        }
    }
}

/// Owns the child process of one session until it exits.
struct Supervisor {
    session: Arc<Session>,
    backend: SharedBackend,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    deadline: Duration,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
        mut control: mpsc::Receiver<Signal>,
    ) {
        let session = Arc::clone(&self.session);
        let readers: Vec<JoinHandle<()>> = [
            stdout.map(|out| tokio::spawn(pump(Arc::clone(&session), out, Direction::Stdout))),
            stderr.map(|err| tokio::spawn(pump(Arc::clone(&session), err, Direction::Stderr))),
        ]
        .into_iter()
        .flatten()
        .collect();
        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(&session),
            Arc::clone(&self.backend),
            Duration::from_millis(self.config.heartbeat_ms.max(1)),
        ));

        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);
        let mut deadline_fired = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut deadline, if !deadline_fired => {
                    deadline_fired = true;
                    self.on_deadline(&mut child).await;
                }
                Some(signal) = control.recv() => deliver(&mut child, signal),
            }
        };
        heartbeat.abort();

        let code = match status {
            Ok(status) => exit_code_of(&status),
            Err(e) => {
                warn!(session_id = %session.id(), "Failed to wait for session process: {}", e);
                -1
            }
        };
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                warn!(session_id = %session.id(), "Output reader did not drain in time");
                abort.abort();
            }
        }

        let final_status = session.finish(code);
        if let Some(transcript) = session.transcript() {
            transcript.lifecycle(&Lifecycle::Exit { code }).await;
            transcript.close().await;
        }
        session.broadcast(SessionEvent::Exit { code, ts: Utc::now() });
        session.close_subscribers();
        info!(session_id = %session.id(), exit_code = code, status = ?final_status, "Session finished");

        self.cleanup().await;
    }

    async fn on_deadline(&self, child: &mut Child) {
        let session = &self.session;
        if session.mark_timeout() {
            warn!(session_id = %session.id(), "⏰ Session exceeded wall budget");
        }
        session.broadcast(SessionEvent::Error {
            code: ErrorCode::ResourceExceeded,
            detail: "wall_seconds".to_string(),
            ts: Utc::now(),
        });
        if let Some(transcript) = session.transcript() {
            transcript
                .lifecycle(&Lifecycle::Timeout {
                    wall_seconds: session.limits().wall_seconds,
                })
                .await;
        }
        let _ = child.start_kill();
        if let Some(handle) = session.handle() {
            self.backend.release(handle).await;
        }
    }

    async fn cleanup(self) {
        let session = self.session;
        tokio::time::sleep(Duration::from_millis(self.config.cleanup_delay_ms)).await;
        if let Some(handle) = session.handle() {
            self.backend.release(handle).await;
        }
        if let Some(resources) = session.take_resources() {
            self.backend.teardown(resources.prepared).await;
            resources.workspace.remove().await;
        }
        session.close_stdin().await;

        tokio::time::sleep(Duration::from_secs(self.config.retention_secs)).await;
        self.registry.remove(session.id());
        if let Some(transcript) = session.transcript() {
            let _ = tokio::fs::remove_file(transcript.path()).await;
        }
        debug!(session_id = %session.id(), "Session retired");
    }
}

fn deliver(child: &mut Child, signal: Signal) {
    if signal == Signal::SIGKILL {
        let _ = child.start_kill();
        return;
    }
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            warn!(pid, "Failed to deliver {}: {}", signal, e);
        }
    }
}

/// Drain one output pipe, forwarding what fits under the stream's cap.
async fn pump<R>(session: Arc<Session>, mut reader: R, dir: Direction)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(session_id = %session.id(), "Output pipe closed: {}", e);
                break;
            }
        };
        let chunk = &buf[..n];
        let accounting = session.record_output(dir, chunk);
        if accounting.kept > 0 {
            let kept = &chunk[..accounting.kept];
            if let Some(transcript) = session.transcript() {
                transcript.chunk(dir, kept).await;
            }
            let data_b64 = STANDARD.encode(kept);
            let ts = Utc::now();
            session.broadcast(match dir {
                Direction::Stdout => SessionEvent::Stdout { data_b64, ts },
                _ => SessionEvent::Stderr { data_b64, ts },
            });
        }
        if let Some((kind, cap)) = accounting.crossed {
            session.broadcast(SessionEvent::limit(kind, cap));
        }
    }
}

/// Periodic status broadcast; also samples CPU and memory when the backend can.
async fn heartbeat(session: Arc<Session>, backend: SharedBackend, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Some(handle) = session.handle() {
            if let Some(sample) = backend.sample(handle).await {
                if let Some(cap) = session.record_sample(sample) {
                    warn!(session_id = %session.id(), "Session exceeded CPU budget");
                    session.broadcast(SessionEvent::limit(LimitKind::CpuSeconds, cap));
                    session.signal(Signal::SIGKILL);
                }
            }
        }
        session.broadcast(session.status_event());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_random_hex() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sess_"));
        assert_eq!(a.len(), 5 + 32);
        assert!(a[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal(Some("KILL")), Signal::SIGKILL);
        assert_eq!(parse_signal(Some("sigkill")), Signal::SIGKILL);
        assert_eq!(parse_signal(Some("TERM")), Signal::SIGTERM);
        assert_eq!(parse_signal(Some("HUP")), Signal::SIGINT);
        assert_eq!(parse_signal(None), Signal::SIGINT);
    }

    #[test]
    fn test_transcript_route() {
        assert_eq!(transcript_route("sess_1"), "/api/sessions/sess_1/transcript.ndjson");
    }
}
