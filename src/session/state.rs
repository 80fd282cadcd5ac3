//! Per-session state shared between the orchestrator, the stream readers
//! and the supervisor task.

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;

use super::ring::RingBuffer;
use super::transcript::{Direction, Transcript};
use super::types::{LimitKind, SessionEvent, SessionLimits, SessionStatus, SessionSummary, SessionUsage};
use crate::container::NetworkMode;
use crate::sandbox::{PreparedSandbox, UsageSample};
use crate::workspace::StagedWorkspace;

/// Sandbox-side resources reclaimed once the session is terminal.
#[derive(Debug)]
pub(crate) struct SessionResources {
    pub prepared: PreparedSandbox,
    pub workspace: StagedWorkspace,
}

pub(crate) struct SessionParts {
    pub id: String,
    pub cmd: Vec<String>,
    pub network: NetworkMode,
    pub limits: SessionLimits,
    pub idempotency_key: Option<String>,
    pub handle: Option<String>,
    pub stdin: Option<ChildStdin>,
    pub transcript: Option<Transcript>,
    pub control: mpsc::Sender<Signal>,
    pub resources: SessionResources,
    pub tail_bytes: usize,
}

struct SessionInner {
    status: SessionStatus,
    exited_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    usage: SessionUsage,
    stdout_tail: RingBuffer,
    stderr_tail: RingBuffer,
    stdout_capped: bool,
    stderr_capped: bool,
    stdin_capped: bool,
    cpu_capped: bool,
    stop_requested: bool,
    subscribers: HashMap<u64, mpsc::Sender<SessionEvent>>,
    next_subscriber: u64,
}

/// Bytes of a chunk to retain and forward, plus a limit crossed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputAccounting {
    pub kept: usize,
    pub crossed: Option<(LimitKind, u64)>,
}

pub struct Session {
    id: String,
    created: Instant,
    started_at: DateTime<Utc>,
    cmd: Vec<String>,
    network: NetworkMode,
    limits: SessionLimits,
    idempotency_key: Option<String>,
    handle: Option<String>,
    inner: Mutex<SessionInner>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    transcript: Option<Transcript>,
    control: mpsc::Sender<Signal>,
    resources: Mutex<Option<SessionResources>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            created: Instant::now(),
            started_at: Utc::now(),
            cmd: parts.cmd,
            network: parts.network,
            limits: parts.limits,
            idempotency_key: parts.idempotency_key,
            handle: parts.handle,
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Starting,
                exited_at: None,
                exit_code: None,
                usage: SessionUsage::default(),
                stdout_tail: RingBuffer::new(parts.tail_bytes),
                stderr_tail: RingBuffer::new(parts.tail_bytes),
                stdout_capped: false,
                stderr_capped: false,
                stdin_capped: false,
                cpu_capped: false,
                stop_requested: false,
                subscribers: HashMap::new(),
                next_subscriber: 0,
            }),
            stdin: tokio::sync::Mutex::new(parts.stdin),
            transcript: parts.transcript,
            control: parts.control,
            resources: Mutex::new(Some(parts.resources)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }

    pub fn network(&self) -> NetworkMode {
        self.network
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// Engine-side name of the sandboxed process, if any.
    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        self.transcript.as_ref()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock();
        self.summarize(&inner)
    }

    fn summarize(&self, inner: &SessionInner) -> SessionSummary {
        let mut usage = inner.usage;
        let end = match (inner.status.is_terminal(), inner.exited_at) {
            (true, Some(exited_at)) => exited_at,
            _ => Utc::now(),
        };
        usage.wall_seconds = (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        SessionSummary {
            session_id: self.id.clone(),
            status: inner.status,
            started_at: self.started_at,
            exited_at: inner.exited_at,
            exit_code: inner.exit_code,
            usage,
        }
    }

    pub fn status_event(&self) -> SessionEvent {
        let summary = self.summary();
        SessionEvent::Status {
            status: summary.status,
            usage: summary.usage,
            ts: Utc::now(),
        }
    }

    /// Copies of the stdout and stderr tails.
    pub fn tails(&self) -> (Vec<u8>, Vec<u8>) {
        let inner = self.inner.lock();
        (inner.stdout_tail.bytes(), inner.stderr_tail.bytes())
    }

    /// Fan an event out to every subscriber. A full subscriber misses the
    /// event; a closed one is dropped.
    pub fn broadcast(&self, event: SessionEvent) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|_, tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Register a subscriber. The first event is always a status snapshot;
    /// a session whose process has exited also yields its exit event and
    /// then ends.
    pub fn subscribe(self: &Arc<Self>, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(2));
        let mut inner = self.inner.lock();
        let summary = self.summarize(&inner);
        let _ = tx.try_send(SessionEvent::Status {
            status: summary.status,
            usage: summary.usage,
            ts: Utc::now(),
        });

        if let Some(code) = inner.exit_code {
            let _ = tx.try_send(SessionEvent::Exit { code, ts: Utc::now() });
            return Subscription {
                session: Arc::clone(self),
                id: None,
                rx,
            };
        }

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, tx);
        Subscription {
            session: Arc::clone(self),
            id: Some(id),
            rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub(crate) fn close_subscribers(&self) {
        self.inner.lock().subscribers.clear();
    }

    pub(crate) fn mark_running(&self) {
        let mut inner = self.inner.lock();
        if inner.status == SessionStatus::Starting {
            inner.status = SessionStatus::Running;
        }
    }

    /// Count a stdout/stderr chunk and keep the part under the cap in the
    /// tail. The first chunk to cross the cap reports the limit.
    pub(crate) fn record_output(&self, dir: Direction, data: &[u8]) -> OutputAccounting {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (counter, capped, tail, kind) = match dir {
            Direction::Stdout => (
                &mut inner.usage.stdout_bytes,
                &mut inner.stdout_capped,
                &mut inner.stdout_tail,
                LimitKind::StdoutBytes,
            ),
            _ => (
                &mut inner.usage.stderr_bytes,
                &mut inner.stderr_capped,
                &mut inner.stderr_tail,
                LimitKind::StderrBytes,
            ),
        };
        let cap = self.limits.cap(kind);
        let before = *counter;
        *counter += data.len() as u64;
        let kept = cap.saturating_sub(before).min(data.len() as u64) as usize;
        tail.write(&data[..kept]);
        let crossed = if *counter > cap && !*capped {
            *capped = true;
            Some((kind, cap))
        } else {
            None
        };
        OutputAccounting { kept, crossed }
    }

    pub fn stdin_remaining(&self) -> u64 {
        let inner = self.inner.lock();
        self.limits.cap(LimitKind::StdinBytes).saturating_sub(inner.usage.stdin_bytes)
    }

    pub(crate) fn add_stdin(&self, written: usize) {
        self.inner.lock().usage.stdin_bytes += written as u64;
    }

    /// True the first time the stdin cap is hit.
    pub(crate) fn flag_stdin_capped(&self) -> bool {
        let mut inner = self.inner.lock();
        !std::mem::replace(&mut inner.stdin_capped, true)
    }

    pub(crate) fn stdin(&self) -> &tokio::sync::Mutex<Option<ChildStdin>> {
        &self.stdin
    }

    /// Close stdin; repeated calls are no-ops.
    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Fold in a live resource sample. Returns the CPU cap the first time it is exceeded.
    pub(crate) fn record_sample(&self, sample: UsageSample) -> Option<u64> {
        let mut inner = self.inner.lock();
        inner.usage.cpu_seconds = inner.usage.cpu_seconds.max(sample.cpu_seconds);
        let mem_mb = sample.memory_bytes / (1024 * 1024);
        inner.usage.mem_peak_mb = inner.usage.mem_peak_mb.max(mem_mb);

        let cap = self.limits.cap(LimitKind::CpuSeconds);
        if inner.usage.cpu_seconds > cap as f64 && !inner.cpu_capped && !inner.status.is_terminal() {
            inner.cpu_capped = true;
            inner.status = SessionStatus::Timeout;
            return Some(cap);
        }
        None
    }

    /// Flip a running session to `timeout`. False when already terminal.
    pub(crate) fn mark_timeout(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.status.is_terminal() {
            return false;
        }
        inner.status = SessionStatus::Timeout;
        true
    }

    /// Record a stop request. False when the session is already terminal.
    pub(crate) fn request_stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.status.is_terminal() {
            return false;
        }
        inner.stop_requested = true;
        true
    }

    /// Stamp exit time and code; a still-running session settles on
    /// `stopped` or `exited`.
    pub(crate) fn finish(&self, code: i32) -> SessionStatus {
        let mut inner = self.inner.lock();
        inner.exited_at = Some(Utc::now());
        inner.exit_code = Some(code);
        if !inner.status.is_terminal() {
            inner.status = if inner.stop_requested {
                SessionStatus::Stopped
            } else {
                SessionStatus::Exited
            };
        }
        inner.status
    }

    pub(crate) fn signal(&self, signal: Signal) {
        let _ = self.control.try_send(signal);
    }

    pub(crate) fn take_resources(&self) -> Option<SessionResources> {
        self.resources.lock().take()
    }
}

/// Live event feed for one subscriber; unsubscribes on drop.
pub struct Subscription {
    session: Arc<Session>,
    id: Option<u64>,
    rx: mpsc::Receiver<SessionEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.session.inner.lock().subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(limits: SessionLimits) -> Arc<Session> {
        let (control, _rx) = mpsc::channel(1);
        Arc::new(Session::new(SessionParts {
            id: "sess_test".to_string(),
            cmd: vec!["cat".to_string()],
            network: NetworkMode::Off,
            limits: limits.normalized(),
            idempotency_key: None,
            handle: None,
            stdin: None,
            transcript: None,
            control,
            resources: SessionResources {
                prepared: PreparedSandbox::new("sess_test", "/nonexistent", "/code"),
                workspace: StagedWorkspace::from_path("/nonexistent"),
            },
            tail_bytes: 8,
        }))
    }

    #[test]
    fn test_output_cap_keeps_prefix_and_reports_once() {
        let session = session(SessionLimits {
            stdout_bytes: 10,
            ..Default::default()
        });
        let first = session.record_output(Direction::Stdout, b"123456");
        assert_eq!(first, OutputAccounting { kept: 6, crossed: None });

        let second = session.record_output(Direction::Stdout, b"abcdefgh");
        assert_eq!(second.kept, 4);
        assert_eq!(second.crossed, Some((LimitKind::StdoutBytes, 10)));

        let third = session.record_output(Direction::Stdout, b"more");
        assert_eq!(third, OutputAccounting { kept: 0, crossed: None });

        let summary = session.summary();
        assert_eq!(summary.usage.stdout_bytes, 18);
        let (tail, _) = session.tails();
        assert_eq!(tail, b"3456abcd");
    }

    #[tokio::test]
    async fn test_subscribe_snapshot_then_exit() {
        let session = session(SessionLimits::default());
        session.mark_running();
        let mut sub = session.subscribe(4);
        assert_eq!(session.subscriber_count(), 1);
        match sub.recv().await.unwrap() {
            SessionEvent::Status { status, .. } => assert_eq!(status, SessionStatus::Running),
            other => panic!("unexpected event {:?}", other),
        }
        drop(sub);
        assert_eq!(session.subscriber_count(), 0);

        assert!(session.request_stop());
        assert_eq!(session.finish(130), SessionStatus::Stopped);
        let mut late = session.subscribe(4);
        assert!(matches!(late.recv().await, Some(SessionEvent::Status { .. })));
        assert!(matches!(late.recv().await, Some(SessionEvent::Exit { code: 130, .. })));
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_events_without_blocking() {
        let session = session(SessionLimits::default());
        session.mark_running();
        let mut idle = session.subscribe(2);

        let fanout = async {
            for i in 0..64 {
                session.broadcast(SessionEvent::Stdout {
                    data_b64: format!("chunk-{}", i),
                    ts: Utc::now(),
                });
            }
        };
        tokio::time::timeout(Duration::from_secs(1), fanout)
            .await
            .expect("broadcast must not wait on a full subscriber");
        assert_eq!(session.subscriber_count(), 1);

        // The buffer holds the snapshot plus one chunk; the rest were dropped.
        assert!(matches!(idle.recv().await, Some(SessionEvent::Status { .. })));
        match idle.recv().await {
            Some(SessionEvent::Stdout { data_b64, .. }) => assert_eq!(data_b64, "chunk-0"),
            other => panic!("unexpected event {:?}", other),
        }

        // Room again: later events are delivered.
        session.broadcast(SessionEvent::Exit { code: 0, ts: Utc::now() });
        assert!(matches!(idle.recv().await, Some(SessionEvent::Exit { code: 0, .. })));
    }

    #[test]
    fn test_wall_time_frozen_after_exit() {
        let session = session(SessionLimits::default());
        session.mark_running();
        assert!(session.mark_timeout());
        assert!(!session.mark_timeout());
        assert_eq!(session.finish(137), SessionStatus::Timeout);
        let first = session.summary().usage.wall_seconds;
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(session.summary().usage.wall_seconds, first);
    }

    #[test]
    fn test_cpu_sample_flips_timeout_once() {
        let session = session(SessionLimits {
            cpu_seconds: 1,
            ..Default::default()
        });
        session.mark_running();
        let sample = UsageSample {
            cpu_seconds: 0.5,
            memory_bytes: 64 * 1024 * 1024,
        };
        assert_eq!(session.record_sample(sample), None);
        let over = UsageSample {
            cpu_seconds: 1.5,
            memory_bytes: 32 * 1024 * 1024,
        };
        assert_eq!(session.record_sample(over), Some(1));
        assert_eq!(session.record_sample(over), None);
        let summary = session.summary();
        assert_eq!(summary.status, SessionStatus::Timeout);
        assert_eq!(summary.usage.mem_peak_mb, 64);
    }
}
