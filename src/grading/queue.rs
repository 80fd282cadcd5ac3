use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::judge::{build_command, detect_entry_point, judge, Judgement};
use super::store::{
    Finding, FindingsSource, GradingStore, Submission, SubmissionId, SubmissionStatus, TestCase,
    TestResult, Verdict,
};
use crate::container::NetworkMode;
use crate::error::{CodeboxError, Result};
use crate::sandbox::{PreparedSandbox, RunRequest, SharedBackend};
use crate::workspace::{StagedWorkspace, WorkspaceStager};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub submission_id: SubmissionId,
}

impl Job {
    pub fn new(submission_id: SubmissionId) -> Self {
        Self { submission_id }
    }
}

pub type JobReceiver = mpsc::Receiver<Job>;

/// Bounded FIFO of grading jobs. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    capacity: usize,
}

impl JobQueue {
    pub fn bounded(capacity: usize) -> (Self, JobReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }

    /// Wait for room in the queue.
    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| CodeboxError::internal("grading queue closed"))
    }

    /// Enqueue without waiting; a full queue is reported to the caller.
    pub fn try_enqueue(&self, job: Job) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CodeboxError::resource_exceeded("grading queue full"),
            mpsc::error::TrySendError::Closed(_) => CodeboxError::internal("grading queue closed"),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

/// Runs one submission end to end: stage, prepare, run every test case, record.
pub struct Grader {
    store: Arc<dyn GradingStore>,
    backend: SharedBackend,
    stager: WorkspaceStager,
    findings: Option<Arc<dyn FindingsSource>>,
}

impl Grader {
    pub fn new(store: Arc<dyn GradingStore>, backend: SharedBackend, stager: WorkspaceStager) -> Self {
        Self {
            store,
            backend,
            stager,
            findings: None,
        }
    }

    pub fn with_findings(mut self, source: Arc<dyn FindingsSource>) -> Self {
        self.findings = Some(source);
        self
    }

    /// Grade a submission and return the final status written to the store.
    pub async fn grade(&self, id: SubmissionId) -> Result<SubmissionStatus> {
        let submission = self.store.get_submission(id).await?;
        self.store
            .update_submission_status(id, SubmissionStatus::Running)
            .await?;
        info!("⚙️ Grading submission {} on {} backend", id, self.backend.kind());

        let status = match self.grade_submission(&submission).await {
            Ok(status) => status,
            Err(e) => {
                warn!(submission = %id, "Grading aborted: {}", e);
                SubmissionStatus::Failed
            }
        };
        self.store.update_submission_status(id, status).await?;
        info!("Submission {} finished: {:?}", id, status);
        Ok(status)
    }

    async fn grade_submission(&self, submission: &Submission) -> Result<SubmissionStatus> {
        let tests = self.store.list_test_cases(submission).await?;
        let entry = submission
            .entry_point
            .clone()
            .or_else(|| detect_entry_point(&submission.files))
            .ok_or_else(|| CodeboxError::bad_request("no python entry point in submission"))?;

        let workspace = self
            .stager
            .stage_files_detached("job-", submission.files.clone())
            .await?;
        let outcome = self.run_tests(submission, &entry, &workspace, &tests).await;
        workspace.remove().await;
        outcome
    }

    async fn run_tests(
        &self,
        submission: &Submission,
        entry: &str,
        workspace: &StagedWorkspace,
        tests: &[TestCase],
    ) -> Result<SubmissionStatus> {
        let prepared = self.backend.prepare(workspace, NetworkMode::Off).await?;
        let mut all_passed = true;
        let mut findings: Option<Vec<Finding>> = None;

        for case in tests {
            let judgement = self.run_one(&prepared, entry, case).await;
            if judgement.verdict != Verdict::Passed {
                all_passed = false;
                if findings.is_none() {
                    findings = Some(self.collect_findings(submission, workspace).await);
                }
            }
            let result = TestResult {
                submission_id: submission.id,
                test_case_id: case.id,
                status: judgement.verdict,
                actual_stdout: judgement.stdout,
                stderr: judgement.stderr,
                exit_code: judgement.exit_code,
                runtime_ms: judgement.runtime.as_millis() as u64,
                findings: match judgement.verdict {
                    Verdict::Passed => Vec::new(),
                    _ => findings.clone().unwrap_or_default(),
                },
            };
            if let Err(e) = self.store.create_result(result).await {
                error!(submission = %submission.id, test_case = %case.id, "Failed to record result: {}", e);
            }
        }

        self.backend.teardown(prepared).await;
        Ok(if all_passed {
            SubmissionStatus::Completed
        } else {
            SubmissionStatus::Failed
        })
    }

    async fn run_one(
        &self,
        prepared: &PreparedSandbox,
        entry: &str,
        case: &TestCase,
    ) -> Judgement {
        let request = RunRequest::new(build_command(entry), case.time_limit).with_stdin(case.stdin.as_bytes());
        match self.backend.run(prepared, &request).await {
            Ok(output) => judge(&output, case.time_limit, &case.expected_stdout),
            Err(e) => {
                warn!(sandbox = %prepared.id, "Test execution failed: {}", e);
                Judgement {
                    verdict: Verdict::RuntimeError,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: -1,
                    runtime: Duration::ZERO,
                }
            }
        }
    }

    async fn collect_findings(&self, submission: &Submission, workspace: &StagedWorkspace) -> Vec<Finding> {
        match &self.findings {
            Some(source) => source.findings(submission, workspace.path()).await,
            None => Vec::new(),
        }
    }
}

/// Fixed set of workers pulling from one shared receiver.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` tasks. They exit once every `JobQueue` handle is dropped
    /// and the queue has drained.
    pub fn start(workers: usize, receiver: JobReceiver, grader: Arc<Grader>) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let grader = Arc::clone(&grader);
                tokio::spawn(async move { worker_loop(worker, receiver, grader).await })
            })
            .collect();
        info!("🚀 Started {} grading workers", workers.max(1));
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn worker_loop(worker: usize, receiver: Arc<Mutex<JobReceiver>>, grader: Arc<Grader>) {
    loop {
        let job = { receiver.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        // A panicking job must not take the worker down with it.
        let task_grader = Arc::clone(&grader);
        let outcome = tokio::spawn(async move { task_grader.grade(job.submission_id).await }).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(worker, submission = %job.submission_id, "Grading failed: {}", e),
            Err(e) => error!(worker, submission = %job.submission_id, "Grading task panicked: {}", e),
        }
    }
    info!(worker, "Grading worker stopped");
}
