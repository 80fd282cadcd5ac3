//! Worker pool grading scenarios with canned sandbox output.

mod common;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use codebox::grading::{
    Finding, FindingsSource, Grader, GradingStore, Job, JobQueue, MemoryStore, Submission, SubmissionStatus,
    TestCase, Verdict, WorkerPool,
};
use codebox::workspace::{RawFile, StagerPolicy, WorkspaceStager};

use common::CannedBackend;

struct BannedImports;

#[async_trait]
impl FindingsSource for BannedImports {
    async fn findings(&self, _submission: &Submission, workspace: &Path) -> Vec<Finding> {
        assert!(workspace.join("main.py").exists());
        vec![Finding {
            rule: "banned-import".to_string(),
            message: "os.system is not allowed".to_string(),
            line: Some(1),
        }]
    }
}

fn stager(root: &Path) -> WorkspaceStager {
    WorkspaceStager::new(root.join("exec"), StagerPolicy::default())
}

fn submission(assignment: Uuid) -> Submission {
    Submission::new(assignment, vec![RawFile::new("main.py", "print(int(input()) * 2)\n")])
}

#[tokio::test]
async fn test_mixed_results_fail_submission() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let assignment = Uuid::new_v4();
    store
        .set_test_cases(
            assignment,
            vec![
                TestCase::new("1", "2", Duration::from_secs(2)),
                TestCase::new("2", "4", Duration::from_secs(2)),
            ],
        )
        .await;
    let id = store.insert_submission(submission(assignment)).await;

    let backend = CannedBackend::default()
        .reply("1", "2\n===RUNTIME_MS=== 12\n", 0)
        .reply("2", "5\n===RUNTIME_MS=== 9\n", 0);
    let grader = Grader::new(store.clone(), Arc::new(backend), stager(dir.path())).with_findings(Arc::new(BannedImports));

    let status = grader.grade(id).await.unwrap();
    assert_eq!(status, SubmissionStatus::Failed);
    assert_eq!(store.status_of(id).await, Some(SubmissionStatus::Failed));

    let results = store.results_for(id).await;
    assert_eq!(results.len(), 2);
    let passed = results.iter().find(|r| r.status == Verdict::Passed).unwrap();
    assert_eq!(passed.actual_stdout, "2");
    assert_eq!(passed.runtime_ms, 12);
    assert!(passed.findings.is_empty());

    let wrong = results.iter().find(|r| r.status == Verdict::WrongOutput).unwrap();
    assert_eq!(wrong.actual_stdout, "5");
    assert_eq!(wrong.findings.len(), 1);
    assert_eq!(wrong.findings[0].rule, "banned-import");

    // The per-job workspace is gone.
    assert_eq!(std::fs::read_dir(dir.path().join("exec")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_all_passing_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let assignment = Uuid::new_v4();
    store
        .set_test_cases(assignment, vec![TestCase::new("3", "6", Duration::from_secs(2))])
        .await;
    let id = store.insert_submission(submission(assignment)).await;

    let backend = CannedBackend::default().reply("3", "6\n===RUNTIME_MS=== 4\n", 0);
    let grader = Grader::new(store.clone(), Arc::new(backend), stager(dir.path()));

    assert_eq!(grader.grade(id).await.unwrap(), SubmissionStatus::Completed);
    assert_eq!(store.results_for(id).await[0].status, Verdict::Passed);
}

#[tokio::test]
async fn test_time_limit_and_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let assignment = Uuid::new_v4();
    store
        .set_test_cases(
            assignment,
            vec![
                TestCase::new("slow", "x", Duration::from_millis(100)),
                TestCase::new("crash", "x", Duration::from_secs(2)),
                TestCase::new("missing", "x", Duration::from_secs(2)),
            ],
        )
        .await;
    let id = store.insert_submission(submission(assignment)).await;

    let backend = CannedBackend::default()
        .reply("slow", "x\n===RUNTIME_MS=== 250\n", 0)
        .reply("crash", "Traceback\n===RUNTIME_MS=== 3\n", 1);
    let grader = Grader::new(store.clone(), Arc::new(backend), stager(dir.path()));

    assert_eq!(grader.grade(id).await.unwrap(), SubmissionStatus::Failed);
    let results = store.results_for(id).await;
    let verdicts: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        verdicts,
        vec![Verdict::TimeLimitExceeded, Verdict::RuntimeError, Verdict::RuntimeError]
    );
    // Backend failures are recorded, not fatal.
    assert_eq!(results[2].exit_code, -1);
    assert!(results[2].stderr.contains("no canned reply"));
}

#[tokio::test]
async fn test_unloadable_tests_fail_without_results() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let assignment = Uuid::new_v4();
    store.break_assignment(assignment).await;
    let id = store.insert_submission(submission(assignment)).await;

    let grader = Grader::new(store.clone(), Arc::new(CannedBackend::default()), stager(dir.path()));
    assert_eq!(grader.grade(id).await.unwrap(), SubmissionStatus::Failed);
    assert!(store.results_for(id).await.is_empty());
}

#[tokio::test]
async fn test_missing_entry_point_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let assignment = Uuid::new_v4();
    store
        .set_test_cases(assignment, vec![TestCase::new("1", "2", Duration::from_secs(1))])
        .await;
    let id = store
        .insert_submission(Submission::new(assignment, vec![RawFile::new("README.md", "hi")]))
        .await;

    let grader = Grader::new(store.clone(), Arc::new(CannedBackend::default()), stager(dir.path()));
    assert_eq!(grader.grade(id).await.unwrap(), SubmissionStatus::Failed);
    assert!(store.results_for(id).await.is_empty());
}

#[tokio::test]
async fn test_worker_pool_drains_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let assignment = Uuid::new_v4();
    store
        .set_test_cases(assignment, vec![TestCase::new("1", "2", Duration::from_secs(2))])
        .await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(store.insert_submission(submission(assignment)).await);
    }

    let backend = CannedBackend::default().reply("1", "2\n===RUNTIME_MS=== 1\n", 0);
    let grader = Arc::new(Grader::new(store.clone(), Arc::new(backend), stager(dir.path())));
    let (queue, receiver) = JobQueue::bounded(10);
    let pool = WorkerPool::start(2, receiver, grader);
    assert_eq!(pool.size(), 2);

    for id in &ids {
        queue.enqueue(Job::new(*id)).await.unwrap();
    }
    drop(queue);
    tokio::time::timeout(Duration::from_secs(10), pool.join())
        .await
        .expect("workers should exit once the queue drains");

    for id in ids {
        assert_eq!(store.status_of(id).await, Some(SubmissionStatus::Completed));
        assert_eq!(store.get_submission(id).await.unwrap().status, SubmissionStatus::Completed);
    }
    println!("✅ Worker pool graded every queued submission");
}
