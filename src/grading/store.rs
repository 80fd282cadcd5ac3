//! Grading persistence boundary.
//!
//! Submissions, test cases and results live in an external relational store;
//! the worker pool only sees this trait. `MemoryStore` backs tests and the
//! standalone server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CodeboxError, Result};
use crate::workspace::RawFile;

pub type SubmissionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub id: SubmissionId,
    pub assignment_id: Uuid,
    pub files: Vec<RawFile>,
    /// Explicit entry file; detected from the files when absent.
    pub entry_point: Option<String>,
    pub status: SubmissionStatus,
}

impl Submission {
    pub fn new(assignment_id: Uuid, files: Vec<RawFile>) -> Self {
        Self {
            id: Uuid::new_v4(),
            assignment_id,
            files,
            entry_point: None,
            status: SubmissionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: Uuid,
    pub stdin: String,
    pub expected_stdout: String,
    pub time_limit: Duration,
}

impl TestCase {
    pub fn new(stdin: impl Into<String>, expected_stdout: impl Into<String>, time_limit: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            stdin: stdin.into(),
            expected_stdout: expected_stdout.into(),
            time_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    WrongOutput,
    TimeLimitExceeded,
    RuntimeError,
}

/// Static-analysis fact attached to a failing result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub submission_id: SubmissionId,
    pub test_case_id: Uuid,
    pub status: Verdict,
    pub actual_stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub runtime_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
}

#[async_trait]
pub trait GradingStore: Send + Sync {
    async fn get_submission(&self, id: SubmissionId) -> Result<Submission>;

    async fn update_submission_status(&self, id: SubmissionId, status: SubmissionStatus) -> Result<()>;

    async fn list_test_cases(&self, submission: &Submission) -> Result<Vec<TestCase>>;

    async fn create_result(&self, result: TestResult) -> Result<()>;
}

/// External producer of static-analysis findings (banned tools and similar).
#[async_trait]
pub trait FindingsSource: Send + Sync {
    async fn findings(&self, submission: &Submission, workspace: &Path) -> Vec<Finding>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    submissions: RwLock<HashMap<SubmissionId, Submission>>,
    test_cases: RwLock<HashMap<Uuid, Vec<TestCase>>>,
    results: RwLock<Vec<TestResult>>,
    broken_assignments: RwLock<Vec<Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_submission(&self, submission: Submission) -> SubmissionId {
        let id = submission.id;
        self.submissions.write().await.insert(id, submission);
        id
    }

    pub async fn set_test_cases(&self, assignment_id: Uuid, cases: Vec<TestCase>) {
        self.test_cases.write().await.insert(assignment_id, cases);
    }

    /// Make `list_test_cases` fail for an assignment.
    pub async fn break_assignment(&self, assignment_id: Uuid) {
        self.broken_assignments.write().await.push(assignment_id);
    }

    pub async fn status_of(&self, id: SubmissionId) -> Option<SubmissionStatus> {
        self.submissions.read().await.get(&id).map(|s| s.status)
    }

    pub async fn results_for(&self, id: SubmissionId) -> Vec<TestResult> {
        self.results
            .read()
            .await
            .iter()
            .filter(|r| r.submission_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GradingStore for MemoryStore {
    async fn get_submission(&self, id: SubmissionId) -> Result<Submission> {
        self.submissions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CodeboxError::not_found(format!("submission {}", id)))
    }

    async fn update_submission_status(&self, id: SubmissionId, status: SubmissionStatus) -> Result<()> {
        let mut submissions = self.submissions.write().await;
        let submission = submissions
            .get_mut(&id)
            .ok_or_else(|| CodeboxError::not_found(format!("submission {}", id)))?;
        submission.status = status;
        Ok(())
    }

    async fn list_test_cases(&self, submission: &Submission) -> Result<Vec<TestCase>> {
        if self.broken_assignments.read().await.contains(&submission.assignment_id) {
            return Err(CodeboxError::store(format!(
                "test cases for assignment {} unavailable",
                submission.assignment_id
            )));
        }
        Ok(self
            .test_cases
            .read()
            .await
            .get(&submission.assignment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_result(&self, result: TestResult) -> Result<()> {
        self.results.write().await.push(result);
        Ok(())
    }
}
