//! Asynchronous grading: a bounded job queue feeding a fixed worker pool.
//!
//! Each job stages a submission once, prepares one sandbox for it, runs
//! every test case with its own time limit and records a verdict per case.

pub mod judge;
pub mod queue;
pub mod store;

pub use judge::{build_command, classify, detect_entry_point, judge, split_runtime_marker, Judgement, RUNTIME_MARKER};
pub use queue::{Grader, Job, JobQueue, JobReceiver, WorkerPool, DEFAULT_QUEUE_CAPACITY};
pub use store::{
    Finding, FindingsSource, GradingStore, MemoryStore, Submission, SubmissionId, SubmissionStatus,
    TestCase, TestResult, Verdict,
};
