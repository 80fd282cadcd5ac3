pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod grading;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod vm;
pub mod workspace;

pub use config::Config;
pub use error::{CodeboxError, Result};
pub use grading::{Grader, JobQueue, WorkerPool};
pub use sandbox::{BackendKind, SandboxBackend, SharedBackend};
pub use server::Server;
pub use session::SessionOrchestrator;
