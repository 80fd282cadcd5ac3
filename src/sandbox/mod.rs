pub mod backend;
pub mod process;

pub use backend::{
    exit_code_of, BackendKind, InteractiveRequest, PreparedSandbox, RunOutput, RunRequest,
    SandboxBackend, SharedBackend, SpawnedProcess, UsageSample,
};
pub use process::{shell_join, shell_quote};
