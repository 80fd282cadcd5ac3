//! Container sandbox runner.
//!
//! Commands run in ephemeral containers with a read-only workspace mount,
//! no capabilities, a PID ceiling and no network unless an operator opted in.

pub mod engine;
pub mod profile;
pub mod runner;

pub use engine::ContainerEngine;
pub use profile::{container_name, valid_env_key, IsolationProfile, NetworkMode, NetworkPolicy};
pub use runner::ContainerBackend;
