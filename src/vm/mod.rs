//! VM sandbox manager.
//!
//! Each execution boots a throwaway QEMU guest from a copy-on-write overlay
//! of a shared base image, waits for SSH, copies the workspace in and runs
//! commands over SSH. The overlay, hypervisor and slot are always reclaimed.

pub mod instance;
pub mod limiter;
pub mod manager;
pub mod paths;
pub mod ports;

pub use instance::{qemu_args, LaunchPlan, VmAssets, VmInstance};
pub use limiter::VmSlots;
pub use manager::VmBackend;
pub use paths::resolve_vm_path;
