//! Workspace staging: turns an untrusted file payload into a fresh,
//! permission-normalized directory under the shared execution root.

pub mod permissions;
pub mod stager;

pub use stager::{
    normalize_workdir, validate_relative_path, FileSpec, RawFile, StagedWorkspace, StagerPolicy,
    WorkspaceStager,
};
