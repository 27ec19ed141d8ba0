mod fs_ops;
mod local;
mod remote;
mod source_types;
mod staging;

pub use local::{inspect_local_source, validate_local_source, LocalSourceCheck};
pub use remote::RegistryClient;
pub use source_types::{ReleaseFile, ReleaseFiles, ReleaseIndex, VersionSource};
pub use staging::stage_release;

pub(crate) use fs_ops::{safe_relative_path, unique_suffix};
