mod error;
mod layout;
mod manifest;
mod settings;
mod tree;
mod version;

pub use error::{ConfigConflict, SourceAttempt, UpgradeError};
pub use layout::{default_state_root, ToolkitLayout};
pub use manifest::ToolkitManifest;
pub use settings::UpgradeSettings;
pub use tree::{
    is_noise_file, CONFIG_DEFAULTS_FILE, CONFIG_FILE, CRITICAL_PATHS, DEFAULTS_DIR,
    MANIFEST_FILE, MIGRATIONS_FILE, REQUIRED_SUBDIRS,
};
pub use version::{BumpKind, VersionInfo};
