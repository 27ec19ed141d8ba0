//! Fixed names inside an installed asset tree.

pub const MANIFEST_FILE: &str = "toolkit.toml";
pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULTS_DIR: &str = "defaults";
pub const CONFIG_DEFAULTS_FILE: &str = "defaults/config.toml";
pub const MIGRATIONS_FILE: &str = "migrations.toml";

pub const REQUIRED_SUBDIRS: [&str; 3] = ["templates", "docs", "scripts"];

/// Paths a backup or a finished upgrade must contain.
pub const CRITICAL_PATHS: [&str; 4] = [MANIFEST_FILE, "templates", "docs", "scripts"];

const NOISE_FILE_NAMES: [&str; 3] = [".DS_Store", "Thumbs.db", "desktop.ini"];

/// Files the operating system drops into directories on its own. They are
/// never classified, counted, or copied.
pub fn is_noise_file(file_name: &str) -> bool {
    NOISE_FILE_NAMES.contains(&file_name)
}
