mod backup;
mod exclude;
mod files;
mod fs_utils;
mod lock;
mod merge;
mod migrations;
mod strategy;

pub use backup::{
    Backup, BackupManager, BackupMetadata, BackupValidation, ListedBackup, RestoreOptions,
    RestoreOutcome, BACKUP_METADATA_FILE, BACKUP_TREE_DIR,
};
pub use exclude::PathExclusions;
pub use files::{ApplySummary, FileMerger, FilePlan, PlannedMerge};
pub use fs_utils::{copy_tree, list_tree_files, remove_path_if_exists};
pub use lock::{read_lock_owner, LockOwner, UpgradeLock};
pub use merge::{merge_config, merge_config_str, MergedConfig, DOCUMENT_KEY};
pub use migrations::{
    run_migrations, Migration, MigrationCatalog, MigrationContext, MigrationDescriptor,
    MigrationFn, MigrationRegistry,
};
pub use strategy::{FileStrategy, StrategyRule, StrategyTable};
