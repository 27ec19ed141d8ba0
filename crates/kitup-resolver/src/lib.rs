mod resolver;
mod target;

pub use resolver::{UpdateCheck, VersionResolver};
pub use target::{select_highest_matching, TargetVersion};
