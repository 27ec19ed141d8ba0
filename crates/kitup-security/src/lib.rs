mod checksum;
mod digest;

pub use checksum::{sha256_hex, verify_sha256, verify_sha256_file, verify_sha256_reader};
pub use digest::{normalize_relative_path, tree_digest, TreeDigest};

#[cfg(test)]
mod tests;
