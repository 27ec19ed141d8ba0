use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::*;

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

fn scratch_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "kitup-security-{label}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("must create scratch dir");
    dir
}

#[test]
fn sha256_of_empty_input() {
    assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    assert!(verify_sha256(b"", &EMPTY_SHA256.to_ascii_uppercase()));
    assert!(!verify_sha256(b"x", EMPTY_SHA256));
}

#[test]
fn verify_file_digest() {
    let dir = scratch_dir("file");
    let path = dir.join("empty.txt");
    fs::write(&path, b"").expect("must write file");
    assert!(verify_sha256_file(&path, EMPTY_SHA256).expect("must hash"));
    assert!(verify_sha256_file(&dir.join("missing"), EMPTY_SHA256).is_err());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn tree_digest_tracks_content_and_skips_subtrees() {
    let dir = scratch_dir("tree");
    fs::create_dir_all(dir.join("docs/guides")).expect("must create docs");
    fs::create_dir_all(dir.join("cache")).expect("must create cache");
    fs::write(dir.join("docs/guides/intro.md"), "hello").expect("must write doc");
    fs::write(dir.join("cache/blob.bin"), "volatile").expect("must write cache");

    let skip_cache = |relative: &str| relative == "cache";
    let first = tree_digest(&dir, skip_cache).expect("must digest");
    assert_eq!(first.file_count(), 1);
    assert!(first.files.contains_key("docs/guides/intro.md"));

    fs::write(dir.join("cache/blob.bin"), "changed").expect("must rewrite cache");
    let second = tree_digest(&dir, skip_cache).expect("must digest");
    assert_eq!(first.digest, second.digest);

    fs::write(dir.join("docs/guides/intro.md"), "hello!").expect("must rewrite doc");
    let third = tree_digest(&dir, skip_cache).expect("must digest");
    assert_ne!(first.digest, third.digest);

    let _ = fs::remove_dir_all(&dir);
}
