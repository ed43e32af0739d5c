//! Physical layout shared by every driver: `<root>/<first 3 chars>/<locator>`.

use std::path::{Path, PathBuf};

use cdn_types::Locator;

/// Filesystem path of an object under `root`.
pub fn object_path(root: &Path, locator: &Locator) -> PathBuf {
    root.join(locator.shard_prefix()).join(locator.as_str())
}

/// Shard directory holding the object.
pub fn shard_dir(root: &Path, locator: &Locator) -> PathBuf {
    root.join(locator.shard_prefix())
}

/// `/`-separated key for key-value and remote backends. An empty prefix is
/// allowed and yields `<shard>/<locator>`.
pub fn object_key(prefix: &str, locator: &Locator) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", locator.shard_prefix(), locator.as_str())
    } else {
        format!("{prefix}/{}/{}", locator.shard_prefix(), locator.as_str())
    }
}

/// Shard key for remote backends, matching [`object_key`].
pub fn shard_key(prefix: &str, locator: &Locator) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        locator.shard_prefix().to_string()
    } else {
        format!("{prefix}/{}", locator.shard_prefix())
    }
}

/// Staging name for an in-flight write. Never a valid locator, so it cannot
/// collide with a published object.
pub fn staging_name(locator: &Locator) -> String {
    format!(".{}.{}.partial", locator.as_str(), uuid::Uuid::now_v7().simple())
}

/// Whether a configured sub-path stays inside its root: relative, no `..`.
pub fn is_contained(sub_path: &str) -> bool {
    !sub_path.starts_with('/')
        && !sub_path.contains('\\')
        && sub_path.split('/').all(|c| c != ".." && c != ".")
}
