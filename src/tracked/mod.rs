// src/tracked/mod.rs

//! Tracked items: the dependency/target kinds the engine can fingerprint.
//!
//! Every dependency or target of a task is a [`TrackedItem`]. An item knows
//! three things:
//!
//! - whether the thing it represents currently [`exists`](TrackedItem::exists),
//! - a [`fingerprint`](TrackedItem::fingerprint) summarising its current
//!   state, comparable against the history store,
//! - a globally unique [`key`](TrackedItem::key) used for history lookups.
//!
//! Keys are prefixed per kind (`file:`, `dir:`, ...) so that two items of
//! different kinds can never collide in the store.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, RundagError};

/// Globally unique identifier of a tracked item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey(pub String);

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque comparable summary of an item's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprinting knobs resolved from the run configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintPolicy {
    /// `File` items larger than this many MB skip the content checksum and
    /// fall back to size + mtime, as if declared huge.
    pub huge_file_threshold_mb: Option<u64>,
}

/// Probe closure for [`TrackedItem::Function`] items.
pub type ProbeFn = dyn Fn() -> String + Send + Sync;

/// A dependency or target the engine can check for existence and change.
#[derive(Clone)]
pub enum TrackedItem {
    /// A file small enough that reading all of it for a checksum is fine.
    File(PathBuf),
    /// A file large enough that checksumming is cost-prohibitive; freshness
    /// is judged by size + mtime only.
    HugeFile(PathBuf),
    /// A directory; changed when its listing or any entry's size/mtime
    /// changes.
    Directory(PathBuf),
    /// A binary or script resolved via `$PATH`; fingerprinted by the output
    /// of a version-probe command.
    Executable {
        path: PathBuf,
        version_command: String,
    },
    /// An arbitrary probe; re-runs dependents whenever the probe's output
    /// changes. Useful for database lookups or API calls.
    Function { name: String, probe: Arc<ProbeFn> },
    /// An in-memory key-value pair scoped to the run; invalidates dependents
    /// when a run parameter changes.
    Variable {
        namespace: String,
        name: String,
        value: String,
    },
    /// A glob over files, treated as a single dependency. Expanded to a
    /// concrete match list when the graph is validated.
    Pattern {
        pattern: String,
        matches: Vec<PathBuf>,
    },
}

impl TrackedItem {
    /// Translate a bare string into the appropriate item, the way `add_task`
    /// normalizes its `depends`/`targets` arguments: strings ending in `/`
    /// become directories, everything else a file.
    pub fn auto(s: &str) -> Self {
        if s.ends_with('/') {
            TrackedItem::directory(s)
        } else {
            TrackedItem::file(s)
        }
    }

    /// Parse a config-file item spec. Bare paths go through [`auto`];
    /// `glob:`, `exe:`, `bigfile:`, `dir:` and `file:` prefixes select the
    /// other kinds explicitly.
    pub fn parse_spec(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("glob:") {
            Ok(TrackedItem::pattern(rest))
        } else if let Some(rest) = s.strip_prefix("exe:") {
            TrackedItem::executable(rest)
        } else if let Some(rest) = s.strip_prefix("bigfile:") {
            Ok(TrackedItem::huge_file(rest))
        } else if let Some(rest) = s.strip_prefix("dir:") {
            Ok(TrackedItem::directory(rest))
        } else if let Some(rest) = s.strip_prefix("file:") {
            Ok(TrackedItem::file(rest))
        } else {
            Ok(TrackedItem::auto(s))
        }
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        TrackedItem::File(absolutize(path.as_ref()))
    }

    pub fn huge_file(path: impl AsRef<Path>) -> Self {
        TrackedItem::HugeFile(absolutize(path.as_ref()))
    }

    pub fn directory(path: impl AsRef<Path>) -> Self {
        TrackedItem::Directory(absolutize(path.as_ref()))
    }

    /// Resolve `name` against `$PATH` and track the resulting binary.
    ///
    /// A binary that cannot be located is an error right here, at
    /// graph-build time, not mid-run.
    pub fn executable(name: &str) -> Result<Self> {
        Self::executable_with_probe(name, "{} --version")
    }

    /// Like [`executable`](Self::executable), with a custom version-probe
    /// command. `{}` in the template is replaced with the resolved path.
    pub fn executable_with_probe(name: &str, version_command: &str) -> Result<Self> {
        let path = find_on_path(name)
            .ok_or_else(|| RundagError::UnresolvedExecutable(name.to_string()))?;
        let version_command = version_command.replace("{}", &path.to_string_lossy());
        Ok(TrackedItem::Executable {
            path,
            version_command,
        })
    }

    pub fn function(name: impl Into<String>, probe: impl Fn() -> String + Send + Sync + 'static) -> Self {
        TrackedItem::Function {
            name: name.into(),
            probe: Arc::new(probe),
        }
    }

    pub fn variable(
        namespace: impl Into<String>,
        name: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        TrackedItem::Variable {
            namespace: namespace.into(),
            name: name.into(),
            value: value.to_string(),
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        TrackedItem::Pattern {
            pattern: pattern.into(),
            matches: Vec::new(),
        }
    }

    /// Unique key for history-store lookups, stable across runs.
    pub fn key(&self) -> ItemKey {
        let s = match self {
            TrackedItem::File(p) => format!("file:{}", p.display()),
            TrackedItem::HugeFile(p) => format!("bigfile:{}", p.display()),
            TrackedItem::Directory(p) => format!("dir:{}", p.display()),
            TrackedItem::Executable { path, .. } => format!("exe:{}", path.display()),
            TrackedItem::Function { name, .. } => format!("fn:{name}"),
            TrackedItem::Variable {
                namespace, name, ..
            } => format!("var:{namespace}:{name}"),
            TrackedItem::Pattern { pattern, .. } => format!("glob:{pattern}"),
        };
        ItemKey(s)
    }

    /// Whether the thing this item represents currently exists.
    pub fn exists(&self) -> bool {
        match self {
            TrackedItem::File(p) | TrackedItem::HugeFile(p) => p.exists(),
            TrackedItem::Directory(p) => p.is_dir(),
            TrackedItem::Executable { path, .. } => path.exists(),
            // In-memory items cannot be missing.
            TrackedItem::Function { .. } | TrackedItem::Variable { .. } => true,
            TrackedItem::Pattern { pattern, .. } => !glob_matches(pattern).is_empty(),
        }
    }

    /// Whether this item must already exist when it is used as a dependency
    /// that no task produces.
    pub fn must_preexist(&self) -> bool {
        !matches!(
            self,
            TrackedItem::Function { .. } | TrackedItem::Variable { .. }
        )
    }

    /// Expand pattern items to their concrete match list. Called once at
    /// graph validation so the graph is stable once built.
    pub fn resolve(&mut self) {
        if let TrackedItem::Pattern { pattern, matches } = self {
            *matches = glob_matches(pattern);
            debug!(pattern = %pattern, count = matches.len(), "resolved glob pattern");
        }
    }

    /// Compute the current fingerprint.
    ///
    /// Called once per item per task evaluation per run, so it must stay
    /// cheap; the huge-file variant exists exactly because checksumming
    /// multi-gigabyte files at this frequency is not.
    pub fn fingerprint(&self, policy: &FingerprintPolicy) -> Result<Fingerprint> {
        let fp = match self {
            TrackedItem::File(p) => {
                let checksum = match policy.huge_file_threshold_mb {
                    Some(mb) => file_size(p)? <= mb * 1024 * 1024,
                    None => true,
                };
                stat_fingerprint(p, checksum)?
            }
            TrackedItem::HugeFile(p) => stat_fingerprint(p, false)?,
            TrackedItem::Directory(p) => directory_fingerprint(p)?,
            TrackedItem::Executable {
                path,
                version_command,
            } => executable_fingerprint(path, version_command)?,
            TrackedItem::Function { probe, .. } => probe(),
            TrackedItem::Variable { value, .. } => value.clone(),
            TrackedItem::Pattern { pattern, matches } => {
                // Resolved patterns fingerprint their snapshot; unresolved
                // ones (library callers skipping validate) glob on the fly.
                if matches.is_empty() {
                    paths_fingerprint(&glob_matches(pattern))?
                } else {
                    paths_fingerprint(matches)?
                }
            }
        };
        Ok(Fingerprint(fp))
    }
}

impl fmt::Debug for TrackedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackedItem({})", self.key())
    }
}

impl PartialEq for TrackedItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TrackedItem {}

/// Locate a binary: an existing path is taken as-is, otherwise each entry
/// of `$PATH` is searched.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.exists() {
        return Some(absolutize(direct));
    }
    if name.contains(std::path::MAIN_SEPARATOR) {
        return None;
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn glob_matches(pattern: &str) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(|p| p.ok()).map(|p| absolutize(&p)).collect(),
        Err(_) => Vec::new(),
    };
    out.sort();
    out
}

fn file_size(path: &Path) -> Result<u64> {
    let md = std::fs::metadata(path)
        .with_context(|| format!("stat'ing {path:?}"))
        .map_err(RundagError::Other)?;
    Ok(md.len())
}

fn mtime_nanos(md: &std::fs::Metadata) -> u128 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// size + mtime, optionally followed by a content checksum.
fn stat_fingerprint(path: &Path, checksum: bool) -> Result<String> {
    let md = std::fs::metadata(path)
        .with_context(|| format!("stat'ing {path:?}"))
        .map_err(RundagError::Other)?;
    let base = format!("{}:{}", md.len(), mtime_nanos(&md));
    if checksum {
        let hash = compute_file_hash(path)?;
        Ok(format!("{base}:{hash}"))
    } else {
        Ok(base)
    }
}

/// Compute the blake3 hash of a single file's contents.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file = File::open(path)
        .with_context(|| format!("opening file for hashing: {path:?}"))
        .map_err(RundagError::Other)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash the sorted directory listing plus each entry's size and mtime.
fn directory_fingerprint(path: &Path) -> Result<String> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("listing directory {path:?}"))
        .map_err(RundagError::Other)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    hash_entries(&entries)
}

/// Aggregate fingerprint over a sorted list of paths.
fn paths_fingerprint(paths: &[PathBuf]) -> Result<String> {
    hash_entries(paths)
}

fn hash_entries(paths: &[PathBuf]) -> Result<String> {
    let mut hasher = Hasher::new();
    for p in paths {
        hasher.update(p.to_string_lossy().as_bytes());
        if let Ok(md) = std::fs::metadata(p) {
            hasher.update(&md.len().to_le_bytes());
            hasher.update(&mtime_nanos(&md).to_le_bytes());
        }
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Version-probe output if the probe succeeds, else stat + checksum.
fn executable_fingerprint(path: &Path, version_command: &str) -> Result<String> {
    match probe_version(version_command) {
        Some(version) => {
            let mut hasher = Hasher::new();
            hasher.update(version.as_bytes());
            Ok(format!("v:{}", hasher.finalize().to_hex()))
        }
        None => {
            debug!(path = ?path, "version probe failed; falling back to stat fingerprint");
            stat_fingerprint(path, true)
        }
    }
}

fn probe_version(version_command: &str) -> Option<String> {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(version_command)
        .output()
        .ok()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Compare an item's current fingerprint against a stored one.
///
/// `None` for `stored` (never recorded) always counts as different.
pub fn is_different(
    item: &TrackedItem,
    stored: Option<&Fingerprint>,
    policy: &FingerprintPolicy,
) -> bool {
    let Some(stored) = stored else {
        debug!(key = %item.key(), "item changed: never recorded in history");
        return true;
    };
    match item.fingerprint(policy) {
        Ok(current) => {
            let different = &current != stored;
            if different {
                debug!(key = %item.key(), "item changed: fingerprint differs from history");
            }
            different
        }
        Err(err) => {
            debug!(key = %item.key(), error = %err, "item changed: fingerprint errored");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn policy() -> FingerprintPolicy {
        FingerprintPolicy::default()
    }

    #[test]
    fn file_and_huge_file_have_distinct_keys() {
        let a = TrackedItem::file("/tmp/x.txt");
        let b = TrackedItem::huge_file("/tmp/x.txt");
        assert_ne!(a.key(), b.key());
        assert!(a.key().0.starts_with("file:"));
        assert!(b.key().0.starts_with("bigfile:"));
    }

    #[test]
    fn auto_maps_trailing_slash_to_directory() {
        assert!(matches!(TrackedItem::auto("data/"), TrackedItem::Directory(_)));
        assert!(matches!(TrackedItem::auto("data.txt"), TrackedItem::File(_)));
    }

    #[test]
    fn file_fingerprint_tracks_content_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "one").unwrap();
        let item = TrackedItem::file(&path);

        let before = item.fingerprint(&policy()).unwrap();
        fs::write(&path, "two").unwrap();
        let after = item.fingerprint(&policy()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn directory_fingerprint_tracks_new_entries() {
        let dir = TempDir::new().unwrap();
        let item = TrackedItem::directory(dir.path());

        let before = item.fingerprint(&policy()).unwrap();
        fs::write(dir.path().join("new.txt"), "x").unwrap();
        let after = item.fingerprint(&policy()).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn variable_fingerprint_is_its_value() {
        let item = TrackedItem::variable("ns", "threads", 8);
        assert_eq!(item.fingerprint(&policy()).unwrap().0, "8");
        assert_eq!(item.key().0, "var:ns:threads");
        assert!(item.exists());
    }

    #[test]
    fn function_fingerprint_calls_the_probe() {
        let item = TrackedItem::function("lookup", || "42".to_string());
        assert_eq!(item.fingerprint(&policy()).unwrap().0, "42");
        assert!(!item.must_preexist());
    }

    #[test]
    fn pattern_resolves_to_sorted_matches() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.csv"), "").unwrap();
        fs::write(dir.path().join("a.csv"), "").unwrap();
        fs::write(dir.path().join("c.txt"), "").unwrap();

        let mut item = TrackedItem::pattern(format!("{}/*.csv", dir.path().display()));
        item.resolve();

        match &item {
            TrackedItem::Pattern { matches, .. } => {
                assert_eq!(matches.len(), 2);
                assert!(matches[0] < matches[1]);
            }
            _ => unreachable!(),
        }
        assert!(item.exists());
    }

    #[test]
    fn missing_executable_is_an_error() {
        let err = TrackedItem::executable("definitely-not-a-real-binary-xyz");
        assert!(matches!(err, Err(RundagError::UnresolvedExecutable(_))));
    }

    #[test]
    fn is_different_treats_missing_history_as_changed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "one").unwrap();
        let item = TrackedItem::file(&path);

        assert!(is_different(&item, None, &policy()));
        let fp = item.fingerprint(&policy()).unwrap();
        assert!(!is_different(&item, Some(&fp), &policy()));
    }
}
