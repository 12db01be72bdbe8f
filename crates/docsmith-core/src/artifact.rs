//! Per-request artifact namespaces and their cleanup.
//!
//! Every conversion that writes to disk allocates an [`ArtifactScope`]. The
//! scope owns a unique token; all files the request produces are named
//! `<directory>/<token>...` and recorded in the scope's registry. The scope
//! removes them exactly once: either through an explicit
//! [`ArtifactScope::cleanup`] when the response is about to be produced, or
//! from `Drop` if the request future was abandoned (client disconnect).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::ConversionError;

/// Unique artifact namespace of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    id: String,
    directory: PathBuf,
    base_path: PathBuf,
}

impl ArtifactHandle {
    pub(crate) fn new(directory: &Path, id: String) -> Self {
        Self {
            base_path: directory.join(&id),
            directory: directory.to_path_buf(),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `directory/id`, the common prefix of every artifact of this request.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `<base_path><suffix>`, e.g. `with_suffix("-html.html")`.
    pub fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base_path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// True if `name` (a bare file name) belongs to this namespace.
    pub fn owns_name(&self, name: &str) -> bool {
        name.starts_with(&self.id)
    }
}

/// 128-bit random token as 32 lowercase hex characters.
pub fn new_token() -> String {
    format!("{:032x}", fastrand::u128(..))
}

/// Ensure `base_directory` exists and hand out a fresh namespace in it.
///
/// An existing directory is fine; any other creation failure is fatal.
pub async fn allocate(base_directory: &Path) -> Result<ArtifactHandle, ConversionError> {
    match tokio::fs::create_dir_all(base_directory).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists && base_directory.is_dir() => {}
        Err(e) => {
            return Err(ConversionError::environment(
                "allocator",
                format!(
                    "cannot create temp directory {}: {}",
                    base_directory.display(),
                    e
                ),
            ));
        }
    }
    Ok(ArtifactHandle::new(base_directory, new_token()))
}

/// Lifecycle of one request's artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Allocated,
    Produced,
    Normalized,
    Failed,
    Cleaned,
}

/// Outcome of a cleanup pass. Failures are warnings, never errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

/// Owner of an [`ArtifactHandle`] and the registry of paths it produced.
#[derive(Debug)]
pub struct ArtifactScope {
    handle: ArtifactHandle,
    registered: Vec<PathBuf>,
    state: ArtifactState,
}

impl ArtifactScope {
    pub async fn allocate(base_directory: &Path) -> Result<Self, ConversionError> {
        Ok(Self::from_handle(allocate(base_directory).await?))
    }

    pub fn from_handle(handle: ArtifactHandle) -> Self {
        Self {
            handle,
            registered: Vec::new(),
            state: ArtifactState::Allocated,
        }
    }

    pub fn handle(&self) -> &ArtifactHandle {
        &self.handle
    }

    pub fn state(&self) -> ArtifactState {
        self.state
    }

    pub fn registered(&self) -> &[PathBuf] {
        &self.registered
    }

    /// Record a path for removal. Duplicates are ignored.
    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.registered.contains(&path) {
            self.registered.push(path);
        }
    }

    pub fn register_all(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            self.register(path);
        }
    }

    pub fn mark_produced(&mut self) {
        if self.state == ArtifactState::Allocated {
            self.state = ArtifactState::Produced;
        }
    }

    pub fn mark_normalized(&mut self) {
        if self.state == ArtifactState::Produced {
            self.state = ArtifactState::Normalized;
        }
    }

    pub fn mark_failed(&mut self) {
        if matches!(
            self.state,
            ArtifactState::Allocated | ArtifactState::Produced
        ) {
            self.state = ArtifactState::Failed;
        }
    }

    /// Remove every registered artifact. Safe to call more than once; only
    /// the first call does any work.
    pub fn cleanup(&mut self) -> CleanupReport {
        if self.state == ArtifactState::Cleaned {
            return CleanupReport::default();
        }
        let from = self.state;
        self.state = ArtifactState::Cleaned;
        let report = remove_paths(&self.registered);
        self.log_cleanup(from, &report);
        report
    }

    /// [`cleanup`](Self::cleanup) with the removals run on the blocking pool.
    ///
    /// The scope counts as cleaned as soon as this is called, so dropping the
    /// future midway leaves the removal to the already spawned task instead
    /// of starting a second pass from `Drop`.
    pub async fn cleanup_async(&mut self) -> CleanupReport {
        if self.state == ArtifactState::Cleaned {
            return CleanupReport::default();
        }
        let from = self.state;
        self.state = ArtifactState::Cleaned;
        let paths = self.registered.clone();
        let report = match tokio::task::spawn_blocking(move || remove_paths(&paths)).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(id = self.handle.id(), error = %e, "cleanup task failed, removing inline");
                remove_paths(&self.registered)
            }
        };
        self.log_cleanup(from, &report);
        report
    }

    fn log_cleanup(&self, from: ArtifactState, report: &CleanupReport) {
        tracing::debug!(
            id = self.handle.id(),
            removed = report.removed,
            failed = report.failed,
            from = ?from,
            "artifacts cleaned"
        );
    }
}

impl Drop for ArtifactScope {
    fn drop(&mut self) {
        if self.state == ArtifactState::Cleaned {
            return;
        }
        // Abandoned mid-conversion: a killed tool cannot report what it wrote,
        // so sweep the token prefix in addition to the registry.
        let swept = list_owned(&self.handle);
        self.register_all(swept);
        let report = self.cleanup();
        tracing::info!(
            id = self.handle.id(),
            removed = report.removed,
            "artifacts cleaned after abandoned request"
        );
    }
}

/// Every entry of the handle's directory whose name starts with the token.
pub fn list_owned(handle: &ArtifactHandle) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(handle.directory()) else {
        return Vec::new();
    };
    let mut owned: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| handle.owns_name(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();
    owned.sort();
    owned
}

fn remove_paths(paths: &[PathBuf]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        let result = match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                report.failed += 1;
                tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_do_not_collide() {
        let tokens: HashSet<String> = (0..10_000).map(|_| new_token()).collect();
        assert_eq!(tokens.len(), 10_000);
        assert!(tokens.iter().all(|t| t.len() == 32));
    }

    #[tokio::test]
    async fn allocate_creates_directory_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("temp");
        let a = allocate(&dir).await.unwrap();
        let b = allocate(&dir).await.unwrap();
        assert!(dir.is_dir());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.base_path(), dir.join(a.id()));
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn allocate_fails_when_path_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        let err = allocate(&file).await.unwrap_err();
        assert!(!err.is_client_error());
    }

    #[test]
    fn suffix_paths_share_the_token_prefix() {
        let handle = ArtifactHandle::new(Path::new("/tmp/docsmith"), "abc".into());
        assert_eq!(
            handle.with_suffix("-html.html"),
            PathBuf::from("/tmp/docsmith/abc-html.html")
        );
        assert!(handle.owns_name("abc.pdf"));
        assert!(!handle.owns_name("xyz.pdf"));
    }

    #[tokio::test]
    async fn cleanup_removes_registered_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut scope = ArtifactScope::allocate(tmp.path()).await.unwrap();
        let input = scope.handle().with_suffix(".pdf");
        let media = scope.handle().with_suffix("-media");
        std::fs::write(&input, b"%PDF-").unwrap();
        std::fs::create_dir_all(media.join("media")).unwrap();
        std::fs::write(media.join("media").join("image1.png"), b"png").unwrap();
        scope.register(input.clone());
        scope.register(media.clone());
        scope.register(input.clone());
        assert_eq!(scope.registered().len(), 2);

        let first = scope.cleanup();
        assert_eq!(first.removed, 2);
        assert!(!input.exists());
        assert!(!media.exists());
        assert_eq!(scope.state(), ArtifactState::Cleaned);

        let second = scope.cleanup();
        assert_eq!(second, CleanupReport::default());
    }

    #[tokio::test]
    async fn async_cleanup_removes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut scope = ArtifactScope::allocate(tmp.path()).await.unwrap();
        let handle = scope.handle().clone();
        let output = handle.with_suffix("-html.html");
        std::fs::write(&output, b"<html>").unwrap();
        scope.register(output.clone());
        scope.mark_produced();

        let first = scope.cleanup_async().await;
        assert_eq!(first.removed, 1);
        assert!(!output.exists());
        assert_eq!(scope.state(), ArtifactState::Cleaned);
        assert_eq!(scope.cleanup_async().await, CleanupReport::default());
        assert_eq!(scope.cleanup(), CleanupReport::default());

        // Drop after a finished cleanup must not sweep the namespace again
        let late = handle.with_suffix("-late.txt");
        std::fs::write(&late, b"x").unwrap();
        drop(scope);
        assert!(late.exists());
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_and_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let mut empty = ArtifactScope::allocate(tmp.path()).await.unwrap();
        assert_eq!(empty.cleanup(), CleanupReport::default());

        let mut missing = ArtifactScope::allocate(tmp.path()).await.unwrap();
        let never_written = missing.handle().with_suffix(".txt");
        missing.register(never_written);
        assert_eq!(missing.cleanup().failed, 0);
    }

    #[tokio::test]
    async fn drop_sweeps_unregistered_files_of_the_token_only() {
        let tmp = tempfile::tempdir().unwrap();
        let bystander = tmp.path().join("someone-else.html");
        std::fs::write(&bystander, b"keep").unwrap();

        let scope = ArtifactScope::allocate(tmp.path()).await.unwrap();
        let handle = scope.handle().clone();
        std::fs::write(handle.with_suffix("-html.html"), b"<html>").unwrap();
        std::fs::write(handle.with_suffix("001.png"), b"png").unwrap();
        drop(scope);

        assert!(list_owned(&handle).is_empty());
        assert!(bystander.exists());
    }

    #[test]
    fn state_transitions() {
        let handle = ArtifactHandle::new(Path::new("/nonexistent"), new_token());
        let mut scope = ArtifactScope::from_handle(handle);
        assert_eq!(scope.state(), ArtifactState::Allocated);
        scope.mark_normalized();
        assert_eq!(scope.state(), ArtifactState::Allocated);
        scope.mark_produced();
        scope.mark_normalized();
        assert_eq!(scope.state(), ArtifactState::Normalized);
        scope.mark_failed();
        assert_eq!(scope.state(), ArtifactState::Normalized);
        scope.cleanup();
        assert_eq!(scope.state(), ArtifactState::Cleaned);

        let mut failing = ArtifactScope::from_handle(ArtifactHandle::new(
            Path::new("/nonexistent"),
            new_token(),
        ));
        failing.mark_produced();
        failing.mark_failed();
        assert_eq!(failing.state(), ArtifactState::Failed);
        failing.cleanup();
        assert_eq!(failing.state(), ArtifactState::Cleaned);
    }
}
