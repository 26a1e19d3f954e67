use crate::release::{ReleaseError, ReleaseSource};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Version string recorded when no marker file exists yet, matching a fresh
/// install that has never completed a download.
const UNKNOWN_VERSION: &str = "0.0.0";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("moving live executable into the backup slot failed: {0}")]
    Backup(std::io::Error),
    #[error("moving staged artifact into the live slot failed: {0}")]
    Activate(std::io::Error),
    #[error("restoring execute permission failed: {0}")]
    Permissions(std::io::Error),
    #[error("moving download into the staged slot failed: {0}")]
    Stage(std::io::Error),
    #[error("writing version marker failed: {0}")]
    Marker(std::io::Error),
}

/// The four on-disk locations the update lifecycle touches. Staged, backup
/// and download slots are siblings of the live executable so every rename
/// stays on one filesystem; the version marker lives in the data directory.
#[derive(Debug, Clone)]
pub struct UpdatePaths {
    pub live: PathBuf,
    pub staged: PathBuf,
    pub backup: PathBuf,
    pub download: PathBuf,
    pub version_file: PathBuf,
}

impl UpdatePaths {
    pub fn new(live: PathBuf, data_dir: &Path) -> Self {
        let staged = slot(&live, "staged");
        let backup = slot(&live, "backup");
        let download = slot(&live, "download");
        Self {
            live,
            staged,
            backup,
            download,
            version_file: data_dir.join("version.txt"),
        }
    }
}

fn slot(live: &Path, suffix: &str) -> PathBuf {
    let mut name = live
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    live.with_file_name(name)
}

/// Result of the boot-time promotion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// No staged artifact was present; nothing to do.
    NotStaged,
    /// The staged artifact is now the live executable.
    Promoted,
}

/// Promote a staged artifact into the live slot. Runs once at startup,
/// before anything samples or serves.
///
/// The sequence is: live -> backup (one generation, overwriting), then
/// staged -> live, then restore execute permission. Each step is an atomic
/// rename, and the function re-enters cleanly: if a previous run was killed
/// after the backup move, the live path is simply missing and the remaining
/// steps still complete. On failure the staged artifact is left in place so
/// the next boot retries, and the caller keeps running on whatever executable
/// currently sits at the live path.
pub fn promote_if_staged(paths: &UpdatePaths) -> Result<Promotion, UpdateError> {
    if !paths.staged.exists() {
        return Ok(Promotion::NotStaged);
    }

    if paths.live.exists() {
        if paths.backup.exists() {
            fs::remove_file(&paths.backup).map_err(UpdateError::Backup)?;
        }
        fs::rename(&paths.live, &paths.backup).map_err(UpdateError::Backup)?;
    }

    fs::rename(&paths.staged, &paths.live).map_err(UpdateError::Activate)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&paths.live, fs::Permissions::from_mode(0o755))
            .map_err(UpdateError::Permissions)?;
    }

    info!(live = %paths.live.display(), "promoted staged artifact");
    Ok(Promotion::Promoted)
}

/// Release asset filename for a host operating system. Three recognized
/// classes; anything unrecognized downloads the same asset as linux.
pub fn asset_name(os: &str) -> &'static str {
    match os {
        "windows" => "hwmond.exe",
        "macos" => "hwmond",
        _ => "hwmond",
    }
}

/// Comparison deciding whether a remote version should be fetched.
///
/// The default treats version strings as opaque and triggers on plain
/// inequality, so the remote is authoritative and a remote rollback is
/// applied exactly like an upgrade. Swap in a stricter ordering here if that
/// ever becomes unacceptable.
pub type VersionPolicy = fn(installed: &str, remote: &str) -> bool;

pub fn remote_differs(installed: &str, remote: &str) -> bool {
    installed != remote
}

/// Outcome of one periodic check, mapped onto the controller states:
/// a check runs CHECKING and ends IDLE (failed / up to date) or STAGED.
#[derive(Debug)]
pub enum CheckOutcome {
    /// Transient fault talking to the release index; the next check happens
    /// on the normal schedule, no backoff.
    CheckFailed(ReleaseError),
    /// The remote has nothing published; treated like up to date this cycle.
    NoRelease,
    /// Remote version equals the local marker.
    UpToDate,
    /// Downloaded failed or the staged slot could not be written; any partial
    /// file has been removed.
    StageFailed(UpdateError),
    /// A new artifact sits in the staged slot, to be promoted at next boot.
    Staged { from: String, to: String },
}

/// Decides whether an update is needed, fetches it and stages it for the
/// next boot. Never touches the live executable; that is the boot-time
/// promotion's job.
pub struct UpdateController {
    paths: UpdatePaths,
    installed_version: String,
    check_interval: Duration,
    last_check: Option<Instant>,
    needs_update: VersionPolicy,
}

impl UpdateController {
    pub fn new(paths: UpdatePaths, check_interval: Duration) -> Self {
        let installed_version = read_version_marker(&paths.version_file);
        Self {
            paths,
            installed_version,
            check_interval,
            last_check: None,
            needs_update: remote_differs,
        }
    }

    /// Substitute a stricter comparison than the default inequality trigger.
    pub fn with_policy(mut self, policy: VersionPolicy) -> Self {
        self.needs_update = policy;
        self
    }

    pub fn installed_version(&self) -> &str {
        &self.installed_version
    }

    /// Whether enough wall-clock time has elapsed since the previous check
    /// started. The first call after startup is always due.
    pub fn due(&self, now: Instant) -> bool {
        match self.last_check {
            None => true,
            Some(prev) => now.duration_since(prev) >= self.check_interval,
        }
    }

    /// One full check cycle against the release index.
    ///
    /// On success the download is streamed to a temp slot distinct from the
    /// live and backup paths, renamed into the staged slot, and the version
    /// marker is rewritten optimistically. Any failure removes the partial
    /// download and leaves every other fact untouched; the next scheduled
    /// check retries from scratch.
    pub async fn check_and_stage<R: ReleaseSource>(&mut self, source: &R) -> CheckOutcome {
        self.last_check = Some(Instant::now());

        let latest = match source.latest_version().await {
            Ok(version) => version,
            Err(ReleaseError::NotFound) => return CheckOutcome::NoRelease,
            Err(err) => return CheckOutcome::CheckFailed(err),
        };

        if !(self.needs_update)(&self.installed_version, &latest) {
            return CheckOutcome::UpToDate;
        }

        let asset = asset_name(std::env::consts::OS);
        if let Err(err) = source.download_to(&latest, asset, &self.paths.download).await {
            let _ = fs::remove_file(&self.paths.download);
            return CheckOutcome::CheckFailed(err);
        }

        match self.stage_downloaded(&latest) {
            Ok(()) => {
                let from = std::mem::replace(&mut self.installed_version, latest.clone());
                CheckOutcome::Staged { from, to: latest }
            }
            Err(err) => {
                let _ = fs::remove_file(&self.paths.download);
                CheckOutcome::StageFailed(err)
            }
        }
    }

    fn stage_downloaded(&self, version: &str) -> Result<(), UpdateError> {
        if self.paths.staged.exists() {
            fs::remove_file(&self.paths.staged).map_err(UpdateError::Stage)?;
        }
        fs::rename(&self.paths.download, &self.paths.staged).map_err(UpdateError::Stage)?;
        fs::write(&self.paths.version_file, version).map_err(UpdateError::Marker)?;
        Ok(())
    }
}

/// Last version this host believes is installed; `0.0.0` when the marker has
/// never been written.
pub fn read_version_marker(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                UNKNOWN_VERSION.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Err(_) => UNKNOWN_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    enum IndexScript {
        Version(&'static str),
        NotFound,
        Http500,
    }

    struct FakeSource {
        index: IndexScript,
        fail_download: bool,
        downloads: RefCell<u32>,
    }

    impl FakeSource {
        fn version(v: &'static str) -> Self {
            Self {
                index: IndexScript::Version(v),
                fail_download: false,
                downloads: RefCell::new(0),
            }
        }
    }

    impl ReleaseSource for FakeSource {
        async fn latest_version(&self) -> Result<String, ReleaseError> {
            match self.index {
                IndexScript::Version(v) => Ok(v.to_string()),
                IndexScript::NotFound => Err(ReleaseError::NotFound),
                IndexScript::Http500 => Err(ReleaseError::Http(500)),
            }
        }

        async fn download_to(
            &self,
            version: &str,
            _asset_name: &str,
            dest: &Path,
        ) -> Result<u64, ReleaseError> {
            *self.downloads.borrow_mut() += 1;
            if self.fail_download {
                // Leave a partial file behind, as an interrupted transfer would.
                fs::write(dest, b"partial").unwrap();
                return Err(ReleaseError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "stream interrupted",
                )));
            }
            let body = format!("binary-{version}");
            fs::write(dest, &body).unwrap();
            Ok(body.len() as u64)
        }
    }

    fn paths_in(dir: &Path) -> UpdatePaths {
        UpdatePaths::new(dir.join("hwmond"), dir)
    }

    fn controller(dir: &Path, installed: &str) -> UpdateController {
        let paths = paths_in(dir);
        fs::write(&paths.version_file, installed).unwrap();
        UpdateController::new(paths, Duration::from_secs(3600))
    }

    #[test]
    fn promotion_swaps_live_and_staged() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.live, b"old-binary").unwrap();
        fs::write(&paths.staged, b"new-binary").unwrap();

        assert_eq!(promote_if_staged(&paths).unwrap(), Promotion::Promoted);

        assert_eq!(fs::read(&paths.live).unwrap(), b"new-binary");
        assert_eq!(fs::read(&paths.backup).unwrap(), b"old-binary");
        assert!(!paths.staged.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&paths.live).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0, "live executable must stay executable");
        }
    }

    #[test]
    fn promotion_reenters_after_interruption() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        // A previous run was killed right after the backup move: backup holds
        // the old binary, the live path is gone, the staged artifact remains.
        fs::write(&paths.backup, b"old-binary").unwrap();
        fs::write(&paths.staged, b"new-binary").unwrap();

        assert_eq!(promote_if_staged(&paths).unwrap(), Promotion::Promoted);

        assert_eq!(fs::read(&paths.live).unwrap(), b"new-binary");
        assert_eq!(fs::read(&paths.backup).unwrap(), b"old-binary");
        assert!(!paths.staged.exists());
    }

    #[test]
    fn promotion_without_staged_artifact_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.live, b"current").unwrap();

        assert_eq!(promote_if_staged(&paths).unwrap(), Promotion::NotStaged);
        assert_eq!(fs::read(&paths.live).unwrap(), b"current");
        assert!(!paths.backup.exists());
    }

    #[test]
    fn promotion_retains_one_backup_generation() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.live, b"v2").unwrap();
        fs::write(&paths.backup, b"v1").unwrap();
        fs::write(&paths.staged, b"v3").unwrap();

        promote_if_staged(&paths).unwrap();

        assert_eq!(fs::read(&paths.live).unwrap(), b"v3");
        assert_eq!(fs::read(&paths.backup).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn matching_version_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(dir.path(), "1.1.0");
        let source = FakeSource::version("1.1.0");

        let outcome = ctrl.check_and_stage(&source).await;

        assert!(matches!(outcome, CheckOutcome::UpToDate));
        assert_eq!(*source.downloads.borrow(), 0);
        assert_eq!(ctrl.installed_version(), "1.1.0");
    }

    #[tokio::test]
    async fn version_mismatch_stages_and_rewrites_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        fs::write(&paths.live, b"live-binary").unwrap();
        let mut ctrl = controller(dir.path(), "1.1.0");
        let source = FakeSource::version("1.2.0");

        let outcome = ctrl.check_and_stage(&source).await;

        match outcome {
            CheckOutcome::Staged { from, to } => {
                assert_eq!(from, "1.1.0");
                assert_eq!(to, "1.2.0");
            }
            other => panic!("expected Staged, got {other:?}"),
        }
        assert_eq!(*source.downloads.borrow(), 1);
        assert_eq!(read_version_marker(&paths.version_file), "1.2.0");
        assert_eq!(fs::read(&paths.staged).unwrap(), b"binary-1.2.0");
        // The live executable stays untouched until the next boot.
        assert_eq!(fs::read(&paths.live).unwrap(), b"live-binary");
        assert!(!paths.download.exists());
    }

    #[tokio::test]
    async fn remote_not_found_is_treated_as_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(dir.path(), "1.1.0");
        let source = FakeSource {
            index: IndexScript::NotFound,
            fail_download: false,
            downloads: RefCell::new(0),
        };

        let outcome = ctrl.check_and_stage(&source).await;

        assert!(matches!(outcome, CheckOutcome::NoRelease));
        assert_eq!(*source.downloads.borrow(), 0);
    }

    #[tokio::test]
    async fn index_fault_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let mut ctrl = controller(dir.path(), "1.1.0");
        let source = FakeSource {
            index: IndexScript::Http500,
            fail_download: false,
            downloads: RefCell::new(0),
        };

        let outcome = ctrl.check_and_stage(&source).await;

        assert!(matches!(outcome, CheckOutcome::CheckFailed(_)));
        assert_eq!(read_version_marker(&paths.version_file), "1.1.0");
        assert!(!paths.staged.exists());
    }

    #[tokio::test]
    async fn failed_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let mut ctrl = controller(dir.path(), "1.1.0");
        let source = FakeSource {
            index: IndexScript::Version("1.2.0"),
            fail_download: true,
            downloads: RefCell::new(0),
        };

        let outcome = ctrl.check_and_stage(&source).await;

        assert!(matches!(outcome, CheckOutcome::CheckFailed(_)));
        assert!(!paths.download.exists());
        assert!(!paths.staged.exists());
        assert_eq!(read_version_marker(&paths.version_file), "1.1.0");
        assert_eq!(ctrl.installed_version(), "1.1.0");
    }

    #[tokio::test]
    async fn check_cadence_is_wall_clock_based() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(dir.path(), "1.1.0");
        let source = FakeSource::version("1.1.0");

        assert!(ctrl.due(Instant::now()), "first check is always due");
        ctrl.check_and_stage(&source).await;
        assert!(
            !ctrl.due(Instant::now()),
            "next check waits for the interval"
        );
    }

    #[test]
    fn missing_marker_reads_as_zero_version() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_version_marker(&dir.path().join("version.txt")), "0.0.0");
    }

    #[test]
    fn platform_asset_names() {
        assert_eq!(asset_name("windows"), "hwmond.exe");
        assert_eq!(asset_name("macos"), "hwmond");
        assert_eq!(asset_name("linux"), "hwmond");
        // Unrecognized systems fall into the same bucket as linux.
        assert_eq!(asset_name("freebsd"), "hwmond");
    }

    #[tokio::test]
    async fn policy_is_swappable() {
        fn never_update(_installed: &str, _remote: &str) -> bool {
            false
        }

        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(dir.path(), "1.1.0").with_policy(never_update);
        let source = FakeSource::version("9.9.9");

        let outcome = ctrl.check_and_stage(&source).await;

        assert!(matches!(outcome, CheckOutcome::UpToDate));
        assert_eq!(*source.downloads.borrow(), 0);
    }

    #[test]
    fn default_policy_is_plain_inequality() {
        assert!(remote_differs("1.1.0", "1.2.0"));
        // A remote rollback triggers exactly like an upgrade.
        assert!(remote_differs("1.2.0", "1.1.0"));
        assert!(!remote_differs("1.2.0", "1.2.0"));
    }
}
