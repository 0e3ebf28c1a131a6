//! Hot-reload file watcher.
//!
//! ```text
//! filesystem events (notify)
//!   → drop ignored dirs (target, node_modules, .git)
//!   → reset the debounce deadline
//!   → blake3 hash of the source tree
//!   → compare to the last hash
//!   → WatchEvent::Changed
//! ```
//!
//! One [`PluginWatcher`] covers one plugin directory. The manager consumes
//! its events and reloads the plugin.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

/// Default quiet period after the last change.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Directory names never watched or hashed.
pub const IGNORED_DIRS: &[&str] = &["node_modules", "target", "dist", ".git"];

/// Events emitted by a [`PluginWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The source tree changed content.
    Changed {
        /// The watched plugin directory.
        plugin_dir: PathBuf,
        /// blake3 hash after the change.
        source_hash: String,
    },
    /// Non-fatal watcher failure.
    Error(String),
}

#[cfg(feature = "watch")]
pub use imp::PluginWatcher;

#[cfg(feature = "watch")]
mod imp {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use super::{WatchEvent, compute_source_hash, is_in_ignored_dir};
    use crate::error::{PluginError, PluginResult};

    type RawEvent = notify::Result<Event>;

    /// Watches one plugin directory and reports debounced content changes.
    pub struct PluginWatcher {
        watcher: RecommendedWatcher,
        debouncer: Debouncer,
    }

    impl std::fmt::Debug for PluginWatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PluginWatcher")
                .field("plugin_dir", &self.debouncer.plugin_dir)
                .field("debounce", &self.debouncer.debounce)
                .finish_non_exhaustive()
        }
    }

    impl PluginWatcher {
        /// Create a watcher for `plugin_dir`.
        ///
        /// The current source hash is recorded up front so that a change
        /// which leaves the content identical never fires.
        ///
        /// # Errors
        ///
        /// Returns [`PluginError::Io`] if the OS watcher cannot be created.
        pub fn new(
            plugin_dir: PathBuf,
            debounce: Duration,
        ) -> PluginResult<(Self, mpsc::Receiver<WatchEvent>)> {
            let (debouncer, raw_tx, event_rx) = Debouncer::new(plugin_dir, debounce);
            let watcher = RecommendedWatcher::new(
                move |res| {
                    let _ = raw_tx.send(res);
                },
                notify::Config::default(),
            )
            .map_err(|e| PluginError::Io(std::io::Error::other(format!("filesystem watcher: {e}"))))?;
            Ok((Self { watcher, debouncer }, event_rx))
        }

        /// Run until `cancel` fires or the event receiver is dropped.
        pub async fn run(self, cancel: CancellationToken) {
            let Self {
                mut watcher,
                debouncer,
            } = self;
            let dir = debouncer.plugin_dir.clone();
            if let Err(e) = watcher.watch(&dir, RecursiveMode::Recursive) {
                warn!(path = %dir.display(), error = %e, "Failed to watch plugin directory");
                let _ = debouncer.event_tx.send(WatchEvent::Error(e.to_string())).await;
                return;
            }
            info!(path = %dir.display(), "Watching plugin directory");
            debouncer.run(cancel).await;
            drop(watcher);
        }
    }

    /// Turns raw filesystem events into at most one [`WatchEvent`] per
    /// quiet period. Every relevant event pushes the deadline back.
    struct Debouncer {
        plugin_dir: PathBuf,
        /// `plugin_dir` and its canonical form; event paths may use either.
        roots: Vec<PathBuf>,
        debounce: Duration,
        last_hash: Option<String>,
        raw_rx: mpsc::UnboundedReceiver<RawEvent>,
        event_tx: mpsc::Sender<WatchEvent>,
    }

    impl Debouncer {
        fn new(
            plugin_dir: PathBuf,
            debounce: Duration,
        ) -> (Self, mpsc::UnboundedSender<RawEvent>, mpsc::Receiver<WatchEvent>) {
            let (raw_tx, raw_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(16);

            let mut roots = vec![plugin_dir.clone()];
            roots.extend(
                plugin_dir
                    .canonicalize()
                    .ok()
                    .filter(|canonical| *canonical != plugin_dir),
            );
            let last_hash = compute_source_hash(&plugin_dir).ok();
            (
                Self {
                    plugin_dir,
                    roots,
                    debounce,
                    last_hash,
                    raw_rx,
                    event_tx,
                },
                raw_tx,
                event_rx,
            )
        }

        async fn run(mut self, cancel: CancellationToken) {
            let mut deadline: Option<Instant> = None;
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => {
                        debug!(path = %self.plugin_dir.display(), "Watcher cancelled");
                        return;
                    }

                    () = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        deadline = None;
                        if !self.process_change().await {
                            return;
                        }
                    }

                    event = self.raw_rx.recv() => {
                        match event {
                            Some(Ok(ev)) => {
                                if is_relevant(&ev, &self.roots) {
                                    #[allow(clippy::arithmetic_side_effects)]
                                    // Instant + Duration cannot overflow in practice
                                    let at = Instant::now() + self.debounce;
                                    deadline = Some(at);
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Filesystem watcher error");
                                if self.event_tx.send(WatchEvent::Error(e.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                debug!("Filesystem watcher channel closed, stopping");
                                return;
                            }
                        }
                    }
                }
            }
        }

        /// Hash the tree and emit when it differs. Returns `false` once the
        /// receiver is gone.
        async fn process_change(&mut self) -> bool {
            let dir = self.plugin_dir.clone();
            let hashed = match tokio::task::spawn_blocking(move || compute_source_hash(&dir)).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Hash task was cancelled");
                    return true;
                },
            };

            let event = match hashed {
                Ok(hash) if self.last_hash.as_deref() == Some(hash.as_str()) => {
                    debug!(path = %self.plugin_dir.display(), "Source hash unchanged, skipping reload");
                    return true;
                },
                Ok(hash) => {
                    info!(path = %self.plugin_dir.display(), hash = %hash, "Plugin source changed");
                    self.last_hash = Some(hash.clone());
                    WatchEvent::Changed {
                        plugin_dir: self.plugin_dir.clone(),
                        source_hash: hash,
                    }
                },
                Err(e) => {
                    warn!(path = %self.plugin_dir.display(), error = %e, "Failed to hash plugin source tree");
                    WatchEvent::Error(format!("hash failed for {}: {e}", self.plugin_dir.display()))
                },
            };
            self.event_tx.send(event).await.is_ok()
        }
    }

    fn is_relevant(event: &Event, roots: &[PathBuf]) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) && event.paths.iter().any(|p| !is_ignored_under(p, roots))
    }

    /// Only components below the plugin directory count, so a plugin that
    /// itself lives under a `target/` or `dist/` path still reloads.
    fn is_ignored_under(path: &Path, roots: &[PathBuf]) -> bool {
        let relative = roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);
        is_in_ignored_dir(relative)
    }

}

fn is_in_ignored_dir(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| IGNORED_DIRS.contains(&s))
    })
}

/// Deterministic blake3 hash over every file under `dir`.
///
/// Files are sorted by relative path; each contributes its length-prefixed
/// path and content. Symlinks and [`IGNORED_DIRS`] are skipped.
///
/// # Errors
///
/// Returns an error if `dir` cannot be read. Files that vanish mid-walk are
/// skipped.
pub fn compute_source_hash(dir: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut paths = Vec::new();
    collect_source_paths(dir, &mut paths)?;
    paths.sort();

    for path in &paths {
        let Ok(rel) = path.strip_prefix(dir) else {
            continue;
        };
        match std::fs::read(path) {
            Ok(content) => {
                let rel = rel.to_string_lossy();
                let rel = rel.as_bytes();
                hasher.update(&u64::try_from(rel.len()).unwrap_or(u64::MAX).to_le_bytes());
                hasher.update(rel);
                hasher.update(&u64::try_from(content.len()).unwrap_or(u64::MAX).to_le_bytes());
                hasher.update(&content);
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable file in hash");
            },
        }
    }

    Ok(hasher.finalize().to_hex().to_string())
}

fn collect_source_paths(dir: &Path, paths: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }
        let path = entry.path();
        if file_type.is_dir() {
            if is_in_ignored_dir(Path::new(&entry.file_name())) {
                continue;
            }
            collect_source_paths(&path, paths)?;
        } else if file_type.is_file() {
            paths.push(path);
        }
    }
    Ok(())
}
