// Drop-zone directory watcher.
//
// Filesystem events on `.pfx`/`.p12` files directly under the configured root
// become deduplicated queue jobs. A per-path debounce drops rapid repeats, a
// global sliding window caps event throughput, and deterministic job ids let
// the queue coalesce duplicates.

use crate::ingest::is_certificate_file;
use crate::queue::{normalize_path, CertJob, Queue};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub org_id: i32,
    pub root_path: PathBuf,
    pub debounce: Duration,
    pub max_events_per_minute: u32,
}

/// What a filesystem event asks the pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Ingest(PathBuf),
    Delete(PathBuf),
}

impl WatchAction {
    pub fn path(&self) -> &Path {
        match self {
            WatchAction::Ingest(path) | WatchAction::Delete(path) => path,
        }
    }
}

/// Deterministic queue job id: `cert_{ing|del}__{org}__{sha1(path)}`.
pub fn build_job_id(action: &WatchAction, org_id: i32) -> String {
    let path_key = normalize_path(action.path())
        .to_string_lossy()
        .to_lowercase();
    let digest = hex::encode(Sha1::digest(path_key.as_bytes()));
    let prefix = match action {
        WatchAction::Ingest(_) => "cert_ing",
        WatchAction::Delete(_) => "cert_del",
    };
    format!("{prefix}__{org_id}__{digest}")
}

fn in_root(path: &Path, root: &Path) -> bool {
    path.parent() == Some(root)
}

fn watchable(path: &Path, root: &Path) -> bool {
    in_root(path, root) && is_certificate_file(path)
}

/// Translates a notify event into pipeline actions, applying the
/// extension-and-location filter. Rename events map to delete/ingest pairs
/// mirroring how moves in, out of, and within the root behave.
pub fn classify_event(event: &notify::Event, root: &Path) -> Vec<WatchAction> {
    let paths: Vec<PathBuf> = event.paths.iter().map(|p| normalize_path(p)).collect();

    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any) => paths
            .into_iter()
            .filter(|p| watchable(p, root))
            .map(WatchAction::Ingest)
            .collect(),
        EventKind::Remove(_) => paths
            .into_iter()
            .filter(|p| watchable(p, root))
            .map(WatchAction::Delete)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .into_iter()
            .filter(|p| watchable(p, root))
            .map(WatchAction::Delete)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .into_iter()
            .filter(|p| watchable(p, root))
            .map(WatchAction::Ingest)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut actions = Vec::new();
            if let [src, dest] = paths.as_slice() {
                let src_ok = watchable(src, root);
                let dest_ok = watchable(dest, root);
                if src_ok && !dest_ok {
                    actions.push(WatchAction::Delete(src.clone()));
                } else if dest_ok && !src_ok {
                    actions.push(WatchAction::Ingest(dest.clone()));
                } else if src_ok && dest_ok {
                    actions.push(WatchAction::Delete(src.clone()));
                    actions.push(WatchAction::Ingest(dest.clone()));
                }
            }
            actions
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => paths
            .into_iter()
            .filter(|p| watchable(p, root))
            .map(|p| {
                if p.exists() {
                    WatchAction::Ingest(p)
                } else {
                    WatchAction::Delete(p)
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Per-path debounce plus a global sliding-window event cap.
pub struct EventGate {
    debounce: Duration,
    max_events_per_minute: u32,
    last_event_at: HashMap<PathBuf, Instant>,
    event_times: VecDeque<Instant>,
}

impl EventGate {
    pub fn new(debounce: Duration, max_events_per_minute: u32) -> Self {
        EventGate {
            debounce,
            max_events_per_minute,
            last_event_at: HashMap::new(),
            event_times: VecDeque::new(),
        }
    }

    /// True when the window is saturated. Admitted events are recorded.
    pub fn rate_limited(&mut self, now: Instant) -> bool {
        if self.max_events_per_minute == 0 {
            return false;
        }
        let window = Duration::from_secs(60);
        while let Some(front) = self.event_times.front() {
            if now.duration_since(*front) >= window {
                self.event_times.pop_front();
            } else {
                break;
            }
        }
        if self.event_times.len() >= self.max_events_per_minute as usize {
            return true;
        }
        self.event_times.push_back(now);
        false
    }

    /// True when the same path fired within the debounce interval.
    pub fn debounced(&mut self, path: &Path, now: Instant) -> bool {
        if self.debounce.is_zero() {
            return false;
        }
        if let Some(last) = self.last_event_at.get(path) {
            if now.duration_since(*last) < self.debounce {
                return true;
            }
        }
        self.last_event_at.insert(path.to_path_buf(), now);
        false
    }
}

/// Watches the drop zone until the process shuts down, feeding the queue.
pub async fn run_watcher(queue: Queue, config: WatcherConfig) -> anyhow::Result<()> {
    let root = normalize_path(&config.root_path);
    if !root.is_dir() {
        anyhow::bail!("drop zone not found: {}", root.display());
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => tracing::warn!(error = %e, "watcher backend error"),
        }
    })?;
    watcher.watch(&root, RecursiveMode::NonRecursive)?;

    tracing::info!(
        org_id = config.org_id,
        root = %root.display(),
        debounce_secs = config.debounce.as_secs_f64(),
        rate_limit = config.max_events_per_minute,
        "drop-zone watcher started"
    );

    let mut gate = EventGate::new(config.debounce, config.max_events_per_minute);
    while let Some(event) = rx.recv().await {
        for action in classify_event(&event, &root) {
            let now = Instant::now();
            if gate.rate_limited(now) {
                tracing::warn!(path = %action.path().display(), "watcher rate limited");
                continue;
            }
            if gate.debounced(action.path(), now) {
                tracing::debug!(path = %action.path().display(), "watcher debounced");
                continue;
            }

            let job_id = build_job_id(&action, config.org_id);
            let path = action.path().to_string_lossy().to_string();
            let job = match &action {
                WatchAction::Ingest(_) => CertJob::Ingest {
                    org_id: config.org_id,
                    path: path.clone(),
                },
                WatchAction::Delete(_) => CertJob::DeleteByPath {
                    org_id: config.org_id,
                    path: path.clone(),
                },
            };
            match queue.enqueue_unique(&job_id, &job).await {
                Ok(deduped) => tracing::info!(
                    path = %path,
                    job_id = %job_id,
                    result = if deduped { "existing" } else { "new" },
                    "watcher enqueue"
                ),
                Err(e) => tracing::warn!(error = %e, path = %path, "watcher enqueue failed"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut e = notify::Event::new(kind);
        e.paths = paths.iter().map(PathBuf::from).collect();
        e
    }

    #[test]
    fn test_classify_create_and_remove() {
        let root = Path::new("/srv/certs");
        let created = event(EventKind::Create(CreateKind::File), &["/srv/certs/a.pfx"]);
        assert_eq!(
            classify_event(&created, root),
            vec![WatchAction::Ingest(PathBuf::from("/srv/certs/a.pfx"))]
        );

        let removed = event(EventKind::Remove(RemoveKind::File), &["/srv/certs/a.pfx"]);
        assert_eq!(
            classify_event(&removed, root),
            vec![WatchAction::Delete(PathBuf::from("/srv/certs/a.pfx"))]
        );
    }

    #[test]
    fn test_classify_filters_extension_and_location() {
        let root = Path::new("/srv/certs");
        let wrong_ext = event(EventKind::Create(CreateKind::File), &["/srv/certs/a.txt"]);
        assert!(classify_event(&wrong_ext, root).is_empty());

        let nested = event(
            EventKind::Create(CreateKind::File),
            &["/srv/certs/sub/a.pfx"],
        );
        assert!(classify_event(&nested, root).is_empty());
    }

    #[test]
    fn test_classify_rename_within_root() {
        let root = Path::new("/srv/certs");
        let moved = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/srv/certs/old.pfx", "/srv/certs/new.pfx"],
        );
        assert_eq!(
            classify_event(&moved, root),
            vec![
                WatchAction::Delete(PathBuf::from("/srv/certs/old.pfx")),
                WatchAction::Ingest(PathBuf::from("/srv/certs/new.pfx")),
            ]
        );
    }

    #[test]
    fn test_classify_rename_out_of_root() {
        let root = Path::new("/srv/certs");
        let moved_out = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/srv/certs/old.pfx", "/srv/archive/old.pfx"],
        );
        assert_eq!(
            classify_event(&moved_out, root),
            vec![WatchAction::Delete(PathBuf::from("/srv/certs/old.pfx"))]
        );

        let moved_in = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/srv/inbox/new.pfx", "/srv/certs/new.pfx"],
        );
        assert_eq!(
            classify_event(&moved_in, root),
            vec![WatchAction::Ingest(PathBuf::from("/srv/certs/new.pfx"))]
        );
    }

    #[test]
    fn test_job_id_is_deterministic_and_case_insensitive() {
        let a = build_job_id(&WatchAction::Ingest(PathBuf::from("/srv/certs/A.pfx")), 1);
        let b = build_job_id(&WatchAction::Ingest(PathBuf::from("/srv/certs/a.pfx")), 1);
        assert_eq!(a, b);
        assert!(a.starts_with("cert_ing__1__"));

        let del = build_job_id(&WatchAction::Delete(PathBuf::from("/srv/certs/a.pfx")), 1);
        assert!(del.starts_with("cert_del__1__"));
        assert_eq!(a.split("__").last(), del.split("__").last());

        let other_org = build_job_id(&WatchAction::Ingest(PathBuf::from("/srv/certs/a.pfx")), 2);
        assert_ne!(a, other_org);
    }

    #[test]
    fn test_debounce_per_path() {
        let mut gate = EventGate::new(Duration::from_secs(2), 0);
        let base = Instant::now();
        let path_a = Path::new("/srv/certs/a.pfx");
        let path_b = Path::new("/srv/certs/b.pfx");

        assert!(!gate.debounced(path_a, base));
        assert!(gate.debounced(path_a, base + Duration::from_millis(500)));
        // A different path is not affected.
        assert!(!gate.debounced(path_b, base + Duration::from_millis(600)));
        // Past the interval the path fires again.
        assert!(!gate.debounced(path_a, base + Duration::from_secs(3)));
    }

    #[test]
    fn test_rate_limit_sliding_window() {
        let mut gate = EventGate::new(Duration::ZERO, 2);
        let base = Instant::now();

        assert!(!gate.rate_limited(base));
        assert!(!gate.rate_limited(base + Duration::from_secs(1)));
        assert!(gate.rate_limited(base + Duration::from_secs(2)));
        // Once the first event leaves the 60s window, capacity returns.
        assert!(!gate.rate_limited(base + Duration::from_secs(61)));
    }

    #[test]
    fn test_rate_limit_disabled_when_zero() {
        let mut gate = EventGate::new(Duration::ZERO, 0);
        let base = Instant::now();
        for i in 0..1000 {
            assert!(!gate.rate_limited(base + Duration::from_millis(i)));
        }
    }
}
