//! Event Bus (§4.4): a filesystem-watched scheduler over `events/*.json`.
//!
//! Supports immediate, one-shot (timezone-aware), and periodic (cron)
//! events with crash-safe restart semantics: the bus never assumes it is
//! the only thing that has ever touched `events_dir`, and reconciles its
//! in-memory state against the directory's actual contents on every
//! filesystem notification.

pub mod schedule;

use crate::error::{EventError, Result};
use crate::{EventTarget, GuppyEvent};
use chrono::{DateTime, Utc};
use notify::Watcher as _;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const DEBOUNCE: Duration = Duration::from_millis(100);
const PARSE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];

/// Callback invoked once a scheduled moment arrives: `dispatch(target, text)`.
pub type DispatchFn = Arc<dyn Fn(EventTarget, String) -> BoxFuture + Send + Sync>;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Inner {
    known: HashSet<String>,
    timers: HashMap<String, JoinHandle<()>>,
    crons: HashMap<String, JoinHandle<()>>,
    debounce: HashMap<String, JoinHandle<()>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            known: HashSet::new(),
            timers: HashMap::new(),
            crons: HashMap::new(),
            debounce: HashMap::new(),
        }
    }

    fn cancel_schedule(&mut self, name: &str) {
        if let Some(handle) = self.timers.remove(name) {
            handle.abort();
        }
        if let Some(handle) = self.crons.remove(name) {
            handle.abort();
        }
    }
}

/// The event bus. Owns a filesystem watcher over `events_dir` for its
/// lifetime; drop (or call [`EventBus::shutdown`]) to stop watching and
/// cancel every pending timer and cron.
pub struct EventBus {
    events_dir: PathBuf,
    start_time: DateTime<Utc>,
    dispatch: DispatchFn,
    inner: Arc<Mutex<Inner>>,
    watcher: notify::RecommendedWatcher,
    watch_task: JoinHandle<()>,
}

impl EventBus {
    /// Ensure `events_dir` exists, scan it for existing `*.json` files, and
    /// begin watching it for changes. Existing files are scheduled
    /// immediately; a fresh `immediate` event observed at startup fires
    /// right away (it was not yet stale when this call began).
    pub async fn start(events_dir: PathBuf, dispatch: DispatchFn) -> Result<Self> {
        tokio::fs::create_dir_all(&events_dir).await?;
        let start_time = Utc::now();
        let inner = Arc::new(Mutex::new(Inner::new()));

        let (watcher, watch_task) =
            Self::build_watcher(events_dir.clone(), inner.clone(), start_time, dispatch.clone())?;
        let bus = Self {
            events_dir: events_dir.clone(),
            start_time,
            dispatch,
            inner: inner.clone(),
            watcher,
            watch_task,
        };

        let mut entries = tokio::fs::read_dir(&events_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        for name in names {
            bus.handle_file(&name).await;
        }

        Ok(bus)
    }

    fn build_watcher(
        events_dir: PathBuf,
        inner: Arc<Mutex<Inner>>,
        start_time: DateTime<Utc>,
        dispatch: DispatchFn,
    ) -> Result<(notify::RecommendedWatcher, JoinHandle<()>)> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|err| crate::error::Error::Other(err.into()))?;
        watcher
            .watch(&events_dir, notify::RecursiveMode::NonRecursive)
            .map_err(|err| crate::error::Error::Other(err.into()))?;

        let watcher_inner = inner.clone();
        let dir_for_task = events_dir.clone();
        let watch_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for path in event.paths {
                    if path.extension().is_some_and(|ext| ext == "json")
                        && let Some(name) = path.file_name()
                    {
                        let name = name.to_string_lossy().into_owned();
                        Self::debounce_handle(
                            dir_for_task.clone(),
                            watcher_inner.clone(),
                            start_time,
                            dispatch.clone(),
                            name,
                        )
                        .await;
                    }
                }
            }
        });

        Ok((watcher, watch_task))
    }

    /// Debounce rapid successive notifications for the same filename
    /// (editors often fire several write events per save) by cancelling any
    /// pending handler for that name and scheduling a fresh one.
    async fn debounce_handle(
        events_dir: PathBuf,
        inner: Arc<Mutex<Inner>>,
        start_time: DateTime<Utc>,
        dispatch: DispatchFn,
        name: String,
    ) {
        let mut guard = inner.lock().await;
        if let Some(handle) = guard.debounce.remove(&name) {
            handle.abort();
        }
        let inner_for_task = inner.clone();
        let name_for_task = name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let bus_inner = inner_for_task.clone();
            Self::handle_file_static(&events_dir, &bus_inner, start_time, &dispatch, &name_for_task).await;
            inner_for_task.lock().await.debounce.remove(&name_for_task);
        });
        guard.debounce.insert(name, handle);
    }

    async fn handle_file(&self, name: &str) {
        Self::handle_file_static(&self.events_dir, &self.inner, self.start_time, &self.dispatch, name).await;
    }

    /// File-change handler (§4.4): reconcile in-memory schedule state
    /// against whether `name` currently exists in `events_dir`.
    async fn handle_file_static(
        events_dir: &Path,
        inner: &Arc<Mutex<Inner>>,
        start_time: DateTime<Utc>,
        dispatch: &DispatchFn,
        name: &str,
    ) {
        let path = events_dir.join(name);
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let was_known = inner.lock().await.known.contains(name);

        if !exists {
            if was_known {
                let mut guard = inner.lock().await;
                guard.cancel_schedule(name);
                guard.known.remove(name);
            }
            return;
        }

        if was_known {
            inner.lock().await.cancel_schedule(name);
        }

        let mtime = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        match Self::parse_with_retries(&path).await {
            Ok(event) => {
                inner.lock().await.known.insert(name.to_string());
                Self::schedule(events_dir, inner, start_time, dispatch.clone(), name.to_string(), event, mtime)
                    .await;
            }
            Err(err) => {
                tracing::warn!(file = %name, %err, "failed to parse event file, deleting");
                let _ = tokio::fs::remove_file(&path).await;
                inner.lock().await.known.remove(name);
            }
        }
    }

    /// Read and parse an event file with up to 3 retries and exponential
    /// backoff — editors often write non-atomically.
    async fn parse_with_retries(path: &Path) -> Result<GuppyEvent> {
        let mut last_err = None;
        for delay in PARSE_RETRY_DELAYS {
            match tokio::fs::read_to_string(path).await {
                Ok(raw) => match serde_json::from_str::<GuppyEvent>(&raw) {
                    Ok(event) => return Ok(event),
                    Err(err) => last_err = Some(err),
                },
                Err(_) => {
                    // File briefly unreadable mid-write; retry.
                }
            }
            tokio::time::sleep(delay).await;
        }
        // One last straight attempt after the final backoff.
        let raw = tokio::fs::read_to_string(path).await.map_err(crate::error::Error::Io)?;
        serde_json::from_str::<GuppyEvent>(&raw)
            .map_err(|source| {
                EventError::Malformed {
                    path: path.display().to_string(),
                    source: last_err.unwrap_or(source),
                }
                .into()
            })
    }

    async fn schedule(
        events_dir: &Path,
        inner: &Arc<Mutex<Inner>>,
        start_time: DateTime<Utc>,
        dispatch: DispatchFn,
        name: String,
        event: GuppyEvent,
        mtime: DateTime<Utc>,
    ) {
        let path = events_dir.join(&name);
        match &event {
            GuppyEvent::Immediate { .. } => {
                if mtime < start_time {
                    tracing::info!(file = %name, "stale immediate event, discarding");
                    let _ = tokio::fs::remove_file(&path).await;
                    inner.lock().await.known.remove(&name);
                    return;
                }
                Self::fire(&dispatch, &event, &name).await;
                let _ = tokio::fs::remove_file(&path).await;
                inner.lock().await.known.remove(&name);
            }
            GuppyEvent::OneShot { at, timezone, .. } => {
                let delay = match schedule::one_shot_delay(at, timezone.as_deref(), Utc::now()) {
                    Ok(delay) => delay,
                    Err(err) => {
                        tracing::warn!(file = %name, %err, "invalid one-shot schedule, deleting");
                        let _ = tokio::fs::remove_file(&path).await;
                        inner.lock().await.known.remove(&name);
                        return;
                    }
                };
                let events_dir = events_dir.to_path_buf();
                let inner_for_task = inner.clone();
                let name_for_task = name.clone();
                let event_for_task = event.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::fire(&dispatch, &event_for_task, &name_for_task).await;
                    let _ = tokio::fs::remove_file(events_dir.join(&name_for_task)).await;
                    inner_for_task.lock().await.known.remove(&name_for_task);
                });
                inner.lock().await.timers.insert(name, handle);
            }
            GuppyEvent::Periodic { schedule: cron_expr, timezone, .. } => {
                if let Err(err) = schedule::next_periodic(cron_expr, timezone, Utc::now()) {
                    tracing::warn!(file = %name, %err, "invalid cron expression, deleting");
                    let _ = tokio::fs::remove_file(&path).await;
                    inner.lock().await.known.remove(&name);
                    return;
                }
                let cron_expr = cron_expr.clone();
                let timezone = timezone.clone();
                let name_for_task = name.clone();
                let event_for_task = event.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        let Ok((delay, _)) = schedule::next_periodic(&cron_expr, &timezone, Utc::now()) else {
                            break;
                        };
                        tokio::time::sleep(delay).await;
                        Self::fire(&dispatch, &event_for_task, &name_for_task).await;
                    }
                });
                inner.lock().await.crons.insert(name, handle);
            }
        }
    }

    async fn fire(dispatch: &DispatchFn, event: &GuppyEvent, name: &str) {
        let formatted = format!(
            "[EVENT:{name}:{}:{}] {}",
            event_type_label(event),
            event.schedule_info(),
            event.text()
        );
        (dispatch)(event.target().clone(), formatted).await;
    }

    /// Close the watcher and cancel every pending timer, cron, and debounce
    /// task. Idempotent.
    pub async fn shutdown(&self) {
        self.watch_task.abort();
        let mut guard = self.inner.lock().await;
        for (_, handle) in guard.timers.drain() {
            handle.abort();
        }
        for (_, handle) in guard.crons.drain() {
            handle.abort();
        }
        for (_, handle) in guard.debounce.drain() {
            handle.abort();
        }
        guard.known.clear();
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.watch_task.abort();
        let _ = self.watcher.unwatch(&self.events_dir);
    }
}

fn event_type_label(event: &GuppyEvent) -> &'static str {
    match event {
        GuppyEvent::Immediate { .. } => "immediate",
        GuppyEvent::OneShot { .. } => "one-shot",
        GuppyEvent::Periodic { .. } => "periodic",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventTarget;
    use tokio::sync::Mutex as AsyncMutex;

    fn recording_dispatch() -> (DispatchFn, Arc<AsyncMutex<Vec<(EventTarget, String)>>>) {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let log_for_closure = log.clone();
        let dispatch: DispatchFn = Arc::new(move |target, text| {
            let log = log_for_closure.clone();
            Box::pin(async move {
                log.lock().await.push((target, text));
            })
        });
        (dispatch, log)
    }

    #[tokio::test]
    async fn immediate_event_dispatches_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let events_dir = dir.path().join("events");
        tokio::fs::create_dir_all(&events_dir).await.unwrap();
        let (dispatch, log) = recording_dispatch();
        let bus = EventBus::start(events_dir.clone(), dispatch).await.unwrap();

        let path = events_dir.join("hi.json");
        tokio::fs::write(
            &path,
            r#"{"type":"immediate","text":"hi","target":{"thread_id":"slack:C:T"}}"#,
        )
        .await
        .unwrap();
        bus.handle_file("hi.json").await;

        assert!(!path.exists());
        let entries = log.lock().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].1.starts_with("[EVENT:hi.json:immediate:immediate] hi"));
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn stale_immediate_event_is_deleted_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let events_dir = dir.path().join("events");
        tokio::fs::create_dir_all(&events_dir).await.unwrap();
        let path = events_dir.join("stale.json");
        tokio::fs::write(
            &path,
            r#"{"type":"immediate","text":"hi","target":{"thread_id":"slack:C:T"}}"#,
        )
        .await
        .unwrap();

        let (dispatch, log) = recording_dispatch();
        // start_time is captured when the bus starts, which is after the
        // file's mtime above, so the scan during start() finds it stale.
        let bus = EventBus::start(events_dir.clone(), dispatch).await.unwrap();
        bus.handle_file("stale.json").await;

        assert!(!path.exists());
        assert!(log.lock().await.is_empty());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_cron_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let events_dir = dir.path().join("events");
        tokio::fs::create_dir_all(&events_dir).await.unwrap();
        let (dispatch, _log) = recording_dispatch();
        let bus = EventBus::start(events_dir.clone(), dispatch).await.unwrap();

        let path = events_dir.join("bad.json");
        tokio::fs::write(
            &path,
            r#"{"type":"periodic","text":"tick","target":{"channel_id":"slack:C"},"schedule":"not a cron","timezone":"UTC"}"#,
        )
        .await
        .unwrap();
        bus.handle_file("bad.json").await;

        assert!(!path.exists());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_event_fires_and_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let events_dir = dir.path().join("events");
        tokio::fs::create_dir_all(&events_dir).await.unwrap();
        let (dispatch, log) = recording_dispatch();
        let bus = EventBus::start(events_dir.clone(), dispatch).await.unwrap();

        let path = events_dir.join("tick.json");
        tokio::fs::write(
            &path,
            r#"{"type":"periodic","text":"tick","target":{"channel_id":"slack:C"},"schedule":"* * * * * *","timezone":"UTC"}"#,
        )
        .await
        .unwrap();
        bus.handle_file("tick.json").await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(path.exists());
        assert!(!log.lock().await.is_empty());
        bus.shutdown().await;
    }
}
