//! Local recordings: copy-remuxing a live stream into a file through an
//! external transcoder, and the status lifecycle of each recording task.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::error::{StoreError, TaskError};
use crate::api::models::{Channel, DownloadStatus, DownloadTask};
use crate::api::store::EntityStore;

/// How long ffmpeg gets to finalize the container after being asked to quit.
const STOP_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL: usize = 512;
const EVENT_CAPACITY: usize = 64;

/// Read `input`, copy every stream into `output` without re-encoding.
/// HLS, RTMP and FLV sources all get the same command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeCommand {
    pub input: String,
    pub output: String,
}

impl TranscodeCommand {
    pub fn copy_remux(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(self.input.clone());
        args.extend(["-c".to_string(), "copy".to_string()]);
        args.push(self.output.clone());
        args
    }

    pub fn command_line(&self) -> String {
        self.args().join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOutcome {
    Success,
    Cancelled,
    Failure { code: Option<i32>, message: String },
}

/// External process that performs the remux.
///
/// The returned future resolves once the run is over. Cancelling the token
/// asks the run to stop; it then resolves with [`TranscodeOutcome::Cancelled`].
pub trait Transcoder: Send + Sync {
    fn execute(
        &self,
        command: TranscodeCommand,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, TranscodeOutcome>;
}

pub struct FfmpegTranscoder {
    binary: String,
    running: TaskTracker,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            running: TaskTracker::new(),
        }
    }

    /// Waits until every ffmpeg process started here has exited, including
    /// ones that are still finalizing their output after a stop.
    pub async fn wait_idle(&self) {
        self.running.close();
        self.running.wait().await;
        self.running.reopen();
    }

    pub async fn is_available(&self) -> bool {
        match Command::new(&self.binary).arg("-version").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Transcoder for FfmpegTranscoder {
    fn execute(
        &self,
        command: TranscodeCommand,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, TranscodeOutcome> {
        // Dropping the returned future does not stop ffmpeg; only `cancel` does.
        let supervisor = self
            .running
            .spawn(run_ffmpeg(self.binary.clone(), command, cancel));
        async move {
            supervisor.await.unwrap_or_else(|e| TranscodeOutcome::Failure {
                code: None,
                message: format!("ffmpeg supervisor failed: {}", e),
            })
        }
        .boxed()
    }
}

async fn run_ffmpeg(
    binary: String,
    command: TranscodeCommand,
    cancel: CancellationToken,
) -> TranscodeOutcome {
    debug!("{} {}", binary, command.command_line());

    let mut child = match Command::new(&binary)
        .args(command.args())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return TranscodeOutcome::Failure {
                code: None,
                message: format!("failed to start {}: {}", binary, e),
            }
        }
    };

    let stderr = child.stderr.take();
    let stderr_reader = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        buf
    });

    tokio::select! {
        status = child.wait() => {
            let stderr = stderr_reader.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => TranscodeOutcome::Success,
                Ok(status) => {
                    let tail = stderr_tail(&stderr);
                    TranscodeOutcome::Failure {
                        code: status.code(),
                        message: if tail.is_empty() {
                            format!("ffmpeg exited with {}", status)
                        } else {
                            tail
                        },
                    }
                }
                Err(e) => TranscodeOutcome::Failure {
                    code: None,
                    message: format!("failed to wait for ffmpeg: {}", e),
                },
            }
        }
        _ = cancel.cancelled() => {
            // 'q' lets ffmpeg write the container trailer before exiting.
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(b"q").await;
            }
            if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                warn!("ffmpeg ignored quit request, killing it");
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill ffmpeg: {}", e);
                }
                let _ = child.wait().await;
            }
            stderr_reader.abort();
            TranscodeOutcome::Cancelled
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map_or(0, |(i, _)| i);
    trimmed[start..].to_string()
}

/// Published on every terminal status change.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub id: String,
    pub status: DownloadStatus,
    pub error_message: Option<String>,
}

struct ActiveTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<EntityStore>,
    transcoder: Arc<dyn Transcoder>,
    // Liveness cache only; the store stays authoritative for status.
    active: Mutex<HashMap<String, ActiveTask>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Inner {
    async fn record(
        &self,
        id: &str,
        status: DownloadStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        self.store
            .update_task_status(id, status, error_message.clone())
            .await?;
        let _ = self.events.send(TaskEvent {
            id: id.to_string(),
            status,
            error_message,
        });
        Ok(())
    }

    async fn finish(&self, id: &str, outcome: TranscodeOutcome) {
        let mut active = self.active.lock().await;
        if active.remove(id).is_none() {
            debug!("Task {} was stopped before its transcoder returned", id);
            return;
        }

        let (status, message) = match outcome {
            TranscodeOutcome::Success => {
                info!("Download completed for task: {}", id);
                (DownloadStatus::Completed, None)
            }
            TranscodeOutcome::Cancelled => {
                info!("Download cancelled for task: {}", id);
                (DownloadStatus::Cancelled, None)
            }
            TranscodeOutcome::Failure { code, message } => {
                let err = TaskError::TranscoderFailure { code, message };
                error!("Download failed for task {}: {}", id, err);
                (DownloadStatus::Error, Some(err.to_string()))
            }
        };

        if let Err(e) = self.record(id, status, message).await {
            error!("Failed to record {} for task {}: {}", status, id, e);
        }
        drop(active);
    }
}

/// Owns the status transitions of locally executed recordings.
///
/// `Downloading` moves to exactly one of `Completed`, `Cancelled` or `Error`:
/// the active set and the terminal write change inside one critical section,
/// so a stop racing a transcoder exit records only one of them.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(store: Arc<EntityStore>, transcoder: Arc<dyn Transcoder>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                transcoder,
                active: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Prepares a recording of `channel` into the configured download directory.
    /// Nothing is persisted when the directory is missing or the file cannot be created.
    pub async fn create_task(
        &self,
        channel: &Channel,
        title: &str,
    ) -> Result<DownloadTask, TaskError> {
        let dir = self
            .inner
            .store
            .download_dir()
            .await?
            .ok_or(TaskError::NoDownloadDirectoryConfigured)?;

        let stem = format!(
            "{}_{}",
            sanitize_file_name(title),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = create_destination(&dir, &stem).await?;

        let task = DownloadTask::new(title, channel.address.as_str(), path.to_string_lossy());
        if let Err(e) = self.inner.store.add_download_task(task.clone()).await {
            let _ = fs::remove_file(&path).await;
            return Err(e.into());
        }
        info!("Created download task {} -> {}", task.id, task.output_path);
        Ok(task)
    }

    /// Launches the transcoder for `task`. Returns `false` without doing
    /// anything if the task is already running here or is no longer downloading.
    pub async fn start(&self, task: &DownloadTask) -> Result<bool, TaskError> {
        let mut active = self.inner.active.lock().await;
        if active.contains_key(&task.id) {
            warn!("Download already in progress for task: {}", task.id);
            return Ok(false);
        }
        match self.inner.store.download_task(&task.id).await? {
            Some(stored) if stored.status == DownloadStatus::Downloading => {}
            Some(stored) => {
                warn!("Task {} is already {}, not starting", task.id, stored.status);
                return Ok(false);
            }
            None => {
                warn!("Unknown download task: {}", task.id);
                return Ok(false);
            }
        }

        let command =
            TranscodeCommand::copy_remux(task.stream_url.as_str(), task.output_path.as_str());
        info!("Starting download with command: {}", command.command_line());

        let cancel = CancellationToken::new();
        let run = self.inner.transcoder.execute(command, cancel.clone());
        let inner = Arc::clone(&self.inner);
        let id = task.id.clone();
        let handle = tokio::spawn(async move {
            let outcome = run.await;
            inner.finish(&id, outcome).await;
        });

        active.insert(task.id.clone(), ActiveTask { cancel, handle });
        Ok(true)
    }

    /// Cancels a running task and marks it `Cancelled` right away, without
    /// waiting for the transcoder to confirm. Returns `false` if it was not running.
    pub async fn stop(&self, id: &str) -> Result<bool, TaskError> {
        let mut active = self.inner.active.lock().await;
        let Some(task) = active.remove(id) else {
            debug!("Task {} is not running", id);
            return Ok(false);
        };
        task.cancel.cancel();
        task.handle.abort();
        info!("Download cancelled for task: {}", id);
        self.inner.record(id, DownloadStatus::Cancelled, None).await?;
        Ok(true)
    }

    /// Stops everything still running; used when the owning process shuts down.
    pub async fn shutdown(&self) -> usize {
        let ids = self.active_ids().await;
        let mut stopped = 0;
        for id in &ids {
            match self.stop(id).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to stop task {} on shutdown: {}", id, e),
            }
        }
        if stopped > 0 {
            info!("Stopped {} active downloads", stopped);
        }
        stopped
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.inner.active.lock().await.keys().cloned().collect()
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.inner.active.lock().await.contains_key(id)
    }

    /// Forgets a task record; the recorded file stays. A task that is still
    /// downloading is refused. Returns `false` for an unknown id.
    pub async fn remove_task(&self, id: &str) -> Result<bool, TaskError> {
        let active = self.inner.active.lock().await;
        let still_downloading = || TaskError::StillDownloading { id: id.to_string() };
        if active.contains_key(id) {
            return Err(still_downloading());
        }
        match self.inner.store.download_task(id).await? {
            None => Ok(false),
            Some(task) if task.status == DownloadStatus::Downloading => Err(still_downloading()),
            Some(_) => {
                let removed = self.inner.store.remove_download_task(id).await?;
                info!("Removed download task: {}", id);
                Ok(removed)
            }
        }
    }

    /// Marks persisted `Downloading` tasks that nothing in this process is
    /// running as `Error("interrupted")`. Only runs when called.
    pub async fn reconcile_interrupted(&self) -> Result<Vec<String>, TaskError> {
        let active = self.inner.active.lock().await;
        let stale: Vec<String> = self
            .inner
            .store
            .download_tasks()
            .await?
            .into_iter()
            .filter(|task| {
                task.status == DownloadStatus::Downloading && !active.contains_key(&task.id)
            })
            .map(|task| task.id)
            .collect();

        for id in &stale {
            warn!("Task {} was interrupted by a restart", id);
            self.inner
                .record(id, DownloadStatus::Error, Some("interrupted".to_string()))
                .await?;
        }
        Ok(stale)
    }
}

/// Replaces characters that are not allowed in file names on common filesystems.
pub fn sanitize_file_name(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "recording".to_string()
    } else {
        cleaned
    }
}

async fn create_destination(dir: &Path, stem: &str) -> Result<PathBuf, TaskError> {
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}.mp4", stem)
        } else {
            format!("{} ({}).mp4", stem, attempt)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < 100 => attempt += 1,
            Err(source) => return Err(TaskError::DestinationUnavailable { path, source }),
        }
    }
}

/// A finished recording sitting in the download directory.
#[derive(Debug, Clone)]
pub struct RecordingFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Deletes the recording `name` from `dir`. Only a bare `.mp4` file name is
/// accepted, so nothing outside `dir` can be reached.
pub async fn delete_recording(dir: &Path, name: &str) -> Result<(), TaskError> {
    let candidate = Path::new(name);
    let mut components = candidate.components();
    let bare = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    let is_mp4 = candidate
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
    if !bare || !is_mp4 {
        return Err(TaskError::InvalidRecordingName(name.to_string()));
    }

    let path = dir.join(candidate);
    match fs::remove_file(&path).await {
        Ok(()) => {
            info!("Deleted recording {}", path.display());
            Ok(())
        }
        Err(source) => Err(TaskError::DeleteFailed { path, source }),
    }
}

/// `.mp4` files in `dir`, newest first.
pub async fn recordings(dir: &Path) -> Result<Vec<RecordingFile>, StoreError> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_mp4 = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
        if !is_mp4 {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        files.push(RecordingFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            path,
        });
    }
    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::timeout;

    enum Script {
        Finish(TranscodeOutcome),
        UntilCancelled,
    }

    struct ScriptedTranscoder {
        script: Script,
        runs: StdMutex<Vec<(TranscodeCommand, CancellationToken)>>,
    }

    impl ScriptedTranscoder {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                runs: StdMutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> Vec<(TranscodeCommand, CancellationToken)> {
            self.runs.lock().unwrap().clone()
        }
    }

    impl Transcoder for ScriptedTranscoder {
        fn execute(
            &self,
            command: TranscodeCommand,
            cancel: CancellationToken,
        ) -> BoxFuture<'static, TranscodeOutcome> {
            self.runs.lock().unwrap().push((command, cancel.clone()));
            match &self.script {
                Script::Finish(outcome) => futures::future::ready(outcome.clone()).boxed(),
                Script::UntilCancelled => async move {
                    cancel.cancelled().await;
                    TranscodeOutcome::Cancelled
                }
                .boxed(),
            }
        }
    }

    async fn manager(script: Script) -> (TaskManager, Arc<ScriptedTranscoder>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EntityStore::in_memory());
        store.set_download_dir(Some(dir.path())).await.unwrap();
        let transcoder = ScriptedTranscoder::new(script);
        let manager = TaskManager::new(store, transcoder.clone());
        (manager, transcoder, dir)
    }

    fn alice() -> Channel {
        Channel::new("Alice", "http://h/a.m3u8")
    }

    async fn next_event(rx: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn command_is_uniform_copy_remux() {
        for input in ["http://h/a.m3u8", "rtmp://h/live/1", "http://h/b.flv"] {
            let command = TranscodeCommand::copy_remux(input, "/d/out.mp4");
            assert_eq!(
                command.args(),
                vec![
                    "-hide_banner",
                    "-loglevel",
                    "error",
                    "-y",
                    "-i",
                    input,
                    "-c",
                    "copy",
                    "/d/out.mp4",
                ]
            );
        }
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("a/b:c*?"), "a_b_c__");
        assert_eq!(sanitize_file_name("  "), "recording");
        assert_eq!(sanitize_file_name("主播 Alice"), "主播 Alice");
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(2000) + "Connection refused";
        let tail = stderr_tail(&long);
        assert_eq!(tail.chars().count(), STDERR_TAIL);
        assert!(tail.ends_with("Connection refused"));
        assert_eq!(stderr_tail("  short \n"), "short");
    }

    #[tokio::test]
    async fn create_requires_download_dir() {
        let store = Arc::new(EntityStore::in_memory());
        let manager = TaskManager::new(
            Arc::clone(&store),
            ScriptedTranscoder::new(Script::Finish(TranscodeOutcome::Success)),
        );

        let err = manager.create_task(&alice(), "Alice").await.unwrap_err();
        assert!(matches!(err, TaskError::NoDownloadDirectoryConfigured));
        assert!(store.download_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_fails_cleanly_for_unusable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EntityStore::in_memory());
        store
            .set_download_dir(Some(dir.path().join("does-not-exist").as_path()))
            .await
            .unwrap();
        let manager = TaskManager::new(
            Arc::clone(&store),
            ScriptedTranscoder::new(Script::Finish(TranscodeOutcome::Success)),
        );

        let err = manager.create_task(&alice(), "Alice").await.unwrap_err();
        assert!(matches!(err, TaskError::DestinationUnavailable { .. }));
        assert!(store.download_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_persists_downloading_task() {
        let (manager, _, dir) = manager(Script::Finish(TranscodeOutcome::Success)).await;
        let task = manager.create_task(&alice(), "Alice").await.unwrap();

        assert_eq!(task.status, DownloadStatus::Downloading);
        assert!(!task.id.is_empty());
        assert!(task.output_path.starts_with(&*dir.path().to_string_lossy()));
        assert!(task.output_path.ends_with(".mp4"));
        assert!(Path::new(&task.output_path).exists());
        assert_eq!(task.stream_url, "http://h/a.m3u8");
        assert_eq!(manager.store().download_task(&task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn same_title_in_same_second_gets_distinct_files() {
        let (manager, _, _dir) = manager(Script::Finish(TranscodeOutcome::Success)).await;
        let a = manager.create_task(&alice(), "Alice").await.unwrap();
        let b = manager.create_task(&alice(), "Alice").await.unwrap();
        assert_ne!(a.output_path, b.output_path);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn success_completes_task() {
        let (manager, transcoder, _dir) = manager(Script::Finish(TranscodeOutcome::Success)).await;
        let mut events = manager.subscribe();
        let task = manager.create_task(&alice(), "Alice").await.unwrap();

        assert!(manager.start(&task).await.unwrap());
        let event = next_event(&mut events).await;
        assert_eq!(event.id, task.id);
        assert_eq!(event.status, DownloadStatus::Completed);

        let stored = manager.store().download_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert!(stored.end_time.is_some());
        assert!(stored.error_message.is_none());
        assert!(!manager.is_active(&task.id).await);

        let runs = transcoder.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0.input, "http://h/a.m3u8");
        assert_eq!(runs[0].0.output, task.output_path);
    }

    #[tokio::test]
    async fn failure_records_diagnostic() {
        let (manager, _, _dir) = manager(Script::Finish(TranscodeOutcome::Failure {
            code: Some(1),
            message: "Connection refused".into(),
        }))
        .await;
        let mut events = manager.subscribe();
        let task = manager.create_task(&alice(), "Alice").await.unwrap();
        manager.start(&task).await.unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.status, DownloadStatus::Error);

        let stored = manager.store().download_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Error);
        assert!(stored.end_time.is_some());
        assert!(stored.error_message.unwrap().contains("Connection refused"));
    }

    #[tokio::test]
    async fn transcoder_cancellation_is_not_an_error() {
        let (manager, _, _dir) = manager(Script::Finish(TranscodeOutcome::Cancelled)).await;
        let mut events = manager.subscribe();
        let task = manager.create_task(&alice(), "Alice").await.unwrap();
        manager.start(&task).await.unwrap();

        assert_eq!(next_event(&mut events).await.status, DownloadStatus::Cancelled);
        let stored = manager.store().download_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Cancelled);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn double_start_runs_transcoder_once() {
        let (manager, transcoder, _dir) = manager(Script::UntilCancelled).await;
        let task = manager.create_task(&alice(), "Alice").await.unwrap();

        assert!(manager.start(&task).await.unwrap());
        assert!(!manager.start(&task).await.unwrap());
        assert_eq!(transcoder.runs().len(), 1);
        assert_eq!(manager.active_ids().await, vec![task.id.clone()]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_cancels_once() {
        let (manager, transcoder, _dir) = manager(Script::UntilCancelled).await;
        let mut events = manager.subscribe();
        let task = manager.create_task(&alice(), "Alice").await.unwrap();
        manager.start(&task).await.unwrap();

        assert!(manager.stop(&task.id).await.unwrap());
        let stored = manager.store().download_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Cancelled);
        assert!(stored.end_time.is_some());
        assert!(transcoder.runs()[0].1.is_cancelled());
        assert!(!manager.is_active(&task.id).await);

        assert_eq!(next_event(&mut events).await.status, DownloadStatus::Cancelled);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        assert!(!manager.stop(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_tasks_cannot_restart() {
        let (manager, transcoder, _dir) = manager(Script::UntilCancelled).await;
        let task = manager.create_task(&alice(), "Alice").await.unwrap();
        manager.start(&task).await.unwrap();
        manager.stop(&task.id).await.unwrap();

        assert!(!manager.start(&task).await.unwrap());
        assert_eq!(transcoder.runs().len(), 1);

        let unknown = DownloadTask::new("Ghost", "http://h/g.m3u8", "/d/g.mp4");
        assert!(!manager.start(&unknown).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let (manager, _, _dir) = manager(Script::UntilCancelled).await;
        let a = manager.create_task(&alice(), "Alice").await.unwrap();
        let b = manager
            .create_task(&Channel::new("Bob", "rtmp://h/live/b"), "Bob")
            .await
            .unwrap();
        manager.start(&a).await.unwrap();
        manager.start(&b).await.unwrap();

        assert_eq!(manager.shutdown().await, 2);
        assert!(manager.active_ids().await.is_empty());
        for task in manager.store().download_tasks().await.unwrap() {
            assert_eq!(task.status, DownloadStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn shutdown_after_finish_keeps_outcome() {
        let (manager, _, _dir) = manager(Script::Finish(TranscodeOutcome::Failure {
            code: Some(1),
            message: "404 Not Found".into(),
        }))
        .await;
        let mut events = manager.subscribe();
        let task = manager.create_task(&alice(), "Alice").await.unwrap();
        manager.start(&task).await.unwrap();
        assert_eq!(next_event(&mut events).await.status, DownloadStatus::Error);

        assert_eq!(manager.shutdown().await, 0);
        assert_eq!(manager.shutdown().await, 0);
        let stored = manager.store().download_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Error);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn reconcile_marks_only_orphans() {
        let (manager, _, _dir) = manager(Script::UntilCancelled).await;
        let orphan = manager.create_task(&alice(), "Alice").await.unwrap();
        let running = manager.create_task(&alice(), "Alice live").await.unwrap();
        manager.start(&running).await.unwrap();

        let reconciled = manager.reconcile_interrupted().await.unwrap();
        assert_eq!(reconciled, vec![orphan.id.clone()]);

        let store = manager.store();
        let orphan = store.download_task(&orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, DownloadStatus::Error);
        assert_eq!(orphan.error_message.as_deref(), Some("interrupted"));
        let running = store.download_task(&running.id).await.unwrap().unwrap();
        assert_eq!(running.status, DownloadStatus::Downloading);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn downloading_tasks_cannot_be_removed() {
        let (manager, _, _dir) = manager(Script::UntilCancelled).await;
        let running = manager.create_task(&alice(), "Alice").await.unwrap();
        let orphan = manager.create_task(&alice(), "Alice again").await.unwrap();
        manager.start(&running).await.unwrap();

        for id in [&running.id, &orphan.id] {
            let err = manager.remove_task(id).await.unwrap_err();
            assert!(matches!(err, TaskError::StillDownloading { .. }));
        }
        assert_eq!(manager.store().download_tasks().await.unwrap().len(), 2);
        assert!(manager.is_active(&running.id).await);

        manager.stop(&running.id).await.unwrap();
        assert!(manager.remove_task(&running.id).await.unwrap());
        assert!(manager.store().download_task(&running.id).await.unwrap().is_none());
        assert!(Path::new(&running.output_path).exists());
        assert!(!manager.remove_task("no-such-task").await.unwrap());
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_a_failure() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/bin/ffmpeg");
        assert!(!transcoder.is_available().await);

        let outcome = transcoder
            .execute(
                TranscodeCommand::copy_remux("http://h/a.m3u8", "/tmp/never.mp4"),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, TranscodeOutcome::Failure { code: None, .. }));
        timeout(Duration::from_secs(5), transcoder.wait_idle()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_recording_stays_inside_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("recordings");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("a.mp4"), b"1234").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();
        std::fs::write(root.path().join("outside.mp4"), b"x").unwrap();

        delete_recording(&dir, "a.mp4").await.unwrap();
        assert!(!dir.join("a.mp4").exists());

        let outside = root.path().join("outside.mp4");
        let absolute = outside.to_string_lossy().into_owned();
        for name in ["../outside.mp4", absolute.as_str(), "sub/a.mp4", "notes.txt", "..", ""] {
            let err = delete_recording(&dir, name).await.unwrap_err();
            assert!(matches!(err, TaskError::InvalidRecordingName(_)), "{}", name);
        }
        assert!(outside.exists());
        assert!(dir.join("notes.txt").exists());

        let err = delete_recording(&dir, "a.mp4").await.unwrap_err();
        assert!(matches!(err, TaskError::DeleteFailed { .. }));
    }

    #[tokio::test]
    async fn recordings_lists_mp4_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"1234").unwrap();
        std::fs::write(dir.path().join("b.MP4"), b"12").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("folder.mp4")).unwrap();

        let files = recordings(dir.path()).await.unwrap();
        let mut names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a.mp4", "b.MP4"]);
        assert!(files.iter().any(|f| f.size == 4));
    }
}
