//! Download orchestration: spawns yt-dlp for one job, turns its output into
//! store updates plus progress events, and supervises the task so every
//! failure ends in a stored `failed` state.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, FetchError};
use crate::metadata::{MetadataFetcher, lookup_or_fetch};
use crate::models::{
    Download, DownloadStatus, DownloadUpdate, MediaFormat, NewDownload, ProgressEvent, Quality,
};
use crate::progress::{ProgressLine, parse_line};
use crate::security::contained_path;
use crate::store::JobStore;
use crate::validators::DownloadRequest;
use crate::ytdlp::{YtDlp, format_selector, output_template};

/// Stderr lines kept for the failure message of a non-zero exit.
const STDERR_TAIL: usize = 20;

/// Receiver of the progress events produced while a job runs. Delivery is
/// best-effort; the job store stays the source of truth.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: &ProgressEvent);
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: Arc<JobStore>,
    fetcher: MetadataFetcher,
    tool: YtDlp,
    download_dir: PathBuf,
    running: Mutex<HashMap<u64, RunningJob>>,
}

struct RunningJob {
    generation: u64,
    token: CancellationToken,
}

/// Everything one run needs, cloned into the job and supervisor tasks.
#[derive(Clone)]
struct JobContext {
    id: u64,
    generation: u64,
    url: String,
    quality: Quality,
    format: MediaFormat,
    sink: Arc<dyn ProgressSink>,
}

/// Parser state carried across the lines of one run.
#[derive(Default)]
struct LineState {
    destination: Option<PathBuf>,
    finished: bool,
}

impl DownloadOrchestrator {
    pub fn new(store: Arc<JobStore>, tool: YtDlp, download_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                fetcher: MetadataFetcher::new(tool.clone()),
                tool,
                download_dir,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn fetcher(&self) -> &MetadataFetcher {
        &self.inner.fetcher
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    /// Accepts a validated request: resolves the video (cache first), creates
    /// the pending job, and starts it in the background. Returns as soon as the
    /// process is launched; the handle settles when the job does.
    pub async fn submit(
        &self,
        request: &DownloadRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<(Download, JoinHandle<()>), FetchError> {
        let video = lookup_or_fetch(&self.inner.store, &self.inner.fetcher, &request.url).await?;
        let (download, generation) = self.inner.store.create_download_in(NewDownload {
            video_id: video.video_id.clone(),
            url: request.url.clone(),
            title: video.title.clone(),
            quality: request.quality,
            format: request.format,
            thumbnail: Some(video.thumbnail.clone()).filter(|thumb| !thumb.is_empty()),
        });
        tracing::info!(
            download = download.id,
            video = %download.video_id,
            quality = %download.quality,
            format = %download.format,
            "download accepted"
        );
        let handle = self.spawn_in(
            generation,
            download.id,
            request.url.clone(),
            request.quality,
            request.format,
            sink,
        );
        Ok((download, handle))
    }

    /// Runs one job to completion on the current task. On error the job has
    /// already been marked `failed` and a failure event published.
    pub async fn start(
        &self,
        download_id: u64,
        url: &str,
        quality: Quality,
        format: MediaFormat,
        on_progress: Arc<dyn ProgressSink>,
    ) -> Result<(), DownloadError> {
        let ctx = JobContext {
            id: download_id,
            generation: self.inner.store.generation(),
            url: url.to_string(),
            quality,
            format,
            sink: on_progress,
        };
        let token = self.register(&ctx);
        let result = self.run(&ctx, &token).await;
        self.unregister(&ctx);
        result
    }

    /// Starts a job on its own task under a supervisor. If the job task panics
    /// or is aborted, the supervisor records the failure on the job.
    pub fn spawn(
        &self,
        download_id: u64,
        url: String,
        quality: Quality,
        format: MediaFormat,
        on_progress: Arc<dyn ProgressSink>,
    ) -> JoinHandle<()> {
        let generation = self.inner.store.generation();
        self.spawn_in(generation, download_id, url, quality, format, on_progress)
    }

    /// [`DownloadOrchestrator::spawn`] for a job created in store
    /// `generation`. Once the history is cleared past it the job can no longer
    /// write anything.
    fn spawn_in(
        &self,
        generation: u64,
        download_id: u64,
        url: String,
        quality: Quality,
        format: MediaFormat,
        on_progress: Arc<dyn ProgressSink>,
    ) -> JoinHandle<()> {
        let ctx = JobContext {
            id: download_id,
            generation,
            url,
            quality,
            format,
            sink: on_progress,
        };
        let token = self.register(&ctx);

        let job = {
            let this = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { this.run(&ctx, &token).await })
        };

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = job.await;
            this.unregister(&ctx);
            match outcome {
                Ok(Ok(())) => tracing::info!(download = ctx.id, "download finished"),
                Ok(Err(DownloadError::Cancelled(_))) => {
                    tracing::info!(download = ctx.id, "download cancelled")
                }
                Ok(Err(err)) => tracing::warn!(download = ctx.id, "download failed: {err}"),
                Err(err) => {
                    tracing::error!(download = ctx.id, "download task aborted: {err}");
                    this.fail(&ctx, format!("Download task aborted: {err}"));
                }
            }
        })
    }

    /// Signals a running job to kill its process. Returns whether one was
    /// running.
    pub fn cancel(&self, download_id: u64) -> bool {
        match self.inner.running.lock().get(&download_id) {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, download_id: u64) -> bool {
        self.inner.running.lock().contains_key(&download_id)
    }

    /// Cancels the job if it is still running, removes its output file when
    /// one was recorded inside the download directory, then drops the record.
    /// Returns the removed record, or `None` for an unknown id.
    pub async fn remove_download(&self, download_id: u64) -> Option<Download> {
        let download = self.inner.store.get_download(download_id)?;
        if self.cancel(download_id) {
            tracing::info!(download = download_id, "cancelled running download before delete");
        }
        if let Some(path) = &download.file_path {
            self.remove_file(download_id, path).await;
        }
        self.inner.store.delete_download(download_id);
        Some(download)
    }

    /// Cancels every running job and clears the download history. Ids restart
    /// at 1, so nothing started before the clear may keep writing.
    pub fn clear_history(&self) {
        for job in self.inner.running.lock().values() {
            job.token.cancel();
        }
        self.inner.store.clear_history();
        tracing::info!("download history cleared");
    }

    /// Resolves a recorded file path, refusing anything outside the download
    /// directory.
    pub fn resolve_file(&self, path: &Path) -> Option<PathBuf> {
        contained_path(&self.inner.download_dir, path)
    }

    async fn remove_file(&self, download_id: u64, path: &Path) {
        let Some(path) = self.resolve_file(path) else {
            tracing::warn!(
                download = download_id,
                path = %path.display(),
                "refusing to delete file outside the download directory"
            );
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::info!(download = download_id, path = %path.display(), "deleted file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                download = download_id,
                path = %path.display(),
                "failed to delete file: {err}"
            ),
        }
    }

    fn register(&self, ctx: &JobContext) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner.running.lock().insert(
            ctx.id,
            RunningJob {
                generation: ctx.generation,
                token: token.clone(),
            },
        );
        token
    }

    fn unregister(&self, ctx: &JobContext) {
        let mut running = self.inner.running.lock();
        if running
            .get(&ctx.id)
            .is_some_and(|job| job.generation == ctx.generation)
        {
            running.remove(&ctx.id);
        }
    }

    async fn run(&self, ctx: &JobContext, token: &CancellationToken) -> Result<(), DownloadError> {
        let result = self.drive(ctx, token).await;
        if let Err(err) = &result {
            self.fail(ctx, err.to_string());
        }
        result
    }

    async fn drive(&self, ctx: &JobContext, token: &CancellationToken) -> Result<(), DownloadError> {
        let template = output_template(&self.inner.download_dir, ctx.id);
        let selector = format_selector(ctx.quality, ctx.format);
        tracing::info!(
            download = ctx.id,
            url = %ctx.url,
            selector = %selector,
            binary = %self.inner.tool.binary().display(),
            "starting yt-dlp download"
        );

        let mut child = self
            .inner
            .tool
            .download_command(&selector, &template, &ctx.url)
            .spawn()
            .map_err(DownloadError::ToolUnavailable)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp stdout was not captured"))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr_tail(stderr, ctx.id)));

        let mut stdout = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut state = LineState::default();
        loop {
            buf.clear();
            tokio::select! {
                _ = token.cancelled() => {
                    kill_child(ctx.id, &mut child).await;
                    return Err(DownloadError::Cancelled(ctx.id));
                }
                read = stdout.read_until(b'\n', &mut buf) => {
                    if read? == 0 {
                        break;
                    }
                    // File names in the tool's output are not guaranteed UTF-8.
                    let line = decode_line(&buf);
                    tracing::debug!(download = ctx.id, "yt-dlp: {line}");
                    if let Err(err) = self.apply_line(ctx, &mut state, &line) {
                        kill_child(ctx.id, &mut child).await;
                        return Err(err);
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = token.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = status else {
            kill_child(ctx.id, &mut child).await;
            return Err(DownloadError::Cancelled(ctx.id));
        };

        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        if !status.success() {
            if state.finished
                && let Some(path) = &state.destination
            {
                self.remove_file(ctx.id, path).await;
            }
            return Err(DownloadError::ExitStatus(exit_message(
                status,
                stderr_tail.back(),
            )));
        }
        if state.finished {
            return Ok(());
        }

        // Exit 0 without a recognized completion line: trust a recorded
        // destination, otherwise the job cannot be resolved.
        match state.destination.clone() {
            Some(path) => {
                tracing::warn!(
                    download = ctx.id,
                    path = %path.display(),
                    "yt-dlp exited cleanly without a completion line; using last destination"
                );
                self.complete(ctx, &mut state)
            }
            None => Err(DownloadError::Incomplete),
        }
    }

    fn apply_line(
        &self,
        ctx: &JobContext,
        state: &mut LineState,
        line: &str,
    ) -> Result<(), DownloadError> {
        match parse_line(line) {
            ProgressLine::Progress(report) => {
                if state.finished {
                    return Ok(());
                }
                let download = self.update(
                    ctx,
                    DownloadUpdate {
                        status: Some(DownloadStatus::Downloading),
                        progress: Some(report.percent),
                        file_size: Some(report.size),
                        download_speed: Some(report.speed.clone()),
                        eta: Some(report.eta.clone()),
                        ..DownloadUpdate::default()
                    },
                )?;
                ctx.sink.publish(&ProgressEvent {
                    id: ctx.id,
                    status: DownloadStatus::Downloading,
                    progress: download.progress,
                    download_speed: Some(report.speed),
                    eta: Some(report.eta),
                    error: None,
                });
            }
            ProgressLine::Destination(path) => {
                state.destination = Some(path);
            }
            ProgressLine::Complete { path } => {
                if state.finished {
                    return Ok(());
                }
                if path.is_some() {
                    state.destination = path;
                }
                self.complete(ctx, state)?;
            }
            ProgressLine::Unmatched => {}
        }
        Ok(())
    }

    fn complete(&self, ctx: &JobContext, state: &mut LineState) -> Result<(), DownloadError> {
        self.update(ctx, DownloadUpdate::completed(state.destination.clone()))?;
        state.finished = true;
        ctx.sink.publish(&ProgressEvent {
            id: ctx.id,
            status: DownloadStatus::Completed,
            progress: 100,
            download_speed: None,
            eta: None,
            error: None,
        });
        Ok(())
    }

    /// Applies an update for this run. A missing record means the job was
    /// deleted or the history cleared, which ends the run.
    fn update(&self, ctx: &JobContext, update: DownloadUpdate) -> Result<Download, DownloadError> {
        self.inner
            .store
            .update_download_in(ctx.generation, ctx.id, update)
            .ok_or(DownloadError::Cancelled(ctx.id))
    }

    fn fail(&self, ctx: &JobContext, message: String) {
        match self.inner.store.update_download_in(
            ctx.generation,
            ctx.id,
            DownloadUpdate::failed(message.clone()),
        ) {
            Some(download) => ctx.sink.publish(&ProgressEvent {
                id: ctx.id,
                status: DownloadStatus::Failed,
                progress: download.progress,
                download_speed: None,
                eta: None,
                error: Some(message),
            }),
            None => tracing::debug!(download = ctx.id, "job record gone; failure not stored"),
        }
    }
}

fn exit_message(status: ExitStatus, last_stderr: Option<&String>) -> String {
    let code = status
        .code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| status.to_string());
    match last_stderr {
        Some(line) => format!("Download failed with exit code {code}: {line}"),
        None => format!("Download failed with exit code {code}"),
    }
}

/// One raw output line with the terminator stripped. Invalid UTF-8 is
/// replaced rather than rejected.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

async fn kill_child(download_id: u64, child: &mut Child) {
    if let Err(err) = child.kill().await {
        tracing::warn!(download = download_id, "failed to kill yt-dlp: {err}");
    }
}

async fn collect_stderr_tail(stderr: ChildStderr, download_id: u64) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut stderr = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match stderr.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(download = download_id, "stopped reading yt-dlp stderr: {err}");
                break;
            }
        }
        let line = decode_line(&buf);
        tracing::debug!(download = download_id, "yt-dlp stderr: {line}");
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::install_stub;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Records every published event in order.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<ProgressEvent> {
            self.events.lock().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn publish(&self, event: &ProgressEvent) {
            self.events.lock().push(event.clone());
        }
    }

    /// Panics on the first event, records the rest.
    #[derive(Default)]
    struct PanicOnceSink {
        fired: AtomicBool,
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for PanicOnceSink {
        fn publish(&self, event: &ProgressEvent) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                panic!("sink exploded");
            }
            self.events.lock().push(event.clone());
        }
    }

    const METADATA_JSON: &str = r#"{"title":"Sample","duration":125,"view_count":1500,"thumbnail":"https://img.test/t.jpg","formats":[{"vcodec":"avc1","height":1080}]}"#;

    /// Stub that answers metadata requests and then runs `download_body`
    /// with `$target` set to the expanded output template.
    fn stub_with_download(dir: &Path, download_body: &str) -> PathBuf {
        install_stub(
            dir,
            &format!(
                r#"args=("$@")
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
  esac
  shift
done
if printf '%s\n' "${{args[@]}}" | grep -q -- '--dump-json'; then
  echo '{METADATA_JSON}'
  exit 0
fi
target=$(printf '%s' "$output" | sed -e 's/%(title)s/Sample/' -e 's/%(ext)s/mp4/')
{download_body}
"#
            ),
        )
    }

    struct Harness {
        temp: TempDir,
        downloads: PathBuf,
        orchestrator: DownloadOrchestrator,
    }

    impl Harness {
        fn new(download_body: &str) -> Self {
            let temp = tempdir().unwrap();
            let downloads = temp.path().join("downloads");
            std::fs::create_dir_all(&downloads).unwrap();
            let stub = stub_with_download(temp.path(), download_body);
            let orchestrator =
                DownloadOrchestrator::new(Arc::new(JobStore::new()), YtDlp::new(stub), downloads.clone());
            Self {
                temp,
                downloads,
                orchestrator,
            }
        }

        fn with_binary(binary: &str) -> Self {
            let temp = tempdir().unwrap();
            let downloads = temp.path().join("downloads");
            let orchestrator = DownloadOrchestrator::new(
                Arc::new(JobStore::new()),
                YtDlp::new(binary),
                downloads.clone(),
            );
            Self {
                temp,
                downloads,
                orchestrator,
            }
        }

        fn create_job(&self) -> Download {
            self.orchestrator.store().create_download(NewDownload {
                video_id: "abc123".into(),
                url: "https://youtu.be/abc123".into(),
                title: "Sample".into(),
                quality: Quality::P1080,
                format: MediaFormat::Mp4,
                thumbnail: None,
            })
        }

        async fn start(&self, id: u64, sink: Arc<dyn ProgressSink>) -> Result<(), DownloadError> {
            self.orchestrator
                .start(id, "https://youtu.be/abc123", Quality::P1080, MediaFormat::Mp4, sink)
                .await
        }
    }

    fn request() -> DownloadRequest {
        DownloadRequest {
            url: "https://youtu.be/abc123".into(),
            video_id: "abc123".into(),
            quality: Quality::P1080,
            format: MediaFormat::Mp4,
        }
    }

    async fn wait_for_status(store: &JobStore, id: u64, status: DownloadStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if store.get_download(id).map(|d| d.status) == Some(status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("status reached in time");
    }

    const HAPPY_PATH: &str = r#"echo "[download] Destination: $target"
echo "[download] 45.2% of 10.0MiB at 1.2MiB/s ETA 00:08"
echo "video" > "$target"
echo "[download] 100% of 10.00MiB in 00:00:01 at 10.00MiB/s"
"#;

    #[tokio::test]
    async fn submit_runs_end_to_end() {
        let harness = Harness::new(HAPPY_PATH);
        let sink = Arc::new(RecordingSink::default());

        let (download, handle) = harness
            .orchestrator
            .submit(&request(), sink.clone())
            .await
            .unwrap();
        assert_eq!(download.id, 1);
        assert_eq!(download.status, DownloadStatus::Pending);
        assert_eq!(download.progress, 0);
        assert_eq!(download.title, "Sample");
        assert_eq!(download.thumbnail.as_deref(), Some("https://img.test/t.jpg"));

        let video = harness.orchestrator.store().get_video("abc123").unwrap();
        assert_eq!(video.duration, "2:05");
        assert_eq!(video.views, "1.5K");

        handle.await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, DownloadStatus::Downloading);
        assert_eq!(events[0].progress, 45);
        assert_eq!(events[0].download_speed.as_deref(), Some("1.2MiB/s"));
        assert_eq!(events[0].eta.as_deref(), Some("00:08"));
        assert_eq!(events[1].status, DownloadStatus::Completed);
        assert_eq!(events[1].progress, 100);

        let stored = harness.orchestrator.store().get_download(1).unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.file_size.as_deref(), Some("10.0MiB"));
        assert!(stored.completed_at.is_some());
        let expected = harness.downloads.join("1_Sample.mp4");
        assert_eq!(stored.file_path.as_deref(), Some(expected.as_path()));
        assert!(expected.exists());
        assert!(!harness.orchestrator.is_running(1));
    }

    #[tokio::test]
    async fn non_zero_exit_marks_failed() {
        let harness = Harness::new(
            r#"echo "[download] 12.0% of 10.0MiB at 1.0MiB/s ETA 00:09"
echo "ERROR: unable to download video data: HTTP Error 403" >&2
exit 2
"#,
        );
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        let err = harness.start(job.id, sink.clone()).await.unwrap_err();
        assert!(matches!(err, DownloadError::ExitStatus(_)));

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert_eq!(stored.progress, 12);
        let error = stored.error.unwrap();
        assert!(error.contains("exit code 2"), "{error}");
        assert!(error.contains("HTTP Error 403"), "{error}");

        let last = sink.events().pop().unwrap();
        assert_eq!(last.status, DownloadStatus::Failed);
        assert_eq!(last.error.as_deref(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn spawn_failure_never_reaches_downloading() {
        let harness = Harness::with_binary("/nonexistent/yt-dlp");
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        let err = harness.start(job.id, sink.clone()).await.unwrap_err();
        assert!(matches!(err, DownloadError::ToolUnavailable(_)));

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert!(stored.error.unwrap().starts_with("Failed to spawn yt-dlp"));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, DownloadStatus::Failed);
        assert!(
            events
                .iter()
                .all(|event| event.status != DownloadStatus::Downloading)
        );
    }

    #[tokio::test]
    async fn clean_exit_without_completion_uses_destination() {
        let harness = Harness::new(
            r#"echo "[download] Destination: $target"
echo "[download] 80.0% of 10.0MiB at 1.0MiB/s ETA 00:02"
"#,
        );
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        harness.start(job.id, sink.clone()).await.unwrap();

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(
            stored.file_path,
            Some(harness.downloads.join(format!("{}_Sample.mp4", job.id)))
        );
        assert_eq!(sink.events().last().unwrap().status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn clean_exit_without_any_output_fails() {
        let harness = Harness::new("true\n");
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        let err = harness.start(job.id, sink).await.unwrap_err();
        assert!(matches!(err, DownloadError::Incomplete));
        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert!(stored.error.unwrap().contains("without reporting a completed file"));
    }

    #[tokio::test]
    async fn already_downloaded_line_completes_with_its_path() {
        let harness = Harness::new(
            r#"echo "[download] $target has already been downloaded"
echo "[download] 100%"
"#,
        );
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        harness.start(job.id, sink.clone()).await.unwrap();

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(
            stored.file_path,
            Some(harness.downloads.join(format!("{}_Sample.mp4", job.id)))
        );
        let completions = sink
            .events()
            .into_iter()
            .filter(|event| event.status == DownloadStatus::Completed)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn progress_after_completion_is_ignored() {
        let harness = Harness::new(
            r#"echo "[download] 100%"
echo "[download] 50.0% of 10.0MiB at 1.0MiB/s ETA 00:05"
"#,
        );
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        harness.start(job.id, sink.clone()).await.unwrap();

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn remove_download_kills_running_job() {
        let harness = Harness::new(
            r#"echo "[download] 10.0% of 10.0MiB at 1.0MiB/s ETA 00:09"
exec sleep 30
"#,
        );
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());
        let handle = harness.orchestrator.spawn(
            job.id,
            "https://youtu.be/abc123".into(),
            Quality::P1080,
            MediaFormat::Mp4,
            sink,
        );
        wait_for_status(harness.orchestrator.store(), job.id, DownloadStatus::Downloading).await;
        assert!(harness.orchestrator.is_running(job.id));

        let removed = harness.orchestrator.remove_download(job.id).await;
        assert!(removed.is_some());
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("job stopped after cancel")
            .unwrap();
        assert!(harness.orchestrator.store().get_download(job.id).is_none());
        assert!(!harness.orchestrator.is_running(job.id));
    }

    #[tokio::test]
    async fn remove_download_deletes_output_file() {
        let harness = Harness::with_binary("/nonexistent/yt-dlp");
        std::fs::create_dir_all(&harness.downloads).unwrap();
        let job = harness.create_job();
        let file = harness.downloads.join("1_Sample.mp4");
        std::fs::write(&file, b"video").unwrap();
        harness
            .orchestrator
            .store()
            .update_download(job.id, DownloadUpdate::completed(Some(file.clone())));

        let removed = harness.orchestrator.remove_download(job.id).await.unwrap();
        assert_eq!(removed.file_path, Some(file.clone()));
        assert!(!file.exists());
        assert!(harness.orchestrator.store().get_download(job.id).is_none());
        assert!(harness.orchestrator.remove_download(job.id).await.is_none());
    }

    #[tokio::test]
    async fn remove_download_keeps_files_outside_download_dir() {
        let harness = Harness::with_binary("/nonexistent/yt-dlp");
        let outside = harness.temp.path().join("keep.txt");
        std::fs::write(&outside, b"keep").unwrap();
        let job = harness.create_job();
        harness
            .orchestrator
            .store()
            .update_download(job.id, DownloadUpdate::completed(Some(outside.clone())));

        harness.orchestrator.remove_download(job.id).await.unwrap();
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn clear_history_stops_stale_jobs_from_touching_reused_ids() {
        let harness = Harness::new(
            r#"echo "[download] 10.0% of 10.0MiB at 1.0MiB/s ETA 00:09"
exec sleep 30
"#,
        );
        let old = harness.create_job();
        let handle = harness.orchestrator.spawn(
            old.id,
            "https://youtu.be/abc123".into(),
            Quality::P1080,
            MediaFormat::Mp4,
            Arc::new(RecordingSink::default()),
        );
        wait_for_status(harness.orchestrator.store(), old.id, DownloadStatus::Downloading).await;

        harness.orchestrator.clear_history();
        let fresh = harness.create_job();
        assert_eq!(fresh.id, old.id);

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("stale job stopped")
            .unwrap();
        let stored = harness.orchestrator.store().get_download(fresh.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Pending);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn non_utf8_output_is_decoded_lossily() {
        let harness = Harness::new(
            r#"printf '[download] Destination: %s/1_Caf\xe9.mp4\n' "$(dirname "$target")"
echo "[download] 100%"
"#,
        );
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        harness.start(job.id, sink.clone()).await.unwrap();

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(
            stored.file_path,
            Some(harness.downloads.join("1_Caf\u{FFFD}.mp4"))
        );
    }

    #[tokio::test]
    async fn non_utf8_stderr_still_reaches_the_error() {
        let harness = Harness::new(
            r#"printf 'ERROR: bad \xff byte\n' >&2
exit 1
"#,
        );
        let job = harness.create_job();

        let err = harness
            .start(job.id, Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ExitStatus(_)));
        let error = harness
            .orchestrator
            .store()
            .get_download(job.id)
            .unwrap()
            .error
            .unwrap();
        assert!(error.ends_with("ERROR: bad \u{FFFD} byte"), "{error}");
    }

    #[tokio::test]
    async fn failure_after_completion_clears_the_file() {
        let harness = Harness::new(
            r#"echo "[download] Destination: $target"
echo "video" > "$target"
echo "[download] 100%"
echo "ERROR: Postprocessing: conversion failed" >&2
exit 1
"#,
        );
        let job = harness.create_job();
        let sink = Arc::new(RecordingSink::default());

        let err = harness.start(job.id, sink.clone()).await.unwrap_err();
        assert!(matches!(err, DownloadError::ExitStatus(_)));

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert!(stored.completed_at.is_none());
        assert!(stored.file_path.is_none());
        assert!(!harness.downloads.join("1_Sample.mp4").exists());

        let statuses: Vec<DownloadStatus> =
            sink.events().into_iter().map(|event| event.status).collect();
        assert_eq!(
            statuses,
            vec![DownloadStatus::Completed, DownloadStatus::Failed]
        );
    }

    #[tokio::test]
    async fn job_from_a_cleared_generation_never_touches_reused_id() {
        let harness = Harness::new(HAPPY_PATH);
        let (old, generation) = harness.orchestrator.store().create_download_in(NewDownload {
            video_id: "abc123".into(),
            url: "https://youtu.be/abc123".into(),
            title: "Sample".into(),
            quality: Quality::P1080,
            format: MediaFormat::Mp4,
            thumbnail: None,
        });
        harness.orchestrator.clear_history();
        let fresh = harness.create_job();
        assert_eq!(fresh.id, old.id);

        let sink = Arc::new(RecordingSink::default());
        harness
            .orchestrator
            .spawn_in(
                generation,
                old.id,
                "https://youtu.be/abc123".into(),
                Quality::P1080,
                MediaFormat::Mp4,
                sink.clone(),
            )
            .await
            .unwrap();

        let stored = harness.orchestrator.store().get_download(fresh.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Pending);
        assert!(stored.file_path.is_none());
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn supervisor_records_panicked_jobs() {
        let harness = Harness::new(HAPPY_PATH);
        let job = harness.create_job();
        let sink = Arc::new(PanicOnceSink::default());

        let handle = harness.orchestrator.spawn(
            job.id,
            "https://youtu.be/abc123".into(),
            Quality::P1080,
            MediaFormat::Mp4,
            sink.clone(),
        );
        handle.await.unwrap();

        let stored = harness.orchestrator.store().get_download(job.id).unwrap();
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert!(stored.error.unwrap().starts_with("Download task aborted"));
        let events = sink.events.lock().clone();
        assert_eq!(events.last().unwrap().status, DownloadStatus::Failed);
        assert!(!harness.orchestrator.is_running(job.id));
    }

    #[test]
    fn exit_message_embeds_code_and_stderr() {
        use std::os::unix::process::ExitStatusExt;
        let status = ExitStatus::from_raw(1 << 8);
        assert_eq!(exit_message(status, None), "Download failed with exit code 1");
        assert_eq!(
            exit_message(status, Some(&"ERROR: nope".to_string())),
            "Download failed with exit code 1: ERROR: nope"
        );
    }
}
