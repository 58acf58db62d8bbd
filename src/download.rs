//! A single pollable HTTP transfer.
//!
//! [`DownloadTask::poll`] performs at most one non-blocking step on the
//! underlying [`Channel`]. New bytes are handed back as soon as they arrive
//! and are also written to the task's [`Sink`].

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::providers::transport::{Channel, TransferRequest, Transport};

pub type CorrelationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

/// Who asked for a transfer. Host-internal fetches have no instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken {
    pub instance: Option<InstanceId>,
    pub correlation_id: CorrelationId,
}

impl OwnerToken {
    pub fn instance(instance: InstanceId, correlation_id: CorrelationId) -> Self {
        OwnerToken {
            instance: Some(instance),
            correlation_id,
        }
    }

    pub fn internal() -> Self {
        OwnerToken {
            instance: None,
            correlation_id: 0,
        }
    }

    pub fn is_owned_by(&self, instance: InstanceId) -> bool {
        self.instance == Some(instance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    HttpError(u16),
    TransportError,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Streaming,
    Done,
    Failed(FailureKind),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed(_) | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Progress(Bytes),
    InProgress,
    Complete(u64),
    Failed(FailureKind),
}

async fn write_chunks(
    path: &Path,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = chunks.recv().await {
        file.write_all(&chunk).await?;
    }
    file.flush().await
}

/// A file written by a task on the runtime. Callers hand it chunks and
/// poll for the moment everything has reached the disk.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    runtime: Handle,
    chunks: Option<mpsc::UnboundedSender<Bytes>>,
    written: Option<oneshot::Receiver<std::io::Result<()>>>,
}

impl FileSink {
    pub fn new(runtime: Handle, path: impl Into<PathBuf>) -> Self {
        FileSink {
            path: path.into(),
            runtime,
            chunks: None,
            written: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The writer starts with the first chunk, or on `close` for an empty body.
    fn start(&mut self) {
        if self.written.is_some() {
            return;
        }
        let (chunks, receiver) = mpsc::unbounded_channel();
        let (done, written) = oneshot::channel();
        let path = self.path.clone();
        self.runtime.spawn(async move {
            let _ = done.send(write_chunks(&path, receiver).await);
        });
        self.chunks = Some(chunks);
        self.written = Some(written);
    }

    pub fn write(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.start();
        match &self.chunks {
            Some(chunks) => chunks
                .send(chunk)
                .map_err(|_| std::io::Error::other("file writer stopped")),
            None => Err(std::io::Error::other("file sink already closed")),
        }
    }

    /// No more chunks follow. The file exists afterwards even if none came.
    pub fn close(&mut self) {
        self.start();
        self.chunks = None;
    }

    /// `None` while the writer is still busy.
    pub fn poll_flushed(&mut self) -> Option<std::io::Result<()>> {
        let written = self.written.as_mut()?;
        match written.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(std::io::Error::other("file writer stopped")))
            }
        }
    }
}

/// Where the bytes of a transfer end up besides being returned from `poll`.
#[derive(Debug)]
pub enum Sink {
    /// Nothing retained; the owner consumes the chunks.
    Stream,
    Memory(Vec<u8>),
    File(FileSink),
}

impl Sink {
    pub fn file(runtime: Handle, path: impl Into<PathBuf>) -> Self {
        Sink::File(FileSink::new(runtime, path))
    }

    fn write(&mut self, data: &Bytes) -> std::io::Result<()> {
        match self {
            Sink::Stream => Ok(()),
            Sink::Memory(buffer) => {
                buffer.extend_from_slice(data);
                Ok(())
            }
            Sink::File(file) => file.write(data.clone()),
        }
    }

    fn close(&mut self) {
        if let Sink::File(file) = self {
            file.close();
        }
    }

    fn poll_flushed(&mut self) -> Option<std::io::Result<()>> {
        match self {
            Sink::File(file) => file.poll_flushed(),
            Sink::Stream | Sink::Memory(_) => Some(Ok(())),
        }
    }
}

pub struct DownloadTask {
    request: TransferRequest,
    owner: OwnerToken,
    sink: Sink,
    state: TaskState,
    channel: Option<Box<dyn Channel>>,
    bytes_transferred: u64,
    total_size: Option<u64>,
    http_status: u16,
    cancel_requested: bool,
    /// The transfer is over; waiting for the sink to reach the disk.
    flushing: bool,
}

impl DownloadTask {
    /// Opens the transfer. The task stays `Pending` until its first poll.
    pub fn start(
        transport: &dyn Transport,
        request: TransferRequest,
        sink: Sink,
        owner: OwnerToken,
    ) -> Self {
        info!(url = %request.url, method = ?request.method, "Getting URL");
        let channel = transport.open(&request);
        DownloadTask {
            request,
            owner,
            sink,
            state: TaskState::Pending,
            channel: Some(channel),
            bytes_transferred: 0,
            total_size: None,
            http_status: 0,
            cancel_requested: false,
            flushing: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    pub fn into_sink(self) -> Sink {
        self.sink
    }

    /// Takes effect on the next `poll`.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.cancel_requested = true;
        }
    }

    pub fn poll(&mut self) -> PollResult {
        match self.state {
            TaskState::Done => return PollResult::Complete(self.bytes_transferred),
            TaskState::Failed(kind) => return PollResult::Failed(kind),
            TaskState::Cancelled => return PollResult::Failed(FailureKind::Cancelled),
            TaskState::Pending | TaskState::Streaming => {}
        }

        if self.cancel_requested {
            info!(
                url = %self.request.url,
                bytes = self.bytes_transferred,
                total = ?self.total_size,
                "Download interrupted"
            );
            self.channel = None;
            self.state = TaskState::Cancelled;
            return PollResult::Failed(FailureKind::Cancelled);
        }

        if self.flushing {
            return self.poll_flush();
        }

        self.state = TaskState::Streaming;
        let Some(channel) = self.channel.as_mut() else {
            return self.fail(FailureKind::TransportError);
        };

        let status = channel.poll_once();
        self.http_status = status.status_code;
        if status.expected_size.is_some() {
            self.total_size = status.expected_size;
        }

        let data = channel.read_available();
        if !data.is_empty() {
            if let Err(e) = self.sink.write(&data) {
                warn!(url = %self.request.url, error = %e, "failed to store downloaded data");
                return self.fail(FailureKind::TransportError);
            }
            self.bytes_transferred += data.len() as u64;
            return PollResult::Progress(data);
        }

        if status.has_more_data || !status.is_done {
            return PollResult::InProgress;
        }

        if !status.is_valid {
            let kind = if status.status_code != 0 {
                FailureKind::HttpError(status.status_code)
            } else {
                FailureKind::TransportError
            };
            warn!(url = %self.request.url, status = status.status_code, "Error getting URL");
            return self.fail(kind);
        }

        self.channel = None;
        self.sink.close();
        self.flushing = true;
        self.poll_flush()
    }

    fn poll_flush(&mut self) -> PollResult {
        match self.sink.poll_flushed() {
            None => PollResult::InProgress,
            Some(Ok(())) => {
                self.flushing = false;
                self.state = TaskState::Done;
                info!(url = %self.request.url, bytes = self.bytes_transferred, "Done getting URL");
                PollResult::Complete(self.bytes_transferred)
            }
            Some(Err(e)) => {
                warn!(url = %self.request.url, error = %e, "failed to store downloaded data");
                self.fail(FailureKind::TransportError)
            }
        }
    }

    fn fail(&mut self, kind: FailureKind) -> PollResult {
        debug!(url = %self.request.url, ?kind, "download failed");
        self.channel = None;
        self.state = TaskState::Failed(kind);
        PollResult::Failed(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted_transport::{Script, ScriptedTransport};
    use std::time::Duration;
    use tempfile::tempdir;

    const URL: &str = "http://example.test/file.bin";

    fn start(transport: &ScriptedTransport, sink: Sink) -> DownloadTask {
        DownloadTask::start(transport, TransferRequest::get(URL), sink, OwnerToken::internal())
    }

    fn is_terminal(result: &PollResult) -> bool {
        matches!(result, PollResult::Complete(_) | PollResult::Failed(_))
    }

    fn run_to_end(task: &mut DownloadTask) -> (Vec<PollResult>, Vec<u64>) {
        let mut results = Vec::new();
        let mut transferred = Vec::new();
        for _ in 0..100 {
            let result = task.poll();
            transferred.push(task.bytes_transferred());
            let terminal = is_terminal(&result);
            results.push(result);
            if terminal {
                break;
            }
        }
        (results, transferred)
    }

    /// Polls with short sleeps so the file writer gets to run.
    async fn run_to_end_on_runtime(task: &mut DownloadTask) -> PollResult {
        for _ in 0..500 {
            let result = task.poll();
            if is_terminal(&result) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("download never finished");
    }

    #[test]
    fn test_start_is_pending_until_polled() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::ok(&[b"abc"]));

        // Act
        let mut task = start(&transport, Sink::Stream);

        // Assert
        assert_eq!(task.state(), TaskState::Pending);
        task.poll();
        assert_eq!(task.state(), TaskState::Streaming);
    }

    #[test]
    fn test_chunks_are_delivered_in_order_and_progress_is_monotonic() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.respond(
            URL,
            Script::ok(&[b"hello ", b"streaming ", b"world"]).delayed(2),
        );
        let mut task = start(&transport, Sink::Memory(Vec::new()));

        // Act
        let (results, transferred) = run_to_end(&mut task);

        // Assert
        let chunks: Vec<Bytes> = results
            .iter()
            .filter_map(|r| match r {
                PollResult::Progress(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"hello "),
                Bytes::from_static(b"streaming "),
                Bytes::from_static(b"world"),
            ]
        );
        assert!(transferred.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(results.last(), Some(&PollResult::Complete(21)));
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(task.total_size(), Some(21));
        match task.sink() {
            Sink::Memory(buffer) => assert_eq!(buffer.as_slice(), b"hello streaming world"),
            other => panic!("unexpected sink {:?}", other),
        }
    }

    #[test]
    fn test_http_error_is_classified_with_status() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::status(503));
        let mut task = start(&transport, Sink::Stream);

        // Act
        let (results, _) = run_to_end(&mut task);

        // Assert
        assert_eq!(
            results.last(),
            Some(&PollResult::Failed(FailureKind::HttpError(503)))
        );
        assert_eq!(task.state(), TaskState::Failed(FailureKind::HttpError(503)));
    }

    #[test]
    fn test_missing_status_is_a_transport_error() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::transport_error());
        let mut task = start(&transport, Sink::Stream);

        // Act
        let result = task.poll();

        // Assert
        assert_eq!(result, PollResult::Failed(FailureKind::TransportError));
        assert_eq!(task.poll(), PollResult::Failed(FailureKind::TransportError));
    }

    #[test]
    fn test_cancel_stops_progress_on_next_poll() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::ok(&[b"one", b"two", b"three"]));
        let mut task = start(&transport, Sink::Stream);
        task.poll();
        assert_eq!(task.poll(), PollResult::Progress(Bytes::from_static(b"one")));

        // Act
        task.cancel();
        let after_cancel = task.poll();

        // Assert
        assert_eq!(after_cancel, PollResult::Failed(FailureKind::Cancelled));
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(task.bytes_transferred(), 3);
        for _ in 0..5 {
            assert!(!matches!(task.poll(), PollResult::Progress(_)));
        }
        assert_eq!(transport.dropped(), 1);
    }

    #[test]
    fn test_cancel_after_completion_is_ignored() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::ok(&[b"x"]));
        let mut task = start(&transport, Sink::Stream);
        run_to_end(&mut task);

        // Act
        task.cancel();

        // Assert
        assert_eq!(task.poll(), PollResult::Complete(1));
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn test_stalled_transfer_stays_streaming() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::stalled());
        let mut task = start(&transport, Sink::Stream);

        // Act
        let results: Vec<PollResult> = (0..10).map(|_| task.poll()).collect();

        // Assert
        assert!(results.iter().all(|r| *r == PollResult::InProgress));
        assert_eq!(task.state(), TaskState::Streaming);
    }

    #[tokio::test]
    async fn test_file_sink_writes_downloaded_bytes() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("payload.bin");
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::ok(&[b"abc", b"def"]));
        let mut task = start(&transport, Sink::file(Handle::current(), &path));

        // Act
        let result = run_to_end_on_runtime(&mut task).await;

        // Assert
        assert_eq!(result, PollResult::Complete(6));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_file_sink_creates_empty_file_for_empty_body() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("empty.bin");
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::ok(&[]));
        let mut task = start(&transport, Sink::file(Handle::current(), &path));

        // Act
        let result = run_to_end_on_runtime(&mut task).await;

        // Assert
        assert_eq!(result, PollResult::Complete(0));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_file_sink_completes_only_once_written() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("payload.bin");
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::ok(&[b"abc"]));
        let mut task = start(&transport, Sink::file(Handle::current(), &path));

        // Act
        let without_runtime: Vec<PollResult> = (0..10).map(|_| task.poll()).collect();

        // Assert
        assert!(without_runtime.iter().all(|r| !is_terminal(r)));
        assert_eq!(task.state(), TaskState::Streaming);
        assert_eq!(run_to_end_on_runtime(&mut task).await, PollResult::Complete(3));
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_unwritable_file_sink_fails_transfer() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let transport = ScriptedTransport::new();
        transport.respond(URL, Script::ok(&[b"abc"]));
        let sink = Sink::file(Handle::current(), blocker.join("payload.bin"));
        let mut task = start(&transport, sink);

        // Act
        let result = run_to_end_on_runtime(&mut task).await;

        // Assert
        assert_eq!(result, PollResult::Failed(FailureKind::TransportError));
    }
}
