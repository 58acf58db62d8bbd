use bytes::{Bytes, BytesMut};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::debug;

use super::transport::{Channel, ChannelStatus, Method, TransferRequest, Transport};

enum TransferEvent {
    Started {
        status: u16,
        content_length: Option<u64>,
    },
    Chunk(Bytes),
    Finished,
    /// `status` is zero when no HTTP response was received.
    Failed { status: u16 },
}

/// Plain HTTP(S) transport: each transfer runs as a task on the runtime and
/// reports back over an unbounded queue that the channel drains without
/// waiting.
pub struct HttpTransport {
    client: Client,
    runtime: Handle,
}

impl HttpTransport {
    pub fn new(runtime: Handle) -> Result<Self, reqwest::Error> {
        let client = Client::builder().build()?;
        Ok(HttpTransport { client, runtime })
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: &TransferRequest) -> Box<dyn Channel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = self
            .runtime
            .spawn(run_transfer(self.client.clone(), request.clone(), tx));
        Box::new(HttpChannel {
            events: rx,
            buffered: Vec::new(),
            status: ChannelStatus::default(),
            task,
        })
    }
}

async fn run_transfer(
    client: Client,
    request: TransferRequest,
    tx: UnboundedSender<TransferEvent>,
) {
    let builder = match request.method {
        Method::Get => client.get(&request.url),
        Method::Post => client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(request.body.clone().unwrap_or_default()),
    };

    let mut response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %request.url, error = %e, "request failed");
            let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
            let _ = tx.send(TransferEvent::Failed { status });
            return;
        }
    };

    let status = response.status();
    let _ = tx.send(TransferEvent::Started {
        status: status.as_u16(),
        content_length: response.content_length(),
    });
    if !status.is_success() {
        let _ = tx.send(TransferEvent::Failed {
            status: status.as_u16(),
        });
        return;
    }

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if tx.send(TransferEvent::Chunk(chunk)).is_err() {
                    // receiver gone, nobody wants the rest
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(TransferEvent::Finished);
                return;
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "body stream failed");
                let _ = tx.send(TransferEvent::Failed { status: 0 });
                return;
            }
        }
    }
}

struct HttpChannel {
    events: UnboundedReceiver<TransferEvent>,
    buffered: Vec<Bytes>,
    status: ChannelStatus,
    task: JoinHandle<()>,
}

impl Channel for HttpChannel {
    fn poll_once(&mut self) -> ChannelStatus {
        while !self.status.is_done {
            match self.events.try_recv() {
                Ok(TransferEvent::Started {
                    status,
                    content_length,
                }) => {
                    self.status.status_code = status;
                    self.status.expected_size = content_length;
                }
                Ok(TransferEvent::Chunk(chunk)) => self.buffered.push(chunk),
                Ok(TransferEvent::Finished) => {
                    self.status.is_done = true;
                    self.status.is_valid = true;
                }
                Ok(TransferEvent::Failed { status }) => {
                    self.status.is_done = true;
                    self.status.is_valid = false;
                    self.status.status_code = status;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.status.is_done = true;
                    self.status.is_valid = false;
                    self.status.status_code = 0;
                }
            }
        }
        self.status.has_more_data = !self.buffered.is_empty();
        self.status
    }

    fn read_available(&mut self) -> Bytes {
        let data = match self.buffered.len() {
            0 => Bytes::new(),
            1 => self.buffered.remove(0),
            _ => {
                let mut joined = BytesMut::new();
                for chunk in self.buffered.drain(..) {
                    joined.extend_from_slice(&chunk);
                }
                joined.freeze()
            }
        };
        self.buffered.clear();
        self.status.has_more_data = false;
        data
    }
}

impl Drop for HttpChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}
