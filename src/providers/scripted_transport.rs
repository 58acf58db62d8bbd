//! In-memory transport for driving the state machines deterministically.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;

use super::transport::{Channel, ChannelStatus, TransferRequest, Transport};

#[derive(Debug, Clone)]
enum Step {
    Wait,
    Header { status: u16, size: Option<u64> },
    Chunk(Bytes),
    Finish,
    Fail(u16),
}

/// What a scripted URL answers, one step per `poll_once`.
#[derive(Debug, Clone)]
pub struct Script {
    steps: VecDeque<Step>,
}

impl Script {
    pub fn ok(chunks: &[&[u8]]) -> Self {
        let size = chunks.iter().map(|c| c.len() as u64).sum();
        let mut steps = VecDeque::new();
        steps.push_back(Step::Header {
            status: 200,
            size: Some(size),
        });
        for chunk in chunks {
            steps.push_back(Step::Chunk(Bytes::copy_from_slice(chunk)));
        }
        steps.push_back(Step::Finish);
        Script { steps }
    }

    pub fn status(code: u16) -> Self {
        Script {
            steps: VecDeque::from([Step::Header { status: code, size: None }, Step::Fail(code)]),
        }
    }

    pub fn transport_error() -> Self {
        Script {
            steps: VecDeque::from([Step::Fail(0)]),
        }
    }

    /// Never finishes.
    pub fn stalled() -> Self {
        Script {
            steps: VecDeque::from([Step::Header { status: 200, size: None }]),
        }
    }

    /// Inserts `polls` idle polls before the script starts answering.
    pub fn delayed(mut self, polls: usize) -> Self {
        for _ in 0..polls {
            self.steps.push_front(Step::Wait);
        }
        self
    }
}

#[derive(Default)]
struct ScriptState {
    scripts: HashMap<String, Script>,
    opened: Vec<TransferRequest>,
    dropped: usize,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Rc<RefCell<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, script: Script) {
        self.state
            .borrow_mut()
            .scripts
            .insert(url.to_string(), script);
    }

    pub fn opened(&self) -> Vec<TransferRequest> {
        self.state.borrow().opened.clone()
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.opened().into_iter().map(|r| r.url).collect()
    }

    /// Channels dropped so far, i.e. connections torn down.
    pub fn dropped(&self) -> usize {
        self.state.borrow().dropped
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, request: &TransferRequest) -> Box<dyn Channel> {
        let mut state = self.state.borrow_mut();
        state.opened.push(request.clone());
        let script = state
            .scripts
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| Script::status(404));
        Box::new(ScriptedChannel {
            steps: script.steps,
            buffered: Vec::new(),
            status: ChannelStatus::default(),
            owner: Rc::clone(&self.state),
        })
    }
}

struct ScriptedChannel {
    steps: VecDeque<Step>,
    buffered: Vec<u8>,
    status: ChannelStatus,
    owner: Rc<RefCell<ScriptState>>,
}

impl Channel for ScriptedChannel {
    fn poll_once(&mut self) -> ChannelStatus {
        match self.steps.pop_front() {
            Some(Step::Wait) | None => {}
            Some(Step::Header { status, size }) => {
                self.status.status_code = status;
                self.status.expected_size = size;
            }
            Some(Step::Chunk(chunk)) => self.buffered.extend_from_slice(&chunk),
            Some(Step::Finish) => {
                self.status.is_done = true;
                self.status.is_valid = true;
            }
            Some(Step::Fail(status)) => {
                self.status.is_done = true;
                self.status.is_valid = false;
                self.status.status_code = status;
            }
        }
        self.status.has_more_data = !self.buffered.is_empty();
        self.status
    }

    fn read_available(&mut self) -> Bytes {
        self.status.has_more_data = false;
        Bytes::from(std::mem::take(&mut self.buffered))
    }
}

impl Drop for ScriptedChannel {
    fn drop(&mut self) {
        self.owner.borrow_mut().dropped += 1;
    }
}
