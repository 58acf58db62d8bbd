use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<Bytes>,
}

impl TransferRequest {
    pub fn get(url: impl Into<String>) -> Self {
        TransferRequest {
            url: url.into(),
            method: Method::Get,
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Bytes) -> Self {
        TransferRequest {
            url: url.into(),
            method: Method::Post,
            body: Some(body),
        }
    }
}

/// Snapshot returned by [`Channel::poll_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub has_more_data: bool,
    pub is_done: bool,
    pub is_valid: bool,
    /// Zero until the server has answered.
    pub status_code: u16,
    pub expected_size: Option<u64>,
}

/// One open transfer. Both methods must return immediately.
pub trait Channel {
    fn poll_once(&mut self) -> ChannelStatus;

    /// Drains whatever arrived since the last call, in arrival order.
    fn read_available(&mut self) -> Bytes;
}

pub trait Transport {
    fn open(&self, request: &TransferRequest) -> Box<dyn Channel>;
}
