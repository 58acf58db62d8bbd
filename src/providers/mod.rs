
pub mod transport;
pub mod http_transport;
#[cfg(test)]
pub mod scripted_transport;

pub mod extractor;
pub mod zip_extractor;

pub mod marker_manager;
pub mod file_marker_manager;

pub mod progress;
