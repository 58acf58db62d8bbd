pub mod artifact;
pub mod configuration;
pub mod contents;
pub mod download_marker;
