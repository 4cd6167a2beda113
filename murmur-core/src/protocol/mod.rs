//! Wire formats parsed outside the HTTP playback path.

pub mod multipart;

pub use multipart::{MultipartCallbacks, MultipartParser, ScanState};
