//! # diffuse_store
//!
//! Persistence of generated images.
//!
//! The coordinator only sees the [`ImageWriter`] trait: it hands over the
//! base64 payloads returned by the backend plus a destination directory and
//! gets back the primary image and every path written.

pub mod error;
pub mod writer;

pub use error::{StoreError, StoreResult};
pub use writer::{decode_image, DiskImageWriter, ImageWriter, RecordedSave, RecordingWriter, SavedImages};
