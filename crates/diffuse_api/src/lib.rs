//! # diffuse_api
//!
//! Client side of the generation backend's HTTP API.
//!
//! - [`GenerationRequest`] holds prompt parameters and converts them to the
//!   integer-only [`Txt2ImgPayload`] body.
//! - [`GenerationBackend`] is the seam the coordinator calls through;
//!   [`WebUiClient`] talks to a real A1111-compatible server and
//!   [`MockBackend`] scripts replies for tests.
//! - [`parse_infotext`] and [`GenerationRequest::to_infotext`] read and write
//!   the plain-text generation data format.

pub mod client;
pub mod error;
pub mod infotext;
pub mod mock;
pub mod payload;

pub use client::{endpoint, GenerationBackend, WebUiClient, DEFAULT_REQUEST_TIMEOUT};
pub use error::{ApiError, ApiResult};
pub use infotext::parse_infotext;
pub use mock::{CapturedCall, MockBackend, MockReply};
pub use payload::{GenerationRequest, OverrideSettings, Txt2ImgPayload, RANDOM_SEED};
