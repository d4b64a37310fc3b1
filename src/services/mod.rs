//! Stateless service helpers shared by the backends and the HTTP layer

pub mod codec;

pub use codec::{ImageCodec, DEFAULT_MEDIA_TYPE};
