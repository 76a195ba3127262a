//! Network-aware read path and payload helpers.

mod adapter;
mod compress;
mod error;
mod media;
mod transport;

pub use adapter::{FetchOptions, Priority, SmartFetch};
pub use compress::{compress, compress_json, decompress, decompress_json};
pub use error::FetchError;
pub use media::{
  adaptive_image_url, generate_srcset, resource_hints, HintKind, ResourceHint, SLOW_MAX_WIDTH,
};
pub use transport::{FetchResponse, ReqwestTransport, Transport};
