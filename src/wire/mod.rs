//! Private binary wire format for control data crossing the engine boundary.

pub mod codec;
pub mod region;

pub use codec::{
    binary_size, deserialize, deserialize_info_map, info_map_binary_size, serialize,
    serialize_info_map,
};
pub use region::{ReadRegion, WriteRegion};

use thiserror::Error;

/// Errors raised while encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum WireError {
    /// The payload declares more data than the supplied region holds, or
    /// carries a type tag neither side knows. Schema agreement is out of
    /// band; a mismatch surfaces here.
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    /// A write would run past the end of the caller-provided region.
    #[error("write overflows region: needed {needed} bytes, {available} available")]
    RegionOverflow { needed: usize, available: usize },
}
