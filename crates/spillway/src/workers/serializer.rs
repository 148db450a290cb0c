//! Item serialization for bucket files.

use serde::Serialize;
use snafu::prelude::*;

use crate::error::{JsonSnafu, SerializeError};

/// Turns an item into one line of a bucket file.
///
/// The returned bytes must not contain a newline; the ingest worker adds the
/// line terminator.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, item: &T) -> Result<Vec<u8>, SerializeError>;
}

/// Compact JSON, one object per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLines;

impl<T: Serialize> Serializer<T> for JsonLines {
    fn serialize(&self, item: &T) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(item).context(JsonSnafu)
    }
}
