//! Stage worker implementations and item serializers.

mod prepare;
mod serializer;
mod transform;
mod upload;

pub use prepare::PrepareWorker;
pub use serializer::{JsonLines, Serializer};
pub use transform::Transform;
pub use upload::{StorageClient, UploadWorker};
