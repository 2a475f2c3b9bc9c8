//! Filesystem access: scanning the source tree and writing files atomically.

pub mod atomic;
pub mod metadata;
pub mod pattern;
pub mod walker;

pub use metadata::{FileRecord, RecordKind};
pub use walker::{Scanner, WalkOptions};
