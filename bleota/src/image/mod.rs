//! Image metadata.

pub mod header;

pub use header::{DataType, FirmwareHeader};
