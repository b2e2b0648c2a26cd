pub mod header;
pub mod transcode;
pub mod metadata;
pub mod extension;
pub mod stroke;
pub mod sketch;
pub mod tilt;

pub use header::{HeaderError, TiltHeader};
pub use transcode::{convert, pack, unpack, Compression, Conversion, ConversionError, PackOptions};
pub use metadata::{validate_metadata, MetadataError, MetadataStore, Transform};
pub use extension::{ExtValue, ExtensionError, ExtensionEngine, ExtensionPlan, Extensions, WireType};
pub use stroke::{ControlPoint, Stroke};
pub use sketch::{Sketch, SketchError};
pub use tilt::{MetadataTransaction, Tilt, TiltError, Walk};
