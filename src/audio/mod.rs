pub mod decode;
pub mod source;

pub use decode::decode_clip;
pub use source::{Clip, SampleSource, SourceFormat};
