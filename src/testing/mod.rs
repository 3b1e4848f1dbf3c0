//! Testing utilities
//!
//! Synthetic frames and stand-ins for the camera, encoder and sink, so the
//! whole pipeline can run without hardware or external programs.

pub mod encoder;
pub mod sink;
pub mod source;
pub mod synthetic_data;

pub use encoder::{reference_decode, reference_decode_units, DecodedUnit, ReferenceEncoder, ReferenceLog};
pub use sink::{MemorySink, MemorySinkHandle};
pub use source::{AcquireLog, ScriptedSource, SourceStep, SyntheticCamera, SyntheticSource, WhenExhausted};
pub use synthetic_data::{synthetic_frame, synthetic_payload};
