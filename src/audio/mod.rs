//! Audio output subsystem

pub mod sink;

pub use sink::{AudioSink, CpalSink};
