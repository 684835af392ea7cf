//! pcmout
//!
//! Buffered block-based PCM output: fixed block pool, completion tracking
//! and output delay estimation on top of a pluggable output device.

pub mod audio;
