//! Sensor protocol implementation.
//!
//! This module contains the decoder for inbound sensor frames and the
//! chunker for outbound writes.

pub mod codec;

pub use codec::{chunk, decode, TelemetryFrame, TelemetrySnapshot};
