//! snapback - block-storage snapshot diff shipping over QUIC.
//!
//! An exporter owns storage access and answers list and export requests;
//! an importer discovers pools, images and snapshots and pulls diffs into an
//! archive on an interval. Both sides speak a framed CBOR message protocol
//! on QUIC streams, one outstanding request per stream.

pub mod cli;
pub mod config;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use error::{DecodeError, ProtocolError, Result};
