//! Checks that a wifi network provides working connectivity, keeps each measurement in a local
//! buffer and uploads the buffer in batches to an S3 style object store.
//!
//! A run of [cycle::Cycle] is one check. Only one process may use a given buffer directory at
//! a time.

pub mod batch;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod guard;
pub mod probe;
pub mod recorder;
pub mod upload;
