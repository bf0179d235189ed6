//! LTE Downlink Physical Layer Synchronization Library
//!
//! Implements time and frequency synchronization using the PSS and SSS
//! signals according to 3GPP TS 36.211 Sec. 6.11.1, 6.11.2.
//!
//! The [`sync::SyncEngine`] is the entry point: given a window of complex
//! baseband samples it locates the PSS correlation peak, recovers the cell
//! identity from the SSS, estimates and corrects the carrier frequency
//! offset, and detects the cyclic prefix length in use. The `dft`,
//! `convolution` and `vector` modules are the numeric collaborators the
//! detectors are built on.

pub mod convolution;
pub mod dft;
pub mod sync;
pub mod vector;

use thiserror::Error;

/// Common errors for the physical layer
#[derive(Error, Debug)]
pub enum PhyError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Transform plan failed: {0}")]
    Plan(String),

    #[error("Processing error: {0}")]
    Processing(String),
}
