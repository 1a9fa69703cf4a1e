//! Data file output.
//!
//! - [`naming`]: output paths from templates, observatory dates
//! - [`fits`]: FITS image files
//! - [`checksum`]: digest sidecars

pub mod checksum;
pub mod fits;
pub mod naming;

pub use checksum::{sidecar_path, verify_sidecar, write_sidecar, ChecksumAlgorithm};
pub use naming::{output_path, NamingContext};
