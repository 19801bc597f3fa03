//! CSI Volume Semantics
//!
//! Pure access-mode resolution used by the provisioning and attachment
//! paths of the driver.

pub mod access_mode;
pub mod options;

pub use access_mode::*;
pub use options::*;
