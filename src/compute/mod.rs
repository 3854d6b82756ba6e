//! Data-parallel computation on a rank's device.
//!
//! - [`ComputeEngine`]: asynchronous kernel submission with aggregated failures
//! - [`kernels`]: SIMD inner products and distances

mod engine;
pub mod kernels;

pub use engine::{ComputeEngine, DeviceInfo, Ticket};
