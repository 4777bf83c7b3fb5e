//! Emulated device: an in-order stream, its completion events, and the
//! memory its jobs operate on.

pub mod buffer;
pub mod stream;

pub use buffer::{DeviceBuffer, PinnedBuffer, SharedBuffer};
pub use stream::{DeviceJob, GpuStream, StreamEvent};
