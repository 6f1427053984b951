//! Device implementations.
//!
//! - [`WgpuDevice`]: a real adapter through wgpu. Native raytracing when the
//!   adapter exposes ray queries, the compute fallback everywhere else.
//! - [`RecordingDevice`]: headless. Records and validates commands without a GPU,
//!   used by tests and by the demo when no adapter is found.

pub mod gpu;
pub mod recording;

pub use gpu::{WgpuDevice, WgpuDeviceBuilder};
pub use recording::{RecordedCommand, RecordingDevice, RecordingDeviceBuilder, ValidationMessage};
