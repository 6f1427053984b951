//! # rtframework
//!
//! **Hybrid raytracing behind one API.**
//!
//! An [`RtContext`] runs the same raytracing calls on hardware that traverses rays
//! natively, or on compute kernels that emulate the traversal when it does not.
//! The path is picked once, when the context is created; callers never branch on it.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rtframework::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let device = Arc::new(WgpuDevice::new()?);
//!     let mut ctx = RtContext::new(device.clone(), ContextConfig::from_env())?;
//!
//!     let mut scene = RtScene::new("Scene");
//!     let cube = RtModel::new(&mut ctx, "Cube", &RawGeometry::cube())?;
//!     scene.add_model(cube, Mat4::IDENTITY);
//!
//!     let mut pipeline = RaytracingPipeline::new(PipelineConfig::default());
//!     pipeline.set_scene(scene);
//!     pipeline.load_resources(&mut ctx)?;
//!     pipeline.create_output_resource(&mut ctx, 640, 360)?;
//!
//!     let mut list = device.create_command_list("Frame")?;
//!     {
//!         let mut rec = ctx.record(list.as_mut());
//!         pipeline.build_acceleration_structures(&mut rec)?;
//!         pipeline.update(0.0, 0, 0, 0, 640, 360)?;
//!         pipeline.render(&mut rec, 0, 640, 360)?;
//!     }
//!     device.submit(list)?;
//!     device.wait_idle()
//! }
//! ```
//!
//! ## Pieces
//!
//! - **Descriptors**: one shader-visible heap per context, handed out by
//!   [`DescriptorAllocator`] in slot order.
//! - **Wrapped pointers**: buffer references that are raw addresses on hardware
//!   and indirection-table slots when emulated ([`WrappedPointer`]).
//! - **Capability layer**: [`CapabilityLayer`] owns the path-specific work:
//!   acceleration-structure builds, state objects, and dispatch.
//! - **Pipeline**: [`RaytracingPipeline`] is a complete progressive path tracer
//!   built only on the public API.

pub mod acceleration;
pub mod backend;
pub mod bindings;
mod camera;
pub mod capability;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
mod error;
mod geometry;
mod model;
pub mod pipeline;
pub mod resource;
mod scene;
pub mod shader;
pub mod state;
pub mod wrapped_pointer;

pub use acceleration::{
    AccelerationLevel, AccelerationStructure, BuildDesc, BuildInputs, InstanceDesc, PrebuildInfo,
    TriangleGeometry,
};
pub use backend::{RecordingDevice, WgpuDevice};
pub use bindings::{LocalArgument, RtBindings, ShaderRecord, ShaderTable};
pub use camera::Camera;
pub use capability::{CapabilityLayer, CapabilityMode};
pub use config::{ContextConfig, PipelineConfig};
pub use context::{DispatchConstants, Recording, RtContext};
pub use descriptor::DescriptorAllocator;
pub use device::{
    CommandList, DispatchRaysDesc, KernelDesc, KernelId, PipelineId, RootArgument, RtDevice,
    ShaderIdentifier, ViewDesc, root_slots,
};
pub use error::{ErrorCategory, Result, RtError, TableKind};
pub use geometry::{RawGeometry, Transform, Vertex};
pub use model::RtModel;
pub use pipeline::{FrameConstants, Material, MaterialKind, RaytracingPipeline};
pub use resource::{
    CpuDescriptorHandle, Format, GpuDescriptorHandle, GpuVirtualAddress, Resource, ResourceDesc,
    ResourceId, ResourceState,
};
pub use scene::{RtScene, SceneInstance};
pub use shader::{HitGroup, RtProgram, RtShader, ShaderKind};
pub use state::RtState;
pub use wrapped_pointer::{IndirectionTable, ResolvedPointer, WrappedPointer};

// Re-export glam math types for convenience
pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
