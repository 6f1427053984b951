//! Narrow device and command-recording interfaces.
//!
//! The context never talks to a graphics API directly. It consumes two object-safe
//! traits:
//!
//! - [`RtDevice`]: creates resources, descriptor heaps, views, kernels, and
//!   pipelines, and executes recorded command lists.
//! - [`CommandList`]: the command-recording handle. Every method *records* work;
//!   nothing executes until the list is handed to [`RtDevice::submit`].
//!
//! Two implementations ship with the crate, see [`crate::backend`].
//!
//! # Root Arguments
//!
//! Compute and ray dispatches read their global inputs from numbered root slots.
//! The context reserves the first few slots for itself (see [`root_slots`]); caller
//! globals start at [`root_slots::FIRST_USER`]. Backends without a root-signature
//! concept map slot `n` to `@group(0) @binding(n)`.

use std::any::Any;

use crate::acceleration::{BuildDesc, BuildInputs, PrebuildInfo};
use crate::error::Result;
use crate::resource::{
    CpuDescriptorHandle, Format, GpuDescriptorHandle, GpuVirtualAddress, Resource, ResourceDesc,
    ResourceState,
};
use crate::shader::RtProgram;

/// Size in bytes of a shader identifier inside a shader record.
pub const SHADER_IDENTIFIER_SIZE: usize = 32;

/// Root slots reserved by the context.
pub mod root_slots {
    /// 32-bit dispatch constants (dimensions, shader table layout, top-level slot).
    pub const DISPATCH_CONSTANTS: u32 = 0;
    /// The top-level acceleration structure.
    pub const TOP_LEVEL: u32 = 1;
    /// The shader binding table.
    pub const SHADER_TABLE: u32 = 2;
    /// The wrapped-pointer indirection table (emulated path only).
    pub const INDIRECTION_TABLE: u32 = 3;
    /// First slot available to callers.
    pub const FIRST_USER: u32 = 4;
}

/// Description of a shader-visible descriptor heap.
#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorHeapDesc {
    pub label: String,
    pub capacity: u32,
}

/// A descriptor heap created by the device.
#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorHeapInfo {
    pub label: String,
    pub capacity: u32,
    /// Size of one descriptor slot in bytes. Device dependent.
    pub increment: u32,
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: GpuDescriptorHandle,
}

/// A view written into a descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewDesc {
    Buffer {
        first_element: u64,
        num_elements: u32,
        /// Element stride in bytes; 0 for typed/raw views.
        stride: u32,
        format: Format,
        writable: bool,
    },
    Texture2d {
        format: Format,
        writable: bool,
    },
}

impl ViewDesc {
    /// Read-only structured view over `num_elements` records of `stride` bytes.
    pub fn structured_buffer(num_elements: u32, stride: u32) -> Self {
        ViewDesc::Buffer {
            first_element: 0,
            num_elements,
            stride,
            format: Format::Unknown,
            writable: false,
        }
    }

    /// Byte-address view over `num_words` 32-bit words.
    pub fn raw_buffer(num_words: u32, writable: bool) -> Self {
        ViewDesc::Buffer {
            first_element: 0,
            num_elements: num_words,
            stride: 0,
            format: Format::R32Typeless,
            writable,
        }
    }

    pub fn texture_srv(format: Format) -> Self {
        ViewDesc::Texture2d {
            format,
            writable: false,
        }
    }

    pub fn texture_uav(format: Format) -> Self {
        ViewDesc::Texture2d {
            format,
            writable: true,
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            ViewDesc::Buffer { writable, .. } | ViewDesc::Texture2d { writable, .. } => *writable,
        }
    }
}

/// Handle to a compiled compute kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelId(pub u32);

/// Handle to a native raytracing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u32);

/// Source for a compute kernel.
#[derive(Clone, Copy, Debug)]
pub struct KernelDesc<'a> {
    pub label: &'a str,
    /// WGSL source text.
    pub source: &'a str,
    pub entry_point: &'a str,
}

/// Opaque identifier of a shader export, copied into shader records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(pub [u8; SHADER_IDENTIFIER_SIZE]);

/// Value bound to a root slot.
#[derive(Clone, Debug, PartialEq)]
pub enum RootArgument {
    /// Inline 32-bit constants.
    Constants(Vec<u32>),
    ConstantBuffer(GpuVirtualAddress),
    ShaderResource(GpuVirtualAddress),
    UnorderedAccess(GpuVirtualAddress),
    /// A range of the currently bound descriptor heap, starting at this handle.
    DescriptorTable(GpuDescriptorHandle),
    AccelerationStructure(GpuVirtualAddress),
}

/// A region of a shader binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ShaderTableRange {
    pub start: GpuVirtualAddress,
    pub size: u64,
    pub stride: u64,
}

/// Parameters of a native ray dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    pub ray_generation: ShaderTableRange,
    pub miss: ShaderTableRange,
    pub hit_group: ShaderTableRange,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A GPU device, as seen by the raytracing context.
///
/// Implementations hand out [`Resource`] handles and keep the backing memory
/// themselves. All methods take `&self`; implementations synchronize internally.
pub trait RtDevice: Send + Sync {
    /// Human-readable adapter name, used in diagnostics.
    fn name(&self) -> &str;

    /// Whether the device traverses rays natively.
    fn supports_native_raytracing(&self) -> bool;

    /// Whether compute kernels can emulate raytracing on this device.
    fn supports_compute_fallback(&self) -> bool;

    fn create_resource(&self, desc: &ResourceDesc) -> Result<Resource>;

    /// Writes `data` into a buffer at `offset`, visible to work submitted afterwards.
    fn write_buffer(&self, resource: &Resource, offset: u64, data: &[u8]) -> Result<()>;

    /// Frees a resource. The caller guarantees no pending GPU work references it.
    fn release(&self, resource: &Resource);

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo>;

    /// Writes a view of `resource` into the descriptor slot at `dest`.
    fn create_view(&self, resource: &Resource, view: &ViewDesc, dest: CpuDescriptorHandle);

    fn create_compute_kernel(&self, desc: &KernelDesc<'_>) -> Result<KernelId>;

    /// Compiles `program` into a native raytracing pipeline.
    fn create_raytracing_pipeline(&self, program: &RtProgram) -> Result<PipelineId>;

    /// Identifier of an export (ray generation, miss, or hit group name) of a pipeline.
    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ShaderIdentifier>;

    /// Memory requirements of a native acceleration-structure build.
    fn acceleration_structure_prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo>;

    fn create_command_list(&self, label: &str) -> Result<Box<dyn CommandList>>;

    /// Executes a recorded command list. Does not wait for completion.
    fn submit(&self, list: Box<dyn CommandList>) -> Result<()>;

    /// Blocks until all submitted work has finished.
    fn wait_idle(&self) -> Result<()>;
}

/// A command-recording handle.
///
/// Recording is single-threaded; a list must not be shared across threads while
/// recording.
pub trait CommandList: Any {
    fn label(&self) -> &str;

    /// Makes `heap` the active heap for descriptor tables recorded afterwards.
    fn set_descriptor_heap(&mut self, heap: &DescriptorHeapInfo);

    fn resource_barrier(&mut self, resource: &Resource, before: ResourceState, after: ResourceState);

    /// Orders unordered-access writes; `None` covers every resource.
    fn uav_barrier(&mut self, resource: Option<&Resource>);

    fn copy_resource(&mut self, dest: &Resource, source: &Resource);

    /// Makes `kernel` current and clears every root argument.
    fn set_compute_kernel(&mut self, kernel: KernelId);

    /// Binds `argument` at `slot` until the next kernel or pipeline change.
    fn set_compute_root_argument(&mut self, slot: u32, argument: RootArgument);

    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32);

    /// Makes `pipeline` current and clears every root argument.
    fn set_raytracing_pipeline(&mut self, pipeline: PipelineId);

    fn build_acceleration_structure(&mut self, desc: &BuildDesc);

    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc);

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}
