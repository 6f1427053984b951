//! GPU resource handles, formats, and resource states.
//!
//! A [`Resource`] is a lightweight, cloneable handle: the backing memory lives in the
//! device that created it. The handle carries enough information (identity, GPU
//! virtual address, description) for the context to build views, wrapped pointers,
//! and barriers without calling back into the device.
//!
//! # Resource States
//!
//! [`ResourceState`] mirrors the explicit-barrier model of modern GPU APIs. The
//! context never tracks which state a resource is in; callers pass both the
//! current and the target state to
//! [`Recording::transition_resource`](crate::context::Recording::transition_resource).

use std::fmt;

/// A GPU virtual address. Zero means "no address" (textures have none).
pub type GpuVirtualAddress = u64;

/// Unique identity of a resource within the device that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Element formats used by buffers, views, and textures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    /// No format (structured buffers).
    Unknown,
    /// Raw 32-bit words (byte-address buffers).
    R32Typeless,
    R16Uint,
    R32Uint,
    R32G32B32Float,
    R8G8B8A8Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
}

impl Format {
    /// Size of one element in bytes, or 0 for [`Format::Unknown`].
    pub fn byte_size(&self) -> u32 {
        match self {
            Format::Unknown => 0,
            Format::R16Uint => 2,
            Format::R32Typeless | Format::R32Uint | Format::R8G8B8A8Unorm => 4,
            Format::R16G16B16A16Float => 8,
            Format::R32G32B32Float => 12,
            Format::R32G32B32A32Float => 16,
        }
    }
}

/// Usage state of a resource, as understood by the device's barrier model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    NonPixelShaderResource,
    PixelShaderResource,
    CopyDest,
    CopySource,
    /// Upload-heap resources live permanently in this state.
    GenericRead,
    RaytracingAccelerationStructure,
    Present,
}

/// Memory pool a resource is allocated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum HeapKind {
    /// Device-local memory.
    #[default]
    Default,
    /// CPU-writable memory, readable by the GPU.
    Upload,
}

/// Shape of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceDimension {
    Buffer {
        size: u64,
    },
    Texture2d {
        width: u32,
        height: u32,
        format: Format,
    },
}

/// Description of a resource to create.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDesc {
    pub label: String,
    pub dimension: ResourceDimension,
    pub heap: HeapKind,
    pub allow_unordered_access: bool,
    pub initial_state: ResourceState,
}

impl ResourceDesc {
    /// A device-local buffer, initially in [`ResourceState::Common`].
    pub fn buffer(label: impl Into<String>, size: u64) -> Self {
        Self {
            label: label.into(),
            dimension: ResourceDimension::Buffer { size },
            heap: HeapKind::Default,
            allow_unordered_access: false,
            initial_state: ResourceState::Common,
        }
    }

    /// A CPU-writable buffer, permanently in [`ResourceState::GenericRead`].
    pub fn upload_buffer(label: impl Into<String>, size: u64) -> Self {
        Self {
            heap: HeapKind::Upload,
            initial_state: ResourceState::GenericRead,
            ..Self::buffer(label, size)
        }
    }

    /// A 2D texture, initially in [`ResourceState::Common`].
    pub fn texture_2d(label: impl Into<String>, width: u32, height: u32, format: Format) -> Self {
        Self {
            label: label.into(),
            dimension: ResourceDimension::Texture2d {
                width,
                height,
                format,
            },
            heap: HeapKind::Default,
            allow_unordered_access: false,
            initial_state: ResourceState::Common,
        }
    }

    /// Allows the resource to be bound for unordered (read/write) access.
    pub fn with_unordered_access(mut self) -> Self {
        self.allow_unordered_access = true;
        self
    }

    /// Overrides the state the resource is created in.
    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

/// Handle to a resource created by an [`RtDevice`](crate::device::RtDevice).
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    /// GPU virtual address of the first byte. Zero for textures.
    pub gpu_address: GpuVirtualAddress,
    pub desc: ResourceDesc,
}

impl Resource {
    /// Size in bytes for buffers, 0 for textures.
    pub fn size(&self) -> u64 {
        match self.desc.dimension {
            ResourceDimension::Buffer { size } => size,
            ResourceDimension::Texture2d { .. } => 0,
        }
    }

    /// Dimensions for textures, `None` for buffers.
    pub fn extent(&self) -> Option<(u32, u32)> {
        match self.desc.dimension {
            ResourceDimension::Texture2d { width, height, .. } => Some((width, height)),
            ResourceDimension::Buffer { .. } => None,
        }
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }
}

/// CPU-side handle to a descriptor slot, used when writing views.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    /// Handle `index` slots of `increment` bytes past this one.
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + index as u64 * increment as u64)
    }
}

/// GPU-side handle to a descriptor slot, used when binding descriptor tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    /// Handle `index` slots of `increment` bytes past this one.
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + index as u64 * increment as u64)
    }
}

/// Rounds `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
