//! Acceleration-structure build inputs and GPU instance records.
//!
//! Both capability paths consume the same [`BuildInputs`]. The hardware path hands
//! them to the device; the emulated path turns them into compute dispatches. The
//! caller allocates the result and scratch buffers from the sizes reported by
//! [`RtContext::prebuild_info`](crate::context::RtContext::prebuild_info).

use glam::Mat4;

use crate::context::RtContext;
use crate::device::RtDevice;
use crate::error::Result;
use crate::resource::{
    Format, GpuVirtualAddress, Resource, ResourceDesc, ResourceState, align_up,
};

/// Alignment of acceleration-structure result and scratch buffers.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

/// One triangle mesh inside a bottom-level build.
#[derive(Clone, Debug, PartialEq)]
pub struct TriangleGeometry {
    pub vertex_buffer: GpuVirtualAddress,
    pub vertex_count: u32,
    /// Distance in bytes between consecutive vertex positions.
    pub vertex_stride: u64,
    /// Format of the position attribute at the start of each vertex.
    pub vertex_format: Format,
    pub index_buffer: Option<GpuVirtualAddress>,
    pub index_count: u32,
    pub index_format: Format,
    pub opaque: bool,
}

impl TriangleGeometry {
    pub fn triangle_count(&self) -> u32 {
        if self.index_buffer.is_some() {
            self.index_count / 3
        } else {
            self.vertex_count / 3
        }
    }
}

/// Which level of the two-level hierarchy a structure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationLevel {
    Bottom,
    Top,
}

/// A top-level instance record, laid out exactly as the GPU reads it (64 bytes).
///
/// - `transform`: row-major 3x4 object-to-world matrix
/// - `id_and_mask`: instance id in the low 24 bits, visibility mask in the high 8
/// - `hit_group_and_flags`: hit-group record offset in the low 24 bits, flags in the high 8
/// - `acceleration_structure`: bottom-level address (hardware) or wrapped pointer bits (emulated)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    pub id_and_mask: u32,
    pub hit_group_and_flags: u32,
    pub acceleration_structure: u64,
}

impl InstanceDesc {
    pub fn new(
        transform: Mat4,
        instance_id: u32,
        hit_group_offset: u32,
        acceleration_structure: u64,
    ) -> Self {
        // Columns of the transpose are the rows of the original matrix.
        let rows = transform.transpose().to_cols_array();
        let mut packed = [0.0; 12];
        packed.copy_from_slice(&rows[..12]);

        Self {
            transform: packed,
            id_and_mask: (instance_id & 0x00FF_FFFF) | (0xFF << 24),
            hit_group_and_flags: hit_group_offset & 0x00FF_FFFF,
            acceleration_structure,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & 0x00FF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_and_flags & 0x00FF_FFFF
    }

    /// The transform expanded back into a matrix.
    pub fn matrix(&self) -> Mat4 {
        let mut cols = [0.0; 16];
        cols[..12].copy_from_slice(&self.transform);
        cols[15] = 1.0;
        Mat4::from_cols_array(&cols).transpose()
    }
}

/// Inputs for building one acceleration structure.
#[derive(Clone, Debug, PartialEq)]
pub enum BuildInputs {
    BottomLevel {
        geometries: Vec<TriangleGeometry>,
    },
    TopLevel {
        /// GPU copy of `instances`, for devices that read instance records from memory.
        instance_descs: GpuVirtualAddress,
        instances: Vec<InstanceDesc>,
    },
}

impl BuildInputs {
    pub fn level(&self) -> AccelerationLevel {
        match self {
            BuildInputs::BottomLevel { .. } => AccelerationLevel::Bottom,
            BuildInputs::TopLevel { .. } => AccelerationLevel::Top,
        }
    }

    /// Triangles for a bottom level, instances for a top level.
    pub fn primitive_count(&self) -> u32 {
        match self {
            BuildInputs::BottomLevel { geometries } => {
                geometries.iter().map(TriangleGeometry::triangle_count).sum()
            }
            BuildInputs::TopLevel { instances, .. } => instances.len() as u32,
        }
    }
}

/// Memory requirements of a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// A fully specified build: inputs plus destination and scratch memory.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildDesc {
    pub inputs: BuildInputs,
    pub dest: GpuVirtualAddress,
    pub scratch: GpuVirtualAddress,
}

/// Result and scratch buffers of one acceleration structure.
#[derive(Clone, Debug)]
pub struct AccelerationStructure {
    pub level: AccelerationLevel,
    pub result: Resource,
    pub scratch: Resource,
    /// Triangles (bottom level) or instances (top level) it was sized for.
    pub primitive_count: u32,
}

impl AccelerationStructure {
    /// Allocates result and scratch buffers sized by `info`.
    ///
    /// The result buffer is created directly in the state the context's capability
    /// path builds into (see
    /// [`RtContext::acceleration_structure_state`](crate::context::RtContext::acceleration_structure_state)),
    /// the scratch buffer in [`ResourceState::UnorderedAccess`].
    pub fn allocate(
        ctx: &RtContext,
        label: &str,
        level: AccelerationLevel,
        info: PrebuildInfo,
        primitive_count: u32,
    ) -> Result<Self> {
        let device = ctx.device();
        let result_size = align_up(info.result_size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);
        let scratch_size = align_up(info.scratch_size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);

        let result = device.create_resource(
            &ResourceDesc::buffer(format!("{label} (result)"), result_size)
                .with_unordered_access()
                .with_initial_state(ctx.acceleration_structure_state()),
        )?;
        let scratch = device.create_resource(
            &ResourceDesc::buffer(format!("{label} (scratch)"), scratch_size)
                .with_unordered_access()
                .with_initial_state(ResourceState::UnorderedAccess),
        )?;

        Ok(Self {
            level,
            result,
            scratch,
            primitive_count,
        })
    }

    /// Build description targeting this structure's buffers.
    pub fn build_desc(&self, inputs: BuildInputs) -> BuildDesc {
        BuildDesc {
            inputs,
            dest: self.result.gpu_address,
            scratch: self.scratch.gpu_address,
        }
    }

    /// Returns both buffers to the device.
    pub fn release(self, device: &dyn RtDevice) {
        device.release(&self.result);
        device.release(&self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn geometry(indexed: bool) -> TriangleGeometry {
        TriangleGeometry {
            vertex_buffer: 0x1000,
            vertex_count: 24,
            vertex_stride: 32,
            vertex_format: Format::R32G32B32Float,
            index_buffer: indexed.then_some(0x2000),
            index_count: if indexed { 36 } else { 0 },
            index_format: Format::R32Uint,
            opaque: true,
        }
    }

    #[test]
    fn instance_desc_is_64_bytes() {
        assert_eq!(std::mem::size_of::<InstanceDesc>(), 64);
    }

    #[test]
    fn instance_desc_packs_fields() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let desc = InstanceDesc::new(transform, 7, 3, 0xABCD);

        assert_eq!(desc.instance_id(), 7);
        assert_eq!(desc.mask(), 0xFF);
        assert_eq!(desc.hit_group_offset(), 3);
        assert_eq!(desc.acceleration_structure, 0xABCD);
        // Translation lands in the last column of each row.
        assert_eq!(desc.transform[3], 1.0);
        assert_eq!(desc.transform[7], 2.0);
        assert_eq!(desc.transform[11], 3.0);
        assert_eq!(desc.matrix(), transform);
    }

    #[test]
    fn triangle_counts() {
        assert_eq!(geometry(true).triangle_count(), 12);
        assert_eq!(geometry(false).triangle_count(), 8);

        let inputs = BuildInputs::BottomLevel {
            geometries: vec![geometry(true), geometry(false)],
        };
        assert_eq!(inputs.primitive_count(), 20);
        assert_eq!(inputs.level(), AccelerationLevel::Bottom);
    }
}
