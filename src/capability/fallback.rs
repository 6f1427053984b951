//! Emulated path: raytracing on compute kernels.
//!
//! The fallback layer never asks the device for raytracing features. It turns the
//! logical operations into compute work:
//!
//! - **Bottom-level build**: one `build_primitives` dispatch per geometry, packing
//!   each triangle into a 48-byte record in the result buffer.
//! - **Top-level build**: one `build_instances` dispatch per instance. The
//!   instance's bottom level is found through the indirection table and its
//!   triangles are written to the top level in world space, tagged with the
//!   instance id and hit-group record.
//! - **Ray dispatch**: the program library is linked after the traversal prelude
//!   into a single `fallback_raytrace` kernel, dispatched in 8x8 tiles over the
//!   output. A UAV barrier follows, so the output leaves the dispatch in the same
//!   state the native path leaves it in.
//!
//! ```text
//!   bottom level (per model)           top level (per scene)
//!   ┌──────────────────────┐           ┌─────────────────────────────────┐
//!   │ tri 0 │ tri 1 │ ...  │ ──xform──▶│ inst 0 tris │ inst 1 tris │ ... │
//!   └──────────────────────┘           └─────────────────────────────────┘
//!        48 bytes each                     traversed by fallback_raytrace
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{CapabilityMode, RaytracingLayer};
use crate::acceleration::{
    ACCELERATION_STRUCTURE_ALIGNMENT, BuildDesc, BuildInputs, InstanceDesc, PrebuildInfo,
    TriangleGeometry,
};
use crate::device::{
    CommandList, DispatchRaysDesc, KernelDesc, KernelId, RootArgument, RtDevice,
    ShaderIdentifier, root_slots,
};
use crate::error::{Result, RtError};
use crate::resource::{Format, Resource, ResourceState, align_up};
use crate::shader::RtProgram;
use crate::state::{RtState, StateHandle};
use crate::wrapped_pointer::{
    IndirectionRecord, IndirectionTable, ResolvedPointer, WrappedPointer,
};

/// Size of one packed triangle in an emulated acceleration structure.
pub const PACKED_TRIANGLE_SIZE: u64 = 48;

/// Scratch bytes reserved per primitive.
pub const SCRATCH_PER_PRIMITIVE: u64 = 16;

/// Tile edge of the traversal kernel.
pub const TRAVERSAL_TILE: u32 = 8;

/// Invocations per workgroup of the build kernels.
pub const BUILD_WORKGROUP_SIZE: u32 = 64;

/// Name of the linked traversal entry point.
pub const TRAVERSAL_ENTRY_POINT: &str = "fallback_raytrace";

/// Declarations shared by the fallback prelude and the native prelude.
pub const COMMON_PRELUDE: &str = include_str!("../shaders/common.wgsl");

const TRAVERSAL_PRELUDE: &str = include_str!("../shaders/fallback_traversal.wgsl");
const BUILD_PRIMITIVES_SOURCE: &str = include_str!("../shaders/fallback_primitives.wgsl");
const BUILD_INSTANCES_SOURCE: &str = include_str!("../shaders/fallback_instances.wgsl");

// Bindings of the build kernels.
const BUILD_CONSTANTS: u32 = 0;
const BUILD_SOURCE: u32 = 1;
const BUILD_INDICES: u32 = 2;
const BUILD_DEST_PRIMITIVES: u32 = 3;
const BUILD_DEST_INSTANCES: u32 = 2;

/// Compute emulation of raytracing, plus the indirection table.
pub struct FallbackLayer {
    device: Arc<dyn RtDevice>,
    table: IndirectionTable,
    build_primitives: KernelId,
    build_instances: KernelId,
}

impl FallbackLayer {
    /// Compiles the build kernels and creates an indirection table with
    /// `indirection_capacity` entries.
    pub fn new(device: Arc<dyn RtDevice>, indirection_capacity: u32) -> Result<Self> {
        let build_primitives = device.create_compute_kernel(&KernelDesc {
            label: "Fallback Build Primitives",
            source: BUILD_PRIMITIVES_SOURCE,
            entry_point: "build_primitives",
        })?;
        let build_instances = device.create_compute_kernel(&KernelDesc {
            label: "Fallback Build Instances",
            source: BUILD_INSTANCES_SOURCE,
            entry_point: "build_instances",
        })?;
        let table = IndirectionTable::new(device.as_ref(), indirection_capacity)?;

        Ok(Self {
            device,
            table,
            build_primitives,
            build_instances,
        })
    }

    pub fn indirection_table(&self) -> &IndirectionTable {
        &self.table
    }

    fn resolve_slot(&self, bits: u64) -> Result<&IndirectionRecord> {
        u32::try_from(bits)
            .ok()
            .and_then(|slot| self.table.resolve(slot))
            .ok_or(RtError::UnknownPointer(bits))
    }

    /// Bottom-level record referenced by an instance.
    fn instance_source(&self, instance: &InstanceDesc) -> Result<&IndirectionRecord> {
        self.resolve_slot(instance.acceleration_structure)
    }

    fn record_bottom_level(
        &self,
        list: &mut dyn CommandList,
        desc: &BuildDesc,
        geometries: &[TriangleGeometry],
    ) {
        let mut first_triangle = 0u32;
        for (geometry_index, geometry) in geometries.iter().enumerate() {
            let triangles = geometry.triangle_count();
            if triangles == 0 {
                continue;
            }

            let index_kind = match (geometry.index_buffer, geometry.index_format) {
                (None, _) => 0,
                (Some(_), Format::R16Uint) => 1,
                (Some(_), _) => 2,
            };

            list.set_compute_kernel(self.build_primitives);
            list.set_compute_root_argument(
                BUILD_CONSTANTS,
                RootArgument::Constants(vec![
                    triangles,
                    (geometry.vertex_stride / 4) as u32,
                    index_kind,
                    first_triangle,
                    geometry_index as u32,
                    geometry.vertex_count,
                    0,
                    0,
                ]),
            );
            list.set_compute_root_argument(
                BUILD_SOURCE,
                RootArgument::ShaderResource(geometry.vertex_buffer),
            );
            // Non-indexed geometry still binds something at the index slot.
            list.set_compute_root_argument(
                BUILD_INDICES,
                RootArgument::ShaderResource(
                    geometry.index_buffer.unwrap_or(geometry.vertex_buffer),
                ),
            );
            list.set_compute_root_argument(
                BUILD_DEST_PRIMITIVES,
                RootArgument::UnorderedAccess(desc.dest),
            );
            list.dispatch(triangles.div_ceil(BUILD_WORKGROUP_SIZE), 1, 1);

            first_triangle += triangles;
        }
    }

    fn record_top_level(
        &self,
        list: &mut dyn CommandList,
        desc: &BuildDesc,
        instances: &[InstanceDesc],
    ) -> Result<()> {
        let mut first_triangle = 0u32;
        for instance in instances {
            let source = *self.instance_source(instance)?;
            let triangles = source.element_count;
            if triangles == 0 {
                continue;
            }

            let mut constants = vec![
                triangles,
                first_triangle,
                instance.instance_id(),
                instance.hit_group_offset(),
            ];
            constants.extend(instance.transform.iter().map(|f| f.to_bits()));

            list.set_compute_kernel(self.build_instances);
            list.set_compute_root_argument(BUILD_CONSTANTS, RootArgument::Constants(constants));
            list.set_compute_root_argument(
                BUILD_SOURCE,
                RootArgument::ShaderResource(source.address),
            );
            list.set_compute_root_argument(
                BUILD_DEST_INSTANCES,
                RootArgument::UnorderedAccess(desc.dest),
            );
            list.dispatch(triangles.div_ceil(BUILD_WORKGROUP_SIZE), 1, 1);

            first_triangle += triangles;
        }
        Ok(())
    }
}

impl fmt::Debug for FallbackLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackLayer")
            .field("device", &self.device.name())
            .field("table", &self.table)
            .finish()
    }
}

impl RaytracingLayer for FallbackLayer {
    fn mode(&self) -> CapabilityMode {
        CapabilityMode::Emulated
    }

    /// Emulated builds are compute writes, so results stay in the UAV state.
    fn acceleration_structure_state(&self) -> ResourceState {
        ResourceState::UnorderedAccess
    }

    fn create_state_object(&self, program: &RtProgram) -> Result<RtState> {
        let source = program.link(&[COMMON_PRELUDE, TRAVERSAL_PRELUDE], TRAVERSAL_ENTRY_POINT);
        let label = format!("{} (fallback)", program.label);
        let kernel = self.device.create_compute_kernel(&KernelDesc {
            label: &label,
            source: &source,
            entry_point: TRAVERSAL_ENTRY_POINT,
        })?;

        debug!(program = %program.label, exports = program.exports().len(), "linked fallback program");

        Ok(RtState::new(
            program,
            CapabilityMode::Emulated,
            StateHandle::Kernel(kernel),
            ShaderIdentifier::synthetic_table(program),
        ))
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo> {
        let triangles: u64 = match inputs {
            BuildInputs::BottomLevel { .. } => inputs.primitive_count() as u64,
            BuildInputs::TopLevel { instances, .. } => {
                let mut total = 0u64;
                for instance in instances {
                    total += self.instance_source(instance)?.element_count as u64;
                }
                total
            }
        };

        Ok(PrebuildInfo {
            result_size: align_up(
                PACKED_TRIANGLE_SIZE * triangles,
                ACCELERATION_STRUCTURE_ALIGNMENT,
            ),
            scratch_size: align_up(
                SCRATCH_PER_PRIMITIVE * inputs.primitive_count() as u64,
                ACCELERATION_STRUCTURE_ALIGNMENT,
            ),
        })
    }

    fn build_acceleration_structure(
        &self,
        list: &mut dyn CommandList,
        desc: &BuildDesc,
    ) -> Result<()> {
        match &desc.inputs {
            BuildInputs::BottomLevel { geometries } => {
                self.record_bottom_level(list, desc, geometries)
            }
            BuildInputs::TopLevel { instances, .. } => {
                self.record_top_level(list, desc, instances)?
            }
        }
        list.uav_barrier(None);
        Ok(())
    }

    fn wrap_pointer(
        &mut self,
        resource: &Resource,
        element_count: u32,
        new_slot: bool,
    ) -> Result<WrappedPointer> {
        self.table
            .wrap(self.device.as_ref(), resource, element_count, new_slot)
    }

    fn wrap_acceleration_structure(
        &mut self,
        result: &Resource,
        triangle_count: u32,
        previous: Option<WrappedPointer>,
    ) -> Result<WrappedPointer> {
        let stride = PACKED_TRIANGLE_SIZE as u32;
        match previous.and_then(WrappedPointer::table_slot) {
            Some(slot) => {
                self.table
                    .replace(self.device.as_ref(), slot, result, triangle_count, stride)
            }
            None => self.table.wrap_with_stride(
                self.device.as_ref(),
                result,
                triangle_count,
                stride,
                false,
            ),
        }
    }

    fn resolve_pointer(&self, pointer: WrappedPointer) -> Result<ResolvedPointer> {
        match pointer {
            WrappedPointer::Emulated { slot } => self
                .table
                .resolve(slot)
                .map(|record| ResolvedPointer::Table(*record))
                .ok_or(RtError::UnknownPointer(slot as u64)),
            WrappedPointer::Address(_) => Err(RtError::ModeMismatch {
                expected: CapabilityMode::Hardware,
                actual: CapabilityMode::Emulated,
            }),
        }
    }

    fn bind_top_level(&self, list: &mut dyn CommandList, top_level: WrappedPointer) -> Result<()> {
        let address = self.resolve_pointer(top_level)?.address();
        list.set_compute_root_argument(
            root_slots::TOP_LEVEL,
            RootArgument::ShaderResource(address),
        );
        Ok(())
    }

    fn set_state(&self, list: &mut dyn CommandList, state: &RtState) -> Result<()> {
        state.expect_mode(CapabilityMode::Emulated)?;
        match state.handle() {
            StateHandle::Kernel(kernel) => {
                list.set_compute_kernel(kernel);
                Ok(())
            }
            StateHandle::Pipeline(_) => Err(RtError::ModeMismatch {
                expected: CapabilityMode::Hardware,
                actual: CapabilityMode::Emulated,
            }),
        }
    }

    fn dispatch_rays(&self, list: &mut dyn CommandList, desc: &DispatchRaysDesc) -> Result<()> {
        list.set_compute_root_argument(
            root_slots::INDIRECTION_TABLE,
            RootArgument::ShaderResource(self.table.buffer().gpu_address),
        );

        let groups_x = desc.width.div_ceil(TRAVERSAL_TILE);
        let groups_y = desc.height.div_ceil(TRAVERSAL_TILE);
        trace!(groups_x, groups_y, depth = desc.depth, "emulated dispatch");

        list.dispatch(groups_x, groups_y, desc.depth.max(1));
        list.uav_barrier(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{RecordedCommand, RecordingDevice};
    use crate::resource::ResourceDesc;
    use glam::Mat4;

    fn layer() -> (Arc<RecordingDevice>, FallbackLayer) {
        let device = Arc::new(RecordingDevice::emulated_only());
        let layer = FallbackLayer::new(device.clone(), 16).unwrap();
        (device, layer)
    }

    fn cube_geometry(vertices: &Resource, indices: &Resource) -> TriangleGeometry {
        TriangleGeometry {
            vertex_buffer: vertices.gpu_address,
            vertex_count: 24,
            vertex_stride: 32,
            vertex_format: Format::R32G32B32Float,
            index_buffer: Some(indices.gpu_address),
            index_count: 36,
            index_format: Format::R32Uint,
            opaque: true,
        }
    }

    #[test]
    fn bottom_level_sizes_follow_triangle_count() {
        let (device, layer) = layer();
        let vb = device.create_resource(&ResourceDesc::buffer("vb", 24 * 32)).unwrap();
        let ib = device.create_resource(&ResourceDesc::buffer("ib", 36 * 4)).unwrap();
        let inputs = BuildInputs::BottomLevel {
            geometries: vec![cube_geometry(&vb, &ib)],
        };

        let info = layer.prebuild_info(&inputs).unwrap();
        assert_eq!(info.result_size, 768);
        assert_eq!(info.scratch_size, 256);
    }

    #[test]
    fn top_level_sizes_resolve_through_the_table() {
        let (device, mut layer) = layer();
        let blas = device.create_resource(&ResourceDesc::buffer("blas", 768)).unwrap();
        let pointer = layer.wrap_pointer(&blas, 12, false).unwrap();

        let instances = vec![
            InstanceDesc::new(Mat4::IDENTITY, 0, 0, pointer.to_bits()),
            InstanceDesc::new(Mat4::IDENTITY, 1, 0, pointer.to_bits()),
        ];
        let inputs = BuildInputs::TopLevel {
            instance_descs: 0,
            instances,
        };
        let info = layer.prebuild_info(&inputs).unwrap();
        assert_eq!(info.result_size, align_up(48 * 24, 256));
        assert_eq!(info.scratch_size, 256);
    }

    #[test]
    fn unknown_instance_pointer_is_rejected() {
        let (_, layer) = layer();
        let inputs = BuildInputs::TopLevel {
            instance_descs: 0,
            instances: vec![InstanceDesc::new(Mat4::IDENTITY, 0, 0, 7)],
        };
        assert!(matches!(
            layer.prebuild_info(&inputs),
            Err(RtError::UnknownPointer(7))
        ));
    }

    #[test]
    fn addresses_are_not_truncated_to_slots() {
        let (device, mut layer) = layer();
        let blas = device.create_resource(&ResourceDesc::buffer("blas", 768)).unwrap();
        layer.wrap_pointer(&blas, 24, false).unwrap();

        // Low 32 bits name the occupied slot 0.
        let address = layer.indirection_table().buffer().gpu_address;
        assert_eq!(address as u32, 0);
        let inputs = BuildInputs::TopLevel {
            instance_descs: 0,
            instances: vec![InstanceDesc::new(Mat4::IDENTITY, 0, 0, address)],
        };
        assert!(matches!(
            layer.prebuild_info(&inputs),
            Err(RtError::UnknownPointer(bits)) if bits == address
        ));
    }

    #[test]
    fn acceleration_structures_use_the_packed_stride() {
        let (device, mut layer) = layer();
        let first = device.create_resource(&ResourceDesc::buffer("tlas", 1280)).unwrap();
        let pointer = layer.wrap_acceleration_structure(&first, 24, None).unwrap();
        let record = *layer.indirection_table().resolve(0).unwrap();
        assert_eq!((record.element_count, record.stride), (24, 48));

        let rebuilt = device.create_resource(&ResourceDesc::buffer("tlas", 1792)).unwrap();
        let again = layer
            .wrap_acceleration_structure(&rebuilt, 36, Some(pointer))
            .unwrap();
        assert_eq!(again, pointer);
        assert_eq!(layer.indirection_table().len(), 1);
        let record = layer.indirection_table().resolve(0).unwrap();
        assert_eq!((record.resource, record.element_count), (rebuilt.id, 36));
    }

    #[test]
    fn bottom_level_build_records_one_dispatch_per_geometry() {
        let (device, layer) = layer();
        let vb = device.create_resource(&ResourceDesc::buffer("vb", 24 * 32)).unwrap();
        let ib = device.create_resource(&ResourceDesc::buffer("ib", 36 * 4)).unwrap();
        let inputs = BuildInputs::BottomLevel {
            geometries: vec![cube_geometry(&vb, &ib), cube_geometry(&vb, &ib)],
        };
        let desc = BuildDesc {
            inputs,
            dest: 0x9000,
            scratch: 0xA000,
        };

        let mut list = device.create_command_list("build").unwrap();
        layer.build_acceleration_structure(list.as_mut(), &desc).unwrap();
        let commands = RecordingDevice::commands(list.as_ref());

        let dispatches = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Dispatch { .. }))
            .count();
        assert_eq!(dispatches, 2);
        assert!(matches!(
            commands.last(),
            Some(RecordedCommand::UavBarrier { resource: None })
        ));
        assert!(
            !commands
                .iter()
                .any(|c| matches!(c, RecordedCommand::BuildAccelerationStructure { .. }))
        );
    }

    #[test]
    fn dispatch_covers_output_in_tiles() {
        let (device, layer) = layer();
        let mut list = device.create_command_list("rays").unwrap();
        let desc = DispatchRaysDesc {
            ray_generation: Default::default(),
            miss: Default::default(),
            hit_group: Default::default(),
            width: 17,
            height: 8,
            depth: 1,
        };
        layer.dispatch_rays(list.as_mut(), &desc).unwrap();

        let commands = RecordingDevice::commands(list.as_ref());
        assert!(commands.iter().any(|c| matches!(
            c,
            RecordedCommand::Dispatch { groups: [3, 1, 1] }
        )));
    }
}
