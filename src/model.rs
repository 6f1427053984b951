//! Models: geometry buffers registered with a context.
//!
//! Creating an [`RtModel`] uploads a vertex and an index buffer and registers both
//! with the context:
//!
//! - two shader-resource descriptors, vertex buffer first, at consecutive slots
//!   of the shared heap;
//! - two wrapped pointers carrying the element counts (vertices, indices), which
//!   the scene embeds in the model's hit-group record.
//!
//! The bottom-level acceleration structure is built later, inside a recording, by
//! [`RtModel::build_bottom_level`]. The model owns every buffer it creates; call
//! [`RtModel::release`] only after the device finished all work that used them.

use tracing::{debug, info};

use crate::acceleration::{AccelerationLevel, AccelerationStructure, BuildInputs, TriangleGeometry};
use crate::context::{Recording, RtContext};
use crate::device::{RtDevice, ViewDesc};
use crate::error::Result;
use crate::geometry::{RawGeometry, Vertex};
use crate::resource::{Format, GpuDescriptorHandle, Resource, ResourceDesc, ResourceState};
use crate::wrapped_pointer::WrappedPointer;

/// State model buffers are created in and stay in.
pub const GEOMETRY_STATE: ResourceState = ResourceState::NonPixelShaderResource;

/// A triangle mesh registered with a context.
#[derive(Debug)]
pub struct RtModel {
    label: String,
    vertex_count: u32,
    index_count: u32,
    vertex_buffer: Resource,
    index_buffer: Resource,
    vertex_srv: u32,
    index_srv: u32,
    vertex_pointer: WrappedPointer,
    index_pointer: WrappedPointer,
    bottom_level: Option<AccelerationStructure>,
    bottom_level_pointer: Option<WrappedPointer>,
}

impl RtModel {
    /// Uploads `geometry` and registers its buffers with `ctx`.
    ///
    /// # Errors
    ///
    /// [`RtError::Exhausted`](crate::RtError::Exhausted) when the heap or the
    /// indirection table is full, or a device error if a buffer cannot be created.
    #[tracing::instrument(skip(ctx, geometry), fields(vertices = geometry.vertex_count(), indices = geometry.index_count()))]
    pub fn new(ctx: &mut RtContext, label: &str, geometry: &RawGeometry) -> Result<Self> {
        let device = ctx.device().clone();

        let vertex_buffer = device.create_resource(
            &ResourceDesc::buffer(format!("{label} Vertices"), geometry.vertex_bytes().len() as u64)
                .with_initial_state(GEOMETRY_STATE),
        )?;
        device.write_buffer(&vertex_buffer, 0, geometry.vertex_bytes())?;

        let index_buffer = device.create_resource(
            &ResourceDesc::buffer(format!("{label} Indices"), geometry.index_bytes().len() as u64)
                .with_initial_state(GEOMETRY_STATE),
        )?;
        device.write_buffer(&index_buffer, 0, geometry.index_bytes())?;

        let vertex_count = geometry.vertex_count();
        let index_count = geometry.index_count();

        let vertex_srv = ctx.register_view(
            &vertex_buffer,
            &ViewDesc::structured_buffer(vertex_count, Vertex::STRIDE as u32),
            None,
        )?;
        let index_srv = ctx.register_view(
            &index_buffer,
            &ViewDesc::raw_buffer(index_count, false),
            None,
        )?;

        let vertex_pointer = ctx.create_wrapped_pointer(&vertex_buffer, vertex_count)?;
        let index_pointer = ctx.create_wrapped_pointer(&index_buffer, index_count)?;

        debug!(vertex_srv, index_srv, "model registered");

        Ok(Self {
            label: label.to_string(),
            vertex_count,
            index_count,
            vertex_buffer,
            index_buffer,
            vertex_srv,
            index_srv,
            vertex_pointer,
            index_pointer,
            bottom_level: None,
            bottom_level_pointer: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    pub fn vertex_buffer(&self) -> &Resource {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Resource {
        &self.index_buffer
    }

    /// Heap indices of the vertex and index views.
    pub fn descriptor_indices(&self) -> (u32, u32) {
        (self.vertex_srv, self.index_srv)
    }

    pub fn vertex_srv_handle(&self, ctx: &RtContext) -> GpuDescriptorHandle {
        ctx.descriptor_gpu_handle(self.vertex_srv)
    }

    pub fn index_srv_handle(&self, ctx: &RtContext) -> GpuDescriptorHandle {
        ctx.descriptor_gpu_handle(self.index_srv)
    }

    pub fn vertex_pointer(&self) -> WrappedPointer {
        self.vertex_pointer
    }

    pub fn index_pointer(&self) -> WrappedPointer {
        self.index_pointer
    }

    /// The built bottom level, if any.
    pub fn bottom_level(&self) -> Option<&AccelerationStructure> {
        self.bottom_level.as_ref()
    }

    /// Wrapped pointer to the bottom level, written into instance records.
    pub fn bottom_level_pointer(&self) -> Option<WrappedPointer> {
        self.bottom_level_pointer
    }

    fn geometry(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_buffer: self.vertex_buffer.gpu_address,
            vertex_count: self.vertex_count,
            vertex_stride: Vertex::STRIDE,
            vertex_format: Vertex::POSITION_FORMAT,
            index_buffer: Some(self.index_buffer.gpu_address),
            index_count: self.index_count,
            index_format: Format::R32Uint,
            opaque: true,
        }
    }

    /// Records the bottom-level build. Does nothing if it was already built.
    ///
    /// Ends with a UAV barrier on the result so a top-level build recorded
    /// afterwards reads complete data.
    #[tracing::instrument(skip_all, fields(model = %self.label))]
    pub fn build_bottom_level(&mut self, rec: &mut Recording<'_>) -> Result<()> {
        if self.bottom_level.is_some() {
            return Ok(());
        }

        let inputs = BuildInputs::BottomLevel {
            geometries: vec![self.geometry()],
        };
        let info = rec.context().prebuild_info(&inputs)?;
        let structure = AccelerationStructure::allocate(
            rec.context(),
            &format!("{} Bottom Level", self.label),
            AccelerationLevel::Bottom,
            info,
            self.triangle_count(),
        )?;

        rec.build_acceleration_structure(&structure.build_desc(inputs))?;
        rec.uav_barrier(Some(&structure.result));

        let pointer = rec.context_mut().wrap_acceleration_structure(
            &structure,
            self.triangle_count(),
            self.bottom_level_pointer,
        )?;

        info!(
            triangles = self.triangle_count(),
            result = info.result_size,
            scratch = info.scratch_size,
            "bottom level recorded"
        );
        self.bottom_level = Some(structure);
        self.bottom_level_pointer = Some(pointer);
        Ok(())
    }

    /// Returns every buffer to the device.
    pub fn release(self, device: &dyn RtDevice) {
        device.release(&self.vertex_buffer);
        device.release(&self.index_buffer);
        if let Some(structure) = self.bottom_level {
            structure.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingDevice;
    use crate::config::ContextConfig;
    use crate::wrapped_pointer::ResolvedPointer;
    use std::sync::Arc;

    fn context(device: RecordingDevice) -> (Arc<RecordingDevice>, RtContext) {
        let device = Arc::new(device);
        let ctx = RtContext::new(device.clone(), ContextConfig::default()).unwrap();
        (device, ctx)
    }

    #[test]
    fn cube_registers_two_descriptors() {
        let (_, mut ctx) = context(RecordingDevice::native());
        let model = RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap();

        assert_eq!(ctx.allocated_descriptors(), 2);
        assert_eq!(model.descriptor_indices(), (0, 1));
        assert_eq!(model.vertex_count(), 24);
        assert_eq!(model.index_count(), 36);
    }

    #[test]
    fn buffers_hold_geometry() {
        let (device, mut ctx) = context(RecordingDevice::native());
        let cube = RawGeometry::cube();
        let model = RtModel::new(&mut ctx, "Cube", &cube).unwrap();

        assert_eq!(
            device.read_buffer(model.vertex_buffer()).unwrap(),
            cube.vertex_bytes()
        );
        assert_eq!(
            device.read_buffer(model.index_buffer()).unwrap(),
            cube.index_bytes()
        );
    }

    #[test]
    fn emulated_pointers_record_counts() {
        let (_, mut ctx) = context(RecordingDevice::emulated_only());
        let model = RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap();

        let count = |pointer| match ctx.resolve_wrapped_pointer(pointer).unwrap() {
            ResolvedPointer::Table(record) => record.element_count,
            ResolvedPointer::Address(_) => panic!("expected a table entry"),
        };
        assert_eq!(count(model.vertex_pointer()), 24);
        assert_eq!(count(model.index_pointer()), 36);
        assert_eq!(ctx.indirection_table().unwrap().len(), 2);
    }

    #[test]
    fn bottom_level_is_built_once() {
        let (device, mut ctx) = context(RecordingDevice::native());
        let mut model = RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap();

        let mut list = device.create_command_list("blas").unwrap();
        {
            let mut rec = ctx.record(list.as_mut());
            model.build_bottom_level(&mut rec).unwrap();
            model.build_bottom_level(&mut rec).unwrap();
        }
        let builds = RecordingDevice::commands(list.as_ref())
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    crate::backend::recording::RecordedCommand::BuildAccelerationStructure { .. }
                )
            })
            .count();
        assert_eq!(builds, 1);

        let structure = model.bottom_level().unwrap();
        assert_eq!(
            model.bottom_level_pointer(),
            Some(WrappedPointer::Address(structure.result.gpu_address))
        );
        device.submit(list).unwrap();
        assert!(device.validation_messages().is_empty());
    }
}
