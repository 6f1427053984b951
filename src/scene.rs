//! Scenes: model instances and the top-level acceleration structure.
//!
//! An [`RtScene`] owns its models. Each instance gets the hit-group record with
//! the same index, so the shader table must list scene records first and in
//! instance order; [`RtScene::add_hit_groups`] writes them that way.
//!
//! ```text
//!   instance i ──▶ InstanceDesc { transform, id = i, hit group = i, bottom level }
//!                                     │
//!   hit-group record i ◀───────────────┘  [ identifier | vertices | indices | material ]
//! ```

use glam::Mat4;
use tracing::{info, warn};

use crate::acceleration::{AccelerationLevel, AccelerationStructure, BuildInputs, InstanceDesc};
use crate::bindings::{LocalArgument, RtBindings};
use crate::context::Recording;
use crate::device::RtDevice;
use crate::error::{Result, RtError};
use crate::model::RtModel;
use crate::resource::{Resource, ResourceDesc};
use crate::wrapped_pointer::WrappedPointer;

/// Size of one instance record.
pub const INSTANCE_DESC_SIZE: u64 = std::mem::size_of::<InstanceDesc>() as u64;

/// A model placed in the scene.
#[derive(Debug)]
pub struct SceneInstance {
    pub model: RtModel,
    pub transform: Mat4,
    /// Index into the pipeline's material buffer.
    pub material: u32,
}

/// Models, their transforms, and the top level built over them.
#[derive(Debug)]
pub struct RtScene {
    label: String,
    instances: Vec<SceneInstance>,
    instance_buffer: Option<Resource>,
    top_level: Option<AccelerationStructure>,
    top_level_pointer: Option<WrappedPointer>,
    dirty: bool,
}

impl RtScene {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            instances: Vec::new(),
            instance_buffer: None,
            top_level: None,
            top_level_pointer: None,
            dirty: true,
        }
    }

    /// Adds `model` with material 0 and returns its instance index.
    pub fn add_model(&mut self, model: RtModel, transform: Mat4) -> u32 {
        self.add_model_with_material(model, transform, 0)
    }

    pub fn add_model_with_material(&mut self, model: RtModel, transform: Mat4, material: u32) -> u32 {
        self.instances.push(SceneInstance {
            model,
            transform,
            material,
        });
        self.dirty = true;
        self.instances.len() as u32 - 1
    }

    pub fn instances(&self) -> &[SceneInstance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Triangles across all instances, the size of the emulated top level.
    pub fn triangle_count(&self) -> u32 {
        self.instances
            .iter()
            .map(|instance| instance.model.triangle_count())
            .sum()
    }

    pub fn top_level(&self) -> Option<&AccelerationStructure> {
        self.top_level.as_ref()
    }

    /// Pointer to the built top level, for [`RtBindings::set_top_level`].
    pub fn top_level_pointer(&self) -> Result<WrappedPointer> {
        self.top_level_pointer
            .ok_or(RtError::NotPrepared("scene top level"))
    }

    /// Appends one hit-group record per instance, in instance order.
    ///
    /// Records carry the vertex and index pointers followed by the material index.
    pub fn add_hit_groups(&self, bindings: &mut RtBindings, export: &str) {
        if bindings.hit_group_count() != 0 {
            warn!(
                existing = bindings.hit_group_count(),
                "scene hit groups no longer start at record 0"
            );
        }
        for instance in &self.instances {
            bindings.add_hit_group(
                export,
                vec![
                    LocalArgument::Pointer(instance.model.vertex_pointer()),
                    LocalArgument::Pointer(instance.model.index_pointer()),
                    LocalArgument::Constants(vec![instance.material]),
                ],
            );
        }
    }

    /// Records bottom-level builds for every model, then the top level.
    ///
    /// Rebuilds only after instances were added. The previous top level is
    /// released, so the caller must have waited for dispatches that used it.
    #[tracing::instrument(skip_all, fields(scene = %self.label, instances = self.instances.len()))]
    pub fn build_top_level(&mut self, rec: &mut Recording<'_>) -> Result<()> {
        if !self.dirty && self.top_level.is_some() {
            return Ok(());
        }

        let mut instances = Vec::with_capacity(self.instances.len());
        for (index, instance) in self.instances.iter_mut().enumerate() {
            instance.model.build_bottom_level(rec)?;
            let bottom_level = instance
                .model
                .bottom_level_pointer()
                .ok_or(RtError::NotPrepared("bottom level"))?;
            instances.push(InstanceDesc::new(
                instance.transform,
                index as u32,
                index as u32,
                bottom_level.to_bits(),
            ));
        }

        let device = rec.context().device().clone();
        if let Some(old) = self.instance_buffer.take() {
            device.release(&old);
        }
        if let Some(old) = self.top_level.take() {
            old.release(device.as_ref());
        }

        let instance_buffer = device.create_resource(&ResourceDesc::upload_buffer(
            format!("{} Instances", self.label),
            INSTANCE_DESC_SIZE * instances.len().max(1) as u64,
        ))?;
        device.write_buffer(&instance_buffer, 0, bytemuck::cast_slice(&instances))?;

        let inputs = BuildInputs::TopLevel {
            instance_descs: instance_buffer.gpu_address,
            instances,
        };
        let info = rec.context().prebuild_info(&inputs)?;
        let structure = AccelerationStructure::allocate(
            rec.context(),
            &format!("{} Top Level", self.label),
            AccelerationLevel::Top,
            info,
            inputs.primitive_count(),
        )?;

        rec.build_acceleration_structure(&structure.build_desc(inputs))?;
        rec.uav_barrier(Some(&structure.result));

        let pointer = rec.context_mut().wrap_acceleration_structure(
            &structure,
            self.triangle_count(),
            self.top_level_pointer,
        )?;

        info!(
            triangles = self.triangle_count(),
            result = info.result_size,
            "top level recorded"
        );
        self.instance_buffer = Some(instance_buffer);
        self.top_level = Some(structure);
        self.top_level_pointer = Some(pointer);
        self.dirty = false;
        Ok(())
    }

    /// Returns every buffer, including the models', to the device.
    pub fn release(self, device: &dyn RtDevice) {
        if let Some(buffer) = self.instance_buffer {
            device.release(&buffer);
        }
        if let Some(structure) = self.top_level {
            structure.release(device);
        }
        for instance in self.instances {
            instance.model.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingDevice;
    use crate::config::ContextConfig;
    use crate::context::RtContext;
    use crate::geometry::RawGeometry;
    use crate::resource::align_up;
    use crate::wrapped_pointer::ResolvedPointer;
    use glam::Vec3;
    use std::sync::Arc;

    fn scene_on(device: RecordingDevice) -> (Arc<RecordingDevice>, RtContext, RtScene) {
        let device = Arc::new(device);
        let mut ctx = RtContext::new(device.clone(), ContextConfig::default()).unwrap();
        let mut scene = RtScene::new("Test");
        for x in [-1.0, 1.0] {
            let model = RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap();
            scene.add_model(model, Mat4::from_translation(Vec3::new(x, 0.0, 0.0)));
        }
        (device, ctx, scene)
    }

    fn build(device: &RecordingDevice, ctx: &mut RtContext, scene: &mut RtScene) {
        let mut list = device.create_command_list("build").unwrap();
        {
            let mut rec = ctx.record(list.as_mut());
            scene.build_top_level(&mut rec).unwrap();
        }
        device.submit(list).unwrap();
    }

    #[test]
    fn top_level_requires_a_build() {
        let scene = RtScene::new("Empty");
        assert!(matches!(
            scene.top_level_pointer(),
            Err(RtError::NotPrepared(_))
        ));
    }

    #[test]
    fn emulated_top_level_counts_scene_triangles() {
        let (device, mut ctx, mut scene) = scene_on(RecordingDevice::emulated_only());
        build(&device, &mut ctx, &mut scene);

        let pointer = scene.top_level_pointer().unwrap();
        match ctx.resolve_wrapped_pointer(pointer).unwrap() {
            ResolvedPointer::Table(record) => assert_eq!(record.element_count, 24),
            ResolvedPointer::Address(_) => panic!("expected a table entry"),
        }
        assert_eq!(scene.top_level().unwrap().result.size(), align_up(48 * 24, 256));
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn hardware_instances_point_at_bottom_levels() {
        let (device, mut ctx, mut scene) = scene_on(RecordingDevice::native());
        build(&device, &mut ctx, &mut scene);

        let buffer = scene.instance_buffer.as_ref().unwrap();
        let bytes = device.read_buffer(buffer).unwrap();
        let instances: Vec<InstanceDesc> = bytes
            .chunks_exact(INSTANCE_DESC_SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(instances.len(), 2);
        for (i, instance) in instances.iter().enumerate() {
            let model = &scene.instances()[i].model;
            assert_eq!(
                instance.acceleration_structure,
                model.bottom_level().unwrap().result.gpu_address
            );
            assert_eq!(instance.hit_group_offset(), i as u32);
        }
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn hit_groups_follow_instances() {
        let (_, _, scene) = scene_on(RecordingDevice::native());
        let mut bindings = RtBindings::new("ray_generation");
        scene.add_hit_groups(&mut bindings, "hit_group");
        assert_eq!(bindings.hit_group_count(), 2);
    }

    #[test]
    fn rebuilt_top_level_keeps_its_slot() {
        let (device, mut ctx, mut scene) = scene_on(RecordingDevice::emulated_only());
        build(&device, &mut ctx, &mut scene);
        let pointer = scene.top_level_pointer().unwrap();

        let model = RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap();
        scene.add_model(model, Mat4::IDENTITY);
        build(&device, &mut ctx, &mut scene);

        assert_eq!(scene.top_level_pointer().unwrap(), pointer);
        // Two slots for each model's buffers, one per bottom level, one top level.
        assert_eq!(ctx.indirection_table().unwrap().len(), 3 * 3 + 1);
        match ctx.resolve_wrapped_pointer(pointer).unwrap() {
            ResolvedPointer::Table(record) => {
                assert_eq!(record.resource, scene.top_level().unwrap().result.id);
                assert_eq!((record.element_count, record.stride), (36, 48));
            }
            ResolvedPointer::Address(_) => panic!("expected a table entry"),
        }
    }

    #[test]
    fn second_build_is_skipped() {
        let (device, mut ctx, mut scene) = scene_on(RecordingDevice::native());
        build(&device, &mut ctx, &mut scene);
        let first = scene.top_level().unwrap().result.id;
        build(&device, &mut ctx, &mut scene);
        assert_eq!(scene.top_level().unwrap().result.id, first);
    }
}
