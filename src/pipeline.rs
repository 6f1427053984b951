//! A progressive path-tracing pipeline built on [`RtContext`].
//!
//! [`RaytracingPipeline`] is the reference consumer of the context. It owns a
//! scene, a material table, a camera, and the output texture, and records one
//! raytrace per frame:
//!
//! ```text
//!   load_resources ──▶ create_output_resource ──▶ build_acceleration_structures
//!                                                            │
//!          ┌─────────────────────────────────────────────────┘
//!          ▼
//!   update (constants, accumulation) ──▶ render ──▶ output SRV ──▶ compositor
//!          ▲                                                        │
//!          └──────────────────────── next frame ────────────────────┘
//! ```
//!
//! Root slots bound for the scene program:
//!
//! | slot | argument                               |
//! |------|----------------------------------------|
//! | 4    | frame constants (constant buffer)      |
//! | 5    | output texture UAV (descriptor table)  |
//! | 6    | materials (shader resource)            |
//! | 7    | accumulation buffer (unordered access) |
//!
//! Between frames the output texture rests in
//! [`ResourceState::NonPixelShaderResource`] so a compositor can sample it
//! through [`RaytracingPipeline::output_srv_handle`].
//!
//! # Example
//!
//! ```ignore
//! let mut pipeline = RaytracingPipeline::new(PipelineConfig::default());
//! pipeline.set_scene(scene);
//! pipeline.load_resources(&mut ctx)?;
//! pipeline.create_output_resource(&mut ctx, 1280, 720)?;
//!
//! let mut list = device.create_command_list("frame")?;
//! {
//!     let mut rec = ctx.record(list.as_mut());
//!     pipeline.build_acceleration_structures(&mut rec)?;
//!     pipeline.update(0.016, 0, 0, 0, 1280, 720)?;
//!     pipeline.render(&mut rec, 0, 1280, 720)?;
//! }
//! device.submit(list)?;
//! ```

use std::sync::Arc;

use glam::Vec3;
use tracing::{debug, info, warn};

use crate::bindings::RtBindings;
use crate::camera::Camera;
use crate::config::PipelineConfig;
use crate::context::{Recording, RtContext};
use crate::device::{RootArgument, RtDevice, ViewDesc};
use crate::error::{Result, RtError};
use crate::resource::{Format, GpuDescriptorHandle, Resource, ResourceDesc, ResourceState};
use crate::scene::RtScene;
use crate::shader::{HitGroup, RtProgram, RtShader};
use crate::state::RtState;
use crate::wrapped_pointer::WrappedPointer;

const SCENE_LIBRARY: &str = include_str!("shaders/scene.wgsl");

/// Export names of the default scene program.
pub const RAY_GENERATION_EXPORT: &str = "ray_generation";
pub const MISS_EXPORT: &str = "miss";
pub const HIT_GROUP_EXPORT: &str = "hit_group";

/// Root slots of the scene program.
pub mod slots {
    use crate::device::root_slots;

    pub const FRAME_CONSTANTS: u32 = root_slots::FIRST_USER;
    pub const OUTPUT: u32 = root_slots::FIRST_USER + 1;
    pub const MATERIALS: u32 = root_slots::FIRST_USER + 2;
    pub const ACCUMULATION: u32 = root_slots::FIRST_USER + 3;
}

/// State the output texture is left in after every frame.
pub const OUTPUT_RESTING_STATE: ResourceState = ResourceState::NonPixelShaderResource;

/// Bytes reserved per frame-constant buffer.
const FRAME_CONSTANTS_SIZE: u64 = 256;

/// Materials the first material buffer holds before it has to grow.
const INITIAL_MATERIAL_CAPACITY: usize = 16;

/// Bytes per accumulated pixel (one `vec4<f32>`).
const ACCUMULATION_TEXEL_SIZE: u64 = 16;

/// Surface kind read by the closest-hit shader.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialKind {
    Diffuse = 0,
    Reflective = 1,
}

/// One entry of the material table, as laid out in the shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Material {
    pub albedo: [f32; 4],
    pub specular: [f32; 4],
    pub roughness: f32,
    /// Fraction of light carried by the reflected ray.
    pub reflectivity: f32,
    pub kind: u32,
    _reserved: u32,
}

impl Default for Material {
    fn default() -> Self {
        Self::diffuse(Vec3::splat(0.8))
    }
}

impl Material {
    pub fn diffuse(albedo: Vec3) -> Self {
        Self {
            albedo: albedo.extend(1.0).to_array(),
            specular: [0.0; 4],
            roughness: 1.0,
            reflectivity: 0.0,
            kind: MaterialKind::Diffuse as u32,
            _reserved: 0,
        }
    }

    /// A mirror-like surface; `roughness` blurs the reflection.
    pub fn reflective(albedo: Vec3, specular: Vec3, reflectivity: f32, roughness: f32) -> Self {
        Self {
            albedo: albedo.extend(1.0).to_array(),
            specular: specular.extend(1.0).to_array(),
            roughness: roughness.clamp(0.0, 1.0),
            reflectivity: reflectivity.clamp(0.0, 1.0),
            kind: MaterialKind::Reflective as u32,
            _reserved: 0,
        }
    }
}

/// Per-frame constants at [`slots::FRAME_CONSTANTS`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameConstants {
    pub inverse_view_projection: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    /// Direction the light travels in.
    pub light_direction: [f32; 4],
    pub frame_index: u32,
    /// Frames already summed in the accumulation buffer.
    pub accumulated_frames: u32,
    pub max_depth: u32,
    pub seed: u32,
    pub width: u32,
    pub height: u32,
    pub elapsed: f32,
    _reserved: u32,
}

/// Name of `format` in a WGSL storage-texture declaration.
pub fn storage_format_name(format: Format) -> Option<&'static str> {
    match format {
        Format::R8G8B8A8Unorm => Some("rgba8unorm"),
        Format::R16G16B16A16Float => Some("rgba16float"),
        Format::R32G32B32A32Float => Some("rgba32float"),
        Format::R32Uint => Some("r32uint"),
        _ => None,
    }
}

/// The default scene program, with its output declared as `format`.
pub fn scene_program(format: Format, max_recursion_depth: u32) -> Result<RtProgram> {
    let name = storage_format_name(format)
        .ok_or_else(|| RtError::device(format!("{format:?} cannot be a storage output")))?;

    Ok(
        RtProgram::new("Scene", SCENE_LIBRARY.replace("OUTPUT_FORMAT", name))
            .with_ray_generation(RtShader::ray_generation(RAY_GENERATION_EXPORT))
            .with_miss(RtShader::miss(MISS_EXPORT).with_payload_size(56))
            .with_hit_group(
                HitGroup::new(HIT_GROUP_EXPORT).with_closest_hit(
                    RtShader::closest_hit("closest_hit")
                        .with_payload_size(56)
                        .with_attribute_size(8)
                        .with_local_arguments(20),
                ),
            )
            .with_max_recursion_depth(max_recursion_depth),
    )
}

/// The output texture and the resources sized with it.
#[derive(Debug)]
struct OutputTarget {
    texture: Resource,
    accumulation: Resource,
    width: u32,
    height: u32,
    uav_handle: GpuDescriptorHandle,
    srv_handle: GpuDescriptorHandle,
}

/// Scene, materials, camera, and output of a progressive raytracer.
pub struct RaytracingPipeline {
    config: PipelineConfig,
    /// When false, [`RaytracingPipeline::render`] records nothing.
    pub active: bool,
    scene: Option<RtScene>,
    materials: Vec<Material>,
    materials_dirty: bool,
    camera: Camera,
    light_direction: Vec3,

    device: Option<Arc<dyn RtDevice>>,
    state: Option<RtState>,
    bindings: Option<RtBindings>,
    bound_top_level: Option<WrappedPointer>,
    frame_constants: Vec<Resource>,
    material_buffer: Option<Resource>,
    material_capacity: usize,

    output: Option<OutputTarget>,
    output_uav_index: Option<u32>,
    output_srv_index: Option<u32>,

    accumulated_frames: u32,
    last_camera: Option<Camera>,
}

impl RaytracingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            active: true,
            scene: None,
            materials: Vec::new(),
            materials_dirty: true,
            camera: Camera::default(),
            light_direction: Vec3::new(-0.4, -1.0, -0.6).normalize(),
            device: None,
            state: None,
            bindings: None,
            bound_top_level: None,
            frame_constants: Vec::new(),
            material_buffer: None,
            material_capacity: 0,
            output: None,
            output_uav_index: None,
            output_srv_index: None,
            accumulated_frames: 0,
            last_camera: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Replaces the scene. Acceleration structures are rebuilt by the next
    /// [`RaytracingPipeline::build_acceleration_structures`].
    pub fn set_scene(&mut self, scene: RtScene) {
        let previous = self.scene.replace(scene);
        if let (Some(old), Some(device)) = (previous, &self.device) {
            old.release(device.as_ref());
        }
        self.bound_top_level = None;
        self.accumulated_frames = 0;
    }

    pub fn scene(&self) -> Option<&RtScene> {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> Option<&mut RtScene> {
        self.scene.as_mut()
    }

    /// Appends a material and returns the index scene instances refer to it by.
    pub fn add_material(&mut self, material: Material) -> u32 {
        self.materials.push(material);
        self.materials_dirty = true;
        self.materials.len() as u32 - 1
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn set_light_direction(&mut self, direction: Vec3) {
        self.light_direction = direction.normalize_or_zero();
        self.accumulated_frames = 0;
    }

    /// Frames summed into the accumulation buffer so far.
    pub fn accumulated_frames(&self) -> u32 {
        self.accumulated_frames
    }

    pub fn state(&self) -> Option<&RtState> {
        self.state.as_ref()
    }

    pub fn bindings(&self) -> Option<&RtBindings> {
        self.bindings.as_ref()
    }

    /// Creates the state object, one constant buffer per frame in flight, and
    /// the material buffer.
    #[tracing::instrument(skip_all, fields(frames = self.config.frame_count, mode = %ctx.mode()))]
    pub fn load_resources(&mut self, ctx: &mut RtContext) -> Result<()> {
        let program = scene_program(self.config.format, self.config.max_recursion_depth)?;
        let state = ctx.create_state_object(&program)?;
        let device = ctx.device().clone();

        for buffer in self.frame_constants.drain(..) {
            device.release(&buffer);
        }
        for frame in 0..self.config.frame_count {
            self.frame_constants.push(device.create_resource(
                &ResourceDesc::upload_buffer(format!("Frame Constants {frame}"), FRAME_CONSTANTS_SIZE),
            )?);
        }

        if self.materials.is_empty() {
            self.add_material(Material::default());
        }
        self.device = Some(device);
        self.upload_materials()?;

        info!(
            materials = self.materials.len(),
            depth = state.max_recursion_depth(),
            "pipeline resources loaded"
        );
        self.state = Some(state);
        self.bindings = None;
        self.bound_top_level = None;
        Ok(())
    }

    fn device(&self) -> Result<&Arc<dyn RtDevice>> {
        self.device
            .as_ref()
            .ok_or(RtError::NotPrepared("pipeline resources"))
    }

    /// Writes the material table, growing the buffer when it is too small.
    fn upload_materials(&mut self) -> Result<()> {
        if !self.materials_dirty {
            return Ok(());
        }
        let device = self.device()?.clone();

        if self.materials.len() > self.material_capacity || self.material_buffer.is_none() {
            let capacity = self
                .materials
                .len()
                .next_power_of_two()
                .max(INITIAL_MATERIAL_CAPACITY);
            if let Some(old) = self.material_buffer.take() {
                // The old table may still be read by a submitted frame.
                device.wait_idle()?;
                device.release(&old);
            }
            let size = (capacity * std::mem::size_of::<Material>()) as u64;
            self.material_buffer =
                Some(device.create_resource(&ResourceDesc::upload_buffer("Materials", size))?);
            self.material_capacity = capacity;
            debug!(capacity, "material buffer allocated");
        }

        if let Some(buffer) = &self.material_buffer {
            device.write_buffer(buffer, 0, bytemuck::cast_slice(&self.materials))?;
        }
        self.materials_dirty = false;
        Ok(())
    }

    /// Creates the output texture and accumulation buffer for `width x height`.
    ///
    /// The UAV and SRV keep the descriptor indices of the first call, so
    /// handles given out before a resize stay valid. Does nothing when the size
    /// is unchanged. The previous texture is released; the caller must have
    /// waited for frames that used it.
    #[tracing::instrument(skip(self, ctx))]
    pub fn create_output_resource(&mut self, ctx: &mut RtContext, width: u32, height: u32) -> Result<()> {
        let width = width.max(1);
        let height = height.max(1);
        let unchanged = self
            .output
            .as_ref()
            .is_some_and(|output| output.width == width && output.height == height);
        if unchanged {
            return Ok(());
        }

        let device = ctx.device().clone();
        if let Some(old) = self.output.take() {
            device.release(&old.texture);
            device.release(&old.accumulation);
        }

        let format = self.config.format;
        let texture = device.create_resource(
            &ResourceDesc::texture_2d("Raytracing Output", width, height, format)
                .with_unordered_access()
                .with_initial_state(OUTPUT_RESTING_STATE),
        )?;
        let accumulation = device.create_resource(
            &ResourceDesc::buffer(
                "Accumulation",
                width as u64 * height as u64 * ACCUMULATION_TEXEL_SIZE,
            )
            .with_unordered_access()
            .with_initial_state(ResourceState::UnorderedAccess),
        )?;

        let uav_index =
            ctx.register_view(&texture, &ViewDesc::texture_uav(format), self.output_uav_index)?;
        let srv_index =
            ctx.register_view(&texture, &ViewDesc::texture_srv(format), self.output_srv_index)?;
        self.output_uav_index = Some(uav_index);
        self.output_srv_index = Some(srv_index);

        info!(width, height, uav_index, srv_index, "output resource created");
        self.output = Some(OutputTarget {
            texture,
            accumulation,
            width,
            height,
            uav_handle: ctx.descriptor_gpu_handle(uav_index),
            srv_handle: ctx.descriptor_gpu_handle(srv_index),
        });
        self.accumulated_frames = 0;
        Ok(())
    }

    pub fn output_resource(&self) -> Option<&Resource> {
        self.output.as_ref().map(|output| &output.texture)
    }

    /// Shader-visible handle of the output SRV, for the compositor.
    pub fn output_srv_handle(&self) -> Option<GpuDescriptorHandle> {
        self.output.as_ref().map(|output| output.srv_handle)
    }

    /// Heap indices of the output UAV and SRV.
    pub fn output_descriptor_indices(&self) -> Option<(u32, u32)> {
        self.output_uav_index.zip(self.output_srv_index)
    }

    /// Builds the scene's acceleration structures and writes the shader table.
    ///
    /// The shader table is rewritten only when the top level changed.
    #[tracing::instrument(skip_all)]
    pub fn build_acceleration_structures(&mut self, rec: &mut Recording<'_>) -> Result<()> {
        let scene = self.scene.as_mut().ok_or(RtError::NotPrepared("pipeline scene"))?;
        let state = self
            .state
            .as_ref()
            .ok_or(RtError::NotPrepared("pipeline state object"))?;

        scene.build_top_level(rec)?;
        let top_level = scene.top_level_pointer()?;
        if self.bound_top_level == Some(top_level) && self.bindings.is_some() {
            return Ok(());
        }

        // `apply` releases the previous table, so the old bindings are reused.
        let mut bindings = self
            .bindings
            .take()
            .unwrap_or_else(|| RtBindings::new(RAY_GENERATION_EXPORT));
        bindings.clear_records();
        scene.add_hit_groups(&mut bindings, HIT_GROUP_EXPORT);
        bindings.add_miss(MISS_EXPORT, Vec::new());
        bindings.set_top_level(top_level);
        bindings.apply(rec.context(), state)?;

        for instance in scene.instances() {
            if instance.material as usize >= self.materials.len() {
                warn!(
                    model = instance.model.label(),
                    material = instance.material,
                    "material index out of range, the last material is used"
                );
            }
        }

        self.bindings = Some(bindings);
        self.bound_top_level = Some(top_level);
        self.accumulated_frames = 0;
        Ok(())
    }

    /// Writes the constants of `cur_frame` and advances accumulation.
    ///
    /// Accumulation restarts when the camera moved or the output size changed
    /// since the previous update.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn update(
        &mut self,
        elapsed: f32,
        frame_count: u64,
        prev_frame: u32,
        cur_frame: u32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if height > 0 {
            self.camera.set_aspect(width as f32 / height as f32);
        }
        self.upload_materials()?;

        let resized = self
            .output
            .as_ref()
            .is_none_or(|output| output.width != width || output.height != height);
        let moved = self.last_camera != Some(self.camera);
        if resized || moved {
            if self.accumulated_frames > 0 {
                debug!(resized, moved, prev_frame, "accumulation reset");
            }
            self.accumulated_frames = 0;
        } else {
            self.accumulated_frames = self.accumulated_frames.saturating_add(1);
        }
        self.last_camera = Some(self.camera);

        let constants = FrameConstants {
            inverse_view_projection: self.camera.inverse_view_projection().to_cols_array_2d(),
            camera_position: self.camera.position.extend(1.0).to_array(),
            light_direction: self.light_direction.extend(0.0).to_array(),
            frame_index: cur_frame,
            accumulated_frames: self.accumulated_frames,
            max_depth: self.config.max_recursion_depth,
            seed: frame_count as u32,
            width,
            height,
            elapsed,
            _reserved: 0,
        };

        let buffer = self.frame_constant_buffer(cur_frame)?;
        self.device()?
            .write_buffer(buffer, 0, bytemuck::bytes_of(&constants))
    }

    fn frame_constant_buffer(&self, frame_index: u32) -> Result<&Resource> {
        if self.frame_constants.is_empty() {
            return Err(RtError::NotPrepared("frame constant buffers"));
        }
        Ok(&self.frame_constants[frame_index as usize % self.frame_constants.len()])
    }

    /// Records the frame: output to UAV, raytrace, output back to SRV.
    ///
    /// Records nothing while [`RaytracingPipeline::active`] is false.
    #[tracing::instrument(skip(self, rec), level = "debug")]
    pub fn render(
        &mut self,
        rec: &mut Recording<'_>,
        frame_index: u32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        let constants = self.frame_constant_buffer(frame_index)?.gpu_address;
        let materials = self
            .material_buffer
            .as_ref()
            .ok_or(RtError::NotPrepared("material buffer"))?
            .gpu_address;
        let state = self
            .state
            .as_ref()
            .ok_or(RtError::NotPrepared("pipeline state object"))?;
        let output = self
            .output
            .as_ref()
            .ok_or(RtError::NotPrepared("output resource"))?;
        let bindings = self
            .bindings
            .as_mut()
            .ok_or(RtError::NotPrepared("pipeline bindings"))?;

        bindings.set_global(slots::FRAME_CONSTANTS, RootArgument::ConstantBuffer(constants));
        bindings.set_global(slots::OUTPUT, RootArgument::DescriptorTable(output.uav_handle));
        bindings.set_global(slots::MATERIALS, RootArgument::ShaderResource(materials));
        bindings.set_global(
            slots::ACCUMULATION,
            RootArgument::UnorderedAccess(output.accumulation.gpu_address),
        );

        rec.bind_descriptor_heap();
        rec.transition_resource(
            &output.texture,
            OUTPUT_RESTING_STATE,
            ResourceState::UnorderedAccess,
        );
        rec.raytrace(
            bindings,
            state,
            width.min(output.width),
            height.min(output.height),
        )?;
        rec.transition_resource(
            &output.texture,
            ResourceState::UnorderedAccess,
            OUTPUT_RESTING_STATE,
        );
        Ok(())
    }

    /// Returns every resource to the device. Wait for the device first.
    pub fn release(mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        for buffer in self.frame_constants.drain(..) {
            device.release(&buffer);
        }
        if let Some(buffer) = self.material_buffer.take() {
            device.release(&buffer);
        }
        if let Some(output) = self.output.take() {
            device.release(&output.texture);
            device.release(&output.accumulation);
        }
        if let Some(bindings) = self.bindings.take() {
            bindings.release(device.as_ref());
        }
        if let Some(scene) = self.scene.take() {
            scene.release(device.as_ref());
        }
    }
}

impl std::fmt::Debug for RaytracingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaytracingPipeline")
            .field("active", &self.active)
            .field("materials", &self.materials.len())
            .field("loaded", &self.state.is_some())
            .field("output", &self.output.as_ref().map(|o| (o.width, o.height)))
            .field("accumulated_frames", &self.accumulated_frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{RecordedCommand, RecordingDevice};
    use crate::config::ContextConfig;
    use crate::geometry::RawGeometry;
    use crate::model::RtModel;
    use glam::Mat4;

    fn setup(device: RecordingDevice) -> (Arc<RecordingDevice>, RtContext, RaytracingPipeline) {
        let device = Arc::new(device);
        let mut ctx = RtContext::new(device.clone(), ContextConfig::default()).unwrap();
        let mut scene = RtScene::new("Test");
        let model = RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap();
        scene.add_model(model, Mat4::IDENTITY);

        let mut pipeline = RaytracingPipeline::new(PipelineConfig::default());
        pipeline.set_scene(scene);
        pipeline.load_resources(&mut ctx).unwrap();
        pipeline.create_output_resource(&mut ctx, 64, 32).unwrap();
        (device, ctx, pipeline)
    }

    fn frame(device: &RecordingDevice, ctx: &mut RtContext, pipeline: &mut RaytracingPipeline, index: u32) {
        let mut list = device.create_command_list("frame").unwrap();
        {
            let mut rec = ctx.record(list.as_mut());
            pipeline.build_acceleration_structures(&mut rec).unwrap();
            pipeline.update(0.016, index as u64, index.saturating_sub(1), index, 64, 32).unwrap();
            pipeline.render(&mut rec, index, 64, 32).unwrap();
        }
        device.submit(list).unwrap();
    }

    #[test]
    fn gpu_layouts_match_the_shader() {
        assert_eq!(std::mem::size_of::<Material>(), 48);
        assert_eq!(std::mem::size_of::<FrameConstants>(), 128);
    }

    #[test]
    fn scene_program_substitutes_the_output_format() {
        let program = scene_program(Format::R8G8B8A8Unorm, 2).unwrap();
        assert!(program.library.contains("texture_storage_2d<rgba8unorm, write>"));
        assert!(!program.library.contains("OUTPUT_FORMAT"));
        assert!(scene_program(Format::R16Uint, 2).is_err());
    }

    #[test]
    fn output_indices_survive_resize() {
        let (device, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        let indices = pipeline.output_descriptor_indices().unwrap();
        let srv = pipeline.output_srv_handle().unwrap();
        let first_resource = pipeline.output_resource().unwrap().clone();
        let first = first_resource.id;
        let allocated = ctx.allocated_descriptors();

        pipeline.create_output_resource(&mut ctx, 128, 96).unwrap();

        assert_eq!(pipeline.output_descriptor_indices(), Some(indices));
        assert_eq!(pipeline.output_srv_handle(), Some(srv));
        assert_eq!(ctx.allocated_descriptors(), allocated);
        assert_ne!(pipeline.output_resource().unwrap().id, first);
        assert!(!device.is_live(&first_resource));
    }

    #[test]
    fn same_size_keeps_the_output() {
        let (_, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        let first = pipeline.output_resource().unwrap().id;
        pipeline.create_output_resource(&mut ctx, 64, 32).unwrap();
        assert_eq!(pipeline.output_resource().unwrap().id, first);
    }

    #[test]
    fn accumulation_resets_on_camera_change() {
        let (device, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        for i in 0..3 {
            frame(&device, &mut ctx, &mut pipeline, i);
        }
        assert_eq!(pipeline.accumulated_frames(), 2);

        pipeline.set_camera(Camera::new().at(Vec3::new(0.0, 3.0, 6.0)));
        frame(&device, &mut ctx, &mut pipeline, 3);
        assert_eq!(pipeline.accumulated_frames(), 0);
    }

    #[test]
    fn accumulation_resets_on_resize() {
        let (device, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        frame(&device, &mut ctx, &mut pipeline, 0);
        frame(&device, &mut ctx, &mut pipeline, 1);
        assert_eq!(pipeline.accumulated_frames(), 1);

        pipeline.update(0.016, 2, 1, 2, 80, 32).unwrap();
        assert_eq!(pipeline.accumulated_frames(), 0);
    }

    #[test]
    fn frame_constants_reach_the_buffer() {
        let (device, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        frame(&device, &mut ctx, &mut pipeline, 1);

        let bytes = device.read_buffer(&pipeline.frame_constants[1]).unwrap();
        let constants: FrameConstants =
            bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<FrameConstants>()]);
        assert_eq!(constants.frame_index, 1);
        assert_eq!((constants.width, constants.height), (64, 32));
        assert_eq!(constants.max_depth, pipeline.config().max_recursion_depth);
    }

    #[test]
    fn render_leaves_output_in_resting_state() {
        for device in [RecordingDevice::native(), RecordingDevice::emulated_only()] {
            let (device, mut ctx, mut pipeline) = setup(device);
            frame(&device, &mut ctx, &mut pipeline, 0);
            frame(&device, &mut ctx, &mut pipeline, 1);

            let output = pipeline.output_resource().unwrap();
            assert_eq!(device.resource_state(output), Some(OUTPUT_RESTING_STATE));
            assert!(
                device.validation_messages().is_empty(),
                "{:?}",
                device.validation_messages()
            );
        }
    }

    #[test]
    fn inactive_pipeline_records_nothing() {
        let (device, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        pipeline.active = false;

        let mut list = device.create_command_list("frame").unwrap();
        {
            let mut rec = ctx.record(list.as_mut());
            pipeline.render(&mut rec, 0, 64, 32).unwrap();
        }
        assert!(RecordingDevice::commands(list.as_ref()).is_empty());
    }

    #[test]
    fn render_binds_every_global() {
        let (device, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        frame(&device, &mut ctx, &mut pipeline, 0);

        let slots: Vec<u32> = device
            .submitted_commands()
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::SetRootArgument { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect();
        for slot in [
            slots::FRAME_CONSTANTS,
            slots::OUTPUT,
            slots::MATERIALS,
            slots::ACCUMULATION,
        ] {
            assert!(slots.contains(&slot), "slot {slot} not bound");
        }
    }

    #[test]
    fn materials_grow_past_initial_capacity() {
        let (device, mut ctx, mut pipeline) = setup(RecordingDevice::native());
        frame(&device, &mut ctx, &mut pipeline, 0);
        for i in 0..INITIAL_MATERIAL_CAPACITY {
            pipeline.add_material(Material::diffuse(Vec3::splat(i as f32 / 16.0)));
        }
        frame(&device, &mut ctx, &mut pipeline, 1);

        let buffer = pipeline.material_buffer.as_ref().unwrap();
        let bytes = device.read_buffer(buffer).unwrap();
        assert!(bytes.len() >= pipeline.materials().len() * std::mem::size_of::<Material>());
        assert!(device.validation_messages().is_empty());
    }

    #[test]
    fn render_before_loading_fails() {
        let device = Arc::new(RecordingDevice::native());
        let mut ctx = RtContext::new(device.clone(), ContextConfig::default()).unwrap();
        let mut pipeline = RaytracingPipeline::new(PipelineConfig::default());

        let mut list = device.create_command_list("frame").unwrap();
        let mut rec = ctx.record(list.as_mut());
        assert!(matches!(
            pipeline.render(&mut rec, 0, 8, 8),
            Err(RtError::NotPrepared(_))
        ));
    }
}
