//! The raytracing context: one API over hardware and emulated raytracing.
//!
//! An [`RtContext`] owns the three pieces of state every raytracing workload
//! shares:
//!
//! - the shader-visible descriptor heap ([`DescriptorAllocator`]);
//! - the capability layer chosen at construction ([`CapabilityLayer`]), which on
//!   the emulated path also owns the wrapped-pointer indirection table;
//! - a handle to the device.
//!
//! GPU work is recorded through a [`Recording`], a short-lived scope that pairs
//! the context with the command list of the current frame:
//!
//! ```text
//!   RtContext::new ──▶ probe (mode fixed) ──▶ heap created ──▶ ready
//!                                                              │
//!          ┌───────────────────────────────────────────────────┘
//!          ▼
//!   ctx.record(list) ──▶ bind heap, transitions, builds, raytrace ──▶ submit
//!          ▲                                                          │
//!          └──────────────────────── next frame ──────────────────────┘
//! ```
//!
//! The context keeps no per-resource state and never waits on the GPU. Callers
//! supply the current and target state of every transition and synchronize with
//! the device before destroying anything a submitted list still references.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = RtContext::new(device.clone(), ContextConfig::from_env())?;
//! let (cpu, index) = ctx.allocate_descriptor(None)?;
//! device.create_view(&vertices, &ViewDesc::structured_buffer(24, 32), cpu);
//! let pointer = ctx.create_wrapped_pointer(&vertices, 24)?;
//!
//! let mut list = device.create_command_list("frame")?;
//! {
//!     let mut rec = ctx.record(list.as_mut());
//!     rec.bind_descriptor_heap();
//!     rec.raytrace(&bindings, &state, 1280, 720)?;
//!     rec.transition_resource(&output, ResourceState::UnorderedAccess, ResourceState::NonPixelShaderResource);
//! }
//! device.submit(list)?;
//! ```

use std::sync::Arc;

use tracing::{info, trace};

use crate::acceleration::{AccelerationStructure, BuildDesc, BuildInputs, PrebuildInfo};
use crate::bindings::RtBindings;
use crate::capability::{CapabilityLayer, CapabilityMode, RaytracingLayer};
use crate::config::ContextConfig;
use crate::descriptor::DescriptorAllocator;
use crate::device::{CommandList, DescriptorHeapInfo, RootArgument, RtDevice, ViewDesc, root_slots};
use crate::error::{Result, RtError};
use crate::resource::{CpuDescriptorHandle, GpuDescriptorHandle, Resource, ResourceState};
use crate::shader::RtProgram;
use crate::state::RtState;
use crate::wrapped_pointer::{IndirectionTable, ResolvedPointer, WrappedPointer};

/// Constants bound at [`root_slots::DISPATCH_CONSTANTS`] for every ray dispatch.
///
/// Offsets are in bytes from the start of the shader table buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DispatchConstants {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Indirection slot of the top level; zero on the hardware path.
    pub top_level_slot: u32,
    pub ray_generation_offset: u32,
    pub miss_offset: u32,
    pub miss_stride: u32,
    pub hit_group_offset: u32,
    pub hit_group_stride: u32,
    pub miss_count: u32,
    pub hit_group_count: u32,
    pub max_recursion_depth: u32,
}

/// Shared descriptor heap, capability layer, and device handle.
pub struct RtContext {
    device: Arc<dyn RtDevice>,
    config: ContextConfig,
    descriptors: DescriptorAllocator,
    layer: CapabilityLayer,
}

impl RtContext {
    /// Probes the device, selects the capability path, and creates the heap.
    ///
    /// # Errors
    ///
    /// [`RtError::CapabilityUnavailable`] if neither path is available, or a device
    /// error if the heap or the indirection table cannot be created.
    #[tracing::instrument(skip_all, fields(label = %config.label))]
    pub fn new(device: Arc<dyn RtDevice>, config: ContextConfig) -> Result<Self> {
        let layer = CapabilityLayer::probe(device.clone(), &config)?;
        let descriptors = DescriptorAllocator::new(
            device.as_ref(),
            &format!("{} Descriptors", config.label),
            config.descriptor_capacity,
        )?;

        info!(
            device = device.name(),
            mode = %layer.mode(),
            descriptors = config.descriptor_capacity,
            increment = descriptors.heap().increment,
            "raytracing context ready"
        );

        Ok(Self {
            device,
            config,
            descriptors,
            layer,
        })
    }

    pub fn mode(&self) -> CapabilityMode {
        self.layer.mode()
    }

    pub fn device(&self) -> &Arc<dyn RtDevice> {
        &self.device
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn descriptor_heap(&self) -> &DescriptorHeapInfo {
        self.descriptors.heap()
    }

    /// Descriptor slots handed out so far.
    pub fn allocated_descriptors(&self) -> u32 {
        self.descriptors.allocated()
    }

    /// Reserves a descriptor slot, or returns `explicit` if it is already owned.
    ///
    /// See [`DescriptorAllocator::allocate`].
    pub fn allocate_descriptor(
        &mut self,
        explicit: Option<u32>,
    ) -> Result<(CpuDescriptorHandle, u32)> {
        self.descriptors.allocate(explicit)
    }

    pub fn descriptor_cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        self.descriptors.cpu_handle(index)
    }

    /// GPU handle of slot `index`; a pure function of the index.
    pub fn descriptor_gpu_handle(&self, index: u32) -> GpuDescriptorHandle {
        self.descriptors.gpu_handle(index)
    }

    /// Allocates a slot (or reuses `explicit`) and writes a view of `resource` there.
    pub fn register_view(
        &mut self,
        resource: &Resource,
        view: &ViewDesc,
        explicit: Option<u32>,
    ) -> Result<u32> {
        let (cpu, index) = self.allocate_descriptor(explicit)?;
        self.device.create_view(resource, view, cpu);
        Ok(index)
    }

    /// A shader-visible reference to `resource`, holding `element_count` elements.
    ///
    /// On the hardware path this is the resource's address. On the emulated path it
    /// is an indirection slot; wrapping the same resource again updates its slot.
    pub fn create_wrapped_pointer(
        &mut self,
        resource: &Resource,
        element_count: u32,
    ) -> Result<WrappedPointer> {
        self.layer.wrap_pointer(resource, element_count, false)
    }

    /// Like [`RtContext::create_wrapped_pointer`], but never reuses an existing slot.
    pub fn wrap_in_new_slot(
        &mut self,
        resource: &Resource,
        element_count: u32,
    ) -> Result<WrappedPointer> {
        self.layer.wrap_pointer(resource, element_count, true)
    }

    /// A shader-visible reference to an acceleration structure holding
    /// `triangle_count` triangles.
    ///
    /// Passing the pointer of the structure being replaced keeps its indirection
    /// slot on the emulated path, so rebuilds do not consume table capacity.
    pub fn wrap_acceleration_structure(
        &mut self,
        structure: &AccelerationStructure,
        triangle_count: u32,
        previous: Option<WrappedPointer>,
    ) -> Result<WrappedPointer> {
        self.layer
            .wrap_acceleration_structure(&structure.result, triangle_count, previous)
    }

    pub fn resolve_wrapped_pointer(&self, pointer: WrappedPointer) -> Result<ResolvedPointer> {
        self.layer.resolve_pointer(pointer)
    }

    /// The indirection table, on the emulated path.
    pub fn indirection_table(&self) -> Option<&IndirectionTable> {
        self.layer.as_fallback().map(|layer| layer.indirection_table())
    }

    /// Result and scratch sizes for building `inputs` on this context's path.
    pub fn prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo> {
        self.layer.prebuild_info(inputs)
    }

    /// State acceleration-structure results must be created in.
    pub fn acceleration_structure_state(&self) -> ResourceState {
        self.layer.acceleration_structure_state()
    }

    /// Compiles `program` for this context. See [`RtState::create`].
    pub fn create_state_object(&self, program: &RtProgram) -> Result<RtState> {
        self.layer.create_state_object(program)
    }

    /// Starts recording onto `list`.
    ///
    /// The returned scope borrows the context mutably, so allocations made through
    /// [`Recording::context_mut`] are serialized with the recording.
    pub fn record<'a>(&'a mut self, list: &'a mut dyn CommandList) -> Recording<'a> {
        Recording { ctx: self, list }
    }
}

impl std::fmt::Debug for RtContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtContext")
            .field("device", &self.device.name())
            .field("config", &self.config)
            .field("descriptors", &self.descriptors)
            .field("layer", &self.layer)
            .finish()
    }
}

/// A context bound to the command list of the current recording.
pub struct Recording<'a> {
    ctx: &'a mut RtContext,
    list: &'a mut dyn CommandList,
}

impl<'a> Recording<'a> {
    pub fn context(&self) -> &RtContext {
        &*self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RtContext {
        &mut *self.ctx
    }

    /// The underlying command list, for work the context does not wrap.
    pub fn list(&mut self) -> &mut dyn CommandList {
        &mut *self.list
    }

    /// Makes the shared heap active for descriptor tables recorded afterwards.
    pub fn bind_descriptor_heap(&mut self) {
        trace!(heap = %self.ctx.descriptors.heap().label, "bind descriptor heap");
        self.list.set_descriptor_heap(self.ctx.descriptors.heap());
    }

    /// Records a transition of `resource` from `before` to `after`.
    ///
    /// Nothing is recorded when the states are equal. `before` is trusted: a wrong
    /// value is a caller bug only a validation layer reports.
    pub fn transition_resource(
        &mut self,
        resource: &Resource,
        before: ResourceState,
        after: ResourceState,
    ) {
        if before == after {
            return;
        }
        trace!(resource = resource.label(), ?before, ?after, "transition");
        self.list.resource_barrier(resource, before, after);
    }

    pub fn uav_barrier(&mut self, resource: Option<&Resource>) {
        self.list.uav_barrier(resource);
    }

    pub fn copy_resource(&mut self, dest: &Resource, source: &Resource) {
        self.list.copy_resource(dest, source);
    }

    /// Records an acceleration-structure build on the context's path.
    #[tracing::instrument(skip_all, fields(level = ?desc.inputs.level(), primitives = desc.inputs.primitive_count()))]
    pub fn build_acceleration_structure(&mut self, desc: &BuildDesc) -> Result<()> {
        self.ctx.layer.build_acceleration_structure(self.list, desc)
    }

    /// Records a ray dispatch over `width x height` using `bindings` and `state`.
    ///
    /// On both paths the output written by the program is left in the
    /// unordered-access state with all writes complete for later commands.
    ///
    /// # Errors
    ///
    /// [`RtError::NotPrepared`] if `bindings` were not applied or have no top level,
    /// [`RtError::ModeMismatch`] if `state` belongs to the other path.
    #[tracing::instrument(skip(self, bindings, state))]
    pub fn raytrace(
        &mut self,
        bindings: &RtBindings,
        state: &RtState,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let table = bindings.shader_table()?;
        let top_level = bindings
            .top_level()
            .ok_or(RtError::NotPrepared("top-level acceleration structure"))?;
        let layer = &self.ctx.layer;

        let base = table.ray_generation.start;
        let constants = DispatchConstants {
            width,
            height,
            depth: 1,
            top_level_slot: top_level.table_slot().unwrap_or(0),
            ray_generation_offset: 0,
            miss_offset: (table.miss.start - base) as u32,
            miss_stride: table.miss.stride as u32,
            hit_group_offset: (table.hit_group.start - base) as u32,
            hit_group_stride: table.hit_group.stride as u32,
            miss_count: bindings.miss_count(),
            hit_group_count: bindings.hit_group_count(),
            max_recursion_depth: state.max_recursion_depth(),
        };

        layer.set_state(self.list, state)?;
        self.list.set_compute_root_argument(
            root_slots::DISPATCH_CONSTANTS,
            RootArgument::Constants(bytemuck::cast_slice(&[constants]).to_vec()),
        );
        self.list.set_compute_root_argument(
            root_slots::SHADER_TABLE,
            RootArgument::ShaderResource(base),
        );
        layer.bind_top_level(self.list, top_level)?;
        for (slot, argument) in bindings.globals() {
            self.list.set_compute_root_argument(slot, argument.clone());
        }

        layer.dispatch_rays(self.list, &table.dispatch_desc(width, height, 1))
    }
}
