//! A headless device that records commands and validates them on submit.
//!
//! [`RecordingDevice`] never touches a GPU. It hands out deterministic virtual
//! addresses, keeps buffer contents in memory, and stores every submitted command
//! list. On [`RtDevice::submit`] each list is replayed through a validation layer
//! that tracks resource states the way a driver debug layer would:
//!
//! - a barrier whose `before` state differs from the tracked state;
//! - a descriptor table bound while no descriptor heap is set;
//! - native raytracing commands on a device without native support;
//! - an acceleration-structure build whose destination is not in the
//!   acceleration-structure state;
//! - root arguments that point at no live resource;
//! - dispatches with no kernel or pipeline set.
//!
//! Messages are logged with `warn!` and kept for inspection.
//!
//! # Example
//!
//! ```ignore
//! let device = Arc::new(RecordingDevice::builder().native_raytracing(false).build());
//! let mut ctx = RtContext::new(device.clone(), ContextConfig::default())?;
//! // ... record and submit ...
//! assert!(device.validation_messages().is_empty());
//! ```

use std::any::Any;
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::acceleration::{AccelerationLevel, BuildDesc, BuildInputs, PrebuildInfo};
use crate::device::{
    CommandList, DescriptorHeapDesc, DescriptorHeapInfo, DispatchRaysDesc, KernelDesc, KernelId,
    PipelineId, RootArgument, RtDevice, ShaderIdentifier, ViewDesc,
};
use crate::error::{Result, RtError};
use crate::resource::{
    CpuDescriptorHandle, GpuDescriptorHandle, GpuVirtualAddress, Resource, ResourceDesc,
    ResourceDimension, ResourceId, ResourceState, align_up,
};
use crate::shader::RtProgram;

/// First virtual address handed out.
pub const DEFAULT_ADDRESS_BASE: GpuVirtualAddress = 0x1_0000_0000;

/// Alignment of every buffer address.
pub const ADDRESS_ALIGNMENT: u64 = 256;

/// A command as recorded.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    SetDescriptorHeap {
        label: String,
        gpu_start: GpuDescriptorHandle,
        capacity: u32,
        increment: u32,
    },
    ResourceBarrier {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    UavBarrier {
        resource: Option<ResourceId>,
    },
    CopyResource {
        dest: ResourceId,
        source: ResourceId,
    },
    SetComputeKernel(KernelId),
    SetRootArgument {
        slot: u32,
        argument: RootArgument,
    },
    Dispatch {
        groups: [u32; 3],
    },
    SetRaytracingPipeline(PipelineId),
    BuildAccelerationStructure {
        level: AccelerationLevel,
        primitive_count: u32,
        dest: GpuVirtualAddress,
        scratch: GpuVirtualAddress,
    },
    DispatchRays {
        width: u32,
        height: u32,
        depth: u32,
    },
}

/// A problem found while validating a submitted list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationMessage {
    pub list: String,
    /// Position of the offending command in the list.
    pub command: usize,
    pub message: String,
}

/// A command list accepted by [`RtDevice::submit`].
#[derive(Clone, Debug)]
pub struct Submission {
    pub label: String,
    pub commands: Vec<RecordedCommand>,
}

/// Command list of a [`RecordingDevice`].
#[derive(Debug, Default)]
pub struct RecordingCommandList {
    label: String,
    commands: Vec<RecordedCommand>,
}

impl RecordingCommandList {
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }
}

impl CommandList for RecordingCommandList {
    fn label(&self) -> &str {
        &self.label
    }

    fn set_descriptor_heap(&mut self, heap: &DescriptorHeapInfo) {
        self.commands.push(RecordedCommand::SetDescriptorHeap {
            label: heap.label.clone(),
            gpu_start: heap.gpu_start,
            capacity: heap.capacity,
            increment: heap.increment,
        });
    }

    fn resource_barrier(&mut self, resource: &Resource, before: ResourceState, after: ResourceState) {
        self.commands.push(RecordedCommand::ResourceBarrier {
            resource: resource.id,
            before,
            after,
        });
    }

    fn uav_barrier(&mut self, resource: Option<&Resource>) {
        self.commands.push(RecordedCommand::UavBarrier {
            resource: resource.map(|r| r.id),
        });
    }

    fn copy_resource(&mut self, dest: &Resource, source: &Resource) {
        self.commands.push(RecordedCommand::CopyResource {
            dest: dest.id,
            source: source.id,
        });
    }

    fn set_compute_kernel(&mut self, kernel: KernelId) {
        self.commands.push(RecordedCommand::SetComputeKernel(kernel));
    }

    fn set_compute_root_argument(&mut self, slot: u32, argument: RootArgument) {
        self.commands
            .push(RecordedCommand::SetRootArgument { slot, argument });
    }

    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.commands.push(RecordedCommand::Dispatch {
            groups: [groups_x, groups_y, groups_z],
        });
    }

    fn set_raytracing_pipeline(&mut self, pipeline: PipelineId) {
        self.commands
            .push(RecordedCommand::SetRaytracingPipeline(pipeline));
    }

    fn build_acceleration_structure(&mut self, desc: &BuildDesc) {
        self.commands
            .push(RecordedCommand::BuildAccelerationStructure {
                level: desc.inputs.level(),
                primitive_count: desc.inputs.primitive_count(),
                dest: desc.dest,
                scratch: desc.scratch,
            });
    }

    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc) {
        self.commands.push(RecordedCommand::DispatchRays {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Builder for [`RecordingDevice`].
#[derive(Clone, Debug)]
pub struct RecordingDeviceBuilder {
    name: String,
    native_raytracing: bool,
    compute_fallback: bool,
    fail_kernel_compilation: bool,
    descriptor_increment: u32,
    address_base: GpuVirtualAddress,
}

impl Default for RecordingDeviceBuilder {
    fn default() -> Self {
        Self {
            name: "Recording Device".to_string(),
            native_raytracing: true,
            compute_fallback: true,
            fail_kernel_compilation: false,
            descriptor_increment: 32,
            address_base: DEFAULT_ADDRESS_BASE,
        }
    }
}

impl RecordingDeviceBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn native_raytracing(mut self, supported: bool) -> Self {
        self.native_raytracing = supported;
        self
    }

    pub fn compute_fallback(mut self, supported: bool) -> Self {
        self.compute_fallback = supported;
        self
    }

    /// Makes every kernel compilation fail.
    pub fn fail_kernel_compilation(mut self, fail: bool) -> Self {
        self.fail_kernel_compilation = fail;
        self
    }

    pub fn descriptor_increment(mut self, increment: u32) -> Self {
        self.descriptor_increment = increment;
        self
    }

    pub fn address_base(mut self, base: GpuVirtualAddress) -> Self {
        self.address_base = align_up(base, ADDRESS_ALIGNMENT);
        self
    }

    pub fn build(self) -> RecordingDevice {
        RecordingDevice {
            state: Mutex::new(DeviceState {
                next_id: 1,
                next_address: self.address_base,
                next_heap: 0,
                resources: HashMap::new(),
                views: HashMap::new(),
                kernels: Vec::new(),
                pipelines: Vec::new(),
                submissions: Vec::new(),
                messages: Vec::new(),
            }),
            config: self,
        }
    }
}

#[derive(Debug)]
struct TrackedResource {
    resource: Resource,
    state: ResourceState,
    data: Vec<u8>,
}

#[derive(Debug)]
struct DeviceState {
    next_id: u64,
    next_address: GpuVirtualAddress,
    next_heap: u64,
    resources: HashMap<ResourceId, TrackedResource>,
    views: HashMap<CpuDescriptorHandle, (ResourceId, ViewDesc)>,
    kernels: Vec<String>,
    pipelines: Vec<RtProgram>,
    submissions: Vec<Submission>,
    messages: Vec<ValidationMessage>,
}

impl DeviceState {
    /// Live buffer containing `address`.
    fn resource_at(&self, address: GpuVirtualAddress) -> Option<&TrackedResource> {
        self.resources.values().find(|tracked| {
            let start = tracked.resource.gpu_address;
            start != 0 && address >= start && address < start + tracked.resource.size().max(1)
        })
    }
}

/// In-memory device with a validation layer.
#[derive(Debug)]
pub struct RecordingDevice {
    config: RecordingDeviceBuilder,
    state: Mutex<DeviceState>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RecordingDevice {
    pub fn builder() -> RecordingDeviceBuilder {
        RecordingDeviceBuilder::default()
    }

    /// A device with native raytracing and compute support.
    pub fn native() -> Self {
        Self::builder().name("Recording Device (native)").build()
    }

    /// A device that can only run the compute fallback.
    pub fn emulated_only() -> Self {
        Self::builder()
            .name("Recording Device (compute)")
            .native_raytracing(false)
            .build()
    }

    /// Commands recorded so far on `list`, if it belongs to a recording device.
    pub fn commands(list: &dyn CommandList) -> Vec<RecordedCommand> {
        list.as_any()
            .downcast_ref::<RecordingCommandList>()
            .map(|list| list.commands.clone())
            .unwrap_or_default()
    }

    /// Current contents of a buffer.
    pub fn read_buffer(&self, resource: &Resource) -> Option<Vec<u8>> {
        self.state
            .lock()
            .resources
            .get(&resource.id)
            .map(|tracked| tracked.data.clone())
    }

    /// State of a resource after every submission so far.
    pub fn resource_state(&self, resource: &Resource) -> Option<ResourceState> {
        self.state
            .lock()
            .resources
            .get(&resource.id)
            .map(|tracked| tracked.state)
    }

    /// Whether `resource` has been created and not released.
    pub fn is_live(&self, resource: &Resource) -> bool {
        self.state.lock().resources.contains_key(&resource.id)
    }

    /// Resource and view written to a descriptor slot.
    pub fn view_at(&self, handle: CpuDescriptorHandle) -> Option<(ResourceId, ViewDesc)> {
        self.state.lock().views.get(&handle).copied()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// All submitted commands, in submission order.
    pub fn submitted_commands(&self) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .submissions
            .iter()
            .flat_map(|s| s.commands.iter().cloned())
            .collect()
    }

    pub fn validation_messages(&self) -> Vec<ValidationMessage> {
        self.state.lock().messages.clone()
    }

    /// Number of kernels compiled so far.
    pub fn kernel_count(&self) -> usize {
        self.state.lock().kernels.len()
    }

    fn validate(&self, state: &mut DeviceState, list: &RecordingCommandList) {
        let mut messages = Vec::new();
        let mut heap: Option<(GpuDescriptorHandle, u32, u32)> = None;
        let mut kernel_bound = false;
        let mut pipeline_bound = false;

        let mut report = |command: usize, message: String| {
            warn!(list = %list.label, command, "{message}");
            messages.push(ValidationMessage {
                list: list.label.clone(),
                command,
                message,
            });
        };

        for (index, command) in list.commands.iter().enumerate() {
            match command {
                RecordedCommand::SetDescriptorHeap {
                    gpu_start,
                    capacity,
                    increment,
                    ..
                } => heap = Some((*gpu_start, *capacity, *increment)),

                RecordedCommand::ResourceBarrier {
                    resource,
                    before,
                    after,
                } => match state.resources.get_mut(resource) {
                    Some(tracked) => {
                        if tracked.state != *before {
                            report(
                                index,
                                format!(
                                    "barrier on '{}' expects {:?} but the resource is in {:?}",
                                    tracked.resource.label(),
                                    before,
                                    tracked.state
                                ),
                            );
                        }
                        tracked.state = *after;
                    }
                    None => report(index, format!("barrier on released resource {resource}")),
                },

                RecordedCommand::UavBarrier { resource: Some(id) } => {
                    if !state.resources.contains_key(id) {
                        report(index, format!("UAV barrier on released resource {id}"));
                    }
                }
                RecordedCommand::UavBarrier { resource: None } => {}

                RecordedCommand::CopyResource { dest, source } => {
                    for (id, expected) in [
                        (dest, ResourceState::CopyDest),
                        (source, ResourceState::CopySource),
                    ] {
                        match state.resources.get(id) {
                            Some(tracked) if tracked.state != expected => report(
                                index,
                                format!(
                                    "copy uses '{}' in {:?}, expected {:?}",
                                    tracked.resource.label(),
                                    tracked.state,
                                    expected
                                ),
                            ),
                            Some(_) => {}
                            None => report(index, format!("copy uses released resource {id}")),
                        }
                    }
                }

                RecordedCommand::SetComputeKernel(_) => {
                    kernel_bound = true;
                    pipeline_bound = false;
                }

                RecordedCommand::SetRootArgument { slot, argument } => match argument {
                    RootArgument::DescriptorTable(handle) => match heap {
                        None => report(
                            index,
                            format!("descriptor table at slot {slot} with no descriptor heap bound"),
                        ),
                        Some((start, capacity, increment)) => {
                            let end = start.0 + capacity as u64 * increment as u64;
                            if handle.0 < start.0 || handle.0 >= end {
                                report(
                                    index,
                                    format!("descriptor table at slot {slot} is outside the bound heap"),
                                );
                            }
                        }
                    },
                    RootArgument::ConstantBuffer(address)
                    | RootArgument::ShaderResource(address)
                    | RootArgument::AccelerationStructure(address) => {
                        if state.resource_at(*address).is_none() {
                            report(
                                index,
                                format!("root argument at slot {slot} points at no live resource ({address:#x})"),
                            );
                        }
                    }
                    RootArgument::UnorderedAccess(address) => match state.resource_at(*address) {
                        None => report(
                            index,
                            format!("root argument at slot {slot} points at no live resource ({address:#x})"),
                        ),
                        Some(tracked) if !tracked.resource.desc.allow_unordered_access => report(
                            index,
                            format!(
                                "'{}' bound for unordered access without allowing it",
                                tracked.resource.label()
                            ),
                        ),
                        Some(_) => {}
                    },
                    RootArgument::Constants(_) => {}
                },

                RecordedCommand::Dispatch { .. } => {
                    if !kernel_bound {
                        report(index, "dispatch with no compute kernel set".to_string());
                    }
                }

                RecordedCommand::SetRaytracingPipeline(_) => {
                    if !self.config.native_raytracing {
                        report(
                            index,
                            "raytracing pipeline set on a device without native raytracing"
                                .to_string(),
                        );
                    }
                    pipeline_bound = true;
                    kernel_bound = false;
                }

                RecordedCommand::BuildAccelerationStructure { dest, .. } => {
                    if !self.config.native_raytracing {
                        report(
                            index,
                            "native acceleration-structure build on a device without native raytracing"
                                .to_string(),
                        );
                    }
                    match state.resource_at(*dest) {
                        Some(tracked)
                            if tracked.state != ResourceState::RaytracingAccelerationStructure =>
                        {
                            report(
                                index,
                                format!(
                                    "build destination '{}' is in {:?}, not the acceleration-structure state",
                                    tracked.resource.label(),
                                    tracked.state
                                ),
                            )
                        }
                        Some(_) => {}
                        None => report(
                            index,
                            format!("build destination {dest:#x} is not a live resource"),
                        ),
                    }
                }

                RecordedCommand::DispatchRays { .. } => {
                    if !self.config.native_raytracing {
                        report(
                            index,
                            "ray dispatch on a device without native raytracing".to_string(),
                        );
                    }
                    if !pipeline_bound {
                        report(index, "ray dispatch with no raytracing pipeline set".to_string());
                    }
                }
            }
        }

        state.messages.extend(messages);
    }
}

impl RtDevice for RecordingDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_native_raytracing(&self) -> bool {
        self.config.native_raytracing
    }

    fn supports_compute_fallback(&self) -> bool {
        self.config.compute_fallback
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<Resource> {
        let mut state = self.state.lock();
        let id = ResourceId(state.next_id);
        state.next_id += 1;

        let (gpu_address, data) = match desc.dimension {
            ResourceDimension::Buffer { size } => {
                let address = state.next_address;
                state.next_address += align_up(size.max(1), ADDRESS_ALIGNMENT);
                (address, vec![0; size as usize])
            }
            ResourceDimension::Texture2d { .. } => (0, Vec::new()),
        };

        let resource = Resource {
            id,
            gpu_address,
            desc: desc.clone(),
        };
        state.resources.insert(
            id,
            TrackedResource {
                resource: resource.clone(),
                state: desc.initial_state,
                data,
            },
        );
        debug!(%id, label = %desc.label, address = gpu_address, "created resource");
        Ok(resource)
    }

    fn write_buffer(&self, resource: &Resource, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let tracked = state
            .resources
            .get_mut(&resource.id)
            .ok_or_else(|| RtError::device(format!("write to released resource {}", resource.id)))?;

        let start = offset as usize;
        let end = start + data.len();
        if end > tracked.data.len() {
            return Err(RtError::device(format!(
                "write of {} bytes at {} overruns '{}' ({} bytes)",
                data.len(),
                offset,
                resource.label(),
                tracked.data.len()
            )));
        }
        tracked.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn release(&self, resource: &Resource) {
        self.state.lock().resources.remove(&resource.id);
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo> {
        let mut state = self.state.lock();
        let heap = state.next_heap;
        state.next_heap += 1;

        Ok(DescriptorHeapInfo {
            label: desc.label.clone(),
            capacity: desc.capacity,
            increment: self.config.descriptor_increment,
            cpu_start: CpuDescriptorHandle(0x10_0000_0000 * (heap + 1)),
            gpu_start: GpuDescriptorHandle(0x7F00_0000_0000 + 0x10_0000_0000 * heap),
        })
    }

    fn create_view(&self, resource: &Resource, view: &ViewDesc, dest: CpuDescriptorHandle) {
        self.state.lock().views.insert(dest, (resource.id, *view));
    }

    fn create_compute_kernel(&self, desc: &KernelDesc<'_>) -> Result<KernelId> {
        if self.config.fail_kernel_compilation {
            return Err(RtError::device(format!(
                "kernel '{}' failed to compile",
                desc.label
            )));
        }
        if !desc.source.contains(&format!("fn {}(", desc.entry_point)) {
            return Err(RtError::device(format!(
                "kernel '{}' has no entry point '{}'",
                desc.label, desc.entry_point
            )));
        }

        let mut state = self.state.lock();
        state.kernels.push(desc.label.to_string());
        Ok(KernelId(state.kernels.len() as u32 - 1))
    }

    fn create_raytracing_pipeline(&self, program: &RtProgram) -> Result<PipelineId> {
        if !self.config.native_raytracing {
            return Err(RtError::device("device has no native raytracing"));
        }
        let mut state = self.state.lock();
        state.pipelines.push(program.clone());
        Ok(PipelineId(state.pipelines.len() as u32 - 1))
    }

    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ShaderIdentifier> {
        let state = self.state.lock();
        let program = state.pipelines.get(pipeline.0 as usize)?;
        program
            .export_index(export)
            .map(ShaderIdentifier::from_export_index)
    }

    fn acceleration_structure_prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo> {
        if !self.config.native_raytracing {
            return Err(RtError::device("device has no native raytracing"));
        }
        let primitives = inputs.primitive_count() as u64;
        Ok(PrebuildInfo {
            result_size: align_up(128 + 64 * primitives, 256),
            scratch_size: align_up(64 + 32 * primitives, 256),
        })
    }

    fn create_command_list(&self, label: &str) -> Result<Box<dyn CommandList>> {
        Ok(Box::new(RecordingCommandList {
            label: label.to_string(),
            commands: Vec::new(),
        }))
    }

    fn submit(&self, list: Box<dyn CommandList>) -> Result<()> {
        let list = list
            .into_any()
            .downcast::<RecordingCommandList>()
            .map_err(|_| RtError::device("command list was not created by this device"))?;

        let mut state = self.state.lock();
        self.validate(&mut state, &list);
        debug!(list = %list.label, commands = list.commands.len(), "submitted");
        state.submissions.push(Submission {
            label: list.label,
            commands: list.commands,
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(device: &RecordingDevice, record: impl FnOnce(&mut dyn CommandList)) {
        let mut list = device.create_command_list("test").unwrap();
        record(list.as_mut());
        device.submit(list).unwrap();
    }

    #[test]
    fn addresses_are_aligned_and_distinct() {
        let device = RecordingDevice::default();
        let a = device.create_resource(&ResourceDesc::buffer("a", 10)).unwrap();
        let b = device.create_resource(&ResourceDesc::buffer("b", 300)).unwrap();
        let c = device.create_resource(&ResourceDesc::buffer("c", 1)).unwrap();

        assert_eq!(a.gpu_address, DEFAULT_ADDRESS_BASE);
        assert_eq!(b.gpu_address, DEFAULT_ADDRESS_BASE + 256);
        assert_eq!(c.gpu_address, DEFAULT_ADDRESS_BASE + 256 + 512);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn buffer_contents_round_trip() {
        let device = RecordingDevice::default();
        let buffer = device.create_resource(&ResourceDesc::upload_buffer("u", 8)).unwrap();
        device.write_buffer(&buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.read_buffer(&buffer).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(device.write_buffer(&buffer, 6, &[0; 4]).is_err());
    }

    #[test]
    fn barrier_from_wrong_state_is_reported() {
        let device = RecordingDevice::default();
        let texture = device
            .create_resource(&ResourceDesc::texture_2d("out", 4, 4, crate::resource::Format::R8G8B8A8Unorm))
            .unwrap();

        submit(&device, |list| {
            list.resource_barrier(&texture, ResourceState::Common, ResourceState::UnorderedAccess);
            list.resource_barrier(
                &texture,
                ResourceState::Common,
                ResourceState::NonPixelShaderResource,
            );
        });

        let messages = device.validation_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command, 1);
        assert!(messages[0].message.contains("UnorderedAccess"));
        assert_eq!(
            device.resource_state(&texture),
            Some(ResourceState::NonPixelShaderResource)
        );
    }

    #[test]
    fn descriptor_table_without_heap_is_reported() {
        let device = RecordingDevice::default();
        submit(&device, |list| {
            list.set_compute_kernel(KernelId(0));
            list.set_compute_root_argument(4, RootArgument::DescriptorTable(GpuDescriptorHandle(0)));
        });
        let messages = device.validation_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].message.contains("no descriptor heap bound"));
    }

    #[test]
    fn native_commands_need_native_support() {
        let device = RecordingDevice::emulated_only();
        submit(&device, |list| {
            list.set_raytracing_pipeline(PipelineId(0));
            list.dispatch_rays(&DispatchRaysDesc {
                ray_generation: Default::default(),
                miss: Default::default(),
                hit_group: Default::default(),
                width: 1,
                height: 1,
                depth: 1,
            });
        });
        assert_eq!(device.validation_messages().len(), 2);
    }

    #[test]
    fn foreign_lists_are_rejected() {
        struct Foreign;
        impl CommandList for Foreign {
            fn label(&self) -> &str {
                "foreign"
            }
            fn set_descriptor_heap(&mut self, _: &DescriptorHeapInfo) {}
            fn resource_barrier(&mut self, _: &Resource, _: ResourceState, _: ResourceState) {}
            fn uav_barrier(&mut self, _: Option<&Resource>) {}
            fn copy_resource(&mut self, _: &Resource, _: &Resource) {}
            fn set_compute_kernel(&mut self, _: KernelId) {}
            fn set_compute_root_argument(&mut self, _: u32, _: RootArgument) {}
            fn dispatch(&mut self, _: u32, _: u32, _: u32) {}
            fn set_raytracing_pipeline(&mut self, _: PipelineId) {}
            fn build_acceleration_structure(&mut self, _: &BuildDesc) {}
            fn dispatch_rays(&mut self, _: &DispatchRaysDesc) {}
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn into_any(self: Box<Self>) -> Box<dyn Any> {
                self
            }
        }

        let device = RecordingDevice::default();
        assert!(device.submit(Box::new(Foreign)).is_err());
    }
}
