//! A [`RtDevice`] on top of wgpu.
//!
//! [`WgpuDevice`] runs the context on a real adapter. The device-level model
//! the context expects (virtual addresses, descriptor heaps, root slots) does not
//! exist in wgpu, so this backend emulates it on the host:
//!
//! - every buffer gets a synthetic virtual address; root arguments and build
//!   inputs are resolved back to `(buffer, offset)` when commands execute;
//! - descriptor heaps are host-side slot tables of views;
//! - root slot `n` is `@group(0) @binding(n)`. A bind group is assembled per
//!   dispatch from the arguments bound at the kernel's declared bindings;
//! - barriers are dropped, wgpu tracks resource usage itself.
//!
//! Command lists are recorded on the host and encoded on [`RtDevice::submit`].
//!
//! Hardware raytracing is reported when the adapter exposes ray queries with
//! vertex return. Native programs are then compiled into ray-query compute
//! kernels, and acceleration structures become wgpu BLAS and TLAS objects.
//!
//! # Example
//!
//! ```ignore
//! let device = Arc::new(WgpuDevice::new()?);
//! let mut ctx = RtContext::new(device.clone(), ContextConfig::from_env())?;
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::mpsc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use wgpu::util::DeviceExt;

use crate::acceleration::{BuildDesc, BuildInputs, InstanceDesc, PrebuildInfo, TriangleGeometry};
use crate::capability::fallback::COMMON_PRELUDE;
use crate::capability::native::{NATIVE_ENTRY_POINT, NATIVE_PRELUDE, pack_instance_custom_data};
use crate::device::{
    CommandList, DescriptorHeapDesc, DescriptorHeapInfo, DispatchRaysDesc, KernelDesc, KernelId,
    PipelineId, RootArgument, RtDevice, ShaderIdentifier, ViewDesc,
};
use crate::error::{Result, RtError};
use crate::resource::{
    CpuDescriptorHandle, Format, GpuDescriptorHandle, GpuVirtualAddress, Resource, ResourceDesc,
    ResourceDimension, ResourceId, ResourceState, align_up,
};
use crate::shader::RtProgram;

/// Size reported for one descriptor slot.
pub const DESCRIPTOR_INCREMENT: u32 = 32;

const ADDRESS_BASE: GpuVirtualAddress = 0x1_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;
const HEAP_STRIDE: u64 = 0x10_0000_0000;
const GPU_HEAP_BASE: u64 = 0x7F00_0000_0000;

/// Workgroup edge of generated raytracing kernels.
const RAY_TILE: u32 = 8;

fn ray_query_features() -> wgpu::Features {
    wgpu::Features::EXPERIMENTAL_RAY_QUERY | wgpu::Features::EXPERIMENTAL_RAY_HIT_VERTEX_RETURN
}

fn acceleration_flags() -> wgpu::AccelerationStructureFlags {
    wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE
        | wgpu::AccelerationStructureFlags::ALLOW_RAY_HIT_VERTEX_RETURN
}

/// Options for [`WgpuDevice`] creation.
#[derive(Clone, Debug)]
pub struct WgpuDeviceBuilder {
    label: String,
    power_preference: wgpu::PowerPreference,
    force_fallback_adapter: bool,
    allow_native: bool,
}

impl Default for WgpuDeviceBuilder {
    fn default() -> Self {
        Self {
            label: "Raytracing Device".to_string(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            allow_native: true,
        }
    }
}

impl WgpuDeviceBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }

    /// Selects a software adapter when one is available.
    pub fn force_fallback_adapter(mut self, force: bool) -> Self {
        self.force_fallback_adapter = force;
        self
    }

    /// When false, ray-query features are never requested and the device
    /// reports no native raytracing.
    pub fn allow_native(mut self, allow: bool) -> Self {
        self.allow_native = allow;
        self
    }

    /// Requests an adapter and a device.
    ///
    /// # Errors
    ///
    /// [`RtError::CapabilityUnavailable`] when no adapter is found, or a device
    /// error when the device request fails.
    pub fn build(self) -> Result<WgpuDevice> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: self.power_preference,
            compatible_surface: None,
            force_fallback_adapter: self.force_fallback_adapter,
        }))
        .map_err(|err| RtError::CapabilityUnavailable {
            device: "wgpu".to_string(),
            reason: format!("no suitable adapter: {err}"),
        })?;

        let adapter_info = adapter.get_info();
        let native = self.allow_native && adapter.features().contains(ray_query_features());
        let compute = adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);

        let (required_features, required_limits, experimental_features) = if native {
            (
                ray_query_features(),
                wgpu::Limits::default().using_minimum_supported_acceleration_structure_values(),
                // SAFETY: only ray-query features are requested, and shaders using
                // them are generated by this crate.
                unsafe { wgpu::ExperimentalFeatures::enabled() },
            )
        } else {
            (
                wgpu::Features::empty(),
                wgpu::Limits::default(),
                wgpu::ExperimentalFeatures::default(),
            )
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some(&self.label),
            required_features,
            required_limits,
            experimental_features,
            memory_hints: wgpu::MemoryHints::Performance,
            trace: Default::default(),
        }))
        .map_err(|err| RtError::device(format!("device request failed: {err}")))?;

        let name = format!("{} ({:?})", adapter_info.name, adapter_info.backend);
        info!(device = %name, native, compute, "wgpu device ready");

        Ok(WgpuDevice {
            name,
            native,
            compute,
            device,
            queue,
            state: Mutex::new(GpuState {
                next_resource: 0,
                next_address: ADDRESS_BASE,
                resources: HashMap::new(),
                ranges: BTreeMap::new(),
                heaps: Vec::new(),
                kernels: Vec::new(),
                pipelines: Vec::new(),
            }),
        })
    }
}

/// Native acceleration structure objects.
enum NativeStructure {
    Bottom(wgpu::Blas),
    Top(wgpu::Tlas),
}

enum Backing {
    Buffer(wgpu::Buffer),
    Texture(wgpu::Texture),
    /// Destination of native builds. The wgpu object appears at the first build.
    Acceleration(Option<NativeStructure>),
}

struct GpuResource {
    desc: ResourceDesc,
    address: GpuVirtualAddress,
    backing: Backing,
}

impl GpuResource {
    fn size(&self) -> u64 {
        match self.desc.dimension {
            ResourceDimension::Buffer { size } => size,
            ResourceDimension::Texture2d { .. } => 0,
        }
    }
}

struct Kernel {
    label: String,
    pipeline: wgpu::ComputePipeline,
    /// `@binding` indices of group 0 declared by the source.
    bindings: Vec<u32>,
}

struct NativePipeline {
    kernel: Kernel,
    exports: Vec<String>,
}

struct GpuState {
    next_resource: u64,
    next_address: GpuVirtualAddress,
    resources: HashMap<ResourceId, GpuResource>,
    /// Start address of every live buffer.
    ranges: BTreeMap<GpuVirtualAddress, ResourceId>,
    heaps: Vec<Vec<Option<(ResourceId, ViewDesc)>>>,
    kernels: Vec<Kernel>,
    pipelines: Vec<NativePipeline>,
}

impl GpuState {
    /// Live resource containing `address`, and the offset into it.
    fn resource_at(&self, address: GpuVirtualAddress) -> Result<(&GpuResource, u64)> {
        let (start, id) = self
            .ranges
            .range(..=address)
            .next_back()
            .ok_or_else(|| unmapped(address))?;
        let resource = self.resources.get(id).ok_or_else(|| unmapped(address))?;
        if address >= start + resource.size().max(1) {
            return Err(unmapped(address));
        }
        Ok((resource, address - start))
    }

    fn buffer_at(&self, address: GpuVirtualAddress) -> Result<(&wgpu::Buffer, u64)> {
        match self.resource_at(address)? {
            (
                GpuResource {
                    backing: Backing::Buffer(buffer),
                    ..
                },
                offset,
            ) => Ok((buffer, offset)),
            (resource, _) => Err(RtError::device(format!(
                "'{}' is not a buffer",
                resource.desc.label
            ))),
        }
    }

    fn structure_at(&self, address: GpuVirtualAddress) -> Result<&NativeStructure> {
        let (resource, _) = self.resource_at(address)?;
        match &resource.backing {
            Backing::Acceleration(Some(structure)) => Ok(structure),
            _ => Err(RtError::device(format!(
                "'{}' holds no built acceleration structure",
                resource.desc.label
            ))),
        }
    }

    fn view(&self, heap: usize, handle: GpuDescriptorHandle) -> Result<(ResourceId, ViewDesc)> {
        let base = GPU_HEAP_BASE + HEAP_STRIDE * heap as u64;
        let slot = handle.0.checked_sub(base).map(|offset| offset / DESCRIPTOR_INCREMENT as u64);
        slot.and_then(|slot| self.heaps.get(heap)?.get(slot as usize).copied().flatten())
            .ok_or_else(|| RtError::device(format!("no view at descriptor {:#x}", handle.0)))
    }
}

fn unmapped(address: GpuVirtualAddress) -> RtError {
    RtError::device(format!("address {address:#x} is not inside a live buffer"))
}

fn texture_format(format: Format) -> Result<wgpu::TextureFormat> {
    match format {
        Format::R8G8B8A8Unorm => Ok(wgpu::TextureFormat::Rgba8Unorm),
        Format::R16G16B16A16Float => Ok(wgpu::TextureFormat::Rgba16Float),
        Format::R32G32B32A32Float => Ok(wgpu::TextureFormat::Rgba32Float),
        Format::R32Uint => Ok(wgpu::TextureFormat::R32Uint),
        other => Err(RtError::device(format!("{other:?} is not a texture format"))),
    }
}

fn vertex_format(format: Format) -> Result<wgpu::VertexFormat> {
    match format {
        Format::R32G32B32Float => Ok(wgpu::VertexFormat::Float32x3),
        Format::R32G32B32A32Float => Ok(wgpu::VertexFormat::Float32x4),
        other => Err(RtError::device(format!("{other:?} is not a vertex position format"))),
    }
}

fn index_format(format: Format) -> Result<wgpu::IndexFormat> {
    match format {
        Format::R32Uint => Ok(wgpu::IndexFormat::Uint32),
        Format::R16Uint => Ok(wgpu::IndexFormat::Uint16),
        other => Err(RtError::device(format!("{other:?} is not an index format"))),
    }
}

/// Binding indices of group 0 declared in `source`.
fn declared_bindings(source: &str) -> Vec<u32> {
    let mut bindings: Vec<u32> = source
        .match_indices("@binding(")
        .filter_map(|(at, pattern)| {
            source[at + pattern.len()..]
                .split(')')
                .next()?
                .trim()
                .parse()
                .ok()
        })
        .collect();
    bindings.sort_unstable();
    bindings.dedup();
    bindings
}

/// A resource bound for one dispatch.
enum BoundResource<'a> {
    /// Root constants, uploaded into a buffer of their own.
    Constants(wgpu::Buffer),
    Buffer { buffer: &'a wgpu::Buffer, offset: u64 },
    View(wgpu::TextureView),
    Structure(&'a wgpu::Tlas),
}

impl BoundResource<'_> {
    fn resource(&self) -> wgpu::BindingResource<'_> {
        match self {
            BoundResource::Constants(buffer) => buffer.as_entire_binding(),
            BoundResource::Buffer { buffer, offset } => {
                wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: *offset,
                    size: None,
                })
            }
            BoundResource::View(view) => wgpu::BindingResource::TextureView(view),
            BoundResource::Structure(tlas) => wgpu::BindingResource::AccelerationStructure(tlas),
        }
    }
}

#[derive(Clone, Debug)]
enum GpuCommand {
    SetDescriptorHeap(GpuDescriptorHandle),
    CopyResource { dest: ResourceId, source: ResourceId },
    SetComputeKernel(KernelId),
    SetRootArgument { slot: u32, argument: RootArgument },
    Dispatch([u32; 3]),
    SetRaytracingPipeline(PipelineId),
    Build(BuildDesc),
    DispatchRays(DispatchRaysDesc),
}

/// Command list of a [`WgpuDevice`], encoded on submit.
#[derive(Debug, Default)]
pub struct WgpuCommandList {
    label: String,
    commands: Vec<GpuCommand>,
}

impl CommandList for WgpuCommandList {
    fn label(&self) -> &str {
        &self.label
    }

    fn set_descriptor_heap(&mut self, heap: &DescriptorHeapInfo) {
        self.commands.push(GpuCommand::SetDescriptorHeap(heap.gpu_start));
    }

    fn resource_barrier(&mut self, resource: &Resource, before: ResourceState, after: ResourceState) {
        trace!(resource = resource.label(), ?before, ?after, "barrier (implicit)");
    }

    fn uav_barrier(&mut self, _resource: Option<&Resource>) {}

    fn copy_resource(&mut self, dest: &Resource, source: &Resource) {
        self.commands.push(GpuCommand::CopyResource {
            dest: dest.id,
            source: source.id,
        });
    }

    fn set_compute_kernel(&mut self, kernel: KernelId) {
        self.commands.push(GpuCommand::SetComputeKernel(kernel));
    }

    fn set_compute_root_argument(&mut self, slot: u32, argument: RootArgument) {
        self.commands
            .push(GpuCommand::SetRootArgument { slot, argument });
    }

    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.commands
            .push(GpuCommand::Dispatch([groups_x, groups_y, groups_z]));
    }

    fn set_raytracing_pipeline(&mut self, pipeline: PipelineId) {
        self.commands
            .push(GpuCommand::SetRaytracingPipeline(pipeline));
    }

    fn build_acceleration_structure(&mut self, desc: &BuildDesc) {
        self.commands.push(GpuCommand::Build(desc.clone()));
    }

    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc) {
        self.commands.push(GpuCommand::DispatchRays(*desc));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Program bound by the last kernel or pipeline command.
#[derive(Clone, Copy)]
enum Bound {
    Kernel(KernelId),
    Pipeline(PipelineId),
}

/// A wgpu adapter and device driven through [`RtDevice`].
pub struct WgpuDevice {
    name: String,
    native: bool,
    compute: bool,
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<GpuState>,
}

impl fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("name", &self.name)
            .field("native", &self.native)
            .field("compute", &self.compute)
            .finish()
    }
}

impl WgpuDevice {
    pub fn builder() -> WgpuDeviceBuilder {
        WgpuDeviceBuilder::default()
    }

    /// A device on the default high-performance adapter.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// The underlying wgpu device, for work outside the context.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn buffer_usages(&self) -> wgpu::BufferUsages {
        let usages = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::UNIFORM
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        if self.native {
            usages | wgpu::BufferUsages::BLAS_INPUT
        } else {
            usages
        }
    }

    /// Copies a buffer back to the host. Blocks until the copy completes.
    pub fn read_buffer(&self, resource: &Resource) -> Result<Vec<u8>> {
        let size = align_up(resource.size().max(4), wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        {
            let state = self.state.lock();
            let source = match state.resources.get(&resource.id).map(|r| &r.backing) {
                Some(Backing::Buffer(buffer)) => buffer,
                _ => {
                    return Err(RtError::device(format!(
                        "'{}' is not a live buffer",
                        resource.label()
                    )));
                }
            };
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Readback"),
                });
            encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
            self.queue.submit(Some(encoder.finish()));
        }

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait_idle()?;
        receiver
            .recv()
            .map_err(|_| RtError::device("readback was dropped"))?
            .map_err(|err| RtError::device(format!("readback failed: {err}")))?;

        let mut data = slice.get_mapped_range().to_vec();
        staging.unmap();
        data.truncate(resource.size() as usize);
        Ok(data)
    }

    fn compile(&self, label: &str, source: &str, entry_point: &str) -> Result<Kernel> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RtError::device(format!("kernel '{label}' failed to compile: {err}")));
        }

        debug!(kernel = label, "compiled");
        Ok(Kernel {
            label: label.to_string(),
            pipeline,
            bindings: declared_bindings(source),
        })
    }

    fn binding<'a>(
        &self,
        state: &'a GpuState,
        heap: Option<usize>,
        argument: &RootArgument,
    ) -> Result<BoundResource<'a>> {
        match argument {
            RootArgument::Constants(words) => {
                let mut bytes: Vec<u8> = bytemuck::cast_slice(words.as_slice()).to_vec();
                bytes.resize(align_up(bytes.len().max(16) as u64, 16) as usize, 0);
                let buffer = self
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("Root Constants"),
                        contents: &bytes,
                        usage: wgpu::BufferUsages::UNIFORM,
                    });
                Ok(BoundResource::Constants(buffer))
            }
            RootArgument::ConstantBuffer(address)
            | RootArgument::ShaderResource(address)
            | RootArgument::UnorderedAccess(address) => {
                let (buffer, offset) = state.buffer_at(*address)?;
                Ok(BoundResource::Buffer { buffer, offset })
            }
            RootArgument::AccelerationStructure(address) => match state.structure_at(*address)? {
                NativeStructure::Top(tlas) => Ok(BoundResource::Structure(tlas)),
                NativeStructure::Bottom(_) => Err(RtError::device(
                    "a bottom-level structure cannot be traced directly",
                )),
            },
            RootArgument::DescriptorTable(handle) => {
                let heap = heap.ok_or_else(|| RtError::device("descriptor table without a heap"))?;
                let (id, view) = state.view(heap, *handle)?;
                let resource = state
                    .resources
                    .get(&id)
                    .ok_or_else(|| RtError::device(format!("view of released resource {id}")))?;
                match (&resource.backing, view) {
                    (Backing::Texture(texture), ViewDesc::Texture2d { .. }) => Ok(BoundResource::View(
                        texture.create_view(&wgpu::TextureViewDescriptor::default()),
                    )),
                    (
                        Backing::Buffer(buffer),
                        ViewDesc::Buffer {
                            first_element,
                            stride,
                            ..
                        },
                    ) => Ok(BoundResource::Buffer {
                        buffer,
                        offset: first_element * stride.max(4) as u64,
                    }),
                    _ => Err(RtError::device(format!(
                        "view does not match resource '{}'",
                        resource.desc.label
                    ))),
                }
            }
        }
    }

    fn bind_group(
        &self,
        state: &GpuState,
        kernel: &Kernel,
        heap: Option<usize>,
        arguments: &BTreeMap<u32, RootArgument>,
    ) -> Result<Option<wgpu::BindGroup>> {
        if kernel.bindings.is_empty() {
            return Ok(None);
        }

        let mut owned = Vec::with_capacity(kernel.bindings.len());
        for &slot in &kernel.bindings {
            let argument = arguments.get(&slot).ok_or_else(|| {
                RtError::device(format!(
                    "kernel '{}' reads binding {slot} but nothing is bound there",
                    kernel.label
                ))
            })?;
            owned.push((slot, self.binding(state, heap, argument)?));
        }

        let entries: Vec<wgpu::BindGroupEntry<'_>> = owned
            .iter()
            .map(|(slot, binding)| wgpu::BindGroupEntry {
                binding: *slot,
                resource: binding.resource(),
            })
            .collect();

        Ok(Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&kernel.label),
            layout: &kernel.pipeline.get_bind_group_layout(0),
            entries: &entries,
        })))
    }

    fn encode_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        state: &GpuState,
        kernel: &Kernel,
        heap: Option<usize>,
        arguments: &BTreeMap<u32, RootArgument>,
        groups: [u32; 3],
    ) -> Result<()> {
        let group = self.bind_group(state, kernel, heap, arguments)?;
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(&kernel.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        if let Some(group) = &group {
            pass.set_bind_group(0, group, &[]);
        }
        pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        Ok(())
    }

    fn encode_bottom_level(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        state: &GpuState,
        label: &str,
        geometries: &[TriangleGeometry],
    ) -> Result<wgpu::Blas> {
        let sizes = geometries
            .iter()
            .map(|geometry| {
                let indexed = geometry.index_buffer.is_some();
                Ok(wgpu::BlasTriangleGeometrySizeDescriptor {
                    vertex_format: vertex_format(geometry.vertex_format)?,
                    vertex_count: geometry.vertex_count,
                    index_format: if indexed {
                        Some(index_format(geometry.index_format)?)
                    } else {
                        None
                    },
                    index_count: indexed.then_some(geometry.index_count),
                    flags: if geometry.opaque {
                        wgpu::AccelerationStructureGeometryFlags::OPAQUE
                    } else {
                        wgpu::AccelerationStructureGeometryFlags::empty()
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let blas = self.device.create_blas(
            &wgpu::CreateBlasDescriptor {
                label: Some(label),
                flags: acceleration_flags(),
                update_mode: wgpu::AccelerationStructureUpdateMode::Build,
            },
            wgpu::BlasGeometrySizeDescriptors::Triangles {
                descriptors: sizes.clone(),
            },
        );

        let mut triangles = Vec::with_capacity(geometries.len());
        for (geometry, size) in geometries.iter().zip(&sizes) {
            let (vertices, vertex_offset) = state.buffer_at(geometry.vertex_buffer)?;
            let indices = geometry
                .index_buffer
                .map(|address| state.buffer_at(address))
                .transpose()?;
            let index_size = geometry.index_format.byte_size().max(1) as u64;

            triangles.push(wgpu::BlasTriangleGeometry {
                size,
                vertex_buffer: vertices,
                first_vertex: (vertex_offset / geometry.vertex_stride.max(1)) as u32,
                vertex_stride: geometry.vertex_stride,
                index_buffer: indices.map(|(buffer, _)| buffer),
                first_index: indices.map(|(_, offset)| (offset / index_size) as u32),
                transform_buffer: None,
                transform_buffer_offset: None,
            });
        }

        let entry = wgpu::BlasBuildEntry {
            blas: &blas,
            geometry: wgpu::BlasGeometries::TriangleGeometries(triangles),
        };
        encoder.build_acceleration_structures(std::iter::once(&entry), std::iter::empty());
        Ok(blas)
    }

    fn encode_top_level(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        state: &GpuState,
        label: &str,
        instances: &[InstanceDesc],
    ) -> Result<wgpu::Tlas> {
        let mut tlas = self.device.create_tlas(&wgpu::CreateTlasDescriptor {
            label: Some(label),
            max_instances: instances.len().max(1) as u32,
            flags: acceleration_flags(),
            update_mode: wgpu::AccelerationStructureUpdateMode::Build,
        });

        for (index, instance) in instances.iter().enumerate() {
            let blas = match state.structure_at(instance.acceleration_structure)? {
                NativeStructure::Bottom(blas) => blas,
                NativeStructure::Top(_) => {
                    return Err(RtError::device("an instance cannot reference a top level"));
                }
            };
            tlas[index] = Some(wgpu::TlasInstance::new(
                blas,
                instance.transform,
                pack_instance_custom_data(instance.instance_id(), instance.hit_group_offset()),
                instance.mask(),
            ));
        }

        encoder.build_acceleration_structures(std::iter::empty(), std::iter::once(&tlas));
        Ok(tlas)
    }

    fn encode_build(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        state: &mut GpuState,
        desc: &BuildDesc,
    ) -> Result<()> {
        let (dest, label) = {
            let (resource, _) = state.resource_at(desc.dest)?;
            if !matches!(resource.backing, Backing::Acceleration(_)) {
                return Err(RtError::device(format!(
                    "'{}' is not an acceleration structure",
                    resource.desc.label
                )));
            }
            let id = state.ranges.range(..=desc.dest).next_back().map(|(_, id)| *id);
            (id, resource.desc.label.clone())
        };
        let dest = dest.ok_or_else(|| unmapped(desc.dest))?;

        let structure = match &desc.inputs {
            BuildInputs::BottomLevel { geometries } => {
                NativeStructure::Bottom(self.encode_bottom_level(encoder, state, &label, geometries)?)
            }
            BuildInputs::TopLevel { instances, .. } => {
                NativeStructure::Top(self.encode_top_level(encoder, state, &label, instances)?)
            }
        };

        if let Some(resource) = state.resources.get_mut(&dest) {
            resource.backing = Backing::Acceleration(Some(structure));
        }
        trace!(structure = %label, "acceleration structure encoded");
        Ok(())
    }

    fn encode_copy(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        state: &GpuState,
        dest: ResourceId,
        source: ResourceId,
    ) -> Result<()> {
        let lookup = |id: ResourceId| {
            state
                .resources
                .get(&id)
                .ok_or_else(|| RtError::device(format!("copy with released resource {id}")))
        };
        let (dest, source) = (lookup(dest)?, lookup(source)?);

        match (&dest.backing, &source.backing) {
            (Backing::Buffer(to), Backing::Buffer(from)) => {
                let size = align_up(dest.size().min(source.size()), wgpu::COPY_BUFFER_ALIGNMENT);
                encoder.copy_buffer_to_buffer(from, 0, to, 0, size.min(to.size()).min(from.size()));
            }
            (Backing::Texture(to), Backing::Texture(from)) => {
                encoder.copy_texture_to_texture(
                    from.as_image_copy(),
                    to.as_image_copy(),
                    from.size(),
                );
            }
            _ => {
                return Err(RtError::device(format!(
                    "cannot copy '{}' into '{}'",
                    source.desc.label, dest.desc.label
                )));
            }
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut wgpu::CommandEncoder, list: &WgpuCommandList) -> Result<()> {
        let mut state = self.state.lock();
        let mut heap = None;
        let mut bound = None;
        let mut arguments = BTreeMap::new();

        for command in &list.commands {
            match command {
                GpuCommand::SetDescriptorHeap(start) => {
                    heap = Some((start.0.saturating_sub(GPU_HEAP_BASE) / HEAP_STRIDE) as usize);
                }
                GpuCommand::CopyResource { dest, source } => {
                    self.encode_copy(encoder, &state, *dest, *source)?;
                }
                GpuCommand::SetComputeKernel(kernel) => {
                    bound = Some(Bound::Kernel(*kernel));
                    arguments.clear();
                }
                GpuCommand::SetRaytracingPipeline(pipeline) => {
                    bound = Some(Bound::Pipeline(*pipeline));
                    arguments.clear();
                }
                GpuCommand::SetRootArgument { slot, argument } => {
                    arguments.insert(*slot, argument.clone());
                }
                GpuCommand::Dispatch(groups) => {
                    let Some(Bound::Kernel(id)) = bound else {
                        return Err(RtError::device("dispatch without a compute kernel"));
                    };
                    let kernel = state
                        .kernels
                        .get(id.0 as usize)
                        .ok_or_else(|| RtError::device(format!("unknown kernel {}", id.0)))?;
                    self.encode_dispatch(encoder, &state, kernel, heap, &arguments, *groups)?;
                }
                GpuCommand::DispatchRays(desc) => {
                    let Some(Bound::Pipeline(id)) = bound else {
                        return Err(RtError::device("ray dispatch without a pipeline"));
                    };
                    let pipeline = state
                        .pipelines
                        .get(id.0 as usize)
                        .ok_or_else(|| RtError::device(format!("unknown pipeline {}", id.0)))?;
                    let groups = [
                        desc.width.div_ceil(RAY_TILE),
                        desc.height.div_ceil(RAY_TILE),
                        desc.depth.max(1),
                    ];
                    self.encode_dispatch(encoder, &state, &pipeline.kernel, heap, &arguments, groups)?;
                }
                GpuCommand::Build(desc) => {
                    if !self.native {
                        return Err(RtError::device("device has no native raytracing"));
                    }
                    self.encode_build(encoder, &mut state, desc)?;
                }
            }
        }
        Ok(())
    }
}

impl RtDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_native_raytracing(&self) -> bool {
        self.native
    }

    fn supports_compute_fallback(&self) -> bool {
        self.compute
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<Resource> {
        let mut state = self.state.lock();
        let id = ResourceId(state.next_resource);
        state.next_resource += 1;

        let (address, backing) = match desc.dimension {
            ResourceDimension::Buffer { size } => {
                let address = state.next_address;
                state.next_address += align_up(size.max(1), ADDRESS_ALIGNMENT);
                let backing = if self.native
                    && desc.initial_state == ResourceState::RaytracingAccelerationStructure
                {
                    Backing::Acceleration(None)
                } else {
                    Backing::Buffer(self.device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some(&desc.label),
                        size: align_up(size.max(4), wgpu::COPY_BUFFER_ALIGNMENT),
                        usage: self.buffer_usages(),
                        mapped_at_creation: false,
                    }))
                };
                (address, backing)
            }
            ResourceDimension::Texture2d {
                width,
                height,
                format,
            } => {
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&desc.label),
                    size: wgpu::Extent3d {
                        width: width.max(1),
                        height: height.max(1),
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: texture_format(format)?,
                    usage: wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                (0, Backing::Texture(texture))
            }
        };

        if address != 0 {
            state.ranges.insert(address, id);
        }
        state.resources.insert(
            id,
            GpuResource {
                desc: desc.clone(),
                address,
                backing,
            },
        );
        debug!(%id, label = %desc.label, address, "created resource");

        Ok(Resource {
            id,
            gpu_address: address,
            desc: desc.clone(),
        })
    }

    fn write_buffer(&self, resource: &Resource, offset: u64, data: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let Some(GpuResource {
            backing: Backing::Buffer(buffer),
            ..
        }) = state.resources.get(&resource.id)
        else {
            return Err(RtError::device(format!(
                "'{}' is not a live buffer",
                resource.label()
            )));
        };
        if offset + data.len() as u64 > resource.size() {
            return Err(RtError::device(format!(
                "write of {} bytes at {offset} overflows '{}'",
                data.len(),
                resource.label()
            )));
        }

        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align_up(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
            self.queue.write_buffer(buffer, offset, &padded);
        }
        Ok(())
    }

    fn release(&self, resource: &Resource) {
        let mut state = self.state.lock();
        match state.resources.remove(&resource.id) {
            Some(released) => {
                if released.address != 0 {
                    state.ranges.remove(&released.address);
                }
            }
            None => warn!(id = %resource.id, "release of unknown resource"),
        }
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo> {
        let mut state = self.state.lock();
        let heap = state.heaps.len() as u64;
        state.heaps.push(vec![None; desc.capacity as usize]);

        Ok(DescriptorHeapInfo {
            label: desc.label.clone(),
            capacity: desc.capacity,
            increment: DESCRIPTOR_INCREMENT,
            cpu_start: CpuDescriptorHandle(HEAP_STRIDE * (heap + 1)),
            gpu_start: GpuDescriptorHandle(GPU_HEAP_BASE + HEAP_STRIDE * heap),
        })
    }

    fn create_view(&self, resource: &Resource, view: &ViewDesc, dest: CpuDescriptorHandle) {
        let heap = (dest.0 / HEAP_STRIDE).saturating_sub(1) as usize;
        let slot = ((dest.0 % HEAP_STRIDE) / DESCRIPTOR_INCREMENT as u64) as usize;

        let mut state = self.state.lock();
        match state.heaps.get_mut(heap).and_then(|slots| slots.get_mut(slot)) {
            Some(entry) => *entry = Some((resource.id, *view)),
            None => warn!(handle = dest.0, "view written outside every heap"),
        }
    }

    fn create_compute_kernel(&self, desc: &KernelDesc<'_>) -> Result<KernelId> {
        let kernel = self.compile(desc.label, desc.source, desc.entry_point)?;
        let mut state = self.state.lock();
        state.kernels.push(kernel);
        Ok(KernelId(state.kernels.len() as u32 - 1))
    }

    fn create_raytracing_pipeline(&self, program: &RtProgram) -> Result<PipelineId> {
        if !self.native {
            return Err(RtError::device("device has no native raytracing"));
        }
        let source = program.link(&[NATIVE_PRELUDE, COMMON_PRELUDE], NATIVE_ENTRY_POINT);
        let kernel = self.compile(&format!("{} (native)", program.label), &source, NATIVE_ENTRY_POINT)?;

        let mut state = self.state.lock();
        state.pipelines.push(NativePipeline {
            kernel,
            exports: program.exports().into_iter().map(str::to_string).collect(),
        });
        Ok(PipelineId(state.pipelines.len() as u32 - 1))
    }

    fn shader_identifier(&self, pipeline: PipelineId, export: &str) -> Option<ShaderIdentifier> {
        let state = self.state.lock();
        let pipeline = state.pipelines.get(pipeline.0 as usize)?;
        let index = pipeline.exports.iter().position(|name| name == export)?;
        Some(ShaderIdentifier::from_export_index(index as u32))
    }

    /// wgpu sizes acceleration structures itself; these sizes only reserve
    /// address space for the destination.
    fn acceleration_structure_prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo> {
        if !self.native {
            return Err(RtError::device("device has no native raytracing"));
        }
        let primitives = inputs.primitive_count() as u64;
        Ok(PrebuildInfo {
            result_size: align_up(128 + 64 * primitives, ADDRESS_ALIGNMENT),
            scratch_size: align_up(64 + 32 * primitives, ADDRESS_ALIGNMENT),
        })
    }

    fn create_command_list(&self, label: &str) -> Result<Box<dyn CommandList>> {
        Ok(Box::new(WgpuCommandList {
            label: label.to_string(),
            commands: Vec::new(),
        }))
    }

    fn submit(&self, list: Box<dyn CommandList>) -> Result<()> {
        let list = list
            .into_any()
            .downcast::<WgpuCommandList>()
            .map_err(|_| RtError::device("command list was not created by this device"))?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&list.label),
            });
        self.encode(&mut encoder, &list)?;
        self.queue.submit(Some(encoder.finish()));

        debug!(list = %list.label, commands = list.commands.len(), "submitted");
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|err| RtError::device(format!("device poll failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_are_read_from_source() {
        let source = "@group(0) @binding(4) var<uniform> a: A;\n\
                      @group(0) @binding(0) var<uniform> b: B;\n\
                      @group(0) @binding( 2 ) var<storage> c: array<u32>;\n\
                      @group(0) @binding(4) var<uniform> again: A;";
        assert_eq!(declared_bindings(source), vec![0, 2, 4]);
    }

    #[test]
    fn shipped_kernels_declare_their_slots() {
        let traversal = format!(
            "{COMMON_PRELUDE}\n{}",
            include_str!("../shaders/fallback_traversal.wgsl")
        );
        assert_eq!(declared_bindings(&traversal), vec![0, 1, 2, 3]);
        assert_eq!(
            declared_bindings(&format!("{NATIVE_PRELUDE}\n{COMMON_PRELUDE}")),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn formats_map_to_wgpu() {
        assert_eq!(
            texture_format(Format::R16G16B16A16Float).unwrap(),
            wgpu::TextureFormat::Rgba16Float
        );
        assert_eq!(
            vertex_format(Format::R32G32B32Float).unwrap(),
            wgpu::VertexFormat::Float32x3
        );
        assert_eq!(index_format(Format::R16Uint).unwrap(), wgpu::IndexFormat::Uint16);
        assert!(texture_format(Format::Unknown).is_err());
        assert!(vertex_format(Format::R32Uint).is_err());
    }
}
