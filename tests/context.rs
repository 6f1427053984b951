use std::sync::Arc;

use rtframework::backend::{RecordedCommand, RecordingDevice};
use rtframework::{
    BuildInputs, CapabilityMode, CommandList, ContextConfig, ErrorCategory, Format, InstanceDesc,
    Mat4, PipelineConfig, RawGeometry, RaytracingPipeline, ResolvedPointer, ResourceDesc,
    ResourceState, RtContext, RtDevice, RtError, RtModel, RtScene, TableKind, WrappedPointer,
};

fn context(device: RecordingDevice, config: ContextConfig) -> (Arc<RecordingDevice>, RtContext) {
    let device = Arc::new(device);
    let ctx = RtContext::new(device.clone(), config).unwrap();
    (device, ctx)
}

#[test]
fn allocation_is_contiguous_from_zero() {
    let (_, mut ctx) = context(
        RecordingDevice::native(),
        ContextConfig::new().descriptor_capacity(64),
    );
    let indices: Vec<u32> = (0..64)
        .map(|_| ctx.allocate_descriptor(None).unwrap().1)
        .collect();
    assert_eq!(indices, (0..64).collect::<Vec<_>>());
}

#[test]
fn explicit_index_returns_the_original_handles() {
    let (_, mut ctx) = context(RecordingDevice::native(), ContextConfig::default());
    let (cpu, index) = ctx.allocate_descriptor(None).unwrap();
    let gpu = ctx.descriptor_gpu_handle(index);
    ctx.allocate_descriptor(None).unwrap();

    let (again, same) = ctx.allocate_descriptor(Some(index)).unwrap();
    assert_eq!((again, same), (cpu, index));
    assert_eq!(ctx.descriptor_gpu_handle(same), gpu);
    assert_eq!(ctx.allocated_descriptors(), 2);
}

#[test]
fn explicit_index_past_the_high_water_mark_allocates_fresh() {
    let (_, mut ctx) = context(RecordingDevice::native(), ContextConfig::default());
    let (_, index) = ctx.allocate_descriptor(Some(100)).unwrap();
    assert_eq!(index, 0);
}

#[test]
fn gpu_handles_ignore_other_allocations() {
    let (_, mut ctx) = context(RecordingDevice::native(), ContextConfig::default());
    let before = ctx.descriptor_gpu_handle(5);
    for _ in 0..10 {
        ctx.allocate_descriptor(None).unwrap();
    }
    assert_eq!(ctx.descriptor_gpu_handle(5), before);

    let heap = ctx.descriptor_heap().clone();
    assert_eq!(before.0, heap.gpu_start.0 + 5 * heap.increment as u64);
}

#[test]
fn the_descriptor_after_capacity_fails() {
    let (_, mut ctx) = context(
        RecordingDevice::native(),
        ContextConfig::new().descriptor_capacity(1024),
    );
    let (first, _) = ctx.allocate_descriptor(None).unwrap();
    for _ in 1..1024 {
        ctx.allocate_descriptor(None).unwrap();
    }

    let err = ctx.allocate_descriptor(None).unwrap_err();
    assert!(matches!(
        err,
        RtError::Exhausted {
            table: TableKind::DescriptorHeap,
            capacity: 1024
        }
    ));
    assert_eq!(err.category(), ErrorCategory::ConfigurationExhaustion);
    assert!(err.is_fatal());

    assert_eq!(ctx.allocated_descriptors(), 1024);
    assert_eq!(ctx.descriptor_cpu_handle(0), first);
}

#[test]
fn hardware_pointers_resolve_to_the_native_address() {
    let (device, mut ctx) = context(RecordingDevice::native(), ContextConfig::default());
    assert_eq!(ctx.mode(), CapabilityMode::Hardware);

    let buffer = device
        .create_resource(&ResourceDesc::buffer("Vertices", 768))
        .unwrap();
    let pointer = ctx.create_wrapped_pointer(&buffer, 24).unwrap();

    assert_eq!(pointer, WrappedPointer::Address(buffer.gpu_address));
    assert_eq!(
        ctx.resolve_wrapped_pointer(pointer).unwrap(),
        ResolvedPointer::Address(buffer.gpu_address)
    );
    assert!(ctx.indirection_table().is_none());
}

#[test]
fn emulated_pointers_get_distinct_slots() {
    let (device, mut ctx) = context(RecordingDevice::emulated_only(), ContextConfig::default());
    assert_eq!(ctx.mode(), CapabilityMode::Emulated);

    let a = device.create_resource(&ResourceDesc::buffer("A", 256)).unwrap();
    let b = device.create_resource(&ResourceDesc::buffer("B", 512)).unwrap();
    let pa = ctx.create_wrapped_pointer(&a, 16).unwrap();
    let pb = ctx.create_wrapped_pointer(&b, 8).unwrap();
    assert_ne!(pa.table_slot(), pb.table_slot());

    for (pointer, resource, count) in [(pa, &a, 16), (pb, &b, 8)] {
        match ctx.resolve_wrapped_pointer(pointer).unwrap() {
            ResolvedPointer::Table(record) => {
                assert_eq!(record.resource, resource.id);
                assert_eq!(record.address, resource.gpu_address);
                assert_eq!(record.element_count, count);
            }
            ResolvedPointer::Address(_) => panic!("expected an indirection entry"),
        }
    }
    assert_eq!(ctx.allocated_descriptors(), 0);
}

#[test]
fn new_slot_keeps_the_earlier_entry() {
    let (device, mut ctx) = context(RecordingDevice::emulated_only(), ContextConfig::default());
    let buffer = device
        .create_resource(&ResourceDesc::buffer("Vertices", 768))
        .unwrap();

    let first = ctx.create_wrapped_pointer(&buffer, 24).unwrap();
    assert_eq!(ctx.create_wrapped_pointer(&buffer, 24).unwrap(), first);
    let second = ctx.wrap_in_new_slot(&buffer, 12).unwrap();
    assert_ne!(second.table_slot(), first.table_slot());
    assert_eq!(ctx.indirection_table().unwrap().len(), 2);

    let counts: Vec<u32> = [first, second]
        .into_iter()
        .map(|pointer| match ctx.resolve_wrapped_pointer(pointer).unwrap() {
            ResolvedPointer::Table(record) => {
                assert_eq!(record.resource, buffer.id);
                record.element_count
            }
            ResolvedPointer::Address(_) => panic!("expected an indirection entry"),
        })
        .collect();
    assert_eq!(counts, vec![24, 12]);
}

#[test]
fn forced_emulation_on_a_native_device() {
    let (_, ctx) = context(
        RecordingDevice::native(),
        ContextConfig::new().force_emulated(true),
    );
    assert_eq!(ctx.mode(), CapabilityMode::Emulated);
}

#[test]
fn no_capability_is_fatal() {
    let device = Arc::new(
        RecordingDevice::builder()
            .native_raytracing(false)
            .compute_fallback(false)
            .build(),
    );
    let err = RtContext::new(device, ContextConfig::default()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::CapabilityUnavailable);
    assert!(err.is_fatal());
}

#[test]
fn model_registration_in_emulated_mode() {
    let (_, mut ctx) = context(RecordingDevice::emulated_only(), ContextConfig::default());
    let cube = RawGeometry::cube();
    assert_eq!((cube.index_count(), cube.vertex_count()), (36, 24));

    let model = RtModel::new(&mut ctx, "Cube", &cube).unwrap();
    assert_eq!(ctx.allocated_descriptors(), 2);

    let counts: Vec<u32> = [model.index_pointer(), model.vertex_pointer()]
        .into_iter()
        .map(|pointer| match ctx.resolve_wrapped_pointer(pointer).unwrap() {
            ResolvedPointer::Table(record) => record.element_count,
            ResolvedPointer::Address(_) => panic!("expected an indirection entry"),
        })
        .collect();
    assert_eq!(counts, vec![36, 24]);
    assert_eq!(ctx.indirection_table().unwrap().len(), 2);
}

#[test]
fn emulated_top_level_rejects_raw_addresses() {
    let (_, mut ctx) = context(RecordingDevice::emulated_only(), ContextConfig::default());
    RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap();

    let raw = ctx.indirection_table().unwrap().buffer().gpu_address;
    let inputs = BuildInputs::TopLevel {
        instance_descs: 0,
        instances: vec![InstanceDesc::new(Mat4::IDENTITY, 0, 0, raw)],
    };
    assert!(matches!(
        ctx.prebuild_info(&inputs),
        Err(RtError::UnknownPointer(bits)) if bits == raw
    ));
}

/// Renders one frame of a single cube and returns the device and pipeline.
fn render_cube(
    device: RecordingDevice,
    width: u32,
    height: u32,
) -> (Arc<RecordingDevice>, RaytracingPipeline) {
    let (device, mut ctx) = context(device, ContextConfig::default());
    let mut scene = RtScene::new("Cube");
    scene.add_model(
        RtModel::new(&mut ctx, "Cube", &RawGeometry::cube()).unwrap(),
        Mat4::IDENTITY,
    );

    let mut pipeline = RaytracingPipeline::new(PipelineConfig::default());
    pipeline.set_scene(scene);
    pipeline.load_resources(&mut ctx).unwrap();
    pipeline
        .create_output_resource(&mut ctx, width, height)
        .unwrap();

    let mut list = device.create_command_list("Frame").unwrap();
    {
        let mut rec = ctx.record(list.as_mut());
        pipeline.build_acceleration_structures(&mut rec).unwrap();
        pipeline.update(0.0, 0, 0, 0, width, height).unwrap();
        pipeline.render(&mut rec, 0, width, height).unwrap();
    }
    device.submit(list).unwrap();
    (device, pipeline)
}

#[test]
fn raytrace_output_matches_across_modes() {
    let (native, native_pipeline) = render_cube(RecordingDevice::native(), 100, 60);
    let (emulated, emulated_pipeline) = render_cube(RecordingDevice::emulated_only(), 100, 60);

    let native_output = native_pipeline.output_resource().unwrap();
    let emulated_output = emulated_pipeline.output_resource().unwrap();
    assert_eq!(native_output.extent(), Some((100, 60)));
    assert_eq!(emulated_output.extent(), native_output.extent());
    assert_eq!(
        native.resource_state(native_output),
        emulated.resource_state(emulated_output)
    );
    assert_eq!(
        native.resource_state(native_output),
        Some(ResourceState::NonPixelShaderResource)
    );

    assert!(native.submitted_commands().contains(&RecordedCommand::DispatchRays {
        width: 100,
        height: 60,
        depth: 1
    }));
    let last_dispatch = emulated
        .submitted_commands()
        .into_iter()
        .filter_map(|command| match command {
            RecordedCommand::Dispatch { groups } => Some(groups),
            _ => None,
        })
        .last();
    assert_eq!(last_dispatch, Some([13, 8, 1]));

    assert!(native.validation_messages().is_empty());
    assert!(emulated.validation_messages().is_empty());
}

#[test]
fn validation_reports_protocol_violations() {
    let (device, _ctx) = context(RecordingDevice::native(), ContextConfig::default());
    let output = device
        .create_resource(
            &ResourceDesc::texture_2d("Output", 8, 8, Format::R8G8B8A8Unorm)
                .with_unordered_access(),
        )
        .unwrap();

    let mut list = device.create_command_list("Broken").unwrap();
    list.resource_barrier(
        &output,
        ResourceState::CopySource,
        ResourceState::UnorderedAccess,
    );
    device.submit(list).unwrap();

    let messages = device.validation_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].list, "Broken");
    assert!(messages[0].message.contains("Output"));
}
