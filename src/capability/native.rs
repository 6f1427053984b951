//! Hardware path: thin pass-throughs to the device.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::{CapabilityMode, RaytracingLayer};
use crate::acceleration::{BuildDesc, BuildInputs, InstanceDesc, PrebuildInfo};
use crate::device::{CommandList, DispatchRaysDesc, RootArgument, RtDevice, root_slots};
use crate::error::{Result, RtError};
use crate::resource::{Resource, ResourceState};
use crate::shader::RtProgram;
use crate::state::{RtState, StateHandle};
use crate::wrapped_pointer::{ResolvedPointer, WrappedPointer};

/// Ray-query traversal linked ahead of
/// [`COMMON_PRELUDE`](super::fallback::COMMON_PRELUDE) by devices that compile
/// native programs. It starts with `enable` directives, so it must come first.
pub const NATIVE_PRELUDE: &str = include_str!("../shaders/native.wgsl");

/// Compute entry point generated for native programs.
pub const NATIVE_ENTRY_POINT: &str = "native_raytrace";

/// Largest instance id or hit-group offset that survives
/// [`pack_instance_custom_data`].
pub const MAX_PACKED_INSTANCE_FIELD: u32 = 0xFFF;

/// Packs an instance id and hit-group offset into instance custom data.
///
/// Both fields keep their low 12 bits; the shader reads them back with
/// `unpack_instance_id` and `unpack_hit_group`. Top levels are checked with
/// [`check_packed_instances`] before they reach the device.
pub fn pack_instance_custom_data(instance_id: u32, hit_group_offset: u32) -> u32 {
    ((hit_group_offset & MAX_PACKED_INSTANCE_FIELD) << 12)
        | (instance_id & MAX_PACKED_INSTANCE_FIELD)
}

/// Rejects instances whose id or hit-group offset would alias another record
/// once packed.
pub fn check_packed_instances(instances: &[InstanceDesc]) -> Result<()> {
    for (index, instance) in instances.iter().enumerate() {
        for (field, value) in [
            ("instance id", instance.instance_id()),
            ("hit group offset", instance.hit_group_offset()),
        ] {
            if value > MAX_PACKED_INSTANCE_FIELD {
                return Err(RtError::InstanceFieldOverflow {
                    instance: index,
                    field,
                    value,
                    limit: MAX_PACKED_INSTANCE_FIELD,
                });
            }
        }
    }
    Ok(())
}

fn check_inputs(inputs: &BuildInputs) -> Result<()> {
    match inputs {
        BuildInputs::TopLevel { instances, .. } => check_packed_instances(instances),
        BuildInputs::BottomLevel { .. } => Ok(()),
    }
}

/// Native raytracing. Wrapped pointers are plain GPU virtual addresses.
pub struct NativeLayer {
    device: Arc<dyn RtDevice>,
}

impl NativeLayer {
    pub fn new(device: Arc<dyn RtDevice>) -> Self {
        Self { device }
    }
}

impl fmt::Debug for NativeLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLayer")
            .field("device", &self.device.name())
            .finish()
    }
}

impl RaytracingLayer for NativeLayer {
    fn mode(&self) -> CapabilityMode {
        CapabilityMode::Hardware
    }

    fn acceleration_structure_state(&self) -> ResourceState {
        ResourceState::RaytracingAccelerationStructure
    }

    fn create_state_object(&self, program: &RtProgram) -> Result<RtState> {
        let pipeline = self.device.create_raytracing_pipeline(program)?;

        let identifiers = program
            .exports()
            .into_iter()
            .map(|export| {
                self.device
                    .shader_identifier(pipeline, export)
                    .map(|id| (export.to_string(), id))
                    .ok_or_else(|| RtError::MissingExport(export.to_string()))
            })
            .collect::<Result<_>>()?;

        Ok(RtState::new(
            program,
            CapabilityMode::Hardware,
            StateHandle::Pipeline(pipeline),
            identifiers,
        ))
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo> {
        check_inputs(inputs)?;
        self.device.acceleration_structure_prebuild_info(inputs)
    }

    fn build_acceleration_structure(
        &self,
        list: &mut dyn CommandList,
        desc: &BuildDesc,
    ) -> Result<()> {
        check_inputs(&desc.inputs)?;
        list.build_acceleration_structure(desc);
        Ok(())
    }

    fn wrap_pointer(
        &mut self,
        resource: &Resource,
        _element_count: u32,
        _new_slot: bool,
    ) -> Result<WrappedPointer> {
        Ok(WrappedPointer::Address(resource.gpu_address))
    }

    fn wrap_acceleration_structure(
        &mut self,
        result: &Resource,
        _triangle_count: u32,
        _previous: Option<WrappedPointer>,
    ) -> Result<WrappedPointer> {
        Ok(WrappedPointer::Address(result.gpu_address))
    }

    fn resolve_pointer(&self, pointer: WrappedPointer) -> Result<ResolvedPointer> {
        match pointer {
            WrappedPointer::Address(address) => Ok(ResolvedPointer::Address(address)),
            WrappedPointer::Emulated { .. } => Err(RtError::ModeMismatch {
                expected: CapabilityMode::Emulated,
                actual: CapabilityMode::Hardware,
            }),
        }
    }

    fn bind_top_level(&self, list: &mut dyn CommandList, top_level: WrappedPointer) -> Result<()> {
        let address = self.resolve_pointer(top_level)?.address();
        list.set_compute_root_argument(
            root_slots::TOP_LEVEL,
            RootArgument::AccelerationStructure(address),
        );
        Ok(())
    }

    fn set_state(&self, list: &mut dyn CommandList, state: &RtState) -> Result<()> {
        state.expect_mode(CapabilityMode::Hardware)?;
        match state.handle() {
            StateHandle::Pipeline(pipeline) => {
                list.set_raytracing_pipeline(pipeline);
                Ok(())
            }
            StateHandle::Kernel(_) => Err(RtError::ModeMismatch {
                expected: CapabilityMode::Emulated,
                actual: CapabilityMode::Hardware,
            }),
        }
    }

    fn dispatch_rays(&self, list: &mut dyn CommandList, desc: &DispatchRaysDesc) -> Result<()> {
        trace!(width = desc.width, height = desc.height, "native dispatch");
        list.dispatch_rays(desc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    use crate::backend::recording::RecordingDevice;
    use crate::resource::ResourceDesc;

    fn top_level(instance_id: u32, hit_group_offset: u32) -> BuildInputs {
        BuildInputs::TopLevel {
            instance_descs: 0,
            instances: vec![
                InstanceDesc::new(Mat4::IDENTITY, 0, 0, 0x1_0000_0000),
                InstanceDesc::new(Mat4::IDENTITY, instance_id, hit_group_offset, 0x1_0000_0000),
            ],
        }
    }

    #[test]
    fn custom_data_packs_both_fields() {
        assert_eq!(pack_instance_custom_data(5, 3), (3 << 12) | 5);
        assert_eq!(
            pack_instance_custom_data(MAX_PACKED_INSTANCE_FIELD, MAX_PACKED_INSTANCE_FIELD),
            0xFF_FFFF
        );
    }

    #[test]
    fn largest_packable_instance_builds() {
        let layer = NativeLayer::new(Arc::new(RecordingDevice::native()));
        let inputs = top_level(MAX_PACKED_INSTANCE_FIELD, MAX_PACKED_INSTANCE_FIELD);
        assert!(layer.prebuild_info(&inputs).is_ok());
    }

    #[test]
    fn instance_ids_past_twelve_bits_are_rejected() {
        let device = Arc::new(RecordingDevice::native());
        let layer = NativeLayer::new(device.clone());

        let err = layer.prebuild_info(&top_level(0x1000, 0)).unwrap_err();
        assert!(matches!(
            err,
            RtError::InstanceFieldOverflow {
                instance: 1,
                field: "instance id",
                value: 0x1000,
                ..
            }
        ));

        let mut list = device.create_command_list("Top Level").unwrap();
        let desc = BuildDesc {
            inputs: top_level(7, 0x1000),
            dest: 0x2_0000_0000,
            scratch: 0x3_0000_0000,
        };
        assert!(matches!(
            layer.build_acceleration_structure(list.as_mut(), &desc),
            Err(RtError::InstanceFieldOverflow {
                field: "hit group offset",
                ..
            })
        ));
    }

    #[test]
    fn pointers_are_addresses() {
        let device = Arc::new(RecordingDevice::native());
        let mut layer = NativeLayer::new(device.clone());
        let buffer = device
            .create_resource(&ResourceDesc::buffer("Vertices", 768))
            .unwrap();

        let pointer = layer.wrap_pointer(&buffer, 24, true).unwrap();
        assert_eq!(pointer, WrappedPointer::Address(buffer.gpu_address));
        assert_eq!(
            layer.resolve_pointer(pointer).unwrap(),
            ResolvedPointer::Address(buffer.gpu_address)
        );
    }

    #[test]
    fn emulated_pointers_are_rejected() {
        let layer = NativeLayer::new(Arc::new(RecordingDevice::native()));
        assert!(matches!(
            layer.resolve_pointer(WrappedPointer::Emulated { slot: 0 }),
            Err(RtError::ModeMismatch { .. })
        ));
    }
}
