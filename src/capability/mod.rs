//! Capability selection: hardware raytracing or compute emulation.
//!
//! A context runs on exactly one of two execution paths, chosen once when the
//! context is created:
//!
//! - **Hardware**: the device traverses rays natively. Acceleration-structure
//!   builds, ray dispatches, and buffer addressing go straight to the device.
//! - **Emulated**: compute kernels stand in for the raytracing hardware. Builds
//!   become kernel dispatches that pack triangles, traversal runs in a compute
//!   kernel, and buffers are reached through the indirection table.
//!
//! Both paths implement [`RaytracingLayer`]. The context holds a
//! [`CapabilityLayer`] and forwards to it without ever inspecting the mode itself,
//! so the same caller code drives either path.
//!
//! # Example
//!
//! ```ignore
//! let layer = CapabilityLayer::probe(device.clone(), &ContextConfig::default())?;
//! match layer.mode() {
//!     CapabilityMode::Hardware => println!("native raytracing"),
//!     CapabilityMode::Emulated => println!("compute fallback"),
//! }
//! ```

pub mod fallback;
pub mod native;

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::acceleration::{BuildDesc, BuildInputs, PrebuildInfo};
use crate::config::ContextConfig;
use crate::device::{CommandList, DispatchRaysDesc, RtDevice};
use crate::error::{Result, RtError};
use crate::resource::{Resource, ResourceState};
use crate::shader::RtProgram;
use crate::state::RtState;
use crate::wrapped_pointer::{ResolvedPointer, WrappedPointer};

pub use fallback::FallbackLayer;
pub use native::NativeLayer;

/// Which execution path a context runs on. Fixed for the context's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapabilityMode {
    Hardware,
    Emulated,
}

impl fmt::Display for CapabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityMode::Hardware => write!(f, "hardware"),
            CapabilityMode::Emulated => write!(f, "emulated"),
        }
    }
}

/// The operations whose execution differs between the two paths.
///
/// Recording methods take the command list explicitly; the layer never keeps one.
pub trait RaytracingLayer {
    fn mode(&self) -> CapabilityMode;

    /// State acceleration-structure result buffers live in on this path.
    fn acceleration_structure_state(&self) -> ResourceState;

    /// Compiles `program` into a state object for this path.
    fn create_state_object(&self, program: &RtProgram) -> Result<RtState>;

    /// Result and scratch sizes for a build of `inputs`.
    fn prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo>;

    /// Records an acceleration-structure build.
    fn build_acceleration_structure(&self, list: &mut dyn CommandList, desc: &BuildDesc)
    -> Result<()>;

    /// Returns a shader-visible reference to `resource`.
    fn wrap_pointer(
        &mut self,
        resource: &Resource,
        element_count: u32,
        new_slot: bool,
    ) -> Result<WrappedPointer>;

    /// Returns a reference to an acceleration structure's result buffer holding
    /// `triangle_count` triangles.
    ///
    /// When `previous` is a pointer this layer issued, it is reused for the new
    /// result so that a rebuilt structure keeps its slot.
    fn wrap_acceleration_structure(
        &mut self,
        result: &Resource,
        triangle_count: u32,
        previous: Option<WrappedPointer>,
    ) -> Result<WrappedPointer>;

    fn resolve_pointer(&self, pointer: WrappedPointer) -> Result<ResolvedPointer>;

    /// Binds the top-level structure referenced by `top_level` for the next dispatch.
    fn bind_top_level(&self, list: &mut dyn CommandList, top_level: WrappedPointer) -> Result<()>;

    /// Makes `state` current on `list`. Resets root arguments, so it comes first.
    fn set_state(&self, list: &mut dyn CommandList, state: &RtState) -> Result<()>;

    /// Records the ray dispatch itself. Global root arguments are already bound.
    fn dispatch_rays(&self, list: &mut dyn CommandList, desc: &DispatchRaysDesc) -> Result<()>;
}

/// The layer selected for a context.
#[derive(Debug)]
pub enum CapabilityLayer {
    Hardware(NativeLayer),
    Emulated(FallbackLayer),
}

impl CapabilityLayer {
    /// Probes `device` and builds the matching layer.
    ///
    /// Native raytracing wins unless `config.force_emulated` is set. Without native
    /// support the compute fallback is constructed, which compiles its build kernels
    /// and creates the indirection table.
    ///
    /// # Errors
    ///
    /// [`RtError::CapabilityUnavailable`] when neither path can be obtained.
    pub fn probe(device: Arc<dyn RtDevice>, config: &ContextConfig) -> Result<Self> {
        let native = device.supports_native_raytracing();
        let compute = device.supports_compute_fallback();

        if native && !config.force_emulated {
            info!(device = device.name(), "using hardware raytracing");
            return Ok(CapabilityLayer::Hardware(NativeLayer::new(device)));
        }

        if !compute {
            let reason = if native {
                "emulation was forced but the device cannot run compute kernels"
            } else {
                "no native raytracing support and no compute support for emulation"
            };
            return Err(RtError::CapabilityUnavailable {
                device: device.name().to_string(),
                reason: reason.to_string(),
            });
        }

        if native {
            warn!(
                device = device.name(),
                "native raytracing available but emulation was forced"
            );
        }

        let name = device.name().to_string();
        let layer = FallbackLayer::new(device, config.indirection_capacity).map_err(|err| {
            match err {
                RtError::Device(reason) => RtError::CapabilityUnavailable {
                    device: name.clone(),
                    reason: format!("fallback kernels failed to compile: {reason}"),
                },
                other => other,
            }
        })?;

        info!(
            device = %name,
            indirection_capacity = config.indirection_capacity,
            "using emulated raytracing"
        );
        Ok(CapabilityLayer::Emulated(layer))
    }

    fn inner(&self) -> &dyn RaytracingLayer {
        match self {
            CapabilityLayer::Hardware(layer) => layer,
            CapabilityLayer::Emulated(layer) => layer,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RaytracingLayer {
        match self {
            CapabilityLayer::Hardware(layer) => layer,
            CapabilityLayer::Emulated(layer) => layer,
        }
    }

    /// The fallback layer, when running emulated.
    pub fn as_fallback(&self) -> Option<&FallbackLayer> {
        match self {
            CapabilityLayer::Emulated(layer) => Some(layer),
            CapabilityLayer::Hardware(_) => None,
        }
    }
}

impl RaytracingLayer for CapabilityLayer {
    fn mode(&self) -> CapabilityMode {
        self.inner().mode()
    }

    fn acceleration_structure_state(&self) -> ResourceState {
        self.inner().acceleration_structure_state()
    }

    fn create_state_object(&self, program: &RtProgram) -> Result<RtState> {
        self.inner().create_state_object(program)
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> Result<PrebuildInfo> {
        self.inner().prebuild_info(inputs)
    }

    fn build_acceleration_structure(
        &self,
        list: &mut dyn CommandList,
        desc: &BuildDesc,
    ) -> Result<()> {
        self.inner().build_acceleration_structure(list, desc)
    }

    fn wrap_pointer(
        &mut self,
        resource: &Resource,
        element_count: u32,
        new_slot: bool,
    ) -> Result<WrappedPointer> {
        self.inner_mut()
            .wrap_pointer(resource, element_count, new_slot)
    }

    fn wrap_acceleration_structure(
        &mut self,
        result: &Resource,
        triangle_count: u32,
        previous: Option<WrappedPointer>,
    ) -> Result<WrappedPointer> {
        self.inner_mut()
            .wrap_acceleration_structure(result, triangle_count, previous)
    }

    fn resolve_pointer(&self, pointer: WrappedPointer) -> Result<ResolvedPointer> {
        self.inner().resolve_pointer(pointer)
    }

    fn bind_top_level(&self, list: &mut dyn CommandList, top_level: WrappedPointer) -> Result<()> {
        self.inner().bind_top_level(list, top_level)
    }

    fn set_state(&self, list: &mut dyn CommandList, state: &RtState) -> Result<()> {
        self.inner().set_state(list, state)
    }

    fn dispatch_rays(&self, list: &mut dyn CommandList, desc: &DispatchRaysDesc) -> Result<()> {
        self.inner().dispatch_rays(list, desc)
    }
}
