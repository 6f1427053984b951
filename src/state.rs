//! Compiled raytracing state objects.
//!
//! An [`RtState`] is what a program becomes on the context's capability path: a
//! native pipeline on hardware, a linked traversal kernel under emulation. Either
//! way it carries one [`ShaderIdentifier`] per export, which shader-table records
//! copy verbatim.

use std::collections::HashMap;

use crate::capability::CapabilityMode;
use crate::context::RtContext;
use crate::device::{KernelId, PipelineId, SHADER_IDENTIFIER_SIZE, ShaderIdentifier};
use crate::error::{Result, RtError};
use crate::shader::RtProgram;

/// Backend object behind a state object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateHandle {
    /// Native raytracing pipeline.
    Pipeline(PipelineId),
    /// Linked emulation kernel.
    Kernel(KernelId),
}

/// A program compiled for one context.
#[derive(Clone, Debug)]
pub struct RtState {
    label: String,
    mode: CapabilityMode,
    handle: StateHandle,
    identifiers: HashMap<String, ShaderIdentifier>,
    max_recursion_depth: u32,
}

impl RtState {
    /// Compiles `program` on `ctx`'s capability path.
    pub fn create(ctx: &RtContext, program: &RtProgram) -> Result<Self> {
        ctx.create_state_object(program)
    }

    pub(crate) fn new(
        program: &RtProgram,
        mode: CapabilityMode,
        handle: StateHandle,
        identifiers: HashMap<String, ShaderIdentifier>,
    ) -> Self {
        Self {
            label: program.label.clone(),
            mode,
            handle,
            identifiers,
            max_recursion_depth: program.max_recursion_depth,
        }
    }

    /// Identifier of `export` (a ray-generation, miss, or hit-group name).
    pub fn identifier(&self, export: &str) -> Result<ShaderIdentifier> {
        self.identifiers
            .get(export)
            .copied()
            .ok_or_else(|| RtError::MissingExport(format!("{} in '{}'", export, self.label)))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> CapabilityMode {
        self.mode
    }

    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    /// Fails unless the state object was compiled for `mode`.
    pub(crate) fn expect_mode(&self, mode: CapabilityMode) -> Result<()> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(RtError::ModeMismatch {
                expected: self.mode,
                actual: mode,
            })
        }
    }
}

impl ShaderIdentifier {
    /// Identifier encoding `export_index + 1` in its first four bytes.
    ///
    /// Used wherever identifiers are not provided by a driver. The linked glue of
    /// [`RtProgram::link`] switches on the same value.
    pub fn from_export_index(export_index: u32) -> Self {
        let mut bytes = [0u8; SHADER_IDENTIFIER_SIZE];
        bytes[..4].copy_from_slice(&(export_index + 1).to_le_bytes());
        Self(bytes)
    }

    /// Identifiers for every export of `program`, in export order.
    pub fn synthetic_table(program: &RtProgram) -> HashMap<String, ShaderIdentifier> {
        program
            .exports()
            .into_iter()
            .enumerate()
            .map(|(index, name)| (name.to_string(), Self::from_export_index(index as u32)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{HitGroup, RtShader};

    #[test]
    fn synthetic_identifiers_follow_export_order() {
        let program = RtProgram::new("p", "")
            .with_miss(RtShader::miss("miss"))
            .with_hit_group(HitGroup::new("hit_group"));
        let table = ShaderIdentifier::synthetic_table(&program);

        assert_eq!(table["ray_generation"].0[0], 1);
        assert_eq!(table["miss"].0[0], 2);
        assert_eq!(table["hit_group"].0[0], 3);
        assert!(table["hit_group"].0[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn missing_export_is_reported() {
        let program = RtProgram::new("scene", "");
        let state = RtState::new(
            &program,
            CapabilityMode::Emulated,
            StateHandle::Kernel(KernelId(0)),
            ShaderIdentifier::synthetic_table(&program),
        );
        assert!(state.identifier("ray_generation").is_ok());
        assert!(matches!(
            state.identifier("nope"),
            Err(RtError::MissingExport(_))
        ));
        assert!(state.expect_mode(CapabilityMode::Emulated).is_ok());
        assert!(matches!(
            state.expect_mode(CapabilityMode::Hardware),
            Err(RtError::ModeMismatch { .. })
        ));
    }
}
