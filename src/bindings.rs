//! Shader binding tables and global arguments for a ray dispatch.
//!
//! [`RtBindings`] collects everything a dispatch reads besides the state object:
//!
//! - one ray-generation record, any number of miss and hit-group records, each a
//!   shader identifier followed by local arguments;
//! - global root arguments, keyed by root slot (slots from
//!   [`root_slots::FIRST_USER`] up);
//! - the top-level acceleration structure, as a wrapped pointer.
//!
//! [`RtBindings::apply`] lays the records out in an upload buffer:
//!
//! ```text
//!  offset 0            align 64               align 64
//!  ┌──────────────┐    ┌───────┬───────┐      ┌───────┬───────┬───────┐
//!  │ raygen       │ .. │ miss0 │ miss1 │  ..  │ hit0  │ hit1  │ hit2  │
//!  └──────────────┘    └───────┴───────┘      └───────┴───────┴───────┘
//!  record = 32-byte identifier + local arguments, rounded up to 32 bytes
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut bindings = RtBindings::new("ray_generation");
//! bindings.add_miss("miss", vec![]);
//! bindings.add_hit_group("hit_group", vec![
//!     LocalArgument::Constants(vec![material_index]),
//!     LocalArgument::Pointer(model.vertex_pointer()),
//! ]);
//! bindings.set_global(4, RootArgument::ConstantBuffer(frame_constants));
//! bindings.set_top_level(scene.top_level_pointer()?);
//! bindings.apply(&ctx, &state)?;
//! ```

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::context::RtContext;
use crate::device::{
    DispatchRaysDesc, RootArgument, RtDevice, SHADER_IDENTIFIER_SIZE, ShaderTableRange, root_slots,
};
use crate::error::{Result, RtError};
use crate::resource::{GpuDescriptorHandle, GpuVirtualAddress, Resource, ResourceDesc, align_up};
use crate::state::RtState;
use crate::wrapped_pointer::WrappedPointer;

/// Alignment of each record's size.
pub const SHADER_RECORD_ALIGNMENT: u64 = 32;

/// Alignment of the start of each table.
pub const SHADER_TABLE_ALIGNMENT: u64 = 64;

/// A value stored in a shader record after the identifier.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalArgument {
    /// A wrapped pointer, stored as its 64-bit value.
    Pointer(WrappedPointer),
    Address(GpuVirtualAddress),
    /// Start of a descriptor-table range in the shared heap.
    Descriptor(GpuDescriptorHandle),
    /// Inline 32-bit constants.
    Constants(Vec<u32>),
}

impl LocalArgument {
    fn alignment(&self) -> u64 {
        match self {
            LocalArgument::Constants(_) => 4,
            _ => 8,
        }
    }

    fn size(&self) -> u64 {
        match self {
            LocalArgument::Constants(words) => 4 * words.len() as u64,
            _ => 8,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            LocalArgument::Pointer(pointer) => out.extend_from_slice(&pointer.to_bits().to_le_bytes()),
            LocalArgument::Address(address) => out.extend_from_slice(&address.to_le_bytes()),
            LocalArgument::Descriptor(handle) => out.extend_from_slice(&handle.0.to_le_bytes()),
            LocalArgument::Constants(words) => {
                out.extend_from_slice(bytemuck::cast_slice(words.as_slice()))
            }
        }
    }
}

/// Identifier export plus local arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderRecord {
    pub export: String,
    pub arguments: Vec<LocalArgument>,
}

impl ShaderRecord {
    pub fn new(export: impl Into<String>, arguments: Vec<LocalArgument>) -> Self {
        Self {
            export: export.into(),
            arguments,
        }
    }

    /// Unpadded size: identifier plus aligned arguments.
    pub fn size(&self) -> u64 {
        self.arguments
            .iter()
            .fold(SHADER_IDENTIFIER_SIZE as u64, |offset, arg| {
                align_up(offset, arg.alignment()) + arg.size()
            })
    }

    fn write(&self, state: &RtState, stride: u64, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.extend_from_slice(&state.identifier(&self.export)?.0);
        for argument in &self.arguments {
            let offset = (out.len() - start) as u64;
            let aligned = align_up(offset, argument.alignment());
            out.resize(start + aligned as usize, 0);
            argument.write(out);
        }
        out.resize(start + stride as usize, 0);
        Ok(())
    }
}

/// Stride for a table of `records`.
pub fn record_stride(records: &[ShaderRecord]) -> u64 {
    let largest = records
        .iter()
        .map(ShaderRecord::size)
        .max()
        .unwrap_or(SHADER_IDENTIFIER_SIZE as u64);
    align_up(largest, SHADER_RECORD_ALIGNMENT)
}

/// The uploaded shader binding table.
#[derive(Clone, Debug)]
pub struct ShaderTable {
    pub buffer: Resource,
    pub ray_generation: ShaderTableRange,
    pub miss: ShaderTableRange,
    pub hit_group: ShaderTableRange,
}

impl ShaderTable {
    /// Native dispatch description over `width x height x depth` rays.
    pub fn dispatch_desc(&self, width: u32, height: u32, depth: u32) -> DispatchRaysDesc {
        DispatchRaysDesc {
            ray_generation: self.ray_generation,
            miss: self.miss,
            hit_group: self.hit_group,
            width,
            height,
            depth,
        }
    }
}

/// Shader records, global arguments, and the top level for one dispatch.
#[derive(Debug)]
pub struct RtBindings {
    ray_generation: ShaderRecord,
    misses: Vec<ShaderRecord>,
    hit_groups: Vec<ShaderRecord>,
    globals: BTreeMap<u32, RootArgument>,
    top_level: Option<WrappedPointer>,
    table: Option<ShaderTable>,
}

impl RtBindings {
    pub fn new(ray_generation: impl Into<String>) -> Self {
        Self {
            ray_generation: ShaderRecord::new(ray_generation, Vec::new()),
            misses: Vec::new(),
            hit_groups: Vec::new(),
            globals: BTreeMap::new(),
            top_level: None,
            table: None,
        }
    }

    pub fn set_ray_generation_arguments(&mut self, arguments: Vec<LocalArgument>) {
        self.ray_generation.arguments = arguments;
    }

    /// Appends a miss record and returns its index.
    pub fn add_miss(&mut self, export: impl Into<String>, arguments: Vec<LocalArgument>) -> u32 {
        self.misses.push(ShaderRecord::new(export, arguments));
        self.misses.len() as u32 - 1
    }

    /// Appends a hit-group record and returns its index, the value instances use as
    /// their hit-group offset.
    pub fn add_hit_group(
        &mut self,
        export: impl Into<String>,
        arguments: Vec<LocalArgument>,
    ) -> u32 {
        self.hit_groups.push(ShaderRecord::new(export, arguments));
        self.hit_groups.len() as u32 - 1
    }

    /// Drops the miss and hit-group records. Globals, the top level, and the
    /// last written table are kept.
    pub fn clear_records(&mut self) {
        self.misses.clear();
        self.hit_groups.clear();
    }

    /// Replaces hit-group record `index`.
    pub fn set_hit_group(&mut self, index: u32, record: ShaderRecord) {
        if let Some(slot) = self.hit_groups.get_mut(index as usize) {
            *slot = record;
        } else {
            warn!(index, "hit-group record out of range");
        }
    }

    /// Binds `argument` at root `slot` for every dispatch with these bindings.
    ///
    /// Slots below [`root_slots::FIRST_USER`] belong to the context and are ignored.
    pub fn set_global(&mut self, slot: u32, argument: RootArgument) {
        if slot < root_slots::FIRST_USER {
            warn!(slot, "root slot is reserved by the context");
            return;
        }
        self.globals.insert(slot, argument);
    }

    pub fn globals(&self) -> impl Iterator<Item = (u32, &RootArgument)> {
        self.globals.iter().map(|(slot, arg)| (*slot, arg))
    }

    pub fn set_top_level(&mut self, top_level: WrappedPointer) {
        self.top_level = Some(top_level);
    }

    pub fn top_level(&self) -> Option<WrappedPointer> {
        self.top_level
    }

    pub fn hit_group_count(&self) -> u32 {
        self.hit_groups.len() as u32
    }

    pub fn miss_count(&self) -> u32 {
        self.misses.len() as u32
    }

    /// The table written by the last [`RtBindings::apply`].
    pub fn shader_table(&self) -> Result<&ShaderTable> {
        self.table.as_ref().ok_or(RtError::NotPrepared("shader binding table"))
    }

    /// Writes the records into a fresh upload buffer using `state`'s identifiers.
    ///
    /// The previous table buffer, if any, is released; the caller must have waited
    /// for dispatches that read it.
    #[tracing::instrument(skip_all, fields(state = state.label()))]
    pub fn apply(&mut self, ctx: &RtContext, state: &RtState) -> Result<()> {
        let ray_generation_stride = record_stride(std::slice::from_ref(&self.ray_generation));
        let miss_stride = record_stride(&self.misses);
        let hit_stride = record_stride(&self.hit_groups);

        let ray_generation_size = ray_generation_stride;
        let miss_start = align_up(ray_generation_size, SHADER_TABLE_ALIGNMENT);
        let miss_size = miss_stride * self.misses.len() as u64;
        let hit_start = align_up(miss_start + miss_size, SHADER_TABLE_ALIGNMENT);
        let hit_size = hit_stride * self.hit_groups.len() as u64;
        let total = align_up(hit_start + hit_size, SHADER_TABLE_ALIGNMENT);

        let mut bytes = Vec::with_capacity(total as usize);
        self.ray_generation.write(state, ray_generation_stride, &mut bytes)?;
        bytes.resize(miss_start as usize, 0);
        for record in &self.misses {
            record.write(state, miss_stride, &mut bytes)?;
        }
        bytes.resize(hit_start as usize, 0);
        for record in &self.hit_groups {
            record.write(state, hit_stride, &mut bytes)?;
        }
        bytes.resize(total as usize, 0);

        let device = ctx.device();
        let buffer = device.create_resource(&ResourceDesc::upload_buffer(
            format!("{} Shader Table", state.label()),
            total,
        ))?;
        device.write_buffer(&buffer, 0, &bytes)?;

        let base = buffer.gpu_address;
        let table = ShaderTable {
            ray_generation: ShaderTableRange {
                start: base,
                size: ray_generation_size,
                stride: ray_generation_stride,
            },
            miss: ShaderTableRange {
                start: base + miss_start,
                size: miss_size,
                stride: miss_stride,
            },
            hit_group: ShaderTableRange {
                start: base + hit_start,
                size: hit_size,
                stride: hit_stride,
            },
            buffer,
        };

        debug!(
            bytes = total,
            misses = self.misses.len(),
            hit_groups = self.hit_groups.len(),
            hit_stride,
            "shader table written"
        );

        if let Some(previous) = self.table.replace(table) {
            device.release(&previous.buffer);
        }
        Ok(())
    }

    /// Returns the table buffer to the device.
    pub fn release(self, device: &dyn RtDevice) {
        if let Some(table) = self.table {
            device.release(&table.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_align_arguments() {
        let record = ShaderRecord::new(
            "hit",
            vec![
                LocalArgument::Constants(vec![7]),
                LocalArgument::Pointer(WrappedPointer::Emulated { slot: 3 }),
            ],
        );
        // 32 identifier + 4 constant + 4 padding + 8 pointer
        assert_eq!(record.size(), 48);
        assert_eq!(record_stride(&[record]), 64);
    }

    #[test]
    fn empty_tables_use_identifier_stride() {
        assert_eq!(record_stride(&[]), 32);
        let bare = ShaderRecord::new("miss", Vec::new());
        assert_eq!(record_stride(&[bare]), 32);
    }

    #[test]
    fn reserved_globals_are_ignored() {
        let mut bindings = RtBindings::new("ray_generation");
        bindings.set_global(root_slots::TOP_LEVEL, RootArgument::ConstantBuffer(1));
        bindings.set_global(root_slots::FIRST_USER, RootArgument::ConstantBuffer(2));

        let globals: Vec<_> = bindings.globals().collect();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].0, root_slots::FIRST_USER);
    }

    #[test]
    fn table_requires_apply() {
        let bindings = RtBindings::new("ray_generation");
        assert!(matches!(
            bindings.shader_table(),
            Err(RtError::NotPrepared(_))
        ));
    }

    #[test]
    fn record_indices_are_sequential() {
        let mut bindings = RtBindings::new("ray_generation");
        assert_eq!(bindings.add_miss("miss", vec![]), 0);
        assert_eq!(bindings.add_hit_group("a", vec![]), 0);
        assert_eq!(bindings.add_hit_group("b", vec![]), 1);
        assert_eq!(bindings.hit_group_count(), 2);
        assert_eq!(bindings.miss_count(), 1);
    }
}
