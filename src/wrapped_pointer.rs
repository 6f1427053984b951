//! Wrapped pointers: one 64-bit handle that means "this buffer" on both paths.
//!
//! Hardware raytracing follows GPU virtual addresses natively, so a wrapped pointer
//! there is just the address. The emulated path cannot chase raw addresses from a
//! compute kernel; instead it keeps a device-visible indirection table and the
//! pointer carries a slot in that table:
//!
//! ```text
//!   Hardware:  WrappedPointer::Address(0x1_0000_2300) ──────────────▶ buffer
//!
//!   Emulated:  WrappedPointer::Emulated { slot: 2 }
//!                          │
//!                          ▼
//!              ┌──────────────────────────────────────────┐
//!   table:     │ 0: addr, stride, count, resource         │
//!              │ 1: addr, stride, count, resource         │
//!              │ 2: addr, stride, count, resource  ───────┼──▶ buffer
//!              └──────────────────────────────────────────┘
//! ```
//!
//! Shader records and instance records store [`WrappedPointer::to_bits`], so
//! shader-side code is written once against an opaque 64-bit value.

use std::collections::HashMap;

use tracing::debug;

use crate::device::RtDevice;
use crate::error::{Result, RtError, TableKind};
use crate::resource::{GpuVirtualAddress, Resource, ResourceDesc, ResourceId};

/// Opaque buffer reference handed to shader code.
///
/// Valid only while the backing resource lives, and only within the context that
/// created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WrappedPointer {
    /// Direct GPU virtual address (hardware path).
    Address(GpuVirtualAddress),
    /// Slot in the indirection table (emulated path).
    Emulated { slot: u32 },
}

impl WrappedPointer {
    /// The 64-bit value written into GPU records.
    ///
    /// Emulated pointers keep the slot in the low 32 bits and a byte offset (always
    /// zero here) in the high 32 bits.
    pub fn to_bits(self) -> u64 {
        match self {
            WrappedPointer::Address(address) => address,
            WrappedPointer::Emulated { slot } => slot as u64,
        }
    }

    /// Indirection table slot, if this is an emulated pointer.
    pub fn table_slot(self) -> Option<u32> {
        match self {
            WrappedPointer::Address(_) => None,
            WrappedPointer::Emulated { slot } => Some(slot),
        }
    }
}

/// One indirection table entry as the emulation kernels read it (32 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndirectionEntry {
    pub address: u64,
    pub stride: u32,
    pub element_count: u32,
    pub resource: u64,
    pub _reserved: u64,
}

/// CPU-side view of an indirection table slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectionRecord {
    pub slot: u32,
    pub resource: ResourceId,
    pub address: GpuVirtualAddress,
    /// Bytes per element.
    pub stride: u32,
    pub element_count: u32,
}

impl IndirectionRecord {
    fn to_entry(self) -> IndirectionEntry {
        IndirectionEntry {
            address: self.address,
            stride: self.stride,
            element_count: self.element_count,
            resource: self.resource.0,
            _reserved: 0,
        }
    }
}

/// What a wrapped pointer resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedPointer {
    Address(GpuVirtualAddress),
    Table(IndirectionRecord),
}

impl ResolvedPointer {
    /// GPU address of the referenced buffer.
    pub fn address(&self) -> GpuVirtualAddress {
        match self {
            ResolvedPointer::Address(address) => *address,
            ResolvedPointer::Table(record) => record.address,
        }
    }
}

fn packed_stride(resource: &Resource, element_count: u32) -> u32 {
    if element_count > 0 {
        (resource.size() / element_count as u64) as u32
    } else {
        0
    }
}

/// Device-visible table backing emulated wrapped pointers.
///
/// Slots are allocation-only, like the descriptor heap. Wrapping a resource that
/// already has a slot updates that slot in place unless a new slot is requested,
/// and [`IndirectionTable::replace`] hands an issued slot to another resource.
#[derive(Debug)]
pub struct IndirectionTable {
    buffer: Resource,
    capacity: u32,
    records: Vec<IndirectionRecord>,
    by_resource: HashMap<ResourceId, u32>,
}

impl IndirectionTable {
    /// Size of one entry in the table buffer.
    pub const ENTRY_SIZE: u64 = std::mem::size_of::<IndirectionEntry>() as u64;

    /// Creates the backing buffer on `device`.
    pub fn new(device: &dyn RtDevice, capacity: u32) -> Result<Self> {
        let buffer = device.create_resource(&ResourceDesc::upload_buffer(
            "Indirection Table",
            capacity.max(1) as u64 * Self::ENTRY_SIZE,
        ))?;

        Ok(Self {
            buffer,
            capacity,
            records: Vec::new(),
            by_resource: HashMap::new(),
        })
    }

    /// Records `resource` with `element_count` elements and returns its pointer.
    ///
    /// The stride is the buffer size divided by `element_count`, which only holds
    /// for tightly packed buffers; see [`IndirectionTable::wrap_with_stride`].
    ///
    /// # Errors
    ///
    /// [`RtError::Exhausted`] when a new slot is needed and none is left.
    pub fn wrap(
        &mut self,
        device: &dyn RtDevice,
        resource: &Resource,
        element_count: u32,
        new_slot: bool,
    ) -> Result<WrappedPointer> {
        let stride = packed_stride(resource, element_count);
        self.wrap_with_stride(device, resource, element_count, stride, new_slot)
    }

    /// Like [`IndirectionTable::wrap`] with an explicit element stride in bytes.
    pub fn wrap_with_stride(
        &mut self,
        device: &dyn RtDevice,
        resource: &Resource,
        element_count: u32,
        stride: u32,
        new_slot: bool,
    ) -> Result<WrappedPointer> {
        let existing = if new_slot {
            None
        } else {
            self.by_resource.get(&resource.id).copied()
        };

        let slot = match existing {
            Some(slot) => slot,
            None => {
                if self.records.len() as u32 >= self.capacity {
                    return Err(RtError::Exhausted {
                        table: TableKind::IndirectionTable,
                        capacity: self.capacity,
                    });
                }
                self.records.len() as u32
            }
        };

        self.write(device, slot, resource, element_count, stride)?;
        debug!(
            slot,
            resource = %resource.id,
            label = resource.label(),
            element_count,
            updated = existing.is_some(),
            "wrapped pointer"
        );
        Ok(WrappedPointer::Emulated { slot })
    }

    /// Points an issued slot at `resource`, forgetting the resource it held.
    ///
    /// Pointers already written into GPU records keep working and now reach the
    /// new resource.
    ///
    /// # Errors
    ///
    /// [`RtError::UnknownPointer`] when `slot` was never issued.
    pub fn replace(
        &mut self,
        device: &dyn RtDevice,
        slot: u32,
        resource: &Resource,
        element_count: u32,
        stride: u32,
    ) -> Result<WrappedPointer> {
        let previous = self
            .records
            .get(slot as usize)
            .map(|record| record.resource)
            .ok_or(RtError::UnknownPointer(slot as u64))?;
        if self.by_resource.get(&previous) == Some(&slot) {
            self.by_resource.remove(&previous);
        }

        self.write(device, slot, resource, element_count, stride)?;
        debug!(
            slot,
            resource = %resource.id,
            %previous,
            label = resource.label(),
            element_count,
            "replaced pointer"
        );
        Ok(WrappedPointer::Emulated { slot })
    }

    fn write(
        &mut self,
        device: &dyn RtDevice,
        slot: u32,
        resource: &Resource,
        element_count: u32,
        stride: u32,
    ) -> Result<()> {
        let record = IndirectionRecord {
            slot,
            resource: resource.id,
            address: resource.gpu_address,
            stride,
            element_count,
        };

        if slot as usize == self.records.len() {
            self.records.push(record);
        } else {
            self.records[slot as usize] = record;
        }
        self.by_resource.insert(resource.id, slot);

        device.write_buffer(
            &self.buffer,
            slot as u64 * Self::ENTRY_SIZE,
            bytemuck::bytes_of(&record.to_entry()),
        )
    }

    pub fn resolve(&self, slot: u32) -> Option<&IndirectionRecord> {
        self.records.get(slot as usize)
    }

    /// Slot currently associated with `resource`, if any.
    pub fn slot_of(&self, resource: ResourceId) -> Option<u32> {
        self.by_resource.get(&resource).copied()
    }

    pub fn len(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The GPU buffer the emulation kernels read.
    pub fn buffer(&self) -> &Resource {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingDevice;

    fn buffer(device: &RecordingDevice, label: &str, size: u64) -> Resource {
        device
            .create_resource(&ResourceDesc::buffer(label, size))
            .unwrap()
    }

    #[test]
    fn entry_is_32_bytes() {
        assert_eq!(IndirectionTable::ENTRY_SIZE, 32);
    }

    #[test]
    fn distinct_resources_get_distinct_slots() {
        let device = RecordingDevice::emulated_only();
        let mut table = IndirectionTable::new(&device, 8).unwrap();
        let a = buffer(&device, "a", 1024);
        let b = buffer(&device, "b", 512);

        let pa = table.wrap(&device, &a, 256, false).unwrap();
        let pb = table.wrap(&device, &b, 128, false).unwrap();
        assert_ne!(pa, pb);

        let ra = table.resolve(pa.table_slot().unwrap()).unwrap();
        assert_eq!((ra.resource, ra.element_count, ra.stride), (a.id, 256, 4));
        let rb = table.resolve(pb.table_slot().unwrap()).unwrap();
        assert_eq!((rb.resource, rb.element_count), (b.id, 128));
    }

    #[test]
    fn rewrapping_updates_in_place() {
        let device = RecordingDevice::emulated_only();
        let mut table = IndirectionTable::new(&device, 8).unwrap();
        let a = buffer(&device, "a", 1024);

        let first = table.wrap(&device, &a, 256, false).unwrap();
        let second = table.wrap(&device, &a, 128, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(0).unwrap().element_count, 128);

        let fresh = table.wrap(&device, &a, 64, true).unwrap();
        assert_eq!(fresh, WrappedPointer::Emulated { slot: 1 });
        assert_eq!(table.slot_of(a.id), Some(1));
    }

    #[test]
    fn entries_are_written_to_the_table_buffer() {
        let device = RecordingDevice::emulated_only();
        let mut table = IndirectionTable::new(&device, 4).unwrap();
        let a = buffer(&device, "a", 96);
        let b = buffer(&device, "b", 144);
        table.wrap(&device, &a, 24, false).unwrap();
        table.wrap(&device, &b, 36, false).unwrap();

        let bytes = device.read_buffer(table.buffer()).unwrap();
        let entries: &[IndirectionEntry] = bytemuck::cast_slice(&bytes[..64]);
        assert_eq!(entries[0].address, a.gpu_address);
        assert_eq!(entries[0].element_count, 24);
        assert_eq!(entries[1].address, b.gpu_address);
        assert_eq!(entries[1].element_count, 36);
        assert_eq!(entries[1].stride, 4);
    }

    #[test]
    fn exhaustion_is_reported() {
        let device = RecordingDevice::emulated_only();
        let mut table = IndirectionTable::new(&device, 1).unwrap();
        let a = buffer(&device, "a", 16);
        let b = buffer(&device, "b", 16);
        table.wrap(&device, &a, 4, false).unwrap();

        let err = table.wrap(&device, &b, 4, false).unwrap_err();
        assert!(matches!(
            err,
            RtError::Exhausted {
                table: TableKind::IndirectionTable,
                capacity: 1
            }
        ));
        // Updating an existing slot needs no capacity.
        assert!(table.wrap(&device, &a, 2, false).is_ok());
    }

    #[test]
    fn explicit_stride_ignores_padding() {
        let device = RecordingDevice::emulated_only();
        let mut table = IndirectionTable::new(&device, 4).unwrap();
        let padded = buffer(&device, "padded", 1280);

        table.wrap_with_stride(&device, &padded, 24, 48, false).unwrap();
        assert_eq!(table.resolve(0).unwrap().stride, 48);

        let bytes = device.read_buffer(table.buffer()).unwrap();
        let entries: &[IndirectionEntry] = bytemuck::cast_slice(&bytes[..32]);
        assert_eq!(entries[0].stride, 48);
    }

    #[test]
    fn replaced_slot_moves_to_the_new_resource() {
        let device = RecordingDevice::emulated_only();
        let mut table = IndirectionTable::new(&device, 1).unwrap();
        let old = buffer(&device, "old", 256);
        let new = buffer(&device, "new", 512);

        let pointer = table.wrap(&device, &old, 4, false).unwrap();
        let replaced = table.replace(&device, 0, &new, 8, 64).unwrap();
        assert_eq!(replaced, pointer);
        assert_eq!(table.len(), 1);
        assert_eq!(table.slot_of(old.id), None);
        assert_eq!(table.slot_of(new.id), Some(0));

        let record = table.resolve(0).unwrap();
        assert_eq!(
            (record.resource, record.address, record.element_count, record.stride),
            (new.id, new.gpu_address, 8, 64)
        );
        assert!(matches!(
            table.replace(&device, 1, &new, 8, 64),
            Err(RtError::UnknownPointer(1))
        ));
    }

    #[test]
    fn pointer_bits() {
        assert_eq!(WrappedPointer::Address(0xDEAD_0000).to_bits(), 0xDEAD_0000);
        assert_eq!(WrappedPointer::Emulated { slot: 9 }.to_bits(), 9);
        assert_eq!(WrappedPointer::Address(1).table_slot(), None);
    }
}
