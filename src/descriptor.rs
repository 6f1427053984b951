//! Bump allocation of slots in the shared, shader-visible descriptor heap.
//!
//! The heap is allocation-only: slots are never freed or compacted, so an index
//! stays valid for the lifetime of the context. Callers persist indices (per model,
//! per output texture) across frames and may re-register a resource at a slot they
//! already own by passing it back as an explicit index.
//!
//! ```text
//!  index:   0     1     2     3           capacity-1
//!         ┌─────┬─────┬─────┬─────┬─ ─ ─ ┬─────┐
//!  heap:  │ SRV │ SRV │ UAV │     │       │     │
//!         └─────┴─────┴─────┴─────┴─ ─ ─ ┴─────┘
//!                             ▲
//!                             allocated (high-water mark)
//! ```

use tracing::debug;

use crate::device::{DescriptorHeapDesc, DescriptorHeapInfo, RtDevice};
use crate::error::{Result, RtError, TableKind};
use crate::resource::{CpuDescriptorHandle, GpuDescriptorHandle};

/// Allocator over one descriptor heap.
#[derive(Debug)]
pub struct DescriptorAllocator {
    heap: DescriptorHeapInfo,
    allocated: u32,
}

impl DescriptorAllocator {
    /// Creates the heap on `device` and an empty allocator over it.
    pub fn new(device: &dyn RtDevice, label: &str, capacity: u32) -> Result<Self> {
        let heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            label: label.to_string(),
            capacity,
        })?;
        Ok(Self::from_heap(heap))
    }

    /// Wraps an existing heap. Nothing is considered allocated yet.
    pub fn from_heap(heap: DescriptorHeapInfo) -> Self {
        Self { heap, allocated: 0 }
    }

    /// Reserves a slot and returns its CPU handle and index.
    ///
    /// If `explicit` names a slot below the high-water mark, that slot is returned
    /// unchanged (re-registering a resource at a stable index). Any other value,
    /// including `None`, takes the next unused slot.
    ///
    /// # Errors
    ///
    /// [`RtError::Exhausted`] once every slot is taken. The high-water mark does not
    /// move and no existing slot is handed out again.
    pub fn allocate(&mut self, explicit: Option<u32>) -> Result<(CpuDescriptorHandle, u32)> {
        let index = match explicit {
            Some(index) if index < self.allocated => index,
            _ => {
                if self.allocated >= self.heap.capacity {
                    return Err(RtError::Exhausted {
                        table: TableKind::DescriptorHeap,
                        capacity: self.heap.capacity,
                    });
                }
                let index = self.allocated;
                self.allocated += 1;
                debug!(heap = %self.heap.label, index, "allocated descriptor");
                index
            }
        };

        Ok((self.cpu_handle(index), index))
    }

    /// CPU handle of slot `index`.
    pub fn cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        debug_assert!(index < self.heap.capacity);
        self.heap.cpu_start.offset(index, self.heap.increment)
    }

    /// GPU handle of slot `index`: heap base plus `index * increment`.
    pub fn gpu_handle(&self, index: u32) -> GpuDescriptorHandle {
        debug_assert!(index < self.heap.capacity);
        self.heap.gpu_start.offset(index, self.heap.increment)
    }

    /// Number of slots handed out so far.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    pub fn heap(&self) -> &DescriptorHeapInfo {
        &self.heap
    }
}
