//! Device memory suballocation.
//!
//! Vulkan drivers cap the number of live `VkDeviceMemory` allocations at a
//! few thousand, so the renderer never allocates per-object. Instead this
//! module multiplexes a small number of large device allocations (slabs)
//! into many client allocations (slices):
//!
//! - One [`MemType`] per driver-reported memory type, in driver order.
//! - One [`Heap`] per `(memory type, buffer usage)` pair, created lazily.
//!   The zero-usage heap backs images and other non-buffer objects.
//! - Each heap owns slabs; each slab keeps a sorted free-region map that
//!   slices are carved out of and returned to.
//!
//! All driver access goes through the [`MemoryDevice`] facade, which keeps
//! the allocator testable without a GPU. The allocator is single-threaded
//! by contract; `&mut self` on every entry point makes that structural.

use std::{ffi::c_void, ptr::NonNull, time::Instant};

use arrayvec::ArrayVec;
use ash::vk;
use log::{debug, error, trace};
use smallvec::{smallvec, SmallVec};

use super::error::Error;

// Multiplication factor for new slab allocations. Each new slab is this
// factor times the size of the previous one, so heaps that see sustained
// demand converge on few, large slabs.
const SLAB_GROWTH_RATE: vk::DeviceSize = 4;

// Floor for slab sizes, so the first few small allocations don't each get
// their own tiny device allocation. (1 MiB)
const MIN_SLAB_SIZE: vk::DeviceSize = 1 << 20;

// Ceiling for slab sizes, to bound the cost of unbounded growth. A single
// allocation larger than this bypasses the heap entirely and gets a
// dedicated slab. (512 MiB)
const MAX_SLAB_SIZE: vk::DeviceSize = 1 << 29;

// Free regions smaller than this are dropped from the free-space map
// instead of inserted, so teardown-heavy workloads with lots of small
// buffers don't thrash the region list. (1 KiB)
const MIN_REGION_SIZE: vk::DeviceSize = 1 << 10;

const fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    (value + alignment - 1) / alignment * alignment
}

/// A driver-reported memory type, as surfaced by [`MemoryDevice::memory_types`].
#[derive(Clone, Copy, Debug)]
pub struct MemoryTypeInfo {
    /// Index to pass back to [`MemoryDevice::allocate_memory`].
    pub index: u32,
    /// The device heap this type allocates from.
    pub heap_index: u32,
    pub flags: vk::MemoryPropertyFlags,
}

/// The slice of the driver used by the allocator.
///
/// Implemented over the real `ash::Device` by [`super::Device`]; tests
/// substitute an in-process fake. Failures surface as raw [`vk::Result`]
/// values, which the allocator wraps into [`Error`].
pub trait MemoryDevice {
    /// Memory types in driver-reported (preference) order.
    fn memory_types(&self) -> Vec<MemoryTypeInfo>;

    /// `VkPhysicalDeviceLimits::bufferImageGranularity`. Enforced as an
    /// alignment floor on every slice.
    fn buffer_image_granularity(&self) -> vk::DeviceSize;

    fn allocate_memory(
        &self,
        type_index: u32,
        size: vk::DeviceSize,
    ) -> Result<vk::DeviceMemory, vk::Result>;

    /// Also implicitly unmaps the memory if it was mapped.
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Creates an `EXCLUSIVE`-sharing buffer and returns it together with
    /// its memory requirements.
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<(vk::Buffer, vk::MemoryRequirements), vk::Result>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Binds the buffer to the memory at offset 0.
    fn bind_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<(), vk::Result>;

    /// Maps the whole allocation and returns the base pointer.
    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>, vk::Result>;
}

/// A contiguous range of free bytes within a slab. `end` is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Region {
    start: vk::DeviceSize,
    end: vk::DeviceSize,
}

impl Region {
    fn len(self) -> vk::DeviceSize {
        self.end - self.start
    }

    fn fits(self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> bool {
        align_up(self.start, alignment) + size <= self.end
    }
}

/// One device allocation, partitioned into slices via the free-region map.
///
/// The region list is a sorted vector rather than a tree: slab-local
/// fragmentation stays modest in practice and a linear scan over a dozen
/// entries is cheaper than chasing pointers.
struct Slab {
    memory: vk::DeviceMemory,
    /// Bytes addressable by slices. The device allocation behind `memory`
    /// may be larger (buffer requirements), but the region map never
    /// reaches past `size`.
    size: vk::DeviceSize,
    /// Bytes handed out to live slices. Free regions below
    /// [`MIN_REGION_SIZE`] get elided from the map on insertion, so
    /// `used + total_free <= size` rather than strict equality.
    used: vk::DeviceSize,
    /// Allocated for exactly one oversized slice; destroyed when that
    /// slice is freed and never entered into the heap's search list.
    dedicated: bool,
    regions: SmallVec<[Region; 8]>,
    /// Spans the whole slab; only present on buffer-usage heaps.
    buffer: vk::Buffer,
    /// Mapped base pointer; only present on host-visible memory types.
    data: Option<NonNull<c_void>>,
}

impl Slab {
    fn alloc(
        device: &dyn MemoryDevice,
        info: MemoryTypeInfo,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
        dedicated: bool,
    ) -> Result<Self, Error> {
        let mut slab = Slab {
            memory: vk::DeviceMemory::null(),
            size,
            used: 0,
            dedicated,
            regions: smallvec![Region { start: 0, end: size }],
            buffer: vk::Buffer::null(),
            data: None,
        };

        debug!(
            "allocating {} bytes of memory type {:?} (id {}) in device heap {}",
            size, info.flags, info.index, info.heap_index
        );

        let mut allocation_size = size;
        if !usage.is_empty() {
            let (buffer, requirements) = match device.create_buffer(size, usage) {
                Ok(created) => created,
                Err(err) => {
                    slab.release(device);
                    return Err(err.into());
                }
            };
            slab.buffer = buffer;

            // The driver may demand a larger allocation than the slab
            // exposes; the extra tail stays unreachable because the region
            // map is bounded by `size`.
            allocation_size = requirements.size;

            if requirements.memory_type_bits & (1 << info.index) == 0 {
                error!(
                    "memory type {} does not support buffer usage {:?}",
                    info.index, usage
                );
                slab.release(device);
                return Err(Error::IncompatibleBufferUsage {
                    type_index: info.index,
                    usage,
                });
            }
        }

        slab.memory = match device.allocate_memory(info.index, allocation_size) {
            Ok(memory) => memory,
            Err(err) => {
                slab.release(device);
                return Err(err.into());
            }
        };

        if info.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            slab.data = match device.map_memory(slab.memory) {
                Ok(data) => Some(data),
                Err(err) => {
                    slab.release(device);
                    return Err(err.into());
                }
            };
        }

        if !usage.is_empty() {
            if let Err(err) = device.bind_buffer(slab.buffer, slab.memory) {
                slab.release(device);
                return Err(err.into());
            }
        }

        Ok(slab)
    }

    /// Destroys the slab's driver objects. Teardown is known to take
    /// milliseconds on some drivers, hence the timing in the log line.
    fn release(self, device: &dyn MemoryDevice) {
        assert_eq!(self.used, 0, "slab released with outstanding slices");

        let start = Instant::now();
        if self.buffer != vk::Buffer::null() {
            device.destroy_buffer(self.buffer);
        }
        if self.memory != vk::DeviceMemory::null() {
            // also implicitly unmaps
            device.free_memory(self.memory);
        }

        debug!(
            "freeing slab of size {} took {} us",
            self.size,
            start.elapsed().as_micros()
        );
    }

    /// Returns `region` to the free map, coalescing with neighbours.
    ///
    /// Only forward merging is attempted on the tail-extension path: a
    /// region that could merge backwards would already have been merged
    /// when its predecessor was inserted, so the map stays maximally
    /// coalesced by construction.
    fn insert_region(&mut self, region: Region) {
        if region.start == region.end {
            return;
        }

        let big_enough = region.len() >= MIN_REGION_SIZE;

        for i in 0..self.regions.len() {
            let r = self.regions[i];

            if r.end == region.start {
                // Tail of an existing region; extend it, then keep folding
                // in successors for as long as they stay contiguous.
                self.regions[i].end = region.end;
                while i + 1 < self.regions.len()
                    && self.regions[i].end == self.regions[i + 1].start
                {
                    self.regions[i].end = self.regions[i + 1].end;
                    self.regions.remove(i + 1);
                }
                return;
            }

            if r.start == region.end {
                self.regions[i].start = region.start;
                return;
            }

            if r.start > region.start {
                // Disconnected region belonging before `r`. Undersized
                // regions are dropped rather than inserted; the bytes stay
                // unreachable until a neighbouring slice is freed.
                if big_enough {
                    self.regions.insert(i, region);
                }
                return;
            }
        }

        // Comes after (and disconnected from) everything in the map.
        if big_enough {
            self.regions.push(region);
        }
    }

    /// Best-fit search: the smallest region that can hold `size` bytes at
    /// `alignment`, earliest such region on ties.
    fn best_fit(&self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, region) in self.regions.iter().enumerate() {
            if !region.fits(size, alignment) {
                continue;
            }
            match best {
                Some(b) if self.regions[b].len() <= region.len() => {}
                _ => best = Some(i),
            }
        }
        best
    }
}

/// Identifies a slab within its heap. Pooled slabs are append-only until
/// teardown and dedicated slots are only recycled after their slice is
/// freed, so an index stays valid for the lifetime of any slice into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlabId {
    Pooled(u32),
    Dedicated(u32),
}

/// Opaque back-pointer from a slice to its slab.
#[derive(Clone, Copy, Debug)]
struct SlabRef {
    type_index: u32,
    heap_index: u32,
    slab: SlabId,
}

/// A caller-owned sub-range of a slab.
///
/// The caller may hand the slice to other parts of the renderer for use,
/// but must return it to [`DeviceAllocator::free`] before the device is
/// destroyed. `offset` is only meaningful as an argument to driver binds.
#[must_use]
#[derive(Debug)]
pub struct MemorySlice {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    slab: SlabRef,
}

/// A buffer-backed slice: the backing buffer spans the whole slab, so the
/// slice's bytes live at `offset` within it.
#[must_use]
#[derive(Debug)]
pub struct BufferSlice {
    pub slice: MemorySlice,
    pub buffer: vk::Buffer,
    /// Host pointer to the slice's first byte, when the memory type is
    /// host-visible.
    pub data: Option<NonNull<c_void>>,
}

struct Heap {
    usage: vk::BufferUsageFlags,
    slabs: Vec<Slab>,
    /// Slot arena for dedicated slabs; `None` slots are recycled through
    /// `vacant_slots`. Kept out of `slabs` so the best-fit scan and the
    /// growth policy never see them.
    dedicated: Vec<Option<Slab>>,
    vacant_slots: Vec<u32>,
}

impl Heap {
    fn new(usage: vk::BufferUsageFlags) -> Self {
        Self {
            usage,
            slabs: Vec::new(),
            dedicated: Vec::new(),
            vacant_slots: Vec::new(),
        }
    }

    fn slab(&self, id: SlabId) -> &Slab {
        match id {
            SlabId::Pooled(index) => &self.slabs[index as usize],
            SlabId::Dedicated(slot) => self.dedicated[slot as usize]
                .as_ref()
                .expect("stale dedicated slab reference"),
        }
    }

    fn slab_mut(&mut self, id: SlabId) -> &mut Slab {
        match id {
            SlabId::Pooled(index) => &mut self.slabs[index as usize],
            SlabId::Dedicated(slot) => self.dedicated[slot as usize]
                .as_mut()
                .expect("stale dedicated slab reference"),
        }
    }

    /// Finds a free region able to hold `size` bytes at `alignment`,
    /// growing the heap by a new slab if the existing ones are too small
    /// or too fragmented.
    fn get_region(
        &mut self,
        device: &dyn MemoryDevice,
        info: MemoryTypeInfo,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<(SlabId, usize), Error> {
        // Very large requests are served directly from the device instead
        // of bothering the heap.
        if size > MAX_SLAB_SIZE {
            let slab = Slab::alloc(device, info, self.usage, size, true)?;
            let slot = match self.vacant_slots.pop() {
                Some(slot) => {
                    self.dedicated[slot as usize] = Some(slab);
                    slot
                }
                None => {
                    self.dedicated.push(Some(slab));
                    (self.dedicated.len() - 1) as u32
                }
            };
            return Ok((SlabId::Dedicated(slot), 0));
        }

        for (i, slab) in self.slabs.iter().enumerate() {
            if slab.size < size {
                continue;
            }
            if let Some(best) = slab.best_fit(size, alignment) {
                return Ok((SlabId::Pooled(i as u32), best));
            }
        }

        // No fit anywhere; grow. Scale from the newest slab so repeated
        // growth converges on few, large allocations.
        let base = size.max(self.slabs.last().map_or(0, |slab| slab.size));
        let slab_size = (SLAB_GROWTH_RATE * base).clamp(MIN_SLAB_SIZE, MAX_SLAB_SIZE);
        assert!(slab_size >= size);

        let slab = Slab::alloc(device, info, self.usage, slab_size, false)?;
        self.slabs.push(slab);
        Ok((SlabId::Pooled((self.slabs.len() - 1) as u32), 0))
    }
}

struct MemType {
    info: MemoryTypeInfo,
    heaps: Vec<Heap>,
}

impl MemType {
    /// Returns the index of the heap for `usage`, creating it on first use.
    fn find_heap(&mut self, usage: vk::BufferUsageFlags) -> usize {
        if let Some(index) = self.heaps.iter().position(|heap| heap.usage == usage) {
            return index;
        }
        self.heaps.push(Heap::new(usage));
        self.heaps.len() - 1
    }
}

/// The suballocator for one device. Multiple allocators may coexist, one
/// per device; there is no global state.
pub struct DeviceAllocator {
    types: ArrayVec<MemType, { vk::MAX_MEMORY_TYPES }>,
    granularity: vk::DeviceSize,
}

impl DeviceAllocator {
    pub fn new(device: &dyn MemoryDevice) -> Self {
        let types = device
            .memory_types()
            .into_iter()
            .map(|info| MemType {
                info,
                heaps: Vec::new(),
            })
            .collect();

        Self {
            types,
            granularity: device.buffer_image_granularity().max(1),
        }
    }

    /// Tears everything down, bottom-up. Every slice must have been freed;
    /// a slab with outstanding slices fails the `used == 0` assertion.
    pub fn destroy(&mut self, device: &dyn MemoryDevice) {
        for ty in self.types.drain(..) {
            for heap in ty.heaps {
                for slab in heap.slabs {
                    slab.release(device);
                }
                for slot in &heap.dedicated {
                    assert!(slot.is_none(), "dedicated slab with outstanding slices at teardown");
                }
            }
        }
    }

    /// Memory for images and other objects with driver-computed
    /// requirements. Served from the generic (zero-usage) heap of the
    /// best matching memory type.
    pub fn allocate_generic(
        &mut self,
        device: &dyn MemoryDevice,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<MemorySlice, Error> {
        let type_index = self.find_best_memtype(flags, Some(&requirements))?;
        let heap_index = self.types[type_index].find_heap(vk::BufferUsageFlags::empty());
        self.slice_heap(
            device,
            type_index,
            heap_index,
            requirements.size,
            requirements.alignment,
        )
    }

    /// A buffer slice: memory plus a backing buffer handle and, on
    /// host-visible types, a mapped pointer to the slice's bytes.
    pub fn allocate_buffer(
        &mut self,
        device: &dyn MemoryDevice,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<BufferSlice, Error> {
        assert!(!usage.is_empty(), "buffer allocations need a usage mask");

        let type_index = self.find_best_memtype(flags, None)?;
        let heap_index = self.types[type_index].find_heap(usage);
        let slice = self.slice_heap(device, type_index, heap_index, size, alignment)?;

        let slab = self.types[type_index].heaps[heap_index].slab(slice.slab.slab);
        let data = slab
            .data
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(slice.offset as usize)) });

        Ok(BufferSlice {
            buffer: slab.buffer,
            data,
            slice,
        })
    }

    /// Returns a slice to its slab. Dedicated slabs are destroyed on the
    /// spot; pooled ones get the range back in their free map.
    pub fn free(&mut self, device: &dyn MemoryDevice, slice: MemorySlice) {
        let SlabRef {
            type_index,
            heap_index,
            slab: slab_id,
        } = slice.slab;
        let heap = &mut self.types[type_index as usize].heaps[heap_index as usize];

        match slab_id {
            SlabId::Dedicated(slot) => {
                let mut slab = heap.dedicated[slot as usize]
                    .take()
                    .expect("dedicated slice freed twice");
                trace!(
                    "freeing slice {} + {} from dedicated slab of size {}",
                    slice.offset,
                    slice.size,
                    slab.size
                );
                assert!(slab.used >= slice.size);
                slab.used -= slice.size;
                slab.release(device);
                heap.vacant_slots.push(slot);
            }
            SlabId::Pooled(index) => {
                let slab = &mut heap.slabs[index as usize];
                trace!(
                    "freeing slice {} + {} from slab of size {}",
                    slice.offset,
                    slice.size,
                    slab.size
                );
                assert!(slab.used >= slice.size);
                slab.used -= slice.size;
                slab.insert_region(Region {
                    start: slice.offset,
                    end: slice.offset + slice.size,
                });
            }
        }
    }

    /// First memory type satisfying all of `flags` (and the requirements
    /// bitmask, when given). The driver reports types in preference order,
    /// so the first match is the best one.
    fn find_best_memtype(
        &self,
        flags: vk::MemoryPropertyFlags,
        requirements: Option<&vk::MemoryRequirements>,
    ) -> Result<usize, Error> {
        for (i, ty) in self.types.iter().enumerate() {
            if !ty.info.flags.contains(flags) {
                continue;
            }
            if let Some(requirements) = requirements {
                if requirements.memory_type_bits & (1 << ty.info.index) == 0 {
                    continue;
                }
            }
            return Ok(i);
        }

        error!("no memory type matches property flags {:?}", flags);
        Err(Error::NoMatchingMemoryType(flags))
    }

    fn slice_heap(
        &mut self,
        device: &dyn MemoryDevice,
        type_index: usize,
        heap_index: usize,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Result<MemorySlice, Error> {
        // Uniformly respecting the buffer/image granularity on every slice
        // is pessimistic, but means buffers and images can always share a
        // slab without further checks.
        let alignment = align_up(alignment.max(1), self.granularity);

        let ty = &mut self.types[type_index];
        let info = ty.info;
        let heap = &mut ty.heaps[heap_index];

        let (slab_id, region_index) = heap.get_region(device, info, size, alignment)?;
        let slab = heap.slab_mut(slab_id);

        let region = slab.regions.remove(region_index);
        let offset = align_up(region.start, alignment);
        let end = offset + size;

        trace!(
            "sub-allocating slice {} + {} from slab of size {}",
            offset,
            size,
            slab.size
        );

        // Alignment padding and the tail of the region go back in the map;
        // either may be empty or below the minimum region size.
        slab.insert_region(Region {
            start: region.start,
            end: offset,
        });
        slab.insert_region(Region {
            start: end,
            end: region.end,
        });

        slab.used += size;

        Ok(MemorySlice {
            memory: slab.memory,
            offset,
            size,
            slab: SlabRef {
                type_index: type_index as u32,
                heap_index: heap_index as u32,
                slab: slab_id,
            },
        })
    }
}
