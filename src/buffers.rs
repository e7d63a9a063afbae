//! Device buffer management.
//!
//! All device buffers are sub-allocations of one storage buffer (the device
//! heap) bound to every launch, so a buffer's device address is simply its
//! byte offset into the heap. Address 0 is never handed out and means null.

use std::marker::PhantomData;
use std::sync::{mpsc, Arc};

use bytemuck::Pod;
use log::{debug, trace};
use parking_lot::Mutex;
use rt_shared::{BufferView, RaytracerConfig};

use crate::context::GpuContext;
use crate::error::{RenderError, RenderResult};

/// Byte range inside the device heap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapBlock {
    pub offset: u64,
    pub size: u64,
}

impl HeapBlock {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// First-fit allocator over the heap address range. Free ranges are kept
/// sorted by offset and merged with their neighbours on release.
#[derive(Debug)]
pub struct HeapAllocator {
    capacity: u64,
    free: Vec<HeapBlock>,
}

impl HeapAllocator {
    pub fn new(capacity: u64) -> Self {
        let start = RaytracerConfig::HEAP_RESERVED_BYTES;
        let free = if capacity > start {
            vec![HeapBlock { offset: start, size: capacity - start }]
        } else {
            Vec::new()
        };
        Self { capacity, free }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|block| block.size).sum()
    }

    pub fn used_bytes(&self) -> u64 {
        self.capacity.saturating_sub(RaytracerConfig::HEAP_RESERVED_BYTES) - self.free_bytes()
    }

    pub fn alloc(&mut self, size: u64) -> Option<HeapBlock> {
        let size = align_up(size.max(1), RaytracerConfig::HEAP_ALIGNMENT);
        let slot = self.free.iter().position(|block| block.size >= size)?;

        let block = HeapBlock { offset: self.free[slot].offset, size };
        if self.free[slot].size == size {
            self.free.remove(slot);
        } else {
            self.free[slot].offset += size;
            self.free[slot].size -= size;
        }
        Some(block)
    }

    pub fn free(&mut self, block: HeapBlock) {
        let slot = self.free.partition_point(|free| free.offset < block.offset);
        debug_assert!(
            slot == self.free.len() || block.end() <= self.free[slot].offset,
            "double free of heap block {block:?}"
        );
        self.free.insert(slot, block);

        // Merge with the following range, then with the preceding one
        if slot + 1 < self.free.len() && self.free[slot].end() == self.free[slot + 1].offset {
            self.free[slot].size += self.free[slot + 1].size;
            self.free.remove(slot + 1);
        }
        if slot > 0 && self.free[slot - 1].end() == self.free[slot].offset {
            self.free[slot - 1].size += self.free[slot].size;
            self.free.remove(slot);
        }
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// The storage buffer every device address points into
pub struct DeviceHeap {
    context: Arc<GpuContext>,
    buffer: wgpu::Buffer,
    allocator: Mutex<HeapAllocator>,
}

impl DeviceHeap {
    pub fn new(context: Arc<GpuContext>, requested: u64) -> RenderResult<Arc<Self>> {
        let limits = context.device.limits();
        let capacity = requested
            .min(limits.max_storage_buffer_binding_size as u64)
            .min(limits.max_buffer_size)
            .min(u32::MAX as u64);
        let capacity = capacity / RaytracerConfig::HEAP_ALIGNMENT * RaytracerConfig::HEAP_ALIGNMENT;

        if capacity <= RaytracerConfig::HEAP_RESERVED_BYTES {
            return Err(RenderError::allocation(requested, "device limits leave no room for a heap"));
        }

        let (buffer, error) = context.capture_errors(|| {
            context.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Device Heap"),
                size: capacity,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        });
        if let Some(error) = error {
            return Err(RenderError::from_wgpu_allocation(capacity, error));
        }

        debug!("Device heap: {} MiB (requested {} MiB)", capacity >> 20, requested >> 20);

        Ok(Arc::new(Self {
            context,
            buffer,
            allocator: Mutex::new(HeapAllocator::new(capacity)),
        }))
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.allocator.lock().capacity()
    }

    pub fn used_bytes(&self) -> u64 {
        self.allocator.lock().used_bytes()
    }

    fn alloc_block(&self, size: u64) -> RenderResult<HeapBlock> {
        let mut allocator = self.allocator.lock();
        allocator.alloc(size).ok_or_else(|| {
            RenderError::allocation(
                size,
                format!("device heap exhausted ({} of {} bytes free)", allocator.free_bytes(), allocator.capacity()),
            )
        })
    }

    fn free_block(&self, block: HeapBlock) {
        self.allocator.lock().free(block);
    }

    /// Queue a host-to-heap write; the queue orders it before any later submission
    pub fn write(&self, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let remainder = bytes.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize;
        if remainder == 0 {
            self.context.queue.write_buffer(&self.buffer, offset, bytes);
        } else {
            let mut padded = bytes.to_vec();
            padded.resize(bytes.len() + wgpu::COPY_BUFFER_ALIGNMENT as usize - remainder, 0);
            self.context.queue.write_buffer(&self.buffer, offset, &padded);
        }
    }

    /// Copy heap bytes back to the host, blocking until the device is done
    pub fn read(&self, offset: u64, len: u64) -> RenderResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let device = &self.context.device;
        let copy_size = align_up(len, wgpu::COPY_BUFFER_ALIGNMENT);

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Heap Readback Buffer"),
            size: copy_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Heap Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, offset, &staging, 0, copy_size);
        self.context.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| RenderError::LaunchFailure("readback callback dropped".into()))?
            .map_err(|e| RenderError::LaunchFailure(format!("readback mapping failed: {e}")))?;

        let bytes = slice.get_mapped_range()[..len as usize].to_vec();
        staging.unmap();
        trace!("Read {len} bytes from heap offset {offset}");
        Ok(bytes)
    }

    /// Device-side copy between two heap ranges. Source and destination share
    /// one wgpu buffer, so the bytes pass through a transient transfer buffer.
    pub fn copy(&self, src: u64, dst: u64, len: u64) {
        if len == 0 {
            return;
        }
        let device = &self.context.device;
        let copy_size = align_up(len, wgpu::COPY_BUFFER_ALIGNMENT);

        let transfer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Heap Transfer Buffer"),
            size: copy_size,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Heap Copy Encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, src, &transfer, 0, copy_size);
        encoder.copy_buffer_to_buffer(&transfer, 0, &self.buffer, dst, copy_size);
        self.context.queue.submit(std::iter::once(encoder.finish()));
    }
}

/// Typed device address: where an array of `T` lives and how many elements it holds.
pub struct DevicePtr<T> {
    address: u32,
    count: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DevicePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DevicePtr<T> {}

impl<T> PartialEq for DevicePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.count == other.count
    }
}

impl<T> Eq for DevicePtr<T> {}

impl<T> std::fmt::Debug for DevicePtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DevicePtr<{}>({:#x}, {})", std::any::type_name::<T>(), self.address, self.count)
    }
}

impl<T> DevicePtr<T> {
    pub fn null() -> Self {
        Self { address: 0, count: 0, _marker: PhantomData }
    }

    #[cfg(test)]
    pub(crate) fn from_raw(address: u32, count: u32) -> Self {
        Self { address, count, _marker: PhantomData }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Address/count pair as stored in device records
    pub fn view(&self) -> BufferView {
        BufferView { address: self.address, count: self.count }
    }
}

/// Exclusively owned, resizable array of `T` in the device heap.
pub struct DeviceBuffer<T: Pod> {
    heap: Arc<DeviceHeap>,
    block: Option<HeapBlock>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceBuffer<T> {
    /// Unallocated buffer; its address is null until `alloc`
    pub fn new(heap: &Arc<DeviceHeap>) -> Self {
        Self { heap: heap.clone(), block: None, len: 0, _marker: PhantomData }
    }

    pub fn with_len(heap: &Arc<DeviceHeap>, len: usize) -> RenderResult<Self> {
        let mut buffer = Self::new(heap);
        buffer.alloc(len)?;
        Ok(buffer)
    }

    pub fn alloc_and_upload(heap: &Arc<DeviceHeap>, data: &[T]) -> RenderResult<Self> {
        let buffer = Self::with_len(heap, data.len())?;
        buffer.upload(data);
        Ok(buffer)
    }

    /// Allocate room for `len` elements. Zero elements leave the buffer null.
    pub fn alloc(&mut self, len: usize) -> RenderResult<()> {
        self.free();
        if len == 0 {
            return Ok(());
        }
        let size = (len * std::mem::size_of::<T>()) as u64;
        let block = self.heap.alloc_block(size)?;
        trace!("alloc {} x {} -> {:#x}", len, std::any::type_name::<T>(), block.offset);
        self.block = Some(block);
        self.len = len;
        Ok(())
    }

    /// Destructive: the old contents and address are gone afterwards
    pub fn resize(&mut self, len: usize) -> RenderResult<()> {
        self.alloc(len)
    }

    pub fn upload(&self, data: &[T]) {
        assert!(
            data.len() <= self.len,
            "upload of {} elements into device buffer of {}",
            data.len(),
            self.len
        );
        if let Some(block) = self.block {
            self.heap.write(block.offset, bytemuck::cast_slice(data));
        }
    }

    pub fn download(&self, out: &mut [T]) -> RenderResult<()> {
        assert!(
            out.len() <= self.len,
            "download of {} elements from device buffer of {}",
            out.len(),
            self.len
        );
        let Some(block) = self.block else {
            return Ok(());
        };
        let byte_len = std::mem::size_of_val(out) as u64;
        let bytes = self.heap.read(block.offset, byte_len)?;
        bytemuck::cast_slice_mut::<T, u8>(out).copy_from_slice(&bytes);
        Ok(())
    }

    pub fn to_vec(&self) -> RenderResult<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.download(&mut out)?;
        Ok(out)
    }

    pub fn free(&mut self) {
        if let Some(block) = self.block.take() {
            self.heap.free_block(block);
        }
        self.len = 0;
    }

    pub fn device_ptr(&self) -> DevicePtr<T> {
        DevicePtr {
            address: self.address(),
            count: self.len as u32,
            _marker: PhantomData,
        }
    }

    pub fn address(&self) -> u32 {
        self.block.map_or(0, |block| block.offset as u32)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_allocated(&self) -> bool {
        self.block.is_some()
    }

    pub fn size_in_bytes(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    pub fn heap(&self) -> &Arc<DeviceHeap> {
        &self.heap
    }
}

impl<T: Pod> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_never_null() {
        let mut allocator = HeapAllocator::new(1024);
        let a = allocator.alloc(3).unwrap();
        let b = allocator.alloc(20).unwrap();
        assert_eq!(a.offset, RaytracerConfig::HEAP_RESERVED_BYTES);
        assert_eq!(a.size, 16);
        assert_eq!(b.offset, a.end());
        assert_eq!(b.size, 32);
        assert_eq!(b.offset % RaytracerConfig::HEAP_ALIGNMENT, 0);
    }

    #[test]
    fn exhausted_heap_returns_none() {
        let mut allocator = HeapAllocator::new(64);
        assert!(allocator.alloc(48).is_some());
        assert!(allocator.alloc(16).is_none());
    }

    #[test]
    fn freed_ranges_coalesce() {
        let mut allocator = HeapAllocator::new(16 + 3 * 64);
        let a = allocator.alloc(64).unwrap();
        let b = allocator.alloc(64).unwrap();
        let c = allocator.alloc(64).unwrap();
        assert_eq!(allocator.free_bytes(), 0);

        allocator.free(a);
        allocator.free(c);
        assert!(allocator.alloc(128).is_none());

        allocator.free(b);
        assert_eq!(allocator.free_bytes(), 192);
        let whole = allocator.alloc(192).unwrap();
        assert_eq!(whole.offset, a.offset);
    }

    #[test]
    fn first_fit_reuses_earliest_hole() {
        let mut allocator = HeapAllocator::new(1024);
        let a = allocator.alloc(32).unwrap();
        let _b = allocator.alloc(32).unwrap();
        allocator.free(a);
        let c = allocator.alloc(16).unwrap();
        assert_eq!(c.offset, a.offset);
        assert_eq!(allocator.used_bytes(), 48);
    }

    #[test]
    fn null_device_ptr_view() {
        let ptr = DevicePtr::<u32>::null();
        assert!(ptr.is_null());
        assert_eq!(ptr.view(), BufferView::NULL);
    }
}
