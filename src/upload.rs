//! Linear allocator for transient CPU-to-GPU staging memory.
//!
//! Per-frame constants, dynamic vertex data and texture upload staging all
//! come from here. Pages are CPU-visible upload buffers; allocation is a
//! bump within the current page. A page is reset to offset zero only after
//! the sync point of the frame that used it completes — until then it sits
//! in the retired queue.
//!
//! One allocator serves one queue: retirement values are compared against
//! that queue's completed fence value.
//!
//! # Capacity limit
//!
//! A single allocation larger than the page size is not supported and
//! panics; callers chunk large uploads. See [`LinearAllocator::allocate_aligned`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuBuffer};
use crate::error::GpuError;
use crate::sync::SyncPoint;
use crate::types::{align_up, BufferDescriptor, BufferUsage};

/// Default page size for upload pages (2 MiB).
pub const DEFAULT_UPLOAD_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Default allocation alignment, matching the common constant-buffer offset
/// alignment requirement.
pub const DEFAULT_UPLOAD_ALIGNMENT: u64 = 256;

/// One sub-allocation from an upload page.
///
/// Valid until the sync point passed to [`LinearAllocator::end`] for the
/// frame that produced it completes; after that the backing page may be
/// recycled.
#[derive(Clone)]
pub struct UploadAllocation {
    backend: Arc<dyn GpuBackend>,
    /// The page buffer backing this allocation.
    pub buffer: Arc<GpuBuffer>,
    /// Byte offset of the allocation within the page.
    pub offset: u64,
    /// Size of the allocation in bytes.
    pub size: u64,
    /// GPU virtual address of the allocation start.
    pub gpu_address: u64,
}

impl std::fmt::Debug for UploadAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadAllocation")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .finish()
    }
}

impl UploadAllocation {
    /// Write bytes into the allocation through the page's CPU mapping.
    pub fn write(&self, data: &[u8]) {
        assert!(
            data.len() as u64 <= self.size,
            "write of {} bytes into an allocation of {} bytes",
            data.len(),
            self.size
        );
        self.backend.write_buffer(&self.buffer, self.offset, data);
    }
}

struct UploadPage {
    buffer: Arc<GpuBuffer>,
    size: u64,
    offset: u64,
}

#[derive(Default)]
struct AllocatorInner {
    current: Option<UploadPage>,
    /// Pages filled up mid-frame; retired together at `end`.
    full: Vec<UploadPage>,
    /// Pages waiting on their retirement value, oldest first.
    retired: VecDeque<(u64, UploadPage)>,
    available: VecDeque<UploadPage>,
    created: u64,
}

/// Page-based bump allocator for staging memory.
///
/// Thread-safe: producers may allocate concurrently while another thread
/// reclaims or creates pages; all page bookkeeping happens under one lock.
pub struct LinearAllocator {
    backend: Arc<dyn GpuBackend>,
    page_size: u64,
    inner: Mutex<AllocatorInner>,
}

impl std::fmt::Debug for LinearAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LinearAllocator")
            .field("page_size", &self.page_size)
            .field("created", &inner.created)
            .field("retired", &inner.retired.len())
            .field("available", &inner.available.len())
            .finish()
    }
}

impl LinearAllocator {
    /// Create an allocator producing pages of `page_size` bytes.
    pub fn new(backend: Arc<dyn GpuBackend>, page_size: u64) -> Self {
        Self {
            backend,
            page_size,
            inner: Mutex::new(AllocatorInner::default()),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Prime reclaiming for a new frame: retired pages whose value is at or
    /// below `completed_value` return to the available pool.
    pub fn begin(&self, completed_value: u64) {
        let mut inner = self.inner.lock();
        while let Some((value, _)) = inner.retired.front() {
            if *value > completed_value {
                break;
            }
            let (_, mut page) = inner.retired.pop_front().unwrap();
            page.offset = 0;
            inner.available.push_back(page);
        }
    }

    /// Bump-allocate `size` bytes at the default alignment.
    pub fn allocate(&self, size: u64) -> Result<UploadAllocation, GpuError> {
        self.allocate_aligned(size, DEFAULT_UPLOAD_ALIGNMENT)
    }

    /// Bump-allocate `size` bytes aligned to `alignment`.
    ///
    /// If the current page cannot fit the request it is set aside for
    /// retirement and a page is reused or created, so a request never fails
    /// while the backend can still create a page.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the page size — single allocations beyond
    /// one page are a capacity limit of this allocator; chunk the upload.
    pub fn allocate_aligned(
        &self,
        size: u64,
        alignment: u64,
    ) -> Result<UploadAllocation, GpuError> {
        assert!(alignment.is_power_of_two(), "alignment must be a power of 2");
        assert!(
            size <= self.page_size,
            "allocation of {size} bytes exceeds the upload page size of {} bytes; \
             chunk large uploads",
            self.page_size
        );

        let mut inner = self.inner.lock();

        let needs_new_page = match &inner.current {
            Some(page) => align_up(page.offset, alignment) + size > page.size,
            None => true,
        };
        if needs_new_page {
            if let Some(full) = inner.current.take() {
                inner.full.push(full);
            }
            let page = self.next_page(&mut inner)?;
            inner.current = Some(page);
        }

        let page = inner.current.as_mut().unwrap();
        let offset = align_up(page.offset, alignment);
        page.offset = offset + size;

        Ok(UploadAllocation {
            backend: self.backend.clone(),
            buffer: page.buffer.clone(),
            offset,
            size,
            gpu_address: page.buffer.gpu_address() + offset,
        })
    }

    /// Retire every page used since the last `end` at `sync_point`.
    pub fn end(&self, sync_point: &SyncPoint) {
        assert!(
            sync_point.is_valid(),
            "retiring upload pages requires the sync point of the frame's submission"
        );
        let value = sync_point.value();
        let mut inner = self.inner.lock();
        let full = std::mem::take(&mut inner.full);
        for page in full {
            inner.retired.push_back((value, page));
        }
        if let Some(page) = inner.current.take() {
            inner.retired.push_back((value, page));
        }
    }

    /// Total pages created over the allocator's lifetime.
    pub fn created_count(&self) -> u64 {
        self.inner.lock().created
    }

    /// Pages waiting on retirement.
    pub fn retired_count(&self) -> usize {
        self.inner.lock().retired.len()
    }

    fn next_page(&self, inner: &mut AllocatorInner) -> Result<UploadPage, GpuError> {
        if let Some(page) = inner.available.pop_front() {
            debug_assert_eq!(page.offset, 0);
            return Ok(page);
        }
        inner.created += 1;
        log::debug!(
            "upload allocator: growing to {} pages ({} bytes each)",
            inner.created,
            self.page_size
        );
        let descriptor = BufferDescriptor::new(
            self.page_size,
            BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC | BufferUsage::UNIFORM,
        )
        .with_label(format!("upload_page_{}", inner.created));
        let buffer = self.backend.create_buffer(&descriptor)?;
        Ok(UploadPage {
            buffer: Arc::new(buffer),
            size: self.page_size,
            offset: 0,
        })
    }
}

/// Data for one texture subresource upload.
#[derive(Debug, Clone, Copy)]
pub struct SubresourceData<'a> {
    /// Tightly packed texel rows.
    pub data: &'a [u8],
    /// Bytes per row in `data`.
    pub bytes_per_row: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::sync::QueueTimeline;
    use crate::types::{QueueId, QueueKind};

    fn test_allocator(page_size: u64) -> (Arc<QueueTimeline>, LinearAllocator) {
        let backend = Arc::new(DummyBackend::new());
        backend.set_auto_complete(false);
        let timeline = QueueTimeline::new(
            backend.clone() as Arc<dyn GpuBackend>,
            QueueId::new(QueueKind::Copy, 0),
        )
        .unwrap();
        let allocator = LinearAllocator::new(backend as Arc<dyn GpuBackend>, page_size);
        (timeline, allocator)
    }

    #[test]
    fn test_allocations_never_overlap() {
        let (_timeline, allocator) = test_allocator(4096);
        allocator.begin(0);

        let a = allocator.allocate_aligned(100, 256).unwrap();
        let b = allocator.allocate_aligned(100, 256).unwrap();
        let c = allocator.allocate_aligned(512, 256).unwrap();

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(c.offset, 512);
        assert!(a.offset + a.size <= b.offset);
        assert!(b.offset + b.size <= c.offset);
    }

    #[test]
    fn test_page_rollover_on_overflow() {
        let (_timeline, allocator) = test_allocator(4096);
        allocator.begin(0);

        let first = allocator.allocate_aligned(100, 256).unwrap();
        // Aligned offset would be 256; 256 + (4096 - 64) exceeds the page,
        // so this rolls over to a fresh page at offset zero.
        let second = allocator.allocate_aligned(4096 - 64, 256).unwrap();

        assert_eq!(second.offset, 0);
        assert_ne!(first.buffer.gpu_address(), second.buffer.gpu_address());
        assert_eq!(allocator.created_count(), 2);
    }

    #[test]
    fn test_pages_not_reused_before_fence() {
        let (timeline, allocator) = test_allocator(1024);
        allocator.begin(0);
        let first = allocator.allocate(512).unwrap();
        let first_address = first.buffer.gpu_address();

        let value = timeline.advance();
        allocator.end(&SyncPoint::new(timeline.clone(), value));
        assert_eq!(allocator.retired_count(), 1);

        // Fence has not reached the retirement value: a new page is created.
        allocator.begin(value - 1);
        let second = allocator.allocate(512).unwrap();
        assert_ne!(second.buffer.gpu_address(), first_address);
        assert_eq!(allocator.created_count(), 2);
        allocator.end(&SyncPoint::new(timeline.clone(), timeline.advance()));

        // Once it completes, the original page comes back at offset zero.
        allocator.begin(value);
        let third = allocator.allocate(512).unwrap();
        assert_eq!(third.buffer.gpu_address(), first_address);
        assert_eq!(third.offset, 0);
        assert_eq!(allocator.created_count(), 2);
    }

    #[test]
    fn test_write_through_allocation() {
        let (_timeline, allocator) = test_allocator(1024);
        allocator.begin(0);
        let allocation = allocator.allocate(16).unwrap();
        allocation.write(&[7u8; 16]);

        let bytes = allocation
            .backend
            .read_buffer(&allocation.buffer, allocation.offset, 16);
        assert_eq!(bytes, vec![7u8; 16]);
    }

    #[test]
    #[should_panic(expected = "exceeds the upload page size")]
    fn test_oversized_allocation_panics() {
        let (_timeline, allocator) = test_allocator(1024);
        allocator.begin(0);
        let _ = allocator.allocate(4096);
    }
}
