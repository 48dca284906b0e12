//! Sub-block memory allocator for acceleration structures.
//!
//! Acceleration structures are numerous and oddly sized; allocating one GPU
//! buffer each would fragment the heap and hammer the driver allocator.
//! Instead the pool owns a few large pages and parcels out aligned sections:
//!
//! - exact-size free sections are reused as-is;
//! - otherwise the closest free section at least as large is accepted, but
//!   only if the waste stays below the requested size (a free block more
//!   than twice the request is left alone — bounded fragmentation beats a
//!   perfect fit here);
//! - otherwise the request bump-allocates at the page's current offset;
//! - requests larger than the page size get a dedicated, exactly sized page
//!   that never shares sub-blocks.
//!
//! A page whose last section is released is destroyed while other pages
//! remain; the final page is kept warm for the next build burst.

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuBuffer};
use crate::error::GpuError;
use crate::types::{align_up, BufferDescriptor, BufferUsage};

/// Required alignment for acceleration structure placement.
pub const ACCEL_ALIGNMENT: u64 = 256;

/// Default page size for shared acceleration structure pages (4 MiB).
pub const DEFAULT_ACCEL_PAGE_SIZE: u64 = 4 * 1024 * 1024;

/// One sub-allocation out of an acceleration structure page.
///
/// Back-references its page by id; releasing it hands the range back to the
/// pool. Holds the page buffer alive for as long as the section exists.
#[derive(Debug, Clone)]
pub struct AccelSection {
    page_id: u64,
    buffer: Arc<GpuBuffer>,
    offset: u64,
    size: u64,
}

impl AccelSection {
    /// The page buffer the section lives in.
    pub fn buffer(&self) -> &Arc<GpuBuffer> {
        &self.buffer
    }

    /// Byte offset within the page.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Section size in bytes (may exceed the requested size when a
    /// closest-fit free block was reused).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// GPU virtual address of the section start.
    pub fn gpu_address(&self) -> u64 {
        self.buffer.gpu_address() + self.offset
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

struct AccelPage {
    id: u64,
    buffer: Arc<GpuBuffer>,
    size: u64,
    /// Bump offset; memory past it has never been handed out.
    offset: u64,
    free_blocks: Vec<FreeBlock>,
    /// Live sections allocated from this page.
    sub_block_count: u32,
}

impl AccelPage {
    /// Take an exact-size free block, or the closest one whose waste stays
    /// under the requested size.
    fn take_free_block(&mut self, size: u64) -> Option<FreeBlock> {
        let mut best: Option<usize> = None;
        for (index, block) in self.free_blocks.iter().enumerate() {
            if block.size == size {
                best = Some(index);
                break;
            }
            if block.size > size {
                let better = match best {
                    Some(current) => block.size < self.free_blocks[current].size,
                    None => true,
                };
                if better {
                    best = Some(index);
                }
            }
        }
        let index = best?;
        let waste = self.free_blocks[index].size - size;
        if waste >= size {
            // A block more than twice the request stays on the free list.
            return None;
        }
        Some(self.free_blocks.swap_remove(index))
    }
}

/// Page pool for acceleration structure memory.
///
/// Not internally synchronized; the owning manager serializes access.
pub struct AccelMemoryPool {
    backend: Arc<dyn GpuBackend>,
    page_size: u64,
    pages: Vec<AccelPage>,
    next_page_id: u64,
}

impl std::fmt::Debug for AccelMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelMemoryPool")
            .field("page_size", &self.page_size)
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl AccelMemoryPool {
    /// Create a pool producing shared pages of `page_size` bytes.
    pub fn new(backend: Arc<dyn GpuBackend>, page_size: u64) -> Self {
        Self {
            backend,
            page_size,
            pages: Vec::new(),
            next_page_id: 0,
        }
    }

    /// Allocate a section of at least `size` bytes, aligned for
    /// acceleration structure placement.
    pub fn allocate(&mut self, size: u64) -> Result<AccelSection, GpuError> {
        assert!(size > 0, "acceleration structure allocation of zero bytes");
        let size = align_up(size, ACCEL_ALIGNMENT);

        // Oversized requests get their own exactly-sized page so they never
        // pin shared-page capacity.
        if size > self.page_size {
            let page = self.create_page(size)?;
            return Ok(self.bump_from(page, size));
        }

        if self.pages.is_empty() {
            let page = self.create_page(self.page_size.max(size))?;
            return Ok(self.bump_from(page, size));
        }

        for index in 0..self.pages.len() {
            // Dedicated oversized pages never share sub-blocks.
            if self.pages[index].size > self.page_size {
                continue;
            }
            if let Some(block) = self.pages[index].take_free_block(size) {
                let page = &mut self.pages[index];
                page.sub_block_count += 1;
                return Ok(AccelSection {
                    page_id: page.id,
                    buffer: page.buffer.clone(),
                    offset: block.offset,
                    size: block.size,
                });
            }
            if self.pages[index].offset + size <= self.pages[index].size {
                return Ok(self.bump_from(index, size));
            }
        }

        let page = self.create_page(self.page_size)?;
        Ok(self.bump_from(page, size))
    }

    /// Return a section to the pool.
    ///
    /// A section spanning its entire page destroys the page immediately
    /// (dedicated oversized pages are discarded whole). Otherwise the range
    /// joins the page's free list; a page whose live-section count reaches
    /// zero is destroyed as long as at least one other page remains.
    pub fn release(&mut self, section: AccelSection) {
        let index = self
            .pages
            .iter()
            .position(|page| page.id == section.page_id)
            .expect("releasing a section whose page no longer exists");

        if section.size == self.pages[index].size {
            log::debug!(
                "acceleration memory: destroying dedicated page {} ({} bytes)",
                self.pages[index].id,
                self.pages[index].size
            );
            self.pages.swap_remove(index);
            return;
        }

        let page = &mut self.pages[index];
        debug_assert!(page.sub_block_count > 0);
        page.free_blocks.push(FreeBlock {
            offset: section.offset,
            size: section.size,
        });
        page.sub_block_count -= 1;
        let now_empty = page.sub_block_count == 0;

        if now_empty && self.pages.len() > 1 {
            log::debug!(
                "acceleration memory: destroying empty page {} ({} bytes)",
                self.pages[index].id,
                self.pages[index].size
            );
            self.pages.swap_remove(index);
        }
    }

    /// Number of pages currently owned by the pool.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Live sections on a page, by creation order index. For diagnostics.
    pub fn sub_block_count(&self, page_index: usize) -> u32 {
        self.pages[page_index].sub_block_count
    }

    fn bump_from(&mut self, index: usize, size: u64) -> AccelSection {
        let page = &mut self.pages[index];
        debug_assert!(page.offset + size <= page.size);
        let offset = page.offset;
        page.offset += size;
        page.sub_block_count += 1;
        AccelSection {
            page_id: page.id,
            buffer: page.buffer.clone(),
            offset,
            size,
        }
    }

    fn create_page(&mut self, size: u64) -> Result<usize, GpuError> {
        self.next_page_id += 1;
        let descriptor = BufferDescriptor::new(
            size,
            BufferUsage::ACCELERATION_STRUCTURE | BufferUsage::STORAGE,
        )
        .with_label(format!("accel_page_{}", self.next_page_id));
        let buffer = self.backend.create_buffer(&descriptor)?;
        log::debug!(
            "acceleration memory: created page {} ({} bytes)",
            self.next_page_id,
            size
        );
        self.pages.push(AccelPage {
            id: self.next_page_id,
            buffer: Arc::new(buffer),
            size,
            offset: 0,
            free_blocks: Vec::new(),
            sub_block_count: 0,
        });
        Ok(self.pages.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn test_pool(page_size: u64) -> AccelMemoryPool {
        let backend = Arc::new(DummyBackend::new());
        AccelMemoryPool::new(backend as Arc<dyn GpuBackend>, page_size)
    }

    #[test]
    fn test_allocations_share_a_page() {
        let mut pool = test_pool(4096);
        let a = pool.allocate(256).unwrap();
        let b = pool.allocate(256).unwrap();
        assert_eq!(pool.page_count(), 1);
        assert_ne!(a.gpu_address(), b.gpu_address());
        assert_eq!(b.offset(), a.offset() + 256);
    }

    #[test]
    fn test_exact_size_free_section_reused() {
        let mut pool = test_pool(4096);
        let a = pool.allocate(512).unwrap();
        let _b = pool.allocate(256).unwrap();
        let freed_offset = a.offset();
        pool.release(a);

        let c = pool.allocate(512).unwrap();
        assert_eq!(c.offset(), freed_offset);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn test_closest_fit_rejected_when_waste_too_large() {
        let mut pool = test_pool(4096);
        let a = pool.allocate(1024).unwrap();
        let _b = pool.allocate(256).unwrap();
        pool.release(a);

        // 256 requested, free block is 1024: waste (768) >= request, so the
        // block is left alone and the request bumps fresh space instead.
        let c = pool.allocate(256).unwrap();
        assert_eq!(c.offset(), 1024 + 256);
    }

    #[test]
    fn test_closest_fit_accepted_within_waste_bound() {
        let mut pool = test_pool(4096);
        let a = pool.allocate(768).unwrap();
        let _b = pool.allocate(256).unwrap();
        let freed_offset = a.offset();
        pool.release(a);

        // 512 requested, free block is 768: waste (256) < request, reuse it.
        let c = pool.allocate(512).unwrap();
        assert_eq!(c.offset(), freed_offset);
        assert_eq!(c.size(), 768);
    }

    #[test]
    fn test_oversized_request_gets_dedicated_page() {
        let mut pool = test_pool(1024);
        let small = pool.allocate(256).unwrap();
        let big = pool.allocate(8192).unwrap();
        assert_eq!(pool.page_count(), 2);
        assert_eq!(big.offset(), 0);
        assert_eq!(big.size(), 8192);

        // Releasing the dedicated page's only section destroys the page.
        pool.release(big);
        assert_eq!(pool.page_count(), 1);
        drop(small);
    }

    #[test]
    fn test_empty_page_destroyed_when_another_exists() {
        let mut pool = test_pool(1024);
        // Fill page one so the next allocation opens page two.
        let filler = pool.allocate(1024 - 256).unwrap();
        let lone = pool.allocate(512).unwrap();
        assert_eq!(pool.page_count(), 2);

        // Page two's only section goes away: the page is destroyed and page
        // one survives untouched.
        pool.release(lone);
        assert_eq!(pool.page_count(), 1);
        assert_eq!(pool.sub_block_count(0), 1);
        drop(filler);
    }

    #[test]
    fn test_last_page_is_kept() {
        let mut pool = test_pool(1024);
        let only = pool.allocate(256).unwrap();
        pool.release(only);
        // Sub-block count reached zero but it is the only page.
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn test_sizes_are_aligned() {
        let mut pool = test_pool(4096);
        let a = pool.allocate(100).unwrap();
        assert_eq!(a.size(), 256);
        let b = pool.allocate(300).unwrap();
        assert_eq!(b.size(), 512);
        assert_eq!(b.offset() % ACCEL_ALIGNMENT, 0);
    }
}
