use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::mem::align_of;
use std::ptr::{self, NonNull};

// Arena allocates memory for decoded message trees, which can be freed all
// at once. Small allocations are bumped out of contiguous blocks; oversized
// requests get a dedicated block so the active bump region stays usable.
// The arena must outlive every message decoded through it.
pub struct Arena {
    current: *mut MemBlock,
    cursor: *mut u8,
    end: *mut u8,
}

// Mem block is a chunk of contiguous memory with its header up front.
struct MemBlock {
    prev: *mut MemBlock,
    layout: Layout, // layout of the entire block including header
}

const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;
const MAX_BLOCK_SIZE: usize = 1024 * 1024;

impl Arena {
    pub fn new() -> Self {
        Self {
            current: ptr::null_mut(),
            cursor: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }

    /// Allocate raw memory with the given size and alignment (uninitialized).
    #[inline]
    pub fn alloc_raw(&mut self, layout: Layout) -> NonNull<u8> {
        if layout.size() == 0 {
            return unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
        }

        let cursor_addr = self.cursor as usize;
        let aligned_addr = cursor_addr.wrapping_add(layout.align() - 1) & !(layout.align() - 1);

        let available = (self.end as usize).saturating_sub(aligned_addr);
        if available >= layout.size() {
            self.cursor = (aligned_addr + layout.size()) as *mut u8;
            return unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) };
        }

        self.alloc_outlined(layout)
    }

    /// Allocate zero-filled memory.
    pub fn alloc_zeroed(&mut self, layout: Layout) -> NonNull<u8> {
        let ptr = self.alloc_raw(layout);
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };
        ptr
    }

    /// Total bytes held by this arena's blocks.
    pub fn bytes_allocated(&self) -> usize {
        let mut total = 0;
        let mut current = self.current;
        unsafe {
            while !current.is_null() {
                total += (*current).layout.size();
                current = (*current).prev;
            }
        }
        total
    }

    // Slow path, kept out of line so the bump path stays small.
    #[inline(never)]
    fn alloc_outlined(&mut self, layout: Layout) -> NonNull<u8> {
        let next_size = if self.current.is_null() {
            DEFAULT_BLOCK_SIZE
        } else {
            let current_size = unsafe { (*self.current).layout.size() };
            current_size.saturating_mul(2).min(MAX_BLOCK_SIZE)
        };

        if layout.size() + layout.align() > next_size {
            // Oversized request: dedicated block, current bump region kept.
            return self.alloc_dedicated(layout);
        }

        let (block_layout, data_offset) = Layout::new::<MemBlock>()
            .extend(Layout::from_size_align(next_size, align_of::<u64>()).expect("layout overflow"))
            .expect("layout overflow");
        let block_layout = block_layout.pad_to_align();

        let block = unsafe { alloc(block_layout) } as *mut MemBlock;
        if block.is_null() {
            handle_alloc_error(block_layout);
        }
        unsafe {
            (*block).prev = self.current;
            (*block).layout = block_layout;
            self.current = block;
            self.cursor = (block as *mut u8).add(data_offset);
            self.end = (block as *mut u8).add(block_layout.size());
        }
        self.alloc_raw(layout)
    }

    fn alloc_dedicated(&mut self, layout: Layout) -> NonNull<u8> {
        let (block_layout, data_offset) = Layout::new::<MemBlock>()
            .extend(layout)
            .expect("layout overflow");
        let block_layout = block_layout.pad_to_align();

        let block = unsafe { alloc(block_layout) } as *mut MemBlock;
        if block.is_null() {
            handle_alloc_error(block_layout);
        }
        unsafe {
            (*block).layout = block_layout;
            if self.current.is_null() {
                (*block).prev = ptr::null_mut();
                self.current = block;
                // no active bump region yet; cursor/end stay null
            } else {
                // insert behind the head so the bump block stays active
                (*block).prev = (*self.current).prev;
                (*self.current).prev = block;
            }
            NonNull::new_unchecked((block as *mut u8).add(data_offset))
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            let mut current = self.current;
            while !current.is_null() {
                let prev = (*current).prev;
                let layout = (*current).layout;
                dealloc(current as *mut u8, layout);
                current = prev;
            }
        }
    }
}

unsafe impl Send for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_allocation() {
        let mut arena = Arena::new();

        let ptr1 = arena.alloc_raw(Layout::new::<u32>()).as_ptr() as *mut u32;
        let ptr2 = arena.alloc_raw(Layout::new::<u64>()).as_ptr() as *mut u64;

        unsafe {
            *ptr1 = 42;
            *ptr2 = 1337;

            assert_eq!(*ptr1, 42);
            assert_eq!(*ptr2, 1337);
        }
    }

    #[test]
    fn alignment() {
        let mut arena = Arena::new();

        let _byte = arena.alloc_raw(Layout::new::<u8>());
        let word = arena.alloc_raw(Layout::new::<u64>());

        assert_eq!(word.as_ptr() as usize % align_of::<u64>(), 0);
    }

    #[test]
    fn zeroed_allocation() {
        let mut arena = Arena::new();

        let layout = Layout::array::<u8>(256).unwrap();
        let ptr = arena.alloc_zeroed(layout);
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 256) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn large_allocation() {
        let mut arena = Arena::new();

        let layout = Layout::array::<u8>(DEFAULT_BLOCK_SIZE * 2).unwrap();
        let ptr = arena.alloc_raw(layout).as_ptr();
        unsafe {
            *ptr = 1;
            *ptr.add(DEFAULT_BLOCK_SIZE * 2 - 1) = 2;
            assert_eq!(*ptr, 1);
            assert_eq!(*ptr.add(DEFAULT_BLOCK_SIZE * 2 - 1), 2);
        }
        assert!(arena.bytes_allocated() >= DEFAULT_BLOCK_SIZE * 2);
    }

    #[test]
    fn block_reuse_after_dedicated() {
        let mut arena = Arena::new();

        // fill in a normal block first
        let _small = arena.alloc_raw(Layout::new::<u64>());
        let before = arena.bytes_allocated();

        // oversized request must not abandon the bump region
        let _big = arena.alloc_raw(Layout::array::<u8>(MAX_BLOCK_SIZE * 2).unwrap());
        let _small2 = arena.alloc_raw(Layout::new::<u64>());

        assert!(arena.bytes_allocated() > before);
    }
}
