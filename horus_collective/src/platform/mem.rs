//! Cache-line aligned, NUMA-aware allocation service.
//!
//! Every allocation is returned as an owning [`AlignedBuffer`]; dropping the
//! handle releases the memory through the same mechanism that produced it.
//! Buffers are always zero-filled, which is a valid initial state for the
//! atomic slot layouts that channels overlay on them.

use std::alloc::Layout;
use std::ptr::NonNull;

use log::{debug, warn};

use crate::error::{CollectiveError, CollectiveResult};

/// Cache line size assumed by all channel layouts.
pub const CACHELINE_SIZE: usize = 64;

/// Base page size used for NUMA-placed mappings.
pub const BASE_PAGE_SIZE: usize = 4096;

#[cfg(target_os = "linux")]
const MPOL_PREFERRED: libc::c_int = 1;

#[derive(Debug)]
enum Origin {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    Mapped { map_len: usize },
}

/// Owning handle for zeroed, aligned memory.
#[derive(Debug)]
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    numa_node: Option<usize>,
    origin: Origin,
}

// SAFETY: the buffer is plain owned memory; all shared access goes through
// atomics laid over it by the channel implementations.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// NUMA node the pages were bound to, if placement succeeded.
    pub fn numa_node(&self) -> Option<usize> {
        self.numa_node
    }

    pub fn is_aligned_to(&self, align: usize) -> bool {
        align.is_power_of_two() && (self.ptr.as_ptr() as usize) % align == 0
    }

    fn heap(bytes: usize, align: usize) -> CollectiveResult<Self> {
        if bytes == 0 {
            return Err(CollectiveError::invalid("zero-sized allocation"));
        }
        let align = align.max(std::mem::size_of::<usize>());
        let layout = Layout::from_size_align(bytes, align).map_err(|e| {
            CollectiveError::alignment(format!("alignment {} rejected: {}", align, e))
        })?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(CollectiveError::MallocFail { bytes })?;
        Ok(Self {
            ptr,
            len: bytes,
            numa_node: None,
            origin: Origin::Heap(layout),
        })
    }

    #[cfg(target_os = "linux")]
    fn mapped_on_node(bytes: usize, numa_node: usize) -> CollectiveResult<Self> {
        if bytes == 0 {
            return Err(CollectiveError::invalid("zero-sized allocation"));
        }
        let map_len = bytes.div_ceil(BASE_PAGE_SIZE) * BASE_PAGE_SIZE;

        // SAFETY: anonymous private mapping, no file descriptor involved
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(CollectiveError::MallocFail { bytes });
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or(CollectiveError::MallocFail { bytes })?;

        let bound = bind_to_node(raw, map_len, numa_node);
        Ok(Self {
            ptr,
            len: bytes,
            numa_node: bound.then_some(numa_node),
            origin: Origin::Mapped { map_len },
        })
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        match self.origin {
            // SAFETY: allocated by alloc_zeroed with this exact layout
            Origin::Heap(layout) => unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) },
            #[cfg(target_os = "linux")]
            Origin::Mapped { map_len } => {
                // SAFETY: mapping created by mmap with map_len bytes
                let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, map_len) };
                if rc != 0 {
                    warn!(
                        "munmap of {} bytes failed: {}",
                        map_len,
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
    }
}

/// Prefer `numa_node` for the pages of a fresh mapping. Best effort.
#[cfg(target_os = "linux")]
fn bind_to_node(addr: *mut libc::c_void, len: usize, numa_node: usize) -> bool {
    if numa_node >= 64 {
        debug!("NUMA node {} outside single-word node mask, skipping bind", numa_node);
        return false;
    }
    let mask: libc::c_ulong = 1 << numa_node;
    let maxnode: libc::c_ulong = 64;
    // SAFETY: addr/len describe a mapping we own; mask outlives the call
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len,
            MPOL_PREFERRED,
            &mask as *const libc::c_ulong,
            maxnode,
            0 as libc::c_uint,
        )
    };
    if rc != 0 {
        debug!(
            "mbind to NUMA node {} failed: {}",
            numa_node,
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

/// Allocation service consumed by channels, queue pairs and contexts.
pub trait NumaAllocator: Send + Sync {
    /// Zeroed allocation of `bytes` aligned to `align`.
    fn alloc(&self, bytes: usize, align: usize) -> CollectiveResult<AlignedBuffer>;

    /// Zeroed allocation placed on `numa_node`.
    fn alloc_on_node(
        &self,
        bytes: usize,
        align: usize,
        numa_node: usize,
    ) -> CollectiveResult<AlignedBuffer>;
}

/// Default allocator: heap memory, anonymous mappings bound with `mbind` for
/// placed allocations on Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl NumaAllocator for SystemAllocator {
    fn alloc(&self, bytes: usize, align: usize) -> CollectiveResult<AlignedBuffer> {
        AlignedBuffer::heap(bytes, align)
    }

    #[cfg(target_os = "linux")]
    fn alloc_on_node(
        &self,
        bytes: usize,
        align: usize,
        numa_node: usize,
    ) -> CollectiveResult<AlignedBuffer> {
        if !align.is_power_of_two() {
            return Err(CollectiveError::alignment(format!(
                "alignment {} is not a power of two",
                align
            )));
        }
        if align > BASE_PAGE_SIZE {
            debug!("alignment {} exceeds page size, using heap allocation", align);
            return AlignedBuffer::heap(bytes, align);
        }
        AlignedBuffer::mapped_on_node(bytes, numa_node)
    }

    #[cfg(not(target_os = "linux"))]
    fn alloc_on_node(
        &self,
        bytes: usize,
        align: usize,
        _numa_node: usize,
    ) -> CollectiveResult<AlignedBuffer> {
        // No placement API outside Linux
        AlignedBuffer::heap(bytes, align)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let buf = SystemAllocator.alloc(3 * CACHELINE_SIZE, CACHELINE_SIZE).unwrap();
        assert_eq!(buf.len(), 192);
        assert!(buf.is_aligned_to(CACHELINE_SIZE));
        // SAFETY: buffer is 192 bytes long and initialised
        let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_alloc_on_node_is_page_aligned() {
        let buf = SystemAllocator
            .alloc_on_node(5 * CACHELINE_SIZE, CACHELINE_SIZE, 0)
            .unwrap();
        assert!(buf.is_aligned_to(CACHELINE_SIZE));
        // SAFETY: buffer is initialised for its whole length
        let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_bad_alignment_rejected() {
        assert!(matches!(
            SystemAllocator.alloc(128, 48),
            Err(CollectiveError::BadAlignment(_))
        ));
        assert!(matches!(
            SystemAllocator.alloc(0, 64),
            Err(CollectiveError::InvalidArgument(_))
        ));
    }
}
