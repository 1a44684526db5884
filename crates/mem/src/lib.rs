#![doc = include_str!("../README.md")]

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;

use memmap2::MmapMut;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

/// Errors from buffer allocation and maintenance.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("memfd create failed: {0}")]
    Create(nix::errno::Errno),
    #[error("buffer resize failed: {0}")]
    Resize(nix::errno::Errno),
    #[error("buffer mmap failed: {0}")]
    Map(io::Error),
    #[error("cache maintenance failed: {0}")]
    Cache(io::Error),
    #[error("buffer index {0} out of range")]
    BadIndex(usize),
    #[error("buffer name contains an interior NUL")]
    BadName,
}

/// Cache maintenance operations on a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Write CPU-side dirty lines back before the device reads.
    Clean,
    /// Discard CPU-side lines before the CPU reads device output.
    Invalidate,
    /// Both, around bidirectional access.
    CleanInvalidate,
}

/// Who currently owns a buffer.
///
/// Exactly one owner at a time: camera-owned buffers are queued to the
/// hardware; client-owned buffers have been dequeued or delivered through
/// a callback and must be returned before they can be queued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Camera,
    Client,
}

/// Byte layout of one plane inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDef {
    /// Byte offset into the owning buffer.
    pub offset: usize,
    /// Length of the plane in bytes.
    pub len: usize,
    /// Stride in bytes.
    pub stride: usize,
}

/// Single contiguous plane layout for a buffer of `len` bytes.
pub fn single_plane(len: usize, stride: usize) -> SmallVec<[PlaneDef; 3]> {
    smallvec::smallvec![PlaneDef {
        offset: 0,
        len,
        stride,
    }]
}

/// A memfd-backed, memory-mapped buffer slab.
///
/// # Example
/// ```rust
/// use charon_mem::{single_plane, MappedBuf};
///
/// let buf = MappedBuf::alloc("cap", 4096, single_plane(4096, 4096)).unwrap();
/// assert_eq!(buf.size(), 4096);
/// assert_eq!(buf.planes().len(), 1);
/// ```
pub struct MappedBuf {
    file: File,
    map: MmapMut,
    size: usize,
    planes: SmallVec<[PlaneDef; 3]>,
}

impl MappedBuf {
    /// Allocate a fresh slab of `size` bytes with the given plane layout.
    pub fn alloc(
        name: &str,
        size: usize,
        planes: SmallVec<[PlaneDef; 3]>,
    ) -> Result<Self, MemError> {
        let cname = CString::new(name).map_err(|_| MemError::BadName)?;
        let fd =
            memfd_create(cname.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).map_err(MemError::Create)?;
        nix::unistd::ftruncate(&fd, size as i64).map_err(MemError::Resize)?;
        let file = File::from(fd);
        // SAFETY: the memfd is owned by this slab and never truncated
        // while mapped.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(MemError::Map)?;
        Ok(MappedBuf {
            file,
            map,
            size,
            planes,
        })
    }

    /// The buffer's own descriptor, suitable for fd passing.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Plane layout.
    pub fn planes(&self) -> &[PlaneDef] {
        &self.planes
    }

    /// Whole-buffer view.
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// Whole-buffer mutable view.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Borrow one plane.
    pub fn plane(&self, index: usize) -> Result<&[u8], MemError> {
        let def = self.planes.get(index).ok_or(MemError::BadIndex(index))?;
        self.map
            .get(def.offset..def.offset + def.len)
            .ok_or(MemError::BadIndex(index))
    }

    /// Run a cache maintenance op on the whole buffer.
    ///
    /// memfd mappings are CPU-coherent, so clean maps to an msync-style
    /// flush and invalidate needs no CPU-side work; both directions keep
    /// the call sites that real allocator backends (ION) require.
    pub fn cache_op(&self, op: CacheOp) -> Result<(), MemError> {
        match op {
            CacheOp::Clean | CacheOp::CleanInvalidate => {
                self.map.flush().map_err(MemError::Cache)
            }
            CacheOp::Invalidate => Ok(()),
        }
    }

    fn matches(&self, size: usize) -> bool {
        self.size == size
    }
}

struct PoolInner {
    free: Mutex<Vec<MappedBuf>>,
    max_free: usize,
}

/// Pool reusing released slabs for later same-size allocations.
///
/// # Example
/// ```rust
/// use charon_mem::{single_plane, BufPool};
///
/// let pool = BufPool::new(4);
/// let buf = pool.acquire("frame", 1 << 16, single_plane(1 << 16, 1920)).unwrap();
/// pool.release(buf);
/// ```
#[derive(Clone)]
pub struct BufPool {
    inner: Arc<PoolInner>,
}

impl BufPool {
    /// Create a pool retaining at most `max_free` released slabs.
    pub fn new(max_free: usize) -> Self {
        BufPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                max_free,
            }),
        }
    }

    /// Take a pooled slab of exactly `size` bytes, or allocate a fresh one.
    pub fn acquire(
        &self,
        name: &str,
        size: usize,
        planes: SmallVec<[PlaneDef; 3]>,
    ) -> Result<MappedBuf, MemError> {
        let reused = {
            let mut free = self.inner.free.lock();
            free.iter()
                .position(|buf| buf.matches(size))
                .map(|at| free.swap_remove(at))
        };
        match reused {
            Some(mut buf) => {
                buf.planes = planes;
                debug!(size, "reusing pooled buffer");
                Ok(buf)
            }
            None => MappedBuf::alloc(name, size, planes),
        }
    }

    /// Return a slab to the pool (dropped when the free list is full).
    pub fn release(&self, buf: MappedBuf) {
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.max_free {
            free.push(buf);
        }
    }

    /// Number of slabs currently pooled.
    pub fn free_len(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// Opaque handle for passing one mapped buffer to a framework-level
/// memory abstraction (e.g. the encode collaborator).
#[derive(Debug, Clone, Copy)]
pub struct MemoryHandle {
    pub fd: RawFd,
    pub size: usize,
    pub is_metadata: bool,
}

/// A stream's buffer set plus per-index ownership tracking.
pub struct BufferSet {
    bufs: Vec<MappedBuf>,
    owners: Vec<BufferOwner>,
    pool: BufPool,
}

impl BufferSet {
    /// Allocate `count` buffers of `size` bytes each through `pool`.
    ///
    /// Fresh buffers start camera-owned, matching their initial queued
    /// state.
    pub fn allocate(
        pool: &BufPool,
        name: &str,
        count: usize,
        size: usize,
        planes: SmallVec<[PlaneDef; 3]>,
    ) -> Result<Self, MemError> {
        let mut bufs = Vec::with_capacity(count);
        for _ in 0..count {
            bufs.push(pool.acquire(name, size, planes.clone())?);
        }
        Ok(BufferSet {
            owners: vec![BufferOwner::Camera; bufs.len()],
            bufs,
            pool: pool.clone(),
        })
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Borrow a buffer by index.
    pub fn buf(&self, index: usize) -> Result<&MappedBuf, MemError> {
        self.bufs.get(index).ok_or(MemError::BadIndex(index))
    }

    /// Descriptor of the buffer at `index`.
    pub fn fd(&self, index: usize) -> Result<BorrowedFd<'_>, MemError> {
        Ok(self.buf(index)?.fd())
    }

    /// Size of the buffer at `index`.
    pub fn size(&self, index: usize) -> Result<usize, MemError> {
        Ok(self.buf(index)?.size())
    }

    /// Current owner of the buffer at `index`.
    pub fn owner(&self, index: usize) -> Result<BufferOwner, MemError> {
        self.owners
            .get(index)
            .copied()
            .ok_or(MemError::BadIndex(index))
    }

    /// Record an ownership transition for the buffer at `index`.
    pub fn set_owner(&mut self, index: usize, owner: BufferOwner) -> Result<(), MemError> {
        let slot = self
            .owners
            .get_mut(index)
            .ok_or(MemError::BadIndex(index))?;
        *slot = owner;
        Ok(())
    }

    /// Opaque handle for collaborators.
    pub fn memory_handle(&self, index: usize, is_metadata: bool) -> Result<MemoryHandle, MemError> {
        use std::os::fd::AsRawFd;
        let buf = self.buf(index)?;
        Ok(MemoryHandle {
            fd: buf.fd().as_raw_fd(),
            size: buf.size(),
            is_metadata,
        })
    }

    /// Run a cache op on one buffer.
    pub fn cache_op(&self, index: usize, op: CacheOp) -> Result<(), MemError> {
        self.buf(index)?.cache_op(op)
    }
}

impl Drop for BufferSet {
    fn drop(&mut self) {
        for buf in self.bufs.drain(..) {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn mapped_buf_is_visible_through_its_fd() {
        let mut buf = MappedBuf::alloc("t", 64, single_plane(64, 64)).unwrap();
        buf.as_mut_slice()[..4].copy_from_slice(b"abcd");
        buf.cache_op(CacheOp::Clean).unwrap();

        // Reading through the fd must observe the mapped writes.
        let mut dup = buf.file.try_clone().unwrap();
        dup.seek(SeekFrom::Start(0)).unwrap();
        let mut back = [0u8; 4];
        dup.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"abcd");
    }

    #[test]
    fn fd_writes_are_visible_in_the_mapping() {
        let buf = MappedBuf::alloc("t", 16, single_plane(16, 16)).unwrap();
        let mut dup = buf.file.try_clone().unwrap();
        dup.write_all(b"zz").unwrap();
        assert_eq!(&buf.as_slice()[..2], b"zz");
    }

    #[test]
    fn pool_reuses_matching_sizes_only() {
        let pool = BufPool::new(4);
        let a = pool.acquire("a", 4096, single_plane(4096, 64)).unwrap();
        pool.release(a);
        assert_eq!(pool.free_len(), 1);

        let _b = pool.acquire("b", 8192, single_plane(8192, 64)).unwrap();
        assert_eq!(pool.free_len(), 1); // 4096 slab still pooled

        let _c = pool.acquire("c", 4096, single_plane(4096, 64)).unwrap();
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn buffer_set_tracks_ownership_per_index() {
        let pool = BufPool::new(8);
        let mut set = BufferSet::allocate(&pool, "s", 3, 256, single_plane(256, 16)).unwrap();
        assert_eq!(set.owner(0).unwrap(), BufferOwner::Camera);
        set.set_owner(0, BufferOwner::Client).unwrap();
        assert_eq!(set.owner(0).unwrap(), BufferOwner::Client);
        assert_eq!(set.owner(1).unwrap(), BufferOwner::Camera);
        assert!(set.owner(9).is_err());
    }

    #[test]
    fn dropping_a_set_refills_the_pool() {
        let pool = BufPool::new(8);
        {
            let _set = BufferSet::allocate(&pool, "s", 2, 128, single_plane(128, 16)).unwrap();
            assert_eq!(pool.free_len(), 0);
        }
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn plane_views_respect_layout() {
        let planes = smallvec::smallvec![
            PlaneDef {
                offset: 0,
                len: 32,
                stride: 16
            },
            PlaneDef {
                offset: 32,
                len: 16,
                stride: 16
            },
        ];
        let buf = MappedBuf::alloc("p", 48, planes).unwrap();
        assert_eq!(buf.plane(0).unwrap().len(), 32);
        assert_eq!(buf.plane(1).unwrap().len(), 16);
        assert!(buf.plane(2).is_err());
    }
}
