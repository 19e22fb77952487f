//! Page-aligned, append-only memory regions (§3 "Slab", §4.2 "Ordering").
//!
//! Two flavors share the same bump-pointer reservation scheme: code slabs
//! (executable, W^X-toggled for patching) and data slabs (read/write
//! bookkeeping, e.g. the [`crate::block::ExecBlock`] arena). Both are
//! chained into singly-linked lists via [`Slab::next`]; they are freed only
//! when the owning `ExecCtx` is destroyed.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default size for a freshly-added code slab.
pub const DEFAULT_CODE_SLAB_SIZE: usize = 4 * 1024 * 1024;
/// Default size for a freshly-added data slab.
pub const DEFAULT_DATA_SLAB_SIZE: usize = 1024 * 1024;
/// Size of the scratch slab used for in-place recompiles (§4.4).
pub const SCRATCH_SLAB_SIZE: usize = 256 * 1024;

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call with a valid name.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// A raw, mmap-backed, append-only memory region.
///
/// Reservations are bump-pointer (`offset` only ever grows); there is no
/// per-reservation free. The whole region is released when the `Slab` is
/// dropped (which only happens when the owning `ExecCtx`, and therefore the
/// slab chain, is torn down).
pub struct Slab {
    ptr: *mut u8,
    size: usize,
    offset: AtomicUsize,
    /// Next slab in the chain (older slabs), if any.
    pub next: Option<Box<Slab>>,
}

// SAFETY: a `Slab` owns its mmap'd region exclusively; the only mutation
// through a shared reference is the monotonically increasing bump offset,
// which is updated atomically.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Allocate a new region of at least `size` bytes, rounded up to a page.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = round_up_to_page(size.max(page_size()));
        // SAFETY: anonymous, non-file-backed mapping; PROT_NONE would also
        // work here but we start writable since the first thing every slab
        // does is get written into before any code runs out of it.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: AtomicUsize::new(0),
            next: None,
        })
    }

    #[inline]
    pub fn start(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        // SAFETY: `size` bytes were reserved at `ptr` by mmap.
        unsafe { self.ptr.add(self.size) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.size - self.offset()
    }

    #[inline]
    pub fn cursor(&self) -> *mut u8 {
        // SAFETY: offset() <= size always holds.
        unsafe { self.ptr.add(self.offset()) }
    }

    /// `true` if `addr` falls within `[start, start + offset)` — i.e. it
    /// points at bytes this slab has actually produced, not unused tail
    /// capacity. Used by the shadow-stack slow path (§4.5) to decide
    /// whether a return address already lies in translated code.
    ///
    /// Per Design Note §9, the half-open convention chosen here is
    /// `[data, data + offset)`: an address exactly equal to `data + offset`
    /// (the current cursor, i.e. unwritten space) is *not* considered part
    /// of the slab.
    pub fn contains_produced(&self, addr: usize) -> bool {
        let start = self.ptr as usize;
        let off = self.offset();
        addr >= start && addr < start + off
    }

    /// Reserve `size` bytes from the bump pointer. Returns `None` if the
    /// slab is exhausted (§7 "out-of-space", recovered by the caller
    /// allocating a new slab).
    pub fn try_reserve(&self, size: usize) -> Option<*mut u8> {
        let mut cur = self.offset.load(Ordering::Acquire);
        loop {
            if size > self.size - cur {
                return None;
            }
            let new = cur + size;
            match self.offset.compare_exchange_weak(
                cur,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: [cur, cur+size) was just exclusively claimed.
                    return Some(unsafe { self.ptr.add(cur) });
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Reset the bump pointer to an earlier position. Used only when an
    /// in-place recompile (§4.4) rewinds the scratch slab between attempts;
    /// never used to reclaim space from completed reservations.
    pub fn rewind_to(&self, offset: usize) {
        assert!(offset <= self.offset());
        self.offset.store(offset, Ordering::Release);
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/size came from our own mmap call in `new`.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

/// A code slab: executable memory holding translated instructions.
///
/// Carries the per-slab invalidator helper pointer mentioned in §3 so that
/// invalidation trampolines emitted anywhere in this slab can reach it with
/// a direct near call.
pub struct CodeSlab {
    pub slab: Slab,
    pub invalidator: Option<usize>,
}

impl CodeSlab {
    pub fn new(size: usize) -> io::Result<Self> {
        Ok(Self {
            slab: Slab::new(size)?,
            invalidator: None,
        })
    }
}

/// A data slab: read/write bookkeeping memory (the backing store for the
/// [`crate::block::ExecBlock`] arena, shadow-stack overflow pages, etc).
pub struct DataSlab {
    pub slab: Slab,
}

impl DataSlab {
    pub fn new(size: usize) -> io::Result<Self> {
        Ok(Self {
            slab: Slab::new(size)?,
        })
    }
}

/// RAII capability that makes a code region writable ("thaw") on
/// construction and restores it to executable ("freeze") plus flushes the
/// instruction cache on drop.
///
/// Per Design Note §9, all code-slab writes must go through this type so
/// there is no way to forget the freeze/flush half of the pair; holding one
/// implies `code_lock` is held by the caller (not enforced in the type
/// system here, since the lock lives on `ExecCtx`, one layer up — callers
/// must obtain the writer only while holding it).
pub struct CodeSlabWriter<'a> {
    slab: &'a Slab,
    base: usize,
    len: usize,
}

impl<'a> CodeSlabWriter<'a> {
    /// Open a writer over `[base, base+len)` within `slab`, thawing those
    /// pages for the duration of the borrow.
    pub fn open(slab: &'a Slab, base: usize, len: usize) -> io::Result<Self> {
        protect(slab.start() as usize, slab.size(), Protection::ReadWrite)?;
        Ok(Self { slab, base, len })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to `base + offset` within the thawed window.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len);
        // SAFETY: base+offset lies within the slab, checked above and by
        // the caller having derived `base`/`len` from the slab itself.
        unsafe { (self.base as *mut u8).add(offset) }
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len, "write exceeds reserved stub capacity");
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr_at(offset), bytes.len());
        }
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len);
        unsafe { (self.ptr_at(offset) as *const u32).read_unaligned() }
    }
}

impl<'a> Drop for CodeSlabWriter<'a> {
    fn drop(&mut self) {
        let _ = protect(self.slab.start() as usize, self.slab.size(), Protection::ReadExecute);
        flush_icache(self.base, self.len);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    ReadWrite,
    ReadExecute,
}

fn protect(addr: usize, len: usize, prot: Protection) -> io::Result<()> {
    let flags = match prot {
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    };
    // SAFETY: addr/len describe a region previously mapped by `Slab::new`.
    let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, flags) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Architectural instruction-cache flush (§4.2 "Ordering").
///
/// x86/x86-64 hardware keeps the icache coherent with the dcache for
/// same-core execution, so no explicit flush instruction is required; the
/// serializing side effect still matters cross-core, which is provided by
/// `mprotect` itself (a syscall) acting as a full barrier. This function is
/// kept as an explicit step — rather than relied upon implicitly — so the
/// freeze/flush pairing stays visible at every call site and the behavior
/// is one `cfg`-gated place to amend if a non-x86 backend is ever added.
#[inline]
fn flush_icache(_base: usize, _len: usize) {
    std::sync::atomic::fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_bumps_offset() {
        let slab = Slab::new(4096).unwrap();
        assert_eq!(slab.offset(), 0);
        let a = slab.try_reserve(64).unwrap();
        let b = slab.try_reserve(64).unwrap();
        assert_eq!(slab.offset(), 128);
        assert_ne!(a, b);
    }

    #[test]
    fn reserve_fails_when_exhausted() {
        let page = page_size();
        let slab = Slab::new(page).unwrap();
        assert!(slab.try_reserve(page + 1).is_none());
        assert!(slab.try_reserve(page).is_some());
        assert!(slab.try_reserve(1).is_none());
    }

    #[test]
    fn contains_produced_is_half_open() {
        let slab = Slab::new(4096).unwrap();
        let start = slab.start() as usize;
        slab.try_reserve(16).unwrap();
        assert!(slab.contains_produced(start));
        assert!(slab.contains_produced(start + 15));
        assert!(!slab.contains_produced(start + 16), "cursor itself is unwritten");
        assert!(!slab.contains_produced(start + 4096));
    }

    #[test]
    fn writer_roundtrip() {
        let slab = Slab::new(4096).unwrap();
        let base = slab.start() as usize;
        {
            let mut w = CodeSlabWriter::open(&slab, base, 4096).unwrap();
            w.write_u32(0, 0xdead_beef);
        }
        // SAFETY: region is back to RX; read via the original mapping since
        // we only ever wrote a plain u32 (no instruction fetch required for
        // this check).
        let value = unsafe { (base as *const u32).read_unaligned() };
        assert_eq!(value, 0xdead_beef);
    }
}
