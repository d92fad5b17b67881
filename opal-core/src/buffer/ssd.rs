use crate::buffer::page::{PAGE_ALIGNMENT, PageID, PageSizeClass, SIZE_CLASS_COUNT};
use crate::error::{Error, Result};
use libc::{O_CREAT, O_DIRECT, O_RDWR, S_IFMT, S_IFREG, c_void, close, fstat, ftruncate, open};
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[inline]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Durable backing store for all size classes.
///
/// One fixed byte range per size class, indexed by `PageID::index`:
/// page `{k, i}` occupies `[base_k + i*size_k, base_k + (i+1)*size_k)`.
/// There is no header or checksum; the layout is raw blocks.
///
/// The file is opened with `O_DIRECT` so transfers bypass the OS page
/// cache; filesystems that reject direct I/O (tmpfs) fall back to
/// buffered transfers with the same alignment discipline. Reads and
/// writes are blocking and full-page.
pub struct SsdRegion {
    fd: RawFd,
    class_bases: [usize; SIZE_CLASS_COUNT],
    class_capacities: [usize; SIZE_CLASS_COUNT],
    reads: AtomicU64,
    writes: AtomicU64,
}

unsafe impl Send for SsdRegion {}
unsafe impl Sync for SsdRegion {}

impl SsdRegion {
    /// Open or create the backing file/device and reserve one region
    /// per size class sized for `capacities[k]` pages.
    pub fn create(path: impl AsRef<Path>, capacities: [usize; SIZE_CLASS_COUNT]) -> Result<Self> {
        let c_path = CString::new(path.as_ref().to_string_lossy().as_bytes())
            .map_err(|_| Error::InvalidArgument)?;
        let mut fd = unsafe { open(c_path.as_ptr(), O_CREAT | O_RDWR | O_DIRECT, 0o644) };
        if fd < 0 {
            // tmpfs and some filesystems reject O_DIRECT.
            fd = unsafe { open(c_path.as_ptr(), O_CREAT | O_RDWR, 0o644) };
        }
        if fd < 0 {
            return Err(Error::Io { errno: last_errno() });
        }
        let guard = scopeguard::guard(fd, |fd| unsafe {
            close(fd);
        });

        let mut class_bases = [0usize; SIZE_CLASS_COUNT];
        let mut total = 0usize;
        for (k, class) in PageSizeClass::all().enumerate() {
            class_bases[k] = total;
            total += capacities[k] * class.bytes();
        }

        // Size regular files up front (sparse); block devices keep
        // their native size.
        unsafe {
            let mut st = MaybeUninit::<libc::stat>::zeroed();
            if fstat(fd, st.as_mut_ptr()) != 0 {
                return Err(Error::Io { errno: last_errno() });
            }
            let st = st.assume_init();
            if (st.st_mode & S_IFMT) == S_IFREG && ftruncate(fd, total as i64) != 0 {
                return Err(Error::Io { errno: last_errno() });
            }
        }

        scopeguard::ScopeGuard::into_inner(guard);
        log::info!(
            "ssd region opened at {} ({} bytes across {} size classes)",
            path.as_ref().display(),
            total,
            SIZE_CLASS_COUNT
        );
        Ok(SsdRegion {
            fd,
            class_bases,
            class_capacities: capacities,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    #[inline]
    fn byte_offset(&self, page_id: PageID) -> usize {
        let class = page_id.size_class();
        debug_assert!((page_id.index() as usize) < self.class_capacities[class as usize]);
        self.class_bases[class as usize] + page_id.index() as usize * class.bytes()
    }

    /// Copy the on-disk bytes of `page_id` into `dst`.
    ///
    /// `dst` must be aligned to the direct-I/O boundary and hold a
    /// full page of the identified class. Blocks until the transfer
    /// completes.
    pub fn read_page(&self, page_id: PageID, dst: *mut u8) -> Result<()> {
        debug_assert!(page_id.valid());
        debug_assert!(dst as usize % PAGE_ALIGNMENT == 0);
        let len = page_id.num_bytes();
        let mut offset = self.byte_offset(page_id);
        let mut remaining = len;
        let mut ptr = dst;
        while remaining > 0 {
            let n = unsafe { libc::pread(self.fd, ptr as *mut c_void, remaining, offset as i64) };
            if n < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(Error::Io { errno });
            }
            if n == 0 {
                return Err(Error::Io { errno: 0 });
            }
            remaining -= n as usize;
            offset += n as usize;
            ptr = unsafe { ptr.add(n as usize) };
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Durably write `src` to the slot for `page_id`.
    pub fn write_page(&self, page_id: PageID, src: *const u8) -> Result<()> {
        debug_assert!(page_id.valid());
        debug_assert!(src as usize % PAGE_ALIGNMENT == 0);
        let len = page_id.num_bytes();
        let mut offset = self.byte_offset(page_id);
        let mut remaining = len;
        let mut ptr = src;
        while remaining > 0 {
            let n = unsafe { libc::pwrite(self.fd, ptr as *const c_void, remaining, offset as i64) };
            if n < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(Error::Io { errno });
            }
            remaining -= n as usize;
            offset += n as usize;
            ptr = unsafe { ptr.add(n as usize) };
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of completed page reads.
    #[inline]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of completed page writes.
    #[inline]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Maximum number of pages per size class.
    #[inline]
    pub fn capacity(&self, class: PageSizeClass) -> usize {
        self.class_capacities[class as usize]
    }
}

impl Drop for SsdRegion {
    fn drop(&mut self) {
        unsafe {
            close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use tempfile::TempDir;

    struct AlignedBuf {
        ptr: *mut u8,
        layout: Layout,
    }

    impl AlignedBuf {
        fn new(len: usize) -> Self {
            let layout = Layout::from_size_align(len, PAGE_ALIGNMENT).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            AlignedBuf { ptr, layout }
        }

        fn as_slice_mut(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
        }
    }

    impl Drop for AlignedBuf {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn small_capacities() -> [usize; SIZE_CLASS_COUNT] {
        [4; SIZE_CLASS_COUNT]
    }

    #[test]
    fn test_ssd_region_roundtrip() {
        let dir = TempDir::new().unwrap();
        let region = SsdRegion::create(dir.path().join("pages.bin"), small_capacities()).unwrap();
        let page_id = PageID::new(PageSizeClass::KiB4, 2);

        let mut wbuf = AlignedBuf::new(page_id.num_bytes());
        for (i, b) in wbuf.as_slice_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        region.write_page(page_id, wbuf.ptr).unwrap();

        let mut rbuf = AlignedBuf::new(page_id.num_bytes());
        region.read_page(page_id, rbuf.ptr).unwrap();
        for (i, b) in rbuf.as_slice_mut().iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8);
        }
        assert_eq!(region.read_count(), 1);
        assert_eq!(region.write_count(), 1);
    }

    #[test]
    fn test_ssd_region_class_slots_do_not_overlap() {
        let dir = TempDir::new().unwrap();
        let region = SsdRegion::create(dir.path().join("pages.bin"), small_capacities()).unwrap();
        let a = PageID::new(PageSizeClass::KiB4, 3);
        let b = PageID::new(PageSizeClass::KiB8, 0);

        let mut abuf = AlignedBuf::new(a.num_bytes());
        abuf.as_slice_mut().fill(0xAA);
        region.write_page(a, abuf.ptr).unwrap();

        let mut bbuf = AlignedBuf::new(b.num_bytes());
        bbuf.as_slice_mut().fill(0xBB);
        region.write_page(b, bbuf.ptr).unwrap();

        let mut back = AlignedBuf::new(a.num_bytes());
        region.read_page(a, back.ptr).unwrap();
        assert!(back.as_slice_mut().iter().all(|&x| x == 0xAA));
    }
}
