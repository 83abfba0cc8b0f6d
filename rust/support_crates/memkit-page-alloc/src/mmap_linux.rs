use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Maps `size` bytes (rounded up to whole pages) of anonymous read/write memory.
///
/// Returns the mapping address and its capacity. The memory is zero-filled by
/// the kernel. Release it with [`unmap`] passing the returned capacity.
pub fn map(size: usize) -> io::Result<(NonNull<u8>, usize)> {
    map_with(size, page_size(), 0)
}

/// Maps memory backed by huge pages (`MAP_HUGETLB`).
///
/// Fails unless the system has huge pages configured, e.g. through
/// `/proc/sys/vm/nr_hugepages` or `nr_overcommit_hugepages`.
pub fn map_large(size: usize) -> io::Result<(NonNull<u8>, usize)> {
    map_with(size, large_page_size(), libc::MAP_HUGETLB)
}

fn map_with(size: usize, granularity: usize, extra_flags: libc::c_int) -> io::Result<(NonNull<u8>, usize)> {
    assert!(granularity.is_power_of_two());
    let capacity = size
        .max(1)
        .checked_next_multiple_of(granularity)
        .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "mapping size overflow"))?;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8)
        .map(|p| (p, capacity))
        .ok_or_else(|| io::Error::other("mmap returned null"))
}

/// Unmaps a region returned by [`map`] or [`map_large`].
///
/// # Safety
///
/// `ptr` and `capacity` must come from one earlier `map`/`map_large` call, the
/// region must not have been unmapped already, and nothing may reference it
/// afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, capacity: usize) -> io::Result<()> {
    let res = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, capacity) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// System page size, cached after the first call. Defaults to 4 KiB if
/// `sysconf` fails.
pub fn page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if res > 0 { res as usize } else { 4 * 1024 }
    })
}

/// Huge page size from `/proc/meminfo` ("Hugepagesize:    2048 kB"),
/// cached after the first call. Defaults to 2 MiB.
pub fn large_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| read_large_page_size().unwrap_or(2 * 1024 * 1024))
}

fn read_large_page_size() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("Hugepagesize:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<usize>().ok()?;
    Some(kb * 1024)
}
