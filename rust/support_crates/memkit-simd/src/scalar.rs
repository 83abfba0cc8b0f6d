//! Portable fallback, also used for the tail of every vector path.

/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
#[inline]
pub(crate) unsafe fn zero(dst: *mut u8, len: usize) {
    let mut i = 0;
    unsafe {
        while i + 64 <= len {
            let p = dst.add(i) as *mut u64;
            p.write_unaligned(0);
            p.add(1).write_unaligned(0);
            p.add(2).write_unaligned(0);
            p.add(3).write_unaligned(0);
            p.add(4).write_unaligned(0);
            p.add(5).write_unaligned(0);
            p.add(6).write_unaligned(0);
            p.add(7).write_unaligned(0);
            i += 64;
        }
        while i + 8 <= len {
            (dst.add(i) as *mut u64).write_unaligned(0);
            i += 8;
        }
        while i < len {
            dst.add(i).write(0);
            i += 1;
        }
    }
}

/// # Safety
///
/// `src` must be valid for reads and `dst` for writes of `len` bytes; the
/// regions must not overlap.
#[inline]
pub(crate) unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) {
    let mut i = 0;
    unsafe {
        while i + 64 <= len {
            let s = src.add(i) as *const u64;
            let d = dst.add(i) as *mut u64;
            let w0 = s.read_unaligned();
            let w1 = s.add(1).read_unaligned();
            let w2 = s.add(2).read_unaligned();
            let w3 = s.add(3).read_unaligned();
            let w4 = s.add(4).read_unaligned();
            let w5 = s.add(5).read_unaligned();
            let w6 = s.add(6).read_unaligned();
            let w7 = s.add(7).read_unaligned();
            d.write_unaligned(w0);
            d.add(1).write_unaligned(w1);
            d.add(2).write_unaligned(w2);
            d.add(3).write_unaligned(w3);
            d.add(4).write_unaligned(w4);
            d.add(5).write_unaligned(w5);
            d.add(6).write_unaligned(w6);
            d.add(7).write_unaligned(w7);
            i += 64;
        }
        while i + 8 <= len {
            let w = (src.add(i) as *const u64).read_unaligned();
            (dst.add(i) as *mut u64).write_unaligned(w);
            i += 8;
        }
        while i < len {
            dst.add(i).write(src.add(i).read());
            i += 1;
        }
    }
}
