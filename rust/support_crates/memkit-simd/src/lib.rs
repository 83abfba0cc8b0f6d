//! Bulk zero and copy routines with runtime hardware dispatch.
//!
//! The widest available vector width is probed once per process and cached:
//! 32-byte lanes (AVX2), then 16-byte lanes (SSE2 on x86_64, NEON on aarch64),
//! otherwise an 8-way unrolled scalar loop. Bytes that do not fill a whole
//! vector lane are always handled by the scalar path.
//!
//! All routines accept a zero length and do nothing in that case.

use std::sync::OnceLock;

mod scalar;

#[cfg(target_arch = "x86_64")]
mod x86;

#[cfg(target_arch = "aarch64")]
mod neon;


/// Vector instruction tier used by the zero/copy routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimdLevel {
    /// 32-byte lanes.
    Avx2,
    /// 16-byte lanes.
    Sse2,
    /// 16-byte lanes.
    Neon,
    Scalar,
}

impl SimdLevel {
    pub const ALL: [SimdLevel; 4] = [
        SimdLevel::Avx2,
        SimdLevel::Sse2,
        SimdLevel::Neon,
        SimdLevel::Scalar,
    ];

    /// Width of one vector lane in bytes (8 for the scalar `u64` path).
    pub fn lane_width(self) -> usize {
        match self {
            SimdLevel::Avx2 => 32,
            SimdLevel::Sse2 | SimdLevel::Neon => 16,
            SimdLevel::Scalar => 8,
        }
    }

    /// Whether the current CPU can execute this tier.
    pub fn is_supported(self) -> bool {
        match self {
            SimdLevel::Scalar => true,
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 => std::arch::is_x86_feature_detected!("avx2"),
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Sse2 => std::arch::is_x86_feature_detected!("sse2"),
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => std::arch::is_aarch64_feature_detected!("neon"),
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    fn probe() -> SimdLevel {
        let level = [SimdLevel::Avx2, SimdLevel::Sse2, SimdLevel::Neon]
            .into_iter()
            .find(|level| level.is_supported())
            .unwrap_or(SimdLevel::Scalar);
        log::debug!("memkit-simd: using {level:?} ({} byte lanes)", level.lane_width());
        level
    }
}

/// Returns the vector tier selected for this process.
///
/// The probe runs on first use; every later call reads the cached value.
pub fn simd_level() -> SimdLevel {
    static LEVEL: OnceLock<SimdLevel> = OnceLock::new();
    *LEVEL.get_or_init(SimdLevel::probe)
}

/// Fills `dst` with zero bytes.
#[inline]
pub fn zero(dst: &mut [u8]) {
    zero_with(simd_level(), dst)
}

/// Copies `src` into `dst`.
///
/// # Panics
///
/// Panics if the two slices have different lengths.
#[inline]
pub fn copy(dst: &mut [u8], src: &[u8]) {
    copy_with(simd_level(), dst, src)
}

/// Same as [`zero`], using the given tier. Unsupported tiers run the scalar path.
pub fn zero_with(level: SimdLevel, dst: &mut [u8]) {
    unsafe { zero_raw_with(level, dst.as_mut_ptr(), dst.len()) }
}

/// Same as [`copy`], using the given tier. Unsupported tiers run the scalar path.
pub fn copy_with(level: SimdLevel, dst: &mut [u8], src: &[u8]) {
    assert_eq!(
        dst.len(),
        src.len(),
        "copy: destination and source lengths differ"
    );
    unsafe { copy_raw_with(level, dst.as_mut_ptr(), src.as_ptr(), dst.len()) }
}

/// Zeroes `len` bytes starting at `dst`.
///
/// # Safety
///
/// `dst` must be valid for writes of `len` bytes. When `len` is 0, `dst` is not
/// dereferenced and may be dangling or null.
#[inline]
pub unsafe fn zero_raw(dst: *mut u8, len: usize) {
    unsafe { zero_raw_with(simd_level(), dst, len) }
}

/// Copies `len` bytes from `src` to `dst`.
///
/// # Safety
///
/// `src` must be valid for reads and `dst` valid for writes of `len` bytes, and
/// the two regions must not overlap.
#[inline]
pub unsafe fn copy_raw(dst: *mut u8, src: *const u8, len: usize) {
    unsafe { copy_raw_with(simd_level(), dst, src, len) }
}

unsafe fn zero_raw_with(level: SimdLevel, dst: *mut u8, len: usize) {
    if len == 0 {
        return;
    }
    let level = effective(level);
    match level {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { x86::zero_avx2(dst, len) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { x86::zero_sse2(dst, len) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::zero_neon(dst, len) },
        _ => unsafe { scalar::zero(dst, len) },
    }
}

unsafe fn copy_raw_with(level: SimdLevel, dst: *mut u8, src: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let level = effective(level);
    match level {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { x86::copy_avx2(dst, src, len) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { x86::copy_sse2(dst, src, len) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::copy_neon(dst, src, len) },
        _ => unsafe { scalar::copy(dst, src, len) },
    }
}

#[inline]
fn effective(level: SimdLevel) -> SimdLevel {
    if level.is_supported() {
        level
    } else {
        SimdLevel::Scalar
    }
}
