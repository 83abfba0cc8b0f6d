use std::arch::x86_64::{
    __m128i, __m256i, _mm_loadu_si128, _mm_setzero_si128, _mm_storeu_si128,
    _mm256_loadu_si256, _mm256_setzero_si256, _mm256_storeu_si256,
};

use crate::scalar;

#[target_feature(enable = "avx2")]
pub(crate) unsafe fn zero_avx2(dst: *mut u8, len: usize) {
    let mut i = 0;
    unsafe {
        let z = _mm256_setzero_si256();
        // Four lanes per iteration to keep the store ports busy.
        while i + 128 <= len {
            _mm256_storeu_si256(dst.add(i) as *mut __m256i, z);
            _mm256_storeu_si256(dst.add(i + 32) as *mut __m256i, z);
            _mm256_storeu_si256(dst.add(i + 64) as *mut __m256i, z);
            _mm256_storeu_si256(dst.add(i + 96) as *mut __m256i, z);
            i += 128;
        }
        while i + 32 <= len {
            _mm256_storeu_si256(dst.add(i) as *mut __m256i, z);
            i += 32;
        }
        scalar::zero(dst.add(i), len - i);
    }
}

#[target_feature(enable = "avx2")]
pub(crate) unsafe fn copy_avx2(dst: *mut u8, src: *const u8, len: usize) {
    let mut i = 0;
    unsafe {
        while i + 128 <= len {
            let a = _mm256_loadu_si256(src.add(i) as *const __m256i);
            let b = _mm256_loadu_si256(src.add(i + 32) as *const __m256i);
            let c = _mm256_loadu_si256(src.add(i + 64) as *const __m256i);
            let d = _mm256_loadu_si256(src.add(i + 96) as *const __m256i);
            _mm256_storeu_si256(dst.add(i) as *mut __m256i, a);
            _mm256_storeu_si256(dst.add(i + 32) as *mut __m256i, b);
            _mm256_storeu_si256(dst.add(i + 64) as *mut __m256i, c);
            _mm256_storeu_si256(dst.add(i + 96) as *mut __m256i, d);
            i += 128;
        }
        while i + 32 <= len {
            let a = _mm256_loadu_si256(src.add(i) as *const __m256i);
            _mm256_storeu_si256(dst.add(i) as *mut __m256i, a);
            i += 32;
        }
        scalar::copy(dst.add(i), src.add(i), len - i);
    }
}

#[target_feature(enable = "sse2")]
pub(crate) unsafe fn zero_sse2(dst: *mut u8, len: usize) {
    let mut i = 0;
    unsafe {
        let z = _mm_setzero_si128();
        while i + 64 <= len {
            _mm_storeu_si128(dst.add(i) as *mut __m128i, z);
            _mm_storeu_si128(dst.add(i + 16) as *mut __m128i, z);
            _mm_storeu_si128(dst.add(i + 32) as *mut __m128i, z);
            _mm_storeu_si128(dst.add(i + 48) as *mut __m128i, z);
            i += 64;
        }
        while i + 16 <= len {
            _mm_storeu_si128(dst.add(i) as *mut __m128i, z);
            i += 16;
        }
        scalar::zero(dst.add(i), len - i);
    }
}

#[target_feature(enable = "sse2")]
pub(crate) unsafe fn copy_sse2(dst: *mut u8, src: *const u8, len: usize) {
    let mut i = 0;
    unsafe {
        while i + 64 <= len {
            let a = _mm_loadu_si128(src.add(i) as *const __m128i);
            let b = _mm_loadu_si128(src.add(i + 16) as *const __m128i);
            let c = _mm_loadu_si128(src.add(i + 32) as *const __m128i);
            let d = _mm_loadu_si128(src.add(i + 48) as *const __m128i);
            _mm_storeu_si128(dst.add(i) as *mut __m128i, a);
            _mm_storeu_si128(dst.add(i + 16) as *mut __m128i, b);
            _mm_storeu_si128(dst.add(i + 32) as *mut __m128i, c);
            _mm_storeu_si128(dst.add(i + 48) as *mut __m128i, d);
            i += 64;
        }
        while i + 16 <= len {
            let a = _mm_loadu_si128(src.add(i) as *const __m128i);
            _mm_storeu_si128(dst.add(i) as *mut __m128i, a);
            i += 16;
        }
        scalar::copy(dst.add(i), src.add(i), len - i);
    }
}
