use std::arch::aarch64::{vdupq_n_u8, vld1q_u8, vst1q_u8};

use crate::scalar;

#[target_feature(enable = "neon")]
pub(crate) unsafe fn zero_neon(dst: *mut u8, len: usize) {
    let mut i = 0;
    unsafe {
        let z = vdupq_n_u8(0);
        while i + 64 <= len {
            vst1q_u8(dst.add(i), z);
            vst1q_u8(dst.add(i + 16), z);
            vst1q_u8(dst.add(i + 32), z);
            vst1q_u8(dst.add(i + 48), z);
            i += 64;
        }
        while i + 16 <= len {
            vst1q_u8(dst.add(i), z);
            i += 16;
        }
        scalar::zero(dst.add(i), len - i);
    }
}

#[target_feature(enable = "neon")]
pub(crate) unsafe fn copy_neon(dst: *mut u8, src: *const u8, len: usize) {
    let mut i = 0;
    unsafe {
        while i + 16 <= len {
            let v = vld1q_u8(src.add(i));
            vst1q_u8(dst.add(i), v);
            i += 16;
        }
        scalar::copy(dst.add(i), src.add(i), len - i);
    }
}
