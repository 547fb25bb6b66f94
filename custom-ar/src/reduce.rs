//! Element-wise sum kernels over raw device addresses.
//!
//! Every reduction folds contributions strictly in rank order
//! `((x0 + x1) + x2) + ...`, so all ranks computing the same element get the
//! same bits. This differs from a naive sequential sum only in float rounding
//! and is not "fixed" in either direction.

use half::{bf16, f16};

use crate::types::DataType;

/// Types the kernels can sum.
pub(crate) trait Summable: Copy + 'static {
    fn sum(a: Self, b: Self) -> Self;
}

macro_rules! impl_summable {
    (int: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn sum(a: Self, b: Self) -> Self {
                    a.wrapping_add(b)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn sum(a: Self, b: Self) -> Self {
                    a + b
                }
            }
        )*
    };
}

impl_summable!(int: i8, i32, i64, u8, u32, u64);
impl_summable!(float: f32, f64, f16, bf16);

/// Sum `count` elements from every address in `srcs`, in the order given,
/// into `dst`.
///
/// # Safety
/// Every address in `srcs` must be readable for `count` elements of `dtype`,
/// and no one may write those ranges while this runs. `dst` must hold at
/// least `count * dtype.size_in_bytes()` bytes.
pub(crate) unsafe fn sum_ranks(dst: &mut [u8], srcs: &[u64], count: usize, dtype: DataType) {
    debug_assert!(dst.len() >= count * dtype.size_in_bytes());
    unsafe {
        match dtype {
            DataType::F32 => sum_ranks_typed::<f32>(dst, srcs, count),
            DataType::F64 => sum_ranks_typed::<f64>(dst, srcs, count),
            DataType::F16 => sum_ranks_typed::<f16>(dst, srcs, count),
            DataType::BF16 => sum_ranks_typed::<bf16>(dst, srcs, count),
            DataType::I8 => sum_ranks_typed::<i8>(dst, srcs, count),
            DataType::I32 => sum_ranks_typed::<i32>(dst, srcs, count),
            DataType::I64 => sum_ranks_typed::<i64>(dst, srcs, count),
            DataType::U8 => sum_ranks_typed::<u8>(dst, srcs, count),
            DataType::U32 => sum_ranks_typed::<u32>(dst, srcs, count),
            DataType::U64 => sum_ranks_typed::<u64>(dst, srcs, count),
        }
    }
}

unsafe fn sum_ranks_typed<T: Summable>(dst: &mut [u8], srcs: &[u64], count: usize) {
    let Some((&first, rest)) = srcs.split_first() else {
        return;
    };
    let out = dst.as_mut_ptr() as *mut T;
    for i in 0..count {
        unsafe {
            let mut acc = (first as *const T).add(i).read_unaligned();
            for &src in rest {
                acc = T::sum(acc, (src as *const T).add(i).read_unaligned());
            }
            out.add(i).write_unaligned(acc);
        }
    }
}

/// Copy `len` bytes between device addresses. The ranges may overlap.
///
/// # Safety
/// Both ranges must be valid for `len` bytes.
pub(crate) unsafe fn copy_bytes(dst: u64, src: u64, len: usize) {
    if len == 0 || dst == src {
        return;
    }
    unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len) };
}
