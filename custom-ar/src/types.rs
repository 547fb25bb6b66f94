/// Rank of a participant in a communicator (0-indexed).
pub type Rank = u32;

/// Ordinal of a device on this host.
pub type DeviceId = u32;

/// Element types the reduction kernels can sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

mod private {
    pub trait Sealed {}
}

/// Scalar types that can live in device buffers handled by this crate.
///
/// Every bit pattern of an implementor is a valid value, so buffers can be
/// reinterpreted freely between bytes and elements.
pub trait Element: private::Sealed + Copy + Send + Sync + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_element!(
    f32 => F32,
    f64 => F64,
    half::f16 => F16,
    half::bf16 => BF16,
    i8 => I8,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
    u64 => U64,
);
