//! Fixed-width values readable and writable at a handle

/// A value with a fixed native-endian byte representation
pub trait Primitive: Copy {
    const SIZE: usize;

    /// `bytes` is exactly `SIZE` long.
    fn read_ne(bytes: &[u8]) -> Self;

    /// `bytes` is exactly `SIZE` long.
    fn write_ne(self, bytes: &mut [u8]);
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }

                #[inline]
                fn write_ne(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_primitive!(i8, u8, i16, u16, i32, u32, f32, i64, u64, f64);

impl Primitive for bool {
    const SIZE: usize = 1;

    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    #[inline]
    fn write_ne(self, bytes: &mut [u8]) {
        bytes[0] = self as u8;
    }
}
