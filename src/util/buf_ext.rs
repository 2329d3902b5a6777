use crate::error::{JuiceNetError, JuiceNetResult};
use bytes::{Buf, BufMut};

macro_rules! read_checked_impl {
    ($reader: ident, $ty:ty, $getter: ident) => {
        fn $reader(&mut self) -> JuiceNetResult<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(JuiceNetError::malformed(format!(
                    "buffer underflow reading {}: {} bytes left", stringify!($ty), self.remaining()
                )));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked little-endian reads: running out of bytes is a malformed packet rather
///  than a panic.
pub trait BufExt: Buf {
    read_checked_impl!(read_u8_checked, u8, get_u8);
    read_checked_impl!(read_u16_le_checked, u16, get_u16_le);
    read_checked_impl!(read_u32_le_checked, u32, get_u32_le);

    fn read_bytes_checked(&mut self, len: usize) -> JuiceNetResult<Vec<u8>> {
        if self.remaining() < len {
            return Err(JuiceNetError::malformed(format!(
                "declared length {} exceeds the {} remaining bytes", len, self.remaining()
            )));
        }
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// u16 length prefix followed by UTF-8 bytes
    fn read_string_checked(&mut self) -> JuiceNetResult<String> {
        let len = self.read_u16_le_checked()? as usize;
        let raw = self.read_bytes_checked(len)?;
        String::from_utf8(raw)
            .map_err(|e| JuiceNetError::malformed(format!("string is not valid UTF-8: {}", e)))
    }
}

pub trait BufMutExt: BufMut {
    /// Callers ensure the string fits a u16 length prefix
    fn put_string_le(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.put_u16_le(s.len() as u16);
        self.put_slice(s.as_bytes());
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
