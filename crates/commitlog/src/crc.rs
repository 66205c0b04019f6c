//! Big-endian CRC32 used by the segment file format.
//!
//! Every integer that participates in a checksum is fed to the hasher in
//! network byte order, matching the on-disk encoding. A `u64` is hashed as its
//! low 32 bits followed by its high 32 bits.

use crc32fast::Hasher;

#[derive(Default)]
pub(crate) struct Crc32Be {
    hasher: Hasher,
}

impl Crc32Be {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, value: u32) {
        self.hasher.update(&value.to_be_bytes());
    }

    /// Low half first, then high half.
    pub fn write_u64(&mut self, value: u64) {
        self.write_u32((value & 0xffff_ffff) as u32);
        self.write_u32((value >> 32) as u32);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn checksum(self) -> u32 {
        self.hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_is_hashed_low_half_first() {
        let mut split = Crc32Be::new();
        split.write_u32(0xdead_beef);
        split.write_u32(0x0000_0001);

        let mut whole = Crc32Be::new();
        whole.write_u64(0x0000_0001_dead_beef);

        assert_eq!(split.checksum(), whole.checksum());
    }

    #[test]
    fn integers_match_their_be_byte_encoding() {
        let mut ints = Crc32Be::new();
        ints.write_u32(0x0102_0304);

        let mut bytes = Crc32Be::new();
        bytes.write_bytes(&[1, 2, 3, 4]);

        assert_eq!(ints.checksum(), bytes.checksum());
    }
}
