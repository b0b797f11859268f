//! Big-endian field helpers and the image CRC
//!
//! Multi-byte fields on the wire are always big-endian. The image CRC is the
//! MSB-first CRC-32 (polynomial 0x04C11DB7) with no input/output reflection
//! and no final xor, seeded by the caller. Seeded with [`CRC_SEED`] it is the
//! catalogued CRC-32/MPEG-2.

use crc::{Crc, CRC_32_MPEG_2};

/// CRC-32 calculator (MSB-first, poly 0x04C11DB7, no reflection, no xorout)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Seed used for whole-image checksums on both sides of the link
pub const CRC_SEED: u32 = 0xFFFF_FFFF;

/// Continue a CRC-32 computation from `seed` over `data`.
///
/// The register is returned as-is, so results chain:
/// `crc32(crc32(s, a), b) == crc32(s, a ++ b)`.
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut digest = CRC32.digest_with_initial(seed);
    digest.update(data);
    digest.finalize()
}

/// Read a big-endian u16 at `offset`
pub fn get_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian u32 at `offset`
pub fn get_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}
