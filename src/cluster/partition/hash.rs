/// Size of a record key digest.
pub const DIGEST_SIZE: usize = 20;

/// Maps a record digest to its partition id.
///
/// The first two digest bytes are read as a little-endian `u16` and reduced
/// modulo the partition count, the same placement the server uses.
pub fn partition_of(digest: &[u8; DIGEST_SIZE], partition_count: u32) -> u32 {
    if partition_count == 0 {
        return 0;
    }
    let raw = u16::from_le_bytes([digest[0], digest[1]]) as u32;
    raw % partition_count
}

/// Length of the base64 text encoding a bitmap of `partition_count` bits.
pub fn bitmap_base64_len(partition_count: u32) -> usize {
    let bytes = bitmap_len(partition_count);
    bytes.div_ceil(3) * 4
}

/// Bytes needed for one bit per partition.
pub fn bitmap_len(partition_count: u32) -> usize {
    (partition_count as usize).div_ceil(8)
}

/// Tests bit `index` of a most-significant-bit-first bitmap.
pub fn bitmap_contains(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index >> 3)
        .is_some_and(|byte| byte & (0x80 >> (index & 7)) != 0)
}
