/// The crc32 checksum reported for a stored original.
pub fn crc_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::default();
    hasher.update(data);
    hasher.finalize()
}
