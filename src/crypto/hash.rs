/// BLAKE3 checksums for stored blobs.
///
/// Checksums are taken over the encrypted payload and stored alongside the
/// file entry, so replica divergence and storage-side corruption can be
/// detected without touching the key.

/// Hex-encoded BLAKE3 digest of `data`.
pub fn checksum_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Compare data against a stored hex digest.
pub fn verify_checksum(data: &[u8], expected_hex: &str) -> bool {
    checksum_hex(data) == expected_hex
}
