/// Encryption boundary for drvault.
///
/// Every blob that leaves the machine is sealed with XChaCha20-Poly1305
/// under a single locally-held key, generated on first use. Checksums are
/// computed over the *encrypted* payload so storage-side corruption is
/// detectable without decrypting.
pub mod aead;
pub mod hash;
pub mod sensitive;
pub mod vault;
