//! Content digest types and hashing utilities.
//!
//! A [`Digest`] pairs a fixed-width hash payload with its algorithm tag and an
//! optional one-character suffix used to namespace object roles (catalog,
//! history, certificate, ...). The hex wire format is
//! `lowercase-hex[-algo-id][suffix]`; MD5 and SHA-1 carry an empty algorithm
//! id for backwards compatibility, RIPEMD-160 and SHAKE-128 are tagged.

use crate::error::{Error, Result};
use md5::Digest as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::digest::{ExtendableOutput, Update as _, XofReader};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Widest digest payload across all supported algorithms.
pub const MAX_DIGEST_BYTES: usize = 20;

/// Read granularity for file and reader hashing.
const IO_CHUNK_SIZE: usize = 4096;

/// Suffix tagging a catalog object.
pub const SUFFIX_CATALOG: char = 'C';
/// Suffix tagging a history database.
pub const SUFFIX_HISTORY: char = 'H';
/// Suffix tagging a micro catalog.
pub const SUFFIX_MICRO_CATALOG: char = 'L';
/// Suffix tagging a partial file chunk.
pub const SUFFIX_PARTIAL: char = 'P';
/// Suffix tagging a temporary object.
pub const SUFFIX_TEMPORARY: char = 'T';
/// Suffix tagging a certificate.
pub const SUFFIX_CERTIFICATE: char = 'X';
/// Suffix tagging repository meta info.
pub const SUFFIX_METAINFO: char = 'M';

/// Supported digest algorithms.
///
/// The wire values double as flags in the cache manager protocol and must not
/// be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Md5 = 0,
    Sha1 = 1,
    Rmd160 = 2,
    Shake128 = 3,
}

impl Algorithm {
    /// All algorithms in wire order.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Md5,
        Algorithm::Sha1,
        Algorithm::Rmd160,
        Algorithm::Shake128,
    ];

    /// Payload width in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            Algorithm::Md5 => 16,
            Algorithm::Sha1 | Algorithm::Rmd160 | Algorithm::Shake128 => 20,
        }
    }

    /// Identifier appended to the hex form. Empty for MD5 and SHA-1.
    pub fn hex_id(self) -> &'static str {
        match self {
            Algorithm::Md5 | Algorithm::Sha1 => "",
            Algorithm::Rmd160 => "-rmd160",
            Algorithm::Shake128 => "-shake128",
        }
    }

    /// HMAC block size in bytes.
    pub fn block_size(self) -> usize {
        match self {
            Algorithm::Md5 | Algorithm::Sha1 | Algorithm::Rmd160 => 64,
            Algorithm::Shake128 => 168,
        }
    }

    /// Wire value used in protocol frames.
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Decode a protocol wire value.
    pub fn from_wire(value: u8) -> Option<Algorithm> {
        match value {
            0 => Some(Algorithm::Md5),
            1 => Some(Algorithm::Sha1),
            2 => Some(Algorithm::Rmd160),
            3 => Some(Algorithm::Shake128),
            _ => None,
        }
    }

    /// Lowercase name for logs and config values.
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha1 => "sha1",
            Algorithm::Rmd160 => "rmd160",
            Algorithm::Shake128 => "shake128",
        }
    }
}

/// Parse an algorithm name from a configuration value.
pub fn parse_algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "md5" => Some(Algorithm::Md5),
        "sha1" => Some(Algorithm::Sha1),
        "rmd160" => Some(Algorithm::Rmd160),
        "shake128" => Some(Algorithm::Shake128),
        _ => None,
    }
}

/// A content digest: algorithm tag, fixed-width payload, optional suffix.
///
/// Equality, ordering, and hashing are over (algorithm, payload) only; the
/// suffix is metadata. Digests are immutable once constructed.
#[derive(Clone, Copy)]
pub struct Digest {
    algorithm: Algorithm,
    bytes: [u8; MAX_DIGEST_BYTES],
    suffix: Option<char>,
}

impl Digest {
    /// Construct from a raw payload. The slice length must equal the
    /// algorithm's digest size.
    pub fn from_bytes(algorithm: Algorithm, payload: &[u8]) -> Result<Self> {
        if payload.len() != algorithm.digest_size() {
            return Err(Error::InvalidDigest(format!(
                "expected {} payload bytes for {}, got {}",
                algorithm.digest_size(),
                algorithm.name(),
                payload.len()
            )));
        }
        let mut bytes = [0u8; MAX_DIGEST_BYTES];
        bytes[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            algorithm,
            bytes,
            suffix: None,
        })
    }

    /// The all-zero digest for an algorithm, used as "no reference".
    pub fn null(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            bytes: [0u8; MAX_DIGEST_BYTES],
            suffix: None,
        }
    }

    /// Parse the hex wire form, deducing algorithm and suffix from the shape.
    ///
    /// Accepted grammar: `lowercase-hex{2*digest_size}[-algo-id][suffix]`
    /// where the suffix is a single printable character outside `[0-9a-f]`.
    pub fn parse_hex(s: &str) -> Result<Self> {
        for algorithm in Algorithm::ALL {
            let hex_len = 2 * algorithm.digest_size();
            let id = algorithm.hex_id();
            let base_len = hex_len + id.len();
            if s.len() != base_len && s.len() != base_len + 1 {
                continue;
            }
            if !s.is_char_boundary(hex_len) || !s.is_char_boundary(base_len) {
                continue;
            }
            if !s.as_bytes()[..hex_len].iter().all(|b| is_hex_char(*b)) {
                continue;
            }
            if &s[hex_len..base_len] != id {
                continue;
            }
            let suffix = if s.len() == base_len + 1 {
                let c = s.as_bytes()[base_len] as char;
                if !is_suffix_char(c) {
                    return Err(Error::InvalidDigest(format!("invalid suffix in {s:?}")));
                }
                Some(c)
            } else {
                None
            };

            let mut bytes = [0u8; MAX_DIGEST_BYTES];
            for (i, pair) in s.as_bytes()[..hex_len].chunks(2).enumerate() {
                bytes[i] = hex_nibble(pair[0]) * 16 + hex_nibble(pair[1]);
            }
            return Ok(Self {
                algorithm,
                bytes,
                suffix,
            });
        }
        Err(Error::InvalidDigest(format!("unparseable digest {s:?}")))
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The payload bytes, exactly `algorithm().digest_size()` long.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.algorithm.digest_size()]
    }

    /// The suffix character, if any.
    pub fn suffix(&self) -> Option<char> {
        self.suffix
    }

    /// Return a copy carrying the given suffix.
    pub fn with_suffix(mut self, suffix: char) -> Self {
        debug_assert!(is_suffix_char(suffix));
        self.suffix = Some(suffix);
        self
    }

    /// True if every payload byte is zero.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// Lowercase hex form including the algorithm id, without suffix.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(2 * MAX_DIGEST_BYTES + 9);
        for b in self.as_bytes() {
            out.push(hex_char(b >> 4));
            out.push(hex_char(b & 0xf));
        }
        out.push_str(self.algorithm.hex_id());
        out
    }

    /// Hex form with the suffix appended, when one is set.
    pub fn to_hex_suffixed(&self) -> String {
        let mut out = self.to_hex();
        if let Some(suffix) = self.suffix {
            out.push(suffix);
        }
        out
    }

    /// Uppercase colon-separated form, openssl x509 fingerprint style.
    pub fn fingerprint(&self) -> String {
        let payload = self.as_bytes();
        let mut out = String::with_capacity(3 * payload.len() + 9);
        for (i, b) in payload.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push(hex_char(b >> 4).to_ascii_uppercase());
            out.push(hex_char(b & 0xf).to_ascii_uppercase());
        }
        out.push_str(&self.algorithm.hex_id().to_ascii_uppercase());
        out
    }

    /// Relative cache path: one directory level of two hex digits, suffix
    /// appended. `ab/cdef...C`
    pub fn cache_path(&self) -> String {
        self.cache_path_explicit(1, 2, self.suffix)
    }

    /// Cache path without the suffix character.
    pub fn cache_path_without_suffix(&self) -> String {
        self.cache_path_explicit(1, 2, None)
    }

    /// Cache path with configurable directory levels and digits per level.
    pub fn cache_path_explicit(
        &self,
        dir_levels: usize,
        digits_per_level: usize,
        suffix: Option<char>,
    ) -> String {
        let hex = self.to_hex();
        let mut out = String::with_capacity(hex.len() + dir_levels + 1);
        for (i, c) in hex.chars().enumerate() {
            if i > 0 && i % digits_per_level == 0 && i / digits_per_level <= dir_levels {
                out.push('/');
            }
            out.push(c);
        }
        if let Some(suffix) = suffix {
            out.push(suffix);
        }
        out
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Digest {}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.algorithm.hash(state);
        self.as_bytes().hash(state);
    }
}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Digest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.algorithm
            .cmp(&other.algorithm)
            .then_with(|| self.as_bytes().cmp(other.as_bytes()))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex_suffixed())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex_suffixed())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn is_hex_char(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// The suffix alphabet: printable ASCII outside the lowercase hex alphabet.
fn is_suffix_char(c: char) -> bool {
    c.is_ascii_graphic() && !is_hex_char(c as u8)
}

fn hex_nibble(b: u8) -> u8 {
    if b.is_ascii_digit() { b - b'0' } else { b - b'a' + 10 }
}

fn hex_char(nibble: u8) -> char {
    (if nibble <= 9 {
        b'0' + nibble
    } else {
        b'a' + nibble - 10
    }) as char
}

/// Incremental hasher over any supported algorithm.
enum Hasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Rmd160(ripemd::Ripemd160),
    Shake128(sha3::Shake128),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Md5 => Hasher::Md5(md5::Md5::new()),
            Algorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            Algorithm::Rmd160 => Hasher::Rmd160(ripemd::Ripemd160::new()),
            Algorithm::Shake128 => Hasher::Shake128(sha3::Shake128::default()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => md5::Digest::update(h, data),
            Hasher::Sha1(h) => md5::Digest::update(h, data),
            Hasher::Rmd160(h) => md5::Digest::update(h, data),
            Hasher::Shake128(h) => h.update(data),
        }
    }

    fn finish(self) -> Digest {
        let mut bytes = [0u8; MAX_DIGEST_BYTES];
        let algorithm = match self {
            Hasher::Md5(h) => {
                bytes[..16].copy_from_slice(&h.finalize());
                Algorithm::Md5
            }
            Hasher::Sha1(h) => {
                bytes[..20].copy_from_slice(&h.finalize());
                Algorithm::Sha1
            }
            Hasher::Rmd160(h) => {
                bytes[..20].copy_from_slice(&h.finalize());
                Algorithm::Rmd160
            }
            Hasher::Shake128(h) => {
                // SHAKE-128 squeezed to the fixed digest width.
                let mut reader = h.finalize_xof();
                XofReader::read(&mut reader, &mut bytes[..20]);
                Algorithm::Shake128
            }
        };
        Digest {
            algorithm,
            bytes,
            suffix: None,
        }
    }
}

/// Hash an in-memory buffer.
pub fn hash_mem(data: &[u8], algorithm: Algorithm) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finish()
}

/// Hash a string's bytes.
pub fn hash_string(content: &str, algorithm: Algorithm) -> Digest {
    hash_mem(content.as_bytes(), algorithm)
}

/// Fast digest for path names. Never allocates beyond the digest itself.
pub fn md5_path(path: &str) -> Digest {
    let mut hasher = md5::Md5::new();
    md5::Digest::update(&mut hasher, path.as_bytes());
    let mut bytes = [0u8; MAX_DIGEST_BYTES];
    bytes[..16].copy_from_slice(&hasher.finalize());
    Digest {
        algorithm: Algorithm::Md5,
        bytes,
        suffix: None,
    }
}

/// Hash a reader in 4 KiB chunks. Interrupted reads are retried, any other
/// read error is propagated.
pub fn hash_reader<R: Read>(reader: &mut R, algorithm: Algorithm) -> Result<Digest> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; IO_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(hasher.finish())
}

/// Hash a file's contents.
pub fn hash_file(path: impl AsRef<Path>, algorithm: Algorithm) -> Result<Digest> {
    let mut file = std::fs::File::open(path)?;
    hash_reader(&mut file, algorithm)
}

/// RFC 2104 HMAC with the classic ipad/opad construction.
///
/// Block sizes are 64 bytes for MD5/SHA-1/RIPEMD-160 and 168 bytes for
/// SHAKE-128 (its sponge rate).
pub fn hmac(key: &[u8], message: &[u8], algorithm: Algorithm) -> Digest {
    let block_size = algorithm.block_size();
    let mut key_block = vec![0u8; block_size];
    if key.len() > block_size {
        let hashed = hash_mem(key, algorithm);
        key_block[..hashed.as_bytes().len()].copy_from_slice(hashed.as_bytes());
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Hasher::new(algorithm);
    let pad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&pad);
    inner.update(message);
    let inner_digest = inner.finish();

    let mut outer = Hasher::new(algorithm);
    let pad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&pad);
    outer.update(inner_digest.as_bytes());
    outer.finish()
}

/// HMAC over a string message.
pub fn hmac_string(key: &[u8], message: &str, algorithm: Algorithm) -> Digest {
    hmac(key, message.as_bytes(), algorithm)
}

/// HMAC-SHA256 raw output, for auxiliary signatures outside the fixed-width
/// digest family.
pub fn hmac_sha256_raw(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK: usize = 64;
    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        let hashed = sha2::Sha256::digest(key);
        key_block[..32].copy_from_slice(&hashed);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = sha2::Sha256::new();
    let mut pad = [0u8; BLOCK];
    for (p, k) in pad.iter_mut().zip(key_block.iter()) {
        *p = k ^ 0x36;
    }
    md5::Digest::update(&mut inner, pad);
    md5::Digest::update(&mut inner, message);
    let inner_digest = inner.finalize();

    let mut outer = sha2::Sha256::new();
    for (p, k) in pad.iter_mut().zip(key_block.iter()) {
        *p = k ^ 0x5c;
    }
    md5::Digest::update(&mut outer, pad);
    md5::Digest::update(&mut outer, inner_digest);
    outer.finalize().into()
}

/// HMAC-SHA256 as lowercase hex.
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    bytes_to_hex(&hmac_sha256_raw(key, message))
}

/// SHA-256 of a buffer as lowercase hex.
pub fn sha256_mem(data: &[u8]) -> String {
    bytes_to_hex(&sha2::Sha256::digest(data))
}

/// SHA-256 of a string as lowercase hex.
pub fn sha256_string(content: &str) -> String {
    sha256_mem(content.as_bytes())
}

/// SHA-256 of a file's contents as lowercase hex.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buffer = [0u8; IO_CHUNK_SIZE];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => md5::Digest::update(&mut hasher, &buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(bytes_to_hex(&hasher.finalize()))
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 * bytes.len());
    for b in bytes {
        out.push(hex_char(b >> 4));
        out.push(hex_char(b & 0xf));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(s: &str) -> Digest {
        Digest::parse_hex(s).unwrap()
    }

    #[test]
    fn test_known_answers() {
        assert_eq!(
            hash_mem(b"", Algorithm::Md5).to_hex(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            hash_mem(b"abc", Algorithm::Sha1).to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hash_mem(b"abc", Algorithm::Rmd160).to_hex(),
            "8eb208f7e05d987a9b044a8e98c6b087f15a0bfc-rmd160"
        );
        assert_eq!(
            hash_mem(b"", Algorithm::Shake128).to_hex(),
            "7f9c2ba4e88f827d616045507605853ed73b8093-shake128"
        );
    }

    #[test]
    fn test_parse_hex_roundtrip() {
        for algorithm in Algorithm::ALL {
            let digest = hash_mem(b"roundtrip", algorithm).with_suffix(SUFFIX_CATALOG);
            let parsed = digest_of(&digest.to_hex_suffixed());
            assert_eq!(parsed, digest);
            assert_eq!(parsed.suffix(), Some(SUFFIX_CATALOG));

            let bare = digest_of(&digest.to_hex());
            assert_eq!(bare, digest);
            assert_eq!(bare.suffix(), None);
        }
    }

    #[test]
    fn test_parse_hex_rejects_garbage() {
        assert!(Digest::parse_hex("").is_err());
        assert!(Digest::parse_hex("zz").is_err());
        // Uppercase hex is not part of the wire grammar.
        assert!(Digest::parse_hex(&"A".repeat(40)).is_err());
        // Wrong algorithm id for the payload length.
        assert!(Digest::parse_hex(&format!("{}-rmd161", "a".repeat(40))).is_err());
        // Suffix must not be a hex character.
        assert!(Digest::parse_hex(&format!("{}a", "0".repeat(40))).is_err());
        // Two suffix characters.
        assert!(Digest::parse_hex(&format!("{}CC", "0".repeat(40))).is_err());
    }

    #[test]
    fn test_suffix_is_metadata() {
        let plain = digest_of(&"ab".repeat(20));
        let suffixed = plain.with_suffix(SUFFIX_HISTORY);
        assert_eq!(plain, suffixed);

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(plain);
        assert!(set.contains(&suffixed));
    }

    #[test]
    fn test_null_digest() {
        assert!(Digest::null(Algorithm::Sha1).is_null());
        assert!(!hash_mem(b"x", Algorithm::Sha1).is_null());
    }

    #[test]
    fn test_cache_path_layout() {
        let digest = digest_of(&format!("ab{}", "cd".repeat(19))).with_suffix(SUFFIX_CATALOG);
        let path = digest.cache_path();
        assert!(path.starts_with("ab/"));
        assert!(path.ends_with('C'));
        assert_eq!(path.len(), 40 + 1 + 1);

        let without = digest.cache_path_without_suffix();
        assert_eq!(without.len(), 40 + 1);
    }

    #[test]
    fn test_fingerprint_format() {
        let digest = digest_of(&"0f".repeat(20));
        let fp = digest.fingerprint();
        assert!(fp.starts_with("0F:0F:"));
        assert_eq!(fp.matches(':').count(), 19);

        let shake = hash_mem(b"", Algorithm::Shake128);
        assert!(shake.fingerprint().ends_with("-SHAKE128"));
    }

    #[test]
    fn test_md5_path_matches_hash_mem() {
        assert_eq!(md5_path("/etc/passwd"), hash_mem(b"/etc/passwd", Algorithm::Md5));
    }

    #[test]
    fn test_hash_file_matches_hash_mem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"file contents").unwrap();
        assert_eq!(
            hash_file(&path, Algorithm::Sha1).unwrap(),
            hash_mem(b"file contents", Algorithm::Sha1)
        );
    }

    // RFC 2202 test vectors.
    #[test]
    fn test_hmac_rfc2202() {
        let key = [0x0b; 16];
        assert_eq!(
            hmac(&key, b"Hi There", Algorithm::Md5).to_hex(),
            "9294727a3638bb1c13f48ef8158bfc9d"
        );
        assert_eq!(
            hmac(b"Jefe", b"what do ya want for nothing?", Algorithm::Md5).to_hex(),
            "750c783e6ab0b503eaa86e310a5db738"
        );

        let key = [0x0b; 20];
        assert_eq!(
            hmac(&key, b"Hi There", Algorithm::Sha1).to_hex(),
            "b617318655057264e28bc0b6fb378c8ef146be00"
        );
        assert_eq!(
            hmac(b"Jefe", b"what do ya want for nothing?", Algorithm::Sha1).to_hex(),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    // RFC 4231 test vectors.
    #[test]
    fn test_hmac_sha256_rfc4231() {
        let key = [0x0b; 20];
        assert_eq!(
            hmac_sha256_hex(&key, b"Hi There"),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
        assert_eq!(
            hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_long_key_is_hashed_down() {
        let long_key = vec![0xaa; 200];
        let hashed_key = hash_mem(&long_key, Algorithm::Sha1);
        // An over-long key behaves exactly like its hash.
        assert_eq!(
            hmac(&long_key, b"message", Algorithm::Sha1),
            hmac(hashed_key.as_bytes(), b"message", Algorithm::Sha1)
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let digest = hash_mem(b"serde", Algorithm::Rmd160).with_suffix(SUFFIX_CERTIFICATE);
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert_eq!(back.suffix(), Some(SUFFIX_CERTIFICATE));
    }

    #[test]
    fn test_algorithm_wire_values() {
        for algorithm in Algorithm::ALL {
            assert_eq!(Algorithm::from_wire(algorithm.to_wire()), Some(algorithm));
        }
        assert_eq!(Algorithm::from_wire(7), None);
    }
}
