//! On-disk file format shared by every store.
//!
//! ```text
//! [header base 80 B][class-specific extension 48 B]   // 128 B total
//! [payload blocks, each 16-byte aligned, zero padded]
//! [footer 64 B, ending in footer_length]
//! ```
//!
//! All integers little-endian. The footer's `file_xxhash` is the seeded
//! XXH64 of every byte before the footer, padding included, so writers
//! stream everything through one hasher.

use oxizbs_core::error::{Error, Result};
use oxizbs_core::xxh::{Xxh64Stream, checksum_verify_enabled};

/// Magic string shared by every store file.
pub const MAGIC: &[u8; 17] = b"terark-blob-store";

/// Total header size: 80-byte base plus 48-byte class extension.
pub const HEADER_SIZE: usize = 128;
/// Footer size; its last 4 bytes always hold `FOOTER_SIZE`.
pub const FOOTER_SIZE: usize = 64;

/// Checksum algorithm tag stored in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumType {
    /// CRC-32C record trailers.
    Crc32c = 0,
    /// CRC-16 record trailers.
    Crc16 = 1,
}

impl ChecksumType {
    /// Parse the header tag.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Crc32c),
            1 => Ok(Self::Crc16),
            _ => Err(Error::corrupted(56, format!("bad checksum type {v}"))),
        }
    }
}

/// The 80-byte header base common to all stores.
#[derive(Clone, Debug)]
pub struct HeaderBase {
    /// Store class name, at most 19 bytes.
    pub class_name: String,
    /// Total file length, header through footer.
    pub file_size: u64,
    /// Sum of uncompressed record lengths.
    pub unzip_size: u64,
    /// Record count (40-bit field).
    pub records: u64,
    /// Per-record checksum algorithm.
    pub checksum_type: ChecksumType,
    /// Format revision of the class extension.
    pub format_version: u16,
    /// Size of the global dictionary (40-bit field), zero when unused.
    pub global_dict_size: u64,
}

impl HeaderBase {
    /// New base for a class being written at the current format version.
    pub fn new(class_name: &str, format_version: u16) -> Self {
        debug_assert!(class_name.len() < 20);
        Self {
            class_name: class_name.to_string(),
            file_size: 0,
            unzip_size: 0,
            records: 0,
            checksum_type: ChecksumType::Crc32c,
            format_version,
            global_dict_size: 0,
        }
    }

    /// Serialize the 80-byte base.
    pub fn to_bytes(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0] = MAGIC.len() as u8;
        out[1..1 + MAGIC.len()].copy_from_slice(MAGIC);
        let name = self.class_name.as_bytes();
        out[20..20 + name.len()].copy_from_slice(name);
        out[40..48].copy_from_slice(&self.file_size.to_le_bytes());
        out[48..56].copy_from_slice(&self.unzip_size.to_le_bytes());
        let packed = (self.records & ((1u64 << 40) - 1))
            | ((self.checksum_type as u64) << 40)
            | ((self.format_version as u64) << 48);
        out[56..64].copy_from_slice(&packed.to_le_bytes());
        out[64..72].copy_from_slice(&(self.global_dict_size & ((1u64 << 40) - 1)).to_le_bytes());
        out
    }

    /// Parse and validate the 80-byte base.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::corrupted(0, "file shorter than header and footer"));
        }
        if data[0] as usize != MAGIC.len() || &data[1..1 + MAGIC.len()] != MAGIC {
            return Err(Error::corrupted(0, "bad magic"));
        }
        let name_end = data[20..40].iter().position(|&b| b == 0).unwrap_or(20);
        let class_name = String::from_utf8_lossy(&data[20..20 + name_end]).into_owned();
        let file_size = u64::from_le_bytes(data[40..48].try_into().unwrap());
        let unzip_size = u64::from_le_bytes(data[48..56].try_into().unwrap());
        let packed = u64::from_le_bytes(data[56..64].try_into().unwrap());
        let dict = u64::from_le_bytes(data[64..72].try_into().unwrap());
        Ok(Self {
            class_name,
            file_size,
            unzip_size,
            records: packed & ((1u64 << 40) - 1),
            checksum_type: ChecksumType::from_u8(((packed >> 40) & 0xFF) as u8)?,
            format_version: (packed >> 48) as u16,
            global_dict_size: dict & ((1u64 << 40) - 1),
        })
    }
}

/// Round up to the payload block alignment.
#[inline]
pub fn align16(n: usize) -> usize {
    n.next_multiple_of(16)
}

/// Streaming writer that hashes every byte it emits and finishes with the
/// 64-byte footer.
pub struct FileAssembler {
    buf: Vec<u8>,
    hash: Xxh64Stream,
}

impl FileAssembler {
    /// Start a file for a class with the given XXH64 seed.
    pub fn new(seed: u64) -> Self {
        Self {
            buf: Vec::new(),
            hash: Xxh64Stream::new(seed),
        }
    }

    /// Append raw bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.hash.update(data);
        self.buf.extend_from_slice(data);
    }

    /// Zero-pad to the 16-byte block alignment; padding is hashed.
    pub fn pad16(&mut self) {
        let want = align16(self.buf.len()) - self.buf.len();
        if want > 0 {
            let zeros = [0u8; 16];
            self.write(&zeros[..want]);
        }
    }

    /// Bytes emitted so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True before the first write.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append the footer and return the complete file image.
    pub fn finish(mut self) -> Vec<u8> {
        let mut footer = [0u8; FOOTER_SIZE];
        footer[8..16].copy_from_slice(&self.hash.digest().to_le_bytes());
        footer[60..64].copy_from_slice(&(FOOTER_SIZE as u32).to_le_bytes());
        self.buf.extend_from_slice(&footer);
        self.buf
    }
}

/// Validate the outer frame of a loaded file: magic, class, sizes, footer
/// length, and (when verification is on) the file hash.
pub fn validate_file(data: &[u8], class_name: &str, seed: u64) -> Result<HeaderBase> {
    let base = HeaderBase::parse(data)?;
    if base.class_name != class_name {
        return Err(Error::corrupted(
            20,
            format!("class is {:?}, expected {:?}", base.class_name, class_name),
        ));
    }
    if base.file_size as usize != data.len() {
        return Err(Error::corrupted(
            40,
            format!("file size {} but {} bytes mapped", base.file_size, data.len()),
        ));
    }
    let flen = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
    if flen as usize != FOOTER_SIZE {
        return Err(Error::corrupted(
            (data.len() - 4) as u64,
            format!("bad footer length {flen}"),
        ));
    }
    if checksum_verify_enabled() {
        let body = &data[..data.len() - FOOTER_SIZE];
        let expected = u64::from_le_bytes(
            data[data.len() - FOOTER_SIZE + 8..data.len() - FOOTER_SIZE + 16]
                .try_into()
                .unwrap(),
        );
        let computed = oxizbs_core::xxh::xxhash64(body, seed);
        if computed != expected {
            return Err(Error::bad_checksum("xxh64", expected, computed));
        }
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxizbs_core::xxh::seed;

    #[test]
    fn test_header_roundtrip() {
        let mut h = HeaderBase::new("PlainBlobStore", 1);
        h.file_size = 4096;
        h.unzip_size = 123456;
        h.records = (1u64 << 33) + 7;
        h.checksum_type = ChecksumType::Crc16;
        h.global_dict_size = 99;
        let bytes = h.to_bytes();
        let back = HeaderBase::parse(&[&bytes[..], &[0u8; 112]].concat()).unwrap();
        assert_eq!(back.class_name, "PlainBlobStore");
        assert_eq!(back.file_size, 4096);
        assert_eq!(back.unzip_size, 123456);
        assert_eq!(back.records, (1u64 << 33) + 7);
        assert_eq!(back.checksum_type, ChecksumType::Crc16);
        assert_eq!(back.format_version, 1);
        assert_eq!(back.global_dict_size, 99);
    }

    #[test]
    fn test_assembler_frame() {
        let mut a = FileAssembler::new(seed::PLAIN);
        let mut base = HeaderBase::new("TestStore", 1);
        let payload = b"0123456789abcdef-payload";
        let body = align16(payload.len());
        base.file_size = (HEADER_SIZE + body + FOOTER_SIZE) as u64;
        let mut header = [0u8; HEADER_SIZE];
        header[..80].copy_from_slice(&base.to_bytes());
        a.write(&header);
        a.write(payload);
        a.pad16();
        let file = a.finish();
        assert_eq!(file.len(), HEADER_SIZE + body + FOOTER_SIZE);
        let parsed = validate_file(&file, "TestStore", seed::PLAIN).unwrap();
        assert_eq!(parsed.file_size as usize, file.len());

        // Any bit flip in the body must fail the hash.
        let mut bad = file.clone();
        bad[HEADER_SIZE + 3] ^= 1;
        assert!(matches!(
            validate_file(&bad, "TestStore", seed::PLAIN),
            Err(Error::BadChecksum { .. })
        ));
    }
}
