//! On-disk DEX structures.
//!
//! Only the slices of the DEX format the OAT codec actually touches are
//! modelled here: the file header and the `class_defs` / `type_ids` /
//! `string_ids` / `method_ids` index tables needed to resolve class names
//! and method counts. Everything else in a DEX body is treated as opaque
//! bytes.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

pub mod index;
pub use index::DexIndexes;

/// First word of a DEX file: `"dex\n"`.
pub const DEX_MAGIC: u32 = 0x0a78_6564;

// =============================================================================
// Header
// =============================================================================

/// The DEX file header.
///
/// The codec consumes `checksum`, `file_size` and the four index-table
/// size/offset pairs; the remaining fields are carried so the struct matches
/// the on-disk layout exactly.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DexFileHeader {
    /// Magic word (`"dex\n"`)
    pub magic: u32,
    /// Format version as four MUTF-8 bytes (e.g. `"035\0"`)
    pub version: u32,
    /// Adler-32 of everything after this field
    pub checksum: u32,
    /// SHA-1 of everything after this field
    pub signature: [u8; 20],
    /// Size of the entire file
    pub file_size: u32,
    /// Size of this header (0x70)
    pub header_size: u32,
    /// Endianness tag
    pub endian_tag: u32,
    /// Link section size (unused)
    pub link_size: u32,
    /// Link section offset (unused)
    pub link_off: u32,
    /// Map list offset
    pub map_off: u32,
    /// Number of string identifiers
    pub string_ids_size: u32,
    /// Offset of the string identifiers list
    pub string_ids_off: u32,
    /// Number of type identifiers
    pub type_ids_size: u32,
    /// Offset of the type identifiers list
    pub type_ids_off: u32,
    /// Number of prototype identifiers
    pub proto_ids_size: u32,
    /// Offset of the prototype identifiers list
    pub proto_ids_off: u32,
    /// Number of field identifiers
    pub field_ids_size: u32,
    /// Offset of the field identifiers list
    pub field_ids_off: u32,
    /// Number of method identifiers
    pub method_ids_size: u32,
    /// Offset of the method identifiers list
    pub method_ids_off: u32,
    /// Number of class definitions
    pub class_defs_size: u32,
    /// Offset of the class definitions list
    pub class_defs_off: u32,
    /// Data section size
    pub data_size: u32,
    /// Data section offset
    pub data_off: u32,
}

impl DexFileHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 112;

    /// Parses a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        DexFileHeader::read_from_prefix(buf)
            .map(|(header, _)| header)
            .map_err(|_| Error::truncated(0, Self::SIZE, buf.len()))
    }

    /// Reads a header from the start of a DEX file on disk, rejecting files
    /// shorter than the header itself.
    pub fn read_from_file(path: &Path) -> Result<(Self, u64)> {
        let mut file = File::open(path).map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let file_size = file
            .metadata()
            .map_err(|source| Error::FileRead {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if file_size < Self::SIZE as u64 {
            return Err(Error::DexTooSmall { size: file_size });
        }
        let mut buf = [0u8; Self::SIZE];
        file.read_exact(&mut buf).map_err(|source| Error::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok((Self::parse(&buf)?, file_size))
    }
}

// =============================================================================
// Index Tables
// =============================================================================

/// One entry of the `class_defs` table.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DexClassDef {
    /// Index into `type_ids` for this class
    pub class_idx: u16,
    /// Alignment padding
    pub pad1: u16,
    /// Access modifier bit mask
    pub access_flags: u32,
    /// Index into `type_ids` for the superclass
    pub superclass_idx: u16,
    /// Alignment padding
    pub pad2: u16,
    /// Offset of the interfaces type list
    pub interfaces_off: u32,
    /// Index into `string_ids` for the source file name
    pub source_file_idx: u32,
    /// Offset of the annotations directory
    pub annotations_off: u32,
    /// Offset of the class data item
    pub class_data_off: u32,
    /// Offset of the static values array
    pub static_values_off: u32,
}

impl DexClassDef {
    /// Size of one entry in bytes.
    pub const SIZE: usize = 32;
}

/// One entry of the `method_ids` table.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DexMethodId {
    /// Index into `type_ids` for the defining class
    pub class_idx: u16,
    /// Index into `proto_ids` for the method prototype
    pub proto_idx: u16,
    /// Index into `string_ids` for the method name
    pub name_idx: u32,
}

impl DexMethodId {
    /// Size of one entry in bytes.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Test Fixtures
// =============================================================================

#[cfg(test)]
pub(crate) mod testdex {
    //! Synthetic DEX images for tests.

    use std::path::PathBuf;

    use adler::adler32_slice;
    use byteorder::{ByteOrder, LittleEndian};

    use super::{DexClassDef, DexFileHeader, DexMethodId};

    /// Builds a minimal but internally consistent DEX image containing the
    /// given classes (one type id and one string per class) and methods.
    pub struct TestDexBuilder {
        class_names: Vec<String>,
        /// (type index of defining class) per method
        methods: Vec<u16>,
    }

    impl TestDexBuilder {
        pub fn new() -> Self {
            Self {
                class_names: Vec::new(),
                methods: Vec::new(),
            }
        }

        pub fn class(mut self, name: &str) -> Self {
            self.class_names.push(name.to_string());
            self
        }

        pub fn method(mut self, class_type_idx: u16) -> Self {
            self.methods.push(class_type_idx);
            self
        }

        pub fn build(self) -> Vec<u8> {
            let n = self.class_names.len() as u32;

            // string data comes right after the header
            let mut string_data = Vec::new();
            let mut string_offsets = Vec::new();
            for name in &self.class_names {
                string_offsets.push(DexFileHeader::SIZE as u32 + string_data.len() as u32);
                let mut len = name.len() as u32;
                loop {
                    if len <= 0x7f {
                        string_data.push(len as u8);
                        break;
                    }
                    string_data.push(0x80 | (len & 0x7f) as u8);
                    len >>= 7;
                }
                string_data.extend_from_slice(name.as_bytes());
                string_data.push(0);
            }
            while string_data.len() % 4 != 0 {
                string_data.push(0);
            }

            let string_ids_off = DexFileHeader::SIZE as u32 + string_data.len() as u32;
            let type_ids_off = string_ids_off + 4 * n;
            let method_ids_off = type_ids_off + 4 * n;
            let class_defs_off = method_ids_off + DexMethodId::SIZE as u32 * self.methods.len() as u32;
            let file_size = class_defs_off + DexClassDef::SIZE as u32 * n;

            let zero_if_empty = |count: u32, off: u32| if count == 0 { 0 } else { off };

            let mut out = vec![0u8; file_size as usize];
            let mut w = |off: usize, v: u32| LittleEndian::write_u32(&mut out[off..], v);
            w(0, super::DEX_MAGIC);
            w(4, 0x0035_3330); // "035\0"
            // checksum written last
            // signature stays zero
            w(32, file_size);
            w(36, DexFileHeader::SIZE as u32);
            w(40, 0x12345678);
            w(56, n);
            w(60, zero_if_empty(n, string_ids_off));
            w(64, n);
            w(68, zero_if_empty(n, type_ids_off));
            w(88, self.methods.len() as u32);
            w(92, zero_if_empty(self.methods.len() as u32, method_ids_off));
            w(96, n);
            w(100, zero_if_empty(n, class_defs_off));

            let mut at = DexFileHeader::SIZE;
            out[at..at + string_data.len()].copy_from_slice(&string_data);
            at += string_data.len();

            for off in &string_offsets {
                LittleEndian::write_u32(&mut out[at..], *off);
                at += 4;
            }
            // type_ids: descriptor string index i for type i
            for i in 0..n {
                LittleEndian::write_u32(&mut out[at..], i);
                at += 4;
            }
            for class_type_idx in &self.methods {
                LittleEndian::write_u16(&mut out[at..], *class_type_idx);
                // proto_idx and name_idx stay zero
                at += DexMethodId::SIZE;
            }
            for i in 0..n {
                LittleEndian::write_u16(&mut out[at..], i as u16);
                at += DexClassDef::SIZE;
            }
            assert_eq!(at, file_size as usize);

            let checksum = adler32_slice(&out[12..]);
            LittleEndian::write_u32(&mut out[8..], checksum);
            out
        }
    }

    /// Writes `bytes` to a uniquely named file under the system temp
    /// directory and returns its path.
    pub fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("oatx-test-{}-{}", std::process::id(), name));
        std::fs::write(&path, bytes).unwrap();
        path
    }
}
