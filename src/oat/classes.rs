//! Class-info codec.
//!
//! Each class definition of each embedded DEX gets a four-byte
//! [`ClassInfo`] record describing its verification status and how much of
//! it was compiled. The read path understands all three compilation kinds
//! (compiled classes drag method pointers and possibly a bitmap behind
//! them); the write path only ever emits verified, uncompiled classes.

use std::io::{Seek, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::dex::{DexFileHeader, DexIndexes};
use crate::error::{Error, Result};
use crate::oat::listing::{LegacyDexFile, ModernDexFile};
use crate::sink::ChecksumSink;
use crate::util::{slice, slice_range, Cursor};

// =============================================================================
// Status & Kind
// =============================================================================

/// Class initialization status as tracked by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
#[allow(missing_docs)]
pub enum ClassStatus {
    Retired = -2,
    Error = -1,
    NotReady = 0,
    Idx = 1,
    Loaded = 2,
    Resolving = 3,
    Resolved = 4,
    Verifying = 5,
    RetryVerificationAtRuntime = 6,
    VerifyingAtRuntime = 7,
    Verified = 8,
    Initializing = 9,
    Initialized = 10,
}

impl ClassStatus {
    /// Maps a raw status value, if known.
    pub fn from_raw(raw: i16) -> Option<Self> {
        use ClassStatus::*;
        Some(match raw {
            -2 => Retired,
            -1 => Error,
            0 => NotReady,
            1 => Idx,
            2 => Loaded,
            3 => Resolving,
            4 => Resolved,
            5 => Verifying,
            6 => RetryVerificationAtRuntime,
            7 => VerifyingAtRuntime,
            8 => Verified,
            9 => Initializing,
            10 => Initialized,
            _ => return None,
        })
    }

    /// Long name for the unverified-class listing.
    pub fn name(raw: i16) -> &'static str {
        use ClassStatus::*;
        match Self::from_raw(raw) {
            Some(Retired) => "kStatusRetired",
            Some(Error) => "kStatusError",
            Some(NotReady) => "kStatusNotReady",
            Some(Idx) => "kStatusIdx",
            Some(Loaded) => "kStatusLoaded",
            Some(Resolving) => "kStatusResolving",
            Some(Resolved) => "kStatusResolved",
            Some(Verifying) => "kStatusVerifying",
            Some(RetryVerificationAtRuntime) => "kStatusRetryVerificationAtRuntime",
            Some(VerifyingAtRuntime) => "kStatusVerifyingAtRuntime",
            Some(Verified) => "kStatusVerified",
            Some(Initializing) => "kStatusInitializing",
            Some(Initialized) => "kStatusInitialized",
            None => "<UNKNOWN>",
        }
    }

    /// Single-character code for the class-status matrix.
    pub fn short(raw: i16) -> char {
        use ClassStatus::*;
        match Self::from_raw(raw) {
            Some(Retired) => 'O',
            Some(Error) => 'E',
            Some(NotReady) => 'N',
            Some(Idx) => 'I',
            Some(Loaded) => 'L',
            Some(Resolving) => 'r',
            Some(Resolved) => 'R',
            Some(Verifying) | Some(RetryVerificationAtRuntime) | Some(VerifyingAtRuntime) => 'v',
            Some(Verified) => 'V',
            Some(Initializing) => 'i',
            Some(Initialized) => 'I',
            None if raw == 11 => 'M',
            None => '?',
        }
    }
}

/// How much of a class the compiler emitted code for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ClassKind {
    AllCompiled = 0,
    SomeCompiled = 1,
    NoneCompiled = 2,
}

impl ClassKind {
    /// Maps a raw type value, if known.
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(ClassKind::AllCompiled),
            1 => Some(ClassKind::SomeCompiled),
            2 => Some(ClassKind::NoneCompiled),
            _ => None,
        }
    }

    /// Single-character code for the class-status matrix.
    pub fn short(raw: u16) -> char {
        match Self::from_raw(raw) {
            Some(ClassKind::AllCompiled) => 'C',
            Some(ClassKind::SomeCompiled) => 'c',
            Some(ClassKind::NoneCompiled) => 'n',
            None if raw == 3 => 'M',
            None => '?',
        }
    }
}

// =============================================================================
// ClassInfo
// =============================================================================

/// One on-disk class record: status plus compilation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassInfo {
    /// Signed status value, see [`ClassStatus`]
    pub status: i16,
    /// Compilation kind, see [`ClassKind`]
    pub kind: u16,
}

impl ClassInfo {
    /// Size of one record in bytes.
    pub const SIZE: usize = 4;

    /// The only record the build path emits.
    pub const VERIFIED_NONE_COMPILED: ClassInfo = ClassInfo {
        status: ClassStatus::Verified as i16,
        kind: ClassKind::NoneCompiled as u16,
    };

    /// Reads a record at `offset` in `buf`.
    pub fn parse_at(buf: &[u8], offset: usize) -> Result<Self> {
        let raw = slice_range(buf, offset, offset + Self::SIZE)?;
        Ok(Self {
            status: LittleEndian::read_u16(raw) as i16,
            kind: LittleEndian::read_u16(&raw[2..]),
        })
    }

    /// Writes the record through the checksumming sink.
    pub fn write<W: Write + Seek>(&self, sink: &mut ChecksumSink<W>) -> Result<()> {
        sink.write_u16(self.status as u16)?;
        sink.write_u16(self.kind)
    }
}

/// Parsed class metadata for one DEX file.
#[derive(Debug, Clone)]
pub struct DexClasses {
    /// Location string of the DEX these classes belong to.
    pub location: String,
    /// One record per class definition.
    pub class_info: Vec<ClassInfo>,
    /// Parallel class names, raw MUTF-8 with trailing NUL.
    pub class_names: Vec<Vec<u8>>,
}

// =============================================================================
// Modern Read Path
// =============================================================================

/// Decodes per-DEX class metadata for the modern layout.
///
/// `classes_offset` points at an array of `class_defs_size` offsets, each of
/// which points at one [`ClassInfo`]. Only uncompiled classes are accepted;
/// a compiled class here means the file came from a full compiler and this
/// codec would mis-read the method data that follows.
pub fn parse_modern_classes(
    listing: &[ModernDexFile],
    headers: &[DexFileHeader],
    oat_buf: &[u8],
) -> Result<Vec<DexClasses>> {
    let mut all = Vec::with_capacity(listing.len());

    for (entry, header) in listing.iter().zip(headers) {
        let indexes = DexIndexes::new(slice(oat_buf, entry.file_offset as usize)?, header)?;

        let mut classes = DexClasses {
            location: entry.location.clone(),
            class_info: Vec::with_capacity(header.class_defs_size as usize),
            class_names: Vec::with_capacity(header.class_defs_size as usize),
        };

        for i in 0..header.class_defs_size as usize {
            let slot = entry.classes_offset as usize + i * 4;
            let info_offset =
                LittleEndian::read_u32(slice_range(oat_buf, slot, slot + 4)?) as usize;
            let info = ClassInfo::parse_at(oat_buf, info_offset)?;

            if info.kind != ClassKind::NoneCompiled as u16 {
                return Err(Error::UnsupportedClassType {
                    kind: info.kind,
                    offset: info_offset,
                });
            }

            classes.class_info.push(info);
            classes.class_names.push(indexes.class_name(i)?.to_vec());
        }
        all.push(classes);
    }

    Ok(all)
}

// =============================================================================
// Legacy Read Helper
// =============================================================================

/// Consumes the trailing compiled-method data behind one legacy class
/// record, returning the [`ClassInfo`] itself.
///
/// `SomeCompiled` records carry a bitmap size word, the bitmap, and one
/// method pointer per set bit; `AllCompiled` records carry one pointer per
/// method the class defines. The bytes are bounds-checked and skipped, never
/// interpreted.
pub fn parse_legacy_class(
    oat_buf: &[u8],
    info_offset: usize,
    indexes: &DexIndexes<'_>,
    class_index: usize,
) -> Result<ClassInfo> {
    let info = ClassInfo::parse_at(oat_buf, info_offset)?;

    if info.kind == ClassKind::SomeCompiled as u16 {
        let mut cur = Cursor::new(slice(oat_buf, info_offset + ClassInfo::SIZE)?);
        let bitmap_size = cur.read_u32()? as usize;
        let mut method_count = 0u32;
        for _ in 0..bitmap_size / 4 {
            method_count += cur.read_u32()?.count_ones();
        }
        cur.skip(method_count as usize * 4)?;
    } else if info.kind == ClassKind::AllCompiled as u16 {
        let method_count = indexes.method_count(class_index)? as usize;
        slice_range(
            oat_buf,
            info_offset + ClassInfo::SIZE,
            info_offset + ClassInfo::SIZE + method_count * 4,
        )?;
    }

    Ok(info)
}

// =============================================================================
// Write Paths
// =============================================================================

/// Writes the legacy class-info block: one contiguous run of records after
/// the DEX bodies, at the offsets already recorded in the listing.
pub fn write_legacy<W: Write + Seek>(
    dex_files: &[LegacyDexFile],
    sink: &mut ChecksumSink<W>,
) -> Result<()> {
    for file in dex_files {
        let Some(&first) = file.class_offsets.first() else {
            continue;
        };
        if first != sink.bytes_written() {
            return Err(Error::LayoutMismatch {
                section: "class info",
                written: sink.bytes_written(),
                planned: first,
            });
        }
        for info in &file.class_info {
            info.write(sink)?;
        }
    }
    Ok(())
}

/// Writes the modern class blocks: per DEX, an array of offsets pointing at
/// the dense [`ClassInfo`] array that follows it.
pub fn write_modern<W: Write + Seek>(
    dex_files: &[ModernDexFile],
    sink: &mut ChecksumSink<W>,
) -> Result<()> {
    for file in dex_files {
        if file.classes_offset != sink.bytes_written() {
            return Err(Error::LayoutMismatch {
                section: "class offsets",
                written: sink.bytes_written(),
                planned: file.classes_offset,
            });
        }

        let mut record_offset = file.classes_offset + file.num_classes * 4;
        for i in 0..file.num_classes {
            sink.write_u32(record_offset + i * 4)?;
        }
        if record_offset != sink.bytes_written() {
            return Err(Error::LayoutMismatch {
                section: "class info",
                written: sink.bytes_written(),
                planned: record_offset,
            });
        }

        for _ in 0..file.num_classes {
            ClassInfo::VERIFIED_NONE_COMPILED.write(sink)?;
            record_offset += ClassInfo::SIZE as u32;
        }
        if record_offset != sink.bytes_written() {
            return Err(Error::LayoutMismatch {
                section: "class info",
                written: sink.bytes_written(),
                planned: record_offset,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Sink;
    use std::io::Cursor as IoCursor;

    #[test]
    fn status_codes() {
        assert_eq!(ClassStatus::short(8), 'V');
        assert_eq!(ClassStatus::short(-2), 'O');
        assert_eq!(ClassStatus::short(5), 'v');
        assert_eq!(ClassStatus::short(6), 'v');
        assert_eq!(ClassStatus::short(7), 'v');
        assert_eq!(ClassStatus::short(10), 'I');
        assert_eq!(ClassStatus::short(11), 'M');
        assert_eq!(ClassStatus::short(42), '?');
        assert_eq!(ClassStatus::name(8), "kStatusVerified");
        assert_eq!(ClassStatus::name(-1), "kStatusError");
    }

    #[test]
    fn kind_codes() {
        assert_eq!(ClassKind::short(0), 'C');
        assert_eq!(ClassKind::short(1), 'c');
        assert_eq!(ClassKind::short(2), 'n');
        assert_eq!(ClassKind::short(3), 'M');
        assert_eq!(ClassKind::short(9), '?');
    }

    #[test]
    fn class_info_roundtrip() {
        let mut sink = ChecksumSink::new(Sink::new(IoCursor::new(Vec::new())));
        ClassInfo { status: -2, kind: 1 }.write(&mut sink).unwrap();
        ClassInfo::VERIFIED_NONE_COMPILED.write(&mut sink).unwrap();
        let bytes = sink
            .into_sink()
            .unwrap()
            .into_inner()
            .unwrap()
            .into_inner();

        assert_eq!(
            ClassInfo::parse_at(&bytes, 0).unwrap(),
            ClassInfo { status: -2, kind: 1 }
        );
        assert_eq!(
            ClassInfo::parse_at(&bytes, 4).unwrap(),
            ClassInfo { status: 8, kind: 2 }
        );
        assert!(ClassInfo::parse_at(&bytes, 6).is_err());
    }
}
