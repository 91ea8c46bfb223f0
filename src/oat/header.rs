//! OAT header codec.
//!
//! The header splits into a three-word *common* part (magic, version,
//! checksum) and a version-dependent trailer. Version 045 carries three
//! extra "portable" trampoline words that later versions dropped, so its
//! header is 12 bytes longer. The common part is written and rewritten
//! through the raw sink: its bytes are never part of the body checksum.

use std::io::{Seek, Write};

use crate::error::{Error, Result};
use crate::oat::{OatVersion, OAT_MAGIC};
use crate::sink::Sink;
use crate::util::Cursor;

// =============================================================================
// Common Header
// =============================================================================

/// The three leading words shared by every OAT version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OatHeaderCommon {
    /// Magic word, `"oat\n"` when valid
    pub magic: u32,
    /// Version word
    pub version: u32,
    /// Adler-32 of the OAT body (everything after the full header)
    pub adler32_checksum: u32,
}

impl OatHeaderCommon {
    /// Size of the common header in bytes.
    pub const SIZE: usize = 12;

    /// Parses the common header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        Ok(Self {
            magic: cur.read_u32()?,
            version: cur.read_u32()?,
            adler32_checksum: cur.read_u32()?,
        })
    }

    /// Writes the common header through the raw sink.
    pub fn write<W: Write + Seek>(&self, sink: &mut Sink<W>) -> Result<()> {
        sink.write_u32(self.magic)?;
        sink.write_u32(self.version)?;
        sink.write_u32(self.adler32_checksum)
    }
}

// =============================================================================
// Full Header
// =============================================================================

/// The full OAT header.
///
/// The three `portable_*` fields exist on disk only for version 045; for
/// other versions they stay zero in memory and are neither read nor written.
#[derive(Debug, Clone, Copy, Default)]
pub struct OatHeader {
    /// The common leading words
    pub common: OatHeaderCommon,
    /// Target instruction set, as the raw header word
    pub instruction_set: u32,
    /// Bitmap of instruction-set features
    pub instruction_set_features_bitmap: u32,
    /// Number of entries in the DEX file listing
    pub dex_file_count: u32,
    /// Offset where executable code would begin
    pub executable_offset: u32,
    /// Interpreter bridge entry point
    pub interpreter_to_interpreter_bridge_offset: u32,
    /// Interpreter-to-compiled bridge entry point
    pub interpreter_to_compiled_code_bridge_offset: u32,
    /// JNI symbol lookup entry point
    pub jni_dlsym_lookup_offset: u32,
    /// Portable IMT conflict trampoline (045 only)
    pub portable_imt_conflict_trampoline_offset: u32,
    /// Portable resolution trampoline (045 only)
    pub portable_resolution_trampoline_offset: u32,
    /// Portable interpreter bridge (045 only)
    pub portable_to_interpreter_bridge_offset: u32,
    /// Quick generic JNI trampoline
    pub quick_generic_jni_trampoline_offset: u32,
    /// Quick IMT conflict trampoline
    pub quick_imt_conflict_trampoline_offset: u32,
    /// Quick resolution trampoline
    pub quick_resolution_trampoline_offset: u32,
    /// Quick interpreter bridge
    pub quick_to_interpreter_bridge_offset: u32,
    /// Patch delta of the boot image this OAT was compiled against
    pub image_patch_delta: i32,
    /// Checksum of the boot image's own OAT
    pub image_file_location_oat_checksum: u32,
    /// Load address of the boot image's OAT data
    pub image_file_location_oat_data_begin: u32,
    /// Size in bytes of the key-value store that follows the header
    pub key_value_store_size: u32,
}

impl OatHeader {
    /// On-disk header size for a version.
    pub fn size(version: OatVersion) -> usize {
        match version {
            OatVersion::V045 => 84,
            _ => 72,
        }
    }

    /// Parses a full header from the start of `buf`.
    ///
    /// Fails with [`Error::BadMagic`] or [`Error::UnknownVersion`] before
    /// touching any trailing word, so callers can probe safely.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let common = OatHeaderCommon::parse(buf)?;
        if common.magic != OAT_MAGIC {
            return Err(Error::BadMagic(common.magic));
        }
        let version =
            OatVersion::from_word(common.version).ok_or(Error::UnknownVersion(common.version))?;

        let mut cur = Cursor::new(buf);
        cur.skip(OatHeaderCommon::SIZE)?;

        let mut header = OatHeader {
            common,
            ..Default::default()
        };
        header.instruction_set = cur.read_u32()?;
        header.instruction_set_features_bitmap = cur.read_u32()?;
        header.dex_file_count = cur.read_u32()?;
        header.executable_offset = cur.read_u32()?;
        header.interpreter_to_interpreter_bridge_offset = cur.read_u32()?;
        header.interpreter_to_compiled_code_bridge_offset = cur.read_u32()?;
        header.jni_dlsym_lookup_offset = cur.read_u32()?;

        if version == OatVersion::V045 {
            header.portable_imt_conflict_trampoline_offset = cur.read_u32()?;
            header.portable_resolution_trampoline_offset = cur.read_u32()?;
            header.portable_to_interpreter_bridge_offset = cur.read_u32()?;
        }

        header.quick_generic_jni_trampoline_offset = cur.read_u32()?;
        header.quick_imt_conflict_trampoline_offset = cur.read_u32()?;
        header.quick_resolution_trampoline_offset = cur.read_u32()?;
        header.quick_to_interpreter_bridge_offset = cur.read_u32()?;
        header.image_patch_delta = cur.read_i32()?;
        header.image_file_location_oat_checksum = cur.read_u32()?;
        header.image_file_location_oat_data_begin = cur.read_u32()?;
        header.key_value_store_size = cur.read_u32()?;

        debug_assert_eq!(cur.pos(), Self::size(version));
        Ok(header)
    }

    /// Writes the header through the raw sink, common part first.
    ///
    /// The version is passed explicitly: during a build the common part
    /// still holds placeholder words, and the placeholder must not decide
    /// whether the 045-only fields are emitted.
    pub fn write<W: Write + Seek>(&self, sink: &mut Sink<W>, version: OatVersion) -> Result<()> {
        self.common.write(sink)?;

        sink.write_u32(self.instruction_set)?;
        sink.write_u32(self.instruction_set_features_bitmap)?;
        sink.write_u32(self.dex_file_count)?;
        sink.write_u32(self.executable_offset)?;
        sink.write_u32(self.interpreter_to_interpreter_bridge_offset)?;
        sink.write_u32(self.interpreter_to_compiled_code_bridge_offset)?;
        sink.write_u32(self.jni_dlsym_lookup_offset)?;

        if version == OatVersion::V045 {
            sink.write_u32(self.portable_imt_conflict_trampoline_offset)?;
            sink.write_u32(self.portable_resolution_trampoline_offset)?;
            sink.write_u32(self.portable_to_interpreter_bridge_offset)?;
        }

        sink.write_u32(self.quick_generic_jni_trampoline_offset)?;
        sink.write_u32(self.quick_imt_conflict_trampoline_offset)?;
        sink.write_u32(self.quick_resolution_trampoline_offset)?;
        sink.write_u32(self.quick_to_interpreter_bridge_offset)?;
        sink.write_u32(self.image_patch_delta as u32)?;
        sink.write_u32(self.image_file_location_oat_checksum)?;
        sink.write_u32(self.image_file_location_oat_data_begin)?;
        sink.write_u32(self.key_value_store_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Sink;
    use std::io::Cursor as IoCursor;

    fn sample_header(version: OatVersion) -> OatHeader {
        OatHeader {
            common: OatHeaderCommon {
                magic: OAT_MAGIC,
                version: version.word(),
                adler32_checksum: 0xdeadbeef,
            },
            instruction_set: 4,
            instruction_set_features_bitmap: 1,
            dex_file_count: 2,
            executable_offset: 0x2000,
            portable_resolution_trampoline_offset: 0x77,
            quick_to_interpreter_bridge_offset: 0x99,
            image_patch_delta: -4096,
            key_value_store_size: 123,
            ..Default::default()
        }
    }

    fn write_to_vec(header: &OatHeader, version: OatVersion) -> Vec<u8> {
        let mut sink = Sink::new(IoCursor::new(Vec::new()));
        header.write(&mut sink, version).unwrap();
        sink.into_inner().unwrap().into_inner()
    }

    #[test]
    fn sizes_per_version() {
        assert_eq!(OatHeader::size(OatVersion::V045), 84);
        assert_eq!(OatHeader::size(OatVersion::V064), 72);
        assert_eq!(OatHeader::size(OatVersion::V079), 72);
        assert_eq!(OatHeader::size(OatVersion::V088), 72);
        assert_eq!(
            OatHeader::size(OatVersion::V045),
            OatHeader::size(OatVersion::V064) + 12
        );
    }

    #[test]
    fn write_parse_roundtrip_v079() {
        let header = sample_header(OatVersion::V079);
        let bytes = write_to_vec(&header, OatVersion::V079);
        assert_eq!(bytes.len(), 72);

        let parsed = OatHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.common, header.common);
        assert_eq!(parsed.instruction_set, 4);
        assert_eq!(parsed.dex_file_count, 2);
        assert_eq!(parsed.image_patch_delta, -4096);
        assert_eq!(parsed.key_value_store_size, 123);
        // portable fields do not exist on disk for 079
        assert_eq!(parsed.portable_resolution_trampoline_offset, 0);
        assert_eq!(parsed.quick_to_interpreter_bridge_offset, 0x99);
    }

    #[test]
    fn write_parse_roundtrip_v045_keeps_portable_words() {
        let header = sample_header(OatVersion::V045);
        let bytes = write_to_vec(&header, OatVersion::V045);
        assert_eq!(bytes.len(), 84);

        let parsed = OatHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.portable_resolution_trampoline_offset, 0x77);
        assert_eq!(parsed.quick_to_interpreter_bridge_offset, 0x99);
    }

    #[test]
    fn bad_magic_detected_first() {
        let mut bytes = write_to_vec(&sample_header(OatVersion::V064), OatVersion::V064);
        bytes[0] = b'x';
        assert!(matches!(
            OatHeader::parse(&bytes),
            Err(Error::BadMagic(_))
        ));
    }

    #[test]
    fn unknown_version_detected() {
        let mut header = sample_header(OatVersion::V064);
        header.common.version = 0x0031_3939;
        let bytes = write_to_vec(&header, OatVersion::V064);
        assert!(matches!(
            OatHeader::parse(&bytes),
            Err(Error::UnknownVersion(0x0031_3939))
        ));
    }

    #[test]
    fn truncated_header_rejected() {
        let bytes = write_to_vec(&sample_header(OatVersion::V064), OatVersion::V064);
        assert!(matches!(
            OatHeader::parse(&bytes[..40]),
            Err(Error::Truncated { .. })
        ));
    }
}
