//! Parse orchestration.
//!
//! [`parse`] turns a raw byte buffer into a [`ParsedOat`]: a logical view of
//! the container that borrows the buffer rather than copying out of it. Bad
//! magic and unknown versions are not failures here; they produce degraded
//! variants that still render a minimal dump. Real decode errors (truncated
//! buffers, broken DEX indices) are captured in the `Failed` variant instead
//! of unwinding.

use tracing::debug;

use crate::dex::DexFileHeader;
use crate::error::Error;
use crate::oat::classes::{self, DexClasses};
use crate::oat::header::{OatHeader, OatHeaderCommon};
use crate::oat::kv::KeyValueStore;
use crate::oat::listing::{self, LegacyDexFile, ModernDexFile};
use crate::oat::lookup::{self, LookupTable};
use crate::oat::{Layout, OatDexFile, OatVersion, Status, ELF_OAT_OFFSET, OAT_MAGIC};
use crate::util::{slice, truncate, Cursor};

/// A fully parsed legacy-layout OAT.
pub struct LegacyOat {
    /// The decoded header.
    pub header: OatHeader,
    /// The decoded key-value store.
    pub key_value_store: KeyValueStore,
    /// The listing entries with their class metadata.
    pub dex_files: Vec<LegacyDexFile>,
    /// Header of each embedded DEX, in listing order.
    pub dex_headers: Vec<DexFileHeader>,
    /// Offset of the OAT data in the original buffer (nonzero for
    /// ELF-wrapped files).
    pub oat_offset: usize,
}

/// A fully parsed modern-layout OAT.
pub struct ModernOat<'a> {
    /// The decoded header.
    pub header: OatHeader,
    /// The decoded key-value store.
    pub key_value_store: KeyValueStore,
    /// The listing entries.
    pub dex_files: Vec<ModernDexFile>,
    /// Header of each embedded DEX, in listing order.
    pub dex_headers: Vec<DexFileHeader>,
    /// Type-lookup tables; `None` when parsing stopped at the listing.
    pub lookup_tables: Option<Vec<LookupTable>>,
    /// Per-DEX class metadata; `None` when parsing stopped at the listing.
    pub classes: Option<Vec<DexClasses>>,
    /// Offset of the OAT data in the original buffer.
    pub oat_offset: usize,
    /// The OAT data itself, used to resolve lookup-table strings on demand.
    pub oat_buf: &'a [u8],
}

/// Result of parsing a buffer that may or may not be a usable OAT.
pub enum ParsedOat<'a> {
    /// A decoded legacy-layout file (045/064).
    Legacy(LegacyOat),
    /// A decoded modern-layout file (079/088).
    Modern(ModernOat<'a>),
    /// The magic matched but the version word is not one this codec knows.
    Unknown {
        /// The common header as read.
        header: OatHeaderCommon,
    },
    /// The magic did not match; the header fields are garbage but still
    /// renderable.
    BadMagic {
        /// The common header as read.
        header: OatHeaderCommon,
    },
    /// Decoding started but failed partway through.
    Failed {
        /// The common header, when at least that much was readable.
        header: Option<OatHeaderCommon>,
        /// What went wrong.
        error: Error,
    },
}

impl ParsedOat<'_> {
    /// The terminal status of this parse.
    pub fn status(&self) -> Status {
        match self {
            ParsedOat::Legacy(_) | ParsedOat::Modern(_) => Status::ParseSuccess,
            ParsedOat::Unknown { .. } => Status::ParseUnknownVersion,
            ParsedOat::BadMagic { .. } => Status::ParseBadMagic,
            ParsedOat::Failed { .. } => Status::ParseFailure,
        }
    }

    /// Offset of the OAT data inside the buffer handed to [`parse`]: 4096
    /// for ELF-wrapped input, zero otherwise.
    pub fn oat_offset(&self) -> usize {
        match self {
            ParsedOat::Legacy(oat) => oat.oat_offset,
            ParsedOat::Modern(oat) => oat.oat_offset,
            _ => 0,
        }
    }

    /// Summaries of the embedded DEX files, empty for degraded variants.
    pub fn oat_dex_files(&self) -> Vec<OatDexFile> {
        match self {
            ParsedOat::Legacy(oat) => oat
                .dex_files
                .iter()
                .zip(&oat.dex_headers)
                .map(|(file, header)| OatDexFile {
                    location: file.location.clone(),
                    file_offset: file.file_offset,
                    file_size: header.file_size,
                })
                .collect(),
            ParsedOat::Modern(oat) => oat
                .dex_files
                .iter()
                .zip(&oat.dex_headers)
                .map(|(file, header)| OatDexFile {
                    location: file.location.clone(),
                    file_offset: file.file_offset,
                    file_size: header.file_size,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Parses an OAT (or ELF-wrapped OAT) buffer into its full logical view.
pub fn parse(buf: &[u8]) -> ParsedOat<'_> {
    parse_impl(false, buf)
}

/// Like [`parse`], but stops after the DEX file listing and DEX headers;
/// class metadata and lookup tables are left undecoded.
pub fn parse_dex_files_only(buf: &[u8]) -> ParsedOat<'_> {
    parse_impl(true, buf)
}

fn parse_impl(dex_files_only: bool, mut buf: &[u8]) -> ParsedOat<'_> {
    let mut oat_offset = 0;
    if buf.len() >= 4 && buf[..4] == [0x7f, b'E', b'L', b'F'] {
        // .rodata starts one page in for every ART version seen so far
        oat_offset = ELF_OAT_OFFSET;
        buf = match slice(buf, ELF_OAT_OFFSET) {
            Ok(rest) => rest,
            Err(error) => {
                return ParsedOat::Failed {
                    header: None,
                    error,
                }
            }
        };
        debug!(oat_offset, "elf wrapper detected");
    }

    let common = match OatHeaderCommon::parse(buf) {
        Ok(common) => common,
        Err(error) => {
            return ParsedOat::Failed {
                header: None,
                error,
            }
        }
    };
    if common.magic != OAT_MAGIC {
        return ParsedOat::BadMagic { header: common };
    }
    let version = match OatVersion::from_word(common.version) {
        Some(version) => version,
        None => return ParsedOat::Unknown { header: common },
    };
    debug!(?version, "parsing oat body");

    let result = match version.layout() {
        Layout::Legacy => parse_legacy_oat(dex_files_only, buf, oat_offset).map(ParsedOat::Legacy),
        Layout::Modern => parse_modern_oat(dex_files_only, buf, oat_offset).map(ParsedOat::Modern),
    };
    result.unwrap_or_else(|error| ParsedOat::Failed {
        header: Some(common),
        error,
    })
}

fn parse_common_sections<'a>(
    buf: &'a [u8],
) -> crate::error::Result<(OatHeader, KeyValueStore, Cursor<'a>)> {
    let header = OatHeader::parse(buf)?;
    let version = OatVersion::from_word(header.common.version)
        .ok_or(Error::UnknownVersion(header.common.version))?;
    let header_size = OatHeader::size(version);

    let kv_buf = truncate(
        slice(buf, header_size)?,
        header.key_value_store_size as usize,
    )?;
    let key_value_store = KeyValueStore::parse(kv_buf);

    let rest = slice(buf, header_size + header.key_value_store_size as usize)?;
    Ok((header, key_value_store, Cursor::new(rest)))
}

fn parse_legacy_oat(
    dex_files_only: bool,
    buf: &[u8],
    oat_offset: usize,
) -> crate::error::Result<LegacyOat> {
    let (header, key_value_store, mut cur) = parse_common_sections(buf)?;
    let dex_files = listing::parse_legacy(dex_files_only, header.dex_file_count, &mut cur, buf)?;

    let offsets: Vec<u32> = dex_files.iter().map(|f| f.file_offset).collect();
    let dex_headers = listing::parse_dex_headers(&offsets, buf)?;

    Ok(LegacyOat {
        header,
        key_value_store,
        dex_files,
        dex_headers,
        oat_offset,
    })
}

fn parse_modern_oat(
    dex_files_only: bool,
    buf: &[u8],
    oat_offset: usize,
) -> crate::error::Result<ModernOat<'_>> {
    let (header, key_value_store, mut cur) = parse_common_sections(buf)?;
    let mut dex_files = listing::parse_modern(header.dex_file_count, &mut cur)?;

    let offsets: Vec<u32> = dex_files.iter().map(|f| f.file_offset).collect();
    let dex_headers = listing::parse_dex_headers(&offsets, buf)?;
    for (file, dex_header) in dex_files.iter_mut().zip(&dex_headers) {
        file.num_classes = dex_header.class_defs_size;
    }

    let (lookup_tables, classes) = if dex_files_only {
        (None, None)
    } else {
        (
            Some(lookup::parse_tables(&dex_files, &dex_headers, buf)?),
            Some(classes::parse_modern_classes(&dex_files, &dex_headers, buf)?),
        )
    };

    Ok(ModernOat {
        header,
        key_value_store,
        dex_files,
        dex_headers,
        lookup_tables,
        classes,
        oat_offset,
        oat_buf: buf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_survives_as_status() {
        // a deterministic stand-in for "1 KB of random non-magic bytes"
        let mut buf = vec![0u8; 1024];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        assert_ne!(&buf[..4], &OAT_MAGIC.to_le_bytes());

        let parsed = parse(&buf);
        assert_eq!(parsed.status(), Status::ParseBadMagic);
        assert_eq!(parsed.oat_offset(), 0);
        assert!(parsed.oat_dex_files().is_empty());
        match parsed {
            ParsedOat::BadMagic { header } => {
                assert_ne!(header.magic, OAT_MAGIC);
            }
            _ => panic!("expected BadMagic"),
        }
    }

    #[test]
    fn unknown_version_survives_as_status() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OAT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&0x0039_3939u32.to_le_bytes()); // "999\0"
        buf.extend_from_slice(&0u32.to_le_bytes());

        let parsed = parse(&buf);
        assert_eq!(parsed.status(), Status::ParseUnknownVersion);
        match parsed {
            ParsedOat::Unknown { header } => assert_eq!(header.version, 0x0039_3939),
            _ => panic!("expected Unknown"),
        }
    }

    #[test]
    fn truncated_body_is_a_parse_failure() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OAT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&OatVersion::V079.word().to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        // header claims more than the buffer holds

        let parsed = parse(&buf);
        assert_eq!(parsed.status(), Status::ParseFailure);
        match parsed {
            ParsedOat::Failed { header, error } => {
                assert_eq!(header.unwrap().version, OatVersion::V079.word());
                assert!(matches!(error, Error::Truncated { .. }));
            }
            _ => panic!("expected Failed"),
        }
    }

    #[test]
    fn short_elf_prefix_fails_gracefully() {
        let buf = b"\x7fELF too short".to_vec();
        let parsed = parse(&buf);
        assert_eq!(parsed.status(), Status::ParseFailure);
    }

    #[test]
    fn empty_buffer() {
        let parsed = parse(&[]);
        assert_eq!(parsed.status(), Status::ParseFailure);
    }
}
