//! DEX file listing codec and offset planner.
//!
//! The listing sits between the key-value store and the first DEX body and
//! names every embedded DEX. Both layout families share the entry prefix
//! (location length, location bytes without NUL, location checksum, file
//! offset) and then diverge:
//!
//! - **Legacy** (045/064): the entry continues with one absolute class-info
//!   offset per class definition of that DEX.
//! - **Modern** (079/088): the entry continues with a `classes_offset` and a
//!   `lookup_table_offset` word; per-class offsets move behind the former.
//!
//! The `build_*` functions double as the offset planner: walking the inputs
//! they assign 4-byte-aligned file offsets to every DEX body and every
//! trailing table, leaving `next_offset` at the end of planned data.

use std::io::{Seek, Write};

use crate::dex::{DexFileHeader, DexIndexes};
use crate::error::{Error, Result};
use crate::oat::classes::{self, ClassInfo};
use crate::oat::lookup::{self, LookupTableEntry};
use crate::oat::DexInput;
use crate::sink::ChecksumSink;
use crate::util::{align_up, is_aligned, slice, Cursor};

// =============================================================================
// Entry Types
// =============================================================================

/// One listing entry of the legacy layout.
#[derive(Debug, Clone)]
pub struct LegacyDexFile {
    /// Location string stored in the OAT.
    pub location: String,
    /// Checksum of the DEX file (its own header checksum).
    pub location_checksum: u32,
    /// Offset of the DEX body from the start of the OAT data.
    pub file_offset: u32,
    /// Absolute offset of each class's [`ClassInfo`] record.
    pub class_offsets: Vec<u32>,
    /// Parallel class records (parse: decoded; build: all verified).
    pub class_info: Vec<ClassInfo>,
    /// Parallel class names, raw MUTF-8 with trailing NUL (parse only).
    pub class_names: Vec<Vec<u8>>,
}

/// One listing entry of the modern layout.
#[derive(Debug, Clone)]
pub struct ModernDexFile {
    /// Location string stored in the OAT.
    pub location: String,
    /// Checksum of the DEX file (its own header checksum).
    pub location_checksum: u32,
    /// Offset of the DEX body from the start of the OAT data.
    pub file_offset: u32,
    /// Number of class definitions (derived from the DEX header, not stored
    /// in the listing).
    pub num_classes: u32,
    /// Offset of the per-class offset array.
    pub classes_offset: u32,
    /// Offset of the type-lookup table, or the end-of-data offset when the
    /// table is empty.
    pub lookup_table_offset: u32,
}

// =============================================================================
// Parsing
// =============================================================================

fn parse_entry_prefix(cur: &mut Cursor<'_>) -> Result<(String, u32, u32)> {
    let location_len = cur.read_u32()? as usize;
    let location = String::from_utf8_lossy(cur.read_bytes(location_len)?).into_owned();
    let location_checksum = cur.read_u32()?;
    let file_offset = cur.read_u32()?;
    Ok((location, location_checksum, file_offset))
}

/// Parses a modern listing of `count` entries.
pub fn parse_modern(count: u32, cur: &mut Cursor<'_>) -> Result<Vec<ModernDexFile>> {
    let mut files = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (location, location_checksum, file_offset) = parse_entry_prefix(cur)?;
        files.push(ModernDexFile {
            location,
            location_checksum,
            file_offset,
            num_classes: 0,
            classes_offset: cur.read_u32()?,
            lookup_table_offset: cur.read_u32()?,
        });
    }
    Ok(files)
}

/// Parses a legacy listing of `count` entries.
///
/// The class-info offsets live inline, so decoding an entry already walks
/// the class records it points at. With `dex_files_only` the offset words
/// are consumed but the records stay untouched.
pub fn parse_legacy(
    dex_files_only: bool,
    count: u32,
    cur: &mut Cursor<'_>,
    oat_buf: &[u8],
) -> Result<Vec<LegacyDexFile>> {
    let mut files = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (location, location_checksum, file_offset) = parse_entry_prefix(cur)?;

        let dex_buf = slice(oat_buf, file_offset as usize)?;
        let header = DexFileHeader::parse(dex_buf)?;

        let mut file = LegacyDexFile {
            location,
            location_checksum,
            file_offset,
            class_offsets: Vec::new(),
            class_info: Vec::new(),
            class_names: Vec::new(),
        };

        if dex_files_only {
            cur.skip(header.class_defs_size as usize * 4)?;
        } else {
            let indexes = DexIndexes::new(dex_buf, &header)?;
            for i in 0..header.class_defs_size as usize {
                let info_offset = cur.read_u32()?;
                let info = classes::parse_legacy_class(oat_buf, info_offset as usize, &indexes, i)?;
                file.class_offsets.push(info_offset);
                file.class_info.push(info);
                file.class_names.push(indexes.class_name(i)?.to_vec());
            }
        }

        files.push(file);
    }
    Ok(files)
}

/// Parses the DEX header at each listed file offset.
pub fn parse_dex_headers(file_offsets: &[u32], oat_buf: &[u8]) -> Result<Vec<DexFileHeader>> {
    file_offsets
        .iter()
        .map(|&off| DexFileHeader::parse(slice(oat_buf, off as usize)?))
        .collect()
}

// =============================================================================
// Sizing
// =============================================================================

/// Encoded size of a modern listing for these inputs. Locations are not
/// NUL-terminated.
pub fn modern_listing_size(inputs: &[DexInput]) -> u32 {
    inputs
        .iter()
        .map(|input| input.location.len() as u32 + 5 * 4)
        .sum()
}

/// Encoded size of a legacy listing for these inputs; needs the class count
/// of each DEX, so the headers are read from disk.
pub fn legacy_listing_size(inputs: &[DexInput]) -> Result<u32> {
    let mut total = 0u32;
    for input in inputs {
        let (header, _) = DexFileHeader::read_from_file(&input.path)?;
        total += input.location.len() as u32 + 3 * 4 + header.class_defs_size * 4;
    }
    Ok(total)
}

// =============================================================================
// Offset Planning
// =============================================================================

/// Plans the legacy layout: DEX bodies first, then one contiguous class-info
/// block whose per-class offsets are recorded in each entry.
///
/// `next_offset` must point at the first byte after the listing (4-aligned);
/// on return it points past the class-info block.
pub fn build_legacy(inputs: &[DexInput], next_offset: &mut u32) -> Result<Vec<LegacyDexFile>> {
    let mut total_dex_size = 0u32;
    let mut total_class_info_size = 0u32;
    let mut files = Vec::with_capacity(inputs.len());

    for input in inputs {
        let dex_offset = *next_offset + total_dex_size;
        let (header, file_size) = DexFileHeader::read_from_file(&input.path)?;
        total_dex_size += align_up(file_size as u32, 4);

        let num_classes = header.class_defs_size;
        total_class_info_size += num_classes * ClassInfo::SIZE as u32;

        files.push(LegacyDexFile {
            location: input.location.clone(),
            location_checksum: header.checksum,
            file_offset: dex_offset,
            class_offsets: vec![0; num_classes as usize],
            class_info: vec![ClassInfo::VERIFIED_NONE_COMPILED; num_classes as usize],
            class_names: Vec::new(),
        });
    }

    *next_offset += total_dex_size;
    let mut class_info_offset = *next_offset;
    *next_offset += total_class_info_size;

    // the class-info records of all dex files form one contiguous block
    for file in &mut files {
        for offset in &mut file.class_offsets {
            *offset = class_info_offset;
            class_info_offset += ClassInfo::SIZE as u32;
        }
    }

    Ok(files)
}

/// Plans the modern layout: DEX bodies, then every class table, then every
/// lookup table.
///
/// Entry fields temporarily hold the *size* of their table while the DEX
/// loop runs; the two fix-up passes afterwards replace sizes with offsets.
pub fn build_modern(inputs: &[DexInput], next_offset: &mut u32) -> Result<Vec<ModernDexFile>> {
    let mut total_dex_size = 0u32;
    let mut files = Vec::with_capacity(inputs.len());

    for input in inputs {
        let dex_offset = *next_offset + total_dex_size;
        let (header, file_size) = DexFileHeader::read_from_file(&input.path)?;
        total_dex_size += align_up(file_size as u32, 4);

        let num_classes = header.class_defs_size;
        let class_table_size = num_classes * 4 + num_classes * ClassInfo::SIZE as u32;
        let lookup_table_size =
            lookup::num_entries(num_classes) * LookupTableEntry::SIZE as u32;

        files.push(ModernDexFile {
            location: input.location.clone(),
            location_checksum: header.checksum,
            file_offset: dex_offset,
            num_classes,
            classes_offset: class_table_size,
            lookup_table_offset: lookup_table_size,
        });
    }

    *next_offset += total_dex_size;
    if !is_aligned(*next_offset, 4) {
        return Err(Error::LayoutMismatch {
            section: "dex bodies",
            written: *next_offset,
            planned: align_up(*next_offset, 4),
        });
    }

    for file in &mut files {
        let size = file.classes_offset;
        file.classes_offset = *next_offset;
        *next_offset += size;
    }
    for file in &mut files {
        let size = file.lookup_table_offset;
        file.lookup_table_offset = *next_offset;
        *next_offset += size;
    }

    Ok(files)
}

// =============================================================================
// Writing
// =============================================================================

fn write_entry_prefix<W: Write + Seek>(
    sink: &mut ChecksumSink<W>,
    location: &str,
    location_checksum: u32,
    file_offset: u32,
) -> Result<()> {
    sink.write_u32(location.len() as u32)?;
    sink.write_all(location.as_bytes())?;
    sink.write_u32(location_checksum)?;
    sink.write_u32(file_offset)
}

/// Emits a legacy listing.
pub fn write_legacy<W: Write + Seek>(
    files: &[LegacyDexFile],
    sink: &mut ChecksumSink<W>,
) -> Result<()> {
    for file in files {
        write_entry_prefix(sink, &file.location, file.location_checksum, file.file_offset)?;
        for offset in &file.class_offsets {
            sink.write_u32(*offset)?;
        }
    }
    Ok(())
}

/// Emits a modern listing.
pub fn write_modern<W: Write + Seek>(
    files: &[ModernDexFile],
    sink: &mut ChecksumSink<W>,
) -> Result<()> {
    for file in files {
        write_entry_prefix(sink, &file.location, file.location_checksum, file.file_offset)?;
        sink.write_u32(file.classes_offset)?;
        sink.write_u32(file.lookup_table_offset)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::testdex::{write_temp, TestDexBuilder};
    use crate::sink::Sink;
    use std::io::Cursor as IoCursor;

    #[test]
    fn modern_listing_roundtrip() {
        let files = vec![
            ModernDexFile {
                location: "base.apk".to_string(),
                location_checksum: 0x1111,
                file_offset: 0x100,
                num_classes: 0,
                classes_offset: 0x200,
                lookup_table_offset: 0x300,
            },
            ModernDexFile {
                location: "split_config.apk".to_string(),
                location_checksum: 0x2222,
                file_offset: 0x400,
                num_classes: 0,
                classes_offset: 0x500,
                lookup_table_offset: 0x600,
            },
        ];

        let mut sink = ChecksumSink::new(Sink::new(IoCursor::new(Vec::new())));
        write_modern(&files, &mut sink).unwrap();
        let bytes = sink
            .into_sink()
            .unwrap()
            .into_inner()
            .unwrap()
            .into_inner();

        let inputs: Vec<DexInput> = files
            .iter()
            .map(|f| DexInput {
                path: "unused".into(),
                location: f.location.clone(),
            })
            .collect();
        assert_eq!(modern_listing_size(&inputs) as usize, bytes.len());

        let mut cur = Cursor::new(&bytes);
        let parsed = parse_modern(2, &mut cur).unwrap();
        assert_eq!(cur.remaining(), 0);
        for (a, b) in parsed.iter().zip(&files) {
            assert_eq!(a.location, b.location);
            assert_eq!(a.location_checksum, b.location_checksum);
            assert_eq!(a.file_offset, b.file_offset);
            assert_eq!(a.classes_offset, b.classes_offset);
            assert_eq!(a.lookup_table_offset, b.lookup_table_offset);
        }
    }

    #[test]
    fn modern_plan_places_tables_after_bodies() {
        let dex_a = TestDexBuilder::new()
            .class("LA;")
            .class("LB;")
            .class("LC;")
            .build();
        let dex_b = TestDexBuilder::new().class("LZ;").build();
        let path_a = write_temp("plan-a.dex", &dex_a);
        let path_b = write_temp("plan-b.dex", &dex_b);
        let inputs = vec![
            DexInput {
                path: path_a.clone(),
                location: "a.dex".to_string(),
            },
            DexInput {
                path: path_b.clone(),
                location: "b.dex".to_string(),
            },
        ];

        let start = 0x100;
        let mut next_offset = start;
        let files = build_modern(&inputs, &mut next_offset).unwrap();
        std::fs::remove_file(&path_a).ok();
        std::fs::remove_file(&path_b).ok();

        let a_padded = align_up(dex_a.len() as u32, 4);
        assert_eq!(files[0].file_offset, start);
        assert_eq!(files[1].file_offset, start + a_padded);

        let bodies_end = start + a_padded + align_up(dex_b.len() as u32, 4);
        // class tables for both dexes, in order, then both lookup tables
        assert_eq!(files[0].classes_offset, bodies_end);
        assert_eq!(files[0].num_classes, 3);
        assert_eq!(files[1].classes_offset, bodies_end + 3 * 8);
        assert_eq!(files[0].lookup_table_offset, bodies_end + 3 * 8 + 8);
        assert_eq!(
            files[1].lookup_table_offset,
            files[0].lookup_table_offset + 4 * LookupTableEntry::SIZE as u32
        );
        assert_eq!(
            next_offset,
            files[1].lookup_table_offset + LookupTableEntry::SIZE as u32
        );

        for f in &files {
            assert!(is_aligned(f.file_offset, 4));
            assert!(is_aligned(f.classes_offset, 4));
            assert!(is_aligned(f.lookup_table_offset, 4));
        }
    }

    #[test]
    fn legacy_plan_makes_class_offsets_contiguous() {
        let dex_a = TestDexBuilder::new().class("LA;").class("LB;").build();
        let dex_b = TestDexBuilder::new().class("LC;").class("LD;").build();
        let path_a = write_temp("plan-legacy-a.dex", &dex_a);
        let path_b = write_temp("plan-legacy-b.dex", &dex_b);
        let inputs = vec![
            DexInput {
                path: path_a.clone(),
                location: "a.dex".to_string(),
            },
            DexInput {
                path: path_b.clone(),
                location: "b.dex".to_string(),
            },
        ];

        let mut next_offset = 0x200;
        let files = build_legacy(&inputs, &mut next_offset).unwrap();
        std::fs::remove_file(&path_a).ok();
        std::fs::remove_file(&path_b).ok();

        let bodies_end =
            0x200 + align_up(dex_a.len() as u32, 4) + align_up(dex_b.len() as u32, 4);
        assert_eq!(files[0].class_offsets, vec![bodies_end, bodies_end + 4]);
        assert_eq!(
            files[1].class_offsets,
            vec![bodies_end + 8, bodies_end + 12]
        );
        assert_eq!(next_offset, bodies_end + 16);
        assert!(files
            .iter()
            .all(|f| f.class_info.iter().all(|c| *c == ClassInfo::VERIFIED_NONE_COMPILED)));
    }

    #[test]
    fn listing_sizes() {
        let dex = TestDexBuilder::new().class("LA;").build();
        let path = write_temp("size.dex", &dex);
        let inputs = vec![DexInput {
            path: path.clone(),
            location: "loc".to_string(),
        }];

        assert_eq!(modern_listing_size(&inputs), 3 + 20);
        // legacy: location + 3 words + one class-offset word
        assert_eq!(legacy_listing_size(&inputs).unwrap(), 3 + 12 + 4);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_dex_fails_listing_size() {
        let inputs = vec![DexInput {
            path: "/nonexistent/oatx-no-such.dex".into(),
            location: "x".to_string(),
        }];
        assert!(matches!(
            legacy_listing_size(&inputs),
            Err(Error::FileOpen { .. })
        ));
    }
}
