//! Type-lookup-table codec.
//!
//! Modern OAT files carry one open-addressed hash table per DEX so the
//! runtime can find a class definition without binary-searching the DEX
//! tables. The table has `next_power_of_two(class_defs_size)` slots; each
//! slot stores the DEX-relative offset of the class-name string, a packed
//! data halfword (class-def index in the low bits, high hash bits above),
//! and a forward delta to the next entry of its collision chain.
//!
//! Insertion is two-pass: every class first tries its home slot
//! (`hash & mask`); the ones that lose go to a retry list and are chained
//! in order, each appended at the first free slot after its chain tail.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::dex::{DexClassDef, DexFileHeader};
use crate::error::{Error, Result};
use crate::oat::listing::ModernDexFile;
use crate::oat::DexInput;
use crate::sink::ChecksumSink;
use crate::util::{next_power_of_two, read_uleb128, slice_range};

/// Scratch size for class-name reads during table construction; names
/// longer than this fall back to a heap read.
const NAME_SCRATCH_SIZE: usize = 256;

// =============================================================================
// Entries
// =============================================================================

/// One slot of a type-lookup table, exactly the on-disk layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupTableEntry {
    /// Offset of the class-name string data relative to the DEX file start;
    /// zero marks an empty slot.
    pub str_offset: u32,
    /// Class-def index in the low `log2(N)` bits, high hash bits above.
    pub data: u16,
    /// Slots to skip forward (mod N) to the next chain entry; zero ends the
    /// chain.
    pub next_pos_delta: u16,
}

impl LookupTableEntry {
    /// Size of one slot in bytes.
    pub const SIZE: usize = 8;

    #[inline]
    fn is_empty(&self) -> bool {
        self.str_offset == 0
    }
}

/// A decoded view of one DEX file's lookup table.
#[derive(Debug, Clone)]
pub struct LookupTable {
    /// Offset of the owning DEX body inside the OAT.
    pub dex_file_offset: u32,
    /// Location string of the owning DEX.
    pub location: String,
    /// All slots, empty ones included.
    pub entries: Vec<LookupTableEntry>,
}

/// Number of slots for a DEX with `num_class_defs` class definitions, or
/// zero when the table is unsupported (no classes, or more than fit the
/// 16-bit data field).
pub fn num_entries(num_class_defs: u32) -> u32 {
    if num_class_defs == 0 || num_class_defs > u16::MAX as u32 {
        0
    } else {
        next_power_of_two(num_class_defs)
    }
}

/// Hashes a class name: `h = h * 31 + c` over the bytes up to the trailing
/// NUL, wrapping at 32 bits.
pub fn hash_class_name(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &c in name {
        if c == 0 {
            break;
        }
        hash = hash.wrapping_mul(31).wrapping_add(c as u32);
    }
    hash
}

/// Packs the data halfword: high hash bits above the index bits.
pub fn make_data(class_def_idx: u16, hash: u32, mask: u32) -> u16 {
    let hash_mask = !(mask as u16);
    (hash as u16 & hash_mask) | class_def_idx
}

// =============================================================================
// Parsing
// =============================================================================

/// Materialises the lookup tables referenced by a modern DEX listing.
pub fn parse_tables(
    listing: &[ModernDexFile],
    headers: &[DexFileHeader],
    oat_buf: &[u8],
) -> Result<Vec<LookupTable>> {
    let mut tables = Vec::with_capacity(listing.len());

    for (entry, header) in listing.iter().zip(headers) {
        let count = num_entries(header.class_defs_size) as usize;
        let begin = entry.lookup_table_offset as usize;
        let raw = slice_range(oat_buf, begin, begin + count * LookupTableEntry::SIZE)?;

        let entries = raw
            .chunks_exact(LookupTableEntry::SIZE)
            .map(|chunk| LookupTableEntry {
                str_offset: LittleEndian::read_u32(chunk),
                data: LittleEndian::read_u16(&chunk[4..]),
                next_pos_delta: LittleEndian::read_u16(&chunk[6..]),
            })
            .collect();

        tables.push(LookupTable {
            dex_file_offset: entry.file_offset,
            location: entry.location.clone(),
            entries,
        });
    }

    Ok(tables)
}

// =============================================================================
// Building
// =============================================================================

/// Builds the lookup table for the DEX file at `path` with `table_size`
/// slots (as returned by [`num_entries`]).
///
/// Class names are read back from the file itself rather than from memory;
/// this is the one place the builder touches DEX content beyond the header.
pub fn build_table(path: &Path, table_size: u32) -> Result<Vec<LookupTableEntry>> {
    if table_size == 0 {
        return Ok(Vec::new());
    }
    let mut table = vec![LookupTableEntry::default(); table_size as usize];
    let mask = table_size - 1;

    let open_err = |source| Error::FileOpen {
        path: path.to_path_buf(),
        source,
    };
    let read_err = |source| Error::FileRead {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(open_err)?;
    let mut header_buf = [0u8; DexFileHeader::SIZE];
    file.read_exact(&mut header_buf).map_err(read_err)?;
    let header = DexFileHeader::parse(&header_buf)?;

    let type_ids = read_word_table(&mut file, header.type_ids_off, header.type_ids_size)
        .map_err(read_err)?;
    let string_ids = read_word_table(&mut file, header.string_ids_off, header.string_ids_size)
        .map_err(read_err)?;

    file.seek(SeekFrom::Start(header.class_defs_off as u64))
        .map_err(read_err)?;
    let mut class_defs_raw = vec![0u8; header.class_defs_size as usize * DexClassDef::SIZE];
    file.read_exact(&mut class_defs_raw).map_err(read_err)?;

    struct Retry {
        string_offset: u32,
        data: u16,
        hash: u32,
    }
    let mut retries = Vec::new();

    let mut scratch = [0u8; NAME_SCRATCH_SIZE];
    for (i, def) in class_defs_raw.chunks_exact(DexClassDef::SIZE).enumerate() {
        let class_idx = LittleEndian::read_u16(def) as u32;
        let string_id = *type_ids
            .get(class_idx as usize)
            .ok_or_else(|| Error::dex_index("type_ids", class_idx, header.type_ids_size))?;
        let string_offset = *string_ids
            .get(string_id as usize)
            .ok_or_else(|| Error::dex_index("string_ids", string_id, header.string_ids_size))?;

        file.seek(SeekFrom::Start(string_offset as u64))
            .map_err(read_err)?;
        let got = read_up_to(&mut file, &mut scratch).map_err(read_err)?;
        if got == 0 {
            return Err(Error::truncated(string_offset as usize, 1, 0));
        }

        let mut pos = 0;
        let name_len = read_uleb128(&scratch[..got], &mut pos)? as usize + 1;

        let hash = if pos + name_len > got {
            // name spills past the scratch buffer, fetch it whole
            let mut name = vec![0u8; name_len];
            file.seek(SeekFrom::Start(string_offset as u64 + pos as u64))
                .map_err(read_err)?;
            file.read_exact(&mut name).map_err(read_err)?;
            hash_class_name(&name)
        } else {
            hash_class_name(&scratch[pos..pos + name_len])
        };

        let data = make_data(i as u16, hash, mask);
        let entry = LookupTableEntry {
            str_offset: string_offset,
            data,
            next_pos_delta: 0,
        };
        if !insert_no_probe(&mut table, entry, hash, mask) {
            retries.push(Retry {
                string_offset,
                data,
                hash,
            });
        }
    }

    for retry in retries {
        let entry = LookupTableEntry {
            str_offset: retry.string_offset,
            data: retry.data,
            next_pos_delta: 0,
        };
        insert_chained(&mut table, entry, retry.hash, mask);
    }

    Ok(table)
}

/// Writes the lookup tables for every DEX, verifying each planned offset.
pub fn write_tables<W: Write + Seek>(
    inputs: &[DexInput],
    listing: &[ModernDexFile],
    sink: &mut ChecksumSink<W>,
) -> Result<()> {
    for (input, entry) in inputs.iter().zip(listing) {
        if entry.lookup_table_offset != sink.bytes_written() {
            return Err(Error::LayoutMismatch {
                section: "lookup table",
                written: sink.bytes_written(),
                planned: entry.lookup_table_offset,
            });
        }

        let table = build_table(&input.path, num_entries(entry.num_classes))?;
        for slot in &table {
            sink.write_u32(slot.str_offset)?;
            sink.write_u16(slot.data)?;
            sink.write_u16(slot.next_pos_delta)?;
        }
    }
    Ok(())
}

/// Pass A: claim the home slot if it is still empty.
fn insert_no_probe(
    table: &mut [LookupTableEntry],
    entry: LookupTableEntry,
    hash: u32,
    mask: u32,
) -> bool {
    let pos = (hash & mask) as usize;
    if !table[pos].is_empty() {
        return false;
    }
    table[pos] = entry;
    true
}

/// Pass B: walk the chain from the home slot to its tail, then link the
/// entry into the first free slot after it.
fn insert_chained(table: &mut [LookupTableEntry], entry: LookupTableEntry, hash: u32, mask: u32) {
    let mut pos = hash & mask;
    while table[pos as usize].next_pos_delta != 0 {
        pos = (pos + table[pos as usize].next_pos_delta as u32) & mask;
    }

    let mut delta = 1u32;
    while !table[((pos + delta) & mask) as usize].is_empty() {
        delta += 1;
    }
    let next_pos = (pos + delta) & mask;
    table[pos as usize].next_pos_delta = delta as u16;
    table[next_pos as usize] = entry;
}

fn read_word_table(file: &mut File, off: u32, count: u32) -> std::io::Result<Vec<u32>> {
    file.seek(SeekFrom::Start(off as u64))?;
    let mut raw = vec![0u8; count as usize * 4];
    file.read_exact(&mut raw)?;
    Ok(raw.chunks_exact(4).map(LittleEndian::read_u32).collect())
}

/// Reads as many bytes as fit `buf`, stopping early at end of file.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::testdex::{write_temp, TestDexBuilder};

    #[test]
    fn hash_law() {
        assert_eq!(hash_class_name(b""), 0);
        assert_eq!(hash_class_name(b"\0"), 0);
        let base = hash_class_name(b"LFoo");
        assert_eq!(
            hash_class_name(b"LFoo;"),
            base.wrapping_mul(31).wrapping_add(b';' as u32)
        );
        // trailing NUL never contributes
        assert_eq!(hash_class_name(b"LFoo;\0"), hash_class_name(b"LFoo;"));
    }

    #[test]
    fn entry_counts() {
        assert_eq!(num_entries(0), 0);
        assert_eq!(num_entries(1), 1);
        assert_eq!(num_entries(3), 4);
        assert_eq!(num_entries(5), 8);
        assert_eq!(num_entries(65535), 65536);
        assert_eq!(num_entries(65536), 0);
    }

    #[test]
    fn data_packing() {
        // mask 3: two index bits, hash bits above
        let data = make_data(2, 0xabcd, 3);
        assert_eq!(data & 0x3, 2);
        assert_eq!(data & 0xfffc, 0xabcc);
    }

    fn chain_slots(table: &[LookupTableEntry], hash: u32, mask: u32) -> Vec<usize> {
        let mut slots = vec![(hash & mask) as usize];
        loop {
            let last = *slots.last().unwrap();
            let delta = table[last].next_pos_delta as u32;
            if delta == 0 {
                break;
            }
            slots.push(((last as u32 + delta) & mask) as usize);
        }
        slots
    }

    #[test]
    fn builds_table_with_collision_chain() {
        // "LA;" and "LE;" land on the same slot mod 4; "LB;" does not
        let h_a = hash_class_name(b"LA;");
        let h_e = hash_class_name(b"LE;");
        let h_b = hash_class_name(b"LB;");
        assert_eq!(h_a & 3, h_e & 3);
        assert_ne!(h_a & 3, h_b & 3);

        let dex = TestDexBuilder::new()
            .class("LA;")
            .class("LB;")
            .class("LE;")
            .build();
        let path = write_temp("lookup-collision.dex", &dex);

        let size = num_entries(3);
        assert_eq!(size, 4);
        let table = build_table(&path, size).unwrap();
        std::fs::remove_file(&path).ok();

        let occupied = table.iter().filter(|e| !e.is_empty()).count();
        assert_eq!(occupied, 3);

        // pass A placed LA; at its home slot, pass B chained LE; one over
        let home = (h_a & 3) as usize;
        assert_eq!(table[home].data & 3, 0);
        assert_eq!(table[home].next_pos_delta, 1);
        let next = (home + 1) & 3;
        assert_eq!(table[next].data & 3, 2);
        assert_eq!(table[next].next_pos_delta, 0);

        // every class is reachable by walking the chain from its own hash
        let header = DexFileHeader::parse(&dex).unwrap();
        let indexes = crate::dex::DexIndexes::new(&dex, &header).unwrap();
        for i in 0..3usize {
            let hash = hash_class_name(indexes.class_name(i).unwrap());
            let found = chain_slots(&table, hash, 3)
                .into_iter()
                .any(|slot| !table[slot].is_empty() && (table[slot].data & 3) as usize == i);
            assert!(found, "class {i} not reachable from its chain");
        }
    }

    #[test]
    fn str_offsets_resolve_back_to_names() {
        let dex = TestDexBuilder::new().class("LA;").class("LB;").build();
        let path = write_temp("lookup-strs.dex", &dex);
        let table = build_table(&path, num_entries(2)).unwrap();
        std::fs::remove_file(&path).ok();

        let mut names = Vec::new();
        for entry in table.iter().filter(|e| !e.is_empty()) {
            let mut pos = entry.str_offset as usize;
            let len = read_uleb128(&dex, &mut pos).unwrap() as usize;
            names.push(dex[pos..pos + len].to_vec());
        }
        names.sort();
        assert_eq!(names, vec![b"LA;".to_vec(), b"LB;".to_vec()]);
    }

    #[test]
    fn long_names_fall_back_to_heap_read() {
        let long_name = format!("L{};", "x".repeat(300));
        let dex = TestDexBuilder::new().class(&long_name).build();
        let path = write_temp("lookup-long.dex", &dex);
        let table = build_table(&path, num_entries(1)).unwrap();
        std::fs::remove_file(&path).ok();

        let entry = table.iter().find(|e| !e.is_empty()).unwrap();
        let expected = hash_class_name(long_name.as_bytes());
        // mask 0: the data halfword is the low hash bits verbatim
        assert_eq!(entry.data, expected as u16);
    }
}
