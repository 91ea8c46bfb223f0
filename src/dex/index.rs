//! DEX index projector.
//!
//! Resolving a class name inside an in-memory DEX goes through three
//! indirections: `class_defs[i].class_idx → type_ids[idx] → string_ids[id]`,
//! the last being an absolute offset into the DEX where a ULEB128 length
//! prefixes the MUTF-8 name bytes. [`DexIndexes`] materialises aligned copies
//! of those tables up front (the raw tables sit at arbitrary offsets inside
//! the OAT body) and answers name and method-count queries for class
//! definitions.

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::FromBytes;

use crate::dex::{DexClassDef, DexFileHeader, DexMethodId};
use crate::error::{Error, Result};
use crate::util::{read_uleb128, slice, slice_range};

/// Owned copies of the DEX index tables for one DEX file.
///
/// Borrows the DEX byte span for the lifetime of the projector; class-name
/// lookups return slices into it.
pub struct DexIndexes<'a> {
    dex: &'a [u8],
    class_defs: Vec<DexClassDef>,
    type_ids: Vec<u32>,
    string_ids: Vec<u32>,
    /// Methods defined per *type* index (method ids reference types, not
    /// class defs).
    method_counts: Vec<u32>,
}

impl<'a> DexIndexes<'a> {
    /// Builds the projector from a span starting at the DEX file and its
    /// parsed header.
    pub fn new(dex: &'a [u8], header: &DexFileHeader) -> Result<Self> {
        let class_defs = read_table::<DexClassDef>(
            dex,
            header.class_defs_off,
            header.class_defs_size,
            DexClassDef::SIZE,
        )?;
        let type_ids = read_words(dex, header.type_ids_off, header.type_ids_size)?;
        let string_ids = read_words(dex, header.string_ids_off, header.string_ids_size)?;

        let mut method_counts = vec![0u32; header.type_ids_size as usize];
        let method_ids = slice_range(
            dex,
            header.method_ids_off as usize,
            header.method_ids_off as usize + header.method_ids_size as usize * DexMethodId::SIZE,
        )?;
        for raw in method_ids.chunks_exact(DexMethodId::SIZE) {
            let class_idx = LittleEndian::read_u16(raw) as u32;
            let count = method_counts
                .get_mut(class_idx as usize)
                .ok_or_else(|| Error::dex_index("type_ids", class_idx, header.type_ids_size))?;
            *count += 1;
        }

        Ok(Self {
            dex,
            class_defs,
            type_ids,
            string_ids,
            method_counts,
        })
    }

    /// Number of class definitions.
    #[inline]
    pub fn num_classes(&self) -> u32 {
        self.class_defs.len() as u32
    }

    /// Name of the `i`-th class definition, as the raw MUTF-8 bytes including
    /// the trailing NUL.
    pub fn class_name(&self, i: usize) -> Result<&'a [u8]> {
        let def = self
            .class_defs
            .get(i)
            .ok_or_else(|| Error::dex_index("class_defs", i as u32, self.num_classes()))?;
        let string_id = *self
            .type_ids
            .get(def.class_idx as usize)
            .ok_or_else(|| {
                Error::dex_index("type_ids", def.class_idx as u32, self.type_ids.len() as u32)
            })?;
        let string_off = *self
            .string_ids
            .get(string_id as usize)
            .ok_or_else(|| {
                Error::dex_index("string_ids", string_id, self.string_ids.len() as u32)
            })? as usize;

        let data = slice(self.dex, string_off)?;
        let mut pos = 0;
        let len = read_uleb128(data, &mut pos)? as usize;
        slice_range(data, pos, pos + len + 1)
    }

    /// Number of methods defined on the `i`-th class definition.
    pub fn method_count(&self, i: usize) -> Result<u32> {
        let def = self
            .class_defs
            .get(i)
            .ok_or_else(|| Error::dex_index("class_defs", i as u32, self.num_classes()))?;
        self.method_counts
            .get(def.class_idx as usize)
            .copied()
            .ok_or_else(|| {
                Error::dex_index(
                    "type_ids",
                    def.class_idx as u32,
                    self.method_counts.len() as u32,
                )
            })
    }
}

/// Copies `count` records of `record_size` bytes starting at `off` into
/// naturally aligned storage.
fn read_table<T: FromBytes>(
    dex: &[u8],
    off: u32,
    count: u32,
    record_size: usize,
) -> Result<Vec<T>> {
    let raw = slice_range(
        dex,
        off as usize,
        off as usize + count as usize * record_size,
    )?;
    let mut out = Vec::with_capacity(count as usize);
    for chunk in raw.chunks_exact(record_size) {
        // read_from_bytes copies, so the source needs no alignment
        let record = T::read_from_bytes(chunk)
            .map_err(|_| Error::truncated(off as usize, record_size, dex.len()))?;
        out.push(record);
    }
    Ok(out)
}

fn read_words(dex: &[u8], off: u32, count: u32) -> Result<Vec<u32>> {
    let raw = slice_range(dex, off as usize, off as usize + count as usize * 4)?;
    Ok(raw.chunks_exact(4).map(LittleEndian::read_u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::testdex::TestDexBuilder;

    #[test]
    fn class_names_resolve() {
        let dex = TestDexBuilder::new()
            .class("LFoo;")
            .class("Lcom/example/Bar;")
            .build();
        let header = DexFileHeader::parse(&dex).unwrap();
        let indexes = DexIndexes::new(&dex, &header).unwrap();

        assert_eq!(indexes.num_classes(), 2);
        assert_eq!(indexes.class_name(0).unwrap(), b"LFoo;\0");
        assert_eq!(indexes.class_name(1).unwrap(), b"Lcom/example/Bar;\0");
        assert!(matches!(
            indexes.class_name(2),
            Err(Error::DexIndex { table: "class_defs", .. })
        ));
    }

    #[test]
    fn method_counts_per_class() {
        let dex = TestDexBuilder::new()
            .class("LA;")
            .class("LB;")
            .method(0)
            .method(0)
            .method(1)
            .build();
        let header = DexFileHeader::parse(&dex).unwrap();
        let indexes = DexIndexes::new(&dex, &header).unwrap();

        assert_eq!(indexes.method_count(0).unwrap(), 2);
        assert_eq!(indexes.method_count(1).unwrap(), 1);
    }

    #[test]
    fn method_with_bad_type_index_rejected() {
        let dex = TestDexBuilder::new().class("LA;").method(7).build();
        let header = DexFileHeader::parse(&dex).unwrap();
        assert!(matches!(
            DexIndexes::new(&dex, &header),
            Err(Error::DexIndex { table: "type_ids", .. })
        ));
    }

    #[test]
    fn truncated_tables_rejected() {
        let dex = TestDexBuilder::new().class("LA;").build();
        let header = DexFileHeader::parse(&dex).unwrap();
        // cut the buffer inside the class_defs table
        let cut = &dex[..dex.len() - 8];
        assert!(matches!(
            DexIndexes::new(cut, &header),
            Err(Error::Truncated { .. })
        ));
    }
}
