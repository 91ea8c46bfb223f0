//! Human-readable rendering of a parsed OAT.
//!
//! Rendering is deterministic: the same parsed input always produces the
//! same text, so the output is diffable across runs and usable in tests.
//! Degraded parses (bad magic, unknown version, mid-parse failure) still
//! render whatever header fields were readable.

use std::fmt::Write as _;

use crate::oat::classes::{ClassKind, ClassStatus, DexClasses};
use crate::oat::header::{OatHeader, OatHeaderCommon};
use crate::oat::kv::KeyValueStore;
use crate::oat::lookup::LookupTable;
use crate::oat::parse::{LegacyOat, ModernOat, ParsedOat};
use crate::oat::{isa_name, OatVersion};
use crate::util::read_uleb128;

/// Width of the class-status matrix.
const CLASSES_PER_ROW: usize = 32;

/// Which optional sections the dump includes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    /// Render the per-DEX class-status matrix.
    pub dump_classes: bool,
    /// Render the type-lookup tables.
    pub dump_tables: bool,
    /// List classes whose status is below verified.
    pub print_unverified_classes: bool,
}

/// Renders a parsed OAT to text.
pub fn render(oat: &ParsedOat<'_>, opts: &DumpOptions) -> String {
    let mut out = String::new();
    match oat {
        ParsedOat::Legacy(legacy) => render_legacy(&mut out, legacy, opts),
        ParsedOat::Modern(modern) => render_modern(&mut out, modern, opts),
        ParsedOat::Unknown { header } => {
            let _ = writeln!(out, "Unknown OAT file version!");
            render_common(&mut out, header);
        }
        ParsedOat::BadMagic { header } => {
            let _ = writeln!(out, "Bad magic number:");
            render_common(&mut out, header);
        }
        ParsedOat::Failed { header, error } => {
            let _ = writeln!(out, "Parse failed: {error}");
            if let Some(header) = header {
                render_common(&mut out, header);
            }
        }
    }
    out
}

fn render_legacy(out: &mut String, oat: &LegacyOat, opts: &DumpOptions) {
    let _ = writeln!(out, "Header:");
    render_header(out, &oat.header);
    let _ = writeln!(out, "Key/Value store:");
    render_kv(out, &oat.key_value_store);

    let _ = writeln!(out, "Dex File Listing:");
    for file in &oat.dex_files {
        render_listing_entry(out, &file.location, file.location_checksum, file.file_offset, &[]);
    }
    render_dex_headers(out, oat);

    if opts.dump_classes {
        let _ = writeln!(out, "Classes:");
        for file in &oat.dex_files {
            render_class_matrix(out, &file.location, &file.class_info);
        }
    }
    if opts.print_unverified_classes {
        let _ = writeln!(out, "unverified classes:");
        for file in &oat.dex_files {
            render_unverified(out, &file.location, &file.class_info, &file.class_names);
        }
    }
}

fn render_modern(out: &mut String, oat: &ModernOat<'_>, opts: &DumpOptions) {
    let _ = writeln!(out, "Header:");
    render_header(out, &oat.header);
    let _ = writeln!(out, "Key/Value store:");
    render_kv(out, &oat.key_value_store);

    let _ = writeln!(out, "Dex File Listing:");
    for file in &oat.dex_files {
        render_listing_entry(
            out,
            &file.location,
            file.location_checksum,
            file.file_offset,
            &[
                ("classes_offset", file.classes_offset),
                ("lookup_table_offset", file.lookup_table_offset),
            ],
        );
    }
    let _ = writeln!(out, "Dex Files:");
    for header in &oat.dex_headers {
        let _ = writeln!(out, "  {{ DexFile");
        let _ = writeln!(out, "    file_size: 0x{:08x}", header.file_size);
        let _ = writeln!(out, "    num_classes: 0x{:08x}", header.class_defs_size);
        let _ = writeln!(out, "  }}");
    }

    if opts.dump_tables {
        let _ = writeln!(out, "LookupTables:");
        for table in oat.lookup_tables.as_deref().unwrap_or(&[]) {
            render_lookup_table(out, table, oat.oat_buf);
        }
    }
    if opts.dump_classes {
        let _ = writeln!(out, "Classes:");
        for classes in oat.classes.as_deref().unwrap_or(&[]) {
            render_class_matrix_for(out, classes);
        }
    }
    if opts.print_unverified_classes {
        let _ = writeln!(out, "unverified classes:");
        for classes in oat.classes.as_deref().unwrap_or(&[]) {
            render_unverified(out, &classes.location, &classes.class_info, &classes.class_names);
        }
    }
}

// =============================================================================
// Pieces
// =============================================================================

/// The first `count` bytes of a little-endian word as printable ASCII.
fn word_ascii(word: u32, count: usize) -> String {
    word.to_le_bytes()[..count]
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

fn render_common(out: &mut String, header: &OatHeaderCommon) {
    let _ = writeln!(
        out,
        "  magic:   0x{:08x} '{}'",
        header.magic,
        word_ascii(header.magic, 3)
    );
    let _ = writeln!(
        out,
        "  version: 0x{:08x} '{}'",
        header.version,
        word_ascii(header.version, 3)
    );
    let _ = writeln!(out, "  checksum: 0x{:08x}", header.adler32_checksum);
}

fn render_header(out: &mut String, header: &OatHeader) {
    render_common(out, &header.common);
    let _ = writeln!(out, "  isa: {}", isa_name(header.instruction_set));
    let _ = writeln!(
        out,
        "  isa features bitmap: 0x{:08x}",
        header.instruction_set_features_bitmap
    );
    let _ = writeln!(out, "  dex_file_count: 0x{:08x}", header.dex_file_count);
    let _ = writeln!(out, "  executable_offset: 0x{:08x}", header.executable_offset);
    let _ = writeln!(
        out,
        "  interpreter_to_interpreter_bridge_offset: 0x{:08x}",
        header.interpreter_to_interpreter_bridge_offset
    );
    let _ = writeln!(
        out,
        "  interpreter_to_compiled_code_bridge_offset: 0x{:08x}",
        header.interpreter_to_compiled_code_bridge_offset
    );
    let _ = writeln!(
        out,
        "  jni_dlsym_lookup_offset: 0x{:08x}",
        header.jni_dlsym_lookup_offset
    );

    if header.common.version == OatVersion::V045.word() {
        let _ = writeln!(
            out,
            "  portable_imt_conflict_trampoline_offset: 0x{:08x}",
            header.portable_imt_conflict_trampoline_offset
        );
        let _ = writeln!(
            out,
            "  portable_resolution_trampoline_offset: 0x{:08x}",
            header.portable_resolution_trampoline_offset
        );
        let _ = writeln!(
            out,
            "  portable_to_interpreter_bridge_offset: 0x{:08x}",
            header.portable_to_interpreter_bridge_offset
        );
    }

    let _ = writeln!(
        out,
        "  quick_generic_jni_trampoline_offset: 0x{:08x}",
        header.quick_generic_jni_trampoline_offset
    );
    let _ = writeln!(
        out,
        "  quick_imt_conflict_trampoline_offset: 0x{:08x}",
        header.quick_imt_conflict_trampoline_offset
    );
    let _ = writeln!(
        out,
        "  quick_resolution_trampoline_offset: 0x{:08x}",
        header.quick_resolution_trampoline_offset
    );
    let _ = writeln!(
        out,
        "  quick_to_interpreter_bridge_offset: 0x{:08x}",
        header.quick_to_interpreter_bridge_offset
    );
    let _ = writeln!(out, "  image_patch_delta: 0x{:08x}", header.image_patch_delta);
    let _ = writeln!(
        out,
        "  image_file_location_oat_checksum: 0x{:08x}",
        header.image_file_location_oat_checksum
    );
    let _ = writeln!(
        out,
        "  image_file_location_oat_data_begin: 0x{:08x}",
        header.image_file_location_oat_data_begin
    );
    let _ = writeln!(
        out,
        "  key_value_store_size: 0x{:08x}",
        header.key_value_store_size
    );
}

fn render_kv(out: &mut String, store: &KeyValueStore) {
    for (key, value) in &store.pairs {
        let _ = writeln!(out, "  {key}: {value}");
    }
}

fn render_listing_entry(
    out: &mut String,
    location: &str,
    location_checksum: u32,
    file_offset: u32,
    extra: &[(&str, u32)],
) {
    let _ = writeln!(out, "  {{");
    let _ = writeln!(out, "    location: {location}");
    let _ = writeln!(out, "    location_checksum: 0x{location_checksum:08x}");
    let _ = writeln!(out, "    file_offset: 0x{file_offset:08x}");
    for (name, value) in extra {
        let _ = writeln!(out, "    {name}: 0x{value:08x}");
    }
    let _ = writeln!(out, "  }}");
}

fn render_dex_headers(out: &mut String, oat: &LegacyOat) {
    let _ = writeln!(out, "Dex Files:");
    for header in &oat.dex_headers {
        let _ = writeln!(out, "  {{ DexFile");
        let _ = writeln!(out, "    file_size: 0x{:08x}", header.file_size);
        let _ = writeln!(out, "    num_classes: 0x{:08x}", header.class_defs_size);
        let _ = writeln!(out, "  }}");
    }
}

fn render_class_matrix(
    out: &mut String,
    location: &str,
    class_info: &[crate::oat::classes::ClassInfo],
) {
    let _ = writeln!(out, "  {{ Classes for dex {location}");
    for row in class_info.chunks(CLASSES_PER_ROW) {
        let _ = write!(out, "    ");
        for info in row {
            let _ = write!(
                out,
                "{}{} ",
                ClassStatus::short(info.status),
                ClassKind::short(info.kind)
            );
        }
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "  }}");
}

fn render_class_matrix_for(out: &mut String, classes: &DexClasses) {
    render_class_matrix(out, &classes.location, &classes.class_info);
}

fn render_unverified(
    out: &mut String,
    location: &str,
    class_info: &[crate::oat::classes::ClassInfo],
    class_names: &[Vec<u8>],
) {
    let _ = writeln!(out, "  {location}");
    for (info, name) in class_info.iter().zip(class_names) {
        if info.status < ClassStatus::Verified as i16 {
            let _ = writeln!(
                out,
                "    {} unverified (status: {})",
                display_name(name),
                ClassStatus::name(info.status)
            );
        }
    }
}

fn render_lookup_table(out: &mut String, table: &LookupTable, oat_buf: &[u8]) {
    let _ = writeln!(out, "  {{ Type lookup table {}", table.location);
    let _ = writeln!(out, "    num_entries: {}", table.entries.len());
    for entry in table.entries.iter().filter(|e| e.str_offset != 0) {
        let _ = writeln!(out, "    {{");
        let _ = writeln!(
            out,
            "    str: {}",
            resolve_name(oat_buf, table.dex_file_offset, entry.str_offset)
        );
        let _ = writeln!(out, "    str offset: 0x{:08x}", entry.str_offset);
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "  }}");
}

/// Decodes the ULEB128-prefixed class name at a DEX-relative string offset.
fn resolve_name(oat_buf: &[u8], dex_file_offset: u32, str_offset: u32) -> String {
    let mut pos = dex_file_offset as usize + str_offset as usize;
    let name = read_uleb128(oat_buf, &mut pos)
        .ok()
        .and_then(|len| oat_buf.get(pos..pos + len as usize));
    match name {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "<out of range>".to_string(),
    }
}

fn display_name(name: &[u8]) -> String {
    let trimmed = name.strip_suffix(&[0]).unwrap_or(name);
    String::from_utf8_lossy(trimmed).into_owned()
}
