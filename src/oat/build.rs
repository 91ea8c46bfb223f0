//! Build orchestration.
//!
//! Building walks the plan laid out in `listing`: header template and sizes
//! first, then one streaming emission pass through the checksumming sink,
//! and finally a seek back to patch the real magic, version and checksum
//! into the common header. The common header is written through the bare
//! sink both times, so the stored Adler-32 covers exactly the bytes from
//! the key-value store to the end of the zero padding.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;

use tracing::{debug, info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::dex::DexFileHeader;
use crate::elf::ElfShell;
use crate::error::{Error, Result};
use crate::oat::classes;
use crate::oat::header::{OatHeader, OatHeaderCommon};
use crate::oat::kv::{self, KeyValueStore};
use crate::oat::listing::{self, LegacyDexFile, ModernDexFile};
use crate::oat::lookup;
use crate::oat::{DexInput, InstructionSet, Layout, OatVersion, OAT_MAGIC};
use crate::sink::{ChecksumSink, Sink};
use crate::util::align_up;

/// Placeholder written into the common header before the checksum is known.
const COMMON_HEADER_PLACEHOLDER: u32 = 0xcdcd_cdcd;

/// Pointer width of every target this builder ships for.
const POINTER_SIZE: u32 = 4;

// =============================================================================
// ART Image Info
// =============================================================================

/// The boot-image fields harvested for version 064 headers.
#[derive(Debug, Clone, Copy)]
struct ImageInfo {
    patch_delta: i32,
    oat_checksum: u32,
    data_begin: u32,
}

/// On-disk header of an ART boot image, as of the 064 era.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ArtImageHeader {
    magic: [u8; 4],
    version: [u8; 4],
    image_begin: u32,
    image_size: u32,
    oat_checksum: u32,
    oat_file_begin: u32,
    oat_data_begin: u32,
    oat_data_end: u32,
    oat_file_end: u32,
    patch_delta: i32,
    image_roots: u32,
    pointer_size: u32,
    compile_pic: u32,
}

/// Reads the three image-location fields from a boot image, treating a
/// missing or short file as "no image info".
fn read_image_info(art_image_location: &str) -> Option<ImageInfo> {
    let mut file = File::open(art_image_location).ok()?;
    let mut buf = [0u8; std::mem::size_of::<ArtImageHeader>()];
    file.read_exact(&mut buf).ok()?;
    let header = ArtImageHeader::read_from_bytes(&buf).ok()?;
    Some(ImageInfo {
        patch_delta: header.patch_delta,
        oat_checksum: header.oat_checksum,
        data_begin: header.oat_data_begin,
    })
}

// =============================================================================
// Header Template
// =============================================================================

fn build_header(
    isa: InstructionSet,
    dex_file_count: u32,
    keyvalue_size: u32,
    oat_size: u32,
    image_info: Option<ImageInfo>,
) -> OatHeader {
    let mut header = OatHeader {
        // the common part is rewritten with real values once the checksum
        // of the body is known
        common: OatHeaderCommon {
            magic: COMMON_HEADER_PLACEHOLDER,
            version: COMMON_HEADER_PLACEHOLDER,
            adler32_checksum: COMMON_HEADER_PLACEHOLDER,
        },
        instruction_set: isa as u32,
        // observed as 1 on both x86 and arm builds
        instruction_set_features_bitmap: 1,
        dex_file_count,
        executable_offset: oat_size,
        key_value_store_size: keyvalue_size,
        ..Default::default()
    };

    if let Some(info) = image_info {
        header.image_patch_delta = info.patch_delta;
        header.image_file_location_oat_checksum = info.oat_checksum;
        header.image_file_location_oat_data_begin = info.data_begin;
    }

    header
}

// =============================================================================
// BSS Sizing
// =============================================================================

fn types_size(num_elements: u32) -> u32 {
    (num_elements * POINTER_SIZE).max(POINTER_SIZE)
}

fn methods_size(num_elements: u32) -> u32 {
    (num_elements * POINTER_SIZE).max(POINTER_SIZE)
}

fn strings_size(num_elements: u32) -> u32 {
    num_elements * POINTER_SIZE
}

fn fields_size(num_elements: u32) -> u32 {
    num_elements * POINTER_SIZE
}

/// Size of the `.bss` section the ELF shell advertises: per-DEX runtime
/// tables for types, methods, strings and fields, each 4-aligned.
fn compute_bss_size(inputs: &[DexInput]) -> Result<u32> {
    let mut total = 0u32;
    for input in inputs {
        let (header, _) = DexFileHeader::read_from_file(&input.path)?;
        let methods_offset = align_up(types_size(header.type_ids_size), POINTER_SIZE);
        let strings_offset =
            align_up(methods_offset + methods_size(header.method_ids_size), POINTER_SIZE);
        let fields_offset =
            align_up(strings_offset + strings_size(header.string_ids_size), POINTER_SIZE);
        total += align_up(fields_offset + fields_size(header.field_ids_size), POINTER_SIZE);
    }
    Ok(total)
}

// =============================================================================
// Build Entry
// =============================================================================

/// Builds an OAT file at `oat_path` embedding `inputs`, for the given
/// version and instruction set.
///
/// With `write_elf` the OAT data is preceded by a 4096-byte ELF shell and
/// all internal offsets stay relative to the OAT data, not the file. The
/// `art_image_location` is recorded in the key-value store and, for version
/// 064, probed for boot-image header fields.
pub fn build(
    oat_path: &Path,
    inputs: &[DexInput],
    version: OatVersion,
    isa: InstructionSet,
    write_elf: bool,
    art_image_location: &str,
) -> Result<()> {
    let key_value = kv::build_pairs(art_image_location);

    let image_info = if version == OatVersion::V064 {
        let info = read_image_info(art_image_location);
        if info.is_none() {
            warn!(art_image_location, "no usable art image, zero-filling image fields");
        }
        info
    } else {
        None
    };

    // ---- sizes and offsets

    let keyvalue_size = KeyValueStore::compute_size(&key_value);
    let listing_size = match version.layout() {
        Layout::Legacy => listing::legacy_listing_size(inputs)?,
        Layout::Modern => listing::modern_listing_size(inputs),
    };

    // neither the key-value store nor the listing needs alignment
    let mut next_offset =
        align_up(OatHeader::size(version) as u32 + keyvalue_size + listing_size, 4);

    let planned = match version.layout() {
        Layout::Legacy => PlannedListing::Legacy(listing::build_legacy(inputs, &mut next_offset)?),
        Layout::Modern => PlannedListing::Modern(listing::build_modern(inputs, &mut next_offset)?),
    };
    let oat_size = align_up(next_offset, 4096);
    debug!(oat_size, "planned layout");

    let header = build_header(isa, inputs.len() as u32, keyvalue_size, oat_size, image_info);

    // ---- write the file

    let file = File::create(oat_path).map_err(|source| Error::FileWrite {
        path: oat_path.to_path_buf(),
        source,
    })?;
    let mut sink = Sink::new(file);

    if write_elf {
        // leave room for the shell and make offset 0 mean "start of oat"
        sink.write_padding(0, crate::oat::ELF_OAT_OFFSET)?;
        sink.set_seek_reference_to_position()?;
        sink.reset_bytes_written();
    }

    // the header goes through the bare sink: none of it is checksummed
    header.write(&mut sink, version)?;

    let mut cksum = ChecksumSink::new(sink);
    KeyValueStore::write(&mut cksum, &key_value)?;
    match &planned {
        PlannedListing::Legacy(files) => listing::write_legacy(files, &mut cksum)?,
        PlannedListing::Modern(files) => listing::write_modern(files, &mut cksum)?,
    }

    let padding = align_up(cksum.bytes_written(), 4) - cksum.bytes_written();
    cksum.write_padding(0, padding as usize)?;

    match &planned {
        PlannedListing::Legacy(files) => {
            write_dex_bodies(inputs, files.iter().map(|f| f.file_offset), &mut cksum)?;
            classes::write_legacy(files, &mut cksum)?;
        }
        PlannedListing::Modern(files) => {
            write_dex_bodies(inputs, files.iter().map(|f| f.file_offset), &mut cksum)?;
            classes::write_modern(files, &mut cksum)?;
            lookup::write_tables(inputs, files, &mut cksum)?;
        }
    }

    cksum.write_padding(0, (oat_size - cksum.bytes_written()) as usize)?;

    // ---- patch the common header with the real checksum

    let checksum = cksum.checksum()?;
    let mut sink = cksum.into_sink()?;
    sink.seek_to(0)?;
    OatHeaderCommon {
        magic: OAT_MAGIC,
        version: version.word(),
        adler32_checksum: checksum,
    }
    .write(&mut sink)?;

    if write_elf {
        sink.set_seek_reference(0);
        sink.seek_to(0)?;
        let shell = ElfShell::build(isa, oat_size, compute_bss_size(inputs)?);
        shell.write(&mut sink)?;
    }

    sink.into_inner()?;
    info!(path = %oat_path.display(), oat_size, checksum, "oat build complete");
    Ok(())
}

enum PlannedListing {
    Legacy(Vec<LegacyDexFile>),
    Modern(Vec<ModernDexFile>),
}

/// Streams each input DEX into the sink, 4-aligning after every body and
/// verifying the planned file offsets as they come up.
fn write_dex_bodies<W, I>(
    inputs: &[DexInput],
    offsets: I,
    sink: &mut ChecksumSink<W>,
) -> Result<()>
where
    W: Write + Seek,
    I: Iterator<Item = u32>,
{
    for (input, planned_offset) in inputs.iter().zip(offsets) {
        if planned_offset != sink.bytes_written() {
            return Err(Error::LayoutMismatch {
                section: "dex body",
                written: sink.bytes_written(),
                planned: planned_offset,
            });
        }

        let mut file = File::open(&input.path).map_err(|source| Error::FileOpen {
            path: input.path.clone(),
            source,
        })?;
        let mut written = 0u32;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|source| Error::FileRead {
                path: input.path.clone(),
                source,
            })?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            written += n as u32;
        }

        let padded = align_up(written, 4);
        sink.write_padding(0, (padded - written) as usize)?;
    }
    Ok(())
}
