//! OAT container model and codecs.
//!
//! The container layout differs across the supported OAT versions in two
//! families: the *legacy* layout (045, 064) stores per-class info offsets
//! inline in the DEX file listing, while the *modern* layout (079, 088)
//! moves them behind a `classes_offset` indirection and adds a type-lookup
//! hash table per DEX. Version dispatch happens once, at the parse or build
//! entry point; everything below it works on one family only.

use std::path::PathBuf;

pub mod build;
pub mod classes;
pub mod dump;
pub mod header;
pub mod kv;
pub mod listing;
pub mod lookup;
pub mod parse;

pub use build::build;
pub use parse::{parse, parse_dex_files_only, ParsedOat};

/// First word of an OAT file: `"oat\n"`.
pub const OAT_MAGIC: u32 = 0x0a74_616f;

/// Offset of the OAT body inside an ELF-wrapped file. The `.rodata` section
/// holding the OAT data starts one page in for every ART version seen in the
/// wild.
pub const ELF_OAT_OFFSET: usize = 0x1000;

// =============================================================================
// Versions
// =============================================================================

/// A supported OAT format version.
///
/// The discriminant is the on-disk version word: the three-digit decimal
/// version string plus a trailing NUL, read as a little-endian word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OatVersion {
    /// Android 5.0
    V045 = 0x0035_3430,
    /// Android 6.0
    V064 = 0x0034_3630,
    /// Android 7.0
    V079 = 0x0039_3730,
    /// Android 7.1
    V088 = 0x0038_3830,
}

/// The two layout families the versions fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Versions 045 and 064: class-info offsets live in the DEX listing.
    Legacy,
    /// Versions 079 and 088: class tables and lookup tables are referenced
    /// from the listing by offset.
    Modern,
}

impl OatVersion {
    /// Maps an on-disk version word to a known version.
    pub fn from_word(word: u32) -> Option<Self> {
        match word {
            w if w == OatVersion::V045 as u32 => Some(OatVersion::V045),
            w if w == OatVersion::V064 as u32 => Some(OatVersion::V064),
            w if w == OatVersion::V079 as u32 => Some(OatVersion::V079),
            w if w == OatVersion::V088 as u32 => Some(OatVersion::V088),
            _ => None,
        }
    }

    /// Maps a version string as passed on the command line ("045", ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "045" => Some(OatVersion::V045),
            "064" => Some(OatVersion::V064),
            "079" => Some(OatVersion::V079),
            "088" => Some(OatVersion::V088),
            _ => None,
        }
    }

    /// The on-disk version word.
    #[inline]
    pub fn word(self) -> u32 {
        self as u32
    }

    /// Which layout family this version belongs to.
    pub fn layout(self) -> Layout {
        match self {
            OatVersion::V045 | OatVersion::V064 => Layout::Legacy,
            OatVersion::V079 | OatVersion::V088 => Layout::Modern,
        }
    }
}

// =============================================================================
// Instruction Sets
// =============================================================================

/// Target instruction set recorded in the OAT header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InstructionSet {
    /// No architecture
    None = 0,
    /// 32-bit ARM
    Arm = 1,
    /// 64-bit ARM
    Arm64 = 2,
    /// ARM Thumb-2
    Thumb2 = 3,
    /// 32-bit x86
    X86 = 4,
    /// 64-bit x86
    X86_64 = 5,
    /// 32-bit MIPS
    Mips = 6,
    /// 64-bit MIPS
    Mips64 = 7,
}

const ARCH_NAMES: [(InstructionSet, &str); 8] = [
    (InstructionSet::None, "NONE"),
    (InstructionSet::Arm, "arm"),
    (InstructionSet::Arm64, "arm64"),
    (InstructionSet::Thumb2, "thumb2"),
    (InstructionSet::X86, "x86"),
    (InstructionSet::X86_64, "x86_64"),
    (InstructionSet::Mips, "mips"),
    (InstructionSet::Mips64, "mips64"),
];

impl InstructionSet {
    /// Maps a header word to an instruction set.
    pub fn from_word(word: u32) -> Option<Self> {
        ARCH_NAMES.iter().map(|(isa, _)| *isa).find(|isa| *isa as u32 == word)
    }

    /// Maps an architecture name as passed on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        ARCH_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(isa, _)| *isa)
    }

    /// The architecture name for display.
    pub fn name(self) -> &'static str {
        ARCH_NAMES[self as u32 as usize].1
    }
}

/// Renders a raw header ISA word for display, tolerating unknown values.
pub fn isa_name(word: u32) -> &'static str {
    InstructionSet::from_word(word).map_or("<UNKNOWN>", InstructionSet::name)
}

// =============================================================================
// Status & Inputs
// =============================================================================

/// Terminal outcome of a parse or build operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Parse completed and produced a full logical view.
    ParseSuccess,
    /// The version word matched no known version.
    ParseUnknownVersion,
    /// The magic word did not read `"oat\n"`.
    ParseBadMagic,
    /// Any other parse failure.
    ParseFailure,
    /// Build completed and the file is fully written.
    BuildSuccess,
    /// Build requested for a version this codec cannot write.
    BuildUnsupportedVersion,
    /// An I/O failure aborted the build.
    BuildIoError,
}

impl Status {
    /// Collapses a build outcome into its terminal status.
    pub fn for_build_result(result: &crate::error::Result<()>) -> Status {
        match result {
            Ok(()) => Status::BuildSuccess,
            Err(crate::error::Error::BuildUnsupportedVersion(_)) => {
                Status::BuildUnsupportedVersion
            }
            Err(_) => Status::BuildIoError,
        }
    }
}

/// One DEX file to be embedded when building an OAT.
#[derive(Debug, Clone)]
pub struct DexInput {
    /// Location on disk.
    pub path: PathBuf,
    /// Location string stored in the OAT file.
    pub location: String,
}

/// Summary of one DEX file found inside a parsed OAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatDexFile {
    /// Location string stored in the listing.
    pub location: String,
    /// Offset of the DEX body from the start of the OAT data.
    pub file_offset: u32,
    /// Size of the DEX body per its own header.
    pub file_size: u32,
}
