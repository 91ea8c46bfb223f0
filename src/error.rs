//! Error types for OAT parsing and building.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for OAT codec operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== OAT Format Errors ====================
    #[error("bad oat magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unknown oat version: {0:#010x}")]
    UnknownVersion(u32),

    #[error("truncated input: need {needed} bytes at offset {offset:#x}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("class info of unsupported type {kind} at offset {offset:#x}")]
    UnsupportedClassType { kind: u16, offset: usize },

    // ==================== DEX Errors ====================
    #[error("dex file too small: {size} bytes")]
    DexTooSmall { size: u64 },

    #[error("dex index {index} out of range for {table} (size {size})")]
    DexIndex {
        table: &'static str,
        index: u32,
        size: u32,
    },

    // ==================== Build Errors ====================
    #[error("cannot build oat version '{0}'")]
    BuildUnsupportedVersion(String),

    #[error("unknown instruction set '{0}'")]
    UnknownInstructionSet(String),

    #[error("layout mismatch while writing {section}: at {written:#x}, planned {planned:#x}")]
    LayoutMismatch {
        section: &'static str,
        written: u32,
        planned: u32,
    },
}

/// A specialized Result type for OAT codec operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a truncation error for a read of `needed` bytes at `offset`
    /// into a buffer of `available` bytes.
    #[inline]
    pub fn truncated(offset: usize, needed: usize, available: usize) -> Self {
        Error::Truncated {
            offset,
            needed,
            available,
        }
    }

    /// Creates an out-of-range DEX index error.
    #[inline]
    pub fn dex_index(table: &'static str, index: u32, size: u32) -> Self {
        Error::DexIndex { table, index, size }
    }
}
