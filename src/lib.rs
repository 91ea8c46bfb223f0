//! oatx - A parser and builder for Android ART OAT containers.
//!
//! This library reads and writes the OAT container format used by the
//! Android Runtime across versions 045, 064, 079 and 088, optionally
//! wrapped in a minimal ELF shell. It covers the container layer only:
//! embedded DEX files are streamed through as opaque bytes apart from the
//! index tables needed to resolve class names.
//!
//! # Features
//!
//! - Version-aware parsing into a borrowed logical view
//! - Building an OAT from a list of DEX files, with byte-exact layout
//!   planning and a body checksum
//! - Type-lookup-table construction for modern (079/088) layouts
//! - A deterministic textual dump of any parse result
//!
//! # Example
//!
//! ```no_run
//! use oatx::{build, parse, DexInput, InstructionSet, OatVersion};
//!
//! fn main() -> oatx::Result<()> {
//!     let inputs = vec![DexInput {
//!         path: "classes.dex".into(),
//!         location: "base.apk".to_string(),
//!     }];
//!     build(
//!         "out.oat".as_ref(),
//!         &inputs,
//!         OatVersion::V079,
//!         InstructionSet::Arm,
//!         false,
//!         "",
//!     )?;
//!
//!     let bytes = std::fs::read("out.oat")?;
//!     let oat = parse(&bytes);
//!     println!("{:?}", oat.status());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dex;
pub mod elf;
pub mod error;
pub mod oat;
pub mod sink;
pub mod util;

pub use error::{Error, Result};
pub use oat::dump::{render, DumpOptions};
pub use oat::{
    build, parse, parse_dex_files_only, DexInput, InstructionSet, OatDexFile, OatVersion,
    ParsedOat, Status,
};
