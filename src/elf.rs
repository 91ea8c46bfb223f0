//! Minimal ELF shell for wrapped OAT output.
//!
//! ART ships OAT data inside an ELF file whose `.rodata` section starts one
//! page in. This writer produces just enough of that shape for tools that
//! expect the wrapper: a 32-bit little-endian ELF header, one loadable
//! program header, and section headers for `.rodata` (the OAT data), `.bss`
//! and `.shstrtab`, all packed into the first 4096 bytes. The OAT data
//! itself is written by the caller at page offset 0x1000.

use std::io::{Seek, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;
use crate::oat::InstructionSet;
use crate::sink::Sink;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;

const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;
const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_NOBITS: u32 = 8;
const SHF_WRITE: u32 = 1;
const SHF_ALLOC: u32 = 2;

const EM_386: u16 = 3;
const EM_MIPS: u16 = 8;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// `\0.rodata\0.bss\0.shstrtab\0`
const SHSTRTAB: &[u8] = b"\0.rodata\0.bss\0.shstrtab\0";
const NAME_RODATA: u32 = 1;
const NAME_BSS: u32 = 9;
const NAME_SHSTRTAB: u32 = 14;

/// The assembled ELF prologue for one OAT file.
pub struct ElfShell {
    machine: u16,
    oat_size: u32,
    bss_size: u32,
}

impl ElfShell {
    /// Lays out the shell for an OAT of `oat_size` bytes and a `.bss` of
    /// `bss_size` bytes on the given instruction set.
    pub fn build(isa: InstructionSet, oat_size: u32, bss_size: u32) -> Self {
        let machine = match isa {
            InstructionSet::None => 0,
            InstructionSet::Arm | InstructionSet::Thumb2 => EM_ARM,
            InstructionSet::Arm64 => EM_AARCH64,
            InstructionSet::X86 => EM_386,
            InstructionSet::X86_64 => EM_X86_64,
            InstructionSet::Mips | InstructionSet::Mips64 => EM_MIPS,
        };
        Self {
            machine,
            oat_size,
            bss_size,
        }
    }

    /// Writes the prologue at the current position (the very start of the
    /// file). Everything fits well inside the page reserved for it.
    pub fn write<W: Write + Seek>(&self, sink: &mut Sink<W>) -> Result<()> {
        let phoff = EHDR_SIZE as u32;
        let strtab_off = phoff + PHDR_SIZE as u32;
        let shoff = strtab_off + SHSTRTAB.len() as u32;
        debug_assert!(shoff % 4 == 0);
        debug_assert!((shoff as usize + 4 * SHDR_SIZE) <= crate::oat::ELF_OAT_OFFSET);

        let rodata_addr = crate::oat::ELF_OAT_OFFSET as u32;
        let file_size = rodata_addr + self.oat_size;

        // ---- ELF header
        let mut ehdr = [0u8; EHDR_SIZE];
        ehdr[..4].copy_from_slice(b"\x7fELF");
        ehdr[4] = 1; // ELFCLASS32
        ehdr[5] = 1; // little-endian
        ehdr[6] = 1; // EV_CURRENT
        LittleEndian::write_u16(&mut ehdr[16..], ET_DYN);
        LittleEndian::write_u16(&mut ehdr[18..], self.machine);
        LittleEndian::write_u32(&mut ehdr[20..], 1); // e_version
        LittleEndian::write_u32(&mut ehdr[28..], phoff); // e_phoff
        LittleEndian::write_u32(&mut ehdr[32..], shoff); // e_shoff
        LittleEndian::write_u16(&mut ehdr[40..], EHDR_SIZE as u16);
        LittleEndian::write_u16(&mut ehdr[42..], PHDR_SIZE as u16);
        LittleEndian::write_u16(&mut ehdr[44..], 1); // e_phnum
        LittleEndian::write_u16(&mut ehdr[46..], SHDR_SIZE as u16);
        LittleEndian::write_u16(&mut ehdr[48..], 4); // e_shnum
        LittleEndian::write_u16(&mut ehdr[50..], 3); // e_shstrndx
        sink.write_all(&ehdr)?;

        // ---- one PT_LOAD covering the shell and the OAT data
        let mut phdr = [0u8; PHDR_SIZE];
        LittleEndian::write_u32(&mut phdr[0..], PT_LOAD);
        // p_offset and p_vaddr stay 0
        LittleEndian::write_u32(&mut phdr[16..], file_size); // p_filesz
        LittleEndian::write_u32(&mut phdr[20..], file_size + self.bss_size); // p_memsz
        LittleEndian::write_u32(&mut phdr[24..], 4); // PF_R
        LittleEndian::write_u32(&mut phdr[28..], rodata_addr); // p_align
        sink.write_all(&phdr)?;

        sink.write_all(SHSTRTAB)?;

        // ---- section headers: NULL, .rodata, .bss, .shstrtab
        sink.write_all(&[0u8; SHDR_SIZE])?;
        self.write_shdr(
            sink,
            NAME_RODATA,
            SHT_PROGBITS,
            SHF_ALLOC,
            rodata_addr,
            rodata_addr,
            self.oat_size,
            rodata_addr,
        )?;
        self.write_shdr(
            sink,
            NAME_BSS,
            SHT_NOBITS,
            SHF_ALLOC | SHF_WRITE,
            file_size,
            file_size,
            self.bss_size,
            rodata_addr,
        )?;
        self.write_shdr(
            sink,
            NAME_SHSTRTAB,
            SHT_STRTAB,
            0,
            0,
            strtab_off,
            SHSTRTAB.len() as u32,
            1,
        )?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_shdr<W: Write + Seek>(
        &self,
        sink: &mut Sink<W>,
        name: u32,
        shtype: u32,
        flags: u32,
        addr: u32,
        offset: u32,
        size: u32,
        addralign: u32,
    ) -> Result<()> {
        let mut shdr = [0u8; SHDR_SIZE];
        LittleEndian::write_u32(&mut shdr[0..], name);
        LittleEndian::write_u32(&mut shdr[4..], shtype);
        LittleEndian::write_u32(&mut shdr[8..], flags);
        LittleEndian::write_u32(&mut shdr[12..], addr);
        LittleEndian::write_u32(&mut shdr[16..], offset);
        LittleEndian::write_u32(&mut shdr[20..], size);
        // sh_link, sh_info stay 0
        LittleEndian::write_u32(&mut shdr[32..], addralign);
        // sh_entsize stays 0
        sink.write_all(&shdr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn render(isa: InstructionSet, oat_size: u32, bss_size: u32) -> Vec<u8> {
        let mut sink = Sink::new(Cursor::new(Vec::new()));
        ElfShell::build(isa, oat_size, bss_size)
            .write(&mut sink)
            .unwrap();
        sink.into_inner().unwrap().into_inner()
    }

    #[test]
    fn shell_fits_the_reserved_page() {
        let bytes = render(InstructionSet::Arm, 0x3000, 0x100);
        assert!(bytes.len() <= crate::oat::ELF_OAT_OFFSET);
        assert_eq!(&bytes[..4], b"\x7fELF");
        assert_eq!(bytes[4], 1); // 32-bit
        assert_eq!(bytes[5], 1); // little-endian
    }

    #[test]
    fn machine_follows_isa() {
        assert_eq!(LittleEndian::read_u16(&render(InstructionSet::Arm, 0, 0)[18..]), EM_ARM);
        assert_eq!(
            LittleEndian::read_u16(&render(InstructionSet::Thumb2, 0, 0)[18..]),
            EM_ARM
        );
        assert_eq!(
            LittleEndian::read_u16(&render(InstructionSet::Arm64, 0, 0)[18..]),
            EM_AARCH64
        );
        assert_eq!(
            LittleEndian::read_u16(&render(InstructionSet::X86_64, 0, 0)[18..]),
            EM_X86_64
        );
    }

    #[test]
    fn rodata_section_describes_the_oat() {
        let oat_size = 0x2000;
        let bytes = render(InstructionSet::X86, oat_size, 64);
        let shoff = LittleEndian::read_u32(&bytes[32..]) as usize;

        // section 1 is .rodata
        let rodata = &bytes[shoff + SHDR_SIZE..shoff + 2 * SHDR_SIZE];
        assert_eq!(LittleEndian::read_u32(&rodata[4..]), SHT_PROGBITS);
        assert_eq!(LittleEndian::read_u32(&rodata[12..]), 0x1000); // addr
        assert_eq!(LittleEndian::read_u32(&rodata[16..]), 0x1000); // offset
        assert_eq!(LittleEndian::read_u32(&rodata[20..]), oat_size);

        // section 2 is .bss right behind it
        let bss = &bytes[shoff + 2 * SHDR_SIZE..shoff + 3 * SHDR_SIZE];
        assert_eq!(LittleEndian::read_u32(&bss[4..]), SHT_NOBITS);
        assert_eq!(LittleEndian::read_u32(&bss[12..]), 0x1000 + oat_size);
        assert_eq!(LittleEndian::read_u32(&bss[20..]), 64);
    }
}
