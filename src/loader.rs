//! Guest image loaders
//!
//! Raw RAM images, ELF32 executables, the device tree blob, and the MTD
//! (initrd/flash) image. Load failures are host-fatal: they abort startup
//! and never surface inside the CPU.

use crate::memory::Bus;
use elf::abi::SHT_PROGBITS;
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::ElfBytes;
use log::info;
use thiserror::Error;

/// Usable size of the DTB window (0x1020..=0x1fff).
const DTB_WINDOW_SIZE: usize = 0xfe0;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("image of {size} bytes does not fit ({limit} bytes available)")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid ELF image: {0}")]
    Elf(#[from] elf::ParseError),
    #[error("64-bit ELF images are not supported")]
    Not32Bit,
    #[error("ELF has no section headers")]
    NoSections,
    #[error("ELF section data out of range")]
    SectionOutOfRange,
}

/// Load a raw image at the base of RAM.
pub fn load_raw(bus: &mut Bus, data: &[u8]) -> Result<(), LoadError> {
    if data.len() > bus.ram_size() {
        return Err(LoadError::TooLarge {
            size: data.len(),
            limit: bus.ram_size(),
        });
    }
    bus.copy_to_ram(0, data);
    info!("loaded raw image: {} bytes", data.len());
    Ok(())
}

/// Load an ELF32 image: every PROGBITS section is copied to its physical
/// address masked to the RAM window.
pub fn load_elf(bus: &mut Bus, data: &[u8]) -> Result<(), LoadError> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(data)?;
    if file.ehdr.class != Class::ELF32 {
        return Err(LoadError::Not32Bit);
    }

    let sections = file.section_headers().ok_or(LoadError::NoSections)?;
    for shdr in sections.iter() {
        if shdr.sh_type != SHT_PROGBITS || shdr.sh_size == 0 || shdr.sh_addr == 0 {
            continue;
        }
        let offset = shdr.sh_offset as usize;
        let size = shdr.sh_size as usize;
        let source = data
            .get(offset..offset + size)
            .ok_or(LoadError::SectionOutOfRange)?;
        let dest = (shdr.sh_addr as u32 & 0x7fff_ffff) as usize;
        if !bus.copy_to_ram(dest, source) {
            return Err(LoadError::TooLarge {
                size: dest + size,
                limit: bus.ram_size(),
            });
        }
        info!(
            "loaded ELF section: {} bytes at {:08x}",
            size,
            crate::memory::DRAM_BASE + dest as u32
        );
    }
    Ok(())
}

/// Install the device tree blob in its read-only window.
pub fn load_dtb(bus: &mut Bus, data: &[u8]) -> Result<(), LoadError> {
    if data.len() > DTB_WINDOW_SIZE {
        return Err(LoadError::TooLarge {
            size: data.len(),
            limit: DTB_WINDOW_SIZE,
        });
    }
    bus.set_dtb(data.to_vec());
    info!("loaded DTB: {} bytes", data.len());
    Ok(())
}

/// Install the MTD (initrd/flash) image in its window.
pub fn load_mtd(bus: &mut Bus, data: &[u8]) -> Result<(), LoadError> {
    bus.set_mtd(data.to_vec());
    info!("loaded MTD image: {} bytes", data.len());
    Ok(())
}
