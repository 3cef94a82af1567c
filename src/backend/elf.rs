//! Minimal ELF introspection for the /proc backend.
//!
//! Parses just enough of an on-disk ELF image to answer module questions:
//! bitness from the ident, the section table, and dynamic-symbol exports.
//! Deliberately not a loader; section addresses are rebased onto the mapped
//! module base for ET_DYN images.

use crate::core::types::{
    IfaceResult, InterfaceError, NativeModuleExport, NativeSection,
};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;

const ET_DYN: u16 = 3;
const SHT_DYNSYM: u32 = 11;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

/// Returns true when the ident bytes describe a 32-bit ELF image.
pub fn is_32_bit_ident(ident: &[u8]) -> IfaceResult<bool> {
    if ident.len() < 16 || ident[..4] != ELF_MAGIC {
        return Err(InterfaceError::Parse("Missing ELF magic".to_string()));
    }
    Ok(ident[EI_CLASS] == ELFCLASS32)
}

fn u16_at(data: &[u8], offset: usize) -> IfaceResult<u16> {
    data.get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or_else(|| InterfaceError::Parse(format!("Truncated ELF at offset {offset:#X}")))
}

fn u32_at(data: &[u8], offset: usize) -> IfaceResult<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| InterfaceError::Parse(format!("Truncated ELF at offset {offset:#X}")))
}

fn u64_at(data: &[u8], offset: usize) -> IfaceResult<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| InterfaceError::Parse(format!("Truncated ELF at offset {offset:#X}")))
}

fn cstr_at(data: &[u8], offset: usize) -> Option<&str> {
    let tail = data.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}

/// One section header in a width-independent form.
struct SectionHeader {
    name_offset: u32,
    kind: u32,
    flags: u64,
    address: u64,
    file_offset: u64,
    size: u64,
    link: u32,
    entry_size: u64,
}

struct ElfView<'a> {
    data: &'a [u8],
    is_64: bool,
    kind: u16,
    section_offset: u64,
    section_entry_size: u16,
    section_count: u16,
    string_section_index: u16,
}

impl<'a> ElfView<'a> {
    fn parse(data: &'a [u8]) -> IfaceResult<Self> {
        if data.len() < 16 || data[..4] != ELF_MAGIC {
            return Err(InterfaceError::Parse("Missing ELF magic".to_string()));
        }
        if data[EI_DATA] != ELFDATA2LSB {
            return Err(InterfaceError::Parse(
                "Only little-endian ELF images are supported".to_string(),
            ));
        }

        let is_64 = match data[EI_CLASS] {
            ELFCLASS64 => true,
            ELFCLASS32 => false,
            other => {
                return Err(InterfaceError::Parse(format!(
                    "Unknown ELF class {other}"
                )))
            }
        };

        let (section_offset, entry_size_off, count_off, strndx_off) = if is_64 {
            (u64_at(data, 0x28)?, 0x3A, 0x3C, 0x3E)
        } else {
            (u64::from(u32_at(data, 0x20)?), 0x2E, 0x30, 0x32)
        };

        Ok(ElfView {
            data,
            is_64,
            kind: u16_at(data, 0x10)?,
            section_offset,
            section_entry_size: u16_at(data, entry_size_off)?,
            section_count: u16_at(data, count_off)?,
            string_section_index: u16_at(data, strndx_off)?,
        })
    }

    fn section(&self, index: usize) -> IfaceResult<SectionHeader> {
        let base = self.section_offset as usize + index * usize::from(self.section_entry_size);
        let d = self.data;
        Ok(if self.is_64 {
            SectionHeader {
                name_offset: u32_at(d, base)?,
                kind: u32_at(d, base + 0x04)?,
                flags: u64_at(d, base + 0x08)?,
                address: u64_at(d, base + 0x10)?,
                file_offset: u64_at(d, base + 0x18)?,
                size: u64_at(d, base + 0x20)?,
                link: u32_at(d, base + 0x28)?,
                entry_size: u64_at(d, base + 0x38)?,
            }
        } else {
            SectionHeader {
                name_offset: u32_at(d, base)?,
                kind: u32_at(d, base + 0x04)?,
                flags: u64::from(u32_at(d, base + 0x08)?),
                address: u64::from(u32_at(d, base + 0x0C)?),
                file_offset: u64::from(u32_at(d, base + 0x10)?),
                size: u64::from(u32_at(d, base + 0x14)?),
                link: u32_at(d, base + 0x18)?,
                entry_size: u64::from(u32_at(d, base + 0x24)?),
            }
        })
    }

    /// Load bias applied to image-relative addresses: shared objects are
    /// mapped at an arbitrary base, executables carry absolute addresses.
    fn bias(&self, module_base: u64) -> u64 {
        if self.kind == ET_DYN {
            module_base
        } else {
            0
        }
    }
}

/// Collects the section table of an on-disk ELF image, rebased onto
/// `module_base`. Section flags land in `characteristics`.
pub fn parse_sections(
    data: &[u8],
    module_base: u64,
    out: &mut std::collections::BTreeMap<String, NativeSection>,
) -> IfaceResult<()> {
    let elf = ElfView::parse(data)?;
    let strings = elf.section(usize::from(elf.string_section_index))?;

    for i in 0..usize::from(elf.section_count) {
        let header = elf.section(i)?;
        let Some(name) = cstr_at(
            data,
            strings.file_offset as usize + header.name_offset as usize,
        ) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        out.insert(
            name.to_string(),
            NativeSection {
                address: elf.bias(module_base) + header.address,
                size: header.size,
                characteristics: header.flags as u32,
            },
        );
    }

    Ok(())
}

/// Collects the defined global/weak dynamic symbols of an on-disk ELF image
/// as module exports, rebased onto `module_base`.
pub fn parse_exports(
    data: &[u8],
    module_base: u64,
    out: &mut std::collections::BTreeMap<String, NativeModuleExport>,
) -> IfaceResult<()> {
    let elf = ElfView::parse(data)?;

    let mut dynsym = None;
    for i in 0..usize::from(elf.section_count) {
        let header = elf.section(i)?;
        if header.kind == SHT_DYNSYM {
            dynsym = Some(header);
            break;
        }
    }
    let Some(dynsym) = dynsym else {
        // Statically linked or stripped of dynamic symbols; nothing to export
        return Ok(());
    };

    let dynstr = elf.section(dynsym.link as usize)?;
    let entry_size = if dynsym.entry_size != 0 {
        dynsym.entry_size as usize
    } else if elf.is_64 {
        24
    } else {
        16
    };
    let count = (dynsym.size as usize) / entry_size;

    for i in 0..count {
        let base = dynsym.file_offset as usize + i * entry_size;

        let (name_offset, info, section_index, value) = if elf.is_64 {
            (
                u32_at(data, base)?,
                *data
                    .get(base + 4)
                    .ok_or_else(|| InterfaceError::Parse("Truncated symbol".to_string()))?,
                u16_at(data, base + 6)?,
                u64_at(data, base + 8)?,
            )
        } else {
            (
                u32_at(data, base)?,
                *data
                    .get(base + 12)
                    .ok_or_else(|| InterfaceError::Parse("Truncated symbol".to_string()))?,
                u16_at(data, base + 14)?,
                u64::from(u32_at(data, base + 4)?),
            )
        };

        // Only defined symbols with global (1) or weak (2) binding
        if section_index == 0 || !matches!(info >> 4, 1 | 2) {
            continue;
        }

        let Some(name) = cstr_at(data, dynstr.file_offset as usize + name_offset as usize) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        out.insert(
            name.to_string(),
            NativeModuleExport {
                name: name.to_string(),
                address: elf.bias(module_base) + value,
                ordinal: i as u32,
                forwarder: None,
            },
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(data: &mut [u8], offset: usize, value: u64) {
        data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds a 64-bit ET_DYN image with a .dynsym holding one exported
    /// function, one local symbol and one undefined symbol.
    fn synthetic_elf() -> Vec<u8> {
        let mut data = vec![0u8; 0x800];

        data[..4].copy_from_slice(&ELF_MAGIC);
        data[EI_CLASS] = ELFCLASS64;
        data[EI_DATA] = ELFDATA2LSB;
        put_u16(&mut data, 0x10, ET_DYN);
        put_u64(&mut data, 0x28, 0x100); // section header offset
        put_u16(&mut data, 0x3A, 64); // section entry size
        put_u16(&mut data, 0x3C, 4); // section count
        put_u16(&mut data, 0x3E, 3); // string section index

        // Section 0: null. Section 1: .dynsym
        let sh = |i: usize| 0x100 + i * 64;
        put_u32(&mut data, sh(1), 1); // name offset in shstrtab
        put_u32(&mut data, sh(1) + 0x04, SHT_DYNSYM);
        put_u64(&mut data, sh(1) + 0x18, 0x300); // file offset
        put_u64(&mut data, sh(1) + 0x20, 3 * 24); // size
        put_u32(&mut data, sh(1) + 0x28, 2); // link -> .dynstr
        put_u64(&mut data, sh(1) + 0x38, 24); // entry size

        // Section 2: .dynstr
        put_u32(&mut data, sh(2), 9);
        put_u32(&mut data, sh(2) + 0x04, 3); // SHT_STRTAB
        put_u64(&mut data, sh(2) + 0x18, 0x400);
        put_u64(&mut data, sh(2) + 0x20, 0x40);

        // Section 3: .shstrtab
        put_u32(&mut data, sh(3), 17);
        put_u32(&mut data, sh(3) + 0x04, 3);
        put_u64(&mut data, sh(3) + 0x18, 0x500);
        put_u64(&mut data, sh(3) + 0x20, 0x40);

        // .dynstr: "\0my_export\0local_helper\0"
        data[0x400] = 0;
        data[0x401..0x401 + 9].copy_from_slice(b"my_export");
        data[0x40B..0x40B + 12].copy_from_slice(b"local_helper");

        // .shstrtab: "\0.dynsym\0.dynstr\0.shstrtab\0"
        data[0x500] = 0;
        data[0x501..0x501 + 7].copy_from_slice(b".dynsym");
        data[0x509..0x509 + 7].copy_from_slice(b".dynstr");
        data[0x511..0x511 + 9].copy_from_slice(b".shstrtab");

        // Symbols at 0x300: [0] null, [1] global defined, [2] local defined
        let sym = |i: usize| 0x300 + i * 24;
        put_u32(&mut data, sym(1), 1); // name "my_export"
        data[sym(1) + 4] = 0x12; // GLOBAL | FUNC
        put_u16(&mut data, sym(1) + 6, 1); // defined in section 1
        put_u64(&mut data, sym(1) + 8, 0x1234); // value

        put_u32(&mut data, sym(2), 11); // name "local_helper"
        data[sym(2) + 4] = 0x02; // LOCAL | FUNC
        put_u16(&mut data, sym(2) + 6, 1);
        put_u64(&mut data, sym(2) + 8, 0x2000);

        data
    }

    #[test]
    fn ident_bitness() {
        let data = synthetic_elf();
        assert!(!is_32_bit_ident(&data[..16]).unwrap());

        let mut ident = data[..16].to_vec();
        ident[EI_CLASS] = ELFCLASS32;
        assert!(is_32_bit_ident(&ident).unwrap());

        assert!(is_32_bit_ident(&[0u8; 16]).is_err());
    }

    #[test]
    fn exports_contain_only_defined_globals() {
        let data = synthetic_elf();
        let mut exports = BTreeMap::new();
        parse_exports(&data, 0x7f00_0000_0000, &mut exports).unwrap();

        assert_eq!(exports.len(), 1);
        let export = &exports["my_export"];
        assert_eq!(export.address, 0x7f00_0000_0000 + 0x1234);
        assert!(!export.is_forwarder());
    }

    #[test]
    fn sections_are_named_and_rebased() {
        let data = synthetic_elf();
        let mut sections = BTreeMap::new();
        parse_sections(&data, 0x1000_0000, &mut sections).unwrap();

        assert!(sections.contains_key(".dynsym"));
        assert!(sections.contains_key(".dynstr"));
        assert!(sections.contains_key(".shstrtab"));
    }

    #[test]
    fn rejects_non_elf() {
        let mut sections = BTreeMap::new();
        assert!(parse_sections(&[0u8; 64], 0, &mut sections).is_err());
    }
}
