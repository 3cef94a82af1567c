//! Manual PE introspection over a foreign address space.
//!
//! Walks DOS header -> NT headers -> section table -> export directory using
//! only a caller-supplied read primitive, so the same code serves the live
//! Windows backend and synthetic images in tests. Only the pieces module
//! introspection needs are parsed; this is not a PE loader.

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::core::types::{
    IfaceResult, InterfaceError, NativeModuleEntry, NativeModuleExport, NativeSection,
};

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // MZ
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
pub const OPTIONAL_MAGIC_PE32: u16 = 0x10B;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20B;

/// Data directory slot offsets from the start of the optional header.
const DATA_DIRECTORY_OFFSET_PE32: usize = 96;
const DATA_DIRECTORY_OFFSET_PE32_PLUS: usize = 112;

/// Sanity cap on `e_lfanew`, matching what the loader itself tolerates.
const MAX_LFANEW: u32 = 0x1000_0000;

/// Read primitive over the target address space. Returns the number of bytes
/// actually transferred.
pub trait RemoteRead {
    fn read(&mut self, address: u64, buffer: &mut [u8]) -> IfaceResult<usize>;
}

impl<F: FnMut(u64, &mut [u8]) -> IfaceResult<usize>> RemoteRead for F {
    fn read(&mut self, address: u64, buffer: &mut [u8]) -> IfaceResult<usize> {
        self(address, buffer)
    }
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ImageDosHeader {
    e_magic: u16,
    e_cblp: u16,
    e_cp: u16,
    e_crlc: u16,
    e_cparhdr: u16,
    e_minalloc: u16,
    e_maxalloc: u16,
    e_ss: u16,
    e_sp: u16,
    e_csum: u16,
    e_ip: u16,
    e_cs: u16,
    e_lfarlc: u16,
    e_ovno: u16,
    e_res: [u16; 4],
    e_oemid: u16,
    e_oeminfo: u16,
    e_res2: [u16; 10],
    e_lfanew: u32,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ImageFileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ImageSectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ImageExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

fn read_exact(read: &mut impl RemoteRead, address: u64, buffer: &mut [u8]) -> IfaceResult<()> {
    let transferred = read.read(address, buffer)?;
    if transferred < buffer.len() {
        return Err(InterfaceError::Parse(format!(
            "Short read at {address:#X}: wanted {} bytes, got {transferred}",
            buffer.len()
        )));
    }
    Ok(())
}

fn read_struct<T: FromBytes + KnownLayout + Immutable>(
    read: &mut impl RemoteRead,
    address: u64,
) -> IfaceResult<T> {
    let mut buffer = vec![0u8; std::mem::size_of::<T>()];
    read_exact(read, address, &mut buffer)?;
    T::read_from_bytes(&buffer)
        .map_err(|_| InterfaceError::Parse(format!("Truncated structure at {address:#X}")))
}

fn u32_at(buffer: &[u8], offset: usize) -> Option<u32> {
    let bytes = buffer.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn u16_at(buffer: &[u8], offset: usize) -> Option<u16> {
    let bytes = buffer.get(offset..offset + 2)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

fn cstr_at(buffer: &[u8], offset: usize) -> Option<&str> {
    let tail = buffer.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}

/// Parses the NT headers, section table and export directory of a mapped
/// module out of the target's memory and fills `module.sections` and
/// `module.exports`. Forwarded exports are recorded with their raw
/// `"Module.Export"` string; resolution happens later via
/// [`crate::core::types::NativeModulesInfo::resolve_forwarders`] once all
/// modules of the bitness are collected.
pub fn parse_module(read: &mut impl RemoteRead, module: &mut NativeModuleEntry) -> IfaceResult<()> {
    let base = module.address;

    let dos: ImageDosHeader = read_struct(read, base)?;
    if dos.e_magic != IMAGE_DOS_SIGNATURE {
        return Err(InterfaceError::Parse(format!(
            "Missing MZ signature in module {} at {base:#X}",
            module.name
        )));
    }
    if dos.e_lfanew == 0 || dos.e_lfanew > MAX_LFANEW {
        return Err(InterfaceError::Parse(format!(
            "Implausible e_lfanew {:#X} in module {}",
            dos.e_lfanew, module.name
        )));
    }

    let nt_address = base + u64::from(dos.e_lfanew);
    let mut signature = [0u8; 4];
    read_exact(read, nt_address, &mut signature)?;
    if u32::from_le_bytes(signature) != IMAGE_NT_SIGNATURE {
        return Err(InterfaceError::Parse(format!(
            "Missing PE signature in module {}",
            module.name
        )));
    }

    let file_header: ImageFileHeader = read_struct(read, nt_address + 4)?;

    let optional_address = nt_address + 4 + std::mem::size_of::<ImageFileHeader>() as u64;
    let optional_size = usize::from(file_header.size_of_optional_header);
    if optional_size < DATA_DIRECTORY_OFFSET_PE32 {
        return Err(InterfaceError::Parse(format!(
            "Optional header too small ({optional_size} bytes) in module {}",
            module.name
        )));
    }

    let mut optional = vec![0u8; optional_size];
    read_exact(read, optional_address, &mut optional)?;

    let magic = u16_at(&optional, 0).unwrap_or(0);
    let directory_offset = match magic {
        OPTIONAL_MAGIC_PE32 => DATA_DIRECTORY_OFFSET_PE32,
        OPTIONAL_MAGIC_PE32_PLUS => DATA_DIRECTORY_OFFSET_PE32_PLUS,
        other => {
            return Err(InterfaceError::Parse(format!(
                "Unknown optional header magic {other:#X} in module {}",
                module.name
            )))
        }
    };

    parse_sections(read, module, optional_address + optional_size as u64, &file_header)?;

    // Export data directory is slot 0
    let export_va = u32_at(&optional, directory_offset).unwrap_or(0);
    let export_size = u32_at(&optional, directory_offset + 4).unwrap_or(0);
    if export_size != 0 {
        parse_exports(read, module, export_va, export_size)?;
    }

    Ok(())
}

fn parse_sections(
    read: &mut impl RemoteRead,
    module: &mut NativeModuleEntry,
    table_address: u64,
    file_header: &ImageFileHeader,
) -> IfaceResult<()> {
    let entry_size = std::mem::size_of::<ImageSectionHeader>() as u64;

    for i in 0..u64::from(file_header.number_of_sections) {
        let header: ImageSectionHeader =
            match read_struct(read, table_address + i * entry_size) {
                Ok(header) => header,
                Err(err) => {
                    tracing::debug!(module = module.name, %err, "Skipping unreadable section header");
                    continue;
                }
            };

        let name_end = header.name.iter().position(|&b| b == 0).unwrap_or(8);
        let Ok(name) = std::str::from_utf8(&header.name[..name_end]) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        module.sections.insert(
            name.to_string(),
            NativeSection {
                address: module.address + u64::from(header.virtual_address),
                size: u64::from(header.virtual_size),
                characteristics: header.characteristics,
            },
        );
    }

    Ok(())
}

fn parse_exports(
    read: &mut impl RemoteRead,
    module: &mut NativeModuleEntry,
    directory_va: u32,
    directory_size: u32,
) -> IfaceResult<()> {
    // The whole export directory block is pulled in one read; every name,
    // ordinal and forwarder string lives inside it.
    let mut block = vec![0u8; directory_size as usize];
    read_exact(read, module.address + u64::from(directory_va), &mut block)?;

    let directory = ImageExportDirectory::read_from_bytes(
        block
            .get(..std::mem::size_of::<ImageExportDirectory>())
            .ok_or_else(|| {
                InterfaceError::Parse(format!(
                    "Export directory of {} smaller than its own header",
                    module.name
                ))
            })?,
    )
    .map_err(|_| InterfaceError::Parse("Malformed export directory".to_string()))?;

    // Offsets of the three parallel tables inside the block
    let rel = |va: u32| -> usize { va.wrapping_sub(directory_va) as usize };
    let names_offset = rel(directory.address_of_names);
    let ordinals_offset = rel(directory.address_of_name_ordinals);
    let functions_offset = rel(directory.address_of_functions);

    for i in 0..directory.number_of_names as usize {
        let Some(name_rva) = u32_at(&block, names_offset + i * 4) else {
            break;
        };
        let Some(name) = cstr_at(&block, rel(name_rva)) else {
            continue;
        };
        let Some(ordinal) = u16_at(&block, ordinals_offset + i * 2) else {
            break;
        };
        let Some(function_rva) = u32_at(&block, functions_offset + usize::from(ordinal) * 4)
        else {
            continue;
        };

        let in_directory =
            function_rva >= directory_va && function_rva < directory_va + directory_size;
        let forwarder = in_directory
            .then(|| cstr_at(&block, rel(function_rva)).map(str::to_string))
            .flatten();

        module.exports.insert(
            name.to_string(),
            NativeModuleExport {
                name: name.to_string(),
                address: module.address + u64::from(function_rva),
                ordinal: u32::from(ordinal) + directory.base,
                forwarder,
            },
        );
    }

    Ok(())
}
