//! Native Windows backend: NT system calls, PEB loader-list walks and remote
//! PE parsing.
//!
//! Handles returned by [`open_process`](crate::iface::ProcessInterface::open_process)
//! carry the raw `HANDLE` value. Module enumeration walks
//! `InMemoryOrderModuleList`; a WOW64 target contributes both its 32-bit and
//! its native 64-bit loader view.

mod nt;

use std::collections::HashSet;
use std::mem;

use tracing::{debug, warn};
use winapi::um::winnt::HANDLE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::backend::pe;
use crate::core::types::{
    apply_pid_filter, IfaceResult, InterfaceError, MemoryRegion, NativeModuleEntry,
    NativeModulesInfo, NativeProcessEntry, NativeProcessMap,
};
use crate::iface::{NativeHandle, ProcessInterface};

use nt::{
    LdrEntryView32, LdrEntryView64, ListEntry32, ListEntry64, SystemProcessEntry,
    LDR32_IN_MEMORY_ORDER_LIST, LDR64_IN_MEMORY_ORDER_LIST, MEM_COMMIT, PEB32_IMAGE_BASE,
    PEB32_LDR, PEB64_IMAGE_BASE, PEB64_LDR, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_ACCESS,
};

/// Upper bound on loader-list nodes, guards against a corrupted or actively
/// mutated list cycling forever.
const MAX_LDR_ENTRIES: usize = 4096;

/// The in-process backend for Windows hosts.
#[derive(Debug, Default)]
pub struct NativeCoreInterface;

fn raw_handle(handle: NativeHandle) -> IfaceResult<HANDLE> {
    if handle.is_null() {
        return Err(InterfaceError::InvalidHandle("null handle".into()));
    }
    Ok(handle.0 as HANDLE)
}

fn read_exact(handle: HANDLE, address: u64, buffer: &mut [u8]) -> IfaceResult<()> {
    let transferred = nt::read_virtual_memory(handle, address, buffer)?;
    if transferred != buffer.len() {
        return Err(InterfaceError::Parse(format!(
            "short read at {address:#X}: {transferred} of {} bytes",
            buffer.len()
        )));
    }
    Ok(())
}

fn read_struct<T: FromBytes + KnownLayout + Immutable>(
    handle: HANDLE,
    address: u64,
) -> IfaceResult<T> {
    let mut raw = vec![0u8; mem::size_of::<T>()];
    read_exact(handle, address, &mut raw)?;
    T::read_from_bytes(&raw)
        .map_err(|_| InterfaceError::Parse(format!("misaligned structure at {address:#X}")))
}

fn read_u64(handle: HANDLE, address: u64) -> IfaceResult<u64> {
    let mut raw = [0u8; 8];
    read_exact(handle, address, &mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

fn read_u32(handle: HANDLE, address: u64) -> IfaceResult<u32> {
    let mut raw = [0u8; 4];
    read_exact(handle, address, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

/// Reads a remote UTF-16 string of `length` bytes.
fn read_wide_string(handle: HANDLE, address: u64, length: u16) -> IfaceResult<String> {
    let mut raw = vec![0u8; length as usize];
    read_exact(handle, address, &mut raw)?;
    let wide: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&wide))
}

/// Decodes an in-snapshot `UNICODE_STRING`. The buffer pointer refers into
/// the snapshot we hold in `raw`, so bounds-check against it instead of
/// dereferencing blindly.
fn snapshot_image_name(raw: &[u8], entry: &SystemProcessEntry) -> String {
    let base = raw.as_ptr() as u64;
    let offset = entry.image_name.buffer.wrapping_sub(base) as usize;
    let length = entry.image_name.length as usize;
    if entry.image_name.buffer < base || offset + length > raw.len() {
        return String::new();
    }
    let wide: Vec<u16> = raw[offset..offset + length]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&wide)
}

fn module_file_name(path: &str) -> String {
    path.rsplit(['\\', '/']).next().unwrap_or(path).to_ascii_lowercase()
}

/// Only image files belong in the module table; the loader list also carries
/// entries for resources mapped without execution.
fn is_image_name(name: &str) -> bool {
    name.ends_with(".dll") || name.ends_with(".exe")
}

impl NativeCoreInterface {
    fn peb_address(handle: HANDLE, wow64_view: bool) -> IfaceResult<u64> {
        if wow64_view {
            let peb32 = nt::query_wow64_peb(handle)?;
            if peb32 == 0 {
                return Err(InterfaceError::os("ProcessWow64Information", "no WOW64 PEB"));
            }
            Ok(peb32)
        } else {
            Ok(nt::query_basic_information(handle)?.peb_base_address)
        }
    }

    /// Walks one `InMemoryOrderModuleList`, invoking `visit` with the address
    /// of each `LDR_DATA_TABLE_ENTRY.InMemoryOrderLinks` node.
    fn walk_ldr_list<F>(list_head: u64, mut next_of: impl FnMut(u64) -> IfaceResult<u64>, mut visit: F) -> IfaceResult<()>
    where
        F: FnMut(u64) -> IfaceResult<()>,
    {
        let mut link = next_of(list_head)?;
        let mut visited = 0usize;
        while link != list_head && link != 0 {
            if visited >= MAX_LDR_ENTRIES {
                return Err(InterfaceError::Parse(
                    "loader module list does not terminate".into(),
                ));
            }
            visit(link)?;
            visited += 1;
            link = next_of(link)?;
        }
        Ok(())
    }

    fn count_modules_64(handle: HANDLE) -> IfaceResult<usize> {
        let peb = Self::peb_address(handle, false)?;
        let ldr = read_u64(handle, peb + PEB64_LDR)?;
        let head = ldr + LDR64_IN_MEMORY_ORDER_LIST;
        let mut count = 0usize;
        Self::walk_ldr_list(
            head,
            |node| Ok(read_struct::<ListEntry64>(handle, node)?.flink),
            |_| {
                count += 1;
                Ok(())
            },
        )?;
        Ok(count)
    }

    fn count_modules_32(handle: HANDLE) -> IfaceResult<usize> {
        let peb = Self::peb_address(handle, true)?;
        let ldr = read_u32(handle, peb + PEB32_LDR)? as u64;
        let head = ldr + LDR32_IN_MEMORY_ORDER_LIST;
        let mut count = 0usize;
        Self::walk_ldr_list(
            head,
            |node| Ok(read_struct::<ListEntry32>(handle, node)?.flink as u64),
            |_| {
                count += 1;
                Ok(())
            },
        )?;
        Ok(count)
    }

    /// Builds the module entry for one loader node: header fields from the
    /// loader list, sections and exports from the remote PE image.
    fn finish_module(
        handle: HANDLE,
        out: &mut NativeModulesInfo,
        mut module: NativeModuleEntry,
    ) {
        if module.address == 0 || !is_image_name(&module.name) {
            return;
        }
        let mut reader =
            |address: u64, buffer: &mut [u8]| nt::read_virtual_memory(handle, address, buffer);
        if let Err(err) = pe::parse_module(&mut reader, &mut module) {
            // Keep the bare entry; address range lookups still work without
            // section or export data.
            warn!(module = %module.name, %err, "PE parse failed");
        }
        out.insert(module);
    }

    fn collect_modules_64(handle: HANDLE, out: &mut NativeModulesInfo) -> IfaceResult<()> {
        let peb = Self::peb_address(handle, false)?;
        let ldr = read_u64(handle, peb + PEB64_LDR)?;
        let head = ldr + LDR64_IN_MEMORY_ORDER_LIST;
        Self::walk_ldr_list(
            head,
            |node| Ok(read_struct::<ListEntry64>(handle, node)?.flink),
            |node| {
                let entry: LdrEntryView64 = read_struct(handle, node)?;
                let path = read_wide_string(
                    handle,
                    entry.full_dll_name.buffer,
                    entry.full_dll_name.length,
                )?
                .to_ascii_lowercase();
                Self::finish_module(
                    handle,
                    out,
                    NativeModuleEntry {
                        name: module_file_name(&path),
                        address: entry.dll_base,
                        size: entry.size_of_image as u64,
                        is_32_bit: false,
                        path,
                        ..Default::default()
                    },
                );
                Ok(())
            },
        )
    }

    fn collect_modules_32(handle: HANDLE, out: &mut NativeModulesInfo) -> IfaceResult<()> {
        let peb = Self::peb_address(handle, true)?;
        let ldr = read_u32(handle, peb + PEB32_LDR)? as u64;
        let head = ldr + LDR32_IN_MEMORY_ORDER_LIST;
        Self::walk_ldr_list(
            head,
            |node| Ok(read_struct::<ListEntry32>(handle, node)?.flink as u64),
            |node| {
                let entry: LdrEntryView32 = read_struct(handle, node)?;
                let path = read_wide_string(
                    handle,
                    entry.full_dll_name.buffer as u64,
                    entry.full_dll_name.length,
                )?
                .to_ascii_lowercase();
                Self::finish_module(
                    handle,
                    out,
                    NativeModuleEntry {
                        name: module_file_name(&path),
                        address: entry.dll_base as u64,
                        size: entry.size_of_image as u64,
                        is_32_bit: true,
                        path,
                        ..Default::default()
                    },
                );
                Ok(())
            },
        )
    }
}

impl ProcessInterface for NativeCoreInterface {
    fn interface_description(&self) -> String {
        format!("Native Windows interface (host v{})", crate::core::VERSION)
    }

    fn open_process(&mut self, pid: u32) -> IfaceResult<NativeHandle> {
        let handle = nt::open_process(pid, PROCESS_VM_ACCESS)?;
        debug!(pid, handle = handle as u64, "opened process");
        Ok(NativeHandle(handle as u64))
    }

    fn close_process(&mut self, handle: NativeHandle) -> IfaceResult<()> {
        nt::close_handle(raw_handle(handle)?)
    }

    fn get_processes(&mut self, pid_filter: &HashSet<u32>) -> IfaceResult<NativeProcessMap> {
        let raw = nt::query_process_snapshot()?;
        let mut map = NativeProcessMap::new();

        let mut offset = 0usize;
        loop {
            let rest = raw.get(offset..).ok_or_else(|| {
                InterfaceError::Parse("process snapshot entry out of bounds".into())
            })?;
            let (entry, _) = SystemProcessEntry::ref_from_prefix(rest)
                .map_err(|_| InterfaceError::Parse("truncated process snapshot".into()))?;

            let pid = entry.unique_process_id as u32;
            if pid != 0 {
                // Prefer the kernel sequence number; fall back to the create
                // time on builds that predate it.
                let sequence_number = nt::open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION)
                    .ok()
                    .and_then(|h| {
                        let sequence = nt::query_sequence_number(h);
                        let _ = nt::close_handle(h);
                        sequence
                    })
                    .unwrap_or(entry.create_time);
                map.insert(
                    pid,
                    NativeProcessEntry {
                        name: snapshot_image_name(&raw, entry),
                        parent_id: entry.inherited_from_unique_process_id as u32,
                        sequence_number,
                    },
                );
            }

            if entry.next_entry_offset == 0 {
                break;
            }
            offset += entry.next_entry_offset as usize;
        }

        apply_pid_filter(&mut map, pid_filter);
        Ok(map)
    }

    fn is_process_32_bit(&mut self, handle: NativeHandle) -> IfaceResult<bool> {
        nt::is_wow64_process(raw_handle(handle)?)
    }

    fn read_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &mut [u8],
    ) -> IfaceResult<usize> {
        nt::read_virtual_memory(raw_handle(handle)?, address, buffer)
    }

    fn write_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &[u8],
    ) -> IfaceResult<usize> {
        nt::write_virtual_memory(raw_handle(handle)?, address, buffer)
    }

    fn get_base_address(
        &mut self,
        handle: NativeHandle,
        get_32_bit_base: bool,
    ) -> IfaceResult<u64> {
        let handle = raw_handle(handle)?;
        if get_32_bit_base {
            let peb32 = Self::peb_address(handle, true)?;
            Ok(read_u32(handle, peb32 + PEB32_IMAGE_BASE)? as u64)
        } else {
            let peb = Self::peb_address(handle, false)?;
            read_u64(handle, peb + PEB64_IMAGE_BASE)
        }
    }

    fn get_module_count(&mut self, handle: NativeHandle) -> IfaceResult<usize> {
        let raw = raw_handle(handle)?;
        if nt::is_wow64_process(raw)? {
            Self::count_modules_32(raw)
        } else {
            Self::count_modules_64(raw)
        }
    }

    fn get_modules(&mut self, handle: NativeHandle, out: &mut NativeModulesInfo) -> IfaceResult<()> {
        let raw = raw_handle(handle)?;
        // One loader view per process: WOW64 targets get the 32-bit PEB,
        // native targets the 64-bit one. Mixing both would collide the
        // name-keyed table on the system DLLs loaded into each view.
        if nt::is_wow64_process(raw)? {
            Self::collect_modules_32(raw, out)?;
        } else {
            Self::collect_modules_64(raw, out)?;
        }
        out.resolve_forwarders();
        debug!(modules = out.len(), "enumerated modules");
        Ok(())
    }

    fn get_virtual_memory(&mut self, handle: NativeHandle) -> IfaceResult<Vec<MemoryRegion>> {
        let raw = raw_handle(handle)?;
        let (minimum, maximum) = nt::application_address_range();
        let mut regions = Vec::new();
        let mut address = minimum;
        while address < maximum {
            let Some(info) = nt::virtual_query(raw, address) else {
                break;
            };
            let size = info.RegionSize as u64;
            if size == 0 {
                break;
            }
            if info.State & MEM_COMMIT != 0 {
                regions.push(MemoryRegion {
                    address: info.BaseAddress as u64,
                    size,
                });
            }
            address = info.BaseAddress as u64 + size;
        }
        Ok(regions)
    }
}
