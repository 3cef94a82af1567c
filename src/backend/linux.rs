//! /proc based user-mode backend.
//!
//! Memory I/O goes through `process_vm_readv`/`process_vm_writev`, process
//! enumeration walks `/proc`, regions and the module list come from the
//! target's maps file, and module sections/exports are recovered by parsing
//! the backing ELF images on disk.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};

use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use proc_maps::get_process_maps;
use tracing::{debug, warn};

use crate::backend::elf;
use crate::core::types::{
    IfaceResult, InterfaceError, MemoryRegion, NativeModuleEntry, NativeModulesInfo,
    NativeProcessEntry, NativeProcessMap,
};
use crate::iface::{NativeHandle, ProcessInterface};

/// User-mode backend speaking to `/proc`. The native handle is simply the
/// pid; opening a process only verifies the pid exists.
#[derive(Debug, Default)]
pub struct UserModeInterface;

impl UserModeInterface {
    pub fn new() -> Self {
        UserModeInterface
    }

    fn pid_of(handle: NativeHandle) -> IfaceResult<Pid> {
        if handle.is_null() {
            return Err(InterfaceError::InvalidHandle(
                "Process handle is null".to_string(),
            ));
        }
        Ok(Pid::from_raw(handle.0 as i32))
    }

    fn exe_path(pid: Pid) -> IfaceResult<PathBuf> {
        fs::read_link(format!("/proc/{pid}/exe"))
            .map_err(|e| InterfaceError::os(format!("Failed to resolve /proc/{pid}/exe"), e))
    }

    /// Groups the maps file into file-backed modules: base is the lowest
    /// mapping of a path, size spans to the highest.
    fn collect_modules(pid: Pid) -> IfaceResult<BTreeMap<PathBuf, (u64, u64)>> {
        let maps = get_process_maps(pid.as_raw())
            .map_err(|e| InterfaceError::os(format!("Failed to read maps of pid {pid}"), e))?;

        let mut modules: BTreeMap<PathBuf, (u64, u64)> = BTreeMap::new();
        for map in maps {
            let Some(path) = map.filename() else {
                continue;
            };
            if !path.is_absolute() || !path.exists() {
                // Anonymous, vdso-style or deleted mappings
                continue;
            }

            let start = map.start() as u64;
            let end = start + map.size() as u64;
            modules
                .entry(path.to_path_buf())
                .and_modify(|(base, top)| {
                    *base = (*base).min(start);
                    *top = (*top).max(end);
                })
                .or_insert((start, end));
        }

        Ok(modules)
    }

    fn module_entry(path: &Path, base: u64, top: u64) -> NativeModuleEntry {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let mut module = NativeModuleEntry {
            name,
            address: base,
            size: top - base,
            path: path.to_string_lossy().to_lowercase(),
            ..Default::default()
        };

        match fs::read(path) {
            Ok(data) => {
                module.is_32_bit = data.len() >= 16
                    && elf::is_32_bit_ident(&data[..16]).unwrap_or(false);
                if let Err(err) = elf::parse_sections(&data, base, &mut module.sections) {
                    debug!(module = module.name, %err, "Failed to parse ELF sections");
                }
                if let Err(err) = elf::parse_exports(&data, base, &mut module.exports) {
                    debug!(module = module.name, %err, "Failed to parse ELF exports");
                }
            }
            Err(err) => {
                debug!(module = module.name, %err, "Failed to read module image from disk");
            }
        }

        module
    }
}

impl ProcessInterface for UserModeInterface {
    fn interface_description(&self) -> String {
        "Usermode process interface using process_vm_readv/writev.".to_string()
    }

    fn open_process(&mut self, pid: u32) -> IfaceResult<NativeHandle> {
        if !Path::new(&format!("/proc/{pid}")).exists() {
            return Err(InterfaceError::Os(format!("No such process: {pid}")));
        }
        Ok(NativeHandle(u64::from(pid)))
    }

    fn close_process(&mut self, handle: NativeHandle) -> IfaceResult<()> {
        // Nothing is held open for a pid-as-handle backend
        Self::pid_of(handle).map(|_| ())
    }

    fn get_processes(&mut self, pid_filter: &HashSet<u32>) -> IfaceResult<NativeProcessMap> {
        let proc_dir = fs::read_dir("/proc")
            .map_err(|e| InterfaceError::os("Failed to enumerate /proc", e))?;

        let mut entries = NativeProcessMap::new();
        let mut sequence = 0u64;
        for dir_entry in proc_dir.flatten() {
            let Ok(pid) = dir_entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            if pid_filter.contains(&pid) {
                continue;
            }

            let mut entry = NativeProcessEntry {
                parent_id: NativeProcessEntry::INVALID_PARENT,
                ..Default::default()
            };

            match fs::read_to_string(format!("/proc/{pid}/cmdline")) {
                Ok(cmdline) => {
                    entry.name = cmdline.split('\0').next().unwrap_or_default().to_string();
                }
                Err(err) => {
                    debug!(pid, %err, "Failed to read cmdline, skipping process");
                    continue;
                }
            }
            if entry.name.is_empty() {
                // Kernel threads have an empty cmdline; fall back to comm
                entry.name = fs::read_to_string(format!("/proc/{pid}/comm"))
                    .map(|s| s.trim_end().to_string())
                    .unwrap_or_default();
            }

            if let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) {
                for line in status.lines() {
                    if let Some(ppid) = line.strip_prefix("PPid:") {
                        if let Ok(parent) = ppid.trim().parse::<u32>() {
                            entry.parent_id = if pid_filter.contains(&parent) {
                                NativeProcessEntry::INVALID_PARENT
                            } else {
                                parent
                            };
                        }
                    }
                }
            }

            // /proc has no creation-order counter; the start time from stat
            // field 22 provides the same ordering guarantee.
            if let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) {
                if let Some(after_comm) = stat.rsplit(')').next() {
                    entry.sequence_number = after_comm
                        .split_whitespace()
                        .nth(19)
                        .and_then(|f| f.parse().ok())
                        .unwrap_or(sequence);
                }
            } else {
                entry.sequence_number = sequence;
            }
            sequence += 1;

            entries.insert(pid, entry);
        }

        Ok(entries)
    }

    fn is_process_32_bit(&mut self, handle: NativeHandle) -> IfaceResult<bool> {
        let pid = Self::pid_of(handle)?;
        let exe = Self::exe_path(pid)?;
        let data = fs::read(&exe)
            .map_err(|e| InterfaceError::os(format!("Failed to read {}", exe.display()), e))?;
        if data.len() < 16 {
            return Err(InterfaceError::Parse(format!(
                "Executable too small for an ELF ident: {}",
                exe.display()
            )));
        }
        elf::is_32_bit_ident(&data[..16])
    }

    fn read_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &mut [u8],
    ) -> IfaceResult<usize> {
        let pid = Self::pid_of(handle)?;
        if buffer.is_empty() {
            return Err(InterfaceError::Parse("buffer size can't be 0".to_string()));
        }

        let mut local = [IoSliceMut::new(buffer)];
        let remote = [RemoteIoVec {
            base: address as usize,
            len: local[0].len(),
        }];

        process_vm_readv(pid, &mut local, &remote)
            .map_err(|e| InterfaceError::os("process_vm_readv failed", e))
    }

    fn write_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &[u8],
    ) -> IfaceResult<usize> {
        let pid = Self::pid_of(handle)?;
        if buffer.is_empty() {
            return Err(InterfaceError::Parse("buffer size can't be 0".to_string()));
        }

        let local = [IoSlice::new(buffer)];
        let remote = [RemoteIoVec {
            base: address as usize,
            len: buffer.len(),
        }];

        process_vm_writev(pid, &local, &remote)
            .map_err(|e| InterfaceError::os("process_vm_writev failed", e))
    }

    fn get_base_address(&mut self, handle: NativeHandle, _get_32_bit_base: bool) -> IfaceResult<u64> {
        // There is no emulated second view on Linux; both bitness views
        // resolve to the lowest mapping of the main executable.
        let pid = Self::pid_of(handle)?;
        let exe = Self::exe_path(pid)?;
        let modules = Self::collect_modules(pid)?;

        modules
            .get(&exe)
            .map(|(base, _)| *base)
            .ok_or_else(|| {
                InterfaceError::Os(format!(
                    "Main executable {} not found in maps of pid {pid}",
                    exe.display()
                ))
            })
    }

    fn get_module_count(&mut self, handle: NativeHandle) -> IfaceResult<usize> {
        let pid = Self::pid_of(handle)?;
        Ok(Self::collect_modules(pid)?.len())
    }

    fn get_modules(&mut self, handle: NativeHandle, out: &mut NativeModulesInfo) -> IfaceResult<()> {
        let pid = Self::pid_of(handle)?;

        for (path, (base, top)) in Self::collect_modules(pid)? {
            let module = Self::module_entry(&path, base, top);
            if module.name.is_empty() {
                warn!(path = %path.display(), "Skipping module without a file name");
                continue;
            }
            out.insert(module);
        }

        Ok(())
    }

    fn get_virtual_memory(&mut self, handle: NativeHandle) -> IfaceResult<Vec<MemoryRegion>> {
        let pid = Self::pid_of(handle)?;
        let maps = get_process_maps(pid.as_raw())
            .map_err(|e| InterfaceError::os(format!("Failed to read maps of pid {pid}"), e))?;

        Ok(maps
            .iter()
            .map(|map| MemoryRegion::new(map.start() as u64, map.size() as u64))
            .collect())
    }
}
