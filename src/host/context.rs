//! Attached-process state: identity, bitness, module table and region index.
//!
//! A context is either attached or detached. Attach populates everything in
//! one pass through the backend; detach resets to the default state, after
//! which every address query answers "unknown" instead of erroring.

use tracing::{debug, warn};

use crate::core::types::{
    parse_address_expression, IfaceResult, InterfaceError, MemoryRegion, NativeModuleEntry,
    NativeModulesInfo, ProjectError, ProjectResult, RegionIndex,
};
use crate::iface::{NativeHandle, ProcessInterface};

/// Widest user-mode address we accept for a 64-bit target. Canonical
/// user-space tops out below this on both Windows and Linux.
const MAX_ADDRESS_64: u64 = 0x000F_0000_0000_0000;
/// Widest user-mode address for a 32-bit target.
const MAX_ADDRESS_32: u64 = 0xFFF0_0000;
/// Lowest address either platform maps for user code.
const MIN_ADDRESS: u64 = 0x10000;

/// Snapshot of one attached process.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProcessContext {
    pub pid: u32,
    pub name: String,
    pub handle: NativeHandle,
    pub is_64_bit: bool,
    /// Native loader image base.
    pub image_base_64: u64,
    /// Emulated 32-bit image base; zero for a 64-bit target.
    pub image_base_32: u64,
    pub modules: NativeModulesInfo,
    pub regions: RegionIndex,
}

impl ProcessContext {
    pub fn is_attached(&self) -> bool {
        !self.handle.is_null()
    }

    /// Image base for the target's own bitness view.
    pub fn image_base(&self) -> u64 {
        if self.is_64_bit {
            self.image_base_64
        } else {
            self.image_base_32
        }
    }

    pub fn pointer_size(&self) -> usize {
        if self.is_64_bit {
            8
        } else {
            4
        }
    }

    /// Resolves a struct base-address expression (`base`, `base+0x40`, or a
    /// plain literal) against the attached image base.
    pub fn resolve_address_expression(&self, expression: &str) -> ProjectResult<u64> {
        if !self.is_attached() {
            return Err(ProjectError::Document(
                "cannot resolve a base expression while detached".into(),
            ));
        }
        parse_address_expression(expression, self.image_base())
    }

    /// Whether `address` lies in the plausible user-mode range for the
    /// attached target's bitness. Detached contexts accept nothing.
    pub fn is_valid_address(&self, address: u64) -> bool {
        if !self.is_attached() || address < MIN_ADDRESS {
            return false;
        }
        if self.is_64_bit {
            address < MAX_ADDRESS_64
        } else {
            address < MAX_ADDRESS_32
        }
    }

    /// Opens the process and captures bitness, image bases, modules and
    /// committed regions. On a partial failure the already opened handle is
    /// closed before the error propagates.
    pub fn attach(
        &mut self,
        iface: &mut dyn ProcessInterface,
        pid: u32,
        name: impl Into<String>,
    ) -> IfaceResult<()> {
        if self.is_attached() {
            return Err(InterfaceError::Os(format!(
                "already attached to pid {}",
                self.pid
            )));
        }

        let handle = iface.open_process(pid)?;
        match Self::capture(iface, handle, pid) {
            Ok(captured) => {
                *self = captured;
                self.name = name.into();
                debug!(
                    pid,
                    name = %self.name,
                    is_64_bit = self.is_64_bit,
                    modules = self.modules.len(),
                    regions = self.regions.len(),
                    "attached"
                );
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = iface.close_process(handle) {
                    warn!(pid, %close_err, "close after failed attach");
                }
                Err(err)
            }
        }
    }

    fn capture(
        iface: &mut dyn ProcessInterface,
        handle: NativeHandle,
        pid: u32,
    ) -> IfaceResult<ProcessContext> {
        let is_64_bit = !iface.is_process_32_bit(handle)?;
        let image_base_64 = iface.get_base_address(handle, false)?;
        let image_base_32 = if is_64_bit {
            0
        } else {
            iface.get_base_address(handle, true)?
        };

        let mut modules = NativeModulesInfo::default();
        iface.get_modules(handle, &mut modules)?;
        let regions = RegionIndex::from_regions(iface.get_virtual_memory(handle)?);

        Ok(ProcessContext {
            pid,
            name: String::new(),
            handle,
            is_64_bit,
            image_base_64,
            image_base_32,
            modules,
            regions,
        })
    }

    /// Closes the handle and resets every field. Detaching a detached
    /// context is a no-op. A failed close reports the error and leaves the
    /// context attached, since the backend still holds the handle.
    pub fn detach(&mut self, iface: &mut dyn ProcessInterface) -> IfaceResult<()> {
        if !self.is_attached() {
            return Ok(());
        }
        iface.close_process(self.handle)?;
        *self = ProcessContext::default();
        Ok(())
    }

    pub fn get_module_from_address(&self, address: u64) -> Option<&NativeModuleEntry> {
        self.modules.module_from_address(address)
    }

    pub fn get_memory_region_from_address(&self, address: u64) -> Option<MemoryRegion> {
        self.regions.region_from_address(address)
    }

    /// Follows a pointer chain starting at `address`, recording each hop.
    /// The walk stops at `max_hops`, on a failed or short read, on an
    /// implausible pointer value, or when the pointee leaves known committed
    /// memory. Returns the hops in order; the starting address is not
    /// included.
    pub fn get_indirections_for_address(
        &self,
        iface: &mut dyn ProcessInterface,
        address: u64,
        max_hops: usize,
    ) -> Vec<u64> {
        let mut hops = Vec::new();
        if !self.is_valid_address(address) {
            return hops;
        }

        let pointer_size = self.pointer_size();
        let mut current = address;
        while hops.len() < max_hops {
            let mut raw = [0u8; 8];
            let buffer = &mut raw[..pointer_size];
            match iface.read_process_memory(self.handle, current, buffer) {
                Ok(read) if read == pointer_size => {}
                _ => break,
            }
            let next = if self.is_64_bit {
                u64::from_le_bytes(raw)
            } else {
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
            };
            if !self.is_valid_address(next)
                || self.get_memory_region_from_address(next).is_none()
            {
                break;
            }
            hops.push(next);
            current = next;
        }
        hops
    }
}
