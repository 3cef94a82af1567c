//! In-memory backend used by the test suites. Serves a single fake process
//! with one module and a sparse byte map standing in for its address space.

use std::collections::{HashMap, HashSet};

use crate::core::types::{
    IfaceResult, InterfaceError, MemoryRegion, NativeModuleEntry, NativeModulesInfo,
    NativeProcessEntry, NativeProcessMap,
};
use crate::iface::{NativeHandle, ProcessInterface};

/// Fake process backend. Bytes not explicitly poked read as zero inside the
/// configured regions; reads outside every region fail, reads straddling a
/// region end are truncated the way a real backend truncates them.
#[derive(Debug)]
pub struct MockInterface {
    pub is_32_bit: bool,
    /// When set, `get_modules` fails. Exercises partial-attach cleanup.
    pub fail_modules: bool,
    /// When set, `close_process` fails. Exercises detach error handling.
    pub fail_close: bool,
    pub(crate) memory: HashMap<u64, u8>,
    pub(crate) regions: Vec<MemoryRegion>,
    pub(crate) open: HashSet<u64>,
    pub(crate) next_handle: u64,
}

impl Default for MockInterface {
    fn default() -> Self {
        MockInterface {
            is_32_bit: false,
            fail_modules: false,
            fail_close: false,
            memory: HashMap::new(),
            regions: vec![MemoryRegion::new(Self::IMAGE_BASE, Self::REGION_SIZE)],
            open: HashSet::new(),
            next_handle: 1,
        }
    }
}

impl MockInterface {
    pub const PID: u32 = 1234;
    pub const IMAGE_BASE: u64 = 0x7FF6_0000_0000;
    /// Base reported for the 32-bit view of a WOW64-style target.
    pub const IMAGE_BASE_32: u64 = 0x0040_0000;
    pub const MODULE_SIZE: u64 = 0x10000;
    pub const REGION_SIZE: u64 = 0x20000;

    pub fn poke_bytes(&mut self, address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u64, *byte);
        }
    }

    pub fn poke_u32(&mut self, address: u64, value: u32) {
        self.poke_bytes(address, &value.to_le_bytes());
    }

    pub fn poke_u64(&mut self, address: u64, value: u64) {
        self.poke_bytes(address, &value.to_le_bytes());
    }

    pub fn add_region(&mut self, address: u64, size: u64) {
        self.regions.push(MemoryRegion::new(address, size));
    }

    /// Number of handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    fn region_containing(&self, address: u64) -> Option<MemoryRegion> {
        self.regions.iter().copied().find(|r| r.contains(address))
    }

    fn check_handle(&self, handle: NativeHandle) -> IfaceResult<()> {
        if self.open.contains(&handle.0) {
            Ok(())
        } else {
            Err(InterfaceError::InvalidHandle(format!("{:#X}", handle.0)))
        }
    }
}

impl ProcessInterface for MockInterface {
    fn interface_description(&self) -> String {
        "Mock interface".into()
    }

    fn open_process(&mut self, _pid: u32) -> IfaceResult<NativeHandle> {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open.insert(handle);
        Ok(NativeHandle(handle))
    }

    fn close_process(&mut self, handle: NativeHandle) -> IfaceResult<()> {
        self.check_handle(handle)?;
        if self.fail_close {
            return Err(InterfaceError::os("close_process", "handle is pinned"));
        }
        self.open.remove(&handle.0);
        Ok(())
    }

    fn get_processes(&mut self, pid_filter: &HashSet<u32>) -> IfaceResult<NativeProcessMap> {
        let mut map = NativeProcessMap::new();
        if !pid_filter.contains(&Self::PID) {
            map.insert(
                Self::PID,
                NativeProcessEntry {
                    name: "target.exe".into(),
                    parent_id: 1,
                    sequence_number: 42,
                },
            );
        }
        Ok(map)
    }

    fn is_process_32_bit(&mut self, handle: NativeHandle) -> IfaceResult<bool> {
        self.check_handle(handle)?;
        Ok(self.is_32_bit)
    }

    fn read_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &mut [u8],
    ) -> IfaceResult<usize> {
        self.check_handle(handle)?;
        let region = self
            .region_containing(address)
            .ok_or_else(|| InterfaceError::os("read", format!("unmapped address {address:#X}")))?;
        let available = (region.end_address() - address) as usize;
        let count = buffer.len().min(available);
        for (i, slot) in buffer[..count].iter_mut().enumerate() {
            *slot = self.memory.get(&(address + i as u64)).copied().unwrap_or(0);
        }
        Ok(count)
    }

    fn write_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &[u8],
    ) -> IfaceResult<usize> {
        self.check_handle(handle)?;
        let region = self
            .region_containing(address)
            .ok_or_else(|| InterfaceError::os("write", format!("unmapped address {address:#X}")))?;
        let available = (region.end_address() - address) as usize;
        let count = buffer.len().min(available);
        for (i, byte) in buffer[..count].iter().enumerate() {
            self.memory.insert(address + i as u64, *byte);
        }
        Ok(count)
    }

    fn get_base_address(
        &mut self,
        handle: NativeHandle,
        get_32_bit_base: bool,
    ) -> IfaceResult<u64> {
        self.check_handle(handle)?;
        if get_32_bit_base {
            Ok(Self::IMAGE_BASE_32)
        } else {
            Ok(Self::IMAGE_BASE)
        }
    }

    fn get_module_count(&mut self, handle: NativeHandle) -> IfaceResult<usize> {
        self.check_handle(handle)?;
        Ok(1)
    }

    fn get_modules(&mut self, handle: NativeHandle, out: &mut NativeModulesInfo) -> IfaceResult<()> {
        self.check_handle(handle)?;
        if self.fail_modules {
            return Err(InterfaceError::os("get_modules", "forced failure"));
        }
        out.insert(NativeModuleEntry {
            name: "target.exe".into(),
            address: Self::IMAGE_BASE,
            size: Self::MODULE_SIZE,
            is_32_bit: self.is_32_bit,
            path: "c:\\games\\target.exe".into(),
            ..Default::default()
        });
        Ok(())
    }

    fn get_virtual_memory(&mut self, handle: NativeHandle) -> IfaceResult<Vec<MemoryRegion>> {
        self.check_handle(handle)?;
        Ok(self.regions.clone())
    }
}
