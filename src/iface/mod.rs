//! Process interface contract: the seam between the host and a runtime
//! loaded backend.
//!
//! A backend is a shared library exporting three C symbols:
//!
//! - `init_interface() -> *mut InterfaceBox` — returns a singleton instance;
//!   calling it again returns the same instance.
//! - `shutdown_interface()` — destroys the singleton; `init_interface` may be
//!   called afterwards to re-create it.
//! - `interface_version() -> u32` — reports [`INTERFACE_ABI_VERSION`].
//!   Optional for older backends; the host rejects a backend whose reported
//!   version differs from its own.
//!
//! No panic may cross this boundary; every operation returns a
//! success-value-or-error result with a human-readable message.

use std::collections::HashSet;

use crate::core::types::{
    IfaceResult, MemoryRegion, NativeModulesInfo, NativeProcessMap,
};

/// ABI version spoken by this host build. Bumped whenever the contract or the
/// types crossing it change shape.
pub const INTERFACE_ABI_VERSION: u32 = 1;

/// Name of the required init entry point.
pub const INIT_INTERFACE_SYMBOL: &[u8] = b"init_interface\0";
/// Name of the required shutdown entry point.
pub const SHUTDOWN_INTERFACE_SYMBOL: &[u8] = b"shutdown_interface\0";
/// Name of the optional ABI version entry point.
pub const INTERFACE_VERSION_SYMBOL: &[u8] = b"interface_version\0";

/// `init_interface` signature
pub type InitInterfaceFn = unsafe extern "C" fn() -> *mut InterfaceBox;
/// `shutdown_interface` signature
pub type ShutdownInterfaceFn = unsafe extern "C" fn();
/// `interface_version` signature
pub type InterfaceVersionFn = unsafe extern "C" fn() -> u32;

/// Opaque process handle passed across the contract. Backends store whatever
/// they need in it (an OS handle value, or simply the pid); the host only
/// ever checks it against null and hands it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const fn null() -> Self {
        NativeHandle(0)
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Capability set every backend must implement.
///
/// Transfer semantics: `read_process_memory`/`write_process_memory` return
/// the number of bytes actually moved. A partial transfer is not an error by
/// itself; callers compare the returned count against the request and treat
/// short transfers as a recoverable warning.
pub trait ProcessInterface {
    /// Human-readable backend identification. Side-effect free.
    fn interface_description(&self) -> String;

    fn open_process(&mut self, pid: u32) -> IfaceResult<NativeHandle>;

    /// Releases a handle obtained from `open_process`. Must be called at most
    /// once per successful open; closing an already invalid handle fails.
    fn close_process(&mut self, handle: NativeHandle) -> IfaceResult<()>;

    /// Full process snapshot, minus the pids in `pid_filter`. Parent ids
    /// pointing into the filtered set are remapped to
    /// [`crate::core::types::NativeProcessEntry::INVALID_PARENT`].
    fn get_processes(&mut self, pid_filter: &HashSet<u32>) -> IfaceResult<NativeProcessMap>;

    fn is_process_32_bit(&mut self, handle: NativeHandle) -> IfaceResult<bool>;

    fn read_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &mut [u8],
    ) -> IfaceResult<usize>;

    fn write_process_memory(
        &mut self,
        handle: NativeHandle,
        address: u64,
        buffer: &[u8],
    ) -> IfaceResult<usize>;

    /// Image base for the requested bitness view. A 32-bit process hosted by
    /// a 64-bit OS exposes both an emulated 32-bit base and the native loader
    /// base.
    fn get_base_address(&mut self, handle: NativeHandle, get_32_bit_base: bool)
        -> IfaceResult<u64>;

    /// Cheap module count, used to decide whether to re-enumerate.
    fn get_module_count(&mut self, handle: NativeHandle) -> IfaceResult<usize>;

    /// Enumerates loaded modules for every applicable bitness view, appending
    /// to `out`'s module table and end-address index.
    fn get_modules(&mut self, handle: NativeHandle, out: &mut NativeModulesInfo)
        -> IfaceResult<()>;

    /// Lists the committed memory regions of the process.
    fn get_virtual_memory(&mut self, handle: NativeHandle) -> IfaceResult<Vec<MemoryRegion>>;
}

/// Thin, FFI-safe wrapper moved across the plugin boundary as an opaque
/// pointer. The host treats the allocation as owned by the backend; it is
/// created by `init_interface` and released by `shutdown_interface`.
pub struct InterfaceBox(pub Box<dyn ProcessInterface>);

impl InterfaceBox {
    pub fn new(iface: impl ProcessInterface + 'static) -> Self {
        InterfaceBox(Box::new(iface))
    }

    pub fn into_raw(self) -> *mut InterfaceBox {
        Box::into_raw(Box::new(self))
    }
}
