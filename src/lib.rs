//! Process memory introspection core: swappable OS backends behind a
//! plugin-loadable interface, an attached-process context with module and
//! region indexes, RTTI name recovery, and a struct/field layout model with
//! JSON persistence.

pub mod backend;
pub mod config;
pub mod core;
pub mod host;
pub mod iface;
pub mod project;

// Re-export the main types for flat access
pub use core::types::{
    Address, IfaceResult, InterfaceError, MemoryRegion, NativeModuleEntry, NativeModulesInfo,
    NativeProcessEntry, NativeProcessMap, ProjectError, ProjectResult, RegionIndex,
};
pub use host::{InterfaceHost, ProcessContext};
pub use iface::{InterfaceBox, NativeHandle, ProcessInterface, INTERFACE_ABI_VERSION};
pub use project::Project;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_wired_through() {
        assert_eq!(core::VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn main_types_are_reexported() {
        let handle = NativeHandle::null();
        assert!(handle.is_null());

        let region = MemoryRegion::new(0x1000, 0x2000);
        assert_eq!(region.end_address(), 0x3000);

        let addr: Address = "0x1000".parse().unwrap();
        assert_eq!(addr.0, 0x1000);
    }
}
