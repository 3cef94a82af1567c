//! Core module containing the fundamental types shared by the process
//! interface contract, the host-side introspection layer and the struct
//! layout model.

pub mod types;

// Re-export commonly used types for convenience
pub use types::{
    Address, IfaceResult, InterfaceError, MemoryRegion, NativeModuleEntry, NativeModulesInfo,
    NativeProcessEntry, ProjectError, ProjectResult, RegionIndex,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
