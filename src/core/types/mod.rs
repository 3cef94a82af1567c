//! Shared value types for the process interface and layout layers

mod address;
mod error;
mod module_entry;
mod process_entry;
mod region;

pub use address::{parse_address_expression, Address};
pub use error::{IfaceResult, InterfaceError, ProjectError, ProjectResult};
pub use module_entry::{NativeModuleEntry, NativeModuleExport, NativeModulesInfo, NativeSection};
pub use process_entry::{apply_pid_filter, NativeProcessEntry, NativeProcessMap};
pub use region::{MemoryRegion, RegionIndex};
