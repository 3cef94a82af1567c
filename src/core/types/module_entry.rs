//! Module, section and export tables built by backend enumeration

use std::collections::{BTreeMap, HashMap};

/// A section of a loaded module, with its mapped address and the raw
/// characteristics/flags word from the image header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeSection {
    pub address: u64,
    pub size: u64,
    pub characteristics: u32,
}

/// One export of a loaded module.
///
/// `forwarder` holds the raw `"OtherModule.ExportName"` string for forwarded
/// exports; after [`NativeModulesInfo`] post-processing the `address` of a
/// resolved forwarder points at the final target. Unresolved forwarders keep
/// their original export-directory address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeModuleExport {
    pub name: String,
    pub address: u64,
    pub ordinal: u32,
    pub forwarder: Option<String>,
}

impl NativeModuleExport {
    pub fn is_forwarder(&self) -> bool {
        self.forwarder.is_some()
    }
}

/// A loaded module of the target process, for one bitness view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeModuleEntry {
    /// Lower-cased file name, e.g. `kernel32.dll`
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub is_32_bit: bool,
    /// Full lower-cased file path
    pub path: String,
    pub sections: BTreeMap<String, NativeSection>,
    pub exports: BTreeMap<String, NativeModuleExport>,
}

impl NativeModuleEntry {
    /// End address (one past the last mapped byte)
    pub fn end_address(&self) -> u64 {
        self.address + self.size
    }

    pub fn contains_address(&self, address: u64) -> bool {
        address >= self.address && address < self.end_address()
    }
}

/// Module table plus an end-address-ordered index for range lookups.
///
/// The index maps `module.address + module.size` to the module name, which
/// allows "first module whose end lies above the queried address" lookups in
/// O(log n). This is only correct because OS-reported module ranges do not
/// overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeModulesInfo {
    pub modules: HashMap<String, NativeModuleEntry>,
    pub address_index: BTreeMap<u64, String>,
}

impl NativeModulesInfo {
    /// Inserts a module into the table and the address index. Re-inserting
    /// a name replaces the previous entry and its index key, so the index
    /// never points at a module that is no longer in the table.
    pub fn insert(&mut self, module: NativeModuleEntry) {
        if let Some(previous) = self.modules.remove(&module.name) {
            self.address_index.remove(&previous.end_address());
        }
        self.address_index
            .insert(module.end_address(), module.name.clone());
        self.modules.insert(module.name.clone(), module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NativeModuleEntry> {
        self.modules.get(name)
    }

    /// Finds the module containing `address`, if any.
    pub fn module_from_address(&self, address: u64) -> Option<&NativeModuleEntry> {
        use std::ops::Bound::{Excluded, Unbounded};

        // Smallest end address strictly greater than the target, then a
        // containment check against the module start.
        let (_, name) = self
            .address_index
            .range((Excluded(address), Unbounded))
            .next()?;
        let module = self.modules.get(name)?;
        module.contains_address(address).then_some(module)
    }

    /// Resolves forwarded exports by name-matching into the tables of the
    /// already-collected modules. Runs once per bitness after enumeration;
    /// follows a single hop, skips ordinal forwarders (`#n`) and leaves
    /// unresolved chains untouched.
    pub fn resolve_forwarders(&mut self) {
        // (module, export, final address) triples collected up front since we
        // cannot mutate the map while name-matching into it.
        let mut resolved: Vec<(String, String, u64)> = Vec::new();

        for (module_name, module) in &self.modules {
            for (export_name, export) in &module.exports {
                let Some(forwarder) = &export.forwarder else {
                    continue;
                };

                let Some((target_module, target_export)) = forwarder.split_once('.') else {
                    tracing::warn!(forwarder, "Malformed forwarded export, skipping");
                    continue;
                };

                if target_export.starts_with('#') {
                    // Forwarded by ordinal, not resolvable by name matching
                    continue;
                }

                let target_module = format!("{}.dll", target_module.to_lowercase());
                let Some(target) = self.modules.get(&target_module) else {
                    tracing::warn!(
                        module = target_module,
                        "Failed to find forwarded module, skipping"
                    );
                    continue;
                };

                let Some(target) = target.exports.get(target_export) else {
                    tracing::warn!(
                        export = target_export,
                        module = target_module,
                        "Failed to find forwarded export, skipping"
                    );
                    continue;
                };

                resolved.push((module_name.clone(), export_name.clone(), target.address));
            }
        }

        for (module_name, export_name, address) in resolved {
            if let Some(export) = self
                .modules
                .get_mut(&module_name)
                .and_then(|m| m.exports.get_mut(&export_name))
            {
                export.address = address;
            }
        }
    }
}
