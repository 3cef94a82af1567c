//! Host side of the process interface: backend discovery and loading, plus
//! the attached-process context and the introspection helpers built on it.

pub mod context;
pub mod rtti;
pub mod testing;

use std::fs;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::types::{IfaceResult, InterfaceError, NativeProcessMap};
use crate::iface::{
    InitInterfaceFn, InterfaceBox, InterfaceVersionFn, ProcessInterface, ShutdownInterfaceFn,
    INIT_INTERFACE_SYMBOL, INTERFACE_ABI_VERSION, INTERFACE_VERSION_SYMBOL,
    SHUTDOWN_INTERFACE_SYMBOL,
};

pub use context::ProcessContext;

/// A backend shared library found on disk but not yet loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    /// File name shown to the user, e.g. `libcore_backend.so`
    pub filename: String,
    pub path: PathBuf,
}

/// A backend loaded from a shared library. The library must outlive the
/// instance pointer, so the two travel together and are torn down in order.
struct PluginBackend {
    library: Library,
    iface: *mut InterfaceBox,
    path: PathBuf,
}

enum Backend {
    /// The backend compiled into this crate, no dynamic loading involved.
    Native(Box<dyn ProcessInterface>),
    Plugin(PluginBackend),
}

/// Owns at most one live backend and the process context bound to it.
///
/// Loading a new backend unloads the previous one first, which in turn
/// detaches any attached process; the backend that opened a handle is the
/// only one that can close it.
pub struct InterfaceHost {
    config: Config,
    backend: Option<Backend>,
    pub context: ProcessContext,
}

impl InterfaceHost {
    pub fn new(config: Config) -> Self {
        InterfaceHost {
            config,
            backend: None,
            context: ProcessContext::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scans the configured directory for backend libraries. Re-reads the
    /// directory every call so freshly dropped-in files show up without a
    /// restart. A missing directory yields an empty list.
    pub fn grab_interfaces(&self) -> Vec<InterfaceEntry> {
        let directory = &self.config.interfaces.directory;
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(directory = %directory.display(), %err, "interface directory not readable");
                return Vec::new();
            }
        };

        let mut found: Vec<InterfaceEntry> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext == std::env::consts::DLL_EXTENSION)
            })
            .filter_map(|path| {
                let filename = path.file_name()?.to_string_lossy().into_owned();
                Some(InterfaceEntry { filename, path })
            })
            .collect();
        found.sort_by(|a, b| a.filename.cmp(&b.filename));
        found
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    /// Adopts an in-process backend instance, bypassing the plugin loader.
    pub fn adopt(&mut self, iface: Box<dyn ProcessInterface>) -> IfaceResult<()> {
        self.unload()?;
        self.backend = Some(Backend::Native(iface));
        Ok(())
    }

    /// Loads the backend bundled with this crate.
    pub fn load_native(&mut self) -> IfaceResult<()> {
        self.adopt(Box::new(crate::backend::native_interface()))
    }

    /// Loads a backend shared library and initializes it. Any previously
    /// loaded backend is unloaded first. The library must export
    /// `init_interface` and `shutdown_interface`; if it also exports
    /// `interface_version`, the reported version must match the host's.
    pub fn load_from_path(&mut self, path: impl AsRef<Path>) -> IfaceResult<()> {
        self.unload()?;
        let path = path.as_ref();

        let library = unsafe { Library::new(path) }
            .map_err(|err| InterfaceError::Load(format!("{}: {err}", path.display())))?;

        // Both required entry points must resolve before init runs, so a
        // half-baked library is rejected without side effects.
        let init: libloading::Symbol<InitInterfaceFn> = unsafe {
            library
                .get(INIT_INTERFACE_SYMBOL)
                .map_err(|_| InterfaceError::Symbol("init_interface".into()))?
        };
        unsafe {
            library
                .get::<ShutdownInterfaceFn>(SHUTDOWN_INTERFACE_SYMBOL)
                .map_err(|_| InterfaceError::Symbol("shutdown_interface".into()))?
        };

        if let Ok(version) = unsafe { library.get::<InterfaceVersionFn>(INTERFACE_VERSION_SYMBOL) }
        {
            let backend_version = unsafe { version() };
            if backend_version != INTERFACE_ABI_VERSION {
                return Err(InterfaceError::VersionMismatch {
                    host: INTERFACE_ABI_VERSION,
                    backend: backend_version,
                });
            }
        }

        let iface = unsafe { init() };
        if iface.is_null() {
            return Err(InterfaceError::Init(format!(
                "{}: init_interface returned null",
                path.display()
            )));
        }

        drop(init);
        info!(path = %path.display(), "loaded process interface");
        self.backend = Some(Backend::Plugin(PluginBackend {
            library,
            iface,
            path: path.to_path_buf(),
        }));
        Ok(())
    }

    /// Shuts down and releases the current backend. Unloading with no
    /// backend loaded is a no-op; an attached process is detached first.
    pub fn unload(&mut self) -> IfaceResult<()> {
        if self.backend.is_none() {
            return Ok(());
        }
        if self.context.is_attached() {
            self.detach()?;
        }
        match self.backend.take() {
            Some(Backend::Plugin(plugin)) => {
                let shutdown: libloading::Symbol<ShutdownInterfaceFn> = unsafe {
                    plugin
                        .library
                        .get(SHUTDOWN_INTERFACE_SYMBOL)
                        .map_err(|_| InterfaceError::Symbol("shutdown_interface".into()))?
                };
                unsafe { shutdown() };
                info!(path = %plugin.path.display(), "unloaded process interface");
                // `library` drops here, after the instance is gone.
            }
            Some(Backend::Native(_)) | None => {}
        }
        Ok(())
    }

    fn backend_mut(&mut self) -> IfaceResult<&mut dyn ProcessInterface> {
        match self.backend.as_mut().ok_or(InterfaceError::NotLoaded)? {
            Backend::Native(iface) => Ok(iface.as_mut()),
            Backend::Plugin(plugin) => {
                let boxed = unsafe { &mut *plugin.iface };
                Ok(boxed.0.as_mut())
            }
        }
    }

    /// Splits the borrow so context state and backend calls can be combined.
    fn context_and_backend(
        &mut self,
    ) -> IfaceResult<(&mut ProcessContext, &mut dyn ProcessInterface)> {
        let iface = match self.backend.as_mut().ok_or(InterfaceError::NotLoaded)? {
            Backend::Native(iface) => iface.as_mut(),
            Backend::Plugin(plugin) => {
                let boxed = unsafe { &mut *plugin.iface };
                boxed.0.as_mut()
            }
        };
        Ok((&mut self.context, iface))
    }

    pub fn interface_description(&mut self) -> IfaceResult<String> {
        Ok(self.backend_mut()?.interface_description())
    }

    /// Current process snapshot, with the host's own pid filtered out.
    pub fn get_processes(&mut self) -> IfaceResult<NativeProcessMap> {
        let filter = std::iter::once(std::process::id()).collect();
        self.backend_mut()?.get_processes(&filter)
    }

    pub fn attach(&mut self, pid: u32, name: impl Into<String>) -> IfaceResult<()> {
        let (context, iface) = self.context_and_backend()?;
        context.attach(iface, pid, name)
    }

    pub fn detach(&mut self) -> IfaceResult<()> {
        let (context, iface) = self.context_and_backend()?;
        context.detach(iface)
    }

    pub fn read_memory(&mut self, address: u64, buffer: &mut [u8]) -> IfaceResult<usize> {
        let (context, iface) = self.context_and_backend()?;
        if !context.is_attached() {
            return Err(InterfaceError::NotAttached);
        }
        iface.read_process_memory(context.handle, address, buffer)
    }

    pub fn write_memory(&mut self, address: u64, buffer: &[u8]) -> IfaceResult<usize> {
        let (context, iface) = self.context_and_backend()?;
        if !context.is_attached() {
            return Err(InterfaceError::NotAttached);
        }
        iface.write_process_memory(context.handle, address, buffer)
    }

    /// Pointer-chain hops from `address`, bounded by configuration.
    pub fn get_indirections(&mut self, address: u64) -> IfaceResult<Vec<u64>> {
        let max_hops = self.config.introspection.max_indirections;
        let (context, iface) = self.context_and_backend()?;
        if !context.is_attached() {
            return Err(InterfaceError::NotAttached);
        }
        Ok(context.get_indirections_for_address(iface, address, max_hops))
    }

    /// RTTI class hierarchy for the object at `address`, if it carries one.
    pub fn get_object_hierarchy(&mut self, address: u64) -> IfaceResult<Option<String>> {
        let introspection = self.config.introspection.clone();
        let (context, iface) = self.context_and_backend()?;
        if !context.is_attached() {
            return Err(InterfaceError::NotAttached);
        }
        Ok(rtti::read_object_hierarchy(
            context,
            iface,
            &introspection,
            address,
        ))
    }
}

impl Drop for InterfaceHost {
    fn drop(&mut self) {
        if let Err(err) = self.unload() {
            warn!(%err, "backend teardown failed");
        }
    }
}
