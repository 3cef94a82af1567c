//! Bundled native backends plus the C entry points that expose the
//! platform's backend as a loadable process interface.
//!
//! Building this crate as a `cdylib` yields a shared library the host's
//! plugin loader can pick up like any third-party backend; the same code is
//! also reachable in-process through [`native_interface`].

pub mod elf;
pub mod pe;

#[cfg(unix)]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use linux::UserModeInterface;
#[cfg(windows)]
pub use windows::NativeCoreInterface;

use std::ptr;
use std::sync::Mutex;

use crate::iface::{InterfaceBox, ProcessInterface, INTERFACE_ABI_VERSION};

/// Constructs the backend native to the build platform.
pub fn native_interface() -> impl ProcessInterface {
    #[cfg(unix)]
    {
        UserModeInterface::default()
    }
    #[cfg(windows)]
    {
        NativeCoreInterface::default()
    }
}

// Singleton handed across the plugin boundary. Raw pointers are not Send, so
// the slot newtype carries the marker; the pointer never leaves the process
// and is only dereferenced by the host that received it.
struct InstanceSlot(*mut InterfaceBox);

unsafe impl Send for InstanceSlot {}

// Guarded because a host may probe entry points from any thread.
static INSTANCE: Mutex<InstanceSlot> = Mutex::new(InstanceSlot(ptr::null_mut()));

/// Plugin entry point. Idempotent: a second call returns the same instance.
#[no_mangle]
pub extern "C" fn init_interface() -> *mut InterfaceBox {
    let Ok(mut slot) = INSTANCE.lock() else {
        return ptr::null_mut();
    };
    if slot.0.is_null() {
        slot.0 = InterfaceBox::new(native_interface()).into_raw();
    }
    slot.0
}

/// Plugin exit point. Destroys the singleton; `init_interface` may be called
/// again afterwards. Calling it without a live instance is a no-op.
#[no_mangle]
pub extern "C" fn shutdown_interface() {
    let Ok(mut slot) = INSTANCE.lock() else {
        return;
    };
    if !slot.0.is_null() {
        // Reclaim the box created by `into_raw` and drop it.
        drop(unsafe { Box::from_raw(slot.0) });
        slot.0 = ptr::null_mut();
    }
}

/// Reports the ABI version this backend was built against.
#[no_mangle]
pub extern "C" fn interface_version() -> u32 {
    INTERFACE_ABI_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_shutdown_resets() {
        let first = init_interface();
        assert!(!first.is_null());
        assert_eq!(first, init_interface());

        shutdown_interface();
        shutdown_interface(); // second call is a no-op

        let again = init_interface();
        assert!(!again.is_null());
        shutdown_interface();
    }

    #[test]
    fn version_matches_host() {
        assert_eq!(interface_version(), INTERFACE_ABI_VERSION);
    }
}
