//! MSVC RTTI name recovery.
//!
//! Starting from an object pointer, follows vtable → complete object locator
//! → type descriptor / class hierarchy descriptor and renders the class name
//! with its bases, e.g. `game::Enemy: game::Actor`. All pointers are
//! validated against the attached context before dereferencing; any broken
//! link yields `None` rather than an error, since most candidate pointers
//! simply are not polymorphic objects.
//!
//! On 64-bit targets the RTTI records hold image-relative offsets and the
//! locator carries its own offset, from which the module base is recovered.
//! On 32-bit targets the records hold absolute addresses.

use crate::config::IntrospectionConfig;
use crate::core::types::IfaceResult;
use crate::host::context::ProcessContext;
use crate::iface::ProcessInterface;

// Field offsets inside _RTTICompleteObjectLocator.
const COL_SIGNATURE: u64 = 0x00;
const COL_TYPE_DESCRIPTOR: u64 = 0x0C;
const COL_CLASS_DESCRIPTOR: u64 = 0x10;
const COL_SELF: u64 = 0x14;

// _RTTIClassHierarchyDescriptor.
const CHD_NUM_BASE_CLASSES: u64 = 0x08;
const CHD_BASE_CLASS_ARRAY: u64 = 0x0C;

// TypeDescriptor name offset past the vtable pointer and spare slot.
const TD_NAME_64: u64 = 0x10;
const TD_NAME_32: u64 = 0x08;

/// Reads the RTTI class hierarchy for the object at `object_address`.
/// Returns the demangled names joined by `": "`, most derived first, or
/// `None` when the object does not carry usable RTTI.
pub fn read_object_hierarchy(
    ctx: &ProcessContext,
    iface: &mut dyn ProcessInterface,
    config: &IntrospectionConfig,
    object_address: u64,
) -> Option<String> {
    let vtable = read_pointer(ctx, iface, object_address)?;
    if !ctx.is_valid_address(vtable) {
        return None;
    }

    let locator = read_pointer(ctx, iface, vtable - ctx.pointer_size() as u64)?;
    if !ctx.is_valid_address(locator) {
        return None;
    }

    // 64-bit locators are self-describing (signature 1), 32-bit ones are not.
    let signature = read_u32(ctx, iface, locator + COL_SIGNATURE)?;
    let expected = if ctx.is_64_bit { 1 } else { 0 };
    if signature != expected {
        return None;
    }

    // Image-relative records need the module base, recovered from the
    // locator's offset to itself.
    let image_base = if ctx.is_64_bit {
        let self_offset = read_u32(ctx, iface, locator + COL_SELF)? as u64;
        locator.checked_sub(self_offset)?
    } else {
        0
    };
    let resolve = |offset: u32| -> Option<u64> {
        let address = image_base.checked_add(offset as u64)?;
        ctx.is_valid_address(address).then_some(address)
    };

    let type_descriptor = resolve(read_u32(ctx, iface, locator + COL_TYPE_DESCRIPTOR)?)?;
    let class_descriptor = resolve(read_u32(ctx, iface, locator + COL_CLASS_DESCRIPTOR)?)?;

    let name_offset = if ctx.is_64_bit { TD_NAME_64 } else { TD_NAME_32 };
    let mut names = vec![read_type_name(ctx, iface, config, type_descriptor + name_offset)?];

    let base_count = read_u32(ctx, iface, class_descriptor + CHD_NUM_BASE_CLASSES)?;
    if base_count > 1 {
        let array = resolve(read_u32(ctx, iface, class_descriptor + CHD_BASE_CLASS_ARRAY)?)?;
        // Entry 0 repeats the class itself.
        for index in 1..base_count.min(64) {
            let Some(descriptor) = resolve(read_u32(ctx, iface, array + index as u64 * 4)?) else {
                break;
            };
            // A base class descriptor opens with its type descriptor link.
            let Some(base_type) = resolve(read_u32(ctx, iface, descriptor)?) else {
                break;
            };
            match read_type_name(ctx, iface, config, base_type + name_offset) {
                Some(name) => names.push(name),
                None => break,
            }
        }
    }

    Some(names.join(": "))
}

fn read_pointer(
    ctx: &ProcessContext,
    iface: &mut dyn ProcessInterface,
    address: u64,
) -> Option<u64> {
    if !ctx.is_valid_address(address) {
        return None;
    }
    let mut raw = [0u8; 8];
    let size = ctx.pointer_size();
    match iface.read_process_memory(ctx.handle, address, &mut raw[..size]) {
        Ok(read) if read == size => {}
        _ => return None,
    }
    Some(if ctx.is_64_bit {
        u64::from_le_bytes(raw)
    } else {
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
    })
}

fn read_u32(ctx: &ProcessContext, iface: &mut dyn ProcessInterface, address: u64) -> Option<u32> {
    if !ctx.is_valid_address(address) {
        return None;
    }
    let mut raw = [0u8; 4];
    match iface.read_process_memory(ctx.handle, address, &mut raw) {
        Ok(4) => Some(u32::from_le_bytes(raw)),
        _ => None,
    }
}

fn read_type_name(
    ctx: &ProcessContext,
    iface: &mut dyn ProcessInterface,
    config: &IntrospectionConfig,
    name_address: u64,
) -> Option<String> {
    let raw = read_remote_cstring(ctx, iface, name_address, config).ok()??;
    Some(demangle_type_name(&raw))
}

/// Reads a NUL-terminated string in chunks, bounded by the configured
/// maximum length. Returns `Ok(None)` when no terminator shows up in range.
fn read_remote_cstring(
    ctx: &ProcessContext,
    iface: &mut dyn ProcessInterface,
    address: u64,
    config: &IntrospectionConfig,
) -> IfaceResult<Option<String>> {
    let mut collected = Vec::new();
    let mut cursor = address;
    while collected.len() < config.rtti_max_name_len {
        if !ctx.is_valid_address(cursor) {
            return Ok(None);
        }
        let mut chunk = vec![0u8; config.rtti_name_chunk];
        let read = iface.read_process_memory(ctx.handle, cursor, &mut chunk)?;
        if read == 0 {
            return Ok(None);
        }
        if let Some(nul) = chunk[..read].iter().position(|&b| b == 0) {
            collected.extend_from_slice(&chunk[..nul]);
            return Ok(Some(String::from_utf8_lossy(&collected).into_owned()));
        }
        collected.extend_from_slice(&chunk[..read]);
        cursor += read as u64;
    }
    Ok(None)
}

/// Decodes the simple class/struct shapes of an MSVC decorated type name,
/// `.?AVEnemy@game@@` → `game::Enemy`. Template and pointer shapes come back
/// verbatim.
pub fn demangle_type_name(mangled: &str) -> String {
    let Some(rest) = mangled
        .strip_prefix(".?AV")
        .or_else(|| mangled.strip_prefix(".?AU"))
    else {
        return mangled.to_string();
    };
    let Some(rest) = rest.strip_suffix("@@") else {
        return mangled.to_string();
    };
    if rest.contains(['?', '$', '@']) && rest.split('@').any(|part| part.is_empty()) {
        return mangled.to_string();
    }
    if rest.contains(['?', '$']) {
        return mangled.to_string();
    }
    rest.split('@').rev().collect::<Vec<_>>().join("::")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::MockInterface;

    const BASE: u64 = MockInterface::IMAGE_BASE;

    fn config() -> IntrospectionConfig {
        IntrospectionConfig::default()
    }

    /// Lays out an object + vtable + RTTI records inside the mock, with all
    /// record offsets image-relative to `BASE`.
    fn build_rtti_64(iface: &mut MockInterface, names: &[&str]) -> u64 {
        let object = BASE + 0x1000;
        let vtable = BASE + 0x2000;
        let locator = BASE + 0x3000;
        let chd = BASE + 0x5000;
        let bca = BASE + 0x6000;

        iface.poke_u64(object, vtable);
        iface.poke_u64(vtable - 8, locator);

        iface.poke_u32(locator + COL_SIGNATURE, 1);
        iface.poke_u32(locator + COL_TYPE_DESCRIPTOR, 0x4000);
        iface.poke_u32(locator + COL_CLASS_DESCRIPTOR, (chd - BASE) as u32);
        iface.poke_u32(locator + COL_SELF, (locator - BASE) as u32);

        iface.poke_u32(chd + CHD_NUM_BASE_CLASSES, names.len() as u32);
        iface.poke_u32(chd + CHD_BASE_CLASS_ARRAY, (bca - BASE) as u32);

        for (i, name) in names.iter().enumerate() {
            let td = BASE + 0x4000 + i as u64 * 0x100;
            let bcd = BASE + 0x7000 + i as u64 * 0x40;
            iface.poke_bytes(td + TD_NAME_64, name.as_bytes());
            iface.poke_u32(bcd, (td - BASE) as u32);
            iface.poke_u32(bca + i as u64 * 4, (bcd - BASE) as u32);
        }
        object
    }

    fn attached(iface: &mut MockInterface) -> ProcessContext {
        let mut ctx = ProcessContext::default();
        ctx.attach(iface, MockInterface::PID, "target.exe").unwrap();
        ctx
    }

    #[test]
    fn recovers_single_class_name() {
        let mut iface = MockInterface::default();
        let object = build_rtti_64(&mut iface, &[".?AVEnemy@game@@"]);
        let ctx = attached(&mut iface);

        let name = read_object_hierarchy(&ctx, &mut iface, &config(), object);
        assert_eq!(name.as_deref(), Some("game::Enemy"));
    }

    #[test]
    fn recovers_base_class_chain() {
        let mut iface = MockInterface::default();
        let object = build_rtti_64(
            &mut iface,
            &[".?AVEnemy@game@@", ".?AVActor@game@@", ".?AUObject@@"],
        );
        let ctx = attached(&mut iface);

        let name = read_object_hierarchy(&ctx, &mut iface, &config(), object);
        assert_eq!(
            name.as_deref(),
            Some("game::Enemy: game::Actor: Object")
        );
    }

    #[test]
    fn plain_data_is_not_an_object() {
        let mut iface = MockInterface::default();
        iface.poke_u64(BASE + 0x1000, 0xDEAD); // not a valid vtable pointer
        let ctx = attached(&mut iface);

        assert_eq!(
            read_object_hierarchy(&ctx, &mut iface, &config(), BASE + 0x1000),
            None
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut iface = MockInterface::default();
        let object = build_rtti_64(&mut iface, &[".?AVEnemy@game@@"]);
        iface.poke_u32(BASE + 0x3000 + COL_SIGNATURE, 7);
        let ctx = attached(&mut iface);

        assert_eq!(
            read_object_hierarchy(&ctx, &mut iface, &config(), object),
            None
        );
    }

    #[test]
    fn demangler_shapes() {
        assert_eq!(demangle_type_name(".?AVEnemy@game@@"), "game::Enemy");
        assert_eq!(demangle_type_name(".?AUVec3@math@engine@@"), "engine::math::Vec3");
        assert_eq!(demangle_type_name(".?AVObject@@"), "Object");
        // Templates come back verbatim.
        assert_eq!(
            demangle_type_name(".?AV?$vector@H@std@@"),
            ".?AV?$vector@H@std@@"
        );
        // Non-RTTI payloads pass through untouched.
        assert_eq!(demangle_type_name("hello"), "hello");
    }
}
