//! Attach/detach lifecycle and introspection through the host facade.

use structshaper_core::config::Config;
use structshaper_core::host::testing::MockInterface;
use structshaper_core::host::InterfaceHost;
use structshaper_core::{InterfaceError, ProcessContext};

fn mock_host() -> InterfaceHost {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let mut host = InterfaceHost::new(Config::default());
    host.adopt(Box::new(MockInterface::default())).unwrap();
    host
}

#[test]
fn attach_then_detach_restores_the_default_context() {
    let mut host = mock_host();
    host.attach(MockInterface::PID, "target.exe").unwrap();
    assert!(host.context.is_attached());
    assert!(!host.context.modules.is_empty());

    host.detach().unwrap();
    assert_eq!(host.context, ProcessContext::default());
}

#[test]
fn detaching_twice_is_harmless() {
    let mut host = mock_host();
    host.attach(MockInterface::PID, "target.exe").unwrap();
    host.detach().unwrap();
    host.detach().unwrap();
    assert_eq!(host.context, ProcessContext::default());
}

#[test]
fn memory_io_requires_attachment() {
    let mut host = mock_host();
    let mut buffer = [0u8; 8];
    assert!(matches!(
        host.read_memory(MockInterface::IMAGE_BASE, &mut buffer),
        Err(InterfaceError::NotAttached)
    ));

    host.attach(MockInterface::PID, "target.exe").unwrap();
    host.write_memory(MockInterface::IMAGE_BASE, &[1, 2, 3, 4])
        .unwrap();
    let read = host
        .read_memory(MockInterface::IMAGE_BASE, &mut buffer)
        .unwrap();
    assert_eq!(read, 8);
    assert_eq!(&buffer[..4], &[1, 2, 3, 4]);
}

#[test]
fn module_lookup_respects_range_boundaries() {
    let mut host = mock_host();
    host.attach(MockInterface::PID, "target.exe").unwrap();

    let base = MockInterface::IMAGE_BASE;
    let end = base + MockInterface::MODULE_SIZE;
    let ctx = &host.context;

    assert!(ctx.get_module_from_address(base).is_some());
    assert!(ctx.get_module_from_address(end - 1).is_some());
    assert!(ctx.get_module_from_address(end).is_none());
    assert!(ctx.get_module_from_address(base - 1).is_none());
}

#[test]
fn pointer_chains_are_bounded_by_config() {
    let mut config = Config::default();
    config.introspection.max_indirections = 2;

    let mut iface = MockInterface::default();
    let base = MockInterface::IMAGE_BASE;
    iface.poke_u64(base, base); // self-loop

    let mut host = InterfaceHost::new(config);
    host.adopt(Box::new(iface)).unwrap();
    host.attach(MockInterface::PID, "target.exe").unwrap();

    let hops = host.get_indirections(base).unwrap();
    assert_eq!(hops.len(), 2);
}

#[test]
fn rtti_walk_through_the_host() {
    let mut iface = MockInterface::default();
    let base = MockInterface::IMAGE_BASE;

    // Object -> vtable -> locator -> descriptors, image-relative offsets.
    let (object, vtable, locator) = (base + 0x1000, base + 0x2000, base + 0x3000);
    iface.poke_u64(object, vtable);
    iface.poke_u64(vtable - 8, locator);
    iface.poke_u32(locator, 1);
    iface.poke_u32(locator + 0x0C, 0x4000);
    iface.poke_u32(locator + 0x10, 0x5000);
    iface.poke_u32(locator + 0x14, 0x3000);
    iface.poke_bytes(base + 0x4010, b".?AVEnemy@game@@\0");
    iface.poke_u32(base + 0x5008, 1);

    let mut host = InterfaceHost::new(Config::default());
    host.adopt(Box::new(iface)).unwrap();
    host.attach(MockInterface::PID, "target.exe").unwrap();

    let name = host.get_object_hierarchy(object).unwrap();
    assert_eq!(name.as_deref(), Some("game::Enemy"));

    // A non-object pointer just yields no name.
    assert_eq!(host.get_object_hierarchy(base + 0x8000).unwrap(), None);
}

#[test]
fn struct_addresses_accept_base_expressions() {
    use structshaper_core::project::field::{Field, FieldKind, PodType};
    use structshaper_core::Project;

    let mut host = mock_host();
    host.attach(MockInterface::PID, "target.exe").unwrap();

    let mut project = Project::new();
    let def = project.add_struct("Entity").unwrap();
    def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
    def.address = host
        .context
        .resolve_address_expression("base+0x40")
        .unwrap();

    assert_eq!(def.address, MockInterface::IMAGE_BASE + 0x40);
}
