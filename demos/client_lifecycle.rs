use std::sync::Arc;
use v3d_gem::config::PageMode;
use v3d_gem::gem::registry;
use v3d_gem::{Device, DeviceConfig, SimulatedCma, V3dResult};

const MIB: u64 = 1024 * 1024;

fn print_client(file: &v3d_gem::DrmFile) {
    println!("  client 0x{:x}", file.client_token());
    for obj in file.objects() {
        println!(
            "    handle {:<3} | {:?} | hw 0x{:08x} | 0x{:x} bytes | {}",
            obj.handle,
            obj.kind,
            obj.hw_addr,
            obj.size,
            obj.description.as_deref().unwrap_or("-")
        );
    }
}

fn main() -> V3dResult<()> {
    let compatible = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "brcm,v3d-v4.1.34.0".to_string());
    let Some(config) = DeviceConfig::for_compatible(&compatible) else {
        eprintln!("unknown device: {compatible}");
        std::process::exit(1);
    };
    let config = config.big_pages();

    let cma = Arc::new(
        SimulatedCma::new()
            .with_controller(0x4000_0000, 32 * MIB)
            .with_controller(0x8000_0000, 32 * MIB),
    );
    let device = Device::load(config, cma.clone());
    registry::register(&device);

    println!("--- V3D device ({compatible}) ---");
    println!("Page size:        {} KiB", PageMode::Big.size() / 1024);
    println!("Controllers:      {}", device.controllers().len());
    println!("Total memory:     {} MiB", device.total_memory() / MIB);

    let master = device.open_primary()?;
    let file = device.open()?;
    let pt = file.pagetable_info()?;
    println!("\nPagetable at 0x{:x} covering {} MiB", pt.pt_phys, pt.va_size / MIB);

    file.create_object(256 * 1024, 0, Some("vertex buffer"))?;
    file.create_object(64 * 1024, 0, Some("uniforms"))?;
    file.create_external_object(0x1000_0200, 0x800, 0, Some("camera frame"))?;
    print_client(&file);

    let token = file.client_token();
    drop(file);
    println!(
        "\nAfter close: {} client(s) awaiting termination, {} block(s) held",
        device.awaiting_termination().len(),
        cma.live_regions(0) + cma.live_regions(1)
    );

    master.notify_client_terminated(token)?;
    println!(
        "After termination: {} client(s) awaiting termination, {} block(s) held",
        device.awaiting_termination().len(),
        cma.live_regions(0) + cma.live_regions(1)
    );

    drop(master);
    device.unload();
    Ok(())
}
