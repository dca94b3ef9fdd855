mod common;

use common::cma_device;
use std::sync::Arc;
use v3d_gem::DeviceConfig;
use v3d_gem::gem::registry;

// The registry is process wide, so everything touching it lives in one test.
#[test]
fn termination_reaches_the_registered_device() {
    assert!(registry::registered().is_none());
    assert!(!registry::notify_client_terminated(0x1234));

    let (device, cma) = cma_device(DeviceConfig::new());
    registry::register(&device);
    assert!(registry::registered().is_some_and(|d| Arc::ptr_eq(&d, &device)));

    let file = device.open().unwrap();
    let token = file.client_token();
    file.create_object(0x1000, 0, None).unwrap();
    drop(file);
    assert_eq!(cma.live_regions(0), 1);

    assert!(registry::notify_client_terminated(token));
    assert_eq!(cma.live_regions(0), 0);

    // Unregistering another device leaves the registration alone.
    let (other, _) = cma_device(DeviceConfig::new());
    registry::unregister(&other);
    assert!(registry::registered().is_some());

    device.unload();
    assert!(registry::registered().is_none());
    assert!(!registry::notify_client_terminated(token));

    // The registry does not keep a device alive.
    registry::register(&other);
    drop(other);
    assert!(registry::registered().is_none());
}
