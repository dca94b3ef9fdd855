mod common;

use common::{cma_device, host_device};
use std::sync::Arc;
use v3d_gem::{DeviceConfig, V3dError};

#[test]
fn closed_client_keeps_its_memory_until_terminated() {
    let (device, cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();
    let token = file.client_token();
    let obj = file.create_object(0x2000, 0, None).unwrap();
    let client = Arc::clone(file.client());

    file.close();
    assert_eq!(device.awaiting_termination(), [token]);
    assert_eq!(cma.live_regions(0), 1);
    assert_eq!(cma.live_coherent(), 1);
    client.inspect(|mem| {
        assert!(!mem.vmem.clear_entries_on_free());
        assert!(mem.defer_host_release);
        let pte = mem.vmem.page_table().unwrap().entry(obj.hw_addr).unwrap();
        assert!(pte.valid());
        assert_eq!(mem.blocks.blocks(0)[0].allocated(), 0);
    });
    drop(client);

    device.notify_client_terminated(token);
    assert!(device.awaiting_termination().is_empty());
    assert!(device.confirmed_dead().is_empty());
    assert_eq!(cma.live_regions(0), 0);
    assert_eq!(cma.live_coherent(), 0);
}

#[test]
fn termination_before_close_releases_on_close() {
    let (device, cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();
    let token = file.client_token();
    file.create_object(0x1000, 0, None).unwrap();

    device.notify_client_terminated(token);
    assert_eq!(device.confirmed_dead(), [token]);
    assert_eq!(cma.live_regions(0), 1);

    drop(file);
    assert!(device.confirmed_dead().is_empty());
    assert!(device.awaiting_termination().is_empty());
    assert_eq!(cma.live_regions(0), 0);
    assert_eq!(cma.live_coherent(), 0);

    // A repeated notification finds nothing to release.
    device.notify_client_terminated(token);
    assert_eq!(cma.live_regions(0), 0);
    assert_eq!(device.confirmed_dead(), [token]);
}

#[test]
fn repeated_termination_is_recorded_once() {
    let (device, cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();
    let token = file.client_token();
    file.create_object(0x1000, 0, None).unwrap();

    device.notify_client_terminated(token);
    device.notify_client_terminated(token);
    assert_eq!(device.confirmed_dead(), [token]);

    drop(file);
    assert!(device.confirmed_dead().is_empty());
    assert!(device.awaiting_termination().is_empty());
    assert_eq!(cma.live_regions(0), 0);
}

#[test]
fn clients_are_released_independently() {
    let (device, cma) = cma_device(DeviceConfig::new());
    let a = device.open().unwrap();
    let b = device.open().unwrap();
    let (ta, tb) = (a.client_token(), b.client_token());
    assert_ne!(ta, tb);
    a.create_object(0x1000, 0, None).unwrap();
    b.create_object(0x1000, 0, None).unwrap();
    assert_eq!(cma.live_regions(0), 2);

    drop(a);
    drop(b);
    assert_eq!(device.awaiting_termination(), [ta, tb]);

    device.notify_client_terminated(tb);
    assert_eq!(device.awaiting_termination(), [ta]);
    assert_eq!(cma.live_regions(0), 1);

    device.notify_client_terminated(ta);
    assert_eq!(cma.live_regions(0), 0);
}

#[test]
fn clear_on_close_keeps_clearing_entries() {
    let (device, _cma) = cma_device(DeviceConfig::new());
    let file = device.open().unwrap();
    let obj = file.create_object(0x1000, 0, None).unwrap();
    file.set_clear_pagetable_on_close().unwrap();
    let client = Arc::clone(file.client());

    drop(file);
    client.inspect(|mem| {
        assert!(mem.vmem.clear_entries_on_free());
        assert!(!mem.vmem.page_table().unwrap().entry(obj.hw_addr).unwrap().valid());
    });
}

#[test]
fn host_pages_are_parked_until_termination() {
    let (device, _cma, host) = host_device(DeviceConfig::new());
    let file = device.open().unwrap();
    let token = file.client_token();
    file.create_object(0x3000, 0, None).unwrap();
    file.create_object(0x1000, 0, None).unwrap();
    let client = Arc::clone(file.client());

    drop(file);
    assert_eq!(host.live(), 2);
    client.inspect(|mem| assert_eq!(mem.dead_pages.len(), 2));
    drop(client);

    device.notify_client_terminated(token);
    assert_eq!(host.live(), 0);
    assert_eq!(host.bus_bytes_in_use(), 0);
}

#[test]
fn host_pages_of_a_dead_client_go_back_at_close() {
    let (device, _cma, host) = host_device(DeviceConfig::new());
    let file = device.open().unwrap();
    file.create_object(0x1000, 0, None).unwrap();

    device.notify_client_terminated(file.client_token());
    drop(file);
    assert_eq!(host.live(), 0);
}

#[test]
fn first_primary_becomes_master_and_flushes() {
    let (device, cma) = cma_device(DeviceConfig::new());
    let old = device.open().unwrap();
    old.create_object(0x1000, 0, None).unwrap();
    let stale = device.open().unwrap();
    device.notify_client_terminated(stale.client_token());
    drop(old);
    assert_eq!(device.awaiting_termination().len(), 1);
    assert_eq!(device.confirmed_dead().len(), 1);

    let master = device.open_primary().unwrap();
    assert!(master.is_master());
    assert_eq!(device.master(), Some(master.client_token()));
    assert!(device.awaiting_termination().is_empty());
    assert!(device.confirmed_dead().is_empty());
    assert_eq!(cma.live_regions(0), 0);

    // The stale session lost its record, so it now waits like any other.
    let stale_token = stale.client_token();
    drop(stale);
    assert_eq!(device.awaiting_termination(), [stale_token]);

    let second = device.open_primary().unwrap();
    assert!(!second.is_master());
    assert_eq!(device.awaiting_termination(), [stale_token]);

    drop(master);
    assert_eq!(device.master(), None);
    let next = device.open_primary().unwrap();
    assert!(next.is_master());
    assert!(device.awaiting_termination().is_empty());
}

#[test]
fn only_the_master_reports_terminations() {
    let (device, cma) = cma_device(DeviceConfig::new());
    let master = device.open_primary().unwrap();
    let render = device.open().unwrap();
    let victim = device.open().unwrap();
    let token = victim.client_token();
    victim.create_object(0x1000, 0, None).unwrap();
    drop(victim);

    assert!(matches!(
        render.notify_client_terminated(token),
        Err(V3dError::PermissionDenied)
    ));
    assert_eq!(device.awaiting_termination(), [token]);

    master.notify_client_terminated(token).unwrap();
    assert!(device.awaiting_termination().is_empty());
    assert_eq!(cma.live_regions(0), 0);
}

#[test]
fn unload_releases_closed_clients() {
    let (device, cma) = cma_device(DeviceConfig::new());
    let closed = device.open().unwrap();
    closed.create_object(0x1000, 0, None).unwrap();
    drop(closed);
    let open = device.open().unwrap();
    open.create_object(0x1000, 0, None).unwrap();
    assert_eq!(cma.live_regions(0), 2);

    device.unload();
    assert_eq!(cma.live_regions(0), 1);

    drop(open);
    assert_eq!(cma.live_regions(0), 1);
    drop(device);
    assert_eq!(cma.live_regions(0), 0);
    assert_eq!(cma.live_coherent(), 0);
}
