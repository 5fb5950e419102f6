//! Sessions beyond two players: a three-player mesh and an observer.

mod common;

use std::time::Duration;

use serial_test::serial;

use common::*;
use framelock::{Frame, SessionPhase, Side, NUM_SYNC_INPUTS};

/// Three players: the host relays everyone's endpoint, the clients build a
/// full mesh, and all three observe identical inputs for all three sides.
#[test]
#[serial]
fn three_player_mesh_stays_in_lockstep() {
    let host = start_host(3, reference_state(), None);
    let client_b = start_client(host.addr, "B", reference_state(), None);
    let client_c = start_client(host.addr, "C", reference_state(), None);

    host.session.notify_io_ready();
    client_b.session.notify_io_ready();
    client_c.session.notify_io_ready();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while host.session.phase() != SessionPhase::Ready {
        assert!(std::time::Instant::now() < deadline, "roster never filled");
        std::thread::sleep(Duration::from_millis(5));
    }
    host.session.confirm_start(3).unwrap();

    let drives = [
        drive_frames(host.session.clone(), varying_input(0x0A), 60),
        drive_frames(client_b.session.clone(), varying_input(0x0B), 60),
        drive_frames(client_c.session.clone(), varying_input(0x0C), 60),
    ];
    let results: Vec<_> = drives.into_iter().map(|d| d.join().unwrap()).collect();

    for result in &results {
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.trace.len(), 60);
    }
    assert_eq!(results[0].trace, results[1].trace);
    assert_eq!(results[1].trace, results[2].trace);

    // Sides were assigned in join order; each side's first sampled frame
    // (frame 3 at delay 3) carries its owner's salt byte.
    let sides_seen: Vec<u8> = (0..3).map(|side| results[0].trace[3][side][0]).collect();
    assert_eq!(sides_seen[0], 0x0A, "host owns side 0");
    assert!(sides_seen.contains(&0x0B));
    assert!(sides_seen.contains(&0x0C));

    host.session.cancel();
    client_b.session.wait_for_exit(Duration::from_secs(5));
    client_c.session.wait_for_exit(Duration::from_secs(5));
}

/// An observer joins without occupying a side, publishes nothing, and still
/// sees the players' input stream.
#[test]
#[serial]
fn observer_receives_without_publishing() {
    let host = start_host(2, reference_state(), None);
    let client = start_client(host.addr, "B", reference_state(), None);
    let observer = start_observer(host.addr, reference_state());

    host.session.notify_io_ready();
    client.session.notify_io_ready();
    observer.session.notify_io_ready();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while host.session.phase() != SessionPhase::Ready
        || observer.session.phase() != SessionPhase::Ready
    {
        assert!(std::time::Instant::now() < deadline, "lobby never formed");
        std::thread::sleep(Duration::from_millis(5));
    }
    host.session.confirm_start(2).unwrap();

    assert!(observer.session.wait_running(Duration::from_secs(10)));
    assert_eq!(observer.session.local_side(), None);
    assert_eq!(observer.session.num_players(), 2);

    let host_drive = drive_frames(host.session.clone(), constant_input(0xAB), 20);
    let client_drive = drive_frames(client.session.clone(), constant_input(0xCD), 20);
    let observer_drive = drive_frames(observer.session.clone(), constant_input(0), 20);

    let host_result = host_drive.join().unwrap();
    let client_result = client_drive.join().unwrap();
    let observer_result = observer_drive.join().unwrap();

    assert!(observer_result.error.is_none(), "{:?}", observer_result.error);
    assert_eq!(observer_result.trace.len(), 20);
    assert_eq!(observer_result.trace, host_result.trace);
    assert_eq!(observer_result.trace, client_result.trace);

    // Frame 2 (delay 2): first sampled inputs, observed identically.
    assert_eq!(observer_result.trace[2][0][0], 0xAB);
    assert_eq!(observer_result.trace[2][1][0], 0xCD);
    assert_eq!(observer.session.sim_frame(), Frame::new(20));

    // Observers have no input slot to publish into.
    let publish = observer.session.publish_local([0; NUM_SYNC_INPUTS]);
    assert!(publish.is_err());
    assert_eq!(observer.session.local_side(), None);
    assert_ne!(host.session.local_side(), Some(Side::new(1)));

    host.session.cancel();
    client.session.wait_for_exit(Duration::from_secs(5));
    observer.session.wait_for_exit(Duration::from_secs(5));
}
