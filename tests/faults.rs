//! Failure-path scenarios: snapshot mismatch, packet loss, peer loss, join
//! timeout.

mod common;

use std::time::{Duration, Instant};

use serial_test::serial;

use common::*;
use framelock::{ChaosConfig, DatagramSocket, ExitReason, Frame, SessionPhase, SyncState};

/// A client whose snapshot differs in the BIOS version only is rejected;
/// the client surfaces "Bios version mismatch" and ends with a sync
/// mismatch.
#[test]
#[serial]
fn bios_mismatch_rejected() {
    let host = start_host(2, reference_state(), None);
    let wrong_bios = SyncState::new("USA v01.60(07/02/2002)", "SLES-52563");
    let client = start_client(host.addr, "B", wrong_bios, None);

    host.session.notify_io_ready();
    client.session.notify_io_ready();

    let exit = client.session.wait_for_exit(Duration::from_secs(10));
    assert!(
        matches!(exit, Some(ExitReason::SyncMismatch(_))),
        "unexpected exit: {exit:?}"
    );
    assert!(
        client.status.contains("Bios version mismatch"),
        "status lines: {:?}",
        client.status.lines()
    );
    // The host also logs the mismatch and keeps waiting for players.
    assert!(host.status.contains("Bios version mismatch"));
    assert_eq!(host.session.phase(), SessionPhase::Advertising);

    host.session.cancel();
    assert_eq!(host.session.phase(), SessionPhase::Cancelled);
}

/// Under 25% injected loss on both endpoints, a delay-5 session still
/// completes 600 frames in lock-step without a single input timeout, and
/// the reliability layer visibly retransmitted.
#[test]
#[serial]
fn packet_loss_burst_still_completes() {
    let lossy = |seed| {
        ChaosConfig::builder()
            .loss_rate(0.25)
            .seed(seed)
            .build()
    };
    let host = start_host(2, reference_state(), Some(lossy(42)));
    let client = start_client(host.addr, "B", reference_state(), Some(lossy(43)));

    host.session.notify_io_ready();
    client.session.notify_io_ready();

    let deadline = Instant::now() + Duration::from_secs(20);
    while host.session.phase() != SessionPhase::Ready {
        assert!(
            Instant::now() < deadline,
            "lobby never formed under loss; host={:?} client={:?}",
            host.session.phase(),
            client.session.phase()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    host.session.confirm_start(5).unwrap();

    let host_drive = drive_frames(host.session.clone(), varying_input(0xA0), 600);
    let client_drive = drive_frames(client.session.clone(), varying_input(0xB0), 600);

    // A little reliable chatter so retransmission is observable on the
    // reliable path too, not just the input window.
    for i in 0..10 {
        let _ = host.session.send_chat(&format!("ping {i}"));
        std::thread::sleep(Duration::from_millis(20));
    }

    let host_result = host_drive.join().unwrap();
    let client_result = client_drive.join().unwrap();

    assert!(host_result.error.is_none(), "{:?}", host_result.error);
    assert!(client_result.error.is_none(), "{:?}", client_result.error);
    assert_eq!(host_result.trace.len(), 600);
    // No desync: every frame of every side matched on both ends.
    assert_eq!(host_result.trace, client_result.trace);

    let dropped = host.chaos.as_ref().unwrap().stats().dropped
        + client.chaos.as_ref().unwrap().stats().dropped;
    assert!(dropped > 0, "chaos layer never dropped anything");
    assert!(
        host.session.retransmit_count() + client.session.retransmit_count() > 0,
        "no reliable retransmissions under 25% loss"
    );

    host.session.cancel();
    client.session.wait_for_exit(Duration::from_secs(5));
}

/// A client that silently stops transmitting mid-run: the host must reach
/// Ended with PeerTimeout shortly after the silence threshold, reporting
/// the frame it was blocked on.
#[test]
#[serial]
fn peer_disappearance_times_out() {
    let host = start_host(2, reference_state(), None);
    let client = start_client(
        host.addr,
        "B",
        reference_state(),
        Some(ChaosConfig::builder().seed(7).build()),
    );

    host.session.notify_io_ready();
    client.session.notify_io_ready();

    let deadline = Instant::now() + Duration::from_secs(10);
    while host.session.phase() != SessionPhase::Ready {
        assert!(Instant::now() < deadline, "roster never filled");
        std::thread::sleep(Duration::from_millis(5));
    }
    host.session.confirm_start(2).unwrap();

    let host_drive = drive_frames(host.session.clone(), constant_input(0x01), 100_000);
    let client_drive = drive_frames(client.session.clone(), constant_input(0x02), 100_000);

    while host.session.sim_frame() < Frame::new(50) {
        assert!(!host.session.end_requested(), "died before the blackout");
        std::thread::sleep(Duration::from_millis(2));
    }

    // The client goes dark: every datagram it sends is now dropped.
    let blackout_at = Instant::now();
    client.chaos.as_ref().unwrap().set_loss_rate(1.0);

    let host_result = host_drive.join().unwrap();
    let elapsed = blackout_at.elapsed();

    let exit = host.session.exit_reason();
    let Some(ExitReason::PeerTimeout { frame }) = exit else {
        panic!("expected PeerTimeout, got {exit:?}");
    };
    // Detection lands within the silence window plus scheduling slack
    // (1.5s threshold under the test tuning).
    assert!(
        elapsed >= Duration::from_millis(1400) && elapsed < Duration::from_secs(6),
        "detected after {elapsed:?}"
    );
    // The reported frame is where the host's frame loop was blocked.
    let blocked_frame = Frame::new(host_result.trace.len() as u32);
    assert_eq!(frame, blocked_frame);

    let _ = client_drive.join().unwrap();
}

/// Joining an endpoint nobody answers fails with JoinTimeout.
#[test]
#[serial]
fn join_timeout_when_host_absent() {
    // Bind a port and drop it so nothing is listening there.
    let dead_port = {
        let endpoint = framelock::UdpEndpoint::bind(0).unwrap();
        endpoint.local_addr().unwrap().port()
    };

    let client = start_client(loopback(dead_port), "B", reference_state(), None);
    client.session.notify_io_ready();

    let start = Instant::now();
    let exit = client.session.wait_for_exit(Duration::from_secs(10));
    assert_eq!(exit, Some(ExitReason::JoinTimeout));
    // Fast tuning sets the join timeout to 2s.
    assert!(start.elapsed() >= Duration::from_millis(1900));
    assert!(start.elapsed() < Duration::from_secs(8));
}
