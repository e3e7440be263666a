use std::collections::HashSet;

use shuttle_core::checksum::digest;
use shuttle_services::SessionOutcome;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Gap recovery and session lifecycle
// ══════════════════════════════════════════════════════════════════════════════

/// Dropping the third chunk datagram stalls the receiver; its PACKET_MISS
/// makes the server resend exactly that chunk (offset 256).
#[tokio::test]
async fn test_dropped_chunk_is_resent_once() {
    let src = scratch_dir("gap-src");
    let out = scratch_dir("gap-out");
    let data = pattern(1000);
    let file = src.join("gap.bin");
    std::fs::write(&file, &data).unwrap();

    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let mut reports = server.reports();

    let mut settings = receiver_settings(&out);
    settings.retransmit_timeout = Duration::from_millis(500);
    settings.drop_nth_chunk = Some(3);

    let report = fetch(server.addr, &path_str(&file), settings)
        .await
        .expect("transfer should recover");
    assert_eq!(report.dropped, 1);
    assert_eq!(report.gap_requests, 1);
    assert_eq!(report.checksum, digest(&data));
    assert_eq!(std::fs::read(&report.output).unwrap(), data);

    let session = next_report(&mut reports).await;
    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.resent, vec![256]);

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// Losing the very first chunk (the one carrying the checksum) recovers too.
#[tokio::test]
async fn test_dropped_first_chunk_is_recovered() {
    let src = scratch_dir("first-src");
    let out = scratch_dir("first-out");
    let data = pattern(500);
    let file = src.join("first.bin");
    std::fs::write(&file, &data).unwrap();

    let server = TestServer::start(worker_settings(128)).await.unwrap();

    let mut settings = receiver_settings(&out);
    settings.drop_nth_chunk = Some(1);

    let report = fetch(server.addr, &path_str(&file), settings)
        .await
        .expect("transfer should recover");
    assert_eq!(report.dropped, 1);
    assert_eq!(std::fs::read(&report.output).unwrap(), data);

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// Several clients at once each get their own session and their own file.
#[tokio::test]
async fn test_concurrent_clients() {
    let src = scratch_dir("concurrent-src");
    let out = scratch_dir("concurrent-out");
    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let mut reports = server.reports();

    let mut tasks = Vec::new();
    for n in 0..8usize {
        let data = pattern(700 + n * 97);
        let file = src.join(format!("file-{n}.bin"));
        std::fs::write(&file, &data).unwrap();

        let addr = server.addr;
        let settings = receiver_settings(&out);
        tasks.push(tokio::spawn(async move {
            let report = fetch(addr, &path_str(&file), settings).await?;
            anyhow::ensure!(
                std::fs::read(&report.output)? == data,
                "content mismatch for {}",
                file.display()
            );
            Ok::<_, anyhow::Error>(report)
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("concurrent transfer failed");
    }

    let mut sessions = HashSet::new();
    let mut peers = HashSet::new();
    for _ in 0..8 {
        let session = next_report(&mut reports).await;
        assert_eq!(session.outcome, SessionOutcome::Completed);
        sessions.insert(session.session);
        peers.insert(session.peer);
    }
    assert_eq!(sessions.len(), 8);
    assert_eq!(peers.len(), 8);

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// Once a session completes, the same client address starts a fresh one.
#[tokio::test]
async fn test_same_client_fetches_twice() {
    let src = scratch_dir("twice-src");
    let out = scratch_dir("twice-out");
    let data = pattern(300);
    let file = src.join("twice.bin");
    std::fs::write(&file, &data).unwrap();

    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let mut reports = server.reports();

    let mut receiver = Receiver::connect(
        server.addr,
        Arc::new(FsStore::new()),
        receiver_settings(&out),
    )
    .await
    .unwrap();

    let first = receiver.request_file(&path_str(&file)).await.unwrap();
    let first_session = next_report(&mut reports).await;

    let second = receiver.request_file(&path_str(&file)).await.unwrap();
    let second_session = next_report(&mut reports).await;

    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first_session.peer, second_session.peer);
    assert!(second_session.session > first_session.session);
    assert_eq!(second_session.outcome, SessionOutcome::Completed);
    assert_eq!(std::fs::read(&second.output).unwrap(), data);

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// A client that requests again right after verifying does not wait out a
/// retransmit timeout: the new REQUEST reaches a fresh session even when it
/// queues behind the final checksum confirmation.
#[tokio::test]
async fn test_back_to_back_requests_on_one_socket() {
    let src = scratch_dir("b2b-src");
    let out = scratch_dir("b2b-out");
    let data = pattern(900);
    let file = src.join("b2b.bin");
    std::fs::write(&file, &data).unwrap();

    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let mut reports = server.reports();

    let mut settings = receiver_settings(&out);
    settings.retransmit_timeout = Duration::from_millis(1500);
    let mut receiver = Receiver::connect(server.addr, Arc::new(FsStore::new()), settings)
        .await
        .unwrap();

    receiver.request_file(&path_str(&file)).await.unwrap();
    let started = std::time::Instant::now();
    let second = receiver.request_file(&path_str(&file)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(second.gap_requests, 0);
    assert!(
        elapsed < Duration::from_millis(1000),
        "second transfer waited for a retransmit: {elapsed:?}"
    );
    assert_eq!(std::fs::read(&second.output).unwrap(), data);

    let first_session = next_report(&mut reports).await;
    let second_session = next_report(&mut reports).await;
    assert_eq!(first_session.outcome, SessionOutcome::Completed);
    assert_eq!(second_session.outcome, SessionOutcome::Completed);
    assert!(second_session.session > first_session.session);

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}
