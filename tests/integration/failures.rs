use shuttle_core::ConfirmResult;
use shuttle_services::{SessionError, SessionOutcome};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Failure paths — nothing may be left behind on the client
// ══════════════════════════════════════════════════════════════════════════════

/// A path that does not exist ends with FILE_NOT_FOUND and no output file.
#[tokio::test]
async fn test_missing_file_reports_not_found() {
    let out = scratch_dir("missing-out");
    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let mut reports = server.reports();

    let err = fetch(
        server.addr,
        "/nonexistent/shuttle/missing.bin",
        receiver_settings(&out),
    )
    .await
    .expect_err("transfer should fail");

    assert!(
        matches!(err, SessionError::ContentNotFound(ref p) if p == "/nonexistent/shuttle/missing.bin"),
        "unexpected error: {err}"
    );
    assert!(!out.join("missing.bin.copy").exists());

    let session = next_report(&mut reports).await;
    assert_eq!(
        session.outcome,
        SessionOutcome::Failed(ConfirmResult::FileNotFound)
    );

    let _ = std::fs::remove_dir_all(&out);
}

/// Directories are not servable content.
#[tokio::test]
async fn test_directory_request_reports_not_found() {
    let dir = scratch_dir("dir-src");
    let out = scratch_dir("dir-out");
    let server = TestServer::start(worker_settings(128)).await.unwrap();

    let err = fetch(server.addr, &path_str(&dir), receiver_settings(&out))
        .await
        .expect_err("transfer should fail");
    assert!(matches!(err, SessionError::ContentNotFound(_)), "{err}");

    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::remove_dir_all(&out);
}

/// Escaping the serve root is indistinguishable from a missing file.
#[tokio::test]
async fn test_path_outside_serve_root_is_refused() {
    let root = scratch_dir("confined-root");
    let outside = scratch_dir("confined-outside");
    let out = scratch_dir("confined-out");
    std::fs::write(outside.join("secret.txt"), b"secret").unwrap();

    let mut settings = worker_settings(128);
    settings.serve_root = Some(root.clone());
    let server = TestServer::start(settings).await.unwrap();

    let escape = format!(
        "../{}/secret.txt",
        outside.file_name().unwrap().to_string_lossy()
    );
    let err = fetch(server.addr, &escape, receiver_settings(&out))
        .await
        .expect_err("transfer should fail");
    assert!(matches!(err, SessionError::ContentNotFound(_)), "{err}");
    assert!(!out.join("secret.txt.copy").exists());

    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&outside);
    let _ = std::fs::remove_dir_all(&out);
}

/// No server at all: the receiver gives up after its stall budget.
#[tokio::test]
async fn test_unreachable_server_times_out() {
    let out = scratch_dir("unreachable-out");

    // Bind then drop to get a port nobody is listening on.
    let addr = {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let mut settings = receiver_settings(&out);
    settings.retransmit_timeout = Duration::from_millis(100);
    settings.max_stalls = 3;

    let err = fetch(addr, "/whatever.bin", settings)
        .await
        .expect_err("transfer should fail");
    assert!(matches!(err, SessionError::SessionTimeout(_)), "{err}");
    assert!(!out.join("whatever.bin.copy").exists());

    let _ = std::fs::remove_dir_all(&out);
}

/// A client that vanishes mid-transfer is dropped after the idle timeout.
#[tokio::test]
async fn test_abandoned_session_times_out_on_server() {
    let src = scratch_dir("abandon-src");
    let file = src.join("abandon.bin");
    std::fs::write(&file, pattern(1000)).unwrap();

    let mut settings = worker_settings(128);
    settings.idle_timeout = Duration::from_millis(300);
    let server = TestServer::start(settings).await.unwrap();
    let mut reports = server.reports();

    // Ask for the file, read the first chunk, never acknowledge.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = shuttle_core::Message::from(shuttle_core::RequestFile {
        path: path_str(&file),
    })
    .encode()
    .unwrap();
    client.send_to(&request, server.addr).await.unwrap();
    let mut buf = [0u8; 2048];
    tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("first chunk")
        .unwrap();

    let session = next_report(&mut reports).await;
    assert_eq!(session.outcome, SessionOutcome::TimedOut);
    assert!(server.registry.is_empty());

    let _ = std::fs::remove_dir_all(&src);
}
