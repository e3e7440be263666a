use shuttle_core::checksum::digest;
use shuttle_services::SessionOutcome;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Happy-path transfers
// ══════════════════════════════════════════════════════════════════════════════

/// 1000 bytes in 128-byte chunks: eight tokens, the last one 104 bytes.
#[tokio::test]
async fn test_small_file_round_trip() {
    let src = scratch_dir("small-src");
    let out = scratch_dir("small-out");
    let data = pattern(1000);
    let file = src.join("small.bin");
    std::fs::write(&file, &data).unwrap();

    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let mut reports = server.reports();

    let report = fetch(server.addr, &path_str(&file), receiver_settings(&out))
        .await
        .expect("transfer should succeed");

    assert_eq!(report.output, out.join("small.bin.copy"));
    assert_eq!(report.tokens, 8);
    assert_eq!(report.bytes, 1000);
    assert_eq!(report.checksum, digest(&data));
    assert_eq!(std::fs::read(&report.output).unwrap(), data);

    let session = next_report(&mut reports).await;
    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.tokens, 8);
    assert_eq!(session.path.as_deref(), Some(path_str(&file).as_str()));

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// Default chunk size, a few hundred round trips.
#[tokio::test]
async fn test_multi_chunk_file_with_default_chunk_size() {
    let src = scratch_dir("large-src");
    let out = scratch_dir("large-out");
    let data = pattern(64 * 1024 + 17);
    let file = src.join("large.bin");
    std::fs::write(&file, &data).unwrap();

    let server = TestServer::start(worker_settings(256)).await.unwrap();
    let report = fetch(server.addr, &path_str(&file), receiver_settings(&out))
        .await
        .expect("transfer should succeed");

    assert_eq!(report.tokens, 257);
    assert_eq!(std::fs::read(&report.output).unwrap(), data);

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// Zero tokens: the server goes straight to the checksum offer.
#[tokio::test]
async fn test_empty_file() {
    let src = scratch_dir("empty-src");
    let out = scratch_dir("empty-out");
    let file = src.join("empty");
    std::fs::write(&file, b"").unwrap();

    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let report = fetch(server.addr, &path_str(&file), receiver_settings(&out))
        .await
        .expect("transfer should succeed");

    assert_eq!(report.tokens, 0);
    assert_eq!(report.checksum, digest(b""));
    assert_eq!(std::fs::read(&report.output).unwrap(), b"");

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// Exactly one full chunk: one token, no short tail.
#[tokio::test]
async fn test_file_of_exactly_one_chunk() {
    let src = scratch_dir("one-src");
    let out = scratch_dir("one-out");
    let data = pattern(128);
    let file = src.join("one.bin");
    std::fs::write(&file, &data).unwrap();

    let server = TestServer::start(worker_settings(128)).await.unwrap();
    let report = fetch(server.addr, &path_str(&file), receiver_settings(&out))
        .await
        .expect("transfer should succeed");

    assert_eq!(report.tokens, 1);
    assert_eq!(std::fs::read(&report.output).unwrap(), data);

    let _ = std::fs::remove_dir_all(&src);
    let _ = std::fs::remove_dir_all(&out);
}

/// With a serve root, paths resolve beneath it.
#[tokio::test]
async fn test_serve_root_resolves_relative_paths() {
    let root = scratch_dir("root");
    let out = scratch_dir("root-out");
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(root.join("docs/readme.txt"), b"served from root").unwrap();

    let mut settings = worker_settings(128);
    settings.serve_root = Some(root.clone());
    let server = TestServer::start(settings).await.unwrap();

    let report = fetch(server.addr, "/docs/readme.txt", receiver_settings(&out))
        .await
        .expect("transfer should succeed");
    assert_eq!(report.output, out.join("readme.txt.copy"));
    assert_eq!(std::fs::read(&report.output).unwrap(), b"served from root");

    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&out);
}
