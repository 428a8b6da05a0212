// tests/http_backend_test.rs

use odc_dl::config::EngineConfig;
use odc_dl::error::AppError;
use odc_dl::transfer::{HttpTransferBackend, JobHandle, TransferBackend, TransferEvent};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;

async fn next_event(rx: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("等待传输事件超时")
        .expect("事件通道被提前关闭")
}

/// 持续接收直到收到终结事件（Finished/Failed），返回它。
async fn drain_to_terminal(rx: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
    loop {
        let event = next_event(rx).await;
        match event {
            TransferEvent::Progress { .. } | TransferEvent::ResumedAt { .. } => continue,
            other => return other,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fresh_download_writes_part_file() {
    // --- Arrange (准备阶段) ---
    let mut server = mockito::Server::new_async().await;
    let body = vec![0x5a_u8; 1024];
    let mock = server
        .mock("GET", "/datasets/letters_01.zip")
        .with_status(200)
        .with_body(&body)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let backend =
        HttpTransferBackend::new(&EngineConfig::for_testing(), dir.path().to_path_buf(), tx)
            .unwrap();

    // --- Act (执行阶段) ---
    backend
        .start(
            JobHandle(1),
            &format!("{}/datasets/letters_01.zip", server.url()),
        )
        .await
        .unwrap();

    // --- Assert (断言阶段) ---
    let mut saw_progress = false;
    let terminal = loop {
        match next_event(&mut rx).await {
            TransferEvent::Progress {
                written,
                total_expected,
                ..
            } => {
                assert!(written <= 1024);
                assert_eq!(total_expected, 1024);
                saw_progress = true;
            }
            other => break other,
        }
    };
    let TransferEvent::Finished { job, temp_path } = terminal else {
        panic!("期望 Finished 事件，实际是 {:?}", terminal);
    };
    assert_eq!(job, JobHandle(1));
    assert!(saw_progress);
    assert_eq!(std::fs::read(&temp_path).unwrap(), body);
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_sends_range_and_appends() {
    // --- Arrange ---
    // 前 100 字节已在磁盘上，服务器应只被要求剩余部分
    let mut server = mockito::Server::new_async().await;
    let tail = vec![0xbb_u8; 156];
    let mock = server
        .mock("GET", "/datasets/part.zip")
        .match_header("range", "bytes=100-")
        .with_status(206)
        .with_body(&tail)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let part = dir.path().join("job-7.part");
    std::fs::write(&part, vec![0xaa_u8; 100]).unwrap();

    let url = format!("{}/datasets/part.zip", server.url());
    let token = serde_json::json!({
        "url": url,
        "temp_path": part,
        "bytes_written": 100,
    });

    let (tx, mut rx) = mpsc::channel(64);
    let backend =
        HttpTransferBackend::new(&EngineConfig::for_testing(), dir.path().to_path_buf(), tx)
            .unwrap();

    // --- Act ---
    backend
        .resume(JobHandle(7), serde_json::to_vec(&token).unwrap())
        .await
        .unwrap();

    // --- Assert ---
    let first = next_event(&mut rx).await;
    assert!(
        matches!(first, TransferEvent::ResumedAt { offset: 100, .. }),
        "期望 ResumedAt 事件，实际是 {:?}",
        first
    );
    let terminal = drain_to_terminal(&mut rx).await;
    let TransferEvent::Finished { temp_path, .. } = terminal else {
        panic!("期望 Finished 事件，实际是 {:?}", terminal);
    };

    // 文件是已有前缀 + 服务器补发的尾部
    let content = std::fs::read(&temp_path).unwrap();
    assert_eq!(content.len(), 256);
    assert!(content[..100].iter().all(|&b| b == 0xaa));
    assert!(content[100..].iter().all(|&b| b == 0xbb));
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_truncates_part_longer_than_token() {
    // --- Arrange ---
    // 取消与写入并发时，分片可能比令牌记录的偏移多出一截；
    // 续传必须先截断到令牌偏移，否则补发区间会被重复追加
    let mut server = mockito::Server::new_async().await;
    let tail = vec![0xbb_u8; 200];
    let mock = server
        .mock("GET", "/datasets/part.zip")
        .match_header("range", "bytes=100-")
        .with_status(206)
        .with_body(&tail)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let part = dir.path().join("job-11.part");
    let mut seeded = vec![0xaa_u8; 100];
    seeded.extend_from_slice(&[0x99_u8; 50]); // 令牌偏移之外的多余尾巴
    std::fs::write(&part, &seeded).unwrap();

    let url = format!("{}/datasets/part.zip", server.url());
    let token = serde_json::json!({
        "url": url,
        "temp_path": part,
        "bytes_written": 100,
    });

    let (tx, mut rx) = mpsc::channel(64);
    let backend =
        HttpTransferBackend::new(&EngineConfig::for_testing(), dir.path().to_path_buf(), tx)
            .unwrap();

    // --- Act ---
    backend
        .resume(JobHandle(11), serde_json::to_vec(&token).unwrap())
        .await
        .unwrap();

    // --- Assert ---
    let terminal = drain_to_terminal(&mut rx).await;
    let TransferEvent::Finished { temp_path, .. } = terminal else {
        panic!("期望 Finished 事件，实际是 {:?}", terminal);
    };
    // 多余的尾巴被丢弃，文件恰好是 100 字节前缀 + 200 字节补发
    let content = std::fs::read(&temp_path).unwrap();
    assert_eq!(content.len(), 300);
    assert!(content[..100].iter().all(|&b| b == 0xaa));
    assert!(content[100..].iter().all(|&b| b == 0xbb));
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_resume_point_restarts_from_scratch() {
    // --- Arrange ---
    // 服务器对 Range 请求回 416，对无 Range 的请求回完整文件
    let mut server = mockito::Server::new_async().await;
    let full = vec![0xcc_u8; 300];
    let mock_416 = server
        .mock("GET", "/datasets/part.zip")
        .match_header("range", "bytes=100-")
        .with_status(416)
        .create_async()
        .await;
    let mock_full = server
        .mock("GET", "/datasets/part.zip")
        .match_header("range", mockito::Matcher::Missing)
        .with_status(200)
        .with_body(&full)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let part = dir.path().join("job-3.part");
    std::fs::write(&part, vec![0xaa_u8; 100]).unwrap();

    let url = format!("{}/datasets/part.zip", server.url());
    let token = serde_json::json!({
        "url": url,
        "temp_path": part,
        "bytes_written": 100,
    });

    let (tx, mut rx) = mpsc::channel(64);
    let backend =
        HttpTransferBackend::new(&EngineConfig::for_testing(), dir.path().to_path_buf(), tx)
            .unwrap();

    // --- Act ---
    backend
        .resume(JobHandle(3), serde_json::to_vec(&token).unwrap())
        .await
        .unwrap();

    // --- Assert ---
    let terminal = drain_to_terminal(&mut rx).await;
    let TransferEvent::Finished { temp_path, .. } = terminal else {
        panic!("期望 Finished 事件，实际是 {:?}", terminal);
    };
    // 旧分片被丢弃，文件是完整的重新下载
    assert_eq!(std::fs::read(&temp_path).unwrap(), full);
    mock_416.assert_async().await;
    mock_full.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_error_becomes_failed_event() {
    // --- Arrange ---
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/broken.zip")
        .with_status(503)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let backend =
        HttpTransferBackend::new(&EngineConfig::for_testing(), dir.path().to_path_buf(), tx)
            .unwrap();

    // --- Act ---
    backend
        .start(JobHandle(2), &format!("{}/broken.zip", server.url()))
        .await
        .unwrap();

    // --- Assert ---
    let terminal = drain_to_terminal(&mut rx).await;
    let TransferEvent::Failed { error, token, .. } = terminal else {
        panic!("期望 Failed 事件，实际是 {:?}", terminal);
    };
    assert!(matches!(error, AppError::ServerError(503)));
    // 一个字节都没写下，不应产出续传令牌
    assert!(token.is_none());
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_yields_resumable_token() {
    // --- Arrange ---
    // 分两段发送响应体，段间停顿给取消留出窗口
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/slow.zip")
        .with_status(200)
        .with_chunked_body(|w| {
            w.write_all(&[0x11_u8; 256])?;
            w.flush()?;
            std::thread::sleep(Duration::from_millis(800));
            w.write_all(&[0x22_u8; 256])
        })
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let backend =
        HttpTransferBackend::new(&EngineConfig::for_testing(), dir.path().to_path_buf(), tx)
            .unwrap();

    // --- Act ---
    backend
        .start(JobHandle(9), &format!("{}/slow.zip", server.url()))
        .await
        .unwrap();

    // 等第一段写入后立即取消
    let first = next_event(&mut rx).await;
    assert!(matches!(first, TransferEvent::Progress { .. }));
    let token = backend.cancel(JobHandle(9)).await;

    // --- Assert ---
    let token = token.expect("取消时应拿到续传令牌");
    let parsed: serde_json::Value = serde_json::from_slice(&token).unwrap();
    assert!(parsed["bytes_written"].as_u64().unwrap() > 0);
    assert!(parsed["url"].as_str().unwrap().ends_with("/slow.zip"));
}
