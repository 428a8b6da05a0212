// tests/engine_lifecycle_test.rs

use async_trait::async_trait;
use odc_dl::{
    config::{EngineConfig, StoragePaths},
    error::AppResult,
    events::NopDelegate,
    models::{TaskDescriptor, TaskStatus},
    network::NetworkMonitor,
    transfer::{JobHandle, TransferBackend, TransferEvent},
    utils::FixedDiskProbe,
    DownloadEngine,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::tempdir;
use tokio::sync::mpsc;

fn descriptor(url: &str, name: &str) -> TaskDescriptor {
    TaskDescriptor {
        url: url.into(),
        category: "alphabet".into(),
        part_index: 0,
        part_count: 1,
        dataset: "asl-core".into(),
        estimated_size: Some(256),
        file_name: Some(name.into()),
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("条件在限定时间内未满足");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end_download_against_http_server() {
    // --- Arrange (准备阶段) ---
    let mut server = mockito::Server::new_async().await;
    let body_a = vec![0x41_u8; 512];
    let body_b = vec![0x42_u8; 300];
    let mock_a = server
        .mock("GET", "/parts/a.zip")
        .with_status(200)
        .with_body(&body_a)
        .create_async()
        .await;
    let mock_b = server
        .mock("GET", "/parts/b.zip")
        .with_status(200)
        .with_body(&body_b)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let paths = StoragePaths::new(dir.path());
    let engine = DownloadEngine::new(
        EngineConfig::for_testing(),
        paths.clone(),
        Arc::new(NopDelegate),
    )
    .unwrap();

    // --- Act (执行阶段) ---
    engine.start().unwrap();
    let ids = engine.enqueue(vec![
        descriptor(&format!("{}/parts/a.zip", server.url()), "a.zip"),
        descriptor(&format!("{}/parts/b.zip", server.url()), "b.zip"),
    ]);

    let queue = engine.queue().clone();
    wait_until(|| {
        queue
            .all_tasks()
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
    })
    .await;
    engine.stop();

    // --- Assert (断言阶段) ---
    // 完成件按 {taskId}_{文件名} 落位
    let payload_a = std::fs::read(paths.completed_dir().join(format!("{}_a.zip", ids[0]))).unwrap();
    let payload_b = std::fs::read(paths.completed_dir().join(format!("{}_b.zip", ids[1]))).unwrap();
    assert_eq!(payload_a, body_a);
    assert_eq!(payload_b, body_b);

    // 停止时快照立即落盘
    assert!(paths.state_file().exists());
    mock_a.assert_async().await;
    mock_b.assert_async().await;
}

/// 永不回调的后端：任务一直停在下载中，取消时交回包含真实 URL 的
/// 续传令牌。用于模拟"进程在传输中途被杀"。
struct HangBackend {
    started: Mutex<Vec<String>>,
    resumed_tokens: Mutex<Vec<Vec<u8>>>,
}

impl HangBackend {
    fn new() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            resumed_tokens: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TransferBackend for HangBackend {
    async fn start(&self, _job: JobHandle, url: &str) -> AppResult<()> {
        self.started.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn resume(&self, _job: JobHandle, token: Vec<u8>) -> AppResult<()> {
        self.resumed_tokens.lock().unwrap().push(token);
        Ok(())
    }

    async fn cancel(&self, _job: JobHandle) -> Option<Vec<u8>> {
        let url = self.started.lock().unwrap().last().cloned()?;
        let token = serde_json::json!({
            "url": url,
            "temp_path": "/tmp/odc-dl-test.part",
            "bytes_written": 128,
        });
        Some(serde_json::to_vec(&token).unwrap())
    }
}

/// 返回的发送端必须在用例存续期间持有，通道关闭会让主循环退出。
fn engine_with_backend(
    paths: &StoragePaths,
    backend: Arc<HangBackend>,
) -> (Arc<DownloadEngine>, mpsc::Sender<TransferEvent>) {
    let (tx, rx) = mpsc::channel(64);
    let engine = DownloadEngine::with_backend(
        EngineConfig::for_testing(),
        paths.clone(),
        backend,
        rx,
        NetworkMonitor::new(),
        Arc::new(NopDelegate),
        Arc::new(FixedDiskProbe(u64::MAX)),
    )
    .unwrap();
    (engine, tx)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_restores_paused_task_and_resumes_from_token() {
    let dir = tempdir().unwrap();
    let paths = StoragePaths::new(dir.path());
    let url = "http://h/parts/letters_01.zip".to_string();

    // --- 第一个进程生命周期: 下载中途暂停，然后停机 ---
    let backend_a = Arc::new(HangBackend::new());
    let (engine_a, _tx_a) = engine_with_backend(&paths, backend_a.clone());
    engine_a.start().unwrap();
    let ids = engine_a.enqueue(vec![descriptor(&url, "letters_01.zip")]);

    let queue_a = engine_a.queue().clone();
    wait_until(|| queue_a.get(&ids[0]).is_some_and(|t| t.status == TaskStatus::Downloading)).await;

    engine_a.pause_task(&ids[0]).await;
    let paused = queue_a.get(&ids[0]).unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(paused.resume_token_path.is_some());
    engine_a.stop();
    drop(engine_a);

    // --- 第二个进程生命周期: 恢复状态并从令牌续传 ---
    let backend_b = Arc::new(HangBackend::new());
    let (engine_b, _tx_b) = engine_with_backend(&paths, backend_b.clone());
    let restored = engine_b.start().unwrap();
    assert_eq!(restored, 1);

    let queue_b = engine_b.queue().clone();
    let task = queue_b.get(&ids[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert!(task.resume_token_path.is_some());

    engine_b.resume_task(&ids[0]).await;
    wait_until(|| !backend_b.resumed_tokens.lock().unwrap().is_empty()).await;

    // 续传用的是第一个生命周期留下的令牌，URL 一致
    let tokens = backend_b.resumed_tokens.lock().unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&tokens[0]).unwrap();
    assert_eq!(parsed["url"].as_str().unwrap(), url);
    assert_eq!(parsed["bytes_written"].as_u64().unwrap(), 128);
    engine_b.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_mid_download_degrades_to_pending_without_token() {
    let dir = tempdir().unwrap();
    let paths = StoragePaths::new(dir.path());

    // --- 第一个生命周期: 任务停在下载中，未产出任何令牌就停机 ---
    let backend_a = Arc::new(HangBackend::new());
    let (engine_a, _tx_a) = engine_with_backend(&paths, backend_a);
    engine_a.start().unwrap();
    let ids = engine_a.enqueue(vec![descriptor("http://h/parts/x.zip", "x.zip")]);

    let queue_a = engine_a.queue().clone();
    wait_until(|| queue_a.get(&ids[0]).is_some_and(|t| t.status == TaskStatus::Downloading)).await;
    queue_a.flush();
    // 直接停机，不经过暂停，磁盘上没有续传令牌
    engine_a.stop();
    drop(engine_a);

    // --- 第二个生命周期: 无令牌的下载中任务降级为待下载 ---
    let backend_b = Arc::new(HangBackend::new());
    let (engine_b, _tx_b) = engine_with_backend(&paths, backend_b.clone());
    engine_b.start().unwrap();

    let queue_b = engine_b.queue().clone();
    // 降级后会被准入循环重新启动，最终回到下载中（全新传输）
    wait_until(|| !backend_b.started.lock().unwrap().is_empty()).await;
    let task = queue_b.get(&ids[0]).unwrap();
    assert_eq!(task.bytes_downloaded, 0);
    assert!(backend_b.resumed_tokens.lock().unwrap().is_empty());
    engine_b.stop();
}
