// src/engine.rs

use crate::{
    config::{EngineConfig, StoragePaths},
    coordinator::TransferCoordinator,
    error::{AppError, AppResult},
    events::{EngineDelegate, EngineEvent},
    models::{DownloadTask, TaskDescriptor, TaskStatus},
    network::{NetworkMonitor, NetworkStatus},
    progress::{ProgressTracker, RateEstimate},
    queue::TaskQueue,
    store::{HistoryLog, ResumeTokenStore, StateStore},
    transfer::{HttpTransferBackend, JobTable, TransferBackend, TransferEvent},
    utils::{DiskProbe, SysinfoDiskProbe},
};
use log::{debug, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex, Weak,
};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;

/// 事件通道容量。进度事件在后端侧用 try_send 发送，队列满时丢样本，
/// 生命周期事件不会积压到这个量级。
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 下载编排引擎：驱动准入循环、消费传输机制回调、执行重试与
/// 断网自动暂停策略。宿主应用持有 `Arc<DownloadEngine>`，通过
/// 委托接口接收生命周期事件。
pub struct DownloadEngine {
    config: EngineConfig,
    paths: StoragePaths,
    queue: Arc<TaskQueue>,
    coordinator: Arc<TransferCoordinator>,
    network: NetworkMonitor,
    delegate: Arc<dyn EngineDelegate>,
    disk_probe: Arc<dyn DiskProbe>,
    tracker: ProgressTracker,
    /// 当前这轮主循环的停机令牌；每次 `start` 换新的一枚。
    shutdown: StdMutex<CancellationToken>,
    running: AtomicBool,
    finished_announced: AtomicBool,
    /// 主循环运行期间持锁独占接收端，退出时归还给下一轮。
    events_rx: TokioMutex<mpsc::Receiver<TransferEvent>>,
    /// 指回自身的弱引用，`start` 用它克隆出主循环任务的强引用。
    self_ref: Weak<Self>,
}

impl DownloadEngine {
    /// 标准构造：内置 reqwest 传输后端与 sysinfo 磁盘探针。
    pub fn new(
        config: EngineConfig,
        paths: StoragePaths,
        delegate: Arc<dyn EngineDelegate>,
    ) -> AppResult<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let backend = Arc::new(HttpTransferBackend::new(&config, paths.tmp_dir(), events_tx)?);
        Self::with_backend(
            config,
            paths,
            backend,
            events_rx,
            NetworkMonitor::new(),
            delegate,
            Arc::new(SysinfoDiskProbe),
        )
    }

    /// 注入式构造：宿主平台自带传输机制（或测试替身）时使用。
    /// `events_rx` 必须是后端发送回调所用通道的接收端。
    pub fn with_backend(
        config: EngineConfig,
        paths: StoragePaths,
        backend: Arc<dyn TransferBackend>,
        events_rx: mpsc::Receiver<TransferEvent>,
        network: NetworkMonitor,
        delegate: Arc<dyn EngineDelegate>,
        disk_probe: Arc<dyn DiskProbe>,
    ) -> AppResult<Arc<Self>> {
        paths.ensure_layout()?;
        let resume_store = ResumeTokenStore::new(paths.clone());
        let queue = Arc::new(TaskQueue::new(
            config.max_concurrent,
            StateStore::new(paths.clone(), config.save_debounce),
            resume_store.clone(),
            HistoryLog::new(paths.clone(), config.history_limit),
        ));
        let coordinator = Arc::new(TransferCoordinator::new(
            queue.clone(),
            backend,
            resume_store,
            Arc::new(JobTable::new()),
            paths.clone(),
            config.min_payload_bytes,
        ));
        Ok(Arc::new_cyclic(|weak| Self {
            config,
            paths,
            queue,
            coordinator,
            network,
            delegate,
            disk_probe,
            tracker: ProgressTracker::new(),
            shutdown: StdMutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            finished_announced: AtomicBool::new(false),
            events_rx: TokioMutex::new(events_rx),
            self_ref: weak.clone(),
        }))
    }

    // ------------------------------------------------------------------
    // 生命周期
    // ------------------------------------------------------------------

    /// 恢复持久化状态并启动主循环。返回恢复的任务数。`stop` 之后
    /// 可以再次 `start`：新一轮循环会等上一轮归还事件通道后接管。
    pub fn start(&self) -> AppResult<usize> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let Some(engine) = self.self_ref.upgrade() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(AppError::InvalidState("引擎已被释放".into()));
        };
        let restored = match self.queue.restore_state() {
            Ok(n) => n,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let shutdown = CancellationToken::new();
        *self.shutdown.lock().unwrap() = shutdown.clone();
        tokio::spawn(engine.run(shutdown));
        self.delegate.on_event(&EngineEvent::RunningChanged(true));
        Ok(restored)
    }

    /// 停止主循环并立刻把最新快照落盘。已在途的传输由各后端自行收尾。
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.lock().unwrap().cancel();
        self.queue.flush();
        self.delegate.on_event(&EngineEvent::RunningChanged(false));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        // 上一轮循环退出前持有接收端，这里等它归还
        let mut events_rx = self.events_rx.lock().await;
        let mut net_rx = self.network.subscribe();
        info!("下载引擎主循环启动 (并发上限 {})", self.queue.max_concurrent());
        // 传输机制里残留的作业先与恢复出的任务对上号，事件才有归属
        let rebuilt = self.coordinator.rebuild_jobs().await;
        if rebuilt > 0 {
            info!("重建了 {} 个遗留作业的映射", rebuilt);
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.admit().await;
                }
                changed = net_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *net_rx.borrow_and_update();
                    self.on_network_change(status).await;
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.on_transfer_event(event).await,
                        None => break,
                    }
                }
            }
        }
        self.queue.flush();
        info!("下载引擎主循环退出");
    }

    // ------------------------------------------------------------------
    // 任务操作
    // ------------------------------------------------------------------

    /// 批量入队，返回新任务的 id（与描述元组一一对应）。
    pub fn enqueue(&self, descriptors: Vec<TaskDescriptor>) -> Vec<String> {
        let tasks: Vec<DownloadTask> = descriptors
            .into_iter()
            .map(DownloadTask::from_descriptor)
            .collect();
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let accepted = self.queue.enqueue_all(tasks);
        if accepted > 0 {
            self.finished_announced.store(false, Ordering::SeqCst);
        }
        ids
    }

    /// 用户暂停单个任务。非活跃任务是无操作。
    pub async fn pause_task(&self, id: &str) {
        self.tracker.reset(id);
        if let Some(task) = self.coordinator.pause_task(id).await {
            self.delegate.on_event(&EngineEvent::TaskUpdated(task));
        }
    }

    /// 用户恢复单个暂停任务：回到待下载并插队到最前，经由常规准入
    /// 启动（保持并发上限不变量），续传令牌仍在其位。
    pub async fn resume_task(&self, id: &str) {
        let is_paused = self
            .queue
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Paused);
        if !is_paused {
            return;
        }
        if let Some(task) = self.queue.requeue_for_retry(id) {
            self.queue.prioritize(id);
            self.delegate.on_event(&EngineEvent::TaskUpdated(task));
        }
        self.admit().await;
    }

    /// 取消并删除任务。续传令牌与作业映射一并清除，不进历史日志。
    pub async fn cancel_task(&self, id: &str) {
        self.tracker.reset(id);
        self.coordinator.cancel_task(id).await;
        self.queue.remove(id);
        self.check_all_finished();
    }

    /// 用户对终态任务的显式重试：重试预算归零，重新排队。
    pub async fn retry_task(&self, id: &str) {
        if let Some(task) = self.queue.mark_pending(id, true) {
            self.finished_announced.store(false, Ordering::SeqCst);
            self.delegate.on_event(&EngineEvent::TaskUpdated(task));
        }
        self.admit().await;
    }

    /// 调整任务优先级到队首。
    pub fn prioritize(&self, id: &str) -> bool {
        self.queue.prioritize(id)
    }

    /// 全局暂停：不再准入新任务，并暂停所有活跃传输。
    pub async fn pause_all(&self) {
        self.queue.set_paused(true);
        for task in self.queue.all_tasks() {
            if task.status.is_active() {
                self.tracker.reset(&task.id);
                if let Some(updated) = self.coordinator.pause_task(&task.id).await {
                    self.delegate.on_event(&EngineEvent::TaskUpdated(updated));
                }
            }
        }
        self.delegate.on_event(&EngineEvent::PausedChanged(true));
    }

    /// 解除全局暂停并把所有暂停任务重新排入准入队列。
    pub async fn resume_all(&self) {
        self.queue.set_paused(false);
        for task in self.queue.tasks_with_status(TaskStatus::Paused) {
            self.queue.requeue_for_retry(&task.id);
        }
        self.delegate.on_event(&EngineEvent::PausedChanged(false));
        self.admit().await;
    }

    // ------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// 全局下载速率与 ETA，字节计数取队列聚合值。
    pub fn aggregate_rate(&self) -> RateEstimate {
        let (downloaded, total, _) = self.queue.aggregate_totals();
        self.tracker.aggregate_estimate(downloaded, total)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // 准入与回调处理
    // ------------------------------------------------------------------

    /// 准入扫描：在并发上限内按顺序启动待下载任务。每次启动前做
    /// 磁盘空间检查，空间不足是立即失败（不消耗重试预算）。
    async fn admit(&self) {
        if !self.network.current().is_connected() {
            return;
        }
        while let Some(task) = self.queue.next_pending() {
            let required = task
                .total_bytes
                .saturating_sub(task.bytes_downloaded)
                .saturating_add(self.config.storage_headroom_bytes);
            let available = self.disk_probe.available_bytes(self.paths.root());
            if available < required {
                warn!(
                    "任务 '{}' 准入被拒: 需要 {} 字节，可用 {} 字节",
                    task.id, required, available
                );
                let error = AppError::InsufficientStorage {
                    required,
                    available,
                };
                if let Some(failed) = self.queue.mark_failed(&task.id, error.to_string(), None) {
                    self.delegate.on_event(&EngineEvent::TaskFailed(failed));
                }
                continue;
            }

            self.queue.mark_queued(&task.id);
            match self.coordinator.start_task(&task.id).await {
                Ok(()) => {
                    self.finished_announced.store(false, Ordering::SeqCst);
                    if let Some(started) = self.queue.get(&task.id) {
                        self.delegate.on_event(&EngineEvent::TaskStarted(started));
                    }
                }
                Err(e) => self.handle_task_error(&task.id, e, None),
            }
        }
        self.check_all_finished();
    }

    async fn on_transfer_event(&self, event: TransferEvent) {
        let Some(id) = self.coordinator.jobs().task_for(event.job()) else {
            debug!("忽略无归属作业 {:?} 的传输事件", event.job());
            return;
        };
        match event {
            TransferEvent::Progress {
                written,
                total_expected,
                ..
            } => {
                self.tracker.record(&id, written);
                if let Some(task) = self.queue.update_progress(&id, written, total_expected) {
                    self.delegate.on_event(&EngineEvent::TaskUpdated(task));
                }
            }
            TransferEvent::Finished { temp_path, .. } => {
                match self.coordinator.handle_complete(&id, &temp_path).await {
                    Ok(Some(task)) => {
                        self.tracker.reset(&id);
                        self.delegate.on_event(&EngineEvent::TaskCompleted(task));
                        self.admit().await;
                    }
                    Ok(None) => {}
                    Err(e) => self.handle_task_error(&id, e, None),
                }
            }
            TransferEvent::Failed { error, token, .. } => {
                let token_path = self.coordinator.persist_failure_token(&id, token.as_deref());
                self.handle_task_error(&id, error, token_path);
            }
            TransferEvent::Paused { token, .. } => {
                self.tracker.reset(&id);
                if let Some(task) = self.coordinator.handle_paused(&id, token.as_deref()) {
                    self.delegate.on_event(&EngineEvent::TaskUpdated(task));
                }
            }
            TransferEvent::ResumedAt { offset, .. } => {
                debug!("任务 '{}' 确认从偏移 {} 续传", id, offset);
                self.queue.update_task(&id, |t| t.bytes_downloaded = offset);
            }
        }
    }

    /// 失败处置策略。按顺序判定:
    /// 1. 断网引起的失败转为自动暂停，等网络恢复后重新准入;
    /// 2. 可重试且预算未尽: 延迟后重新排队，预算加一;
    /// 3. 其余: 终态失败。
    fn handle_task_error(
        &self,
        id: &str,
        error: AppError,
        token_path: Option<std::path::PathBuf>,
    ) {
        self.coordinator.jobs().release(id);
        self.tracker.reset(id);

        if error.auto_pause() && !self.network.current().is_connected() {
            info!("任务 '{}' 因断网转为自动暂停", id);
            if let Some(task) = self.queue.mark_paused(id, token_path) {
                self.delegate.on_event(&EngineEvent::TaskUpdated(task));
            }
            return;
        }

        if error.retryable() {
            let retries = self.queue.increment_retry(id).unwrap_or(0);
            if retries <= self.config.max_retries {
                warn!(
                    "任务 '{}' 失败 ({})，{:?} 后第 {} 次重试",
                    id, error, self.config.retry_delay, retries
                );
                let queue = Arc::clone(&self.queue);
                let delay = self.config.retry_delay;
                let id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.requeue_for_retry(&id);
                });
                return;
            }
            let final_error = format!(
                "{} (最后一次错误: {})",
                AppError::MaxRetriesExceeded(self.config.max_retries),
                error
            );
            if let Some(failed) = self.queue.mark_failed(id, final_error, token_path) {
                self.delegate.on_event(&EngineEvent::TaskFailed(failed));
            }
            self.check_all_finished();
            return;
        }

        if let Some(failed) = self.queue.mark_failed(id, error.to_string(), token_path) {
            self.delegate.on_event(&EngineEvent::TaskFailed(failed));
        }
        self.check_all_finished();
    }

    /// 网络迁移处理：断网时自动暂停全部活跃传输（不消耗重试预算），
    /// 恢复时立即触发一轮准入。被自动暂停的任务不会被单独自动恢复，
    /// 由用户显式恢复后经常规准入重新进入下载。
    async fn on_network_change(&self, status: NetworkStatus) {
        self.delegate.on_event(&EngineEvent::NetworkChanged(status));
        if status.is_connected() {
            self.admit().await;
        } else {
            let active: Vec<String> = self
                .queue
                .all_tasks()
                .into_iter()
                .filter(|t| t.status.is_active())
                .map(|t| t.id)
                .collect();
            if !active.is_empty() {
                info!("网络断开，自动暂停 {} 个活跃任务", active.len());
            }
            for id in active {
                self.tracker.reset(&id);
                if let Some(task) = self.coordinator.pause_task(&id).await {
                    self.delegate.on_event(&EngineEvent::TaskUpdated(task));
                }
            }
        }
    }

    /// 全部任务到达终态时恰好通知一次；有新工作进来后窗口重开。
    fn check_all_finished(&self) {
        if self.queue.all_finished() {
            if !self.finished_announced.swap(true, Ordering::SeqCst) {
                info!("全部任务已到达终态");
                self.delegate.on_event(&EngineEvent::AllTasksFinished);
            }
        } else {
            self.finished_announced.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        if let Ok(shutdown) = self.shutdown.lock() {
            shutdown.cancel();
        }
    }
}
