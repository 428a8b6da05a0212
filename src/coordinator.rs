// src/coordinator.rs

use crate::{
    config::StoragePaths,
    error::{AppError, AppResult},
    models::DownloadTask,
    queue::TaskQueue,
    store::ResumeTokenStore,
    transfer::{JobTable, TransferBackend},
    utils,
};
use log::{debug, info, warn};
use std::{path::{Path, PathBuf}, sync::Arc};
use tokio::fs;

/// 把引擎意图（"启动任务 X"）翻译成传输机制调用，把传输机制回调
/// 翻译回队列状态迁移与文件落位。所有回调处理器对未知任务或过期
/// 回调都是幂等无操作。
pub struct TransferCoordinator {
    queue: Arc<TaskQueue>,
    backend: Arc<dyn TransferBackend>,
    resume_store: ResumeTokenStore,
    jobs: Arc<JobTable>,
    paths: StoragePaths,
    /// 小于该字节数的"成功"载荷视为伪装的错误响应。
    min_payload_bytes: u64,
}

impl TransferCoordinator {
    pub fn new(
        queue: Arc<TaskQueue>,
        backend: Arc<dyn TransferBackend>,
        resume_store: ResumeTokenStore,
        jobs: Arc<JobTable>,
        paths: StoragePaths,
        min_payload_bytes: u64,
    ) -> Self {
        Self {
            queue,
            backend,
            resume_store,
            jobs,
            paths,
            min_payload_bytes,
        }
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// 重启后的作业映射重建：把传输机制仍挂着的作业按 URL 匹配回
    /// 当前队列中的任务，匹配不上的作业直接取消。返回重建的对数。
    pub async fn rebuild_jobs(&self) -> usize {
        let pending = self.backend.pending_jobs().await;
        if pending.is_empty() {
            return 0;
        }
        let tasks = self.queue.all_tasks();
        let matched = self.jobs.rebuild(&pending, &tasks);
        for (job, url) in &pending {
            if self.jobs.task_for(*job).is_none() {
                info!("取消无归属的遗留作业 {:?} ({})", job, url);
                let _ = self.backend.cancel(*job).await;
            }
        }
        matched
    }

    /// 启动任务：有合法续传令牌则走续传（令牌随即"在途"，从磁盘
    /// 清除），否则发起全新传输。两条路径都先把任务迁移到下载中。
    pub async fn start_task(&self, id: &str) -> AppResult<()> {
        let Some(task) = self.queue.get(id) else {
            debug!("忽略对不存在任务 '{}' 的启动请求", id);
            return Ok(());
        };
        if self.queue.mark_downloading(id).is_none() {
            // 状态机拒绝（例如重复启动），按无操作处理
            return Ok(());
        }

        let job = self.jobs.allocate(id);
        let token = self.resume_store.load_valid(id)?;
        match token {
            Some(token) => {
                // 令牌进入在途状态，不可复用
                self.resume_store.delete(id);
                self.queue.update_task(id, |t| t.resume_token_path = None);
                match self.backend.resume(job, token).await {
                    Ok(()) => Ok(()),
                    Err(AppError::CorruptResumeToken) => {
                        info!("任务 '{}' 的续传令牌不可用，改为全新传输", id);
                        self.backend.start(job, &task.url).await
                    }
                    Err(e) => Err(e),
                }
            }
            None => self.backend.start(job, &task.url).await,
        }
    }

    /// 进度回调：负/未知总量钳制为 0 交给队列。
    pub fn handle_progress(&self, id: &str, written: u64, total_expected: i64) {
        self.queue.update_progress(id, written, total_expected);
    }

    /// 完成回调：校验载荷、落位文件、清理令牌，推进到提取中并立即
    /// 完成（归档解包本身不在本子系统范围内，这里只标记就绪）。
    pub async fn handle_complete(&self, id: &str, temp_path: &Path) -> AppResult<Option<DownloadTask>> {
        let Some(task) = self.queue.get(id) else {
            debug!("忽略对不存在任务 '{}' 的完成回调", id);
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Ok(None);
        }

        let size = fs::metadata(temp_path).await.map(|m| m.len()).unwrap_or(0);
        if size < self.min_payload_bytes {
            // 常见形态：服务器对错误请求返回 200 + HTML 错误页
            warn!(
                "任务 '{}' 的载荷过小 ({} 字节)，按服务器错误处理",
                id, size
            );
            let _ = fs::remove_file(temp_path).await;
            return Err(AppError::ServerError(200));
        }

        self.queue.update_progress(id, size, size as i64);
        if self.queue.mark_extracting(id).is_none() {
            return Ok(None);
        }

        let dest = self.final_path(&task);
        if let Err(e) = self.place_payload(temp_path, &dest).await {
            return Err(AppError::FileMove(format!(
                "{} -> {}: {}",
                temp_path.display(),
                dest.display(),
                e
            )));
        }

        self.resume_store.delete(id);
        self.jobs.release(id);
        let done = self.queue.mark_completed(id);
        info!("任务 '{}' 已完成，载荷位于 {:?}", id, dest);
        Ok(done)
    }

    /// 失败回调的令牌部分：持久化传输机制交回的令牌并记在任务上，
    /// 返回令牌落盘路径。失败的最终处置（重试还是终态）由引擎决定。
    pub fn persist_failure_token(&self, id: &str, token: Option<&[u8]>) -> Option<PathBuf> {
        let token = token?;
        if !ResumeTokenStore::looks_valid(token) {
            debug!("任务 '{}' 交回的令牌未通过封套嗅探，丢弃", id);
            return None;
        }
        match self.resume_store.save(id, token) {
            Ok(path) => {
                self.queue
                    .update_task(id, |t| t.resume_token_path = Some(path.clone()));
                Some(path)
            }
            Err(e) => {
                warn!("持久化任务 '{}' 的续传令牌失败: {}", id, e);
                None
            }
        }
    }

    /// 暂停回调：先存令牌再迁移状态。
    pub fn handle_paused(&self, id: &str, token: Option<&[u8]>) -> Option<DownloadTask> {
        let path = self.persist_failure_token(id, token);
        self.jobs.release(id);
        self.queue.mark_paused(id, path)
    }

    /// 暂停一个活跃任务：向传输机制要一枚令牌（取消在途作业），
    /// 然后按暂停回调处理。
    pub async fn pause_task(&self, id: &str) -> Option<DownloadTask> {
        let job = self.jobs.job_for(id)?;
        let token = self.backend.cancel(job).await;
        self.handle_paused(id, token.as_deref())
    }

    /// 取消：通知传输机制中止，丢弃令牌（取消不可续传），任务本身
    /// 留给调用方从队列删除。不等待网络层拆除完成。
    pub async fn cancel_task(&self, id: &str) {
        if let Some(job) = self.jobs.job_for(id) {
            // 返回的令牌有意丢弃
            let _ = self.backend.cancel(job).await;
        }
        self.jobs.release(id);
        self.resume_store.delete(id);
        self.queue.update_task(id, |t| t.resume_token_path = None);
    }

    fn final_path(&self, task: &DownloadTask) -> PathBuf {
        self.paths
            .completed_dir()
            .join(utils::completed_file_name(&task.id, &task.file_name()))
    }

    /// 同卷优先 rename，跨卷回退到 copy + remove。
    async fn place_payload(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        fs::create_dir_all(self.paths.completed_dir()).await?;
        match fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(_) => {
                fs::copy(from, to).await?;
                fs::remove_file(from).await
            }
        }
    }
}
