// src/transfer/mod.rs

pub mod http;

pub use http::HttpTransferBackend;

use crate::{error::AppError, models::DownloadTask};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

/// 传输机制侧的作业句柄。对核心子系统不透明，仅用于和任务 id 互查。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(pub u64);

/// 传输机制回调，经 mpsc 通道送达引擎。
#[derive(Debug)]
pub enum TransferEvent {
    Progress {
        job: JobHandle,
        written: u64,
        /// 负值/零表示总量未知。
        total_expected: i64,
    },
    Finished {
        job: JobHandle,
        temp_path: PathBuf,
    },
    Failed {
        job: JobHandle,
        error: AppError,
        token: Option<Vec<u8>>,
    },
    Paused {
        job: JobHandle,
        token: Option<Vec<u8>>,
    },
    ResumedAt {
        job: JobHandle,
        offset: u64,
    },
}

impl TransferEvent {
    pub fn job(&self) -> JobHandle {
        match self {
            TransferEvent::Progress { job, .. }
            | TransferEvent::Finished { job, .. }
            | TransferEvent::Failed { job, .. }
            | TransferEvent::Paused { job, .. }
            | TransferEvent::ResumedAt { job, .. } => *job,
        }
    }
}

/// 平台传输机制的最小接口。本子系统消费它，不重新实现它；
/// 库内自带一个基于 reqwest 的参考实现（`HttpTransferBackend`）。
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// 发起全新传输。
    async fn start(&self, job: JobHandle, url: &str) -> crate::error::AppResult<()>;
    /// 用续传令牌恢复传输。令牌损坏时以 `Failed` 事件报告。
    async fn resume(&self, job: JobHandle, token: Vec<u8>) -> crate::error::AppResult<()>;
    /// 取消传输，尽力返回一枚可续传的令牌。不等待网络层真正拆除。
    async fn cancel(&self, job: JobHandle) -> Option<Vec<u8>>;

    /// 进程重启后仍挂在传输机制上的作业，(句柄, URL) 对，用于重建
    /// 作业与任务的映射。进程内后端没有跨进程残留，默认返回空表。
    async fn pending_jobs(&self) -> Vec<(JobHandle, String)> {
        Vec::new()
    }
}

/// 作业句柄与任务 id 的双向查找表。进程重启后通过 URL 匹配重建。
pub struct JobTable {
    by_job: DashMap<JobHandle, String>,
    by_task: DashMap<String, JobHandle>,
    next: AtomicU64,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            by_job: DashMap::new(),
            by_task: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// 为任务分配新句柄并登记映射。同一任务重复分配会先释放旧句柄。
    pub fn allocate(&self, task_id: &str) -> JobHandle {
        if let Some(old) = self.by_task.get(task_id).map(|e| *e.value()) {
            self.by_job.remove(&old);
        }
        let job = JobHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.by_job.insert(job, task_id.to_string());
        self.by_task.insert(task_id.to_string(), job);
        job
    }

    pub fn task_for(&self, job: JobHandle) -> Option<String> {
        self.by_job.get(&job).map(|e| e.value().clone())
    }

    pub fn job_for(&self, task_id: &str) -> Option<JobHandle> {
        self.by_task.get(task_id).map(|e| *e.value())
    }

    /// 解除任务的映射（任务结束或取消后调用）。
    pub fn release(&self, task_id: &str) {
        if let Some((_, job)) = self.by_task.remove(task_id) {
            self.by_job.remove(&job);
        }
    }

    pub fn len(&self) -> usize {
        self.by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }

    /// 重启后的映射重建：把传输机制仍挂着的作业按 URL 匹配回任务。
    /// 匹配不上的作业留给调用方取消。返回成功重建的对数。
    pub fn rebuild(&self, pending_jobs: &[(JobHandle, String)], tasks: &[DownloadTask]) -> usize {
        let mut matched = 0;
        for (job, url) in pending_jobs {
            if let Some(task) = tasks.iter().find(|t| &t.url == url) {
                self.by_job.insert(*job, task.id.clone());
                self.by_task.insert(task.id.clone(), *job);
                let current = self.next.load(Ordering::Relaxed);
                if job.0 >= current {
                    self.next.store(job.0 + 1, Ordering::Relaxed);
                }
                matched += 1;
                debug!("重建作业映射: {:?} -> 任务 '{}'", job, task.id);
            }
        }
        matched
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadTask, TaskDescriptor};

    fn task(id: &str, url: &str) -> DownloadTask {
        DownloadTask::with_id(
            id.into(),
            TaskDescriptor {
                url: url.into(),
                category: "alphabet".into(),
                part_index: 0,
                part_count: 1,
                dataset: "asl-core".into(),
                estimated_size: None,
                file_name: None,
            },
        )
    }

    #[test]
    fn test_allocate_and_lookup() {
        let table = JobTable::new();
        let job = table.allocate("t1");
        assert_eq!(table.task_for(job).as_deref(), Some("t1"));
        assert_eq!(table.job_for("t1"), Some(job));

        // 重新分配释放旧句柄
        let job2 = table.allocate("t1");
        assert_ne!(job, job2);
        assert!(table.task_for(job).is_none());
        assert_eq!(table.job_for("t1"), Some(job2));

        table.release("t1");
        assert!(table.is_empty());
    }

    #[test]
    fn test_rebuild_matches_by_url() {
        let table = JobTable::new();
        let tasks = vec![
            task("t1", "http://h/a.zip"),
            task("t2", "http://h/b.zip"),
        ];
        let pending = vec![
            (JobHandle(7), "http://h/b.zip".to_string()),
            (JobHandle(9), "http://h/unknown.zip".to_string()),
        ];
        assert_eq!(table.rebuild(&pending, &tasks), 1);
        assert_eq!(table.task_for(JobHandle(7)).as_deref(), Some("t2"));
        assert!(table.task_for(JobHandle(9)).is_none());

        // 后续分配不会撞上重建的句柄编号
        let fresh = table.allocate("t1");
        assert!(fresh.0 > 7);
    }
}
