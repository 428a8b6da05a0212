// src/models.rs

use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};

/// 快照格式版本；不认识的版本直接按校验失败处理。
pub const SNAPSHOT_VERSION: u32 = 2;

/// 任务状态机。合法迁移见 `can_transition`，其余一律静默忽略，
/// 以容忍传输机制回调的重复与乱序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Downloading,
    Paused,
    Extracting,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (from, to) {
            (Pending, Queued) | (Pending, Downloading) => true,
            (Queued, Downloading) => true,
            (Downloading, Extracting) => true,
            (Extracting, Completed) => true,
            (Downloading, Paused) | (Queued, Paused) => true,
            (Paused, Downloading) => true,
            // 任何非终态都可失败
            (Pending, Failed) | (Queued, Failed) | (Downloading, Failed)
            | (Paused, Failed) | (Extracting, Failed) => true,
            // 重试 / 重置
            (Failed, Pending) | (Completed, Pending) => true,
            _ => false,
        }
    }

    pub fn can_start(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Failed)
    }

    pub fn can_pause(self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Queued)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 活跃 = 正在占用并发额度的状态。
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Extracting)
    }
}

/// 清单/目录协作方提供的任务描述元组，仅用于构造初始任务。
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDescriptor {
    pub url: String,
    pub category: String,
    pub part_index: u32,
    pub part_count: u32,
    pub dataset: String,
    pub estimated_size: Option<u64>,
    /// 落盘文件名；缺省时取 URL 最后一段。
    pub file_name: Option<String>,
}

/// 一次传输单元（逻辑数据集的一个文件/分片）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub url: String,
    pub category: String,
    pub part_index: u32,
    pub part_count: u32,
    pub dataset: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub bytes_downloaded: u64,
    /// 0 表示未知。
    pub total_bytes: u64,
    pub error: Option<String>,
    pub resume_token_path: Option<PathBuf>,
    pub retry_count: u32,
    pub file_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn from_descriptor(desc: TaskDescriptor) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), desc)
    }

    pub fn with_id(id: String, desc: TaskDescriptor) -> Self {
        Self {
            id,
            url: desc.url,
            category: desc.category,
            part_index: desc.part_index,
            part_count: desc.part_count,
            dataset: desc.dataset,
            status: TaskStatus::Pending,
            progress: 0.0,
            bytes_downloaded: 0,
            total_bytes: desc.estimated_size.unwrap_or(0),
            error: None,
            resume_token_path: None,
            retry_count: 0,
            file_name: desc.file_name,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 更新字节计数并派生进度。总量未知/为负时按 0 处理；
    /// 已知总量时已下载字节被钳制在总量以内。
    pub fn update_progress(&mut self, written: u64, total_expected: i64) {
        let total = if total_expected > 0 { total_expected as u64 } else { 0 };
        if total > 0 {
            self.total_bytes = total;
            self.bytes_downloaded = written.min(total);
            self.progress = (self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0);
        } else {
            self.bytes_downloaded = written;
            if self.total_bytes > 0 {
                self.bytes_downloaded = written.min(self.total_bytes);
                self.progress =
                    (self.bytes_downloaded as f64 / self.total_bytes as f64).clamp(0.0, 1.0);
            }
        }
    }

    /// 重置为待下载：计数、进度、错误、重试预算全部归零。
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0.0;
        self.bytes_downloaded = 0;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
    }

    /// 落盘文件名：显式指定优先，否则取 URL 路径最后一段（清洗后）。
    pub fn file_name(&self) -> String {
        if let Some(name) = &self.file_name {
            return utils::sanitize_filename(name);
        }
        let from_url = self
            .url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download.bin");
        // 去掉查询串
        let from_url = from_url.split('?').next().unwrap_or(from_url);
        utils::sanitize_filename(from_url)
    }
}

/// 队列的可序列化全量状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    /// 下载优先级顺序（先到先下）。
    pub order: Vec<String>,
    /// BTreeMap 保证序列化键序稳定，便于人工排查。
    pub tasks: BTreeMap<String, DownloadTask>,
    pub paused: bool,
    pub max_concurrent: usize,
}

impl QueueSnapshot {
    pub fn empty(max_concurrent: usize) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            order: Vec::new(),
            tasks: BTreeMap::new(),
            paused: false,
            max_concurrent,
        }
    }

    /// 不变量：顺序表的 id 集合与任务集合完全一致，且两边都无重复。
    pub fn validate(&self) -> Result<(), String> {
        if self.version > SNAPSHOT_VERSION {
            return Err(format!("不支持的快照版本: {}", self.version));
        }
        let mut seen = HashSet::with_capacity(self.order.len());
        for id in &self.order {
            if !seen.insert(id.as_str()) {
                return Err(format!("顺序表中存在重复 id: {}", id));
            }
            if !self.tasks.contains_key(id) {
                return Err(format!("顺序表引用了不存在的任务: {}", id));
            }
        }
        if seen.len() != self.tasks.len() {
            let missing: Vec<_> = self
                .tasks
                .keys()
                .filter(|id| !seen.contains(id.as_str()))
                .cloned()
                .collect();
            return Err(format!("任务未出现在顺序表中: {:?}", missing));
        }
        Ok(())
    }

    /// 修复策略：以任务集合为准重建顺序表。仍在集合中的 id 保持原有相对
    /// 顺序，缺失的按键序补到末尾。
    pub fn repair(&mut self) {
        let mut rebuilt: Vec<String> = Vec::with_capacity(self.tasks.len());
        let mut placed: HashSet<&str> = HashSet::new();
        for id in &self.order {
            if self.tasks.contains_key(id) && !placed.contains(id.as_str()) {
                rebuilt.push(id.clone());
            }
        }
        for id in &rebuilt {
            placed.insert(id.as_str());
        }
        let mut placed_owned: HashSet<String> = rebuilt.iter().cloned().collect();
        for id in self.tasks.keys() {
            if !placed_owned.contains(id) {
                rebuilt.push(id.clone());
                placed_owned.insert(id.clone());
            }
        }
        self.order = rebuilt;
        self.version = SNAPSHOT_VERSION;
    }
}

/// 终态流水记录：每个任务到达终态时恰好生成一条。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub url: String,
    pub category: String,
    pub dataset: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub bytes_transferred: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn from_task(task: &DownloadTask, success: bool) -> Self {
        Self {
            task_id: task.id.clone(),
            url: task.url.clone(),
            category: task.category.clone(),
            dataset: task.dataset.clone(),
            started_at: task.started_at,
            finished_at: Utc::now(),
            bytes_transferred: task.bytes_downloaded,
            success,
            error: task.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(url: &str) -> TaskDescriptor {
        TaskDescriptor {
            url: url.to_string(),
            category: "alphabet".into(),
            part_index: 0,
            part_count: 1,
            dataset: "asl-core".into(),
            estimated_size: None,
            file_name: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(TaskStatus::can_transition(Pending, Downloading));
        assert!(TaskStatus::can_transition(Downloading, Paused));
        assert!(TaskStatus::can_transition(Paused, Downloading));
        assert!(TaskStatus::can_transition(Extracting, Completed));
        assert!(TaskStatus::can_transition(Failed, Pending));
        assert!(TaskStatus::can_transition(Completed, Pending));

        // 非法迁移
        assert!(!TaskStatus::can_transition(Completed, Downloading));
        assert!(!TaskStatus::can_transition(Completed, Failed));
        assert!(!TaskStatus::can_transition(Failed, Downloading));
        assert!(!TaskStatus::can_transition(Pending, Extracting));
        assert!(!TaskStatus::can_transition(Paused, Paused));
    }

    #[test]
    fn test_progress_invariant() {
        let mut task = DownloadTask::from_descriptor(descriptor("http://h/a.zip"));
        task.update_progress(500, 1000);
        assert_eq!(task.bytes_downloaded, 500);
        assert_eq!(task.total_bytes, 1000);
        assert!((task.progress - 0.5).abs() < f64::EPSILON);

        // 已下载不可超过总量
        task.update_progress(2000, 1000);
        assert_eq!(task.bytes_downloaded, 1000);
        assert!((task.progress - 1.0).abs() < f64::EPSILON);

        // 负的期望总量钳制为未知
        let mut task2 = DownloadTask::from_descriptor(descriptor("http://h/b.zip"));
        task2.update_progress(300, -1);
        assert_eq!(task2.bytes_downloaded, 300);
        assert_eq!(task2.total_bytes, 0);
        assert_eq!(task2.progress, 0.0);
    }

    #[test]
    fn test_file_name_derivation() {
        let task = DownloadTask::from_descriptor(descriptor("http://h/parts/letters_01.zip?sig=x"));
        assert_eq!(task.file_name(), "letters_01.zip");

        let mut desc = descriptor("http://h/x");
        desc.file_name = Some("自定义 名称.zip".into());
        let task = DownloadTask::from_descriptor(desc);
        assert_eq!(task.file_name(), "自定义 名称.zip");
    }

    #[test]
    fn test_snapshot_validate_and_repair() {
        let mut snap = QueueSnapshot::empty(3);
        let t1 = DownloadTask::with_id("a".into(), descriptor("http://h/1"));
        let t2 = DownloadTask::with_id("b".into(), descriptor("http://h/2"));
        snap.tasks.insert("a".into(), t1);
        snap.tasks.insert("b".into(), t2);
        snap.order = vec!["b".into(), "a".into()];
        assert!(snap.validate().is_ok());

        // 顺序表缺一项 -> 校验失败 -> 修复后补到末尾
        snap.order = vec!["b".into()];
        assert!(snap.validate().is_err());
        snap.repair();
        assert_eq!(snap.order, vec!["b".to_string(), "a".to_string()]);
        assert!(snap.validate().is_ok());

        // 顺序表含幽灵 id -> 修复后剔除
        snap.order = vec!["b".into(), "ghost".into(), "a".into()];
        assert!(snap.validate().is_err());
        snap.repair();
        assert_eq!(snap.order, vec!["b".to_string(), "a".to_string()]);
        assert!(snap.validate().is_ok());
    }
}
