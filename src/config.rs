// src/config.rs

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const STATE_FILE_NAME: &str = "queue_state.json";
pub const BACKUP_FILE_NAME: &str = "queue_state.json.bak";
pub const HISTORY_FILE_NAME: &str = "history.json";
pub const RESUME_DIR_NAME: &str = "resume";
pub const COMPLETED_DIR_NAME: &str = "completed";
pub const TMP_DIR_NAME: &str = "tmp";
pub const RESUME_TOKEN_EXT: &str = "token";

/// 可从外部配置文件反序列化的引擎参数，未提供的字段走默认值。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfigFromFile {
    pub max_concurrent: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub save_debounce_ms: Option<u64>,
    pub history_limit: Option<usize>,
    pub min_payload_bytes: Option<u64>,
    pub storage_headroom_bytes: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 同时处于活跃下载的任务上限。
    pub max_concurrent: usize,
    /// 单个任务的可重试错误预算。
    pub max_retries: u32,
    /// 可重试失败后，重新入队前的固定延迟。
    pub retry_delay: Duration,
    /// 引擎准入扫描之间的休眠间隔。
    pub poll_interval: Duration,
    /// 快照持久化的防抖窗口。
    pub save_debounce: Duration,
    /// 历史日志保留条数上限。
    pub history_limit: usize,
    /// 小于该字节数的"成功"载荷按服务器错误处理。
    pub min_payload_bytes: u64,
    /// 准入时除任务声明大小外额外要求的可用空间。
    pub storage_headroom_bytes: u64,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl EngineConfig {
    pub fn from_file_config(file: EngineConfigFromFile) -> Self {
        let d = EngineConfig::builtin_defaults();
        Self {
            max_concurrent: file.max_concurrent.unwrap_or(d.max_concurrent).max(1),
            max_retries: file.max_retries.unwrap_or(d.max_retries),
            retry_delay: file
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(d.retry_delay),
            poll_interval: file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            save_debounce: file
                .save_debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(d.save_debounce),
            history_limit: file.history_limit.unwrap_or(d.history_limit),
            min_payload_bytes: file.min_payload_bytes.unwrap_or(d.min_payload_bytes),
            storage_headroom_bytes: file
                .storage_headroom_bytes
                .unwrap_or(d.storage_headroom_bytes),
            connect_timeout: file
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.connect_timeout),
            timeout: file.timeout_secs.map(Duration::from_secs).unwrap_or(d.timeout),
        }
    }

    fn builtin_defaults() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            save_debounce: Duration::from_millis(1000),
            history_limit: 200,
            min_payload_bytes: 2048,
            storage_headroom_bytes: 50 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builtin_defaults()
    }
}

/// 所有持久化文件的布局，整体可迁移：只要根目录一致，各路径即一致。
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// 默认根目录: 平台数据目录下的 odc-dl 子目录。
    pub fn default_root() -> AppResult<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("无法确定平台数据目录")))?;
        Ok(Self::new(base.join("odc-dl")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE_NAME)
    }

    pub fn backup_file(&self) -> PathBuf {
        self.root.join(BACKUP_FILE_NAME)
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join(HISTORY_FILE_NAME)
    }

    pub fn resume_dir(&self) -> PathBuf {
        self.root.join(RESUME_DIR_NAME)
    }

    pub fn resume_token_file(&self, task_id: &str) -> PathBuf {
        self.resume_dir()
            .join(format!("{}.{}", task_id, RESUME_TOKEN_EXT))
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.root.join(COMPLETED_DIR_NAME)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR_NAME)
    }

    /// 建立完整目录骨架；任何一级失败都视为不可用的存储根。
    pub fn ensure_layout(&self) -> AppResult<()> {
        for dir in [
            self.root.clone(),
            self.resume_dir(),
            self.completed_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "testing"))]
impl EngineConfig {
    /// 测试用参数：时间窗口压缩到毫秒级，避免拖慢用例。
    pub fn for_testing() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            retry_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            save_debounce: Duration::from_millis(20),
            history_limit: 50,
            min_payload_bytes: 64,
            storage_headroom_bytes: 0,
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
        }
    }
}
