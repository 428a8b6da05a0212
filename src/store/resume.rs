// src/store/resume.rs

use crate::{config::StoragePaths, error::AppResult};
use log::{debug, info, warn};
use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    time::{Duration, SystemTime},
};

/// 续传令牌的平面文件存储：每个任务 id 一个 `<id>.token` 文件。
/// 令牌内容对本子系统是不透明的，只做最轻量的封套嗅探。
#[derive(Debug, Clone)]
pub struct ResumeTokenStore {
    paths: StoragePaths,
}

impl ResumeTokenStore {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }

    pub fn token_path(&self, task_id: &str) -> PathBuf {
        self.paths.resume_token_file(task_id)
    }

    pub fn save(&self, task_id: &str, token: &[u8]) -> AppResult<PathBuf> {
        fs::create_dir_all(self.paths.resume_dir())?;
        let path = self.token_path(task_id);
        fs::write(&path, token)?;
        debug!("已保存任务 '{}' 的续传令牌 ({} 字节)", task_id, token.len());
        Ok(path)
    }

    /// 读取令牌；文件不存在返回 None，封套明显损坏的令牌会被当场删除
    /// 并同样返回 None（宁可从头下载，不拿坏令牌去续传）。
    pub fn load_valid(&self, task_id: &str) -> AppResult<Option<Vec<u8>>> {
        let path = self.token_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        if !Self::looks_valid(&bytes) {
            warn!("任务 '{}' 的续传令牌已损坏，删除之", task_id);
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.token_path(task_id).exists()
    }

    pub fn delete(&self, task_id: &str) {
        let path = self.token_path(task_id);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("删除任务 '{}' 的续传令牌失败: {}", task_id, e);
            }
        }
    }

    pub fn delete_all(&self) {
        if let Ok(entries) = fs::read_dir(self.paths.resume_dir()) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// 清除任务 id 已不存在的孤儿令牌文件，返回清除数量。
    pub fn cleanup_orphans(&self, valid_ids: &HashSet<String>) -> usize {
        let mut removed = 0;
        let Ok(entries) = fs::read_dir(self.paths.resume_dir()) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !valid_ids.contains(stem) {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("已清理 {} 个孤儿续传令牌", removed);
        }
        removed
    }

    /// 按文件修改时间清除过老的令牌，返回清除数量。
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        let Ok(entries) = fs::read_dir(self.paths.resume_dir()) else {
            return 0;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if now.duration_since(modified).map_or(false, |age| age > max_age) {
                if fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("已清理 {} 个过期续传令牌", removed);
        }
        removed
    }

    /// 封套嗅探：接受二进制 plist (`bplist00`)、XML (`<?xml`) 或
    /// 本库 HTTP 后端的 JSON 对象。空文件一律视为损坏。
    pub fn looks_valid(bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }
        bytes.starts_with(b"bplist00")
            || bytes.starts_with(b"<?xml")
            || bytes.first() == Some(&b'{')
    }
}
