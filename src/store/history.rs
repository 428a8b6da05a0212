// src/store/history.rs

use crate::{config::StoragePaths, error::AppResult, models::HistoryEntry};
use log::warn;
use std::{
    fs,
    io::Write as IoWrite,
    sync::{Arc, Mutex},
};

/// 终态流水日志：最新在前，条数有上限，独立于队列快照持久化。
#[derive(Clone)]
pub struct HistoryLog {
    paths: StoragePaths,
    limit: usize,
    entries: Arc<Mutex<Vec<HistoryEntry>>>,
}

impl HistoryLog {
    /// 构造时惰性加载既有日志；文件损坏按空日志处理。
    pub fn new(paths: StoragePaths, limit: usize) -> Self {
        let entries = match Self::load_from(&paths) {
            Ok(list) => list,
            Err(e) => {
                warn!("历史日志无法加载 ({})，按空日志处理", e);
                Vec::new()
            }
        };
        Self {
            paths,
            limit,
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    fn load_from(paths: &StoragePaths) -> AppResult<Vec<HistoryEntry>> {
        let path = paths.history_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// 追加一条终态记录并同步落盘（前插，超限截断）。
    pub fn record(&self, entry: HistoryEntry) -> AppResult<()> {
        let serialized = {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(0, entry);
            entries.truncate(self.limit);
            serde_json::to_string_pretty(&*entries)?
        };
        self.persist(&serialized)
    }

    fn persist(&self, serialized: &str) -> AppResult<()> {
        fs::create_dir_all(self.paths.root())?;
        let mut tmp = tempfile::NamedTempFile::new_in(self.paths.root())?;
        tmp.write_all(serialized.as_bytes())?;
        tmp.persist(self.paths.history_file())?;
        Ok(())
    }

    /// 最新在前的全部条目副本。
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> AppResult<()> {
        self.entries.lock().unwrap().clear();
        let path = self.paths.history_file();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadTask, TaskDescriptor};
    use tempfile::tempdir;

    fn entry(id: &str, success: bool) -> HistoryEntry {
        let task = DownloadTask::with_id(
            id.into(),
            TaskDescriptor {
                url: "http://h/a.zip".into(),
                category: "phrases".into(),
                part_index: 0,
                part_count: 1,
                dataset: "asl-core".into(),
                estimated_size: None,
                file_name: None,
            },
        );
        HistoryEntry::from_task(&task, success)
    }

    #[test]
    fn test_record_is_most_recent_first_and_capped() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(StoragePaths::new(dir.path()), 3);

        for i in 0..5 {
            log.record(entry(&format!("t{}", i), true)).unwrap();
        }
        let entries = log.entries();
        // 上限 3 条，最新在前
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].task_id, "t4");
        assert_eq!(entries[2].task_id, "t2");
    }

    #[test]
    fn test_history_survives_reload() {
        let dir = tempdir().unwrap();
        let paths = StoragePaths::new(dir.path());
        {
            let log = HistoryLog::new(paths.clone(), 10);
            log.record(entry("t1", false)).unwrap();
        }
        let reloaded = HistoryLog::new(paths, 10);
        assert_eq!(reloaded.len(), 1);
        assert!(!reloaded.entries()[0].success);
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(StoragePaths::new(dir.path()), 10);
        log.record(entry("t1", true)).unwrap();
        log.clear().unwrap();
        assert!(log.is_empty());
        let reloaded = HistoryLog::new(StoragePaths::new(dir.path()), 10);
        assert!(reloaded.is_empty());
    }
}
