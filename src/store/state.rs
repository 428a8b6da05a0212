// src/store/state.rs

use crate::{
    config::StoragePaths,
    error::{AppError, AppResult},
    models::QueueSnapshot,
};
use log::{debug, error, info, warn};
use md5::{Digest, Md5};
use std::{
    fs,
    io::Write as IoWrite,
    sync::{Arc, Mutex},
    time::Duration,
};

struct DebounceSlot {
    /// 防抖窗口内最新待写的快照（后到覆盖先到）。
    pending: Option<QueueSnapshot>,
    /// 是否已有计时器在跑；同一窗口只起一个。
    timer_armed: bool,
    /// 上次成功落盘内容的摘要，用于短路无变化的写入。
    last_digest: Option<[u8; 16]>,
}

/// 队列快照的持久化存储：原子写入（临时文件 + 持久化替换），
/// 防抖合并密集的保存请求，加载时校验并尝试修复。
#[derive(Clone)]
pub struct StateStore {
    paths: StoragePaths,
    debounce: Duration,
    slot: Arc<Mutex<DebounceSlot>>,
}

impl StateStore {
    pub fn new(paths: StoragePaths, debounce: Duration) -> Self {
        Self {
            paths,
            debounce,
            slot: Arc::new(Mutex::new(DebounceSlot {
                pending: None,
                timer_armed: false,
                last_digest: None,
            })),
        }
    }

    /// 立即序列化并原子写入。读者永远看不到半截文件。
    pub fn save(&self, snapshot: &QueueSnapshot) -> AppResult<()> {
        let serialized = serde_json::to_string_pretty(snapshot)?;
        self.write_if_changed(serialized)
    }

    /// 防抖保存：窗口（默认 1s）内的多次请求合并为一次写入，
    /// 始终写最后一次提交的快照。
    pub fn schedule_save(&self, snapshot: QueueSnapshot) {
        let mut slot = self.slot.lock().unwrap();
        slot.pending = Some(snapshot);
        if slot.timer_armed {
            return;
        }
        slot.timer_armed = true;
        drop(slot);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // 无运行时环境（例如同步测试），退化为直接写
            self.flush();
            return;
        };
        let store = self.clone();
        let debounce = self.debounce;
        handle.spawn(async move {
            tokio::time::sleep(debounce).await;
            store.flush();
        });
    }

    /// 立刻写出防抖槽中的最新快照（若有）。调用返回时该快照已落盘，
    /// 不会出现 flush 把窗口内的最新状态静默丢掉的情况。
    pub fn flush(&self) {
        let pending = {
            let mut slot = self.slot.lock().unwrap();
            slot.timer_armed = false;
            slot.pending.take()
        };
        if let Some(snapshot) = pending {
            if let Err(e) = self.save(&snapshot) {
                error!("持久化队列快照失败: {}", e);
            }
        }
    }

    fn write_if_changed(&self, serialized: String) -> AppResult<()> {
        let digest: [u8; 16] = Md5::digest(serialized.as_bytes()).into();
        {
            let slot = self.slot.lock().unwrap();
            if slot.last_digest == Some(digest) {
                debug!("快照内容未变化，跳过本次写入");
                return Ok(());
            }
        }

        fs::create_dir_all(self.paths.root())?;
        let mut tmp = tempfile::NamedTempFile::new_in(self.paths.root())?;
        tmp.write_all(serialized.as_bytes())?;
        tmp.flush()?;
        tmp.persist(self.paths.state_file())?;

        self.slot.lock().unwrap().last_digest = Some(digest);
        debug!("队列快照已写入 {:?}", self.paths.state_file());
        Ok(())
    }

    /// 原样加载，不做校验。文件不存在返回 None。
    pub fn load(&self) -> AppResult<Option<QueueSnapshot>> {
        let path = self.paths.state_file();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// 加载并校验。校验失败先尝试一次修复（按任务集合重建顺序表）；
    /// 修复后仍然非法就清空存储，当作没有历史状态——保证后续运行的
    /// 持久化能力比保留一份救不回来的历史更重要。
    pub fn load_validated(&self) -> AppResult<Option<QueueSnapshot>> {
        let snapshot = match self.load() {
            Ok(Some(s)) => s,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("队列快照无法解析 ({})，按无历史状态处理", e);
                self.clear();
                return Ok(None);
            }
        };

        match snapshot.validate() {
            Ok(()) => Ok(Some(snapshot)),
            Err(reason) => {
                warn!("队列快照校验失败: {}，尝试修复", reason);
                let mut repaired = snapshot;
                repaired.repair();
                match repaired.validate() {
                    Ok(()) => {
                        info!("快照修复成功，共 {} 个任务", repaired.tasks.len());
                        self.save(&repaired)?;
                        Ok(Some(repaired))
                    }
                    Err(reason) => {
                        error!("快照修复后仍非法: {}，清空存储", reason);
                        self.clear();
                        Ok(None)
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        let path = self.paths.state_file();
        if path.exists() {
            let _ = fs::remove_file(&path);
        }
        self.slot.lock().unwrap().last_digest = None;
    }

    /// 手动备份当前快照文件。从不自动触发。
    pub fn backup(&self) -> AppResult<()> {
        let src = self.paths.state_file();
        if !src.exists() {
            return Err(AppError::InvalidState("没有可备份的快照文件".into()));
        }
        fs::copy(&src, self.paths.backup_file())?;
        info!("快照已备份到 {:?}", self.paths.backup_file());
        Ok(())
    }

    /// 从备份覆盖当前快照文件，作为手动恢复路径。
    pub fn restore_backup(&self) -> AppResult<Option<QueueSnapshot>> {
        let bak = self.paths.backup_file();
        if !bak.exists() {
            return Err(AppError::InvalidState("没有可恢复的备份文件".into()));
        }
        fs::copy(&bak, self.paths.state_file())?;
        self.slot.lock().unwrap().last_digest = None;
        self.load_validated()
    }
}
