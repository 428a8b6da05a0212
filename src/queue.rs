// src/queue.rs

use crate::{
    error::{AppError, AppResult},
    models::{DownloadTask, HistoryEntry, QueueSnapshot, TaskStatus, SNAPSHOT_VERSION},
    store::{HistoryLog, ResumeTokenStore, StateStore},
};
use chrono::Utc;
use log::{debug, info, warn};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    sync::Mutex,
};
use tokio::sync::watch;

struct QueueInner {
    order: Vec<String>,
    tasks: HashMap<String, DownloadTask>,
    paused: bool,
    max_concurrent: usize,
}

impl QueueInner {
    fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| t.status.is_active()).count()
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            order: self.order.clone(),
            tasks: self
                .tasks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            paused: self.paused,
            max_concurrent: self.max_concurrent,
        }
    }
}

/// 任务状态的唯一持有者。所有变更都在内部互斥锁下串行执行，对并发
/// 调用方呈现线性一致的语义。
///
/// 纪律：持锁期间绝不向外调用——持久化调度、历史追加、watch 通知
/// 一律在锁释放之后进行。
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    state_store: StateStore,
    resume_store: ResumeTokenStore,
    history: HistoryLog,
    active_tx: watch::Sender<usize>,
}

/// 一次变更在锁外需要补做的事情。
#[derive(Default)]
struct SideEffects {
    snapshot: Option<QueueSnapshot>,
    active_count: Option<usize>,
    history: Option<HistoryEntry>,
    delete_token: Option<String>,
}

impl TaskQueue {
    pub fn new(
        max_concurrent: usize,
        state_store: StateStore,
        resume_store: ResumeTokenStore,
        history: HistoryLog,
    ) -> Self {
        let (active_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(QueueInner {
                order: Vec::new(),
                tasks: HashMap::new(),
                paused: false,
                max_concurrent: max_concurrent.max(1),
            }),
            state_store,
            resume_store,
            history,
            active_tx,
        }
    }

    /// 活跃任务数（Downloading/Extracting）的订阅端。只有计数真正
    /// 变化时才会收到通知，进度噪音不会触发。
    pub fn subscribe_active(&self) -> watch::Receiver<usize> {
        self.active_tx.subscribe()
    }

    fn apply_effects(&self, effects: SideEffects) {
        if let Some(id) = effects.delete_token {
            self.resume_store.delete(&id);
        }
        if let Some(entry) = effects.history {
            if let Err(e) = self.history.record(entry) {
                warn!("写入历史日志失败: {}", e);
            }
        }
        if let Some(count) = effects.active_count {
            self.active_tx.send_if_modified(|current| {
                if *current == count {
                    false
                } else {
                    *current = count;
                    true
                }
            });
        }
        if let Some(snapshot) = effects.snapshot {
            self.state_store.schedule_save(snapshot);
        }
    }

    // ------------------------------------------------------------------
    // 插入 / 删除 / 排序
    // ------------------------------------------------------------------

    /// 入队。重复 id 是无操作，返回 false。
    pub fn enqueue(&self, task: DownloadTask) -> bool {
        self.enqueue_all(vec![task]) == 1
    }

    /// 批量入队，返回实际接收的任务数（重复 id 被跳过）。
    pub fn enqueue_all(&self, tasks: Vec<DownloadTask>) -> usize {
        let mut effects = SideEffects::default();
        let accepted = {
            let mut inner = self.inner.lock().unwrap();
            let mut accepted = 0;
            for task in tasks {
                if inner.tasks.contains_key(&task.id) {
                    debug!("忽略重复入队的任务 '{}'", task.id);
                    continue;
                }
                inner.order.push(task.id.clone());
                inner.tasks.insert(task.id.clone(), task);
                accepted += 1;
            }
            if accepted > 0 {
                effects.snapshot = Some(inner.snapshot());
            }
            accepted
        };
        self.apply_effects(effects);
        accepted
    }

    /// 删除任务及其续传令牌。
    pub fn remove(&self, id: &str) -> bool {
        let mut effects = SideEffects::default();
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.tasks.remove(id).is_some();
            if removed {
                inner.order.retain(|x| x != id);
                effects.delete_token = Some(id.to_string());
                effects.active_count = Some(inner.active_count());
                effects.snapshot = Some(inner.snapshot());
            }
            removed
        };
        self.apply_effects(effects);
        removed
    }

    /// 下一个可准入的任务：顺序表中第一个 Pending，全局暂停或已达
    /// 并发上限时返回 None。
    pub fn next_pending(&self) -> Option<DownloadTask> {
        let inner = self.inner.lock().unwrap();
        if inner.paused || inner.active_count() >= inner.max_concurrent {
            return None;
        }
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .find(|t| t.status == TaskStatus::Pending)
            .cloned()
    }

    /// 插队：把任务移到第一个 pending/queued 任务之前，O(1) 语义的
    /// "跳到队首"，不重排整个列表。
    pub fn prioritize(&self, id: &str) -> bool {
        let mut effects = SideEffects::default();
        let moved = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.tasks.contains_key(id) {
                return false;
            }
            let Some(from) = inner.order.iter().position(|x| x == id) else {
                return false;
            };
            let insert_at = inner
                .order
                .iter()
                .position(|other| {
                    other != id
                        && inner.tasks.get(other).is_some_and(|t| {
                            matches!(t.status, TaskStatus::Pending | TaskStatus::Queued)
                        })
                })
                .unwrap_or(inner.order.len());
            if from == insert_at {
                return false;
            }
            let taken = inner.order.remove(from);
            // 前移删除后插入点左移一位
            let insert_at = if from < insert_at { insert_at - 1 } else { insert_at };
            inner.order.insert(insert_at, taken);
            effects.snapshot = Some(inner.snapshot());
            true
        };
        self.apply_effects(effects);
        moved
    }

    // ------------------------------------------------------------------
    // 状态迁移
    // ------------------------------------------------------------------

    /// 任意变更入口。回调在锁内执行，只允许改任务自身的字段。
    pub fn update_task(
        &self,
        id: &str,
        f: impl FnOnce(&mut DownloadTask),
    ) -> Option<DownloadTask> {
        let mut effects = SideEffects::default();
        let updated = {
            let mut inner = self.inner.lock().unwrap();
            let before_active = inner.active_count();
            let task = inner.tasks.get_mut(id)?;
            f(task);
            let updated = task.clone();
            let after_active = inner.active_count();
            if after_active != before_active {
                effects.active_count = Some(after_active);
            }
            effects.snapshot = Some(inner.snapshot());
            Some(updated)
        };
        self.apply_effects(effects);
        updated
    }

    /// 受守卫保护的状态迁移。非法迁移静默忽略（幂等无操作），
    /// 用于容忍传输机制的重复/乱序回调。
    fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        mutate: impl FnOnce(&mut DownloadTask),
    ) -> Option<DownloadTask> {
        let mut effects = SideEffects::default();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            let before_active = inner.active_count();
            let task = inner.tasks.get_mut(id)?;
            if !TaskStatus::can_transition(task.status, to) {
                debug!(
                    "忽略任务 '{}' 的非法迁移 {:?} -> {:?}",
                    id, task.status, to
                );
                return None;
            }
            task.status = to;
            mutate(task);
            let updated = task.clone();

            if to.is_terminal() {
                effects.history = Some(HistoryEntry::from_task(
                    &updated,
                    to == TaskStatus::Completed,
                ));
            }
            let after_active = inner.active_count();
            if after_active != before_active {
                effects.active_count = Some(after_active);
            }
            effects.snapshot = Some(inner.snapshot());
            Some(updated)
        };
        self.apply_effects(effects);
        result
    }

    pub fn mark_queued(&self, id: &str) -> Option<DownloadTask> {
        self.transition(id, TaskStatus::Queued, |_| {})
    }

    pub fn mark_downloading(&self, id: &str) -> Option<DownloadTask> {
        self.transition(id, TaskStatus::Downloading, |task| {
            if task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            task.error = None;
        })
    }

    /// 暂停；`token_path` 为协调器刚持久化的续传令牌位置。
    pub fn mark_paused(&self, id: &str, token_path: Option<PathBuf>) -> Option<DownloadTask> {
        self.transition(id, TaskStatus::Paused, |task| {
            if token_path.is_some() {
                task.resume_token_path = token_path;
            }
        })
    }

    pub fn mark_extracting(&self, id: &str) -> Option<DownloadTask> {
        self.transition(id, TaskStatus::Extracting, |_| {})
    }

    /// 完成：进度封顶为 1，重试预算归零，续传令牌删除。
    pub fn mark_completed(&self, id: &str) -> Option<DownloadTask> {
        let result = self.transition(id, TaskStatus::Completed, |task| {
            task.progress = 1.0;
            if task.total_bytes > 0 {
                task.bytes_downloaded = task.total_bytes;
            }
            task.completed_at = Some(Utc::now());
            task.retry_count = 0;
            task.error = None;
            task.resume_token_path = None;
        });
        if result.is_some() {
            self.resume_store.delete(id);
        }
        result
    }

    /// 失败：记录错误文本。带令牌路径时保留令牌供后续重试续传，
    /// 否则连同磁盘上的令牌一起清掉。
    pub fn mark_failed(
        &self,
        id: &str,
        error: impl Into<String>,
        token_path: Option<PathBuf>,
    ) -> Option<DownloadTask> {
        let error = error.into();
        let keep_token = token_path.is_some();
        let result = self.transition(id, TaskStatus::Failed, |task| {
            task.error = Some(error);
            task.completed_at = Some(Utc::now());
            if keep_token {
                task.resume_token_path = token_path;
            } else {
                task.resume_token_path = None;
            }
        });
        if result.is_some() && !keep_token {
            self.resume_store.delete(id);
        }
        result
    }

    /// 重试/重置回待下载。`reset_retries` 为用户显式重试时的预算归零；
    /// 引擎的自动重试不归零。
    pub fn mark_pending(&self, id: &str, reset_retries: bool) -> Option<DownloadTask> {
        self.transition(id, TaskStatus::Pending, |task| {
            task.reset_for_retry();
            if reset_retries {
                task.retry_count = 0;
            }
        })
    }

    /// 可重试失败后的自动重排：非终态任务回到 Pending，重试预算与
    /// 续传令牌引用都保留。这不是状态机里的常规迁移，终态任务不受
    /// 影响。
    pub fn requeue_for_retry(&self, id: &str) -> Option<DownloadTask> {
        let mut effects = SideEffects::default();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            let before_active = inner.active_count();
            let task = inner.tasks.get_mut(id)?;
            if task.status.is_terminal() {
                return None;
            }
            task.status = TaskStatus::Pending;
            let updated = task.clone();
            let after_active = inner.active_count();
            if after_active != before_active {
                effects.active_count = Some(after_active);
            }
            effects.snapshot = Some(inner.snapshot());
            Some(updated)
        };
        self.apply_effects(effects);
        result
    }

    /// 暂停恢复（Paused -> Downloading 之外的部分由协调器完成）。
    pub fn resume_paused(&self, id: &str) -> Option<DownloadTask> {
        // 恢复走常规准入：把 Paused 改回 Pending 会破坏续传令牌语义，
        // 因此这里仅是 Paused -> Downloading 的守卫迁移入口
        self.mark_downloading(id)
    }

    pub fn update_progress(
        &self,
        id: &str,
        written: u64,
        total_expected: i64,
    ) -> Option<DownloadTask> {
        self.update_task(id, |task| task.update_progress(written, total_expected))
    }

    pub fn increment_retry(&self, id: &str) -> Option<u32> {
        self.update_task(id, |task| task.retry_count += 1)
            .map(|t| t.retry_count)
    }

    // ------------------------------------------------------------------
    // 全局开关与查询
    // ------------------------------------------------------------------

    pub fn set_paused(&self, paused: bool) {
        let mut effects = SideEffects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.paused != paused {
                inner.paused = paused;
                effects.snapshot = Some(inner.snapshot());
            }
        }
        self.apply_effects(effects);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn set_max_concurrent(&self, limit: usize) {
        let mut effects = SideEffects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.max_concurrent = limit.max(1);
            effects.snapshot = Some(inner.snapshot());
        }
        self.apply_effects(effects);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().unwrap().max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active_count()
    }

    pub fn get(&self, id: &str) -> Option<DownloadTask> {
        self.inner.lock().unwrap().tasks.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按下载优先级顺序返回全部任务。
    pub fn all_tasks(&self) -> Vec<DownloadTask> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<DownloadTask> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    pub fn tasks_in_category(&self, category: &str) -> Vec<DownloadTask> {
        self.all_tasks()
            .into_iter()
            .filter(|t| t.category == category)
            .collect()
    }

    /// 聚合字节与进度: (已下载, 总量, 整体进度)。总量未知的任务
    /// 不计入进度分母。
    pub fn aggregate_totals(&self) -> (u64, u64, f64) {
        let inner = self.inner.lock().unwrap();
        let mut downloaded = 0u64;
        let mut total = 0u64;
        for task in inner.tasks.values() {
            downloaded += task.bytes_downloaded;
            total += task.total_bytes;
        }
        let progress = if total > 0 {
            (downloaded as f64 / total as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (downloaded, total, progress)
    }

    /// 是否所有任务都已到达终态（空队列返回 false）。
    pub fn all_finished(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.tasks.is_empty() && inner.tasks.values().all(|t| t.status.is_terminal())
    }

    // ------------------------------------------------------------------
    // 快照导入导出与恢复
    // ------------------------------------------------------------------

    pub fn export_state(&self) -> QueueSnapshot {
        self.inner.lock().unwrap().snapshot()
    }

    /// 校验通过后整体替换内存状态。
    pub fn import_state(&self, snapshot: QueueSnapshot) -> AppResult<()> {
        snapshot
            .validate()
            .map_err(AppError::InvalidState)?;
        let mut effects = SideEffects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.order = snapshot.order;
            inner.tasks = snapshot.tasks.into_iter().collect();
            inner.paused = snapshot.paused;
            inner.max_concurrent = snapshot.max_concurrent.max(1);
            effects.active_count = Some(inner.active_count());
            effects.snapshot = Some(inner.snapshot());
        }
        self.apply_effects(effects);
        Ok(())
    }

    /// 进程重启后的恢复：加载上次持久化的快照，把每个 Paused/
    /// Downloading 任务与磁盘上的续传令牌对账（令牌缺失则降级为
    /// Pending 并清零计数），最后清理孤儿令牌文件。
    pub fn restore_state(&self) -> AppResult<usize> {
        let Some(mut snapshot) = self.state_store.load_validated()? else {
            debug!("没有可恢复的队列快照");
            return Ok(0);
        };

        for task in snapshot.tasks.values_mut() {
            match task.status {
                TaskStatus::Downloading | TaskStatus::Paused => {
                    if self.resume_store.exists(&task.id) {
                        // 中断时留有令牌：转为暂停等待续传
                        task.status = TaskStatus::Paused;
                        task.resume_token_path =
                            Some(self.resume_store.token_path(&task.id));
                    } else {
                        info!(
                            "任务 '{}' 重启后无续传令牌，降级为待下载",
                            task.id
                        );
                        task.reset_for_retry();
                        task.resume_token_path = None;
                    }
                }
                // 中间态在重启后不再成立
                TaskStatus::Queued | TaskStatus::Extracting => {
                    task.reset_for_retry();
                }
                _ => {}
            }
        }

        let restored = snapshot.tasks.len();
        let valid_ids: HashSet<String> = snapshot.tasks.keys().cloned().collect();
        self.import_state(snapshot)?;
        self.resume_store.cleanup_orphans(&valid_ids);
        info!("已恢复 {} 个任务", restored);
        Ok(restored)
    }

    /// 立刻把防抖窗口中的最新快照落盘。
    pub fn flush(&self) {
        self.state_store.flush();
    }
}
