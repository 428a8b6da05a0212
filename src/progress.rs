// src/progress.rs

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

/// 滑动窗口最多保留的采样数。
const WINDOW_CAP: usize = 10;
/// 两次采样之间的最小间隔，更密的进度回调直接丢弃。
const MIN_SAMPLE_SPACING: Duration = Duration::from_millis(500);
/// 指数滑动平均的平滑系数。
const EMA_ALPHA: f64 = 0.3;
/// 超过该值的预计剩余时间视为无意义，不再展示。
const MAX_ETA: Duration = Duration::from_secs(24 * 60 * 60);

/// 某任务当前的速率估计。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimate {
    pub bytes_per_sec: f64,
    /// 速率为零或剩余时间超过上限时为 None。
    pub eta: Option<Duration>,
}

struct TaskWindow {
    /// (采样时刻, 累计已下载字节)。
    samples: VecDeque<(Instant, u64)>,
    ema: f64,
    /// 最近一次上报的字节数，节流丢弃的采样也会刷新它。
    latest: u64,
}

impl TaskWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_CAP),
            ema: 0.0,
            latest: 0,
        }
    }

    fn push(&mut self, at: Instant, bytes: u64) {
        self.latest = bytes;
        if let Some(&(last_at, last_bytes)) = self.samples.back() {
            if at.duration_since(last_at) < MIN_SAMPLE_SPACING {
                return;
            }
            // 字节计数回退（例如续传点失效后重下）时清窗重来
            if bytes < last_bytes {
                self.samples.clear();
                self.ema = 0.0;
                self.samples.push_back((at, bytes));
                return;
            }
            let dt = at.duration_since(last_at).as_secs_f64();
            if dt > 0.0 {
                let instant_rate = (bytes - last_bytes) as f64 / dt;
                self.ema = if self.ema == 0.0 {
                    instant_rate
                } else {
                    EMA_ALPHA * instant_rate + (1.0 - EMA_ALPHA) * self.ema
                };
            }
        }
        if self.samples.len() == WINDOW_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back((at, bytes));
    }

    /// 窗口首尾差分速率；样本不足时退回 EMA。
    fn rate(&self) -> f64 {
        if self.samples.len() >= 2 {
            let (first_at, first_bytes) = self.samples.front().copied().unwrap();
            let (last_at, last_bytes) = self.samples.back().copied().unwrap();
            let dt = last_at.duration_since(first_at).as_secs_f64();
            if dt > 0.0 {
                return (last_bytes.saturating_sub(first_bytes)) as f64 / dt;
            }
        }
        self.ema
    }
}

struct TrackerInner {
    tasks: HashMap<String, TaskWindow>,
    /// 全局窗口：采样值是所有任务的字节总和。
    aggregate: TaskWindow,
}

/// 下载速率与剩余时间估计器，按任务与全局两个粒度维护滑动窗口。
/// 进度回调的频率由传输机制决定，这里负责节流采样、平滑噪声。
pub struct ProgressTracker {
    inner: Mutex<TrackerInner>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                tasks: HashMap::new(),
                aggregate: TaskWindow::new(),
            }),
        }
    }

    pub fn record(&self, task_id: &str, bytes_downloaded: u64) {
        self.record_at(task_id, bytes_downloaded, Instant::now());
    }

    fn record_at(&self, task_id: &str, bytes_downloaded: u64, at: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(TaskWindow::new)
            .push(at, bytes_downloaded);
        let sum: u64 = inner.tasks.values().map(|w| w.latest).sum();
        inner.aggregate.push(at, sum);
    }

    /// 当前速率与 ETA。`total_bytes` 为 0（未知总量）时 ETA 为 None。
    pub fn estimate(&self, task_id: &str, bytes_downloaded: u64, total_bytes: u64) -> RateEstimate {
        let inner = self.inner.lock().unwrap();
        let rate = inner.tasks.get(task_id).map(|w| w.rate()).unwrap_or(0.0);
        Self::with_eta(rate, bytes_downloaded, total_bytes)
    }

    /// 全局吞吐估计：全局窗口有足够采样时取首尾差分，否则退回
    /// 各任务 EMA 之和。`bytes/total` 取队列的聚合计数。
    pub fn aggregate_estimate(&self, bytes_downloaded: u64, total_bytes: u64) -> RateEstimate {
        let inner = self.inner.lock().unwrap();
        let rate = if inner.aggregate.samples.len() >= 2 {
            inner.aggregate.rate()
        } else {
            inner.tasks.values().map(|w| w.ema).sum()
        };
        Self::with_eta(rate, bytes_downloaded, total_bytes)
    }

    fn with_eta(rate: f64, bytes_downloaded: u64, total_bytes: u64) -> RateEstimate {
        let eta = if rate > 0.0 && total_bytes > bytes_downloaded {
            let remaining = (total_bytes - bytes_downloaded) as f64;
            let eta = Duration::from_secs_f64(remaining / rate);
            (eta <= MAX_ETA).then_some(eta)
        } else {
            None
        };
        RateEstimate {
            bytes_per_sec: rate,
            eta,
        }
    }

    /// 任务结束（完成/失败/暂停）后丢弃其采样窗口。全局窗口随后的
    /// 总和回退会触发清窗，自动从剩余任务重建。
    pub fn reset(&self, task_id: &str) {
        self.inner.lock().unwrap().tasks.remove(task_id);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.clear();
        inner.aggregate = TaskWindow::new();
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
