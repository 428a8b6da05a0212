// src/events.rs

use crate::{models::DownloadTask, network::NetworkStatus};

/// 引擎对外的生命周期事件。表现层只能通过这条通道得知状态变化。
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TaskUpdated(DownloadTask),
    TaskStarted(DownloadTask),
    TaskCompleted(DownloadTask),
    TaskFailed(DownloadTask),
    RunningChanged(bool),
    PausedChanged(bool),
    NetworkChanged(NetworkStatus),
    AllTasksFinished,
}

/// 表现层观察者接口。所有方法都有空实现，订阅方只覆写关心的事件。
pub trait EngineDelegate: Send + Sync {
    fn on_task_updated(&self, _task: &DownloadTask) {}
    fn on_task_started(&self, _task: &DownloadTask) {}
    fn on_task_completed(&self, _task: &DownloadTask) {}
    fn on_task_failed(&self, _task: &DownloadTask) {}
    fn on_running_changed(&self, _running: bool) {}
    fn on_paused_changed(&self, _paused: bool) {}
    fn on_network_changed(&self, _status: NetworkStatus) {}
    fn on_all_tasks_finished(&self) {}

    /// 统一入口；默认按事件类型分发到上面的细分方法。
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::TaskUpdated(t) => self.on_task_updated(t),
            EngineEvent::TaskStarted(t) => self.on_task_started(t),
            EngineEvent::TaskCompleted(t) => self.on_task_completed(t),
            EngineEvent::TaskFailed(t) => self.on_task_failed(t),
            EngineEvent::RunningChanged(v) => self.on_running_changed(*v),
            EngineEvent::PausedChanged(v) => self.on_paused_changed(*v),
            EngineEvent::NetworkChanged(s) => self.on_network_changed(*s),
            EngineEvent::AllTasksFinished => self.on_all_tasks_finished(),
        }
    }
}

/// 什么都不做的观察者，用于不关心事件的宿主。
pub struct NopDelegate;

impl EngineDelegate for NopDelegate {}
