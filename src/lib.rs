// src/lib.rs

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod network;
pub mod progress;
pub mod queue;
pub mod store;
pub mod transfer;
pub mod utils;

pub use config::{EngineConfig, EngineConfigFromFile, StoragePaths};
pub use coordinator::TransferCoordinator;
pub use engine::DownloadEngine;
pub use error::{AppError, AppResult};
pub use events::{EngineDelegate, EngineEvent, NopDelegate};
pub use models::{
    DownloadTask, HistoryEntry, QueueSnapshot, TaskDescriptor, TaskStatus,
};
pub use network::{LinkType, NetworkMonitor, NetworkStatus};
pub use progress::{ProgressTracker, RateEstimate};
pub use queue::TaskQueue;
pub use store::{HistoryLog, ResumeTokenStore, StateStore};
pub use transfer::{
    HttpTransferBackend, JobHandle, JobTable, TransferBackend, TransferEvent,
};
