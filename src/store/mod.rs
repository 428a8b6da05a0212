// src/store/mod.rs

pub mod history;
pub mod resume;
pub mod state;

pub use history::HistoryLog;
pub use resume::ResumeTokenStore;
pub use state::StateStore;
