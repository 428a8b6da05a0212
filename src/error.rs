// src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("存储空间不足 (需要 {required} 字节，可用 {available} 字节)")]
    InsufficientStorage { required: u64, available: u64 },
    #[error("网络不可用")]
    NetworkUnavailable,
    #[error("无效的 URL: {0}")]
    InvalidUrl(String),
    #[error("文件移动失败: {0}")]
    FileMove(String),
    #[error("续传令牌已损坏，将重新开始下载")]
    CorruptResumeToken,
    #[error("服务器错误 (HTTP {0})")]
    ServerError(u16),
    #[error("客户端错误 (HTTP {0})")]
    ClientError(u16),
    #[error("请求超时")]
    Timeout,
    #[error("任务已被用户取消")]
    Cancelled,
    #[error("连接中断")]
    ConnectionLost,
    #[error("证书校验失败: {0}")]
    Certificate(String),
    #[error("重试次数已达上限 ({0} 次)")]
    MaxRetriesExceeded(u32),
    #[error("快照状态无效: {0}")]
    InvalidState(String),
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("临时文件持久化失败: {0}")]
    TempFilePersist(#[from] tempfile::PersistError),
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
    #[error("URL 解析错误: {0}")]
    Url(#[from] url::ParseError),
    #[error("未知错误: {0}")]
    Other(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// 该错误是否值得消耗一次重试预算后再试。
    pub fn retryable(&self) -> bool {
        match self {
            AppError::NetworkUnavailable
            | AppError::ConnectionLost
            | AppError::Timeout
            | AppError::ServerError(_)
            | AppError::FileMove(_)
            | AppError::CorruptResumeToken
            | AppError::Io(_)
            | AppError::Other(_) => true,
            AppError::InsufficientStorage { .. }
            | AppError::InvalidUrl(_)
            | AppError::ClientError(_)
            | AppError::Cancelled
            | AppError::Certificate(_)
            | AppError::MaxRetriesExceeded(_)
            | AppError::InvalidState(_)
            | AppError::Json(_)
            | AppError::TempFilePersist(_)
            | AppError::Url(_) => false,
        }
    }

    /// 该错误是否应将任务转入暂停（保留续传令牌），而不是计入失败。
    pub fn auto_pause(&self) -> bool {
        matches!(
            self,
            AppError::NetworkUnavailable | AppError::ConnectionLost
        )
    }

    /// 将 reqwest 层的错误归类到本地错误分类。
    pub fn from_http(err: &reqwest::Error) -> AppError {
        if err.is_timeout() {
            return AppError::Timeout;
        }
        if let Some(status) = err.status() {
            return AppError::from_status(status.as_u16());
        }
        if err.is_connect() {
            // 证书问题在 reqwest 中表现为连接失败，按文本特征区分
            let text = err.to_string();
            if text.contains("certificate") || text.contains("tls") {
                return AppError::Certificate(text);
            }
            return AppError::ConnectionLost;
        }
        if err.is_request() || err.is_body() || err.is_decode() {
            return AppError::ConnectionLost;
        }
        AppError::Other(anyhow::anyhow!("HTTP 请求失败: {}", err))
    }

    pub fn from_status(status: u16) -> AppError {
        match status {
            500..=599 => AppError::ServerError(status),
            400..=499 => AppError::ClientError(status),
            _ => AppError::Other(anyhow::anyhow!("非预期的 HTTP 状态码: {}", status)),
        }
    }
}
