// src/transfer/http.rs

use super::{JobHandle, TransferBackend, TransferEvent};
use crate::{
    config::EngineConfig,
    error::{AppError, AppResult},
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, warn};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::{fs, io::AsyncWriteExt, sync::mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

/// 参考后端的续传令牌封套。对核心子系统仍是不透明字节串；
/// JSON 对象形态能通过令牌存储的封套嗅探。
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HttpResumeToken {
    url: String,
    temp_path: PathBuf,
    bytes_written: u64,
}

impl HttpResumeToken {
    fn to_bytes(&self) -> Vec<u8> {
        // 结构固定，序列化不会失败
        serde_json::to_vec(self).unwrap_or_default()
    }
}

struct ActiveJob {
    cancel: CancellationToken,
    state: Arc<Mutex<HttpResumeToken>>,
}

/// 基于 reqwest 的流式传输后端：分块写入临时分片文件，
/// Range 续传，取消时尽力产出续传令牌。
pub struct HttpTransferBackend {
    client: reqwest::Client,
    events: mpsc::Sender<TransferEvent>,
    tmp_dir: PathBuf,
    jobs: Arc<DashMap<JobHandle, ActiveJob>>,
}

impl HttpTransferBackend {
    pub fn new(
        config: &EngineConfig,
        tmp_dir: PathBuf,
        events: mpsc::Sender<TransferEvent>,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Other(anyhow::anyhow!("构建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            events,
            tmp_dir,
            jobs: Arc::new(DashMap::new()),
        })
    }

    fn spawn_transfer(&self, job: JobHandle, token: HttpResumeToken, resumed: bool) {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(token));
        self.jobs.insert(
            job,
            ActiveJob {
                cancel: cancel.clone(),
                state: state.clone(),
            },
        );

        let client = self.client.clone();
        let events = self.events.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let outcome = run_transfer(&client, &events, job, &state, &cancel, resumed).await;
            // 取消路径由 cancel() 负责收尾，这里只处理自然结束
            if !cancel.is_cancelled() {
                jobs.remove(&job);
                match outcome {
                    Ok(temp_path) => {
                        let _ = events.send(TransferEvent::Finished { job, temp_path }).await;
                    }
                    Err(error) => {
                        let token = {
                            let st = state.lock().unwrap();
                            (st.bytes_written > 0).then(|| st.to_bytes())
                        };
                        let _ = events.send(TransferEvent::Failed { job, error, token }).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl TransferBackend for HttpTransferBackend {
    async fn start(&self, job: JobHandle, url: &str) -> AppResult<()> {
        if Url::parse(url).is_err() {
            return Err(AppError::InvalidUrl(url.to_string()));
        }
        fs::create_dir_all(&self.tmp_dir).await?;
        let token = HttpResumeToken {
            url: url.to_string(),
            temp_path: self.tmp_dir.join(format!("job-{}.part", job.0)),
            bytes_written: 0,
        };
        debug!("作业 {:?} 开始全新传输: {}", job, url);
        self.spawn_transfer(job, token, false);
        Ok(())
    }

    async fn resume(&self, job: JobHandle, token: Vec<u8>) -> AppResult<()> {
        let mut parsed: HttpResumeToken =
            serde_json::from_slice(&token).map_err(|_| AppError::CorruptResumeToken)?;
        // 令牌与磁盘上的分片对账：分片缺失或短于记录值时回退到实际长度
        let on_disk = fs::metadata(&parsed.temp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if on_disk < parsed.bytes_written {
            warn!(
                "作业 {:?} 的分片比令牌记录短 ({} < {})，从实际偏移续传",
                job, on_disk, parsed.bytes_written
            );
            parsed.bytes_written = on_disk;
        } else if on_disk > parsed.bytes_written {
            // 取消与写入并发时分片可能比令牌多出几个块；必须截断到
            // 令牌偏移，否则服务器补发的区间会被重复追加
            warn!(
                "作业 {:?} 的分片比令牌记录长 ({} > {})，截断到令牌偏移",
                job, on_disk, parsed.bytes_written
            );
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&parsed.temp_path)
                .await?;
            file.set_len(parsed.bytes_written).await?;
        }
        debug!(
            "作业 {:?} 从偏移 {} 续传: {}",
            job, parsed.bytes_written, parsed.url
        );
        self.spawn_transfer(job, parsed, true);
        Ok(())
    }

    async fn cancel(&self, job: JobHandle) -> Option<Vec<u8>> {
        let (_, active) = self.jobs.remove(&job)?;
        active.cancel.cancel();
        let st = active.state.lock().unwrap();
        (st.bytes_written > 0).then(|| st.to_bytes())
    }
}

/// 单次传输执行体。成功返回分片路径，失败返回已分类的错误。
async fn run_transfer(
    client: &reqwest::Client,
    events: &mpsc::Sender<TransferEvent>,
    job: JobHandle,
    state: &Arc<Mutex<HttpResumeToken>>,
    cancel: &CancellationToken,
    resumed: bool,
) -> AppResult<PathBuf> {
    let (url, temp_path, mut offset) = {
        let st = state.lock().unwrap();
        (st.url.clone(), st.temp_path.clone(), st.bytes_written)
    };

    loop {
        let mut request = client.get(&url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Err(AppError::from_http(&e)),
        };

        // 续传点无效：丢弃分片从头来过
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            warn!("作业 {:?} 的续传点 {} 无效，从头下载", job, offset);
            offset = 0;
            state.lock().unwrap().bytes_written = 0;
            let _ = fs::remove_file(&temp_path).await;
            continue;
        }
        if !response.status().is_success() {
            return Err(AppError::from_status(response.status().as_u16()));
        }

        if resumed && offset > 0 {
            let _ = events.send(TransferEvent::ResumedAt { job, offset }).await;
        }

        let total_expected: i64 = response
            .content_length()
            .map(|len| (len + offset) as i64)
            .unwrap_or(-1);

        let mut file = if offset > 0 {
            fs::OpenOptions::new().append(true).open(&temp_path).await?
        } else {
            fs::File::create(&temp_path).await?
        };

        let mut written = offset;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    // 取消方负责后续语义，这里静默退出
                    return Ok(temp_path);
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => return Err(AppError::from_http(&e)),
                    None => break,
                },
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            state.lock().unwrap().bytes_written = written;
            // 进度是尽力而为的通知，通道满了就丢当前样本
            let _ = events.try_send(TransferEvent::Progress {
                job,
                written,
                total_expected,
            });
        }

        file.flush().await?;
        return Ok(temp_path);
    }
}
