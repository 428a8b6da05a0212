// src/logging.rs

use log::warn;
use std::{env, path::PathBuf};

const LOG_FILE_NAME: &str = "odc-dl.log";
const LOG_FALLBACK_FILE_NAME: &str = "fallback.log";

/// 初始化文件日志。宿主应用在进程启动时调用一次；重复调用或宿主
/// 已自行安装 logger 时静默失败。
pub fn init_logging(level: log::LevelFilter, storage_root: Option<PathBuf>) {
    if level == log::LevelFilter::Off {
        return;
    }

    // 优先写到存储根目录，与其余持久化文件放在一起
    let log_file_path = match storage_root {
        Some(root) => root.join(LOG_FILE_NAME),
        None => {
            eprintln!("警告: 未提供存储根目录，日志将写入临时目录。");
            env::temp_dir().join("odc-dl").join(LOG_FILE_NAME)
        }
    };

    if let Some(dir) = log_file_path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("警告: 无法创建日志目录 {:?}: {}", dir, e);
        }
    }

    let file_appender = match fern::log_file(&log_file_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!(
                "警告: 无法打开主日志文件 {:?} : {}。将尝试使用备用日志文件。",
                log_file_path, e
            );
            let fallback_path =
                std::env::temp_dir().join(format!("odc-dl-{}", LOG_FALLBACK_FILE_NAME));
            match fern::log_file(&fallback_path) {
                Ok(fb_file) => {
                    warn!("日志将写入备用文件: {:?}", fallback_path);
                    fb_file
                }
                Err(e_fb) => {
                    eprintln!(
                        "错误: 无法创建主日志和备用日志文件 {:?}: {}。日志将不会被记录到文件。",
                        fallback_path, e_fb
                    );
                    return;
                }
            }
        }
    };

    let result = fern::Dispatch::new()
        .level(level)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{:<5}] [{}:{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                message
            ))
        })
        .chain(file_appender)
        .apply();

    if let Err(e) = result {
        eprintln!("警告: 日志系统初始化失败: {}", e);
    }
}
