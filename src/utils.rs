// src/utils.rs

use regex::Regex;
use std::{
    ffi::OsStr,
    path::Path,
    sync::LazyLock,
};

pub const MAX_FILENAME_BYTES: usize = 200;

static ILLEGAL_CHARS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|]"#).unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// 清洗落盘文件名：剔除非法字符、压缩空白、规避 Windows 保留名并按
/// UTF-8 边界截断（保留扩展名）。
pub fn sanitize_filename(name: &str) -> String {
    let original_name = name.trim();
    if original_name.is_empty() {
        return "unknown".to_string();
    }

    let stem = Path::new(original_name)
        .file_stem()
        .unwrap_or_else(|| OsStr::new(original_name))
        .to_string_lossy()
        .to_uppercase();
    let windows_reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    let mut name = if windows_reserved.contains(&stem.as_ref()) {
        format!("_{}", original_name)
    } else {
        original_name.to_string()
    };

    name = ILLEGAL_CHARS_RE.replace_all(&name, " ").into_owned();
    name = WHITESPACE_RE.replace_all(&name, " ").trim().to_string();
    name = name
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string();
    if name.is_empty() {
        return "unnamed".to_string();
    }

    if name.as_bytes().len() > MAX_FILENAME_BYTES {
        if let (Some(stem_part), Some(ext)) =
            (Path::new(&name).file_stem(), Path::new(&name).extension())
        {
            let stem_part_str = stem_part.to_string_lossy();
            let ext_str = format!(".{}", ext.to_string_lossy());
            let max_stem_bytes = MAX_FILENAME_BYTES.saturating_sub(ext_str.as_bytes().len());
            let truncated_stem = safe_truncate_utf8(&stem_part_str, max_stem_bytes);
            name = format!("{}{}", truncated_stem, ext_str);
        } else {
            name = safe_truncate_utf8(&name, MAX_FILENAME_BYTES).to_string();
        }
    }
    name
}

fn safe_truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut i = max_bytes;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    &s[..i]
}

/// 完成件命名: `{taskId}_{原始文件名}`，靠任务 id 前缀避免同名冲突。
pub fn completed_file_name(task_id: &str, original: &str) -> String {
    format!("{}_{}", task_id, sanitize_filename(original))
}

/// 磁盘可用空间探针。准入检查走这里，测试可注入固定容量。
pub trait DiskProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> u64;
}

/// 基于 sysinfo 的真实探针：取挂载点与目标路径前缀匹配最长的磁盘。
pub struct SysinfoDiskProbe;

impl DiskProbe for SysinfoDiskProbe {
    fn available_bytes(&self, path: &Path) -> u64 {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut best: Option<(usize, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let depth = mount.components().count();
                if best.map_or(true, |(d, _)| depth > d) {
                    best = Some((depth, disk.available_space()));
                }
            }
        }
        best.map(|(_, avail)| avail)
            .or_else(|| disks.list().first().map(|d| d.available_space()))
            .unwrap_or(u64::MAX)
    }
}

/// 固定容量探针，测试专用。
pub struct FixedDiskProbe(pub u64);

impl DiskProbe for FixedDiskProbe {
    fn available_bytes(&self, _path: &Path) -> u64 {
        self.0
    }
}
