//! 日志系统配置
//!
//! 控制台输出始终开启；启用持久化时另写一份到日志目录，
//! 按单文件大小滚动，启动时清理超过保留天数的旧文件。

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "chunk-uploader.";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志文件管理器（内部状态）
struct LogFileManagerInner {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    current_file: Option<File>,
    /// 当前文件序号（0 为基础文件）
    current_index: u32,
    max_file_size: u64,
    current_size: u64,
}

impl LogFileManagerInner {
    fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut manager = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            current_file: None,
            current_index: 0,
            max_file_size,
            current_size: 0,
        };
        manager.open_current()?;
        Ok(manager)
    }

    /// 日志文件路径
    ///
    /// - chunk-uploader.YYYY-MM-DD-HHMMSS.log
    /// - chunk-uploader.YYYY-MM-DD-HHMMSS_N.log（滚动文件）
    fn file_path(&self, index: u32) -> PathBuf {
        let filename = if index == 0 {
            format!("{}{}.log", LOG_FILE_PREFIX, self.start_timestamp)
        } else {
            format!("{}{}_{}.log", LOG_FILE_PREFIX, self.start_timestamp, index)
        };
        self.log_dir.join(filename)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let path = self.file_path(self.current_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.current_file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current_file.take() {
            file.flush()?;
        }
        self.current_index += 1;
        self.open_current()
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，单条超长日志也要写得进去
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_file_size {
            self.rotate()?;
        }

        match self.current_file {
            Some(ref mut file) => {
                let written = file.write(buf)?;
                self.current_size += written as u64;
                Ok(written)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush_file(&mut self) -> io::Result<()> {
        match self.current_file {
            Some(ref mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 按大小滚动的日志文件写入器
///
/// 克隆共享同一个文件
#[derive(Clone)]
pub struct LogFileManager {
    inner: Arc<Mutex<LogFileManagerInner>>,
}

impl LogFileManager {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let inner = LogFileManagerInner::new(log_dir, max_file_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// 当前写入的文件
    pub fn current_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        inner.file_path(inner.current_index)
    }
}

impl Write for LogFileManager {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush_file()
    }
}

/// 日志系统守卫
///
/// 必须保持存活，否则文件写入线程会退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// # 参数
/// * `config` - 日志配置
///
/// # 返回
/// 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let (file_layer, file_guard): (Option<BoxedLayer>, Option<WorkerGuard>) = if config.enabled {
        match open_log_file(config) {
            Ok(file_manager) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_manager);
                let layer = fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .boxed();
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("创建日志文件失败: {:?}, 错误: {}, 回退到仅控制台输出", config.log_dir, e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let persisted = file_layer.is_some();
    let layers: Vec<BoxedLayer> =
        std::iter::once(console_layer.boxed()).chain(file_layer).collect();

    // 已有全局订阅器时（例如测试中重复初始化）保持原样
    if tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .is_err()
    {
        return LogGuard { _file_guard: None };
    }

    if persisted {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        cleanup_old_logs(&config.log_dir, config.retention_days);
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_log_file(config: &LogConfig) -> io::Result<LogFileManager> {
    fs::create_dir_all(&config.log_dir)?;
    LogFileManager::new(config.log_dir.clone(), config.max_file_size)
}

/// 清理过期日志文件
///
/// # 返回
/// 删除的文件数
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);
    let mut deleted = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(".log") {
            continue;
        }

        let expired = match extract_date_from_filename(filename)
            .and_then(|d| chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
        {
            Some(date) => today.signed_duration_since(date) > retention,
            // 文件名里没有日期时看修改时间
            None => expired_by_modified_time(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
    deleted
}

/// chunk-uploader.YYYY-MM-DD[-HHMMSS[_N]].log -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<String> {
    let name = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_suffix(".log")?;
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() >= 3 {
        Some(format!("{}-{}-{}", parts[0], parts[1], parts[2]))
    } else {
        None
    }
}

fn expired_by_modified_time(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}
