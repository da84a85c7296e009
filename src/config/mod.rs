// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 默认特征值读取窗口: 10MB（比分片大，减少读取次数）
pub const DEFAULT_HASH_WINDOW_SIZE: u64 = 10 * 1024 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 特征值算法
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256（默认）
    #[default]
    Sha256,
    /// MD5（兼容只认 MD5 的老服务端）
    Md5,
}

/// 默认协议的接口路径
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiPaths {
    /// 已上传分片查询
    #[serde(default = "default_check_path")]
    pub check: String,
    /// 分片上传
    #[serde(default = "default_upload_path")]
    pub upload: String,
    /// 分片合并
    #[serde(default = "default_merge_path")]
    pub merge: String,
}

fn default_check_path() -> String {
    "/upload_already".to_string()
}

fn default_upload_path() -> String {
    "/upload_chunk".to_string()
}

fn default_merge_path() -> String {
    "/upload_merge".to_string()
}

impl Default for ApiPaths {
    fn default() -> Self {
        Self {
            check: default_check_path(),
            upload: default_upload_path(),
            merge: default_merge_path(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 服务端基础地址
    pub server_url: String,
    /// 鉴权令牌（以 Bearer 方式携带）
    pub token: Option<String>,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 最大同时上传文件数
    pub upload_concurrency: usize,
    /// 最大同时计算特征值的文件数
    pub hash_concurrency: usize,
    /// 单个文件最大并发分片数
    pub chunk_concurrency: usize,
    /// 是否在上传前查询已上传分片
    pub check_enabled: bool,
    /// 有上传任务进行时是否提示阻止关闭
    pub prevent_close: bool,
    /// 是否输出任务执行端的详细日志
    pub show_log: bool,
    /// 特征值读取窗口大小（字节）
    pub hash_window_size: u64,
    /// 特征值算法
    pub algorithm: HashAlgorithm,
    /// 默认协议的接口路径
    pub api_paths: ApiPaths,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            upload_concurrency: 3,
            hash_concurrency: 3,
            chunk_concurrency: 3,
            check_enabled: true,
            prevent_close: true,
            show_log: false,
            hash_window_size: DEFAULT_HASH_WINDOW_SIZE,
            algorithm: HashAlgorithm::Sha256,
            api_paths: ApiPaths::default(),
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.hash_window_size == 0 {
            anyhow::bail!("特征值读取窗口必须大于 0");
        }
        Ok(())
    }

    /// 叠加单次调用的覆盖项，得到本次任务实际使用的配置
    pub fn merged(&self, options: &UploadOptions) -> UploadConfig {
        let mut config = self.clone();
        if let Some(ref server_url) = options.server_url {
            config.server_url = server_url.clone();
        }
        if options.token.is_some() {
            config.token = options.token.clone();
        }
        if let Some(chunk_size) = options.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(chunk_concurrency) = options.chunk_concurrency {
            config.chunk_concurrency = chunk_concurrency;
        }
        if let Some(check_enabled) = options.check_enabled {
            config.check_enabled = check_enabled;
        }
        if let Some(show_log) = options.show_log {
            config.show_log = show_log;
        }
        if let Some(hash_window_size) = options.hash_window_size {
            config.hash_window_size = hash_window_size;
        }
        if let Some(algorithm) = options.algorithm {
            config.algorithm = algorithm;
        }
        if let Some(ref api_paths) = options.api_paths {
            config.api_paths = api_paths.clone();
        }
        config
    }
}

/// 单次上传调用的配置覆盖项
///
/// 并发上限属于调度器，不能按次覆盖
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadOptions {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub chunk_size: Option<u64>,
    pub chunk_concurrency: Option<usize>,
    pub check_enabled: Option<bool>,
    pub show_log: Option<bool>,
    pub hash_window_size: Option<u64>,
    pub algorithm: Option<HashAlgorithm>,
    pub api_paths: Option<ApiPaths>,
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.upload.upload_concurrency, 3);
        assert_eq!(config.upload.hash_concurrency, 3);
        assert_eq!(config.upload.chunk_concurrency, 3);
        assert!(config.upload.check_enabled);
        assert_eq!(config.upload.api_paths.merge, "/upload_merge");
        assert_eq!(config.log.level, "info");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.server_url = "http://127.0.0.1:3000".to_string();
        config.upload.algorithm = HashAlgorithm::Md5;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.server_url, "http://127.0.0.1:3000");
        assert_eq!(loaded.upload.algorithm, HashAlgorithm::Md5);
        assert_eq!(loaded.upload.chunk_size, config.upload.chunk_size);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            server_url = "https://files.example.com"
            chunk_concurrency = 6

            [upload.api_paths]
            merge = "/merge"
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.chunk_concurrency, 6);
        assert_eq!(config.upload.upload_concurrency, 3);
        assert_eq!(config.upload.api_paths.merge, "/merge");
        assert_eq!(config.upload.api_paths.check, "/upload_already");
        assert!(!config.log.enabled);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        tokio::fs::write(path, "[upload]\nchunk_size = 0\n")
            .await
            .unwrap();

        assert!(AppConfig::load_from_file(path).await.is_err());
        let fallback = AppConfig::load_or_default(path).await;
        assert_eq!(fallback.upload.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_merged_options() {
        let base = UploadConfig::default();
        let options = UploadOptions {
            chunk_size: Some(1024),
            token: Some("secret".to_string()),
            ..Default::default()
        };

        let merged = base.merged(&options);
        assert_eq!(merged.chunk_size, 1024);
        assert_eq!(merged.token.as_deref(), Some("secret"));
        assert_eq!(merged.chunk_concurrency, base.chunk_concurrency);
        // 原配置不受影响
        assert_eq!(base.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
