// Chunk Uploader Library
// 可续传的分片上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 公共模块（并发调度、进度节流）
pub mod common;

// 导出常用类型
pub use config::{AppConfig, UploadConfig, UploadOptions};
pub use uploader::{
    FileTask, FileTaskStatus, HookContext, HookOutcome, UploadError, UploadFile, UploadHooks,
    UploadManager, UploadSuccess,
};
