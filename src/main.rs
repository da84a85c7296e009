use anyhow::{Context, Result};
use chunk_uploader::{config::AppConfig, logging, uploader::UploadResult, UploadFile, UploadManager};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// 分片上传命令行工具
#[derive(Parser)]
#[command(name = "chunk-uploader")]
#[command(about = "按分片断点续传上传本地文件", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: String,

    /// 待上传的文件
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(&cli.config).await;
    let _log_guard = logging::init_logging(&config.log);

    info!("Chunk Uploader 启动");
    info!("服务端地址: {}", config.upload.server_url);

    let mut files = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        let file = UploadFile::from_path(path)
            .await
            .with_context(|| format!("无法打开文件: {}", path.display()))?;
        info!("待上传: {} ({} bytes)", file.name, file.size());
        files.push(file);
    }

    let manager = UploadManager::with_config(config.upload.clone());
    let _subscription = manager.subscribe(|state| {
        for task in state.values() {
            tracing::debug!("{} [{:?}] {:.2}%", task.name, task.status, task.progress);
        }
    });

    let batch = manager.start_batch(files, None);
    tokio::pin!(batch);

    let outcome = tokio::select! {
        outcome = &mut batch => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，取消全部任务...");
            manager.reset();
            batch.await
        }
    };

    let result = match outcome {
        Ok(successes) => {
            for success in &successes {
                info!("✅ {} -> {}", success.file.name, success.fingerprint);
                if let Some(ref payload) = success.payload {
                    info!("   {}", payload);
                }
            }
            Ok(())
        }
        Err(batch_error) => {
            for result in &batch_error.results {
                match result {
                    UploadResult::Success(success) => {
                        info!("✅ {} -> {}", success.file.name, success.fingerprint)
                    }
                    UploadResult::Error { file, error, .. } => {
                        error!("❌ {}: {}", file.name, error)
                    }
                    UploadResult::Cancelled { file, .. } => warn!("⏹ {}: 已取消", file.name),
                }
            }
            error!("{}", batch_error.message);
            Err(anyhow::anyhow!(batch_error.message))
        }
    };

    manager.shutdown();
    info!("应用已退出");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["chunk-uploader", "a.bin", "b.bin"]).unwrap();
        assert_eq!(cli.config, "config/app.toml");
        assert_eq!(cli.files, vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")]);
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::try_parse_from(["chunk-uploader", "--config", "custom.toml", "a.bin"]).unwrap();
        assert_eq!(cli.config, "custom.toml");
        assert_eq!(cli.files.len(), 1);
    }

    #[test]
    fn test_cli_requires_files() {
        assert!(Cli::try_parse_from(["chunk-uploader"]).is_err());
        assert!(Cli::try_parse_from(["chunk-uploader", "-c", "x.toml"]).is_err());
    }
}
