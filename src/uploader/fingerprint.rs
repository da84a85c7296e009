// 文件特征值计算
//
// 按固定窗口顺序读取文件，流式喂给增量摘要：
// - 任意时刻只持有一个窗口的数据（文件可能有几个 GB）
// - 窗口大小与网络分片大小无关，通常更大以减少读取次数
// - 每个窗口后按节流间隔回调进度，最后一个窗口必定回调
// - 每个窗口后检查取消令牌（不受节流影响）
// - 进度回调返回错误即中断计算，错误原样返回给调用方

use crate::common::ProgressThrottler;
use crate::config::HashAlgorithm;
use crate::uploader::blob::{BlobSource, ReadError};
use md5::Context as Md5Context;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 进度回调的节流间隔（毫秒）
pub const HASH_PROGRESS_INTERVAL_MS: u64 = 100;

/// 特征值计算错误
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error(transparent)]
    Read(#[from] ReadError),

    /// 令牌已取消或进度回调要求中断
    #[error("特征值计算已取消")]
    Cancelled,
}

/// 增量摘要
pub trait StreamingDigest: Send {
    fn update(&mut self, data: &[u8]);

    /// 输出小写十六进制摘要
    fn finalize_hex(self: Box<Self>) -> String;
}

/// 摘要算法（可插拔）
pub trait FingerprintAlgorithm: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// 开始一次新的摘要计算
    fn start(&self) -> Box<dyn StreamingDigest>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Fingerprint;

struct Sha256Digest(Sha256);

impl StreamingDigest for Sha256Digest {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

impl FingerprintAlgorithm for Sha256Fingerprint {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn start(&self) -> Box<dyn StreamingDigest> {
        Box::new(Sha256Digest(Sha256::new()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Md5Fingerprint;

struct Md5Digest(Md5Context);

impl StreamingDigest for Md5Digest {
    fn update(&mut self, data: &[u8]) {
        self.0.consume(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        format!("{:x}", self.0.compute())
    }
}

impl FingerprintAlgorithm for Md5Fingerprint {
    fn name(&self) -> &'static str {
        "md5"
    }

    fn start(&self) -> Box<dyn StreamingDigest> {
        Box::new(Md5Digest(Md5Context::new()))
    }
}

/// 根据配置选择算法
pub fn algorithm_for(kind: HashAlgorithm) -> Arc<dyn FingerprintAlgorithm> {
    match kind {
        HashAlgorithm::Sha256 => Arc::new(Sha256Fingerprint),
        HashAlgorithm::Md5 => Arc::new(Md5Fingerprint),
    }
}

/// 特征值计算引擎
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    algorithm: Arc<dyn FingerprintAlgorithm>,
    window_size: u64,
    progress_interval: Duration,
    cancel: Option<CancellationToken>,
}

impl FingerprintEngine {
    pub fn new(algorithm: Arc<dyn FingerprintAlgorithm>, window_size: u64) -> Self {
        Self {
            algorithm,
            window_size: window_size.max(1),
            progress_interval: Duration::from_millis(HASH_PROGRESS_INTERVAL_MS),
            cancel: None,
        }
    }

    /// 调整进度回调的节流间隔
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// 每个窗口之后检查的取消令牌
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn ensure_active(&self) -> Result<(), FingerprintError> {
        match self.cancel {
            Some(ref cancel) if cancel.is_cancelled() => Err(FingerprintError::Cancelled),
            _ => Ok(()),
        }
    }

    /// 计算特征值
    ///
    /// # 参数
    /// * `blob` - 文件内容
    /// * `on_progress` - 进度回调（0-100），返回错误即中断计算
    ///
    /// # 返回
    /// 十六进制摘要
    pub async fn compute<F>(
        &self,
        blob: &dyn BlobSource,
        mut on_progress: F,
    ) -> Result<String, FingerprintError>
    where
        F: FnMut(u8) -> Result<(), FingerprintError>,
    {
        let size = blob.size();
        let windows = size.div_ceil(self.window_size);
        let throttler = ProgressThrottler::new(self.progress_interval);
        let mut digest = self.algorithm.start();

        debug!(
            "开始计算特征值: algorithm={}, size={} bytes, window={} bytes, windows={}",
            self.algorithm.name(),
            size,
            self.window_size,
            windows
        );

        for index in 0..windows {
            let start = index * self.window_size;
            let end = (start + self.window_size).min(size);

            // 读完即丢，不累积
            let bytes = blob.read_range(start..end).await?;
            digest.update(&bytes);
            drop(bytes);
            self.ensure_active()?;

            let done = index + 1;
            if throttler.should_emit_or_final(done == windows) {
                let percent = ((done as f64 / windows as f64) * 100.0).round() as u8;
                on_progress(percent)?;
            }
        }

        // 空文件没有窗口，也要给出完成进度
        if windows == 0 {
            on_progress(100)?;
        }

        Ok(digest.finalize_hex())
    }
}
