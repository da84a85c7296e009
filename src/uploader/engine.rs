// 上传引擎（运行在任务执行端）
//
// 单个文件的完整流程，各阶段严格按序执行：
// 1. 特征值：已提供则跳过，否则流式计算并上报 hash_progress
// 2. init 钩子：取得初始化数据，注入后续上下文
// 3. 分片：{特征值}_{序号}.{扩展名}
// 4. 查询已上传分片（可关闭），失败时降级为全部上传
// 5. 分片上传：每个分片向编排端索取请求描述，受单文件分片并发限制，
//    响应经 validate_response 钩子校验后才计入完成
// 6. 合并：索取合并请求描述，发送并校验，上报 done
//
// 取消是协作式的：每个阶段之后、每个分片派发之前、每个特征值窗口之后检查取消令牌。
// 取消后静默结束，不再上报任何事件；已经发出的单个 HTTP 请求不会被中断，只丢弃结果。

use crate::common::ConcurrencyController;
use crate::config::UploadConfig;
use crate::uploader::blob::UploadFile;
use crate::uploader::chunk::{total_chunks, UploadChunk, UploadChunkManager};
use crate::uploader::error::UploadError;
use crate::uploader::fingerprint::{FingerprintAlgorithm, FingerprintEngine, FingerprintError};
use crate::uploader::hooks::{HookContext, HookName, HookOutcome, RequestOption};
use crate::uploader::protocol::{InitPayload, WorkerEvent};
use crate::uploader::rpc::{RpcCaller, RpcError};
use crate::uploader::transport::{
    default_check, default_merge, default_upload, ChunkBody, HttpTransport,
};
use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 任务执行端的钩子调用端
pub type HookCaller = RpcCaller<HookName, HookContext, HookOutcome, WorkerEvent>;

/// 校验钩子没有给出错误信息时使用的提示
const VALIDATION_FALLBACK_MESSAGE: &str = "Server Validation Failed";

/// 事件出口
///
/// 任务令牌取消后发出的事件在源头丢弃
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
    token: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkerEvent>, token: CancellationToken) -> Self {
        Self { tx, token }
    }

    /// 发送事件
    ///
    /// # 返回
    /// 事件是否真正发出
    pub fn emit(&self, event: WorkerEvent) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx.send(event).is_ok()
    }
}

/// 流程提前结束的原因
#[derive(Debug, thiserror::Error)]
enum Interrupt {
    /// 任务已取消，静默结束
    #[error("任务已取消")]
    Cancelled,

    /// 钩子声明直接成功
    #[error("钩子声明直接成功")]
    Success(Value),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<UploadError> for Interrupt {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Cancelled => Interrupt::Cancelled,
            other => Interrupt::Failed(other.into()),
        }
    }
}

/// 计算特征值并上报进度
///
/// 每个窗口之后检查取消令牌，已取消则中断
async fn hash_with_progress(
    task_id: &str,
    file: &UploadFile,
    window_size: u64,
    algorithm: Arc<dyn FingerprintAlgorithm>,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<String, UploadError> {
    let engine = FingerprintEngine::new(algorithm, window_size).with_cancel(cancel.clone());
    let result = engine
        .compute(file.blob.as_ref(), |progress| {
            events.emit(WorkerEvent::HashProgress {
                task_id: task_id.to_string(),
                progress,
            });
            Ok(())
        })
        .await;

    match result {
        Ok(fingerprint) => Ok(fingerprint),
        Err(FingerprintError::Cancelled) => Err(UploadError::Cancelled),
        Err(FingerprintError::Read(e)) => Err(UploadError::Read(e.to_string())),
    }
}

/// 只计算特征值（预计算）
///
/// 结束时上报 hash_result；取消时静默结束
pub async fn run_hash_only(
    task_id: String,
    file: UploadFile,
    window_size: u64,
    algorithm: Arc<dyn FingerprintAlgorithm>,
    events: EventSink,
    cancel: CancellationToken,
) {
    info!("开始预计算特征值: task_id={}, 文件={}", task_id, file.name);

    let result = hash_with_progress(&task_id, &file, window_size, algorithm, &events, &cancel).await;
    let event = match result {
        Ok(fingerprint) => {
            info!("预计算特征值完成: task_id={}, fingerprint={}", task_id, fingerprint);
            WorkerEvent::HashResult {
                task_id,
                fingerprint: Some(fingerprint),
                error: None,
            }
        }
        Err(UploadError::Cancelled) => {
            debug!("预计算特征值已取消: task_id={}", task_id);
            return;
        }
        Err(e) => {
            error!("预计算特征值失败: task_id={}, 错误={}", task_id, e);
            WorkerEvent::HashResult {
                task_id,
                fingerprint: None,
                error: Some(e.to_string()),
            }
        }
    };
    events.emit(event);
}

/// 单个文件的上传引擎
pub struct UploadEngine {
    task_id: String,
    file: UploadFile,
    config: UploadConfig,
    precomputed: Option<String>,
    algorithm: Arc<dyn FingerprintAlgorithm>,
    hooks: Arc<HookCaller>,
    transport: HttpTransport,
    events: EventSink,
    cancel: CancellationToken,
    fingerprint: OnceLock<String>,
}

impl UploadEngine {
    /// 创建上传引擎
    ///
    /// # 参数
    /// * `payload` - 初始化参数
    /// * `hooks` - 钩子调用端
    /// * `events` - 事件出口（与 `cancel` 绑定）
    /// * `cancel` - 任务取消令牌
    pub fn new(
        payload: InitPayload,
        hooks: Arc<HookCaller>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let transport = HttpTransport::from_config(&payload.config)?;
        Ok(Self {
            task_id: payload.task_id,
            file: payload.file,
            config: payload.config,
            precomputed: payload.fingerprint,
            algorithm: payload.algorithm,
            hooks,
            transport,
            events,
            cancel,
            fingerprint: OnceLock::new(),
        })
    }

    /// 执行上传并上报终结事件
    pub async fn run(self: Arc<Self>) {
        info!(
            "开始上传任务: task_id={}, 文件={}, 大小={} bytes",
            self.task_id,
            self.file.name,
            self.file.size()
        );

        let (fingerprint, payload) = match self.clone().execute().await {
            Ok(fingerprint) => (fingerprint, None),
            Err(Interrupt::Success(payload)) => {
                info!("钩子声明直接成功: task_id={}", self.task_id);
                let fingerprint = self.fingerprint.get().cloned().unwrap_or_default();
                (fingerprint, Some(payload))
            }
            Err(Interrupt::Cancelled) => {
                debug!("上传任务已取消，静默结束: task_id={}", self.task_id);
                return;
            }
            Err(Interrupt::Failed(e)) => {
                if self.cancel.is_cancelled() {
                    debug!("任务取消后的错误被忽略: task_id={}, 错误={:#}", self.task_id, e);
                    return;
                }
                let error = UploadError::from(&e);
                error!("上传任务失败: task_id={}, 错误={}", self.task_id, error);
                self.events.emit(WorkerEvent::Error {
                    task_id: self.task_id.clone(),
                    error,
                });
                return;
            }
        };

        info!(
            "上传任务完成: task_id={}, fingerprint={}",
            self.task_id, fingerprint
        );
        self.events.emit(WorkerEvent::Done {
            task_id: self.task_id.clone(),
            fingerprint,
            payload,
        });
    }

    fn ensure_active(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    /// 详细日志（show_log 开启时转发给编排端）
    fn log(&self, message: String) {
        debug!("{}", message);
        if self.config.show_log {
            self.events.emit(WorkerEvent::Log {
                task_id: Some(self.task_id.clone()),
                message,
            });
        }
    }

    fn base_context(&self, fingerprint: &str, init_data: &Option<Value>) -> HookContext {
        HookContext {
            fingerprint: Some(fingerprint.to_string()),
            init_data: init_data.clone(),
            ..Default::default()
        }
    }

    async fn execute(self: Arc<Self>) -> Result<String, Interrupt> {
        let size = self.file.size();
        let total = total_chunks(size, self.config.chunk_size);

        // 1. 特征值
        let fingerprint = match self.precomputed.clone() {
            Some(fingerprint) => {
                self.log(format!("[{}] 复用已计算的特征值: {}", self.task_id, fingerprint));
                fingerprint
            }
            None => {
                self.log(format!("[{}] 计算特征值...", self.task_id));
                hash_with_progress(
                    &self.task_id,
                    &self.file,
                    self.config.hash_window_size,
                    self.algorithm.clone(),
                    &self.events,
                    &self.cancel,
                )
                .await?
            }
        };
        let _ = self.fingerprint.set(fingerprint.clone());
        self.ensure_active()?;

        // 2. init
        let init_ctx = HookContext {
            count: Some(total),
            chunk_size: Some(self.config.chunk_size),
            filename: Some(self.file.name.clone()),
            ..self.base_context(&fingerprint, &None)
        };
        let init_data = match self.call_hook(HookName::Init, init_ctx).await? {
            Value::Null => None,
            data => Some(data),
        };

        // 3. 分片
        let mut manager =
            UploadChunkManager::new(size, self.config.chunk_size, &fingerprint, &self.file.name);

        // 4. 已上传分片查询
        if self.config.check_enabled {
            match self.check_existing(&fingerprint, &init_data).await {
                Ok(names) => {
                    let marked = manager.mark_existing(&names);
                    if marked > 0 {
                        info!(
                            "服务端已有 {} 个分片，跳过: task_id={}",
                            marked, self.task_id
                        );
                    }
                }
                Err(Interrupt::Failed(e)) if !is_business(&e) => {
                    warn!(
                        "已上传分片查询失败，全部重新上传: task_id={}, 错误={:#}",
                        self.task_id, e
                    );
                }
                Err(other) => return Err(other),
            }
        }
        self.ensure_active()?;

        // 5. 分片上传
        self.upload_chunks(manager, &fingerprint, &init_data).await?;
        self.ensure_active()?;

        // 6. 合并
        let merge_ctx = HookContext {
            count: Some(total),
            filename: Some(self.file.name.clone()),
            ..self.base_context(&fingerprint, &init_data)
        };
        let option = self
            .descriptor(HookName::Merge, merge_ctx.clone(), || {
                default_merge(&self.config, &fingerprint, total)
            })
            .await?;
        self.ensure_active()?;

        let response = self.transport.send(&option).await.context("合并请求失败")?;
        self.validate(HookName::Merge, merge_ctx, response).await?;

        Ok(fingerprint)
    }

    /// 查询服务端已有的分片名
    async fn check_existing(
        &self,
        fingerprint: &str,
        init_data: &Option<Value>,
    ) -> Result<Vec<String>, Interrupt> {
        let ctx = HookContext {
            filename: Some(self.file.name.clone()),
            ..self.base_context(fingerprint, init_data)
        };
        let option = self
            .descriptor(HookName::Check, ctx.clone(), || {
                default_check(&self.config, fingerprint)
            })
            .await?;
        self.ensure_active()?;

        let response = self.transport.send(&option).await.context("查询已上传分片失败")?;
        self.validate(HookName::Check, ctx, response.clone()).await?;

        let names = response
            .get("fileList")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    /// 按单文件分片并发上传所有未完成的分片
    ///
    /// 每个分片校验通过后立即上报一次进度
    async fn upload_chunks(
        self: &Arc<Self>,
        manager: UploadChunkManager,
        fingerprint: &str,
        init_data: &Option<Value>,
    ) -> Result<(), Interrupt> {
        let total = manager.chunk_count();
        let pending = manager.pending();

        if manager.is_completed() {
            self.events.emit(WorkerEvent::Progress {
                task_id: self.task_id.clone(),
                progress: 100.0,
            });
            return Ok(());
        }

        info!(
            "开始上传分片: task_id={}, 待上传={}/{}, 并发={}",
            self.task_id,
            pending.len(),
            total,
            self.config.chunk_concurrency
        );

        let scheduler = ConcurrencyController::new(
            format!("chunk-{}", self.task_id),
            self.config.chunk_concurrency,
        );
        // 任一分片失败时中止其余分片
        let abort = self.cancel.child_token();
        let manager = Arc::new(Mutex::new(manager));

        let mut units = FuturesUnordered::new();
        for chunk in pending {
            let engine = self.clone();
            let abort = abort.clone();
            let manager = manager.clone();
            let fingerprint = fingerprint.to_string();
            let init_data = init_data.clone();

            units.push(scheduler.submit(move || async move {
                if abort.is_cancelled() {
                    return Err(Interrupt::Cancelled);
                }
                engine
                    .upload_chunk(&chunk, total, &fingerprint, &init_data, &abort)
                    .await?;
                if abort.is_cancelled() {
                    return Err(Interrupt::Cancelled);
                }

                let progress = {
                    let mut manager = manager.lock();
                    manager.mark_completed(chunk.index);
                    manager.progress()
                };
                engine.events.emit(WorkerEvent::Progress {
                    task_id: engine.task_id.clone(),
                    progress,
                });
                Ok(())
            }));
        }

        while let Some(result) = units.next().await {
            let failure = match result {
                Ok(Ok(())) => continue,
                Ok(Err(interrupt)) => interrupt,
                Err(e) => Interrupt::from(UploadError::from(e)),
            };

            let cleared = scheduler.clear_queue();
            abort.cancel();
            debug!(
                "分片上传中止: task_id={}, 清除排队分片={}",
                self.task_id, cleared
            );
            return Err(failure);
        }

        debug!(
            "分片全部完成: task_id={}, 已完成={}/{}",
            self.task_id,
            manager.lock().completed_count(),
            total
        );
        Ok(())
    }

    /// 上传单个分片：索取请求描述 -> 读取分片 -> 发送 -> 校验
    async fn upload_chunk(
        &self,
        chunk: &UploadChunk,
        total: usize,
        fingerprint: &str,
        init_data: &Option<Value>,
        abort: &CancellationToken,
    ) -> Result<(), Interrupt> {
        let ctx = HookContext {
            filename: Some(chunk.name.clone()),
            index: Some(chunk.index),
            count: Some(total),
            chunk_size: Some(self.config.chunk_size),
            ..self.base_context(fingerprint, init_data)
        };
        let option = self
            .descriptor(HookName::Upload, ctx.clone(), || default_upload(&self.config))
            .await?;
        if abort.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        let data = self
            .file
            .blob
            .read_range(chunk.range.clone())
            .await
            .map_err(|e| UploadError::Read(e.to_string()))?;

        debug!(
            "上传分片 #{}: task_id={}, bytes={}-{}, 大小={} bytes",
            chunk.index,
            self.task_id,
            chunk.range.start,
            chunk.range.end,
            data.len()
        );

        let body = ChunkBody {
            data,
            chunk_name: chunk.name.clone(),
            fingerprint: fingerprint.to_string(),
        };
        let response = self
            .transport
            .send_chunk(&option, body)
            .await
            .with_context(|| format!("分片 #{} 上传失败", chunk.index))?;

        self.validate(HookName::Upload, ctx, response).await
    }

    /// 调用钩子，按结果决定流程走向
    async fn call_hook(&self, hook: HookName, ctx: HookContext) -> Result<Value, Interrupt> {
        self.ensure_active()?;
        self.log(format!("[{}] 调用钩子: {}", self.task_id, hook));

        let outcome = self
            .hooks
            .call(&self.task_id, hook, ctx)
            .await
            .map_err(|e| match e {
                RpcError::Cancelled => Interrupt::Cancelled,
                RpcError::Remote(message) if hook == HookName::ValidateResponse => {
                    let message = if message.is_empty() {
                        VALIDATION_FALLBACK_MESSAGE.to_string()
                    } else {
                        message
                    };
                    Interrupt::from(UploadError::Validation(message))
                }
                RpcError::Remote(message) => Interrupt::Failed(anyhow::anyhow!(
                    "{} 钩子执行失败: {}",
                    hook,
                    message
                )),
                RpcError::Closed => {
                    Interrupt::from(UploadError::Worker(RpcError::Closed.to_string()))
                }
            })?;
        self.ensure_active()?;

        match outcome {
            HookOutcome::Continue { data } => Ok(data),
            HookOutcome::Success { payload } => Err(Interrupt::Success(payload)),
            HookOutcome::Fail { message, code } => {
                Err(Interrupt::from(UploadError::Business { message, code }))
            }
        }
    }

    /// 索取请求描述，钩子未提供时使用默认描述
    async fn descriptor<F>(
        &self,
        hook: HookName,
        ctx: HookContext,
        default: F,
    ) -> Result<RequestOption, Interrupt>
    where
        F: FnOnce() -> RequestOption,
    {
        match self.call_hook(hook, ctx).await? {
            Value::Null => Ok(default()),
            data => serde_json::from_value(data)
                .with_context(|| format!("{} 钩子返回的请求描述无效", hook))
                .map_err(Interrupt::Failed),
        }
    }

    /// 把响应交给 validate_response 钩子
    async fn validate(
        &self,
        phase: HookName,
        mut ctx: HookContext,
        response: Value,
    ) -> Result<(), Interrupt> {
        ctx.response = Some(response);
        ctx.hook_name = Some(phase);
        self.call_hook(HookName::ValidateResponse, ctx).await?;
        Ok(())
    }
}

/// 是否为钩子声明的业务失败
fn is_business(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<UploadError>(),
        Some(UploadError::Business { .. })
    )
}
