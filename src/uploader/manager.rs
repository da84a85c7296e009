// 上传管理器（编排端）
//
// 负责全部任务的生命周期与状态：
// - 两级调度：同时上传的文件数、同时计算特征值的文件数各由一个 ConcurrencyController 限制
// - 特征值预计算：同一文件只计算一次，上传时复用进行中的计算
// - 执行钩子：任务执行端通过 RPC 请求钩子，文件句柄只在这里注入
// - 取消：忽略集合 + 执行端取消指令 + 拒绝执行中的钩子调用
// - 每次预计算、每次上传各有编号，只有当前编号能收尾和改状态
//
// 状态集中在一把 parking_lot 锁里，锁从不跨 await 持有；
// 订阅者在释放锁之后收到状态快照。

use crate::common::{ConcurrencyController, ConcurrencyStatus};
use crate::config::{UploadConfig, UploadOptions};
use crate::uploader::blob::UploadFile;
use crate::uploader::error::{
    format_error, UploadBatchError, UploadError, UploadResult, UploadSuccess,
};
use crate::uploader::fingerprint::{algorithm_for, FingerprintAlgorithm};
use crate::uploader::hooks::{self, NoopHooks, UploadHooks};
use crate::uploader::protocol::{HookRequest, InitPayload, WorkerCommand, WorkerEvent};
use crate::uploader::rpc::{InflightCalls, RpcReply};
use crate::uploader::task::{FileTask, FileTaskStatus, GlobalUploadState};
use crate::uploader::worker::WorkerHandle;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 状态订阅者
pub type StateListener = Arc<dyn Fn(&GlobalUploadState) + Send + Sync>;

type SharedFingerprint = Shared<BoxFuture<'static, Result<String, UploadError>>>;

/// 进行中的预计算结果
///
/// `attempt` 标识发起这次计算的调用；取消后同一文件重新预计算会拿到新的编号，
/// 旧计算收尾时发现编号不符就不再改动任何状态
struct PendingFingerprint {
    attempt: u64,
    result: SharedFingerprint,
}

/// 进行中的上传
struct ActiveUpload {
    attempt: u64,
    file: UploadFile,
    /// 本次调用实际使用的配置
    config: UploadConfig,
    tx: Option<oneshot::Sender<Result<UploadSuccess, UploadError>>>,
    /// 任务结束（完成、失败、取消）时触发，释放上传槽位
    settled: CancellationToken,
    /// 是否已交给传输执行端
    dispatched: bool,
}

/// 进行中的预计算
struct HashJob {
    attempt: u64,
    worker: WorkerHandle,
    tx: Option<oneshot::Sender<Result<String, UploadError>>>,
}

/// 事件来源
#[derive(Debug, Clone)]
enum EventSource {
    /// 共享的传输执行端（执行端 id）
    Transfer(u64),
    /// 某个文件专用的特征值执行端
    Hash { task_id: String, worker_id: u64 },
}

#[derive(Default)]
struct ManagerState {
    config: UploadConfig,
    states: GlobalUploadState,
    registry: HashMap<String, UploadFile>,
    uploads: HashMap<String, ActiveUpload>,
    pending_fingerprints: HashMap<String, PendingFingerprint>,
    hash_jobs: HashMap<String, HashJob>,
    ignoring: HashSet<String>,
    inflight: InflightCalls,
    listeners: Vec<(u64, StateListener)>,
    next_listener_id: u64,
    next_attempt: u64,
    transfer: Option<WorkerHandle>,
}

impl ManagerState {
    /// 传输执行端的事件是否还应处理
    fn accepts(&self, task_id: &str) -> bool {
        !self.ignoring.contains(task_id)
            && self
                .uploads
                .get(task_id)
                .map(|u| !u.settled.is_cancelled())
                .unwrap_or(false)
    }

    fn allocate_attempt(&mut self) -> u64 {
        self.next_attempt += 1;
        self.next_attempt
    }

    /// 这次预计算是否仍是该文件当前的那一次
    fn is_current_precompute(&self, task_id: &str, attempt: u64) -> bool {
        self.pending_fingerprints
            .get(task_id)
            .map(|p| p.attempt == attempt)
            .unwrap_or(false)
    }

    fn is_current_upload(&self, task_id: &str, attempt: u64) -> bool {
        self.uploads
            .get(task_id)
            .map(|u| u.attempt == attempt)
            .unwrap_or(false)
    }

    /// 事件是否来自该文件当前的特征值执行端
    fn owns_hash_job(&self, task_id: &str, worker_id: u64) -> bool {
        self.hash_jobs
            .get(task_id)
            .map(|job| job.worker.id() == worker_id)
            .unwrap_or(false)
    }

    fn task_mut(&mut self, file: &UploadFile) -> &mut FileTask {
        self.states
            .entry(file.id.clone())
            .or_insert_with(|| FileTask::new(file.id.clone(), file.name.clone()))
    }

    fn reply_to_transfer(&self, reply: RpcReply<hooks::HookOutcome>) {
        if let Some(ref transfer) = self.transfer {
            transfer.send(WorkerCommand::HookResult(reply));
        }
    }
}

struct Inner {
    state: Mutex<ManagerState>,
    hooks: Arc<dyn UploadHooks>,
    /// 固定的特征值算法（未设置时按配置选择）
    algorithm: Option<Arc<dyn FingerprintAlgorithm>>,
    upload_scheduler: ConcurrencyController,
    hash_scheduler: ConcurrencyController,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for job in state.hash_jobs.values() {
            job.worker.terminate();
        }
        if let Some(ref transfer) = state.transfer {
            transfer.terminate();
        }
    }
}

/// 状态订阅句柄
pub struct Subscription {
    manager: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// 取消订阅
    pub fn unsubscribe(self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.state.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// 上传管理器
///
/// 克隆只复制句柄，所有克隆共享同一份状态。
/// 不同测试用例各自构造新实例即可互不干扰。
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("upload", &self.inner.upload_scheduler)
            .field("hash", &self.inner.hash_scheduler)
            .finish()
    }
}

impl UploadManager {
    /// 创建上传管理器
    ///
    /// # 参数
    /// * `config` - 上传配置
    /// * `hooks` - 业务钩子
    pub fn new(config: UploadConfig, hooks: Arc<dyn UploadHooks>) -> Self {
        Self::build(config, hooks, None)
    }

    /// 使用默认钩子创建
    pub fn with_config(config: UploadConfig) -> Self {
        Self::new(config, Arc::new(NoopHooks))
    }

    /// 使用指定的特征值算法创建（忽略配置中的 algorithm）
    pub fn with_algorithm(
        config: UploadConfig,
        hooks: Arc<dyn UploadHooks>,
        algorithm: Arc<dyn FingerprintAlgorithm>,
    ) -> Self {
        Self::build(config, hooks, Some(algorithm))
    }

    fn build(
        config: UploadConfig,
        hooks: Arc<dyn UploadHooks>,
        algorithm: Option<Arc<dyn FingerprintAlgorithm>>,
    ) -> Self {
        info!(
            "🔧 创建上传管理器: 文件并发={}, 特征值并发={}, 分片并发={}, 分片大小={} bytes",
            config.upload_concurrency,
            config.hash_concurrency,
            config.chunk_concurrency,
            config.chunk_size
        );

        let upload_scheduler = ConcurrencyController::new("upload", config.upload_concurrency);
        let hash_scheduler = ConcurrencyController::new("hash", config.hash_concurrency);
        let state = ManagerState {
            config,
            ..Default::default()
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                hooks,
                algorithm,
                upload_scheduler,
                hash_scheduler,
            }),
        }
    }

    fn algorithm(&self, config: &UploadConfig) -> Arc<dyn FingerprintAlgorithm> {
        self.inner
            .algorithm
            .clone()
            .unwrap_or_else(|| algorithm_for(config.algorithm))
    }

    // =====================================================
    // 状态与订阅
    // =====================================================

    /// 当前全部任务状态的快照
    pub fn get_state(&self) -> GlobalUploadState {
        self.inner.state.lock().states.clone()
    }

    pub fn get_file_state(&self, id: &str) -> Option<FileTask> {
        self.inner.state.lock().states.get(id).cloned()
    }

    /// 文件句柄是否仍被持有
    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.state.lock().registry.contains_key(id)
    }

    /// 订阅状态变化
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&GlobalUploadState) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.listeners.push((id, Arc::new(listener)));
        Subscription {
            manager: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// 通知订阅者（必须在释放锁之后调用）
    fn notify(&self) {
        let (snapshot, listeners) = {
            let state = self.inner.state.lock();
            if state.listeners.is_empty() {
                return;
            }
            let listeners: Vec<StateListener> =
                state.listeners.iter().map(|(_, l)| l.clone()).collect();
            (state.states.clone(), listeners)
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }

    // =====================================================
    // 配置
    // =====================================================

    pub fn config(&self) -> UploadConfig {
        self.inner.state.lock().config.clone()
    }

    /// 更新配置，新的并发上限立即生效
    pub fn set_config(&self, config: UploadConfig) -> anyhow::Result<()> {
        config.validate()?;
        self.inner
            .upload_scheduler
            .update_concurrency(config.upload_concurrency);
        self.inner
            .hash_scheduler
            .update_concurrency(config.hash_concurrency);
        info!(
            "上传配置已更新: 文件并发={}, 特征值并发={}, 分片并发={}",
            config.upload_concurrency, config.hash_concurrency, config.chunk_concurrency
        );
        self.inner.state.lock().config = config;
        Ok(())
    }

    /// 两个调度器的状态 (上传, 特征值)
    pub fn scheduler_status(&self) -> (ConcurrencyStatus, ConcurrencyStatus) {
        (
            self.inner.upload_scheduler.status(),
            self.inner.hash_scheduler.status(),
        )
    }

    /// 有上传进行中且配置了阻止关闭
    pub fn should_block_close(&self) -> bool {
        let state = self.inner.state.lock();
        state.config.prevent_close
            && state.uploads.keys().any(|id| {
                state
                    .states
                    .get(id)
                    .map(|t| t.status.is_active())
                    .unwrap_or(false)
            })
    }

    // =====================================================
    // 特征值预计算
    // =====================================================

    /// 预计算文件特征值
    ///
    /// 已有特征值时直接返回；同一文件的计算进行中时等待同一个结果
    pub async fn precompute_fingerprint(&self, file: UploadFile) -> Result<String, UploadError> {
        let id = file.id.clone();
        let pending = {
            let mut state = self.inner.state.lock();
            if let Some(fingerprint) = state.states.get(&id).and_then(|t| t.fingerprint.clone()) {
                return Ok(fingerprint);
            }
            match state.pending_fingerprints.get(&id) {
                Some(pending) => pending.result.clone(),
                None => {
                    state.ignoring.remove(&id);
                    state.registry.insert(id.clone(), file.clone());
                    if !state.uploads.contains_key(&id) {
                        state.task_mut(&file).mark_queued();
                    }

                    let attempt = state.allocate_attempt();
                    let handle = tokio::spawn(self.clone().run_precompute(file, attempt));
                    let result: SharedFingerprint = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(UploadError::Worker(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    state.pending_fingerprints.insert(
                        id.clone(),
                        PendingFingerprint {
                            attempt,
                            result: result.clone(),
                        },
                    );
                    result
                }
            }
        };
        self.notify();
        pending.await
    }

    /// 批量预计算
    pub async fn precompute_batch(
        &self,
        files: Vec<UploadFile>,
    ) -> Vec<(String, Result<String, UploadError>)> {
        let tasks = files.into_iter().map(|file| {
            let manager = self.clone();
            async move {
                let id = file.id.clone();
                (id, manager.precompute_fingerprint(file).await)
            }
        });
        join_all(tasks).await
    }

    async fn run_precompute(self, file: UploadFile, attempt: u64) -> Result<String, UploadError> {
        let id = file.id.clone();
        let manager = self.clone();
        let result = match self
            .inner
            .hash_scheduler
            .submit(move || async move { manager.compute_in_hash_worker(file, attempt).await })
            .await
        {
            Ok(result) => result,
            Err(e) => Err(UploadError::from(e)),
        };

        {
            let mut state = self.inner.state.lock();
            // 被取消或重置过：同一文件可能已有新的预计算或上传，不能碰它们的状态
            if !state.is_current_precompute(&id, attempt) {
                debug!("过期的预计算结束: id={}, attempt={}", id, attempt);
                return Err(UploadError::Cancelled);
            }
            state.pending_fingerprints.remove(&id);

            let uploading = state.uploads.contains_key(&id);
            if !uploading {
                state.registry.remove(&id);
            }
            if let Some(task) = state.states.get_mut(&id) {
                match result {
                    Ok(ref fingerprint) if uploading => {
                        task.fingerprint = Some(fingerprint.clone());
                        task.set_progress(100.0);
                    }
                    Ok(ref fingerprint) => task.mark_ready(fingerprint.clone()),
                    // 上传流程会以 pre-calculation failed 结束任务
                    Err(_) if uploading => {}
                    Err(ref e) => task.mark_error(e.to_string()),
                }
            }
        }
        self.notify();

        match result {
            Ok(ref fingerprint) => info!("特征值预计算完成: id={}, fingerprint={}", id, fingerprint),
            Err(ref e) => warn!("特征值预计算失败: id={}, 错误={}", id, e),
        }
        result
    }

    /// 在专用执行端上计算特征值（已获得特征值调度槽位）
    async fn compute_in_hash_worker(
        &self,
        file: UploadFile,
        attempt: u64,
    ) -> Result<String, UploadError> {
        let id = file.id.clone();
        let (window_size, algorithm) = {
            let mut state = self.inner.state.lock();
            if !state.is_current_precompute(&id, attempt) {
                return Err(UploadError::Cancelled);
            }
            let config = state.config.clone();
            let task = state.task_mut(&file);
            if !task.status.is_terminal() {
                task.mark_calculating(false);
            }
            (config.hash_window_size, self.algorithm(&config))
        };
        self.notify();

        let (worker, events) = WorkerHandle::spawn(format!("hash-{}", id))
            .map_err(|e| UploadError::Worker(format!("启动特征值执行端失败: {}", e)))?;
        let worker_id = worker.id();
        worker.send(WorkerCommand::OnlyHash {
            task_id: id.clone(),
            file,
            window_size,
            algorithm,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if !state.is_current_precompute(&id, attempt) {
                worker.terminate();
                return Err(UploadError::Cancelled);
            }
            if let Some(live) = state.hash_jobs.get(&id) {
                warn!(
                    "特征值执行端已存在，放弃本次计算: id={}, 现有 attempt={}, 本次 attempt={}",
                    id, live.attempt, attempt
                );
                worker.terminate();
                return Err(UploadError::TaskRunning(id));
            }
            state.hash_jobs.insert(
                id.clone(),
                HashJob {
                    attempt,
                    worker,
                    tx: Some(tx),
                },
            );
        }
        self.spawn_pump(
            events,
            EventSource::Hash {
                task_id: id,
                worker_id,
            },
        );

        // 取消时 HashJob 被移除，发送端随之丢弃
        rx.await.unwrap_or(Err(UploadError::Cancelled))
    }

    // =====================================================
    // 上传
    // =====================================================

    /// 上传单个文件
    ///
    /// 同一文件已在上传时立即返回 `TaskRunning`，不排队。
    /// 返回的 Future 在任务完成、失败或被取消时结束。
    pub async fn start_upload(
        &self,
        file: UploadFile,
        options: Option<UploadOptions>,
    ) -> Result<UploadSuccess, UploadError> {
        let id = file.id.clone();
        let (rx, settled, attempt) = {
            let mut state = self.inner.state.lock();
            if state.uploads.contains_key(&id) {
                warn!("任务已在上传中，拒绝重复提交: id={}", id);
                return Err(UploadError::TaskRunning(id));
            }

            let config = match options {
                Some(ref options) => state.config.merged(options),
                None => state.config.clone(),
            };
            config
                .validate()
                .map_err(|e| UploadError::Validation(format!("{:#}", e)))?;

            state.ignoring.remove(&id);
            state.registry.insert(id.clone(), file.clone());
            state.task_mut(&file).mark_queued();

            let (tx, rx) = oneshot::channel();
            let settled = CancellationToken::new();
            let attempt = state.allocate_attempt();
            state.uploads.insert(
                id.clone(),
                ActiveUpload {
                    attempt,
                    file,
                    config,
                    tx: Some(tx),
                    settled: settled.clone(),
                    dispatched: false,
                },
            );
            (rx, settled, attempt)
        };
        self.notify();
        info!("上传任务已排队: id={}, attempt={}", id, attempt);

        let manager = self.clone();
        let unit_id = id.clone();
        let admitted = self
            .inner
            .upload_scheduler
            .submit(move || async move {
                manager.run_upload_slot(unit_id, attempt, settled).await
            });
        tokio::spawn(async move {
            if let Err(e) = admitted.await {
                debug!("上传槽位未执行: {}", e);
            }
        });

        rx.await.unwrap_or(Err(UploadError::Cancelled))
    }

    /// 批量上传
    ///
    /// 全部成功时返回全部结果；任一文件未成功时返回携带全部结果的批量错误
    pub async fn start_batch(
        &self,
        files: Vec<UploadFile>,
        options: Option<UploadOptions>,
    ) -> Result<Vec<UploadSuccess>, UploadBatchError> {
        let tasks = files.into_iter().map(|file| {
            let manager = self.clone();
            let options = options.clone();
            async move {
                let outcome = manager.start_upload(file.clone(), options).await;
                UploadResult::from_outcome(file, outcome)
            }
        });
        let results = join_all(tasks).await;

        if results.iter().all(UploadResult::is_success) {
            return Ok(results
                .into_iter()
                .filter_map(|r| match r {
                    UploadResult::Success(success) => Some(success),
                    _ => None,
                })
                .collect());
        }

        let err = UploadBatchError::new(results);
        warn!("{}", err.message);
        Err(err)
    }

    /// 占用一个上传槽位，直到任务结束
    async fn run_upload_slot(&self, id: String, attempt: u64, settled: CancellationToken) {
        if settled.is_cancelled() {
            return;
        }

        let (pending, fingerprint, file, config) = {
            let mut state = self.inner.state.lock();
            let Some(active) = state.uploads.get(&id).filter(|u| u.attempt == attempt) else {
                return;
            };
            let file = active.file.clone();
            let config = active.config.clone();
            let pending = state
                .pending_fingerprints
                .get(&id)
                .map(|p| p.result.clone());

            let task = state.task_mut(&file);
            let fingerprint = task.fingerprint.clone();
            match (&pending, &fingerprint) {
                (None, Some(_)) => task.mark_checking(),
                (Some(_), _) => task.mark_calculating(true),
                (None, None) => task.mark_calculating(false),
            }
            (pending, fingerprint, file, config)
        };
        self.notify();

        let fingerprint = match pending {
            Some(pending) => {
                debug!("复用进行中的特征值计算: id={}", id);
                tokio::select! {
                    result = pending => match result {
                        Ok(fingerprint) => Some(fingerprint),
                        Err(UploadError::Cancelled) => return,
                        Err(e) => {
                            self.settle(
                                &id,
                                Some(attempt),
                                Err(UploadError::PreCalculationFailed(e.to_string())),
                            );
                            return;
                        }
                    },
                    _ = settled.cancelled() => return,
                }
            }
            None => fingerprint,
        };
        if settled.is_cancelled() {
            return;
        }

        let payload = InitPayload {
            task_id: id.clone(),
            file,
            algorithm: self.algorithm(&config),
            config,
            fingerprint,
        };
        if let Err(e) = self.dispatch_init(payload, attempt) {
            self.settle(&id, Some(attempt), Err(e));
            return;
        }

        settled.cancelled().await;
    }

    /// 把任务交给共享的传输执行端（不存在或已退出时重新创建）
    fn dispatch_init(&self, payload: InitPayload, attempt: u64) -> Result<(), UploadError> {
        let id = payload.task_id.clone();
        let command = WorkerCommand::Init(Box::new(payload));

        let (events, worker_id) = {
            let mut state = self.inner.state.lock();
            let Some(active) = state.uploads.get_mut(&id).filter(|u| u.attempt == attempt) else {
                return Ok(());
            };
            active.dispatched = true;

            if let Some(ref transfer) = state.transfer {
                if !transfer.is_terminated() && transfer.send(command.clone()) {
                    return Ok(());
                }
            }

            let (worker, events) = WorkerHandle::spawn("upload-transfer")
                .map_err(|e| UploadError::Worker(format!("启动传输执行端失败: {}", e)))?;
            if !worker.send(command) {
                return Err(UploadError::Worker("传输执行端不可用".to_string()));
            }
            let worker_id = worker.id();
            info!("传输执行端已启动: name={}, worker_id={}", worker.name(), worker_id);
            if let Some(old) = state.transfer.replace(worker) {
                old.terminate();
            }
            (events, worker_id)
        };

        self.spawn_pump(events, EventSource::Transfer(worker_id));
        Ok(())
    }

    /// 结束一个上传任务：更新状态、释放文件句柄、唤醒等待方
    ///
    /// 指定 `attempt` 时只结束这一次上传，同一文件后来的上传不受影响
    fn settle(
        &self,
        id: &str,
        attempt: Option<u64>,
        outcome: Result<(String, Option<Value>), UploadError>,
    ) {
        let (tx, result) = {
            let mut state = self.inner.state.lock();
            if let Some(attempt) = attempt {
                if !state.is_current_upload(id, attempt) {
                    debug!("过期的上传结束: id={}, attempt={}", id, attempt);
                    return;
                }
            }
            let Some(mut active) = state.uploads.remove(id) else {
                return;
            };
            state.registry.remove(id);
            active.settled.cancel();

            let task = state.states.get_mut(id);
            let result = match outcome {
                Ok((fingerprint, payload)) => {
                    if let Some(task) = task {
                        task.mark_done(Some(fingerprint.clone()));
                    }
                    info!("✅ 上传完成: id={}", id);
                    Ok(UploadSuccess {
                        id: id.to_string(),
                        file: active.file,
                        fingerprint,
                        payload,
                    })
                }
                Err(UploadError::Cancelled) => {
                    if let Some(task) = task {
                        task.mark_cancelled();
                    }
                    info!("上传已取消: id={}", id);
                    Err(UploadError::Cancelled)
                }
                Err(e) => {
                    if let Some(task) = task {
                        task.mark_error(e.to_string());
                    }
                    error!("❌ 上传失败: id={}, 错误={}", id, e);
                    Err(e)
                }
            };
            (active.tx.take(), result)
        };

        // 先通知订阅者，调用方拿到结果时状态已是终态
        self.notify();
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    // =====================================================
    // 取消与清理
    // =====================================================

    /// 取消任务（幂等）
    pub fn cancel_upload(&self, id: &str) {
        let hash_job = {
            let mut state = self.inner.state.lock();
            state.ignoring.insert(id.to_string());
            let hash_job = state.hash_jobs.remove(id);
            state.pending_fingerprints.remove(id);

            let inflight = state.inflight.take_task(id);
            if let Some(ref transfer) = state.transfer {
                transfer.send(WorkerCommand::Cancel {
                    task_id: id.to_string(),
                });
                for req_id in inflight {
                    transfer.send(WorkerCommand::HookResult(RpcReply::cancelled(req_id)));
                }
            }

            if let Some(mut active) = state.uploads.remove(id) {
                active.settled.cancel();
                if let Some(tx) = active.tx.take() {
                    let _ = tx.send(Err(UploadError::Cancelled));
                }
            }
            state.registry.remove(id);

            if let Some(task) = state.states.get_mut(id) {
                if !task.status.is_terminal() {
                    info!("取消任务: id={}, 状态={:?}", id, task.status);
                    task.mark_cancelled();
                }
            }
            hash_job
        };

        if let Some(job) = hash_job {
            job.worker.terminate();
        }
        self.notify();
    }

    /// 取消并删除任务
    pub fn remove_file(&self, id: &str) {
        self.cancel_upload(id);
        self.inner.state.lock().states.remove(id);
        self.notify();
    }

    /// 清空全部任务
    pub fn reset(&self) {
        let ids: Vec<String> = {
            let state = self.inner.state.lock();
            let mut ids: HashSet<String> = state.states.keys().cloned().collect();
            ids.extend(state.uploads.keys().cloned());
            ids.extend(state.hash_jobs.keys().cloned());
            ids.extend(state.pending_fingerprints.keys().cloned());
            ids.into_iter().collect()
        };
        info!("重置上传管理器: 任务数={}", ids.len());

        self.inner.upload_scheduler.clear_queue();
        self.inner.hash_scheduler.clear_queue();
        for id in &ids {
            self.cancel_upload(id);
        }

        let jobs: Vec<HashJob> = {
            let mut state = self.inner.state.lock();
            for req_id in state.inflight.drain() {
                state.reply_to_transfer(RpcReply::cancelled(req_id));
            }
            for (_, mut active) in state.uploads.drain() {
                active.settled.cancel();
                if let Some(tx) = active.tx.take() {
                    let _ = tx.send(Err(UploadError::Cancelled));
                }
            }
            state.states.clear();
            state.registry.clear();
            state.pending_fingerprints.clear();
            state.ignoring.clear();
            state.hash_jobs.drain().map(|(_, job)| job).collect()
        };
        for job in jobs {
            job.worker.terminate();
        }
        self.notify_empty();
    }

    /// 清空后即使没有状态变化也通知一次
    fn notify_empty(&self) {
        let listeners: Vec<StateListener> = {
            let state = self.inner.state.lock();
            state.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        let empty = GlobalUploadState::new();
        for listener in listeners {
            listener(&empty);
        }
    }

    /// 重置并关闭共享的传输执行端
    pub fn shutdown(&self) {
        self.reset();
        let transfer = self.inner.state.lock().transfer.take();
        if let Some(transfer) = transfer {
            transfer.terminate();
        }
        info!("上传管理器已关闭");
    }

    // =====================================================
    // 执行端事件
    // =====================================================

    fn spawn_pump(&self, events: mpsc::UnboundedReceiver<WorkerEvent>, source: EventSource) {
        tokio::spawn(pump_events(Arc::downgrade(&self.inner), events, source));
    }

    fn handle_event(&self, source: &EventSource, event: WorkerEvent) {
        match source {
            EventSource::Transfer(_) => self.handle_transfer_event(event),
            EventSource::Hash { task_id, worker_id } => {
                // 专用执行端只为一个文件工作
                if event.task_id().is_some_and(|id| id != task_id.as_str()) {
                    debug!("忽略不属于本文件的特征值事件: expected={}, event={:?}", task_id, event);
                    return;
                }
                self.handle_hash_event(task_id, *worker_id, event)
            }
        }
    }

    fn handle_transfer_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::CallHook(request) => self.serve_hook(request),
            WorkerEvent::Progress { task_id, progress } => {
                self.update_task(&task_id, |task| task.mark_uploading(progress));
            }
            WorkerEvent::HashProgress { task_id, progress } => {
                self.update_task(&task_id, |task| {
                    if task.status == FileTaskStatus::Calculating {
                        task.set_progress(progress as f64);
                    }
                });
            }
            WorkerEvent::Done {
                task_id,
                fingerprint,
                payload,
            } => {
                if self.inner.state.lock().accepts(&task_id) {
                    self.settle(&task_id, None, Ok((fingerprint, payload)));
                }
            }
            WorkerEvent::Error { task_id, error } => {
                if self.inner.state.lock().accepts(&task_id) {
                    self.settle(&task_id, None, Err(error));
                }
            }
            WorkerEvent::HashResult { task_id, .. } => {
                debug!("传输执行端不应发出 hash_result: task_id={}", task_id);
            }
            WorkerEvent::Log { task_id, message } => {
                info!("[worker] {}: {}", task_id.unwrap_or_default(), message);
            }
        }
    }

    fn handle_hash_event(&self, id: &str, worker_id: u64, event: WorkerEvent) {
        match event {
            WorkerEvent::HashProgress { progress, .. } => {
                let changed = {
                    let mut state = self.inner.state.lock();
                    if !state.owns_hash_job(id, worker_id) {
                        false
                    } else {
                        match state.states.get_mut(id) {
                            Some(task) if task.status == FileTaskStatus::Calculating => {
                                task.set_progress(progress as f64);
                                true
                            }
                            _ => false,
                        }
                    }
                };
                if changed {
                    self.notify();
                }
            }
            WorkerEvent::HashResult {
                fingerprint, error, ..
            } => {
                let job = {
                    let mut state = self.inner.state.lock();
                    if state.owns_hash_job(id, worker_id) {
                        state.hash_jobs.remove(id)
                    } else {
                        None
                    }
                };
                if let Some(mut job) = job {
                    job.worker.terminate();
                    let result = match (fingerprint, error) {
                        (Some(fingerprint), _) => Ok(fingerprint),
                        (None, Some(error)) => Err(UploadError::Read(error)),
                        (None, None) => Err(UploadError::Worker("特征值结果为空".to_string())),
                    };
                    if let Some(tx) = job.tx.take() {
                        let _ = tx.send(result);
                    }
                }
            }
            WorkerEvent::Log { message, .. } => info!("[hash-worker] {}: {}", id, message),
            other => debug!("忽略特征值执行端事件: {:?}", other),
        }
    }

    /// 在任务仍被接受时更新状态
    fn update_task<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut FileTask),
    {
        let changed = {
            let mut state = self.inner.state.lock();
            if !state.accepts(id) {
                false
            } else {
                match state.states.get_mut(id) {
                    Some(task) => {
                        update(task);
                        true
                    }
                    None => false,
                }
            }
        };
        if changed {
            self.notify();
        }
    }

    /// 执行钩子并回复执行端
    fn serve_hook(&self, request: HookRequest) {
        let file = {
            let mut state = self.inner.state.lock();
            if !state.accepts(&request.task_id) {
                debug!(
                    "拒绝已取消任务的钩子调用: task_id={}, hook={}",
                    request.task_id, request.hook
                );
                state.reply_to_transfer(RpcReply::cancelled(request.req_id));
                return;
            }
            state.inflight.begin(&request.req_id, &request.task_id);
            state.registry.get(&request.task_id).cloned()
        };

        let manager = self.clone();
        tokio::spawn(async move {
            let req_id = request.req_id;
            let hook = request.hook;
            let mut ctx = request.ctx;
            ctx.file = file;

            let reply = match hooks::dispatch(manager.inner.hooks.as_ref(), hook, &ctx).await {
                Ok(outcome) => RpcReply::data(req_id, outcome),
                Err(e) => {
                    debug!("钩子执行出错: hook={}, 错误={:#}", hook, e);
                    RpcReply::error(req_id, format_error(&e))
                }
            };

            let mut state = manager.inner.state.lock();
            // 执行期间任务被取消时，cancelled 应答已经发出
            if state.inflight.finish(&reply.req_id) {
                state.reply_to_transfer(reply);
            }
        });
    }

    /// 执行端意外退出
    fn on_worker_exit(&self, source: &EventSource) {
        match source {
            EventSource::Transfer(worker_id) => {
                let orphaned: Vec<(String, u64)> = {
                    let mut state = self.inner.state.lock();
                    let current = state.transfer.as_ref().map(|w| w.id());
                    if current != Some(*worker_id) {
                        return;
                    }
                    state.transfer = None;
                    state
                        .uploads
                        .iter()
                        .filter(|(_, u)| u.dispatched)
                        .map(|(id, u)| (id.clone(), u.attempt))
                        .collect()
                };
                if !orphaned.is_empty() {
                    error!("传输执行端意外退出: 受影响任务数={}", orphaned.len());
                }
                for (id, attempt) in orphaned {
                    self.settle(
                        &id,
                        Some(attempt),
                        Err(UploadError::Worker("传输执行端意外退出".to_string())),
                    );
                }
            }
            EventSource::Hash { task_id, worker_id } => {
                let mut state = self.inner.state.lock();
                if state.owns_hash_job(task_id, *worker_id) {
                    if let Some(mut job) = state.hash_jobs.remove(task_id) {
                        if let Some(tx) = job.tx.take() {
                            let _ = tx.send(Err(UploadError::Worker(
                                "特征值执行端意外退出".to_string(),
                            )));
                        }
                    }
                }
            }
        }
    }
}

/// 把执行端事件转交给管理器，直到执行端退出
async fn pump_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    source: EventSource,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        UploadManager { inner }.handle_event(&source, event);
    }

    if let Some(inner) = inner.upgrade() {
        UploadManager { inner }.on_worker_exit(&source);
    }
}
