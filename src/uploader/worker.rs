// 任务执行端（隔离执行上下文）
//
// 每个执行端是一个独立的系统线程，线程内运行自己的单线程 tokio 运行时。
// 与编排端之间没有共享的任务状态，只通过两条无界通道交换消息：
// - WorkerCommand：编排端 -> 执行端
// - WorkerEvent：执行端 -> 编排端
//
// terminate() 结束事件循环并丢弃运行时，执行端上所有进行中的任务随之中止。

use crate::uploader::engine::{run_hash_only, EventSink, HookCaller, UploadEngine};
use crate::uploader::error::UploadError;
use crate::uploader::protocol::{WorkerCommand, WorkerEvent};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// 执行端句柄
#[derive(Debug)]
pub struct WorkerHandle {
    id: u64,
    name: String,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// 启动执行端
    ///
    /// # 返回
    /// 句柄与事件接收端；执行端退出后接收端返回 None
    pub fn spawn(
        name: impl Into<String>,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let name = name.into();
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let thread = {
            let shutdown = shutdown.clone();
            let thread_name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!("执行端运行时创建失败: worker={}, 错误={}", thread_name, e);
                            return;
                        }
                    };
                    runtime.block_on(worker_loop(&thread_name, cmd_rx, event_tx, shutdown));
                    debug!("执行端运行时已释放: worker={}", thread_name);
                })?
        };

        info!("启动任务执行端: worker={}, id={}", name, id);
        Ok((
            Self {
                id,
                name,
                cmd_tx,
                shutdown,
                thread: Some(thread),
            },
            event_rx,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 发送指令
    ///
    /// # 返回
    /// 执行端已退出时返回 false
    pub fn send(&self, command: WorkerCommand) -> bool {
        !self.shutdown.is_cancelled() && self.cmd_tx.send(command).is_ok()
    }

    /// 终止执行端
    pub fn terminate(&self) {
        if !self.shutdown.is_cancelled() {
            info!("终止任务执行端: worker={}", self.name);
            self.shutdown.cancel();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled() || self.cmd_tx.is_closed()
    }

    /// 终止并等待线程退出（阻塞，不要在异步上下文中调用）
    pub fn join(mut self) {
        self.terminate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 执行端事件循环
async fn worker_loop(
    name: &str,
    mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: CancellationToken,
) {
    let hooks = Arc::new(HookCaller::new(event_tx.clone()));
    // task_id -> (代次, 取消令牌)
    let tokens: Arc<DashMap<String, (u64, CancellationToken)>> = Arc::new(DashMap::new());
    let mut generation = 0u64;

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = cmd_rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            WorkerCommand::Init(payload) => {
                generation += 1;
                let task_id = payload.task_id.clone();
                let token = register(&tokens, &task_id, generation);
                let events = EventSink::new(event_tx.clone(), token.clone());

                match UploadEngine::new(*payload, hooks.clone(), events.clone(), token.clone()) {
                    Ok(engine) => {
                        let tokens = tokens.clone();
                        let current = generation;
                        tokio::spawn(async move {
                            Arc::new(engine).run().await;
                            tokens.remove_if(&task_id, |_, (g, _)| *g == current);
                        });
                    }
                    Err(e) => {
                        error!("创建上传引擎失败: task_id={}, 错误={:#}", task_id, e);
                        events.emit(WorkerEvent::Error {
                            task_id: task_id.clone(),
                            error: UploadError::Worker(format!("{:#}", e)),
                        });
                        tokens.remove_if(&task_id, |_, (g, _)| *g == generation);
                    }
                }
            }
            WorkerCommand::OnlyHash {
                task_id,
                file,
                window_size,
                algorithm,
            } => {
                generation += 1;
                let token = register(&tokens, &task_id, generation);
                let events = EventSink::new(event_tx.clone(), token.clone());
                let tokens = tokens.clone();
                let current = generation;
                tokio::spawn(async move {
                    run_hash_only(task_id.clone(), file, window_size, algorithm, events, token)
                        .await;
                    tokens.remove_if(&task_id, |_, (g, _)| *g == current);
                });
            }
            WorkerCommand::HookResult(reply) => {
                hooks.resolve(reply);
            }
            WorkerCommand::Cancel { task_id } => {
                if let Some((_, (_, token))) = tokens.remove(&task_id) {
                    token.cancel();
                }
                let rejected = hooks.reject_task(&task_id);
                debug!(
                    "执行端取消任务: worker={}, task_id={}, 拒绝等待中的调用={}",
                    name, task_id, rejected
                );
            }
        }
    }

    for entry in tokens.iter() {
        entry.value().1.cancel();
    }
    debug!("执行端事件循环退出: worker={}", name);
}

/// 为任务登记新的取消令牌，同一任务的旧令牌一并取消
fn register(
    tokens: &DashMap<String, (u64, CancellationToken)>,
    task_id: &str,
    generation: u64,
) -> CancellationToken {
    let token = CancellationToken::new();
    if let Some((_, old)) = tokens.insert(task_id.to_string(), (generation, token.clone())) {
        old.cancel();
    }
    token
}
