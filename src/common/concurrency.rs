// 通用并发控制器
//
// 限制同时运行的异步任务数量，超出上限的任务按提交顺序（FIFO）排队等待：
// - submit 立即入队并触发一次准入检查
// - 任务结束（无论成功或失败）立即释放槽位，并拉起队首的下一个任务
// - 并发上限可在运行时调整：调小不会抢占已运行的任务，调大立即补位
// - clear_queue 拒绝所有尚未开始的任务，不影响正在运行的任务
//
// 与任务类型无关：上传管理器用它分别控制"同时上传的文件数"和"同时计算特征值的文件数"，
// 任务引擎内部再用一个独立实例控制单个文件的分片并发。

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

/// 调度器错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// 排队中的任务被 clear_queue 拒绝
    #[error("queue cleared")]
    QueueCleared,
    /// 任务在结束前被丢弃（panic 或运行时关闭）
    #[error("scheduled unit aborted before completion")]
    Aborted,
}

/// 并发控制器状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStatus {
    /// 当前并发上限
    pub concurrency: usize,
    /// 正在运行的任务数
    pub running: usize,
    /// 排队中的任务数
    pub queued: usize,
}

/// 类型擦除后的排队任务
trait QueuedUnit: Send {
    /// 开始执行，返回的 Future 完成时结果已转交给提交方
    fn start(self: Box<Self>) -> BoxFuture<'static, ()>;
    /// 未开始即被拒绝
    fn reject(self: Box<Self>, err: SchedulerError);
}

struct Unit<T> {
    work: Box<dyn FnOnce() -> BoxFuture<'static, T> + Send>,
    result_tx: oneshot::Sender<Result<T, SchedulerError>>,
}

impl<T: Send + 'static> QueuedUnit for Unit<T> {
    fn start(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Unit { work, result_tx } = *self;
        async move {
            let output = work().await;
            // 提交方可能已经不再关心结果
            let _ = result_tx.send(Ok(output));
        }
        .boxed()
    }

    fn reject(self: Box<Self>, err: SchedulerError) {
        let _ = self.result_tx.send(Err(err));
    }
}

/// 队列槽位：任务本身 + 提交时所在的运行时
struct ConcurrencySlot {
    unit: Box<dyn QueuedUnit>,
    handle: Handle,
}

struct ControllerState {
    limit: usize,
    running: usize,
    queue: VecDeque<ConcurrencySlot>,
}

/// 有界并发调度器
///
/// 克隆得到的是同一个调度器的句柄。
#[derive(Clone)]
pub struct ConcurrencyController {
    name: Arc<str>,
    state: Arc<Mutex<ControllerState>>,
}

impl std::fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyController")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl ConcurrencyController {
    /// 创建调度器
    ///
    /// # 参数
    /// * `name` - 调度器名称（仅用于日志）
    /// * `concurrency` - 最大并发数，最小为 1
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name.as_str()),
            state: Arc::new(Mutex::new(ControllerState {
                limit: concurrency.max(1),
                running: 0,
                queue: VecDeque::new(),
            })),
        }
    }

    /// 提交一个任务
    ///
    /// 任务立即入队；返回的 Future 在任务结束时给出其输出，
    /// 丢弃该 Future 不会取消已提交的任务。必须在 tokio 运行时内调用，
    /// 任务被准入后会在提交方所在的运行时上执行。
    pub fn submit<F, Fut, T>(
        &self,
        work: F,
    ) -> impl Future<Output = Result<T, SchedulerError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let unit = Unit {
            work: Box::new(move || work().boxed()),
            result_tx,
        };

        self.state.lock().queue.push_back(ConcurrencySlot {
            unit: Box::new(unit),
            handle: Handle::current(),
        });
        self.process_queue();

        async move { result_rx.await.unwrap_or(Err(SchedulerError::Aborted)) }
    }

    /// 准入检查：有空闲槽位且队列非空时，依次拉起队首任务
    fn process_queue(&self) {
        loop {
            let slot = {
                let mut state = self.state.lock();
                if state.running >= state.limit {
                    return;
                }
                match state.queue.pop_front() {
                    Some(slot) => {
                        state.running += 1;
                        debug!(
                            "[{}] 准入任务: running={}/{}, queued={}",
                            self.name,
                            state.running,
                            state.limit,
                            state.queue.len()
                        );
                        slot
                    }
                    None => return,
                }
            };

            let guard = SlotGuard {
                controller: self.clone(),
            };
            let ConcurrencySlot { unit, handle } = slot;
            handle.spawn(async move {
                // 任务结束（包括 panic）时归还槽位
                let _guard = guard;
                unit.start().await;
            });
        }
    }

    /// 动态调整并发上限（最小为 1）
    pub fn update_concurrency(&self, new_limit: usize) {
        {
            let mut state = self.state.lock();
            state.limit = new_limit.max(1);
            debug!("[{}] 并发上限调整为 {}", self.name, state.limit);
        }
        self.process_queue();
    }

    /// 清空等待队列，拒绝所有尚未开始的任务
    ///
    /// # 返回
    /// 被拒绝的任务数量
    pub fn clear_queue(&self) -> usize {
        let drained: Vec<ConcurrencySlot> = self.state.lock().queue.drain(..).collect();
        let count = drained.len();
        for slot in drained {
            slot.unit.reject(SchedulerError::QueueCleared);
        }
        if count > 0 {
            debug!("[{}] 清空等待队列: {} 个任务被拒绝", self.name, count);
        }
        count
    }

    /// 获取当前状态
    pub fn status(&self) -> ConcurrencyStatus {
        let state = self.state.lock();
        ConcurrencyStatus {
            concurrency: state.limit,
            running: state.running,
            queued: state.queue.len(),
        }
    }
}

struct SlotGuard {
    controller: ConcurrencyController,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut state = self.controller.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.controller.process_queue();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_never_exceeds_limit() {
        let controller = ConcurrencyController::new("test", 2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..6)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                controller.submit(move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let results = futures::future::join_all(futures).await;
        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(controller.status().running, 0);
    }

    #[tokio::test]
    async fn test_fifo_admission_order() {
        let controller = ConcurrencyController::new("fifo", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let futures: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                controller.submit(move || async move {
                    order.lock().push(i);
                    tokio::task::yield_now().await;
                })
            })
            .collect();
        futures::future::join_all(futures).await;

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_is_forwarded_and_slot_released() {
        let controller = ConcurrencyController::new("errors", 1);

        let failing = controller.submit(|| async { Err::<u32, String>("boom".to_string()) });
        let next = controller.submit(|| async { Ok::<u32, String>(7) });

        assert_eq!(failing.await.unwrap(), Err("boom".to_string()));
        assert_eq!(next.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_clear_queue_rejects_waiting_only() {
        let controller = ConcurrencyController::new("clear", 1);
        let gate = Arc::new(Semaphore::new(0));

        let running = {
            let gate = gate.clone();
            controller.submit(move || async move {
                let _permit = gate.acquire().await.unwrap();
                "done"
            })
        };
        let queued_a = controller.submit(|| async { "a" });
        let queued_b = controller.submit(|| async { "b" });

        assert_eq!(controller.status().queued, 2);
        assert_eq!(controller.clear_queue(), 2);

        assert_eq!(queued_a.await, Err(SchedulerError::QueueCleared));
        assert_eq!(queued_b.await, Err(SchedulerError::QueueCleared));

        gate.add_permits(1);
        assert_eq!(running.await, Ok("done"));
    }

    #[tokio::test]
    async fn test_raising_limit_admits_immediately() {
        let controller = ConcurrencyController::new("raise", 1);
        let gate = Arc::new(Semaphore::new(0));

        let futures: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                controller.submit(move || async move {
                    let _permit = gate.acquire().await.unwrap();
                })
            })
            .collect();

        assert_eq!(controller.status().running, 1);
        assert_eq!(controller.status().queued, 3);

        controller.update_concurrency(3);
        assert_eq!(controller.status().running, 3);
        assert_eq!(controller.status().queued, 1);

        // 调小不抢占
        controller.update_concurrency(1);
        assert_eq!(controller.status().running, 3);

        gate.add_permits(4);
        for result in futures::future::join_all(futures).await {
            assert!(result.is_ok());
        }
        assert_eq!(controller.status().running, 0);
    }

    #[test]
    fn test_minimum_concurrency_is_one() {
        let controller = ConcurrencyController::new("min", 0);
        assert_eq!(controller.status().concurrency, 1);
        controller.update_concurrency(0);
        assert_eq!(controller.status().concurrency, 1);
    }
}
