// 跨执行上下文的 RPC 桥
//
// 两个执行上下文之间只有单向消息通道，这里把它变成请求/应答调用：
// - 调用端（任务执行端）为每个请求生成唯一 req_id，登记一个等待中的 oneshot
// - 应答端（编排端）执行钩子后回复 `{req_id, data}` 或 `{req_id, error}`
// - 任务取消时，调用端按 task_id 拒绝所有等待中的请求，应答端对执行中的请求回复 cancelled
//
// 没有超时：每个请求要么得到应答，要么随任务取消被拒绝。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// 取消时的应答错误
pub const CANCELLED_REPLY: &str = "cancelled";

/// 调用请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest<H, C> {
    pub req_id: String,
    pub task_id: String,
    pub hook: H,
    pub ctx: C,
}

/// 应答内容
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyBody<R> {
    Data(R),
    Error(String),
}

/// 调用应答
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcReply<R> {
    pub req_id: String,
    #[serde(flatten)]
    pub body: ReplyBody<R>,
}

impl<R> RpcReply<R> {
    pub fn data(req_id: impl Into<String>, data: R) -> Self {
        Self {
            req_id: req_id.into(),
            body: ReplyBody::Data(data),
        }
    }

    pub fn error(req_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            req_id: req_id.into(),
            body: ReplyBody::Error(message.into()),
        }
    }

    pub fn cancelled(req_id: impl Into<String>) -> Self {
        Self::error(req_id, CANCELLED_REPLY)
    }
}

/// 调用失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// 应答端执行出错
    #[error("{0}")]
    Remote(String),

    /// 所属任务已取消
    #[error("调用已取消")]
    Cancelled,

    /// 消息通道已关闭
    #[error("RPC 通道已关闭")]
    Closed,
}

struct PendingCall<R> {
    task_id: String,
    tx: oneshot::Sender<Result<R, RpcError>>,
}

/// 调用端
///
/// `E` 为出站消息类型，请求通过 `E::from` 包装后发出
pub struct RpcCaller<H, C, R, E> {
    outbound: mpsc::UnboundedSender<E>,
    pending: Mutex<HashMap<String, PendingCall<R>>>,
    _marker: PhantomData<fn(H, C)>,
}

impl<H, C, R, E> RpcCaller<H, C, R, E>
where
    E: From<RpcRequest<H, C>>,
{
    pub fn new(outbound: mpsc::UnboundedSender<E>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            _marker: PhantomData,
        }
    }

    /// 发起调用并等待应答
    pub async fn call(&self, task_id: &str, hook: H, ctx: C) -> Result<R, RpcError> {
        let req_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            req_id.clone(),
            PendingCall {
                task_id: task_id.to_string(),
                tx,
            },
        );

        let request = RpcRequest {
            req_id: req_id.clone(),
            task_id: task_id.to_string(),
            hook,
            ctx,
        };
        if self.outbound.send(E::from(request)).is_err() {
            self.pending.lock().remove(&req_id);
            return Err(RpcError::Closed);
        }

        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// 处理应答
    ///
    /// # 返回
    /// 是否找到对应的等待请求
    pub fn resolve(&self, reply: RpcReply<R>) -> bool {
        let Some(call) = self.pending.lock().remove(&reply.req_id) else {
            debug!("忽略未知请求的应答: req_id={}", reply.req_id);
            return false;
        };

        let result = match reply.body {
            ReplyBody::Data(data) => Ok(data),
            ReplyBody::Error(message) if message == CANCELLED_REPLY => Err(RpcError::Cancelled),
            ReplyBody::Error(message) => Err(RpcError::Remote(message)),
        };
        // 调用方可能已经放弃等待
        let _ = call.tx.send(result);
        true
    }

    /// 拒绝某个任务的所有等待中请求
    ///
    /// # 返回
    /// 被拒绝的请求数量
    pub fn reject_task(&self, task_id: &str) -> usize {
        let rejected: Vec<PendingCall<R>> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, call)| call.task_id == task_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = rejected.len();
        for call in rejected {
            let _ = call.tx.send(Err(RpcError::Cancelled));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// 应答端的执行中请求表
///
/// 记录正在执行钩子的请求，取消时用来补发 cancelled 应答，
/// 并让迟到的钩子结果被丢弃。
#[derive(Debug, Default)]
pub struct InflightCalls {
    calls: HashMap<String, String>,
}

impl InflightCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记执行中的请求
    pub fn begin(&mut self, req_id: &str, task_id: &str) {
        self.calls.insert(req_id.to_string(), task_id.to_string());
    }

    /// 请求执行完毕
    ///
    /// # 返回
    /// 仍在表中（需要发送应答）时返回 true；已被取消时返回 false
    pub fn finish(&mut self, req_id: &str) -> bool {
        self.calls.remove(req_id).is_some()
    }

    /// 移出某个任务的全部执行中请求
    pub fn take_task(&mut self, task_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, t)| t.as_str() == task_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.calls.remove(id);
        }
        ids
    }

    /// 移出全部执行中请求
    pub fn drain(&mut self) -> Vec<String> {
        self.calls.drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Outbound(RpcRequest<String, Value>);

    impl From<RpcRequest<String, Value>> for Outbound {
        fn from(request: RpcRequest<String, Value>) -> Self {
            Outbound(request)
        }
    }

    type Caller = RpcCaller<String, Value, Value, Outbound>;

    #[tokio::test]
    async fn test_call_and_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let caller = Arc::new(Caller::new(tx));

        let responder = {
            let caller = caller.clone();
            tokio::spawn(async move {
                let Outbound(request) = rx.recv().await.unwrap();
                assert_eq!(request.task_id, "t1");
                assert_eq!(request.hook, "init");
                caller.resolve(RpcReply::data(request.req_id, json!({"echo": request.ctx})))
            })
        };

        let result = caller
            .call("t1", "init".to_string(), json!(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": 1}));
        assert!(responder.await.unwrap());
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_and_cancelled_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let caller = Arc::new(Caller::new(tx));

        let c = caller.clone();
        let first = tokio::spawn(async move { c.call("t1", "check".into(), Value::Null).await });
        let Outbound(request) = rx.recv().await.unwrap();
        caller.resolve(RpcReply::error(request.req_id, "hook exploded"));
        assert_eq!(
            first.await.unwrap(),
            Err(RpcError::Remote("hook exploded".to_string()))
        );

        let c = caller.clone();
        let second = tokio::spawn(async move { c.call("t1", "check".into(), Value::Null).await });
        let Outbound(request) = rx.recv().await.unwrap();
        caller.resolve(RpcReply::cancelled(request.req_id));
        assert_eq!(second.await.unwrap(), Err(RpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_reject_task_only_touches_that_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let caller = Arc::new(Caller::new(tx));

        let c = caller.clone();
        let a = tokio::spawn(async move { c.call("a", "upload".into(), Value::Null).await });
        let c = caller.clone();
        let b = tokio::spawn(async move { c.call("b", "upload".into(), Value::Null).await });

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(caller.pending_count(), 2);

        assert_eq!(caller.reject_task("a"), 1);
        assert_eq!(a.await.unwrap(), Err(RpcError::Cancelled));
        assert_eq!(caller.pending_count(), 1);

        b.abort();
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let caller = Caller::new(tx);

        let result = caller.call("t", "init".into(), Value::Null).await;
        assert_eq!(result, Err(RpcError::Closed));
        assert_eq!(caller.pending_count(), 0);
    }

    #[test]
    fn test_reply_wire_format() {
        let reply: RpcReply<Value> = RpcReply::data("r1", json!({"ok": true}));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"req_id": "r1", "data": {"ok": true}})
        );

        let reply: RpcReply<Value> =
            serde_json::from_value(json!({"req_id": "r2", "error": "boom"})).unwrap();
        assert_eq!(reply.body, ReplyBody::Error("boom".to_string()));
    }

    #[test]
    fn test_inflight_calls() {
        let mut inflight = InflightCalls::new();
        inflight.begin("r1", "a");
        inflight.begin("r2", "a");
        inflight.begin("r3", "b");

        let mut taken = inflight.take_task("a");
        taken.sort();
        assert_eq!(taken, vec!["r1".to_string(), "r2".to_string()]);

        // 已被取消的请求不再应答
        assert!(!inflight.finish("r1"));
        assert!(inflight.finish("r3"));
        assert!(inflight.is_empty());
    }
}
