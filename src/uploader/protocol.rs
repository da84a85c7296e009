// 编排端与任务执行端之间的消息定义

use crate::config::UploadConfig;
use crate::uploader::blob::UploadFile;
use crate::uploader::error::UploadError;
use crate::uploader::fingerprint::FingerprintAlgorithm;
use crate::uploader::hooks::{HookContext, HookName, HookOutcome};
use crate::uploader::rpc::{RpcReply, RpcRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// 钩子调用请求
pub type HookRequest = RpcRequest<HookName, HookContext>;

/// 钩子调用应答
pub type HookReply = RpcReply<HookOutcome>;

/// 上传任务的初始化参数
#[derive(Debug, Clone)]
pub struct InitPayload {
    pub task_id: String,
    /// 文件句柄（只读区间，不复制内容）
    pub file: UploadFile,
    /// 本次任务实际使用的配置
    pub config: UploadConfig,
    /// 已算好的特征值，存在时跳过计算
    pub fingerprint: Option<String>,
    /// 特征值算法
    pub algorithm: Arc<dyn FingerprintAlgorithm>,
}

/// 编排端 -> 任务执行端
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// 开始上传任务
    Init(Box<InitPayload>),
    /// 只计算特征值
    OnlyHash {
        task_id: String,
        file: UploadFile,
        window_size: u64,
        algorithm: Arc<dyn FingerprintAlgorithm>,
    },
    /// 钩子调用的应答
    HookResult(HookReply),
    /// 取消任务
    Cancel { task_id: String },
}

/// 任务执行端 -> 编排端
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// 请求执行钩子
    CallHook(HookRequest),
    /// 上传进度（保留两位小数）
    Progress { task_id: String, progress: f64 },
    /// 特征值计算进度
    HashProgress { task_id: String, progress: u8 },
    /// 上传完成
    Done {
        task_id: String,
        fingerprint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// 上传失败
    Error { task_id: String, error: UploadError },
    /// 只计算特征值的结果
    HashResult {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 详细日志
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        message: String,
    },
}

impl From<HookRequest> for WorkerEvent {
    fn from(request: HookRequest) -> Self {
        WorkerEvent::CallHook(request)
    }
}

impl WorkerEvent {
    /// 事件所属任务
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WorkerEvent::CallHook(request) => Some(&request.task_id),
            WorkerEvent::Progress { task_id, .. }
            | WorkerEvent::HashProgress { task_id, .. }
            | WorkerEvent::Done { task_id, .. }
            | WorkerEvent::Error { task_id, .. }
            | WorkerEvent::HashResult { task_id, .. } => Some(task_id),
            WorkerEvent::Log { task_id, .. } => task_id.as_deref(),
        }
    }

    /// 是否为任务终结事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Done { .. } | WorkerEvent::Error { .. } | WorkerEvent::HashResult { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tagging() {
        let event = WorkerEvent::Progress {
            task_id: "a".into(),
            progress: 33.33,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "progress", "task_id": "a", "progress": 33.33})
        );

        let request: HookRequest = RpcRequest {
            req_id: "r1".into(),
            task_id: "a".into(),
            hook: HookName::ValidateResponse,
            ctx: HookContext {
                index: Some(1),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(WorkerEvent::from(request)).unwrap();
        assert_eq!(value["type"], "call_hook");
        assert_eq!(value["hook"], "validate_response");
        assert_eq!(value["ctx"]["index"], 1);
    }

    #[test]
    fn test_event_round_trip_preserves_task() {
        let value = json!({"type": "done", "task_id": "b", "fingerprint": "fp"});
        let event: WorkerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(event.task_id(), Some("b"));
        assert!(event.is_terminal());

        let log = WorkerEvent::Log {
            task_id: None,
            message: "hello".into(),
        };
        assert_eq!(log.task_id(), None);
        assert!(!log.is_terminal());
    }
}
