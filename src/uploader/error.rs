// 上传错误定义

use crate::common::SchedulerError;
use crate::uploader::blob::UploadFile;
use crate::uploader::task::FileTaskStatus;
use serde::{Deserialize, Serialize};

/// 上传错误
///
/// 错误信息以字符串形式保存，可以在多个等待方之间克隆分发，
/// 也可以跨执行上下文以消息形式传递。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UploadError {
    /// 特征值计算时读取文件失败
    #[error("读取文件失败: {0}")]
    Read(String),

    /// 业务钩子校验响应不通过
    #[error("{0}")]
    Validation(String),

    /// 同一任务已在上传中
    #[error("任务已在运行中: {0}")]
    TaskRunning(String),

    /// 预计算特征值失败，上传未开始
    #[error("pre-calculation failed: {0}")]
    PreCalculationFailed(String),

    /// 任务被取消（不是故障）
    #[error("任务已取消")]
    Cancelled,

    /// 钩子主动声明的业务失败
    #[error("{}", format_business(.message, .code.as_deref()))]
    Business {
        message: String,
        code: Option<String>,
    },

    /// 网络请求失败
    #[error("{0}")]
    Request(String),

    /// 任务执行端异常（启动失败、意外退出等）
    #[error("任务执行端异常: {0}")]
    Worker(String),

    /// 排队中的任务被清空
    #[error("queue cleared")]
    QueueCleared,
}

fn format_business(message: &str, code: Option<&str>) -> String {
    match code {
        Some(code) => format!("{} (code: {})", message, code),
        None => message.to_string(),
    }
}

impl UploadError {
    /// 是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

impl From<&anyhow::Error> for UploadError {
    /// 错误链中有 UploadError 时原样取出，否则视为请求失败
    fn from(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<UploadError>() {
            Some(upload_error) => upload_error.clone(),
            None => UploadError::Request(format_error(err)),
        }
    }
}

impl From<SchedulerError> for UploadError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::QueueCleared => UploadError::QueueCleared,
            SchedulerError::Aborted => UploadError::Worker(err.to_string()),
        }
    }
}

/// 把任意错误链格式化为单行字符串
///
/// 跨执行上下文上报错误时只能携带字符串
pub fn format_error(err: &anyhow::Error) -> String {
    let mut message = err.to_string();
    for cause in err.chain().skip(1) {
        let cause = cause.to_string();
        if !message.contains(&cause) {
            message.push_str(": ");
            message.push_str(&cause);
        }
    }
    message
}

/// 上传成功结果
#[derive(Debug, Clone)]
pub struct UploadSuccess {
    /// 任务ID
    pub id: String,
    /// 原始文件
    pub file: UploadFile,
    /// 文件特征值
    pub fingerprint: String,
    /// 钩子通过"直接成功"返回的数据
    pub payload: Option<serde_json::Value>,
}

/// 单个文件的最终结果
#[derive(Debug, Clone)]
pub enum UploadResult {
    Success(UploadSuccess),
    Error {
        id: String,
        file: UploadFile,
        error: UploadError,
    },
    Cancelled {
        id: String,
        file: UploadFile,
    },
}

impl UploadResult {
    /// 由单个任务的结果构造
    pub fn from_outcome(file: UploadFile, outcome: Result<UploadSuccess, UploadError>) -> Self {
        match outcome {
            Ok(success) => UploadResult::Success(success),
            Err(error) if error.is_cancelled() => UploadResult::Cancelled {
                id: file.id.clone(),
                file,
            },
            Err(error) => UploadResult::Error {
                id: file.id.clone(),
                file,
                error,
            },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            UploadResult::Success(success) => &success.id,
            UploadResult::Error { id, .. } | UploadResult::Cancelled { id, .. } => id,
        }
    }

    /// 结果对应的任务状态
    pub fn status(&self) -> FileTaskStatus {
        match self {
            UploadResult::Success(_) => FileTaskStatus::Done,
            UploadResult::Error { .. } => FileTaskStatus::Error,
            UploadResult::Cancelled { .. } => FileTaskStatus::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadResult::Success(_))
    }
}

/// 批量结果摘要（便于日志和序列化）
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// 批量上传错误
///
/// 只要有一个文件未成功就返回，携带全部文件的结果，
/// 调用方仍能拿到其他文件的成功结果。
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UploadBatchError {
    pub message: String,
    pub results: Vec<UploadResult>,
}

impl UploadBatchError {
    pub fn new(results: Vec<UploadResult>) -> Self {
        let summary = summarize(&results);
        let message = format!(
            "批量上传未全部成功: 成功 {}, 失败 {}, 取消 {}",
            summary.succeeded, summary.failed, summary.cancelled
        );
        Self { message, results }
    }

    pub fn summary(&self) -> BatchSummary {
        summarize(&self.results)
    }

    /// 成功的结果
    pub fn successes(&self) -> impl Iterator<Item = &UploadSuccess> {
        self.results.iter().filter_map(|r| match r {
            UploadResult::Success(success) => Some(success),
            _ => None,
        })
    }
}

fn summarize(results: &[UploadResult]) -> BatchSummary {
    let mut summary = BatchSummary {
        succeeded: 0,
        failed: 0,
        cancelled: 0,
    };
    for result in results {
        match result {
            UploadResult::Success(_) => summary.succeeded += 1,
            UploadResult::Error { .. } => summary.failed += 1,
            UploadResult::Cancelled { .. } => summary.cancelled += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::blob::UploadFile;

    #[test]
    fn test_business_error_message() {
        let err = UploadError::Business {
            message: "配额不足".to_string(),
            code: Some("E403".to_string()),
        };
        assert_eq!(err.to_string(), "配额不足 (code: E403)");

        let err = UploadError::Business {
            message: "配额不足".to_string(),
            code: None,
        };
        assert_eq!(err.to_string(), "配额不足");
    }

    #[test]
    fn test_from_anyhow_keeps_kind() {
        let err = anyhow::Error::from(UploadError::Validation("bad".to_string()));
        assert_eq!(UploadError::from(&err), UploadError::Validation("bad".to_string()));

        let err = anyhow::anyhow!("connection reset").context("分片 #2 上传失败");
        assert_eq!(
            UploadError::from(&err),
            UploadError::Request("分片 #2 上传失败: connection reset".to_string())
        );
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(UploadError::Business {
            message: "m".to_string(),
            code: None,
        })
        .unwrap();
        assert_eq!(value["kind"], "business");
        assert_eq!(value["detail"]["message"], "m");

        let back: UploadError = serde_json::from_value(serde_json::json!({"kind": "cancelled"})).unwrap();
        assert_eq!(back, UploadError::Cancelled);
    }

    #[test]
    fn test_format_error_chain() {
        let err = anyhow::anyhow!("connection reset").context("上传分片失败");
        assert_eq!(format_error(&err), "上传分片失败: connection reset");
    }

    #[test]
    fn test_batch_error_keeps_all_results() {
        let a = UploadFile::from_bytes("a", "a.bin", vec![1]);
        let b = UploadFile::from_bytes("b", "b.bin", vec![2]);
        let c = UploadFile::from_bytes("c", "c.bin", vec![3]);

        let results = vec![
            UploadResult::from_outcome(
                a.clone(),
                Ok(UploadSuccess {
                    id: "a".to_string(),
                    file: a,
                    fingerprint: "fp".to_string(),
                    payload: None,
                }),
            ),
            UploadResult::from_outcome(b, Err(UploadError::Validation("bad".to_string()))),
            UploadResult::from_outcome(c, Err(UploadError::Cancelled)),
        ];

        let err = UploadBatchError::new(results);
        assert_eq!(
            err.summary(),
            BatchSummary {
                succeeded: 1,
                failed: 1,
                cancelled: 1
            }
        );
        assert_eq!(err.successes().count(), 1);
        assert_eq!(err.results[2].status(), FileTaskStatus::Cancelled);
        assert_eq!(err.results[1].id(), "b");
    }
}
