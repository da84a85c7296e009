// 文件任务状态定义
//
// 状态流转：idle -> queued -> calculating -> ready -> checking -> uploading -> done
// error / cancelled 可以从任何未结束状态进入

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 文件任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileTaskStatus {
    /// 刚登记
    #[default]
    Idle,
    /// 排队中（等待上传或计算槽位）
    Queued,
    /// 计算特征值中
    Calculating,
    /// 特征值已就绪，尚未开始传输
    Ready,
    /// 复用已有特征值，即将联系服务端
    Checking,
    /// 上传中
    Uploading,
    /// 已完成
    Done,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl FileTaskStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileTaskStatus::Done | FileTaskStatus::Error | FileTaskStatus::Cancelled
        )
    }

    /// 是否处于活跃传输阶段
    pub fn is_active(self) -> bool {
        matches!(
            self,
            FileTaskStatus::Calculating | FileTaskStatus::Checking | FileTaskStatus::Uploading
        )
    }
}

/// 单个文件的任务记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileTask {
    /// 任务ID
    pub id: String,
    /// 文件名
    pub name: String,
    /// 进度 (0-100)
    pub progress: f64,
    /// 状态
    pub status: FileTaskStatus,
    /// 文件特征值
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// 创建时间 (Unix timestamp ms)
    pub created_at: i64,
    /// 最后更新时间 (Unix timestamp ms)
    pub updated_at: i64,
}

/// 全局状态快照（按任务ID排序）
pub type GlobalUploadState = BTreeMap<String, FileTask>;

impl FileTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            name: name.into(),
            progress: 0.0,
            status: FileTaskStatus::Idle,
            fingerprint: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// 标记为排队中
    pub fn mark_queued(&mut self) {
        self.status = FileTaskStatus::Queued;
        self.error_message = None;
        self.touch();
    }

    /// 标记为计算中
    ///
    /// `keep_progress` 为 true 时保留正在进行的计算进度
    pub fn mark_calculating(&mut self, keep_progress: bool) {
        self.status = FileTaskStatus::Calculating;
        if !keep_progress {
            self.progress = 0.0;
        }
        self.touch();
    }

    /// 标记为特征值就绪
    pub fn mark_ready(&mut self, fingerprint: String) {
        self.status = FileTaskStatus::Ready;
        self.progress = 100.0;
        self.fingerprint = Some(fingerprint);
        self.touch();
    }

    /// 标记为检查中（复用已就绪的特征值），进度归零
    pub fn mark_checking(&mut self) {
        self.status = FileTaskStatus::Checking;
        self.progress = 0.0;
        self.touch();
    }

    /// 标记为上传中并更新进度
    pub fn mark_uploading(&mut self, progress: f64) {
        self.status = FileTaskStatus::Uploading;
        self.progress = progress.clamp(0.0, 100.0);
        self.touch();
    }

    /// 更新进度（状态不变）
    pub fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 100.0);
        self.touch();
    }

    /// 标记为已完成
    pub fn mark_done(&mut self, fingerprint: Option<String>) {
        self.status = FileTaskStatus::Done;
        self.progress = 100.0;
        if fingerprint.is_some() {
            self.fingerprint = fingerprint;
        }
        self.error_message = None;
        self.touch();
    }

    /// 标记为失败（进度保持不变）
    pub fn mark_error(&mut self, message: String) {
        self.status = FileTaskStatus::Error;
        self.error_message = Some(message);
        self.touch();
    }

    /// 标记为已取消，进度归零
    pub fn mark_cancelled(&mut self) {
        self.status = FileTaskStatus::Cancelled;
        self.progress = 0.0;
        self.touch();
    }
}

/// 进度百分比，保留两位小数
pub fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let raw = done as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = FileTask::new("a", "a.bin");
        assert_eq!(task.status, FileTaskStatus::Idle);
        assert_eq!(task.progress, 0.0);
        assert!(task.fingerprint.is_none());
    }

    #[test]
    fn test_status_transitions() {
        let mut task = FileTask::new("a", "a.bin");

        task.mark_queued();
        assert_eq!(task.status, FileTaskStatus::Queued);

        task.mark_calculating(false);
        task.set_progress(40.0);
        task.mark_calculating(true);
        assert_eq!(task.progress, 40.0);

        task.mark_ready("fp".to_string());
        assert_eq!(task.status, FileTaskStatus::Ready);
        assert_eq!(task.progress, 100.0);

        task.mark_checking();
        assert_eq!(task.progress, 0.0);

        task.mark_uploading(33.33);
        assert_eq!(task.status, FileTaskStatus::Uploading);

        task.mark_done(None);
        assert_eq!(task.status, FileTaskStatus::Done);
        assert_eq!(task.fingerprint.as_deref(), Some("fp"));
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_error_keeps_progress() {
        let mut task = FileTask::new("a", "a.bin");
        task.mark_uploading(33.33);
        task.mark_error("bad response".to_string());
        assert_eq!(task.status, FileTaskStatus::Error);
        assert_eq!(task.progress, 33.33);
        assert_eq!(task.error_message.as_deref(), Some("bad response"));
    }

    #[test]
    fn test_cancel_resets_progress() {
        let mut task = FileTask::new("a", "a.bin");
        task.mark_uploading(66.67);
        task.mark_cancelled();
        assert_eq!(task.status, FileTaskStatus::Cancelled);
        assert_eq!(task.progress, 0.0);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(2, 3), 66.67);
        assert_eq!(percent(3, 3), 100.0);
        assert_eq!(percent(0, 0), 100.0);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&FileTaskStatus::Calculating).unwrap();
        assert_eq!(json, "\"calculating\"");

        let task = FileTask::new("a", "a.bin");
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["status"], "idle");
        assert!(value.get("errorMessage").is_none());
    }
}
