// 分片上传模块
//
// - manager：编排端，持有任务状态、文件句柄与业务钩子
// - worker / engine：隔离的任务执行端，负责特征值计算与分片传输
// - rpc / protocol：两端之间的消息协议，执行端借此回调编排端的钩子
// - fingerprint / chunk / transport：特征值、分片规划、HTTP 请求

pub mod blob;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod hooks;
pub mod manager;
pub mod protocol;
pub mod rpc;
pub mod task;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use blob::{BlobSource, FileBlob, MemoryBlob, ReadError, UploadFile};
pub use chunk::{UploadChunk, UploadChunkManager};
pub use engine::UploadEngine;
pub use error::{BatchSummary, UploadBatchError, UploadError, UploadResult, UploadSuccess};
pub use fingerprint::{
    algorithm_for, FingerprintAlgorithm, FingerprintEngine, FingerprintError, Md5Fingerprint,
    Sha256Fingerprint,
};
pub use hooks::{HookContext, HookName, HookOutcome, NoopHooks, RequestOption, UploadHooks};
pub use manager::{StateListener, Subscription, UploadManager};
pub use protocol::{WorkerCommand, WorkerEvent};
pub use task::{FileTask, FileTaskStatus, GlobalUploadState};
pub use transport::HttpTransport;
pub use worker::WorkerHandle;
