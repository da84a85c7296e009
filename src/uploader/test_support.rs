// 测试辅助：默认协议的模拟服务端、计数算法、慢速文件

use crate::uploader::blob::{BlobSource, MemoryBlob, ReadError};
use crate::uploader::fingerprint::{FingerprintAlgorithm, Sha256Fingerprint, StreamingDigest};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 服务端收到的分片
#[derive(Debug, Clone)]
pub struct ReceivedChunk {
    pub fields: HashMap<String, String>,
    pub file_field: String,
    pub file_name: Option<String>,
    pub size: usize,
}

/// 模拟服务端状态
#[derive(Debug, Default)]
pub struct MockState {
    chunks: Mutex<Vec<ReceivedChunk>>,
    merges: Mutex<Vec<HashMap<String, String>>>,
    checks: Mutex<Vec<HashMap<String, String>>>,
    existing: Mutex<Vec<String>>,
    chunk_delay_ms: AtomicU64,
    fail_check: AtomicBool,
}

impl MockState {
    pub fn chunks(&self) -> Vec<ReceivedChunk> {
        self.chunks.lock().clone()
    }

    pub fn merges(&self) -> Vec<HashMap<String, String>> {
        self.merges.lock().clone()
    }

    pub fn checks(&self) -> Vec<HashMap<String, String>> {
        self.checks.lock().clone()
    }

    /// 设置查询接口返回的已上传分片名
    pub fn set_existing(&self, names: Vec<String>) {
        *self.existing.lock() = names;
    }

    /// 每个分片请求的处理延迟
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.chunk_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// 查询接口返回 500
    pub fn set_fail_check(&self, fail: bool) {
        self.fail_check.store(fail, Ordering::SeqCst);
    }
}

async fn upload_already(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    state.checks.lock().push(query);
    if state.fail_check.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let existing = state.existing.lock().clone();
    Ok(Json(json!({"code": 0, "fileList": existing})))
}

async fn upload_chunk(
    State(state): State<Arc<MockState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, StatusCode> {
    let mut fields = HashMap::new();
    let mut file_field = String::new();
    let mut file_name = None;
    let mut size = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(fname) = field.file_name() {
            file_field = name;
            file_name = Some(fname.to_string());
            size = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?.len();
        } else {
            let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
            fields.insert(name, text);
        }
    }

    state.chunks.lock().push(ReceivedChunk {
        fields,
        file_field,
        file_name,
        size,
    });

    let delay = state.chunk_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Ok(Json(json!({"code": 0})))
}

async fn upload_merge(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    let hash = form.get("HASH").cloned().unwrap_or_default();
    state.merges.lock().push(form);
    Json(json!({"code": 0, "url": format!("/files/{}", hash)}))
}

async fn echo(
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Json(json!({"auth": auth, "query": query, "body": body}))
}

async fn plain() -> &'static str {
    "ok"
}

/// 默认协议的模拟服务端
pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/upload_already", get(upload_already))
            .route("/upload_chunk", post(upload_chunk))
            .route("/upload_merge", post(upload_merge))
            .route("/echo", get(echo).post(echo))
            .route("/plain", get(plain))
            .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            handle,
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 统计 start 次数的 SHA-256
#[derive(Debug, Default, Clone)]
pub struct CountingAlgorithm {
    pub starts: Arc<AtomicUsize>,
}

impl CountingAlgorithm {
    pub fn count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl FingerprintAlgorithm for CountingAlgorithm {
    fn name(&self) -> &'static str {
        "counting-sha256"
    }

    fn start(&self) -> Box<dyn StreamingDigest> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Sha256Fingerprint.start()
    }
}

/// 每次读取前等待一段时间的内存文件
#[derive(Debug)]
pub struct SlowBlob {
    inner: MemoryBlob,
    delay: Duration,
}

impl SlowBlob {
    pub fn new(data: Vec<u8>, delay: Duration) -> Self {
        Self {
            inner: MemoryBlob::new(data),
            delay,
        }
    }
}

#[async_trait]
impl BlobSource for SlowBlob {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, ReadError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_range(range).await
    }
}

/// 轮询等待条件成立
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
