// HTTP 传输
//
// 把请求描述（RequestOption）转换成真实的 HTTP 请求：
// - 相对地址拼接到服务端基础地址
// - 配置了令牌时携带 `Authorization: Bearer`，描述中的请求头可覆盖
// - 分片上传使用 multipart：用户字段 + 分片数据
// - 查询/合并：表单 Content-Type 时发 urlencoded，GET 时作为查询参数，其余发 JSON
// - 非 2xx 视为失败；响应体不是 JSON 时解析为 null

use crate::config::UploadConfig;
use crate::uploader::hooks::RequestOption;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// 分片数据在表单中的默认字段名
pub const DEFAULT_CHUNK_FIELD: &str = "file";

/// 连接超时
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// 拼接地址
///
/// 已经是 http(s) 绝对地址时原样返回，否则用且只用一个 `/` 连接
pub fn resolve_url(base: &str, path: &str) -> String {
    if base.is_empty() || path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.strip_suffix('/').unwrap_or(base),
        path.strip_prefix('/').unwrap_or(path)
    )
}

/// 默认的已上传分片查询请求
pub fn default_check(config: &UploadConfig, fingerprint: &str) -> RequestOption {
    RequestOption::new(format!(
        "{}{}?HASH={}",
        config.server_url,
        config.api_paths.check,
        urlencoding::encode(fingerprint)
    ))
    .method("GET")
}

/// 默认的分片上传请求（请求体由传输层组装）
pub fn default_upload(config: &UploadConfig) -> RequestOption {
    RequestOption::new(format!("{}{}", config.server_url, config.api_paths.upload)).method("POST")
}

/// 默认的合并请求
pub fn default_merge(config: &UploadConfig, fingerprint: &str, count: usize) -> RequestOption {
    RequestOption::new(format!("{}{}", config.server_url, config.api_paths.merge))
        .method("POST")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .field("HASH", fingerprint)
        .field("count", count.to_string())
}

/// 待发送的分片
#[derive(Debug)]
pub struct ChunkBody {
    /// 分片数据
    pub data: Vec<u8>,
    /// 分片名
    pub chunk_name: String,
    /// 文件特征值
    pub fingerprint: String,
}

fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn form_pairs(body: &Map<String, Value>) -> Vec<(String, String)> {
    body.iter().map(|(k, v)| (k.clone(), field_text(v))).collect()
}

/// HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }

    pub fn from_config(config: &UploadConfig) -> Result<Self> {
        Self::new(config.server_url.clone(), config.token.clone())
    }

    /// 构造请求（方法、地址、请求头）
    fn builder(&self, option: &RequestOption, multipart: bool) -> Result<(RequestBuilder, Method)> {
        let method_name = option.effective_method();
        let method = Method::from_bytes(method_name.as_bytes())
            .with_context(|| format!("无效的请求方法: {}", method_name))?;
        let url = resolve_url(&self.base_url, &option.url);

        let mut headers = HeaderMap::new();
        if let Some(ref token) = self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("令牌包含非法字符")?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(ref custom) = option.headers {
            for (name, value) in custom {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("无效的请求头: {}", name))?;
                // multipart 的 Content-Type 带 boundary，只能由客户端生成
                if multipart && name == CONTENT_TYPE {
                    continue;
                }
                let value = HeaderValue::from_str(value)
                    .with_context(|| format!("无效的请求头值: {}", name))?;
                headers.insert(name, value);
            }
        }

        debug!("发送请求: {} {}", method, url);
        Ok((self.client.request(method.clone(), url).headers(headers), method))
    }

    /// 发送查询/合并请求
    pub async fn send(&self, option: &RequestOption) -> Result<Value> {
        let (mut builder, method) = self.builder(option, false)?;

        if let Some(ref body) = option.body {
            let urlencoded = option
                .header_value("content-type")
                .map(|v| v.contains("x-www-form-urlencoded"))
                .unwrap_or(false);

            builder = if urlencoded {
                builder.form(&form_pairs(body))
            } else if method == Method::GET {
                builder.query(&form_pairs(body))
            } else {
                builder.json(body)
            };
        }

        Self::finish(builder).await
    }

    /// 发送分片
    ///
    /// 没有任何用户字段时补充 `filename` 与 `fingerprint`
    pub async fn send_chunk(&self, option: &RequestOption, chunk: ChunkBody) -> Result<Value> {
        let (builder, _) = self.builder(option, true)?;

        let mut form = Form::new();
        match option.body {
            Some(ref body) if !body.is_empty() => {
                for (key, value) in body {
                    form = form.text(key.clone(), field_text(value));
                }
            }
            _ => {
                form = form
                    .text("filename", chunk.chunk_name.clone())
                    .text("fingerprint", chunk.fingerprint.clone());
            }
        }

        let field = option
            .chunk_field_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CHUNK_FIELD.to_string());
        let part = Part::bytes(chunk.data).file_name(chunk.chunk_name);
        form = form.part(field, part);

        Self::finish(builder.multipart(form)).await
    }

    async fn finish(builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await.context("网络请求失败")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "request failed [{}]: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
        }

        let bytes = response.bytes().await.context("读取响应失败")?;
        Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}
