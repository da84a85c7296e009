// 业务钩子
//
// 每个协议阶段（init / check / upload / merge / validate_response）都可以由调用方接管：
// - 返回 `HookOutcome::pass()` 使用默认行为
// - 返回 `HookOutcome::request(...)` 提供自定义请求描述
// - 返回 `HookOutcome::success(...)` 直接以成功结束任务
// - 返回 `HookOutcome::fail(...)` 直接以业务失败结束任务
//
// 钩子内部返回 Err 视为钩子执行故障，与业务失败区分开。

use crate::uploader::blob::UploadFile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// 钩子名称（协议阶段）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    Init,
    Check,
    Upload,
    Merge,
    ValidateResponse,
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookName::Init => "init",
            HookName::Check => "check",
            HookName::Upload => "upload",
            HookName::Merge => "merge",
            HookName::ValidateResponse => "validate_response",
        };
        f.write_str(name)
    }
}

/// 请求描述
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestOption {
    /// 地址，相对路径会拼接到服务端基础地址后
    pub url: String,
    /// 方法，缺省为 POST
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// 请求头
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// 请求体字段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Map<String, Value>>,
    /// 分片数据在表单中的字段名，缺省为 file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_field_name: Option<String>,
}

impl RequestOption {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn chunk_field_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_field_name = Some(name.into());
        self
    }

    /// 实际使用的方法（大写）
    pub fn effective_method(&self) -> String {
        self.method
            .as_deref()
            .unwrap_or("POST")
            .to_ascii_uppercase()
    }

    /// 按名称查找请求头（忽略大小写）
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }
}

/// 钩子执行结果
///
/// 以带标签的数据表达三种走向，不借助错误做控制流
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HookOutcome {
    /// 继续流程，`data` 为 null 时使用默认行为
    Continue {
        #[serde(default)]
        data: Value,
    },
    /// 立即以成功结束任务
    Success {
        #[serde(default)]
        payload: Value,
    },
    /// 立即以业务失败结束任务
    Fail {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl HookOutcome {
    /// 使用默认行为
    pub fn pass() -> Self {
        HookOutcome::Continue { data: Value::Null }
    }

    /// 返回任意数据（init 钩子）
    pub fn data(data: impl Into<Value>) -> Self {
        HookOutcome::Continue { data: data.into() }
    }

    /// 返回自定义请求描述
    pub fn request(option: RequestOption) -> Self {
        HookOutcome::Continue {
            data: serde_json::to_value(option).unwrap_or(Value::Null),
        }
    }

    pub fn success(payload: impl Into<Value>) -> Self {
        HookOutcome::Success {
            payload: payload.into(),
        }
    }

    pub fn fail(message: impl Into<String>, code: Option<String>) -> Self {
        HookOutcome::Fail {
            message: message.into(),
            code,
        }
    }
}

/// 钩子上下文
///
/// 跨执行上下文传递时不带文件句柄，文件只在编排端注入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// 分片序号（从 1 开始）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// 分片总数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    /// init 钩子返回的数据
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_data: Option<Value>,
    /// 服务端响应（仅 validate_response）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// 响应所属阶段（仅 validate_response）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<HookName>,
    /// 原始文件（仅编排端可见）
    #[serde(skip)]
    pub file: Option<UploadFile>,
}

/// 上传钩子
///
/// 所有方法都有默认实现（使用默认行为），按需覆盖
#[async_trait]
pub trait UploadHooks: Send + Sync {
    /// 初始化，返回的数据作为后续上下文的 `init_data`
    async fn init(&self, _ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        Ok(HookOutcome::pass())
    }

    /// 已上传分片查询的请求描述
    async fn check(&self, _ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        Ok(HookOutcome::pass())
    }

    /// 单个分片上传的请求描述
    async fn upload(&self, _ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        Ok(HookOutcome::pass())
    }

    /// 合并请求描述
    async fn merge(&self, _ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        Ok(HookOutcome::pass())
    }

    /// 校验服务端响应，返回 Err 或 Fail 即中止任务
    async fn validate_response(&self, _ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        Ok(HookOutcome::pass())
    }
}

/// 不做任何干预的钩子
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl UploadHooks for NoopHooks {}

/// 按名称分发到对应钩子
pub async fn dispatch(
    hooks: &dyn UploadHooks,
    name: HookName,
    ctx: &HookContext,
) -> anyhow::Result<HookOutcome> {
    match name {
        HookName::Init => hooks.init(ctx).await,
        HookName::Check => hooks.check(ctx).await,
        HookName::Upload => hooks.upload(ctx).await,
        HookName::Merge => hooks.merge(ctx).await,
        HookName::ValidateResponse => hooks.validate_response(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_wire_format() {
        let value = serde_json::to_value(HookOutcome::fail("配额不足", Some("E1".into()))).unwrap();
        assert_eq!(
            value,
            json!({"action": "fail", "message": "配额不足", "code": "E1"})
        );

        let parsed: HookOutcome =
            serde_json::from_value(json!({"action": "success", "payload": {"url": "x"}})).unwrap();
        assert_eq!(parsed, HookOutcome::success(json!({"url": "x"})));

        let parsed: HookOutcome = serde_json::from_value(json!({"action": "continue"})).unwrap();
        assert_eq!(parsed, HookOutcome::pass());
    }

    #[test]
    fn test_request_option_builder() {
        let option = RequestOption::new("/api/chunk")
            .method("put")
            .header("Content-Type", "application/json")
            .field("uploadId", "u1")
            .chunk_field_name("blob");

        assert_eq!(option.effective_method(), "PUT");
        assert_eq!(option.header_value("content-type"), Some("application/json"));
        assert_eq!(option.body.as_ref().unwrap()["uploadId"], "u1");

        let outcome = HookOutcome::request(option.clone());
        match outcome {
            HookOutcome::Continue { data } => {
                let back: RequestOption = serde_json::from_value(data).unwrap();
                assert_eq!(back, option);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_context_skips_file() {
        let ctx = HookContext {
            fingerprint: Some("fp".into()),
            index: Some(2),
            file: Some(UploadFile::from_bytes("a", "a.bin", vec![1, 2, 3])),
            ..Default::default()
        };

        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value, json!({"fingerprint": "fp", "index": 2}));
    }

    struct RejectingHooks;

    #[async_trait]
    impl UploadHooks for RejectingHooks {
        async fn validate_response(&self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
            if ctx.index == Some(2) {
                anyhow::bail!("bad chunk");
            }
            Ok(HookOutcome::pass())
        }
    }

    #[tokio::test]
    async fn test_dispatch() {
        let ctx = HookContext::default();
        assert_eq!(
            dispatch(&NoopHooks, HookName::Merge, &ctx).await.unwrap(),
            HookOutcome::pass()
        );

        let bad = HookContext {
            index: Some(2),
            ..Default::default()
        };
        assert!(dispatch(&RejectingHooks, HookName::ValidateResponse, &bad)
            .await
            .is_err());
        assert!(dispatch(&RejectingHooks, HookName::Upload, &bad).await.is_ok());
    }
}
