/// 表单提交与发送结果
///
/// `FormSubmission` 由外部校验层产生，调度器只读使用；
/// `SendResult` / `DispatchReport` 是返回给调用方的结构化结果。
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mail::template::TemplateId;

/// 群发收件地址字段数量（FROM_TO1 - FROM_TO10）
pub const MAX_DESTINATIONS: usize = 10;

/// 收件地址字段前缀
const DESTINATION_KEY_PREFIX: &str = "FROM_TO";

/// 随机后缀字符集（小写 base36）
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// 群发模式下的一个收件地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// 来源字段名，例如 `FROM_TO1`
    pub key: String,
    pub email: String,
}

/// 审计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAudit {
    #[serde(default)]
    pub submission_id: String,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for SubmissionAudit {
    fn default() -> Self {
        Self {
            submission_id: String::new(),
            timestamp: Utc::now(),
            ip: None,
            user_agent: None,
        }
    }
}

/// 已校验的表单提交
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSubmission {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,

    #[serde(default)]
    pub template_id: TemplateId,

    /// 群发收件地址；单发模式下忽略
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<Destination>,

    #[serde(flatten)]
    pub audit: SubmissionAudit,
}

impl FormSubmission {
    /// 从外部校验层产出的扁平 JSON 构造
    ///
    /// 未显式给出 `destinations` 时从 `FROM_TO1` - `FROM_TO10` 字段提取；
    /// 缺少提交 ID 时按 `<prefix>_<毫秒>_<随机>` 生成
    pub fn from_json(value: Value, id_prefix: &str) -> Result<Self> {
        let mut submission: Self =
            serde_json::from_value(value.clone()).context("表单数据格式无效")?;

        if submission.destinations.is_empty() {
            if let Value::Object(fields) = &value {
                submission.destinations = destinations_from_fields(fields);
            }
        }

        if submission.audit.submission_id.trim().is_empty() {
            submission.audit.submission_id = generate_id(id_prefix);
        }

        Ok(submission)
    }

    /// 非空的电话
    pub fn phone(&self) -> Option<&str> {
        non_blank(self.phone.as_deref())
    }

    /// 非空的公司名
    pub fn company(&self) -> Option<&str> {
        non_blank(self.company.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// 从 `FROM_TO1` - `FROM_TO10` 字段提取群发地址
///
/// 按编号顺序，去掉首尾空白，跳过空值
pub fn destinations_from_fields(fields: &Map<String, Value>) -> Vec<Destination> {
    (1..=MAX_DESTINATIONS)
        .filter_map(|i| {
            let key = format!("{}{}", DESTINATION_KEY_PREFIX, i);
            let email = fields.get(&key)?.as_str()?.trim();
            (!email.is_empty()).then(|| Destination {
                key,
                email: email.to_string(),
            })
        })
        .collect()
}

/// 生成 `<prefix>_<毫秒时间戳>_<9 位随机字符>` 格式的 ID
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect();

    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

/// 单个收件地址的发送结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,

    /// 单发时为本次调度 ID，群发时由 `DispatchReport` 携带
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,

    /// 群发字段名（`FROM_TO<n>`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,

    pub timestamp: DateTime<Utc>,
}

impl SendResult {
    pub fn sent(destination: &str, message_id: String) -> Self {
        Self {
            success: true,
            dispatch_id: None,
            key: None,
            destination: Some(destination.to_string()),
            message_id: Some(message_id),
            error: None,
            code: None,
            hint: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        destination: Option<&str>,
        error: String,
        code: &'static str,
        hint: &'static str,
    ) -> Self {
        Self {
            success: false,
            dispatch_id: None,
            key: None,
            destination: destination.map(str::to_string),
            message_id: None,
            error: Some(error),
            code: Some(code),
            hint: Some(hint),
            timestamp: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn with_dispatch_id(mut self, dispatch_id: &str) -> Self {
        self.dispatch_id = Some(dispatch_id.to_string());
        self
    }
}

/// 一次调度的汇总结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub dispatch_id: String,

    /// 至少有一个地址发送成功即为成功
    pub success: bool,

    /// 与输入收件地址同序
    pub results: Vec<SendResult>,

    pub total_sent: usize,
    pub total_failed: usize,

    /// 前置条件失败（Token、收件地址）时的错误
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,

    pub timestamp: DateTime<Utc>,
}

impl DispatchReport {
    /// 汇总逐个地址的发送结果
    pub fn completed(dispatch_id: String, results: Vec<SendResult>) -> Self {
        let total_sent = results.iter().filter(|r| r.success).count();
        let total_failed = results.len() - total_sent;

        Self {
            dispatch_id,
            success: total_sent > 0,
            results,
            total_sent,
            total_failed,
            error: None,
            code: None,
            hint: None,
            timestamp: Utc::now(),
        }
    }

    /// 前置条件未满足，没有发起任何发送
    pub fn aborted(
        dispatch_id: String,
        error: String,
        code: &'static str,
        hint: &'static str,
    ) -> Self {
        Self {
            dispatch_id,
            success: false,
            results: Vec::new(),
            total_sent: 0,
            total_failed: 0,
            error: Some(error),
            code: Some(code),
            hint: Some(hint),
            timestamp: Utc::now(),
        }
    }
}

impl From<SendResult> for DispatchReport {
    fn from(result: SendResult) -> Self {
        let dispatch_id = result.dispatch_id.clone().unwrap_or_default();
        let mut report = Self::completed(dispatch_id, vec![result]);
        if let Some(failed) = report.results.first().filter(|r| !r.success) {
            report.error = failed.error.clone();
            report.code = failed.code;
            report.hint = failed.hint;
        }
        report
    }
}
