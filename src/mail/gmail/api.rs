/// Gmail API 调用模块
///
/// 负责调用 Gmail API 发送原始 MIME 邮件，以及获取授权账户的用户信息
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::mail::error::TokenError;
use crate::mail::gmail::token::TokenManager;
use crate::utils::{http_client, mask_secret};

/// Gmail 发送端点
const SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

/// Google OIDC 用户信息端点
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";

/// 单次发送失败的原因
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendFailure {
    /// 服务商返回 401，Access Token 被提前作废
    #[error("Gmail 拒绝了 Access Token: {0}")]
    Unauthorized(String),

    /// 服务商拒收（地址无效、配额、权限不足等）
    #[error("Gmail 发送失败: {0}")]
    Rejected(String),

    /// 网络层失败
    #[error("请求 Gmail API 失败: {0}")]
    Network(String),
}

/// 发信传输层：提交一封原始 MIME 邮件，返回服务商分配的消息 ID
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_raw(
        &self,
        access_token: &str,
        recipient: &str,
        raw: &[u8],
    ) -> Result<String, SendFailure>;
}

/// Gmail `messages.send` 响应
#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Google UserInfo 响应 (OIDC 标准)
#[derive(Debug, Deserialize)]
pub struct GoogleUserInfo {
    /// 用户完整姓名
    pub name: Option<String>,

    /// 邮箱地址
    pub email: String,
}

/// Gmail API 客户端
pub struct GmailApiClient {
    access_token: String,
}

impl GmailApiClient {
    /// 创建新的 Gmail API 客户端
    ///
    /// # Arguments
    /// * `access_token` - 有效的 Access Token
    pub fn new(access_token: String) -> Self {
        Self { access_token }
    }

    /// 发送原始 MIME 邮件
    ///
    /// Gmail 要求以 base64url 编码放在 `raw` 字段中
    pub async fn send_message(&self, raw: &[u8]) -> Result<String, SendFailure> {
        let body = serde_json::json!({ "raw": URL_SAFE_NO_PAD.encode(raw) });

        let response = http_client::get_client()
            .post(SEND_URL)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendFailure::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(SendFailure::Unauthorized(format!("{}: {}", status, error_text)));
            }

            return Err(SendFailure::Rejected(format!("{}: {}", status, error_text)));
        }

        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| SendFailure::Rejected(format!("解析发送响应失败: {}", e)))?;

        Ok(sent.id)
    }

    /// 获取用户信息（邮箱、名字）
    ///
    /// 需要 scope: `userinfo.email`
    pub async fn get_user_info(&self) -> Result<GoogleUserInfo> {
        tracing::debug!("正在获取用户资料...");

        let response = http_client::get_client()
            .get(USERINFO_URL)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("请求用户信息失败")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            if status == 403 || status == 404 {
                tracing::warn!(
                    "获取用户信息失败，可能是 Scope 缺失 (userinfo.email): {}",
                    error_text
                );
            }

            anyhow::bail!("UserInfo API 返回错误 {}: {}", status, error_text);
        }

        let info: GoogleUserInfo = response.json().await.context("解析用户信息响应失败")?;
        tracing::debug!("✅ 获取到用户信息: {}", info.email);

        Ok(info)
    }
}

/// 通过 Gmail API 发信
pub struct GmailTransport;

#[async_trait]
impl MailTransport for GmailTransport {
    async fn send_raw(
        &self,
        access_token: &str,
        recipient: &str,
        raw: &[u8],
    ) -> Result<String, SendFailure> {
        tracing::debug!(
            "调用 Gmail API 发送至 {}（Token: {}，{} 字节）",
            recipient,
            mask_secret(access_token),
            raw.len()
        );
        GmailApiClient::new(access_token.to_string())
            .send_message(raw)
            .await
    }
}

/// 凭据检查结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialCheck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    /// 掩码后的 Access Token，仅用于确认刷新成功
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
}

impl CredentialCheck {
    fn failed(error: String, code: &'static str, hint: &'static str) -> Self {
        Self {
            success: false,
            email_address: None,
            access_token: None,
            error: Some(error),
            code: Some(code),
            hint: Some(hint),
        }
    }
}

/// 检查凭据是否可用
///
/// 强制刷新一次 Access Token，再读取账户信息
pub async fn check_credentials(tokens: &TokenManager) -> CredentialCheck {
    tracing::info!("🧪 开始检查 Gmail 凭据...");

    let access_token = match tokens.force_refresh().await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("❌ 凭据检查失败: {}", e);
            return token_failure(e);
        }
    };

    match GmailApiClient::new(access_token.clone()).get_user_info().await {
        Ok(info) => {
            tracing::info!(
                "✅ Gmail 凭据有效，账户: {} ({})",
                info.email,
                info.name.as_deref().unwrap_or("-")
            );
            CredentialCheck {
                success: true,
                email_address: Some(info.email),
                access_token: Some(mask_secret(&access_token)),
                error: None,
                code: None,
                hint: None,
            }
        }
        Err(e) => {
            tracing::error!("❌ 读取账户信息失败: {:#}", e);
            CredentialCheck::failed(
                format!("{:#}", e),
                "PROFILE_LOOKUP_FAILED",
                "Token 有效但无法读取账户信息，请确认授权时包含 userinfo.email 权限",
            )
        }
    }
}

fn token_failure(e: TokenError) -> CredentialCheck {
    CredentialCheck::failed(e.to_string(), e.code(), e.hint())
}
