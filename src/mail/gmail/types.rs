/// Gmail 凭据数据结构
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 一个已授权的发信身份
///
/// 字段与凭据文件中的 JSON 键一一对应（snake_case）。
/// `refresh_token` 存在即表示"已授权"；只要它仍然有效，
/// `access_token` / `expiry_date` 随时都可以重新生成。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// OAuth2 客户端 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// OAuth2 客户端密钥
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// 长期有效的刷新令牌
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// 短期有效的访问令牌
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Access Token 过期时间（文件中为毫秒时间戳）
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expiry_date: Option<DateTime<Utc>>,

    /// 授权时从服务商解析出的发信地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,

    /// 授权完成时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// 最近一次成功刷新的时间（毫秒时间戳）
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub refreshed_at: Option<DateTime<Utc>>,

    /// 授权时使用的回调地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    /// 授予的权限范围
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl CredentialRecord {
    /// 仅包含 Refresh Token 的记录（来自环境变量）
    pub fn from_refresh_token(refresh_token: String, email_address: Option<String>) -> Self {
        Self {
            refresh_token: Some(refresh_token),
            email_address,
            ..Self::default()
        }
    }

    /// 是否持有非空的 Refresh Token
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// 是否持有非空的 Access Token
    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// 检查 Token 是否在 `margin` 之内过期
    ///
    /// 没有过期时间时返回 `false`，由调用方的其它条件决定是否刷新
    pub fn is_token_expiring(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expiry_date.is_some_and(|expiry| expiry <= now + margin)
    }

    /// 最近一次签发 Access Token 的时间
    ///
    /// 刷新记录优先；从未刷新过的记录以授权时间为准
    pub fn last_issued_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at.or(self.created_at)
    }

    /// 写入新签发的 Access Token
    pub fn update_access_token(
        &mut self,
        access_token: String,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) {
        self.access_token = Some(access_token);
        self.expiry_date = Some(now + expires_in);
        self.refreshed_at = Some(now);
    }
}
