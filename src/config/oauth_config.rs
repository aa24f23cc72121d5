/// OAuth2 配置读取模块
///
/// 支持从环境变量、配置文件或默认值读取 OAuth2 客户端凭据
use serde::{Deserialize, Serialize};

use crate::mail::error::TokenError;

/// Google 授权端点
pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Google Token 端点
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// OAuth2 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Google OAuth2 客户端 ID
    pub client_id: String,

    /// Google OAuth2 客户端密钥
    pub client_secret: String,

    /// 重定向 URI（本地服务器地址）
    pub redirect_uri: String,

    /// 请求的 API 权限范围
    pub scopes: Vec<String>,

    /// 预置的 Refresh Token（仅在凭据文件不可用时使用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: "YOUR_CLIENT_ID.apps.googleusercontent.com".to_string(),
            client_secret: "YOUR_CLIENT_SECRET".to_string(),
            redirect_uri: "http://localhost:8080".to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/gmail.send".to_string(), // 发送邮件
                "https://www.googleapis.com/auth/userinfo.email".to_string(), // 获取邮箱地址
                "openid".to_string(),                                     // OIDC 身份认证标准
            ],
            refresh_token: None,
        }
    }
}

impl OAuthConfig {
    /// 解析 OAuth2 配置
    ///
    /// 优先级（从高到低）：
    /// 1. 环境变量：`CLIENT_ID`, `CLIENT_SECRET`（`REDIRECT_URI`, `REFRESH_TOKEN` 可选）
    /// 2. 配置文件的 `[oauth]` 段
    /// 3. 默认占位符（`validate` 会拒绝）
    pub fn resolve<F>(lookup: F, from_file: Option<Self>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match (lookup("CLIENT_ID"), lookup("CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => {
                tracing::info!("✅ 从环境变量加载 OAuth2 配置");
                Self {
                    client_id,
                    client_secret,
                    ..Self::default()
                }
            }
            _ => match from_file {
                Some(file_cfg) => {
                    tracing::info!("✅ 从配置文件加载 OAuth2 配置");
                    file_cfg
                }
                None => {
                    tracing::warn!("⚠️ 未找到 OAuth2 配置，使用默认占位符");
                    Self::default()
                }
            },
        };

        if let Some(redirect_uri) = lookup("REDIRECT_URI") {
            cfg.redirect_uri = redirect_uri;
        }
        if let Some(refresh_token) = lookup("REFRESH_TOKEN") {
            cfg.refresh_token = Some(refresh_token);
        }

        cfg
    }

    /// 验证配置是否为默认占位符
    pub fn is_placeholder(&self) -> bool {
        self.client_id.contains("YOUR_CLIENT_ID")
            || self.client_secret.contains("YOUR_CLIENT_SECRET")
    }

    /// 确认客户端标识可用
    pub fn validate(&self) -> Result<(), TokenError> {
        if self.client_id.trim().is_empty() || self.client_secret.trim().is_empty() {
            return Err(TokenError::Configuration(
                "CLIENT_ID 和 CLIENT_SECRET 必须配置".to_string(),
            ));
        }
        if self.is_placeholder() {
            return Err(TokenError::Configuration(
                "CLIENT_ID / CLIENT_SECRET 仍为默认占位符".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OAuthConfig::default();
        assert!(config.is_placeholder());
        assert_eq!(config.redirect_uri, "http://localhost:8080");
        assert!(config
            .scopes
            .iter()
            .any(|s| s == "https://www.googleapis.com/auth/gmail.send"));
        assert!(matches!(
            config.validate(),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn test_is_placeholder() {
        let mut config = OAuthConfig::default();
        assert!(config.is_placeholder());

        config.client_id = "real-client-id.apps.googleusercontent.com".to_string();
        config.client_secret = "real-secret".to_string();
        assert!(!config.is_placeholder());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_secret_is_configuration_error() {
        let config = OAuthConfig {
            client_id: "id".to_string(),
            client_secret: "  ".to_string(),
            ..OAuthConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn test_env_takes_priority_over_file() {
        let file_cfg = OAuthConfig {
            client_id: "file-id".to_string(),
            client_secret: "file-secret".to_string(),
            ..OAuthConfig::default()
        };

        let config = OAuthConfig::resolve(
            |key| match key {
                "CLIENT_ID" => Some("env-id".to_string()),
                "CLIENT_SECRET" => Some("env-secret".to_string()),
                "REFRESH_TOKEN" => Some("1//env-refresh".to_string()),
                _ => None,
            },
            Some(file_cfg.clone()),
        );
        assert_eq!(config.client_id, "env-id");
        assert_eq!(config.refresh_token.as_deref(), Some("1//env-refresh"));

        // 环境变量只有一半时回退到配置文件
        let config = OAuthConfig::resolve(
            |key| (key == "CLIENT_ID").then(|| "env-id".to_string()),
            Some(file_cfg),
        );
        assert_eq!(config.client_id, "file-id");
        assert!(config.refresh_token.is_none());
    }
}
