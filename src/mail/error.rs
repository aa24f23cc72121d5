/// 发信链路的错误分类
///
/// Token 相关错误由 `TokenManager` 产生，原样冒泡到 `MailDispatcher`，
/// 再由调度器转换为结构化的失败结果。每种错误都附带一条面向运维人员的提示，
/// 提示中不包含任何密钥。
use thiserror::Error;

/// 重新授权的入口（CLI 子命令）
pub const REAUTHORIZE_HINT: &str = "请运行 `formmail authorize` 重新授权 Gmail 账户";

/// Access Token 获取失败的原因
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// 缺少 client_id / client_secret（部署配置问题）
    #[error("OAuth2 客户端配置无效: {0}")]
    Configuration(String),

    /// 存储文件和环境变量中都没有 Refresh Token
    #[error("未找到可用的 Refresh Token（凭据文件与环境变量均为空）")]
    NoRefreshToken,

    /// 服务商拒绝了 Refresh Token（已过期或被撤销）
    #[error("Refresh Token 无效或已被撤销: {0}")]
    RefreshTokenInvalid(String),

    /// 网络错误、限流、超时等可重试的失败
    #[error("Access Token 刷新暂时失败: {0}")]
    TransientRefresh(String),
}

impl TokenError {
    /// 稳定的机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::NoRefreshToken => "NO_REFRESH_TOKEN",
            Self::RefreshTokenInvalid(_) => "REFRESH_TOKEN_INVALID",
            Self::TransientRefresh(_) => "TRANSIENT_REFRESH_ERROR",
        }
    }

    /// 给运维人员的处理建议
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Configuration(_) => {
                "请检查 CLIENT_ID / CLIENT_SECRET 环境变量或配置文件的 [oauth] 段"
            }
            Self::NoRefreshToken | Self::RefreshTokenInvalid(_) => REAUTHORIZE_HINT,
            Self::TransientRefresh(_) => "网络或服务商暂时不可用，稍后会自动重试",
        }
    }

    /// 只有瞬时失败值得重试；其余错误需要人工介入
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRefresh(_))
    }
}

/// 调度层的前置条件错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Token(#[from] TokenError),

    /// 群发模式下没有任何收件地址（调用方 bug，不重试）
    #[error("群发请求未包含任何收件地址")]
    NoDestinations,
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Token(e) => e.code(),
            Self::NoDestinations => "NO_DESTINATIONS",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            Self::Token(e) => e.hint(),
            Self::NoDestinations => "请至少提供一个收件地址（FROM_TO1 - FROM_TO10）",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(TokenError::TransientRefresh("timeout".into()).is_retryable());
        assert!(!TokenError::RefreshTokenInvalid("invalid_grant".into()).is_retryable());
        assert!(!TokenError::NoRefreshToken.is_retryable());
        assert!(!TokenError::Configuration("missing".into()).is_retryable());
    }

    #[test]
    fn test_reauthorization_hint() {
        assert_eq!(TokenError::NoRefreshToken.hint(), REAUTHORIZE_HINT);
        assert_eq!(
            TokenError::RefreshTokenInvalid("invalid_grant".into()).hint(),
            REAUTHORIZE_HINT
        );
        assert_ne!(
            TokenError::TransientRefresh("503".into()).hint(),
            REAUTHORIZE_HINT
        );
    }

    #[test]
    fn test_dispatch_error_wraps_token_code() {
        let err: DispatchError = TokenError::NoRefreshToken.into();
        assert_eq!(err.code(), "NO_REFRESH_TOKEN");
        assert_eq!(DispatchError::NoDestinations.code(), "NO_DESTINATIONS");
    }
}
