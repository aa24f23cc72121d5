/// Token 自动刷新管理模块
///
/// `TokenManager` 独占当前进程的凭据记录，保证每次发信拿到的 Access Token 都未过期：
///
/// - 未初始化：首次调用时校验 client_id / client_secret，缺失则返回 `Configuration`
/// - 未授权：按顺序解析凭据来源（凭据文件 → 环境变量），都没有则返回 `NoRefreshToken`
/// - 已授权：Token 仍有效时直接返回缓存，不发起网络请求
/// - 刷新中：缺少 Access Token、距过期不足 5 分钟、或距上次刷新超过 55 分钟时触发
///
/// 刷新过程持有内部互斥锁，并发调用者会等待同一次刷新的结果，而不是各自再刷新一次。
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, RequestTokenError, TokenResponse, TokenUrl,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::oauth_config::{AUTH_URL, OAuthConfig, TOKEN_URL};
use crate::config::storage::CredentialStore;
use crate::mail::error::TokenError;
use crate::mail::gmail::credentials::{self, CredentialResolver, EnvResolver, StoreResolver};
use crate::mail::gmail::types::CredentialRecord;
use crate::utils::mask_secret;

/// Token 刷新阈值（提前多少分钟刷新）
pub const REFRESH_THRESHOLD_MINUTES: i64 = 5;

/// 距上次刷新超过该时长时强制刷新，防止过期时间字段失真
pub const REFRESH_CEILING_MINUTES: i64 = 55;

/// 单次刷新请求的超时时间（秒）
const REFRESH_TIMEOUT_SECS: u64 = 20;

/// 服务商未返回有效期时使用的默认值（秒）
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// 服务商返回的新 Token
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: Option<std::time::Duration>,
    /// 服务商轮换 Refresh Token 时返回的新值
    pub refresh_token: Option<String>,
}

/// 刷新失败的分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// `invalid_grant`：Refresh Token 已过期或被撤销
    InvalidGrant(String),
    /// `invalid_client` / `unauthorized_client`：客户端标识错误
    InvalidClient(String),
    /// 网络、限流、服务端错误等
    Transient(String),
}

/// Token 刷新端点
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// 使用 Refresh Token 交换新的 Access Token
    async fn refresh(
        &self,
        client: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshFailure>;
}

/// Google OAuth2 Token 端点
pub struct GoogleTokenEndpoint;

#[async_trait]
impl TokenEndpoint for GoogleTokenEndpoint {
    async fn refresh(
        &self,
        client: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshFailure> {
        let oauth_client = build_client(client).map_err(RefreshFailure::InvalidClient)?;

        let response = oauth_client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(classify_refresh_error)?;

        Ok(RefreshedToken {
            access_token: response.access_token().secret().to_string(),
            expires_in: response.expires_in(),
            refresh_token: response.refresh_token().map(|t| t.secret().to_string()),
        })
    }
}

/// 构建 OAuth2 客户端
pub fn build_client(config: &OAuthConfig) -> Result<BasicClient, String> {
    let auth_url = AuthUrl::new(AUTH_URL.to_string()).map_err(|e| e.to_string())?;
    let token_url = TokenUrl::new(TOKEN_URL.to_string()).map_err(|e| e.to_string())?;

    Ok(BasicClient::new(
        ClientId::new(config.client_id.clone()),
        Some(ClientSecret::new(config.client_secret.clone())),
        auth_url,
        Some(token_url),
    ))
}

/// 把 oauth2 的错误归类为"需要重新授权 / 配置错误 / 可重试"
fn classify_refresh_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> RefreshFailure
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(resp) => {
            let kind: &str = resp.error().as_ref();
            let detail = match resp.error_description() {
                Some(description) => format!("{}: {}", kind, description),
                None => kind.to_string(),
            };

            match resp.error() {
                BasicErrorResponseType::InvalidGrant => RefreshFailure::InvalidGrant(detail),
                BasicErrorResponseType::InvalidClient
                | BasicErrorResponseType::UnauthorizedClient => {
                    RefreshFailure::InvalidClient(detail)
                }
                _ => RefreshFailure::Transient(detail),
            }
        }
        RequestTokenError::Request(e) => RefreshFailure::Transient(format!("网络请求失败: {}", e)),
        RequestTokenError::Parse(e, _) => {
            RefreshFailure::Transient(format!("解析 Token 响应失败: {}", e))
        }
        RequestTokenError::Other(msg) => RefreshFailure::Transient(msg),
    }
}

/// 对外展示的 Token 状态（不含任何密钥）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub authorized: bool,
    pub source: Option<&'static str>,
    pub email_address: Option<String>,
    pub has_access_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

/// 进程内的凭据状态
#[derive(Debug, Default)]
struct TokenState {
    /// 当前生效的凭据记录；`None` 表示尚未授权
    record: Option<CredentialRecord>,
    /// 记录来自哪个凭据来源
    source: Option<&'static str>,
    /// 最近一次成功刷新的时间
    last_refresh_at: Option<DateTime<Utc>>,
}

impl TokenState {
    fn authorize(&mut self, record: CredentialRecord, source: &'static str) {
        self.last_refresh_at = record.last_issued_at();
        self.record = Some(record);
        self.source = Some(source);
    }

    fn revoke(&mut self) {
        self.record = None;
        self.source = None;
        self.last_refresh_at = None;
    }

    /// 判断是否需要刷新
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let Some(record) = &self.record else {
            return true;
        };

        if !record.has_access_token() {
            return true;
        }

        if record.is_token_expiring(now, Duration::minutes(REFRESH_THRESHOLD_MINUTES)) {
            return true;
        }

        match self.last_refresh_at {
            Some(at) => now - at > Duration::minutes(REFRESH_CEILING_MINUTES),
            None => true,
        }
    }
}

/// Token 管理器
///
/// 负责自动刷新过期的 Access Token，并把刷新结果写回凭据存储
pub struct TokenManager {
    /// OAuth2 客户端配置
    oauth_config: OAuthConfig,

    /// 凭据持久化
    store: Arc<dyn CredentialStore>,

    /// 凭据来源（按优先级排列）
    resolvers: Vec<Box<dyn CredentialResolver>>,

    /// Token 刷新端点
    endpoint: Arc<dyn TokenEndpoint>,

    state: Mutex<TokenState>,
}

impl TokenManager {
    /// 创建 Token 管理器
    ///
    /// 默认凭据来源：凭据文件 → `OAuthConfig::refresh_token`（来自环境变量）
    pub fn new(
        oauth_config: OAuthConfig,
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        let resolvers: Vec<Box<dyn CredentialResolver>> = vec![
            Box::new(StoreResolver::new(store.clone())),
            Box::new(EnvResolver::new(oauth_config.refresh_token.clone(), None)),
        ];

        Self {
            oauth_config,
            store,
            resolvers,
            endpoint,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// 获取有效的 Access Token
    ///
    /// 如果 Token 缺失、即将过期（提前 5 分钟）或距上次刷新过久，则自动刷新
    ///
    /// # Errors
    /// - `Configuration`：client_id / client_secret 缺失
    /// - `NoRefreshToken`：没有任何凭据来源
    /// - `RefreshTokenInvalid`：Refresh Token 被拒绝，需要人工重新授权（不要重试）
    /// - `TransientRefresh`：网络或服务商暂时失败，可稍后重试
    pub async fn get_valid_access_token(&self) -> Result<String, TokenError> {
        self.oauth_config.validate()?;

        let mut state = self.state.lock().await;
        self.ensure_authorized(&mut state).await?;

        let now = Utc::now();
        if !state.needs_refresh(now) {
            if let Some(token) = state.record.as_ref().and_then(|r| r.access_token.clone()) {
                tracing::debug!("使用缓存的 Access Token");
                return Ok(token);
            }
        }

        if let Some(expiry) = state.record.as_ref().and_then(|r| r.expiry_date) {
            tracing::info!("Access Token 需要刷新（过期时间: {}）", expiry);
        } else {
            tracing::info!("Access Token 缺失，开始刷新");
        }

        self.refresh_locked(&mut state, now).await
    }

    /// 强制刷新 Access Token
    ///
    /// 用于凭据检查等需要立即验证 Refresh Token 的场景
    pub async fn force_refresh(&self) -> Result<String, TokenError> {
        self.oauth_config.validate()?;

        let mut state = self.state.lock().await;
        self.ensure_authorized(&mut state).await?;
        self.refresh_locked(&mut state, Utc::now()).await
    }

    /// 丢弃缓存的 Access Token
    ///
    /// 服务商提前作废了 Token（发送返回 401）时调用，下次获取会重新刷新
    pub async fn invalidate_access_token(&self) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.record.as_mut() {
            record.access_token = None;
            record.expiry_date = None;
            tracing::info!("已丢弃被拒绝的 Access Token，下次发送时重新刷新");
        }
    }

    /// 当前状态快照
    pub async fn status(&self) -> TokenStatus {
        let state = self.state.lock().await;
        let record = state.record.as_ref();

        TokenStatus {
            authorized: record.is_some_and(|r| r.has_refresh_token()),
            source: state.source,
            email_address: record.and_then(|r| r.email_address.clone()),
            has_access_token: record.is_some_and(|r| r.has_access_token()),
            expires_at: record.and_then(|r| r.expiry_date),
            last_refresh_at: state.last_refresh_at,
        }
    }

    /// 未授权时按优先级解析凭据
    async fn ensure_authorized(&self, state: &mut TokenState) -> Result<(), TokenError> {
        if state.record.as_ref().is_some_and(|r| r.has_refresh_token()) {
            return Ok(());
        }

        match credentials::resolve_first(&self.resolvers).await {
            Some((record, source)) => {
                state.authorize(record, source);
                Ok(())
            }
            None => {
                tracing::error!("❌ 未找到 Refresh Token（凭据文件与环境变量均为空）");
                Err(TokenError::NoRefreshToken)
            }
        }
    }

    /// 使用 Refresh Token 从服务商获取新的 Access Token
    ///
    /// 调用方必须持有状态锁
    async fn refresh_locked(
        &self,
        state: &mut TokenState,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let refresh_token = state
            .record
            .as_ref()
            .and_then(|r| r.refresh_token.clone())
            .ok_or(TokenError::NoRefreshToken)?;

        tracing::debug!("开始刷新 Access Token（来源: {:?}）", state.source);

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(REFRESH_TIMEOUT_SECS),
            self.endpoint.refresh(&self.oauth_config, &refresh_token),
        )
        .await;

        let refreshed = match outcome {
            Ok(Ok(refreshed)) => refreshed,
            Ok(Err(RefreshFailure::InvalidGrant(detail))) => {
                tracing::error!("❌ Token 刷新失败 [授权被拒绝/已过期]: {}", detail);
                tracing::error!(
                    "   💡 可能原因:\n   \
                     - Refresh Token 已过期或被撤销\n   \
                     - 用户撤销了应用授权\n   \
                     - 需要重新授权：formmail authorize"
                );
                // 回到未授权状态；凭据文件保持原样，等待人工重新授权
                state.revoke();
                return Err(TokenError::RefreshTokenInvalid(detail));
            }
            Ok(Err(RefreshFailure::InvalidClient(detail))) => {
                tracing::error!("❌ Token 刷新失败 [客户端标识无效]: {}", detail);
                return Err(TokenError::Configuration(detail));
            }
            Ok(Err(RefreshFailure::Transient(detail))) => {
                tracing::warn!("⚠️ Token 刷新暂时失败，下次调用时重试: {}", detail);
                return Err(TokenError::TransientRefresh(detail));
            }
            Err(_) => {
                tracing::warn!("⚠️ Token 刷新超时（{}s），下次调用时重试", REFRESH_TIMEOUT_SECS);
                return Err(TokenError::TransientRefresh(format!(
                    "刷新请求超时（{}s）",
                    REFRESH_TIMEOUT_SECS
                )));
            }
        };

        let expires_in = refreshed
            .expires_in
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(|| Duration::seconds(DEFAULT_EXPIRES_IN_SECS));

        let Some(record) = state.record.as_mut() else {
            return Err(TokenError::NoRefreshToken);
        };
        record.update_access_token(refreshed.access_token.clone(), expires_in, now);

        // 只写回刷新产生的字段，文件中的其它字段由存储层合并保留
        let mut update = CredentialRecord {
            access_token: record.access_token.clone(),
            expiry_date: record.expiry_date,
            refreshed_at: record.refreshed_at,
            ..CredentialRecord::default()
        };

        if let Some(rotated) = refreshed.refresh_token.filter(|t| *t != refresh_token) {
            tracing::info!("服务商轮换了 Refresh Token，一并更新");
            record.refresh_token = Some(rotated.clone());
            update.refresh_token = Some(rotated);
        }

        let expires_at = record.expiry_date;
        state.last_refresh_at = Some(now);

        if let Err(e) = self.store.save(&update).await {
            tracing::warn!("⚠️ 刷新后的 Token 持久化失败（不影响本次发信）: {:#}", e);
        }

        tracing::info!("✅ Access Token 刷新成功（新的过期时间: {:?}）", expires_at);
        tracing::debug!("新 Token: {}", mask_secret(&refreshed.access_token));

        Ok(refreshed.access_token)
    }
}
