/// 凭据来源解析链
///
/// 按固定顺序尝试每个来源：凭据文件优先，其次是环境变量预置的 Refresh Token。
/// "没找到"不是错误，只有整条链都落空时才由调用方报告 `NoRefreshToken`。
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::CredentialStore;
use crate::mail::gmail::types::CredentialRecord;

/// 单个凭据来源
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// 来源名称（日志与状态展示用）
    fn name(&self) -> &'static str;

    /// 返回带 Refresh Token 的记录；没有可用记录时返回 `None`
    async fn resolve(&self) -> Option<CredentialRecord>;
}

/// 从凭据文件读取
pub struct StoreResolver {
    store: Arc<dyn CredentialStore>,
}

impl StoreResolver {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialResolver for StoreResolver {
    fn name(&self) -> &'static str {
        "credential-store"
    }

    async fn resolve(&self) -> Option<CredentialRecord> {
        let record = self.store.load().await?;
        if record.has_refresh_token() {
            Some(record)
        } else {
            tracing::debug!("凭据文件中没有 refresh_token，跳过");
            None
        }
    }
}

/// 从环境变量（或配置文件）预置的 Refresh Token 构造
pub struct EnvResolver {
    refresh_token: Option<String>,
    email_address: Option<String>,
}

impl EnvResolver {
    pub fn new(refresh_token: Option<String>, email_address: Option<String>) -> Self {
        Self {
            refresh_token,
            email_address,
        }
    }
}

#[async_trait]
impl CredentialResolver for EnvResolver {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn resolve(&self) -> Option<CredentialRecord> {
        let token = self.refresh_token.as_ref().filter(|t| !t.is_empty())?;
        Some(CredentialRecord::from_refresh_token(
            token.clone(),
            self.email_address.clone(),
        ))
    }
}

/// 依次尝试所有来源，返回第一个命中的记录及其来源名称
pub async fn resolve_first(
    resolvers: &[Box<dyn CredentialResolver>],
) -> Option<(CredentialRecord, &'static str)> {
    for resolver in resolvers {
        if let Some(record) = resolver.resolve().await {
            tracing::info!("✅ 使用凭据来源: {}", resolver.name());
            return Some((record, resolver.name()));
        }
        tracing::debug!("凭据来源 {} 未命中", resolver.name());
    }
    None
}

/// 凭据状态报告（不含任何密钥）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialReport {
    pub location: String,
    pub record_exists: bool,
    pub client_configured: bool,
    pub email_address: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub token_expired: Option<bool>,
    pub scopes: Vec<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token_on_file: bool,
    pub env_refresh_token_configured: bool,
}

/// 汇总凭据文件与环境变量的状态
pub async fn report(store: &dyn CredentialStore, oauth: &OAuthConfig) -> CredentialReport {
    let record = store.load().await;
    let now = Utc::now();

    CredentialReport {
        location: store.location(),
        record_exists: record.is_some(),
        client_configured: oauth.validate().is_ok(),
        email_address: record.as_ref().and_then(|r| r.email_address.clone()),
        created_at: record.as_ref().and_then(|r| r.created_at),
        expiry_date: record.as_ref().and_then(|r| r.expiry_date),
        token_expired: record
            .as_ref()
            .and_then(|r| r.expiry_date)
            .map(|expiry| expiry <= now),
        scopes: record.as_ref().map(|r| r.scopes.clone()).unwrap_or_default(),
        redirect_uri: record.as_ref().and_then(|r| r.redirect_uri.clone()),
        refresh_token_on_file: record.as_ref().is_some_and(|r| r.has_refresh_token()),
        env_refresh_token_configured: oauth
            .refresh_token
            .as_deref()
            .is_some_and(|t| !t.is_empty()),
    }
}
