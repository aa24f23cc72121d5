/// 单元测试共用的替身实现
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::CredentialStore;
use crate::mail::gmail::api::{MailTransport, SendFailure};
use crate::mail::gmail::token::{RefreshFailure, RefreshedToken, TokenEndpoint};
use crate::mail::gmail::types::CredentialRecord;

/// 非占位符的客户端配置
pub fn valid_oauth_config() -> OAuthConfig {
    OAuthConfig {
        client_id: "test-client.apps.googleusercontent.com".to_string(),
        client_secret: "test-secret".to_string(),
        ..OAuthConfig::default()
    }
}

/// 已授权的凭据，Access Token 在 `expires_in_minutes` 分钟后过期（可为负数）
pub fn authorized_record(expires_in_minutes: i64) -> CredentialRecord {
    let now = Utc::now();
    CredentialRecord {
        refresh_token: Some("1//stored".to_string()),
        access_token: Some("ya29.cached".to_string()),
        expiry_date: Some(now + Duration::minutes(expires_in_minutes)),
        email_address: Some("owner@example.com".to_string()),
        refreshed_at: Some(now),
        ..CredentialRecord::default()
    }
}

/// 内存凭据存储，`save` 与文件存储一样按字段合并
#[derive(Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<CredentialRecord>>,
    saves: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn with_record(record: CredentialRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Option<CredentialRecord> {
        self.record.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Option<CredentialRecord> {
        self.current()
    }

    async fn save(&self, update: &CredentialRecord) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.record.lock().unwrap();
        let merged = guard.get_or_insert_with(CredentialRecord::default);

        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if update.$field.is_some() {
                    merged.$field = update.$field.clone();
                })*
            };
        }
        overlay!(
            client_id,
            client_secret,
            refresh_token,
            access_token,
            expiry_date,
            email_address,
            created_at,
            refreshed_at,
            redirect_uri
        );
        if !update.scopes.is_empty() {
            merged.scopes = update.scopes.clone();
        }
        Ok(())
    }

    async fn replace(&self, record: &CredentialRecord) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.record.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// 可以读取、但每次写入都失败的存储（磁盘只读、权限不足等）
pub struct ReadOnlyCredentialStore {
    record: CredentialRecord,
    attempts: AtomicUsize,
}

impl ReadOnlyCredentialStore {
    pub fn with_record(record: CredentialRecord) -> Self {
        Self {
            record,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for ReadOnlyCredentialStore {
    async fn load(&self) -> Option<CredentialRecord> {
        Some(self.record.clone())
    }

    async fn save(&self, _record: &CredentialRecord) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("只读文件系统")
    }

    async fn replace(&self, _record: &CredentialRecord) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("只读文件系统")
    }

    fn location(&self) -> String {
        "read-only".to_string()
    }
}

/// 按脚本返回结果的 Token 端点；脚本用完后返回 `ya29.fresh-<n>`
#[derive(Default)]
pub struct FakeTokenEndpoint {
    script: Mutex<VecDeque<Result<RefreshedToken, RefreshFailure>>>,
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Option<std::time::Duration>,
}

impl FakeTokenEndpoint {
    pub fn scripted(script: Vec<Result<RefreshedToken, RefreshFailure>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenEndpoint for FakeTokenEndpoint {
    async fn refresh(
        &self,
        _client: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(refresh_token.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(RefreshedToken {
                access_token: format!("ya29.fresh-{}", n),
                expires_in: Some(std::time::Duration::from_secs(3600)),
                refresh_token: None,
            })
        })
    }
}

/// 记录每次发送的传输层
///
/// `rejected` 中的地址被拒收，使用 `revoked_tokens` 中 Token 的请求返回 401
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<SentMessage>>,
    rejected: HashSet<String>,
    revoked_tokens: HashSet<String>,
}

/// 一次发送调用的快照
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub recipient: String,
    pub access_token: String,
    pub raw: Vec<u8>,
}

impl FakeTransport {
    pub fn rejecting(addresses: &[&str]) -> Self {
        Self {
            rejected: addresses.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn revoking_tokens(tokens: &[&str]) -> Self {
        Self {
            revoked_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl SentMessage {
    /// 解析出的 `(text/plain, text/html)` 正文
    pub fn bodies(&self) -> (String, String) {
        let parsed = mailparse::parse_mail(&self.raw).expect("MIME 解析失败");
        let mut text = String::new();
        let mut html = String::new();
        for part in &parsed.subparts {
            match part.ctype.mimetype.as_str() {
                "text/plain" => text = part.get_body().unwrap(),
                "text/html" => html = part.get_body().unwrap(),
                _ => {}
            }
        }
        (text, html)
    }

    /// 读取顶层邮件头
    pub fn header(&self, name: &str) -> Option<String> {
        use mailparse::MailHeaderMap;
        let parsed = mailparse::parse_mail(&self.raw).expect("MIME 解析失败");
        parsed.headers.get_first_value(name)
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn send_raw(
        &self,
        access_token: &str,
        recipient: &str,
        raw: &[u8],
    ) -> Result<String, SendFailure> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentMessage {
            recipient: recipient.to_string(),
            access_token: access_token.to_string(),
            raw: raw.to_vec(),
        });

        if self.revoked_tokens.contains(access_token) {
            return Err(SendFailure::Unauthorized("401 Invalid Credentials".to_string()));
        }

        if self.rejected.contains(recipient) {
            return Err(SendFailure::Rejected(format!(
                "400 Invalid To header: {}",
                recipient
            )));
        }

        Ok(format!("msg-{}", sent.len()))
    }
}
