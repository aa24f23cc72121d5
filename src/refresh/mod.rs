/// 后台 Token 续期
///
/// 定期调用 `TokenManager::get_valid_access_token`，让刷新发生在发信路径之外。
/// 遇到需要人工处理的错误后暂停刷新，直到凭据文件发生变化（重新授权）。
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::storage::CredentialStore;
use crate::mail::error::TokenError;
use crate::mail::gmail::token::TokenManager;
use crate::mail::gmail::types::CredentialRecord;

/// 凭据文件的身份标识：Refresh Token + 授权时间
type Fingerprint = (Option<String>, Option<DateTime<Utc>>);

fn fingerprint(record: Option<&CredentialRecord>) -> Fingerprint {
    match record {
        Some(record) => (record.refresh_token.clone(), record.created_at),
        None => (None, None),
    }
}

/// 单次检查的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Access Token 有效（可能刚刚刷新）
    Fresh,
    /// 暂时失败，下个周期重试
    Retrying(TokenError),
    /// 需要人工处理，暂停刷新
    Parked(TokenError),
    /// 已暂停且凭据未变化，本周期跳过
    Skipped,
}

/// 后台续期任务
pub struct TokenRefresher {
    tokens: Arc<TokenManager>,

    /// 用于检测重新授权
    store: Arc<dyn CredentialStore>,

    interval: Duration,

    /// 是否正在运行
    running: Arc<RwLock<bool>>,

    /// 暂停时凭据文件的标识
    parked: Mutex<Option<Fingerprint>>,
}

impl TokenRefresher {
    /// 创建续期任务
    ///
    /// # Arguments
    /// * `tokens` - 共享的 Token 管理器
    /// * `store` - 凭据存储，用于发现重新授权
    /// * `interval` - 检查间隔
    pub fn new(
        tokens: Arc<TokenManager>,
        store: Arc<dyn CredentialStore>,
        interval: Duration,
    ) -> Self {
        Self {
            tokens,
            store,
            interval,
            running: Arc::new(RwLock::new(false)),
            parked: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// 启动后台循环
    ///
    /// 已在运行时返回 `None`
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Token 续期任务已在运行");
                return None;
            }
            *running = true;
        }

        tracing::info!("🚀 启动 Token 续期任务（间隔: {:?}）", self.interval);

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut timer = interval(this.interval);

            loop {
                timer.tick().await;

                if !*this.running.read().await {
                    tracing::info!("续期循环检测到停止标志，退出任务");
                    break;
                }

                this.tick().await;
            }
        }))
    }

    /// 执行一次检查
    pub async fn tick(&self) -> TickOutcome {
        let mut parked = self.parked.lock().await;

        if let Some(previous) = parked.as_ref() {
            let current = fingerprint(self.store.load().await.as_ref());
            if current == *previous {
                tracing::debug!("凭据未变化，继续暂停续期");
                return TickOutcome::Skipped;
            }
            tracing::info!("🔄 检测到凭据文件变化，恢复续期");
            *parked = None;
        }

        match self.tokens.get_valid_access_token().await {
            Ok(_) => {
                tracing::debug!("⏰ Access Token 有效");
                TickOutcome::Fresh
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("⚠️ 后台续期失败，下个周期重试: {}", e);
                TickOutcome::Retrying(e)
            }
            Err(e) => {
                tracing::error!("❌ 后台续期暂停: {}", e);
                tracing::error!("   💡 {}", e.hint());
                *parked = Some(fingerprint(self.store.load().await.as_ref()));
                TickOutcome::Parked(e)
            }
        }
    }

    /// 停止后台循环
    pub async fn stop(&self) {
        if !self.is_running().await {
            tracing::debug!("Token 续期任务未在运行");
            return;
        }
        *self.running.write().await = false;
        tracing::info!("🛑 Token 续期任务已停止");
    }
}
