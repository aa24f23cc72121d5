/// 邮件调度
///
/// 单发：发送到配置的收件地址，任何失败都转换为一条失败的 `SendResult`。
/// 群发：模板只渲染一次，按顺序逐个发送，两次发送之间固定间隔；
/// 单个地址失败不会中断后续发送。
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::mail::error::{DispatchError, TokenError};
use crate::mail::gmail::api::{MailTransport, SendFailure};
use crate::mail::gmail::token::TokenManager;
use crate::mail::message::{self, RenderedEmail};
use crate::mail::submission::{DispatchReport, FormSubmission, SendResult, generate_id};
use crate::mail::template::{TemplateData, TemplateStore};

/// 群发时两次发送之间的默认间隔
pub const DEFAULT_PACING: Duration = Duration::from_millis(1000);

const SINGLE_SUBJECT_PREFIX: &str = "New Form Submission";
const FAN_OUT_SUBJECT_PREFIX: &str = "New Form-To Submission";

const SEND_UNAUTHORIZED: &str = "SEND_UNAUTHORIZED";

const SEND_FAILED_HINT: &str = "请检查 Gmail API 权限与收件地址是否有效";

/// 调度模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// 发送到配置的单个收件地址（TO_EMAIL）
    Single,
    /// 发送到提交中携带的每个收件地址
    FanOut,
}

/// 邮件调度器
pub struct MailDispatcher {
    tokens: Arc<TokenManager>,
    transport: Arc<dyn MailTransport>,
    templates: TemplateStore,
    /// 单发模式的收件地址
    default_destination: Option<String>,
    pacing: Duration,
}

impl MailDispatcher {
    pub fn new(
        tokens: Arc<TokenManager>,
        transport: Arc<dyn MailTransport>,
        templates: TemplateStore,
        default_destination: Option<String>,
    ) -> Self {
        Self {
            tokens,
            transport,
            templates,
            default_destination,
            pacing: DEFAULT_PACING,
        }
    }

    /// 设置群发间隔
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// 按模式调度，总是返回结构化的汇总结果
    pub async fn dispatch(&self, mode: DispatchMode, submission: &FormSubmission) -> DispatchReport {
        match mode {
            DispatchMode::Single => self.send_single(submission).await.into(),
            DispatchMode::FanOut => match self.send_fan_out(submission).await {
                Ok(report) => report,
                Err(e) => {
                    let dispatch_id = generate_id("custom_email");
                    tracing::error!(dispatch_id = %dispatch_id, code = e.code(), "❌ 群发未执行: {}", e);
                    DispatchReport::aborted(dispatch_id, e.to_string(), e.code(), e.hint())
                }
            },
        }
    }

    /// 发送到配置的单个收件地址
    ///
    /// Token 错误、模板/组装错误和服务商拒收都以失败的 `SendResult` 返回
    pub async fn send_single(&self, submission: &FormSubmission) -> SendResult {
        let dispatch_id = generate_id("email");
        let submission_id = submission.audit.submission_id.as_str();

        tracing::info!(
            dispatch_id = %dispatch_id,
            submission_id = %submission_id,
            template = %submission.template_id,
            "📧 开始发送表单邮件"
        );

        let Some(destination) = self.default_destination.as_deref() else {
            tracing::error!(dispatch_id = %dispatch_id, "❌ 未配置收件地址 TO_EMAIL");
            return SendResult::failed(
                None,
                "未配置收件地址（TO_EMAIL）".to_string(),
                "CONFIGURATION_ERROR",
                "请设置 TO_EMAIL 环境变量或配置文件中的 [mail].to_email",
            )
            .with_dispatch_id(&dispatch_id);
        };

        let access_token = match self.tokens.get_valid_access_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(dispatch_id = %dispatch_id, code = e.code(), "❌ 获取 Access Token 失败: {}", e);
                return token_failure(Some(destination), &e).with_dispatch_id(&dispatch_id);
            }
        };

        let rendered = self.render(submission, SINGLE_SUBJECT_PREFIX).await;
        let result = self
            .deliver(&access_token, &rendered, submission, destination)
            .await;

        if result.success {
            tracing::info!(
                dispatch_id = %dispatch_id,
                submission_id = %submission_id,
                message_id = ?result.message_id,
                "✅ 邮件发送成功"
            );
        }

        result.with_dispatch_id(&dispatch_id)
    }

    /// 群发到提交中携带的每个收件地址
    ///
    /// # Errors
    /// - `NoDestinations`：没有任何收件地址（不会发起任何请求）
    /// - `Token`：无法获取有效的 Access Token
    pub async fn send_fan_out(
        &self,
        submission: &FormSubmission,
    ) -> Result<DispatchReport, DispatchError> {
        let dispatch_id = generate_id("custom_email");
        let destinations = &submission.destinations;
        if destinations.is_empty() {
            tracing::error!(dispatch_id = %dispatch_id, "❌ 群发请求未包含任何收件地址");
            return Err(DispatchError::NoDestinations);
        }

        tracing::info!(
            dispatch_id = %dispatch_id,
            submission_id = %submission.audit.submission_id,
            template = %submission.template_id,
            destinations = destinations.len(),
            "🚀 开始群发表单邮件"
        );

        let mut access_token = self.tokens.get_valid_access_token().await?;
        let rendered = self.render(submission, FAN_OUT_SUBJECT_PREFIX).await;

        let mut results = Vec::with_capacity(destinations.len());
        // 一次群发最多因 401 重新获取一次 Token
        let mut token_renewed = false;

        for (i, destination) in destinations.iter().enumerate() {
            tracing::info!(
                dispatch_id = %dispatch_id,
                key = %destination.key,
                "📤 发送 {}/{}",
                i + 1,
                destinations.len()
            );

            let result = self
                .deliver(&access_token, &rendered, submission, &destination.email)
                .await
                .with_key(&destination.key);
            let unauthorized = result.code == Some(SEND_UNAUTHORIZED);
            results.push(result);

            if i + 1 == destinations.len() {
                break;
            }

            if unauthorized && !token_renewed {
                token_renewed = true;
                match self.tokens.get_valid_access_token().await {
                    Ok(token) => {
                        tracing::info!(dispatch_id = %dispatch_id, "🔄 已重新获取 Access Token，继续群发");
                        access_token = token;
                    }
                    Err(e) => {
                        tracing::error!(dispatch_id = %dispatch_id, code = e.code(), "❌ 重新获取 Access Token 失败: {}", e);
                        for rest in &destinations[i + 1..] {
                            results.push(
                                token_failure(Some(&rest.email), &e).with_key(&rest.key),
                            );
                        }
                        break;
                    }
                }
            }

            tracing::debug!(dispatch_id = %dispatch_id, "⏳ 等待 {:?} 后发送下一封", self.pacing);
            tokio::time::sleep(self.pacing).await;
        }

        let report = DispatchReport::completed(dispatch_id, results);
        tracing::info!(
            dispatch_id = %report.dispatch_id,
            total_sent = report.total_sent,
            total_failed = report.total_failed,
            "🎉 群发完成"
        );

        Ok(report)
    }

    /// 渲染模板，生成 HTML 与纯文本正文
    async fn render(&self, submission: &FormSubmission, subject_prefix: &str) -> RenderedEmail {
        let template = self.templates.load(submission.template_id).await;
        tracing::debug!(template = %submission.template_id, origin = ?template.origin, "模板已加载");
        let data = TemplateData::for_submission(submission, Utc::now());

        RenderedEmail::new(
            format!("{}: {}", subject_prefix, submission.subject),
            template.render(&data),
        )
    }

    /// 向一个地址投递，失败时返回失败结果
    async fn deliver(
        &self,
        access_token: &str,
        rendered: &RenderedEmail,
        submission: &FormSubmission,
        recipient: &str,
    ) -> SendResult {
        let raw = match message::compose(rendered, &submission.name, &submission.email, recipient) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(recipient = %recipient, "❌ 组装邮件失败: {:#}", e);
                return SendResult::failed(
                    Some(recipient),
                    format!("{:#}", e),
                    "MESSAGE_BUILD_FAILED",
                    "请检查提交者的姓名与邮箱格式",
                );
            }
        };

        match self.transport.send_raw(access_token, recipient, &raw).await {
            Ok(message_id) => SendResult::sent(recipient, message_id),
            Err(failure) => {
                tracing::error!(recipient = %recipient, "❌ 发送失败: {}", failure);

                let (code, hint) = match &failure {
                    SendFailure::Unauthorized(_) => {
                        self.tokens.invalidate_access_token().await;
                        (SEND_UNAUTHORIZED, "Access Token 被拒绝，下次发送时会自动刷新")
                    }
                    SendFailure::Network(_) => ("SEND_NETWORK_ERROR", "网络暂时不可用，请稍后重试"),
                    SendFailure::Rejected(_) => ("SEND_FAILED", SEND_FAILED_HINT),
                };
                SendResult::failed(Some(recipient), failure.to_string(), code, hint)
            }
        }
    }
}

fn token_failure(destination: Option<&str>, e: &TokenError) -> SendResult {
    SendResult::failed(destination, e.to_string(), e.code(), e.hint())
}
