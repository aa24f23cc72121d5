use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;
mod mail;
mod refresh;
mod utils;

#[cfg(test)]
mod testing;

use config::oauth_config::OAuthConfig;
use config::storage::{CredentialStore, FileCredentialStore};
use mail::gmail::{self, GmailTransport, GoogleTokenEndpoint, TokenManager};
use mail::submission::{FormSubmission, SubmissionAudit, generate_id};
use mail::template::{TemplateId, TemplateStore};
use mail::{DispatchMode, MailDispatcher};

/// 表单邮件发送服务（Gmail API + OAuth2）
#[derive(Debug, Parser)]
#[command(name = "formmail", version, about)]
struct Cli {
    /// 配置文件路径（默认 <系统配置目录>/FormMail/config.toml）
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 发送一封表单邮件到 TO_EMAIL
    Send {
        /// 表单数据（JSON）
        file: PathBuf,
    },
    /// 群发表单邮件到 FROM_TO1 - FROM_TO10
    FanOut {
        /// 表单数据（JSON）
        file: PathBuf,
    },
    /// 查看凭据状态（不显示任何密钥）
    Status,
    /// 强制刷新 Access Token 并读取账户信息
    Check,
    /// 发送一封测试邮件到 TO_EMAIL
    TestSend,
    /// 在浏览器中授权 Gmail 账户并保存凭据
    Authorize,
    /// 只打印授权 URL
    AuthUrl,
    /// 后台保持 Access Token 有效，Ctrl+C 退出
    Watch,
}

/// 进程内共享的服务
struct Services {
    config: config::Config,
    oauth: OAuthConfig,
    store: Arc<dyn CredentialStore>,
    tokens: Arc<TokenManager>,
}

impl Services {
    fn build(config: config::Config) -> Result<Self> {
        let oauth = config.oauth(config::env_lookup);
        let credentials_path = config.credentials_path()?;
        tracing::debug!("凭据文件: {}", credentials_path.display());

        let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(credentials_path));
        let tokens = Arc::new(TokenManager::new(
            oauth.clone(),
            store.clone(),
            Arc::new(GoogleTokenEndpoint),
        ));

        Ok(Self {
            config,
            oauth,
            store,
            tokens,
        })
    }

    fn dispatcher(&self) -> MailDispatcher {
        MailDispatcher::new(
            self.tokens.clone(),
            Arc::new(GmailTransport),
            TemplateStore::new(&self.config.mail.templates_dir),
            self.config.mail.to_email.clone(),
        )
        .with_pacing(self.config.pacing())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 读取 .env（不存在时忽略）
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // 2. 加载配置，环境变量覆盖文件
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };
    let mut config = config::load_from(&config_path)?;
    config.apply_env(config::env_lookup);

    // 3. 初始化日志
    init_logger(config.app.log_level.as_deref())?;
    tracing::debug!("配置文件: {}", config_path.display());

    // 4. 执行命令
    let services = Services::build(config)?;
    let success = run(cli.command, &services).await?;

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// 执行子命令，返回是否成功
async fn run(command: Command, services: &Services) -> Result<bool> {
    match command {
        Command::Send { file } => {
            let submission = read_submission(&file, "sub").await?;
            dispatch(services, DispatchMode::Single, &submission).await
        }
        Command::FanOut { file } => {
            let submission = read_submission(&file, "form_to").await?;
            dispatch(services, DispatchMode::FanOut, &submission).await
        }
        Command::Status => {
            let report = gmail::credentials::report(services.store.as_ref(), &services.oauth).await;
            let ready = report.client_configured
                && (report.refresh_token_on_file || report.env_refresh_token_configured);

            print_json(&serde_json::json!({
                "ready": ready,
                "credentials": report,
                "toEmailConfigured": services.config.mail.to_email.is_some(),
                "templatesDir": services.config.mail.templates_dir,
                "templates": TemplateId::ALL,
            }))?;
            Ok(ready)
        }
        Command::Check => {
            let check = gmail::check_credentials(&services.tokens).await;
            print_json(&serde_json::json!({
                "check": check,
                "token": services.tokens.status().await,
            }))?;
            Ok(check.success)
        }
        Command::TestSend => dispatch(services, DispatchMode::Single, &test_submission()).await,
        Command::Authorize => {
            let record = gmail::authorize(&services.oauth, services.store.as_ref()).await?;
            print_json(&serde_json::json!({
                "success": true,
                "emailAddress": record.email_address,
                "location": services.store.location(),
            }))?;
            Ok(true)
        }
        Command::AuthUrl => {
            services
                .oauth
                .validate()
                .context("请先设置 CLIENT_ID / CLIENT_SECRET")?;
            let (url, _state) =
                gmail::authorization_url(&services.oauth, &services.oauth.redirect_uri, None)?;
            print_json(&serde_json::json!({ "url": url.as_str() }))?;
            Ok(true)
        }
        Command::Watch => {
            let refresher = Arc::new(refresh::TokenRefresher::new(
                services.tokens.clone(),
                services.store.clone(),
                services.config.refresh_interval(),
            ));
            let handle = refresher.start().await;

            tokio::signal::ctrl_c().await.context("监听 Ctrl+C 失败")?;
            refresher.stop().await;
            if let Some(handle) = handle {
                handle.abort();
            }
            Ok(true)
        }
    }
}

/// 调度一次提交并输出汇总结果
async fn dispatch(
    services: &Services,
    mode: DispatchMode,
    submission: &FormSubmission,
) -> Result<bool> {
    let report = services.dispatcher().dispatch(mode, submission).await;
    print_json(&report)?;
    Ok(report.success)
}

/// 读取表单数据文件
async fn read_submission(path: &Path, id_prefix: &str) -> Result<FormSubmission> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取表单数据失败: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("表单数据不是有效的 JSON: {}", path.display()))?;

    FormSubmission::from_json(value, id_prefix)
}

/// 连通性测试用的固定提交
fn test_submission() -> FormSubmission {
    FormSubmission {
        name: "Test User".to_string(),
        email: "test@example.com".to_string(),
        subject: "Test Connection".to_string(),
        message: "This is a test message to verify email functionality.".to_string(),
        phone: None,
        company: None,
        template_id: TemplateId::Default,
        destinations: Vec::new(),
        audit: SubmissionAudit {
            submission_id: generate_id("test"),
            ip: Some("127.0.0.1".to_string()),
            user_agent: Some(format!("formmail/{} test-send", env!("CARGO_PKG_VERSION"))),
            ..SubmissionAudit::default()
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 初始化日志系统
///
/// 优先级：`RUST_LOG` > `LOG_LEVEL` / `[app].log_level` > `formmail=debug,info`。
/// 日志写到 stderr，stdout 只输出 JSON 结果
fn init_logger(level: Option<&str>) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fallback = match level {
        Some(level) => format!("formmail={0},{0}", level),
        None => "formmail=debug,info".to_string(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
