/// Gmail OAuth2 授权流程
///
/// 实现授权码流程（带 PKCE）：本地回环服务器接收回调，交换 Token 后
/// 把完整的凭据记录写入凭据存储。只在部署时由运维人员手动执行一次，
/// 之后由 `TokenManager` 使用 Refresh Token 自动续期。
use anyhow::{Context, Result};
use chrono::Utc;
use oauth2::{
    AuthorizationCode, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    TokenResponse,
};
use std::time::Duration;
use tiny_http::{Header, Response, Server};
use tokio::sync::oneshot;
use url::Url;

use crate::config::oauth_config::OAuthConfig;
use crate::config::storage::CredentialStore;
use crate::mail::gmail::api::GmailApiClient;
use crate::mail::gmail::token::build_client;
use crate::mail::gmail::types::CredentialRecord;
use crate::utils::mask_secret;

/// OAuth2 回调超时时间（秒）
const CALLBACK_TIMEOUT_SECS: u64 = 120;

/// 本地服务器端口范围
const PORT_RANGE: std::ops::Range<u16> = 8080..8090;

/// 回调结果页面，`{title}` / `{body}` 由 [`callback_page`] 填入
const CALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>FormMail</title>
</head>
<body style="font-family: Arial, sans-serif; text-align: center; padding-top: 80px; color: #333;">
    <h1>{title}</h1>
    <p>{body}</p>
</body>
</html>"#;

fn callback_page(success: bool) -> String {
    let (title, body) = if success {
        ("✓ FormMail 授权成功", "凭据已保存，可以关闭此窗口并返回终端。")
    } else {
        ("✗ FormMail 授权失败", "授权被拒绝或已取消，请在终端查看详情后重新运行 authorize。")
    };
    CALLBACK_PAGE.replace("{title}", title).replace("{body}", body)
}

/// 回调请求的解析结果
#[derive(Debug, PartialEq, Eq)]
enum Callback {
    /// 带授权码的正常回调
    Code { code: String, state: String },
    /// 用户拒绝授权或服务商报错
    Denied(String),
    /// 与授权无关的请求（如 favicon）
    Ignored,
}

/// 执行 Gmail OAuth2 授权
///
/// 流程：
/// 1. 在 8080-8089 中找到可用端口并启动本地服务器
/// 2. 生成授权 URL（PKCE + `access_type=offline` + `prompt=consent`）
/// 3. 打开浏览器，等待回调
/// 4. 验证 CSRF state，交换 Token
/// 5. 获取账户邮箱，保存完整的凭据记录
///
/// # Errors
/// - OAuth2 配置无效（占位符）
/// - 所有端口均被占用
/// - 用户拒绝授权或超时
/// - Token 交换失败，或服务商未返回 Refresh Token
pub async fn authorize(
    config: &OAuthConfig,
    store: &dyn CredentialStore,
) -> Result<CredentialRecord> {
    tracing::info!("🔐 开始 Gmail OAuth2 授权流程");

    config
        .validate()
        .context("请先设置 CLIENT_ID / CLIENT_SECRET 环境变量或配置文件的 [oauth] 段")?;

    let (server, port) = bind_local_server()?;
    let redirect_uri = format!("http://localhost:{}", port);

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let (auth_url, csrf_state) = authorization_url(config, &redirect_uri, Some(pkce_challenge))?;
    tracing::info!("✅ 本地服务器启动成功: {}", redirect_uri);

    let (code_tx, code_rx) = oneshot::channel();
    std::thread::spawn(move || {
        if let Err(e) = serve_callback(server, port, code_tx) {
            tracing::error!("❌ 本地回调服务器出错: {:#}", e);
        }
    });

    if let Err(e) = webbrowser::open(auth_url.as_str()) {
        tracing::warn!("⚠️ 无法打开浏览器（{}），请手动访问：", e);
    }
    println!("\n请在浏览器中完成授权：\n{}\n", auth_url);
    tracing::info!("等待用户授权（{} 秒内有效）...", CALLBACK_TIMEOUT_SECS);

    let callback = tokio::time::timeout(Duration::from_secs(CALLBACK_TIMEOUT_SECS), code_rx)
        .await
        .context("授权超时：用户未在规定时间内完成授权")?
        .context("本地服务器接收回调失败")?;

    let (code, state) = match callback {
        Callback::Code { code, state } => (code, state),
        Callback::Denied(reason) => anyhow::bail!("用户拒绝授权: {}", reason),
        Callback::Ignored => anyhow::bail!("回调缺少 code 参数"),
    };

    if state != *csrf_state.secret() {
        anyhow::bail!(
            "CSRF 验证失败：state 不匹配（期望 {}，实际 {}）",
            mask_secret(csrf_state.secret()),
            mask_secret(&state)
        );
    }
    tracing::info!("✅ 收到授权回调，CSRF 验证通过");

    let record = exchange_code(config, &redirect_uri, code, pkce_verifier).await?;

    persist_authorization(store, &record).await?;
    tracing::info!(
        "🎉 授权完成，账户: {}",
        record.email_address.as_deref().unwrap_or("未知")
    );

    Ok(record)
}

/// 生成授权 URL
///
/// 始终请求离线访问并强制显示同意页，确保服务商返回 Refresh Token。
/// `pkce` 为 `None` 时生成可以手动复制使用的 URL（`auth-url` 命令）。
pub fn authorization_url(
    config: &OAuthConfig,
    redirect_uri: &str,
    pkce: Option<PkceCodeChallenge>,
) -> Result<(Url, CsrfToken)> {
    let client = build_client(config)
        .map_err(|e| anyhow::anyhow!("构建 OAuth2 客户端失败: {}", e))?
        .set_redirect_uri(
            RedirectUrl::new(redirect_uri.to_string()).context("redirect_uri 不是有效的 URL")?,
        );

    let mut request = client
        .authorize_url(CsrfToken::new_random)
        .add_scopes(config.scopes.iter().map(|s| Scope::new(s.clone())))
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent");

    if let Some(challenge) = pkce {
        request = request.set_pkce_challenge(challenge);
    }

    Ok(request.url())
}

/// 在端口范围内绑定第一个可用端口
fn bind_local_server() -> Result<(Server, u16)> {
    for port in PORT_RANGE {
        match Server::http(("127.0.0.1", port)) {
            Ok(server) => return Ok((server, port)),
            Err(e) => tracing::debug!("端口 {} 不可用: {}", port, e),
        }
    }

    anyhow::bail!(
        "无法启动本地服务器：端口 {}-{} 均被占用",
        PORT_RANGE.start,
        PORT_RANGE.end - 1
    )
}

/// 解析回调请求的路径与参数
fn parse_callback(port: u16, path: &str) -> Result<Callback> {
    let url = Url::parse(&format!("http://localhost:{}{}", port, path))
        .context("无法解析回调 URL")?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "error" => return Ok(Callback::Denied(value.into_owned())),
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    Ok(match (code, state) {
        (Some(code), Some(state)) => Callback::Code { code, state },
        (Some(_), None) => Callback::Denied("回调缺少 state 参数".to_string()),
        _ => Callback::Ignored,
    })
}

/// 处理回调请求，直到收到授权结果
fn serve_callback(server: Server, port: u16, code_tx: oneshot::Sender<Callback>) -> Result<()> {
    let html_header = Header::from_bytes(b"Content-Type", b"text/html; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("无效的响应头"))?;

    for request in server.incoming_requests() {
        tracing::debug!("收到请求: {}", request.url());

        let callback = parse_callback(port, request.url())?;
        let page = match &callback {
            Callback::Code { .. } => callback_page(true),
            Callback::Denied(_) => callback_page(false),
            Callback::Ignored => {
                request.respond(Response::empty(404))?;
                continue;
            }
        };

        request.respond(Response::from_string(page).with_header(html_header.clone()))?;
        code_tx.send(callback).ok();
        break;
    }

    Ok(())
}

/// 用新授权的记录整体替换旧凭据
///
/// 旧记录中的账户、scope 等字段属于上一次授权，不能合并进新记录
async fn persist_authorization(
    store: &dyn CredentialStore,
    record: &CredentialRecord,
) -> Result<()> {
    store
        .replace(record)
        .await
        .with_context(|| format!("保存凭据失败: {}", store.location()))?;

    tracing::info!("✅ 凭据已保存到 {}", store.location());
    Ok(())
}

/// 交换授权码，组装完整的凭据记录
async fn exchange_code(
    config: &OAuthConfig,
    redirect_uri: &str,
    code: String,
    verifier: PkceCodeVerifier,
) -> Result<CredentialRecord> {
    let client = build_client(config)
        .map_err(|e| anyhow::anyhow!("构建 OAuth2 客户端失败: {}", e))?
        .set_redirect_uri(RedirectUrl::new(redirect_uri.to_string())?);

    let response = client
        .exchange_code(AuthorizationCode::new(code))
        .set_pkce_verifier(verifier)
        .request_async(oauth2::reqwest::async_http_client)
        .await
        .map_err(|e| anyhow::anyhow!("Token 交换失败: {}", e))?;

    let access_token = response.access_token().secret().to_string();
    let refresh_token = response
        .refresh_token()
        .map(|t| t.secret().to_string())
        .ok_or_else(|| {
            anyhow::anyhow!("未收到 refresh_token：请在 Google 账户中撤销本应用的授权后重试")
        })?;
    let expires_in = response.expires_in().unwrap_or(Duration::from_secs(3600));

    tracing::info!("✅ Token 交换成功");
    tracing::debug!(
        "Access Token: {} (有效期: {} 秒)",
        mask_secret(&access_token),
        expires_in.as_secs()
    );

    let email = match GmailApiClient::new(access_token.clone()).get_user_info().await {
        Ok(info) => Some(info.email),
        Err(e) => {
            tracing::warn!("⚠️ 获取账户邮箱失败（不影响授权）: {:#}", e);
            None
        }
    };

    let now = Utc::now();
    let mut record = CredentialRecord {
        client_id: Some(config.client_id.clone()),
        client_secret: Some(config.client_secret.clone()),
        refresh_token: Some(refresh_token),
        email_address: email,
        created_at: Some(now),
        redirect_uri: Some(redirect_uri.to_string()),
        scopes: config.scopes.clone(),
        ..CredentialRecord::default()
    };
    record.update_access_token(
        access_token,
        chrono::Duration::from_std(expires_in).unwrap_or_else(|_| chrono::Duration::hours(1)),
        now,
    );

    Ok(record)
}
