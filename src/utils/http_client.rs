/// 全局共享的 HTTP 客户端
///
/// Gmail 发送与用户信息请求共用同一个连接池
use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// 用户代理
const USER_AGENT: &str = concat!("FormMail/", env!("CARGO_PKG_VERSION"), " (Rust)");

/// 全局 HTTP 客户端实例（使用懒初始化）
pub static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(4) // 只和 Google 的两三个主机通信
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(Duration::from_secs(30)) // 整体请求超时 30 秒
        .connect_timeout(Duration::from_secs(10)) // 连接建立超时 10 秒
        .redirect(reqwest::redirect::Policy::none()) // Gmail API 不会重定向
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("⚠️ 构建 HTTP 客户端失败，使用默认配置: {}", e);
            Client::new()
        })
});

/// 获取全局 HTTP 客户端
pub fn get_client() -> &'static Client {
    &HTTP_CLIENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_shared() {
        assert!(std::ptr::eq(get_client(), get_client()));
        assert!(USER_AGENT.starts_with("FormMail/"));
    }
}
