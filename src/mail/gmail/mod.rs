/// Gmail 模块 - OAuth2 凭据、Token 续期与 API 调用
pub mod api;
pub mod credentials;
pub mod oauth;
pub mod token;
pub mod types;

// 重新导出常用类型和函数
pub use api::{GmailTransport, check_credentials};
pub use oauth::{authorization_url, authorize};
pub use token::{GoogleTokenEndpoint, TokenManager};
