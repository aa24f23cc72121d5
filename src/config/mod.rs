/// 配置模块
///
/// `config.toml` 位于 `<系统配置目录>/FormMail/`，环境变量（含 `.env`）覆盖文件中的值
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod oauth_config;
pub mod storage;

use oauth_config::OAuthConfig;

/// 配置文件路径覆盖（环境变量）
const CONFIG_PATH_ENV: &str = "FORMMAIL_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub mail: MailConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    /// 可选的 `[oauth]` 段，环境变量优先
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: String,

    /// 日志级别；`RUST_LOG` 优先
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// 单发模式的固定收件地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_email: Option<String>,

    /// HTML 模板目录
    pub templates_dir: PathBuf,

    /// 凭据文件路径，缺省为配置目录下的 credentials.json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,

    /// 群发时两封邮件之间的间隔（毫秒）
    pub pacing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// 后台刷新检查间隔（秒）
    pub interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: None,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            to_email: None,
            templates_dir: PathBuf::from("templates"),
            credentials_path: None,
            pacing_ms: 1000,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Config {
    /// 用环境变量覆盖文件中的值
    ///
    /// `lookup` 通常是 [`env_lookup`]，测试中可以传入固定映射
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("LOG_LEVEL") {
            self.app.log_level = Some(level);
        }
        if let Some(to) = lookup("TO_EMAIL") {
            self.mail.to_email = Some(to);
        }
        if let Some(dir) = lookup("TEMPLATES_DIR") {
            self.mail.templates_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("CREDENTIALS_PATH") {
            self.mail.credentials_path = Some(PathBuf::from(path));
        }
    }

    /// 凭据文件的实际路径
    pub fn credentials_path(&self) -> Result<PathBuf> {
        match &self.mail.credentials_path {
            Some(path) => Ok(path.clone()),
            None => storage::credentials_path(),
        }
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.mail.pacing_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.interval_secs.max(1))
    }

    /// 解析 OAuth2 客户端配置（环境变量 > `[oauth]` 段 > 占位符）
    pub fn oauth<F>(&self, lookup: F) -> OAuthConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        OAuthConfig::resolve(lookup, self.oauth.clone())
    }
}

/// 读取非空环境变量
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 获取配置目录
///
/// 返回：`<系统配置目录>/FormMail`
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("无法获取配置目录"))?
        .join("FormMail");

    std::fs::create_dir_all(&config_dir).context("创建配置目录失败")?;
    Ok(config_dir)
}

/// 获取配置文件路径
pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = env_lookup(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// 加载配置（文件不存在时写入默认配置）
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let config = Config::default();
        save_to(path, &config)?;
        tracing::info!("已生成默认配置文件: {}", path.display());
        return Ok(config);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
    Ok(config)
}

/// 保存配置
pub fn save_to(path: &Path, config: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
