/// 凭据文件存储模块
///
/// 负责将 Gmail 凭据记录持久化到 JSON 文件，进程重启后以此为准
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::mail::gmail::types::CredentialRecord;

/// 凭据文件名
const CREDENTIALS_FILE: &str = "credentials.json";

/// 凭据存储
///
/// `load` 永远不会失败：文件不存在、损坏或读取出错都视为"没有记录"，
/// 由调用方回退到环境变量。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// 读取已保存的凭据
    async fn load(&self) -> Option<CredentialRecord>;

    /// 保存凭据（与已有内容合并，不会丢掉记录中未携带的字段）
    async fn save(&self, record: &CredentialRecord) -> Result<()>;

    /// 用新记录整体替换已保存的凭据（重新授权时使用，不保留旧记录的任何字段）
    async fn replace(&self, record: &CredentialRecord) -> Result<()>;

    /// 存储位置描述（用于状态展示）
    fn location(&self) -> String;
}

/// 获取默认凭据文件路径
///
/// 返回：`<配置目录>/FormMail/credentials.json`
pub fn credentials_path() -> Result<PathBuf> {
    Ok(super::config_dir()?.join(CREDENTIALS_FILE))
}

/// 基于单个 JSON 文件的凭据存储
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取文件中的原始 JSON 对象
    ///
    /// 文件不存在时返回 `Ok(None)`
    async fn read_object(&self) -> Result<Option<Map<String, Value>>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("读取凭据文件失败: {}", self.path.display()));
            }
        };

        let object = serde_json::from_str::<Map<String, Value>>(&content)
            .context("解析凭据文件失败（文件可能损坏）")?;

        Ok(Some(object))
    }

    /// 先写临时文件再重命名，避免写到一半的文件被读取
    async fn write_atomically(&self, content: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("创建凭据目录失败: {}", dir.display()))?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("写入临时凭据文件失败: {}", tmp_path.display()))?;

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("替换凭据文件失败: {}", self.path.display()))?;

        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Option<CredentialRecord> {
        let object = match self.read_object().await {
            Ok(Some(object)) => object,
            Ok(None) => {
                tracing::debug!("凭据文件不存在: {}", self.path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!("⚠️ 无法读取凭据文件，视为不存在: {:#}", e);
                return None;
            }
        };

        match serde_json::from_value::<CredentialRecord>(Value::Object(object)) {
            Ok(record) => {
                tracing::debug!("成功加载凭据文件: {}", self.path.display());
                Some(record)
            }
            Err(e) => {
                tracing::warn!("⚠️ 凭据文件字段格式错误，视为不存在: {}", e);
                None
            }
        }
    }

    async fn save(&self, record: &CredentialRecord) -> Result<()> {
        // 已有内容作为底稿；读取失败时从空对象开始
        let mut merged = match self.read_object().await {
            Ok(existing) => existing.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("⚠️ 现有凭据文件不可读，将被覆盖: {:#}", e);
                Map::new()
            }
        };

        let incoming = match serde_json::to_value(record).context("序列化凭据失败")? {
            Value::Object(map) => map,
            _ => anyhow::bail!("凭据记录未序列化为 JSON 对象"),
        };

        // 空字段在序列化时已被跳过，因此不会覆盖文件中已有的值
        merged.extend(incoming);

        let content =
            serde_json::to_string_pretty(&Value::Object(merged)).context("序列化凭据失败")?;
        self.write_atomically(&content).await?;

        tracing::debug!("凭据已保存到: {}", self.path.display());

        Ok(())
    }

    async fn replace(&self, record: &CredentialRecord) -> Result<()> {
        let content = serde_json::to_string_pretty(record).context("序列化凭据失败")?;
        self.write_atomically(&content).await?;

        tracing::debug!("凭据已替换: {}", self.path.display());

        Ok(())
    }

    fn location(&self) -> String {
        self.path().display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn full_record() -> CredentialRecord {
        CredentialRecord {
            client_id: Some("id.apps.googleusercontent.com".to_string()),
            client_secret: Some("secret".to_string()),
            refresh_token: Some("1//refresh".to_string()),
            access_token: Some("ya29.access".to_string()),
            expiry_date: Some(Utc::now() + Duration::hours(1)),
            email_address: Some("owner@example.com".to_string()),
            created_at: Some(Utc::now()),
            refreshed_at: None,
            redirect_uri: Some("http://localhost:8080".to_string()),
            scopes: vec!["https://www.googleapis.com/auth/gmail.send".to_string()],
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> FileCredentialStore {
        FileCredentialStore::new(dir.path().join("credentials.json"))
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let record = full_record();

        store.save(&record).await.unwrap();
        let loaded = store.load().await.expect("应能读回凭据");

        assert_eq!(loaded.refresh_token, record.refresh_token);
        assert_eq!(loaded.client_id, record.client_id);
        assert_eq!(loaded.client_secret, record.client_secret);
        assert_eq!(loaded.email_address, record.email_address);
        assert_eq!(loaded.scopes, record.scopes);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().await.is_none());

        std::fs::write(store.path(), r#"{"refresh_token": 42}"#).unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_partial_save_keeps_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&full_record()).await.unwrap();

        // 刷新后只写回 access_token / expiry_date
        let now = Utc::now();
        let update = CredentialRecord {
            access_token: Some("ya29.fresh".to_string()),
            expiry_date: Some(now + Duration::hours(1)),
            refreshed_at: Some(now),
            ..CredentialRecord::default()
        };
        store.save(&update).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("ya29.fresh"));
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(loaded.client_secret.as_deref(), Some("secret"));
        assert!(loaded.refreshed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_fields_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            r#"{"refresh_token": "1//refresh", "note": "written by operator"}"#,
        )
        .unwrap();

        let update = CredentialRecord {
            access_token: Some("ya29.fresh".to_string()),
            ..CredentialRecord::default()
        };
        store.save(&update).await.unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap())
            .unwrap();
        assert_eq!(raw["note"], "written by operator");
        assert_eq!(raw["refresh_token"], "1//refresh");
        assert_eq!(raw["access_token"], "ya29.fresh");
    }

    #[tokio::test]
    async fn test_save_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested/state/credentials.json"));

        store.save(&full_record()).await.unwrap();

        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_replaced_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "garbage").unwrap();

        store.save(&full_record()).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert!(loaded.has_refresh_token());
    }

    #[tokio::test]
    async fn test_replace_drops_previous_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            r#"{"refresh_token":"1//old","email_address":"old-account@example.com","note":"x"}"#,
        )
        .unwrap();

        let reauthorized = CredentialRecord {
            refresh_token: Some("1//new".to_string()),
            ..CredentialRecord::default()
        };
        store.replace(&reauthorized).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//new"));
        assert!(loaded.email_address.is_none());

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(!content.contains("old-account"));
        assert!(!content.contains("note"));
    }
}
