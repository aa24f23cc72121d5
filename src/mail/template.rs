/// 邮件模板
///
/// 模板按 ID 从模板目录加载：`<id>.html` → `default.html` → 内置模板。
/// 模板资源缺失只会让邮件变得朴素，不会导致发送失败。
///
/// 模板使用 Handlebars 语法（`{{field}}` 转义输出，`{{{field}}}` 原样输出，
/// `{{#if}}` / `{{#unless}}` / `{{#each}}` 等内置 helper）。
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::mail::submission::FormSubmission;

/// 内置的最小模板
pub const BUILTIN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{{subject}}</title>
</head>
<body style="font-family: Arial, sans-serif; color: #333;">
    <h2>New Form Submission</h2>
    <table cellpadding="6">
        <tr><td><strong>Name:</strong></td><td>{{name}}</td></tr>
        <tr><td><strong>Email:</strong></td><td>{{email}}</td></tr>
        {{#if phone}}<tr><td><strong>Phone:</strong></td><td>{{phone}}</td></tr>{{/if}}
        {{#if company}}<tr><td><strong>Company:</strong></td><td>{{company}}</td></tr>{{/if}}
        <tr><td><strong>Subject:</strong></td><td>{{subject}}</td></tr>
    </table>
    <h3>Message</h3>
    <div style="white-space: pre-wrap;">{{message}}</div>
    <hr>
    <p style="font-size: 12px; color: #888;">
        Submitted {{submissionDate}} {{submissionTime}} · ID {{submissionId}}
        {{#if ipAddress}}· IP {{ipAddress}}{{/if}}
    </p>
</body>
</html>
"#;

/// 模板 ID（由外部校验层限定为以下取值）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateId {
    #[default]
    Default,
    Contact,
    Inquiry,
    Support,
    Newsletter,
    Quote,
    Booking,
    Feedback,
    Partnership,
    Job,
    Event,
    DarkPro,
    DarkElite,
    Premium,
    Executive,
}

impl TemplateId {
    pub const ALL: [TemplateId; 15] = [
        Self::Default,
        Self::Contact,
        Self::Inquiry,
        Self::Support,
        Self::Newsletter,
        Self::Quote,
        Self::Booking,
        Self::Feedback,
        Self::Partnership,
        Self::Job,
        Self::Event,
        Self::DarkPro,
        Self::DarkElite,
        Self::Premium,
        Self::Executive,
    ];

    /// 模板文件名（不含扩展名）
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Contact => "contact",
            Self::Inquiry => "inquiry",
            Self::Support => "support",
            Self::Newsletter => "newsletter",
            Self::Quote => "quote",
            Self::Booking => "booking",
            Self::Feedback => "feedback",
            Self::Partnership => "partnership",
            Self::Job => "job",
            Self::Event => "event",
            Self::DarkPro => "dark-pro",
            Self::DarkElite => "dark-elite",
            Self::Premium => "premium",
            Self::Executive => "executive",
        }
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模板来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOrigin {
    File(PathBuf),
    Builtin,
}

/// 已加载的模板
#[derive(Debug, Clone)]
pub struct Template {
    pub source: String,
    pub origin: TemplateOrigin,
}

impl Template {
    pub fn builtin() -> Self {
        Self {
            source: BUILTIN_TEMPLATE.to_string(),
            origin: TemplateOrigin::Builtin,
        }
    }

    fn name(&self) -> String {
        match &self.origin {
            TemplateOrigin::File(path) => path.display().to_string(),
            TemplateOrigin::Builtin => "builtin".to_string(),
        }
    }

    /// 用 Handlebars 渲染
    ///
    /// # Errors
    /// 模板语法错误或渲染失败
    pub fn try_render(&self, data: &TemplateData) -> Result<String> {
        let name = self.name();
        let mut registry = Handlebars::new();
        registry
            .register_template_string(&name, &self.source)
            .with_context(|| format!("模板语法错误: {}", name))?;

        registry
            .render(&name, data)
            .with_context(|| format!("模板渲染失败: {}", name))
    }

    /// 渲染模板，永不失败
    ///
    /// 文件模板无法渲染时改用内置模板；内置模板也失败时只输出转义后的留言
    pub fn render(&self, data: &TemplateData) -> String {
        match self.try_render(data) {
            Ok(html) => return html,
            Err(e) => tracing::warn!("⚠️ {:#}，改用内置模板", e),
        }

        if self.origin != TemplateOrigin::Builtin {
            match Self::builtin().try_render(data) {
                Ok(html) => return html,
                Err(e) => tracing::error!("❌ 内置模板渲染失败: {:#}", e),
            }
        }

        format!(
            "<div style=\"white-space: pre-wrap;\">{}</div>",
            handlebars::html_escape(data.get("message").unwrap_or_default())
        )
    }
}

/// 模板目录
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 加载模板，永不失败
    pub async fn load(&self, id: TemplateId) -> Template {
        let candidates = [
            self.dir.join(format!("{}.html", id.as_str())),
            self.dir.join("default.html"),
        ];

        for (i, path) in candidates.iter().enumerate() {
            match tokio::fs::read_to_string(path).await {
                Ok(source) => {
                    if i > 0 {
                        tracing::warn!("⚠️ 模板 {} 不存在，使用 default.html", id);
                    }
                    tracing::debug!("加载模板: {}", path.display());
                    return Template {
                        source,
                        origin: TemplateOrigin::File(path.clone()),
                    };
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("⚠️ 读取模板 {} 失败: {}", path.display(), e),
            }
        }

        tracing::warn!(
            "⚠️ 模板目录 {} 中没有可用模板，使用内置模板",
            self.dir().display()
        );
        Template::builtin()
    }
}

/// 模板数据：字段名 → 值
///
/// 可选字段为空时不写入，模板中的 `{{#if}}` 因此会跳过对应内容
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct TemplateData {
    fields: BTreeMap<String, String>,
}

impl TemplateData {
    /// 提交字段 + 派生字段（日期、时间、审计信息）
    pub fn for_submission(submission: &FormSubmission, now: DateTime<Utc>) -> Self {
        let audit = &submission.audit;
        let mut data = Self::default();

        data.insert("name", &submission.name);
        data.insert("email", &submission.email);
        data.insert("subject", &submission.subject);
        data.insert("message", &submission.message);
        if let Some(phone) = submission.phone() {
            data.insert("phone", phone);
        }
        if let Some(company) = submission.company() {
            data.insert("company", company);
        }
        data.insert("template_id", submission.template_id.as_str());

        data.insert("currentDate", &now.format("%Y-%m-%d").to_string());
        data.insert("currentTime", &now.format("%H:%M:%S UTC").to_string());
        data.insert("currentYear", &now.format("%Y").to_string());

        data.insert("submissionId", &audit.submission_id);
        data.insert("timestamp", &audit.timestamp.to_rfc3339());
        data.insert("submissionDate", &audit.timestamp.format("%Y-%m-%d").to_string());
        data.insert(
            "submissionTime",
            &audit.timestamp.format("%H:%M:%S UTC").to_string(),
        );
        if let Some(ip) = audit.ip.as_deref() {
            data.insert("ip", ip);
            data.insert("ipAddress", ip);
        }
        if let Some(user_agent) = audit.user_agent.as_deref() {
            data.insert("userAgent", user_agent);
            data.insert("browserInfo", user_agent);
        }

        data
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.fields.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::submission::SubmissionAudit;
    use chrono::TimeZone;

    fn submission() -> FormSubmission {
        FormSubmission {
            name: "Ada".to_string(),
            email: "ada@x.com".to_string(),
            subject: "Hi".to_string(),
            message: "Hello\nWorld".to_string(),
            phone: Some("".to_string()),
            company: Some("Analytical Engines".to_string()),
            template_id: TemplateId::Default,
            destinations: Vec::new(),
            audit: SubmissionAudit {
                submission_id: "sub_1_abc".to_string(),
                timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
                ip: Some("203.0.113.7".to_string()),
                user_agent: None,
            },
        }
    }

    fn data() -> TemplateData {
        TemplateData::for_submission(
            &submission(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_template_ids_round_trip_names() {
        for id in TemplateId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
        let id: TemplateId = serde_json::from_str("\"dark-elite\"").unwrap();
        assert_eq!(id, TemplateId::DarkElite);
    }

    #[test]
    fn test_derived_fields() {
        let data = data();
        assert_eq!(data.get("submissionDate"), Some("2024-03-01"));
        assert_eq!(data.get("submissionTime"), Some("09:30:00 UTC"));
        assert_eq!(data.get("currentYear"), Some("2024"));
        assert_eq!(data.get("ipAddress"), Some("203.0.113.7"));
        assert_eq!(data.get("submissionId"), Some("sub_1_abc"));
        assert!(data.get("phone").is_none());
        assert!(data.get("browserInfo").is_none());
    }

    fn inline(source: &str) -> Template {
        Template {
            source: source.to_string(),
            origin: TemplateOrigin::File(PathBuf::from("inline.html")),
        }
    }

    #[test]
    fn test_render_escapes_values() {
        let mut data = TemplateData::default();
        data.insert("name", "<script>alert('x')</script> & co");

        assert_eq!(
            inline("Hi {{ name }}!").render(&data),
            "Hi &lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt; &amp; co!"
        );
        assert_eq!(
            inline("{{{name}}}").render(&data),
            "<script>alert('x')</script> & co"
        );
        assert_eq!(inline("[{{missing}}]").render(&data), "[]");
    }

    #[test]
    fn test_render_conditionals() {
        let mut data = TemplateData::default();
        data.insert("company", "Acme");

        let source = "{{#if company}}C={{company}}{{#if phone}}P={{phone}}{{/if}}{{/if}}|\
                      {{#if phone}}has phone{{else}}no phone{{/if}}";
        assert_eq!(inline(source).render(&data), "C=Acme|no phone");
    }

    #[test]
    fn test_render_unless_helper() {
        let source = "[{{#unless phone}}no phone given{{/unless}}]";

        let mut data = TemplateData::default();
        data.insert("phone", "555-0100");
        assert_eq!(inline(source).render(&data), "[]");

        let data = TemplateData::default();
        assert_eq!(inline(source).render(&data), "[no phone given]");
    }

    #[test]
    fn test_broken_template_falls_back_to_builtin() {
        let template = inline("<p>{{#if name}}unclosed</p>");
        assert!(template.try_render(&data()).is_err());

        let html = template.render(&data());
        assert!(html.contains("New Form Submission"));
        assert!(html.contains("Ada"));
    }

    #[test]
    fn test_builtin_omits_empty_optional_fields() {
        let html = Template::builtin().render(&data());

        assert!(!html.contains("Phone:"));
        assert!(html.contains("Company:"));
        assert!(html.contains("Analytical Engines"));
        assert!(html.contains("Hello\nWorld"));
        assert!(html.contains("white-space: pre-wrap"));
        assert!(!html.contains("{{"));
    }

    #[tokio::test]
    async fn test_store_falls_back_to_default_then_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());

        let template = store.load(TemplateId::Quote).await;
        assert_eq!(template.origin, TemplateOrigin::Builtin);

        let default_path = dir.path().join("default.html");
        std::fs::write(&default_path, "<p>{{name}}</p>").unwrap();
        let template = store.load(TemplateId::Quote).await;
        assert_eq!(template.origin, TemplateOrigin::File(default_path));

        let quote_path = dir.path().join("quote.html");
        std::fs::write(&quote_path, "<p>quote for {{name}}</p>").unwrap();
        let template = store.load(TemplateId::Quote).await;
        assert_eq!(template.origin, TemplateOrigin::File(quote_path));
        assert_eq!(template.render(&data()), "<p>quote for Ada</p>");
    }
}
