/// MIME 邮件组装
use anyhow::{Context, Result};
use mail_builder::MessageBuilder;

/// 渲染完成、可重复投递的邮件内容
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl RenderedEmail {
    /// 由 HTML 正文派生纯文本正文
    pub fn new(subject: String, html: String) -> Self {
        let text = html_to_text(&html);
        Self {
            subject,
            html,
            text,
        }
    }
}

/// 组装 multipart/alternative 邮件
///
/// `From` / `Reply-To` 为提交者本人，收件人直接回复即可联系到对方
pub fn compose(
    email: &RenderedEmail,
    sender_name: &str,
    sender_email: &str,
    recipient: &str,
) -> Result<Vec<u8>> {
    MessageBuilder::new()
        .from((sender_name, sender_email))
        .reply_to((sender_name, sender_email))
        .to(recipient)
        .subject(email.subject.as_str())
        .text_body(email.text.as_str())
        .html_body(email.html.as_str())
        .write_to_vec()
        .context("组装 MIME 邮件失败")
}

/// 把 HTML 转成纯文本
///
/// 去掉 `<style>` / `<script>` 块和所有标签，解码常见实体；
/// `<br>` 和块级元素结束处换行，正文中的换行原样保留
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let tag_source = &rest[start..];

        let Some(end) = tag_source.find('>') else {
            text.push_str(tag_source);
            rest = "";
            break;
        };

        let tag = tag_source[1..end].trim().to_ascii_lowercase();
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default()
            .to_string();
        rest = &tag_source[end + 1..];

        if (name == "style" || name == "script") && !tag.starts_with('/') {
            let closing = format!("</{}", name);
            rest = match rest.to_ascii_lowercase().find(&closing) {
                Some(pos) => {
                    let after = &rest[pos..];
                    after.find('>').map_or("", |gt| &after[gt + 1..])
                }
                None => "",
            };
            continue;
        }

        if name == "br" || (tag.starts_with('/') && is_block(&name)) {
            text.push('\n');
        }
    }
    text.push_str(rest);

    normalize_whitespace(&decode_entities(&text))
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "table" | "title"
    )
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// 行内空白压缩为一个空格，去掉行首尾空白，最多保留一个空行
fn normalize_whitespace(text: &str) -> String {
    let mut lines = Vec::new();
    let mut blank_run = 0;

    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || lines.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailparse::MailHeaderMap;

    #[test]
    fn test_html_to_text_strips_markup() {
        let html = r#"<html><head><style>body { color: red; }</style>
            <script type="text/javascript">alert("x")</script></head>
            <body><h2>Title</h2><p>Tom &amp; Jerry&nbsp;said &lt;hi&gt;</p></body></html>"#;

        let text = html_to_text(html);
        assert_eq!(text, "Title\nTom & Jerry said <hi>");
    }

    #[test]
    fn test_html_to_text_keeps_line_breaks() {
        let html = "<div style=\"white-space: pre-wrap;\">Hello\nWorld</div><p>a<br>b<br/>c</p>";
        assert_eq!(html_to_text(html), "Hello\nWorld\na\nb\nc");
    }

    #[test]
    fn test_html_to_text_unclosed_tag() {
        assert_eq!(html_to_text("5 < 6"), "5 < 6");
    }

    #[test]
    fn test_compose_multipart_message() {
        let email = RenderedEmail::new(
            "New Form Submission: Hi".to_string(),
            "<p>Hello</p>".to_string(),
        );
        let raw = compose(&email, "Ada", "ada@x.com", "owner@example.com").unwrap();

        let parsed = mailparse::parse_mail(&raw).unwrap();
        assert_eq!(
            parsed.headers.get_first_value("Subject").as_deref(),
            Some("New Form Submission: Hi")
        );
        assert!(parsed.headers.get_first_value("From").unwrap().contains("ada@x.com"));
        assert!(
            parsed
                .headers
                .get_first_value("Reply-To")
                .unwrap()
                .contains("ada@x.com")
        );
        assert!(
            parsed
                .headers
                .get_first_value("To")
                .unwrap()
                .contains("owner@example.com")
        );
        assert_eq!(parsed.ctype.mimetype, "multipart/alternative");
        assert_eq!(parsed.subparts.len(), 2);
    }
}
