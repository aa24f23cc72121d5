/// 工具模块
pub mod http_client;

/// 掩码显示密钥，只保留首尾各 5 个字符
///
/// 过短的值整体替换为 `***`
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }

    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 5..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("ya29.a0AfH6SMBxyz12345"), "ya29....12345");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret(""), "***");
    }

    #[test]
    fn test_mask_secret_multibyte() {
        let masked = mask_secret("令牌令牌令牌令牌令牌令牌令牌");
        assert_eq!(masked, "令牌令牌令...牌令牌令牌");
    }
}
