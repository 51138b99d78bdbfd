/// 转推 key 的最大长度
pub const MAX_KEY_LEN: usize = 50;

/// 由频道显示名生成转推 key
///
/// 规则: ASCII 小写; 任意连续的非字母数字字符折叠为一个 `_`; 去掉首尾 `_`;
/// 截断到 [`MAX_KEY_LEN`] 后再次去掉尾部 `_`。结果对同一输入再次调用保持不变。
pub fn derive_key(display_name: &str) -> String {
    let mut key = String::with_capacity(display_name.len());
    let mut pending_sep = false;

    for c in display_name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !key.is_empty() {
                key.push('_');
            }
            pending_sep = false;
            key.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    // 只含 ASCII, 按字节截断安全
    key.truncate(MAX_KEY_LEN);
    let trimmed = key.trim_end_matches('_').len();
    key.truncate(trimmed);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_display_names() {
        assert_eq!(derive_key("CNN HD"), "cnn_hd");
        assert_eq!(derive_key("  BBC -- One (UK) "), "bbc_one_uk");
        assert_eq!(derive_key("__already_ok__"), "already_ok");
        assert_eq!(derive_key("Télé 5"), "t_l_5");
        assert_eq!(derive_key("!!!"), "");
    }

    #[test]
    fn truncates_without_trailing_separator() {
        let name = format!("{} tail", "a".repeat(49));
        let key = derive_key(&name);
        assert_eq!(key.len(), 49);
        assert!(!key.ends_with('_'));

        assert_eq!(derive_key(&"x".repeat(80)).len(), MAX_KEY_LEN);
    }

    #[test]
    fn derivation_is_idempotent() {
        let long = "word ".repeat(30);
        let samples = [
            "CNN HD",
            "Sky Sports: F1 | 1080p",
            "___",
            "a__b--c",
            "Ünïcödé Channel 24/7",
            "",
            long.as_str(),
        ];
        for name in samples {
            let once = derive_key(name);
            assert_eq!(derive_key(&once), once, "not idempotent for {:?}", name);
        }
    }
}
