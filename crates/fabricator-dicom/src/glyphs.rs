//! 8x8点阵字形
//!
//! 图像上能画出的字符集合决定了元数据值的规范形式：画不出的字符在写入文件前
//! 就替换为 `?`，图像与文件中的值保持一致。

use font8x8::{UnicodeFonts, BASIC_FONTS, GREEK_FONTS, LATIN_FONTS};

/// 无字形时的替代字符
pub const REPLACEMENT: char = '?';

/// 查找字符的点阵（ASCII、Latin-1 补充、希腊字母）
pub fn glyph(c: char) -> Option<[u8; 8]> {
    if c.is_control() {
        return None;
    }
    BASIC_FONTS
        .get(c)
        .or_else(|| LATIN_FONTS.get(c))
        .or_else(|| GREEK_FONTS.get(c))
}

pub fn is_drawable(c: char) -> bool {
    c == ' ' || glyph(c).is_some()
}

/// 规范化元数据值：去除首尾空白，控制字符变为空格，无字形字符变为 `?`
pub fn printable(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| match c {
            c if c.is_whitespace() || c.is_control() => ' ',
            c if is_drawable(c) => c,
            _ => REPLACEMENT,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin_names_are_drawable() {
        for c in "MÜLLER^JOSÉ Øresund ß".chars() {
            assert!(is_drawable(c), "{} has no glyph", c);
        }
        assert_eq!(printable("MÜLLER^JOSÉ"), "MÜLLER^JOSÉ");
    }

    #[test]
    fn test_undrawable_characters_are_replaced() {
        assert_eq!(printable("王^小明"), "?^??");
        assert_eq!(printable("  Chest\tPA\r\n"), "Chest PA");
        assert!(glyph('\u{7}').is_none());
        assert!(glyph(REPLACEMENT).is_some());
    }
}
