//! 标识符模式语言
//!
//! 模式由字面字符和定宽占位符组成：`{N digits}`、`{N letters}`、`{N hex}`（中间无空格），
//! 例如 `PID{6digits}`、`STUDY2025{4digits}`、`{4hex}`。
//! 编译结果是一个段列表，由纯函数解释执行。

use fabricator_core::config::PatternConfig;
use fabricator_core::{FabricatorError, Result};
use rand::Rng;
use std::fmt;

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";

/// u64能完整表示的最大十进制位数
const MAX_DIGIT_WIDTH: usize = 19;
const MAX_RANDOM_WIDTH: usize = 64;

/// 模式段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Digits(usize),
    Letters(usize),
    Hex(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(text) => f.write_str(text),
            Segment::Digits(width) => write!(f, "{{{}digits}}", width),
            Segment::Letters(width) => write!(f, "{{{}letters}}", width),
            Segment::Hex(width) => write!(f, "{{{}hex}}", width),
        }
    }
}

/// 编译后的模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    template: String,
    segments: Vec<Segment>,
}

/// 编译模式
pub fn compile(template: &str) -> Result<CompiledPattern> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut body = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    match inner {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => return Err(FabricatorError::pattern(template, "nested '{'")),
                        other => body.push(other),
                    }
                }
                if !closed {
                    return Err(FabricatorError::pattern(template, "unbalanced '{'"));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(parse_placeholder(template, &body)?);
            }
            '}' => return Err(FabricatorError::pattern(template, "unbalanced '}'")),
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(CompiledPattern {
        template: template.to_string(),
        segments,
    })
}

fn parse_placeholder(template: &str, body: &str) -> Result<Segment> {
    let split = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
    let (width, kind) = body.split_at(split);

    if width.is_empty() {
        return Err(FabricatorError::pattern(template, format!("placeholder '{{{}}}' has no width", body)));
    }
    let width: usize = width
        .parse()
        .map_err(|_| FabricatorError::pattern(template, format!("width '{}' is not a number", width)))?;
    if width == 0 {
        return Err(FabricatorError::pattern(template, "placeholder width must be positive"));
    }

    let segment = match kind {
        "digits" => Segment::Digits(width),
        "letters" => Segment::Letters(width),
        "hex" => Segment::Hex(width),
        other => {
            return Err(FabricatorError::pattern(template, format!("unknown placeholder kind '{}'", other)))
        }
    };

    let limit = if matches!(segment, Segment::Digits(_)) { MAX_DIGIT_WIDTH } else { MAX_RANDOM_WIDTH };
    if width > limit {
        return Err(FabricatorError::pattern(template, format!("width {} exceeds {}", width, limit)));
    }
    Ok(segment)
}

impl CompiledPattern {
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// 含数字占位符（按游标递增）
    pub fn is_sequential(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Digits(_)))
    }

    /// 含随机占位符（字母或十六进制）
    pub fn has_random(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Letters(_) | Segment::Hex(_)))
    }

    /// 用计数器值渲染：数字占位符取同一个值，超出宽度时按 10^N 取模
    pub fn render<R: Rng + ?Sized>(&self, counter: u64, rng: &mut R) -> String {
        let mut token = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => token.push_str(text),
                Segment::Digits(width) => {
                    let value = match 10u64.checked_pow(*width as u32) {
                        Some(modulus) => counter % modulus,
                        None => counter,
                    };
                    token.push_str(&format!("{:0width$}", value, width = *width));
                }
                Segment::Letters(width) => push_random(&mut token, LETTERS, *width, rng),
                Segment::Hex(width) => push_random(&mut token, HEX_DIGITS, *width, rng),
            }
        }
        token
    }

    /// 所有占位符（包括数字）都随机生成，例如电话号码
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut token = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => token.push_str(text),
                Segment::Digits(width) => push_random(&mut token, &HEX_DIGITS[..10], *width, rng),
                Segment::Letters(width) => push_random(&mut token, LETTERS, *width, rng),
                Segment::Hex(width) => push_random(&mut token, HEX_DIGITS, *width, rng),
            }
        }
        token
    }

    /// 检查token是否符合模式的宽度和字符类别
    pub fn matches(&self, token: &str) -> bool {
        let mut rest = token;
        for segment in &self.segments {
            let (width, class): (usize, fn(&u8) -> bool) = match segment {
                Segment::Literal(text) => match rest.strip_prefix(text.as_str()) {
                    Some(remaining) => {
                        rest = remaining;
                        continue;
                    }
                    None => return false,
                },
                Segment::Digits(width) => (*width, u8::is_ascii_digit),
                Segment::Letters(width) => (*width, u8::is_ascii_uppercase),
                Segment::Hex(width) => (*width, |b: &u8| b.is_ascii_digit() || (b'A'..=b'F').contains(b)),
            };
            if rest.len() < width || !rest.as_bytes()[..width].iter().all(class) {
                return false;
            }
            rest = &rest[width..];
        }
        rest.is_empty()
    }
}

fn push_random<R: Rng + ?Sized>(token: &mut String, alphabet: &[u8], width: usize, rng: &mut R) {
    for _ in 0..width {
        token.push(alphabet[rng.random_range(0..alphabet.len())] as char);
    }
}

/// 标识符生成器：模式 + 起始值 + 增量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generator {
    pattern: CompiledPattern,
    start_value: u64,
    increment: u64,
}

impl Generator {
    /// 增量为 0 时序列不前进，视为配置错误
    pub fn new(pattern: CompiledPattern, start_value: u64, increment: u64) -> Result<Self> {
        if increment == 0 {
            return Err(FabricatorError::pattern(pattern.template(), "increment must be at least 1"));
        }
        Ok(Self {
            pattern,
            start_value,
            increment,
        })
    }

    pub fn from_config(config: &PatternConfig) -> Result<Self> {
        Self::new(compile(&config.pattern)?, config.start_value, config.increment)
    }

    pub fn pattern(&self) -> &CompiledPattern {
        &self.pattern
    }

    pub fn start_value(&self) -> u64 {
        self.start_value
    }

    /// 生成 (token, 新状态)
    ///
    /// 仅含随机占位符的模式不推进状态。
    pub fn next<R: Rng + ?Sized>(&self, state: u64, rng: &mut R) -> (String, u64) {
        let token = self.pattern.render(state, rng);
        let new_state = if self.pattern.is_sequential() {
            state.wrapping_add(self.increment)
        } else {
            state
        };
        (token, new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_compile_segments() {
        let pattern = compile("PID{6digits}").unwrap();
        assert_eq!(
            pattern.segments(),
            &[Segment::Literal("PID".to_string()), Segment::Digits(6)]
        );
        assert!(pattern.is_sequential());
        assert!(!pattern.has_random());

        let pattern = compile("2025{2letters}{7digits}").unwrap();
        assert_eq!(
            pattern.segments(),
            &[
                Segment::Literal("2025".to_string()),
                Segment::Letters(2),
                Segment::Digits(7)
            ]
        );
        assert_eq!(pattern.segments().iter().map(|s| s.to_string()).collect::<String>(), "2025{2letters}{7digits}");
    }

    #[test]
    fn test_compile_errors() {
        for bad in ["PID{6digit}", "{0digits}", "{digits}", "PID{6digits", "PID}6", "{{6digits}}", "{x6hex}", "{25digits}"] {
            assert!(
                matches!(compile(bad), Err(FabricatorError::Pattern { .. })),
                "expected pattern error for {}",
                bad
            );
        }
    }

    #[test]
    fn test_sequence_generation() {
        let generator = Generator::new(compile("PID{6digits}").unwrap(), 100000, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = generator.start_value();
        let mut tokens = Vec::new();
        for _ in 0..3 {
            let (token, next) = generator.next(state, &mut rng);
            tokens.push(token);
            state = next;
        }
        assert_eq!(tokens, vec!["PID100000", "PID100001", "PID100002"]);
        assert_eq!(state, 100003);
    }

    #[test]
    fn test_digits_wrap_to_width() {
        let pattern = compile("{3digits}").unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pattern.render(7, &mut rng), "007");
        assert_eq!(pattern.render(1234, &mut rng), "234");
    }

    #[test]
    fn test_tokens_match_width_and_class() {
        let mut rng = StdRng::seed_from_u64(99);
        for template in ["PID{6digits}", "{4hex}", "{8letters}", "ACC-{3letters}{5digits}-{2hex}"] {
            let generator = Generator::new(compile(template).unwrap(), 1, 3).unwrap();
            let mut state = 1;
            for _ in 0..200 {
                let (token, next) = generator.next(state, &mut rng);
                assert!(generator.pattern().matches(&token), "{} does not match {}", token, template);
                state = next;
            }
        }
    }

    #[test]
    fn test_zero_increment_is_rejected() {
        let result = Generator::new(compile("PID{6digits}").unwrap(), 1, 0);
        assert!(matches!(result, Err(FabricatorError::Pattern { ref template, .. }) if template == "PID{6digits}"));

        let config = PatternConfig {
            pattern: "ACC{4digits}".to_string(),
            start_value: 1,
            increment: 0,
        };
        assert!(matches!(Generator::from_config(&config), Err(FabricatorError::Pattern { .. })));
    }

    #[test]
    fn test_random_segments_do_not_advance_state() {
        let generator = Generator::new(compile("{4hex}").unwrap(), 5, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let (token, state) = generator.next(5, &mut rng);
        assert_eq!(state, 5);
        assert_eq!(token.len(), 4);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let generator = Generator::new(compile("X{3letters}{4hex}{2digits}").unwrap(), 10, 1).unwrap();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        assert_eq!(generator.next(10, &mut a), generator.next(10, &mut b));
    }

    #[test]
    fn test_sample_fills_digits_randomly() {
        let pattern = compile("04{2digits} {3digits} {3digits}").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let phone = pattern.sample(&mut rng);
        assert!(pattern.matches(&phone));
        assert_eq!(phone.len(), 12);
        assert!(phone.starts_with("04"));
    }

    #[test]
    fn test_matches_rejects_wrong_tokens() {
        let pattern = compile("PID{6digits}").unwrap();
        assert!(pattern.matches("PID000123"));
        assert!(!pattern.matches("PID00012"));
        assert!(!pattern.matches("PID0001234"));
        assert!(!pattern.matches("PIX000123"));
        assert!(!compile("{2letters}").unwrap().matches("ab"));
    }
}
