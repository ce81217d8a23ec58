//! 通用工具函数

use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// 默认UID根（企业根标识符）
pub const DEFAULT_UID_ROOT: &str = "1.2.826.0.1.3680043.9.7382";

/// DICOM UID最大长度
pub const MAX_UID_LENGTH: usize = 64;

// 进程内计数器，所有生成器共享
static UID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// DICOM UID生成器
///
/// 格式: `<root>.<微秒时间戳>.<进程计数器>.<随机数>`
#[derive(Debug, Clone)]
pub struct UidGenerator {
    root: String,
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_UID_ROOT)
    }
}

impl UidGenerator {
    /// 创建新的UID生成器
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// 生成唯一的DICOM标识符
    pub fn generate(&self) -> String {
        let timestamp = Utc::now().timestamp_micros().max(1);
        let counter = UID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let random: u32 = rand::rng().random_range(1..=999_999);
        format!("{}.{}.{}.{}", self.root, timestamp, counter, random)
    }
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > MAX_UID_LENGTH {
        return false;
    }
    uid.split('.').all(|component| {
        !component.is_empty()
            && component.chars().all(|c| c.is_ascii_digit())
            && (component == "0" || !component.starts_with('0'))
    })
}

/// 把任意文本转成可用作目录名的片段
pub fn sanitize_path_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "UNKNOWN".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_dicom_uid() {
        let generator = UidGenerator::default();
        let uid = generator.generate();
        assert!(is_valid_dicom_uid(&uid), "invalid uid {}", uid);
        assert!(uid.starts_with(DEFAULT_UID_ROOT));
    }

    #[test]
    fn test_generated_uids_are_unique() {
        let generator = UidGenerator::new("1.2.3.");
        let uids: HashSet<String> = (0..1000).map(|_| generator.generate()).collect();
        assert_eq!(uids.len(), 1000);
        assert!(uids.iter().all(|u| u.starts_with("1.2.3.")));
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(is_valid_dicom_uid("1.2.0.3"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        assert!(!is_valid_dicom_uid("1.02.3"));
        assert!(!is_valid_dicom_uid("1..2"));
        assert!(!is_valid_dicom_uid(".1.2"));
        assert!(!is_valid_dicom_uid(&"1.".repeat(40)));
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("PA-VIEW"), "PA-VIEW");
        assert_eq!(sanitize_path_component("XR CHEST/2V"), "XR_CHEST_2V");
        assert_eq!(sanitize_path_component("  "), "UNKNOWN");
    }
}
