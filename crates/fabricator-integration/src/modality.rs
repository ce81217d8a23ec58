//! 根据检查项目名称推断DICOM设备类型

use regex::Regex;
use std::sync::LazyLock;

/// 默认设备类型
pub const DEFAULT_MODALITY: &str = "DX";

// 按优先级排列；关键词按单词边界匹配。PT 在 CT 之前，PET/CT 归为 PT
const KEYWORDS: &[(&str, &[&str])] = &[
    ("PT", &["pet", "pet/ct", "pet-ct", "positron emission", "fdg"]),
    ("CT", &["ct", "cta", "computed tomography", "cat scan", "helical", "spiral"]),
    (
        "MR",
        &["mr", "mri", "mra", "magnetic resonance", "flair", "dwi", "diffusion", "spin echo", "gradient echo"],
    ),
    (
        "US",
        &["us", "ultrasound", "sonography", "sono", "doppler", "echocardiogram", "obstetric", "fetal"],
    ),
    (
        "XA",
        &["angio", "angiography", "angiogram", "catheter", "cath", "interventional", "coronary", "carotid"],
    ),
    (
        "RF",
        &["fluoroscopy", "fluoro", "barium", "upper gi", "lower gi", "small bowel", "esophagram", "swallow study"],
    ),
    (
        "NM",
        &["nuclear", "scintigraphy", "bone scan", "thyroid scan", "spect", "technetium", "gallium", "thallium"],
    ),
    ("MG", &["mammo", "mammography", "mammogram", "breast", "tomosynthesis"]),
    ("CR", &["computed radiography", "portable", "bedside", "mobile"]),
    (
        "DX",
        &[
            "x-ray", "xray", "radiography", "plain film", "chest", "cxr", "kub", "abdomen", "pelvis", "spine",
            "skull", "rib", "pa", "ap", "lateral", "hand", "foot", "ankle", "knee", "shoulder", "elbow",
        ],
    ),
];

static MATCHERS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    KEYWORDS
        .iter()
        .filter_map(|(modality, words)| {
            let alternatives: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
            let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
            Regex::new(&pattern).ok().map(|regex| (*modality, regex))
        })
        .collect()
});

/// 推断设备类型；没有关键词命中时返回 DX
pub fn infer_modality(procedure_text: &str) -> &'static str {
    MATCHERS
        .iter()
        .find(|(_, regex)| regex.is_match(procedure_text))
        .map(|(modality, _)| *modality)
        .unwrap_or(DEFAULT_MODALITY)
}

/// 规范化显式给出的设备类型代码（如 OBR-24）
pub fn normalize_modality(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_uppercase();
    let valid = (2..=4).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_modality() {
        assert_eq!(infer_modality("CT HEAD WITHOUT CONTRAST"), "CT");
        assert_eq!(infer_modality("MRI Knee Left"), "MR");
        assert_eq!(infer_modality("Abdominal Ultrasound"), "US");
        assert_eq!(infer_modality("Screening Mammogram"), "MG");
        assert_eq!(infer_modality("FDG PET"), "PT");
        assert_eq!(infer_modality("Chest PA"), "DX");
        assert_eq!(infer_modality("Portable chest"), "CR");
    }

    #[test]
    fn test_hybrid_pet_ct_is_pet() {
        assert_eq!(infer_modality("PET/CT whole body"), "PT");
        assert_eq!(infer_modality("PET-CT skull base to thigh"), "PT");
        assert_eq!(infer_modality("CT chest with contrast"), "CT");
    }

    #[test]
    fn test_word_boundaries() {
        // "ct" inside "Lateral"/"Contact" must not trigger CT, "us" inside "humerus" not US
        assert_eq!(infer_modality("Chest Lateral"), "DX");
        assert_eq!(infer_modality("Contact sheet"), "DX");
        assert_eq!(infer_modality("Humerus"), "DX");
        assert_eq!(infer_modality(""), DEFAULT_MODALITY);
    }

    #[test]
    fn test_normalize_modality() {
        assert_eq!(normalize_modality(" ct "), Some("CT".to_string()));
        assert_eq!(normalize_modality("X"), None);
        assert_eq!(normalize_modality("C T"), None);
    }
}
