//! 核心数据模型定义

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// 标识符类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    PatientId, // 患者ID
    Accession, // 检查号
}

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 2] = [IdentifierKind::PatientId, IdentifierKind::Accession];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::PatientId => "patient_id",
            IdentifierKind::Accession => "accession",
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 性别枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "O")]
    Other,
}

impl Sex {
    /// DICOM (0010,0040) 取值
    pub fn dicom_code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Other => "O",
        }
    }

    /// 解析 HL7 PID-8 / DICOM 性别代码
    pub fn from_code(code: &str) -> Option<Sex> {
        match code.trim().to_ascii_uppercase().as_str() {
            "M" => Some(Sex::Male),
            "F" => Some(Sex::Female),
            "O" | "U" | "A" | "N" => Some(Sex::Other),
            _ => None,
        }
    }
}

/// 合成患者信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: String,
    pub name: String, // FAMILY^GIVEN
    pub birth_date: NaiveDate,
    pub sex: Sex,
    pub address: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub study_count: u32,
}

impl Patient {
    /// 在指定日期时的年龄（DICOM AS格式，如 "045Y"）
    pub fn age_on(&self, date: NaiveDate) -> String {
        let mut years = date.year() - self.birth_date.year();
        if (date.month(), date.day()) < (self.birth_date.month(), self.birth_date.day()) {
            years -= 1;
        }
        format!("{:03}Y", years.clamp(0, 999))
    }
}

/// 申请单中请求的序列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedSeries {
    pub procedure_code: String,
    pub description: String,
    pub modality: String,
}

/// 规范化后的检查申请（从申请单消息解析得到）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub message_type: String,
    pub control_id: String,
    pub patient_id: String,
    pub patient_name: String,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
    /// 为空时由分配器生成
    pub accession_number: String,
    pub requested_procedure: String,
    pub series: Vec<RequestedSeries>,
    pub study_date: Option<NaiveDate>,
}

/// 手动生成参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default)]
    pub accession: Option<String>,
    #[serde(default)]
    pub study_description: Option<String>,
    pub series_count: u32,
    pub images_per_series: Vec<u32>,
    #[serde(default)]
    pub study_date: Option<NaiveDate>,
    #[serde(default)]
    pub modality: Option<String>,
}

/// DICOM 标签 (group, element)
///
/// 序列化为 `GGGGEEEE` 十六进制字符串，以便作为JSON对象的键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(pub u16, pub u16);

impl TagId {
    pub fn group(&self) -> u16 {
        self.0
    }

    pub fn element(&self) -> u16 {
        self.1
    }
}

impl Serialize for TagId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04X}{:04X}", self.0, self.1))
    }
}

impl<'de> Deserialize<'de> for TagId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.len() != 8 || !raw.is_ascii() {
            return Err(serde::de::Error::custom(format!("invalid tag: {}", raw)));
        }
        let group = u16::from_str_radix(&raw[0..4], 16).map_err(serde::de::Error::custom)?;
        let element = u16::from_str_radix(&raw[4..8], 16).map_err(serde::de::Error::custom)?;
        Ok(TagId(group, element))
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

/// 影像实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub sop_instance_uid: String,
    pub series_uid: String,
    pub instance_number: u32,
    pub file_path: PathBuf,
    /// 嵌入的全部元数据标签
    pub tags: BTreeMap<TagId, String>,
    #[serde(skip)]
    pub pixel_data: Vec<u8>,
}

/// 序列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub series_uid: String,
    pub study_uid: String,
    pub series_number: u32,
    pub procedure_code: String,
    pub description: String,
    pub modality: String,
    pub directory: PathBuf,
    pub instances: Vec<Instance>,
}

/// 检查
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub study_uid: String,
    pub accession_number: String,
    pub patient_id: String, // 弱引用：只保存患者ID
    pub patient_name: String,
    pub description: String,
    pub study_date: NaiveDate,
    pub study_time: NaiveTime,
    pub study_id: String,
    pub referring_physician: String,
    pub directory: PathBuf,
    pub series: Vec<Series>,
}

impl Study {
    /// 检查内全部UID（检查、序列、实例）
    pub fn all_uids(&self) -> Vec<&str> {
        let mut uids = vec![self.study_uid.as_str()];
        for series in &self.series {
            uids.push(series.series_uid.as_str());
            uids.extend(series.instances.iter().map(|i| i.sop_instance_uid.as_str()));
        }
        uids
    }

    /// 实例总数
    pub fn instance_count(&self) -> usize {
        self.series.iter().map(|s| s.instances.len()).sum()
    }
}

/// 传输目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacsDestination {
    pub host: String,
    pub port: u16,
    pub calling_ae: String,
    pub called_ae: String,
}

/// 传输结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOutcome {
    pub success: bool,
    pub exit_status: Option<i32>,
    pub captured_output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_display() {
        assert_eq!(TagId(0x0010, 0x0010).to_string(), "(0010,0010)");
        assert_eq!(TagId(0x0008, 0x103E).to_string(), "(0008,103E)");
    }

    #[test]
    fn test_tag_json_key() {
        let mut tags = BTreeMap::new();
        tags.insert(TagId(0x0020, 0x000D), "1.2.3".to_string());
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, r#"{"0020000D":"1.2.3"}"#);
        let back: BTreeMap<TagId, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tags);
    }

    #[test]
    fn test_sex_codes() {
        assert_eq!(Sex::from_code("f"), Some(Sex::Female));
        assert_eq!(Sex::from_code("U"), Some(Sex::Other));
        assert_eq!(Sex::from_code("X"), None);
        assert_eq!(Sex::Male.dicom_code(), "M");
    }

    #[test]
    fn test_patient_age() {
        let now = Utc::now();
        let patient = Patient {
            patient_id: "PID100000".to_string(),
            name: "TEST^PATIENT".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1980, 6, 15).unwrap(),
            sex: Sex::Female,
            address: String::new(),
            phone: String::new(),
            created_at: now,
            last_used: now,
            study_count: 0,
        };
        assert_eq!(patient.age_on(NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()), "044Y");
        assert_eq!(patient.age_on(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()), "045Y");
    }
}
