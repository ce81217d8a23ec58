//! 实例元数据记录
//!
//! 每个实例只构建一份 [`MetadataRecord`]，同时交给DICOM写入器和图像渲染器，
//! 图像上显示的值与文件中存储的值来自同一份数据。
//! 值在入库时规范化（见 [`crate::glyphs::printable`]），文本统一按 UTF-8 (`ISO_IR 192`) 编码。

use crate::glyphs::printable;
use chrono::{NaiveDate, NaiveTime};
use dicom::core::VR;
use fabricator_core::config::DicomConfig;
use fabricator_core::{Patient, TagId};
use std::collections::BTreeMap;

/// Digital X-Ray Image Storage - For Presentation
pub const DX_FOR_PRESENTATION_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.1";

/// Specific Character Set：UTF-8
pub const UTF8_CHARACTER_SET: &str = "ISO_IR 192";

// 检查部位关键词（按优先级），按单词匹配
const BODY_PARTS: &[(&str, &[&str])] = &[
    ("CHEST", &["CHEST", "THORAX", "CXR", "LUNG", "LUNGS", "RIB", "RIBS"]),
    ("HEAD", &["HEAD", "SKULL", "BRAIN"]),
    ("ABDOMEN", &["ABDOMEN", "ABDOMINAL", "KUB"]),
    ("PELVIS", &["PELVIS", "PELVIC", "HIP"]),
    ("SPINE", &["SPINE", "LUMBAR", "CERVICAL"]),
    ("SHOULDER", &["SHOULDER"]),
    ("ELBOW", &["ELBOW"]),
    ("HAND", &["HAND", "WRIST", "FINGER"]),
    ("KNEE", &["KNEE"]),
    ("FOOT", &["FOOT", "ANKLE", "TOE"]),
    ("BREAST", &["BREAST", "MAMMO", "MAMMOGRAM"]),
];

const VIEW_POSITIONS: &[(&str, &[&str])] = &[
    ("PA", &["PA"]),
    ("AP", &["AP"]),
    ("LL", &["LL", "LAT", "LATERAL"]),
    ("RL", &["RL"]),
];

/// 检查级属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyHeader {
    pub study_uid: String,
    pub accession_number: String,
    /// 已附加标记说明的检查描述
    pub description: String,
    pub study_date: NaiveDate,
    pub study_time: NaiveTime,
    pub study_id: String,
}

/// 序列级属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesHeader {
    pub series_uid: String,
    pub series_number: u32,
    pub procedure_code: String,
    pub description: String,
    pub modality: String,
}

/// 单个标签条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub tag: TagId,
    pub vr: VR,
    pub name: &'static str,
    pub value: String,
    /// 是否在图像上显示
    pub displayed: bool,
}

impl TagEntry {
    /// 图像上的文本行：`(GGGG,EEEE) Name: value`
    pub fn display_line(&self) -> String {
        format!("{} {}: {}", self.tag, self.name, self.value)
    }
}

/// 实例元数据记录（有序）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    entries: Vec<TagEntry>,
}

impl MetadataRecord {
    /// 构建一个实例的完整元数据
    pub fn build(
        config: &DicomConfig,
        patient: &Patient,
        study: &StudyHeader,
        series: &SeriesHeader,
        sop_instance_uid: &str,
        instance_number: u32,
    ) -> Self {
        let study_date = study.study_date.format("%Y%m%d").to_string();
        let study_time = study.study_time.format("%H%M%S").to_string();

        let anatomy = format!("{} {}", series.description, series.procedure_code);

        let mut record = Self::default();
        record.hide(0x0008, 0x0005, VR::CS, "Specific Character Set", UTF8_CHARACTER_SET);

        // 显示在图像上的字段
        record.show(0x0010, 0x0010, VR::PN, "Patient Name", &patient.name);
        record.show(0x0010, 0x0020, VR::LO, "Patient ID", &patient.patient_id);
        record.show(0x0008, 0x0050, VR::SH, "Accession Number", &study.accession_number);
        record.show(0x0020, 0x000D, VR::UI, "Study Instance UID", &study.study_uid);
        record.show(0x0020, 0x000E, VR::UI, "Series Instance UID", &series.series_uid);
        record.show(0x0008, 0x0018, VR::UI, "SOP Instance UID", sop_instance_uid);
        record.show(0x0008, 0x0020, VR::DA, "Study Date", &study_date);
        record.show(0x0008, 0x0030, VR::TM, "Study Time", &study_time);
        record.show(0x0008, 0x0060, VR::CS, "Modality", &series.modality);
        record.show(0x0008, 0x1030, VR::LO, "Study Description", &study.description);
        record.show(0x0008, 0x103E, VR::LO, "Series Description", &series.description);

        // 仅写入文件
        record.hide(0x0008, 0x0008, VR::CS, "Image Type", "DERIVED\\PRIMARY");
        record.hide(0x0008, 0x0016, VR::UI, "SOP Class UID", DX_FOR_PRESENTATION_SOP_CLASS);
        record.hide(0x0008, 0x0023, VR::DA, "Content Date", &study_date);
        record.hide(0x0008, 0x0033, VR::TM, "Content Time", &study_time);
        record.hide(0x0008, 0x0068, VR::CS, "Presentation Intent Type", "FOR PRESENTATION");
        record.hide(0x0008, 0x0070, VR::LO, "Manufacturer", &config.manufacturer);
        record.hide(0x0008, 0x0080, VR::LO, "Institution Name", &config.institution_name);
        record.hide(0x0008, 0x0090, VR::PN, "Referring Physician Name", &config.referring_physician);
        record.hide(0x0008, 0x1010, VR::SH, "Station Name", &config.station_name);
        record.hide(0x0008, 0x1090, VR::LO, "Manufacturer Model Name", &config.manufacturer_model_name);
        record.hide(0x0010, 0x0030, VR::DA, "Patient Birth Date", &patient.birth_date.format("%Y%m%d").to_string());
        record.hide(0x0010, 0x0040, VR::CS, "Patient Sex", patient.sex.dicom_code());
        record.hide(0x0010, 0x1010, VR::AS, "Patient Age", &patient.age_on(study.study_date));
        record.hide(0x0010, 0x1040, VR::LO, "Patient Address", &patient.address);
        record.hide(0x0010, 0x2154, VR::SH, "Patient Telephone Numbers", &patient.phone);
        if let Some(body_part) = body_part_for(&anatomy) {
            record.hide(0x0018, 0x0015, VR::CS, "Body Part Examined", body_part);
        }
        record.hide(0x0018, 0x1030, VR::LO, "Protocol Name", &series.procedure_code);
        if let Some(view) = view_position_for(&anatomy) {
            record.hide(0x0018, 0x5101, VR::CS, "View Position", view);
        }
        record.hide(0x0020, 0x0010, VR::SH, "Study ID", &study.study_id);
        record.hide(0x0020, 0x0011, VR::IS, "Series Number", &series.series_number.to_string());
        record.hide(0x0020, 0x0013, VR::IS, "Instance Number", &instance_number.to_string());
        record.hide(0x0028, 0x0004, VR::CS, "Photometric Interpretation", "MONOCHROME2");
        record.hide(0x0028, 0x0301, VR::CS, "Burned In Annotation", "YES");

        record
    }

    fn show(&mut self, group: u16, element: u16, vr: VR, name: &'static str, value: &str) {
        self.push(group, element, vr, name, value, true);
    }

    fn hide(&mut self, group: u16, element: u16, vr: VR, name: &'static str, value: &str) {
        self.push(group, element, vr, name, value, false);
    }

    fn push(&mut self, group: u16, element: u16, vr: VR, name: &'static str, value: &str, displayed: bool) {
        self.entries.push(TagEntry {
            tag: TagId(group, element),
            vr,
            name,
            value: printable(value),
            displayed,
        });
    }

    pub fn entries(&self) -> &[TagEntry] {
        &self.entries
    }

    /// 图像上显示的条目（保持顺序）
    pub fn displayed(&self) -> impl Iterator<Item = &TagEntry> {
        self.entries.iter().filter(|e| e.displayed)
    }

    pub fn get(&self, tag: TagId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| e.value.as_str())
    }

    /// 全部标签值，用于 [`fabricator_core::Instance::tags`]
    pub fn tag_map(&self) -> BTreeMap<TagId, String> {
        self.entries
            .iter()
            .map(|e| (e.tag, e.value.clone()))
            .collect()
    }
}

/// 由序列描述和检查代码推断检查部位；没有关键词时不写该标签
pub fn body_part_for(text: &str) -> Option<&'static str> {
    keyword_match(BODY_PARTS, text)
}

/// 由序列描述和检查代码推断投照体位
pub fn view_position_for(text: &str) -> Option<&'static str> {
    keyword_match(VIEW_POSITIONS, text)
}

fn keyword_match(table: &[(&'static str, &[&str])], text: &str) -> Option<&'static str> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_uppercase)
        .collect();
    table
        .iter()
        .find(|(_, keywords)| words.iter().any(|w| keywords.contains(&w.as_str())))
        .map(|(value, _)| *value)
}
