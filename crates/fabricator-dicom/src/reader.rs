//! DICOM实例读取
//!
//! 读回已生成的文件，用于校验和 `send` 前的检查。

use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use fabricator_core::{FabricatorError, Result, TagId};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// 读取结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInstance {
    pub transfer_syntax: String,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// 全部文本类元素（去除填充）
    pub tags: BTreeMap<TagId, String>,
    pub rows: u16,
    pub columns: u16,
    pub pixel_data: Vec<u8>,
}

impl ParsedInstance {
    pub fn get(&self, tag: TagId) -> Option<&str> {
        self.tags.get(&tag).map(String::as_str)
    }
}

/// 解析DICOM文件
pub fn read_instance(path: &Path) -> Result<ParsedInstance> {
    debug!("开始解析DICOM文件: {:?}", path);
    let obj = open_file(path).map_err(|e| FabricatorError::Dicom(format!("无法解析DICOM文件 {:?}: {}", path, e)))?;

    let parsed = extract(&obj)?;
    info!(
        "Parsed {:?}: SOP instance {} ({}x{})",
        path, parsed.sop_instance_uid, parsed.columns, parsed.rows
    );
    Ok(parsed)
}

fn extract(obj: &DefaultDicomObject) -> Result<ParsedInstance> {
    let mut text_tags = BTreeMap::new();
    for element in obj.iter() {
        let header = element.header();
        if !is_text(header.vr) {
            continue;
        }
        if let Ok(value) = element.to_str() {
            text_tags.insert(TagId(header.tag.group(), header.tag.element()), trim_padding(&value));
        }
    }

    let rows = integer(obj, tags::ROWS)?;
    let columns = integer(obj, tags::COLUMNS)?;
    let pixel_data = obj
        .element(tags::PIXEL_DATA)
        .map_err(|e| FabricatorError::Dicom(format!("缺少像素数据: {}", e)))?
        .to_bytes()
        .map_err(|e| FabricatorError::Dicom(format!("像素数据不可读: {}", e)))?
        .into_owned();

    let meta = obj.meta();
    Ok(ParsedInstance {
        transfer_syntax: meta.transfer_syntax().to_string(),
        sop_class_uid: trim_padding(meta.media_storage_sop_class_uid()),
        sop_instance_uid: trim_padding(meta.media_storage_sop_instance_uid()),
        tags: text_tags,
        rows,
        columns,
        pixel_data,
    })
}

fn integer(obj: &DefaultDicomObject, tag: dicom::core::Tag) -> Result<u16> {
    obj.element(tag)
        .map_err(|e| FabricatorError::Dicom(format!("缺少标签 {:?}: {}", tag, e)))?
        .to_int::<u16>()
        .map_err(|e| FabricatorError::Dicom(format!("标签 {:?} 不是整数: {}", tag, e)))
}

fn is_text(vr: VR) -> bool {
    matches!(
        vr,
        VR::AE | VR::AS | VR::CS | VR::DA | VR::DS | VR::DT | VR::IS | VR::LO | VR::LT | VR::PN | VR::SH | VR::ST | VR::TM | VR::UI | VR::UT
    )
}

fn trim_padding(value: &str) -> String {
    value.trim_end_matches(['\0', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::sample_record;
    use crate::render::RenderedImage;
    use crate::writer::write_instance;
    use dicom::dictionary_std::uids;

    #[test]
    fn test_written_instance_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DX_S001_I001.dcm");
        let record = sample_record();
        let pixels: Vec<u8> = (0..=255).collect();
        let image = RenderedImage {
            width: 16,
            height: 16,
            pixels: pixels.clone(),
            lines: Vec::new(),
        };
        write_instance(&path, &record, &image).unwrap();

        let parsed = read_instance(&path).unwrap();
        assert_eq!(parsed.transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(parsed.sop_instance_uid, "1.2.826.0.1.3680043.9.7382.3");
        assert_eq!((parsed.rows, parsed.columns), (16, 16));
        assert_eq!(parsed.pixel_data, pixels);

        for entry in record.entries() {
            assert_eq!(parsed.get(entry.tag), Some(entry.value.as_str()), "{}", entry.name);
        }
    }

    #[test]
    fn test_missing_file_is_dicom_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_instance(&dir.path().join("absent.dcm"));
        assert!(matches!(result, Err(FabricatorError::Dicom(_))));
    }

    #[test]
    fn test_trim_padding() {
        assert_eq!(trim_padding("1.2.3\0"), "1.2.3");
        assert_eq!(trim_padding("DOE^JANE "), "DOE^JANE");
    }
}
