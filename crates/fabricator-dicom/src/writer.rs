//! DICOM实例写入
//!
//! 把 [`MetadataRecord`] 和渲染好的像素缓冲区组装成 Part 10 文件。
//! 传输语法固定为 Explicit VR Little Endian，像素为8位单通道 MONOCHROME2。

use crate::metadata::MetadataRecord;
use crate::render::RenderedImage;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use fabricator_core::{FabricatorError, Result, TagId};
use std::path::Path;
use tracing::debug;

const SOP_CLASS_UID: TagId = TagId(0x0008, 0x0016);
const SOP_INSTANCE_UID: TagId = TagId(0x0008, 0x0018);

/// 组装内存中的DICOM文件对象
pub fn build_object(record: &MetadataRecord, image: &RenderedImage) -> Result<FileDicomObject<InMemDicomObject>> {
    let sop_class = required(record, SOP_CLASS_UID)?;
    let sop_instance = required(record, SOP_INSTANCE_UID)?;

    if image.pixels.len() != (image.width as usize) * (image.height as usize) {
        return Err(FabricatorError::Dicom(format!(
            "pixel buffer has {} bytes, expected {}x{}",
            image.pixels.len(),
            image.width,
            image.height
        )));
    }
    let rows = u16::try_from(image.height)
        .map_err(|_| FabricatorError::Dicom(format!("image height {} exceeds US range", image.height)))?;
    let columns = u16::try_from(image.width)
        .map_err(|_| FabricatorError::Dicom(format!("image width {} exceeds US range", image.width)))?;

    let mut elements: Vec<DataElement<InMemDicomObject>> = record
        .entries()
        .iter()
        .map(|entry| DataElement::new(Tag(entry.tag.group(), entry.tag.element()), entry.vr, text_value(entry.vr, &entry.value)))
        .collect();

    elements.extend([
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(7_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
        DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(image.pixels.clone())),
    ]);

    InMemDicomObject::from_element_iter(elements)
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(sop_class)
                .media_storage_sop_instance_uid(sop_instance),
        )
        .map_err(|e| FabricatorError::Dicom(format!("failed to build file meta group: {}", e)))
}

/// 写入单个实例文件
pub fn write_instance(path: &Path, record: &MetadataRecord, image: &RenderedImage) -> Result<()> {
    let object = build_object(record, image)?;
    object
        .write_to_file(path)
        .map_err(|e| FabricatorError::Dicom(format!("failed to write {:?}: {}", path, e)))?;
    debug!("Wrote DICOM instance {:?}", path);
    Ok(())
}

fn required(record: &MetadataRecord, tag: TagId) -> Result<&str> {
    record
        .get(tag)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FabricatorError::Dicom(format!("record is missing {}", tag)))
}

// 多值CS以反斜杠分隔
fn text_value(vr: VR, value: &str) -> PrimitiveValue {
    if vr == VR::CS && value.contains('\\') {
        PrimitiveValue::Strs(value.split('\\').map(str::to_string).collect())
    } else {
        PrimitiveValue::from(value.to_string())
    }
}
