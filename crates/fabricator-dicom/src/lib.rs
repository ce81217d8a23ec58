//! # DICOM合成模块
//!
//! 提供实例元数据、点阵字形、元数据图像渲染、Part 10 文件读写以及检查合成器。

pub mod composer;
pub mod glyphs;
pub mod markers;
pub mod metadata;
pub mod reader;
pub mod render;
pub mod writer;

pub use composer::{validate_uids, ComposedStudy, CompositionRequest, StudyComposer, STUDY_MANIFEST};
pub use markers::{Marker, MarkerSet, Shape};
pub use metadata::{
    body_part_for, view_position_for, MetadataRecord, SeriesHeader, StudyHeader, TagEntry, DX_FOR_PRESENTATION_SOP_CLASS,
    UTF8_CHARACTER_SET,
};
pub use reader::{read_instance, ParsedInstance};
pub use render::{wrap_text, ImageSynthesizer, RenderedImage};
pub use writer::{build_object, write_instance};
