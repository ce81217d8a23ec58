//! # 合成器集成模块
//!
//! 提供与外部系统的集成功能，包括：
//! - HL7 v2.x ORM申请单解析，用于从RIS申请生成检查
//! - 根据检查项目推断设备类型
//! - 检查传输接口，把生成的检查发送到PACS

pub mod hl7;
pub mod modality;
pub mod transport;

pub use hl7::{decode_escapes, parse_hl7_date, Delimiters, OrderMessageParser};
pub use modality::{infer_modality, normalize_modality, DEFAULT_MODALITY};
pub use transport::{collect_dicom_files, StorescuTransport, StudyTransport, TransportRequest};
