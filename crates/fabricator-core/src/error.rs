//! 错误定义模块

use crate::models::IdentifierKind;
use thiserror::Error;

/// 合成器统一错误类型
#[derive(Error, Debug)]
pub enum FabricatorError {
    #[error("标识符模式错误: {template}: {reason}")]
    Pattern { template: String, reason: String },

    #[error("标识符分配失败: {kind} 在 {attempts} 次尝试后仍然冲突")]
    AllocationExhausted { kind: IdentifierKind, attempts: u32 },

    #[error("检查号已被使用: {0}")]
    DuplicateAccession(String),

    #[error("标识符已被使用: {kind} {value}")]
    DuplicateIdentifier { kind: IdentifierKind, value: String },

    #[error("申请单消息格式错误 ({segment}): {reason}")]
    MalformedOrder { segment: String, reason: String },

    #[error("超出生成限制: {0}")]
    GenerationLimitExceeded(String),

    #[error("患者不存在: {0}")]
    PatientNotFound(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("图像渲染错误: {0}")]
    Render(String),

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FabricatorError {
    /// 构造申请单格式错误
    pub fn malformed(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        FabricatorError::MalformedOrder {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// 构造标识符模式错误
    pub fn pattern(template: impl Into<String>, reason: impl Into<String>) -> Self {
        FabricatorError::Pattern {
            template: template.into(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for FabricatorError {
    fn from(err: config::ConfigError) -> Self {
        FabricatorError::Config(err.to_string())
    }
}

/// 合成器统一结果类型
pub type Result<T> = std::result::Result<T, FabricatorError>;
