//! # Fabricator Core
//!
//! DICOM合成器的核心模块，提供基础数据结构、错误定义、UID工具和配置管理。

pub mod config;
pub mod error;
pub mod models;
pub mod utils;

pub use config::FabricatorConfig;
pub use error::{FabricatorError, Result};
pub use models::*;
