//! # 标识符与患者注册模块
//!
//! - 标识符模式编译：`PID{6digits}`、`{4hex}` 等模式语言
//! - 标识符分配器：持久化游标 + 已用集合，保证不重复
//! - 患者注册表：查找、合成创建、搜索与使用统计

pub mod allocator;
pub mod demographics;
pub mod pattern;
pub mod patients;

pub use allocator::IdentifierAllocator;
pub use demographics::DemographicSynthesizer;
pub use pattern::{compile, CompiledPattern, Generator, Segment};
pub use patients::{PatientRegistry, PatientRequest, PatientSearch, PendingPatient, RegistryStats};
