//! # 存储模块
//!
//! - 注册表/分配器状态的持久化：独占锁 + 临时文件 + 原子重命名
//! - 检查目录的全有或全无发布：先写入暂存目录，完成后整体重命名

pub mod staging;
pub mod state_store;

pub use staging::StagedDirectory;
pub use state_store::StateStore;
