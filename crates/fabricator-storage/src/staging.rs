//! 检查目录暂存与发布

use fabricator_core::{FabricatorError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 暂存目录
///
/// 所有文件先写入输出根目录下的隐藏暂存目录，`commit` 时整体重命名为目标目录。
/// 未提交就被丢弃时自动删除暂存内容，外部永远看不到半成品。
#[derive(Debug)]
pub struct StagedDirectory {
    staging: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedDirectory {
    /// 在 `root` 下为 `name` 创建暂存目录
    pub fn begin(root: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(root)?;

        let target = root.join(name);
        if target.exists() {
            return Err(FabricatorError::Storage(format!("目标目录已存在: {:?}", target)));
        }

        let staging = root.join(format!(".staging-{}", Uuid::new_v4().simple()));
        fs::create_dir(&staging)?;
        debug!("Created staging directory {:?} for {:?}", staging, target);

        Ok(Self {
            staging,
            target,
            committed: false,
        })
    }

    /// 暂存目录路径
    pub fn path(&self) -> &Path {
        &self.staging
    }

    /// 发布后的目标路径
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// 把暂存目录下的相对路径映射为发布后的路径
    pub fn published_path(&self, relative: &Path) -> PathBuf {
        self.target.join(relative)
    }

    /// 写入文件（相对暂存目录）
    pub fn store_file(&self, relative: &Path, data: &[u8]) -> Result<PathBuf> {
        let full_path = self.prepare_file(relative)?;
        fs::write(&full_path, data)?;
        Ok(full_path)
    }

    /// 为外部写入器准备文件路径（创建父目录）
    pub fn prepare_file(&self, relative: &Path) -> Result<PathBuf> {
        let full_path = self.staging.join(relative);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(full_path)
    }

    /// 原子发布
    pub fn commit(mut self) -> Result<PathBuf> {
        if self.target.exists() {
            return Err(FabricatorError::Storage(format!("目标目录已存在: {:?}", self.target)));
        }
        fs::rename(&self.staging, &self.target)?;
        self.committed = true;
        info!("Published {:?}", self.target);
        Ok(self.target.clone())
    }
}

impl Drop for StagedDirectory {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staging directory {:?}: {}", self.staging, e);
            }
        } else {
            debug!("Discarded staging directory {:?}", self.staging);
        }
    }
}
