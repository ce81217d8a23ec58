//! 持久化状态存储
//!
//! 每次变更都在独占文件锁内完成：重新读取 → 修改 → 写临时文件并fsync → 重命名覆盖。
//! 锁在提交完成后才释放，任何退出路径都会释放锁。

use fabricator_core::{FabricatorError, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// JSON状态存储
#[derive(Debug)]
pub struct StateStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    // 进程内串行化；跨进程由文件锁保证
    local: Mutex<()>,
    _state: PhantomData<fn() -> T>,
}

/// 文件锁守卫，离开作用域时释放
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release state lock: {}", e);
        }
    }
}

impl<T> StateStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// 打开（必要时创建）状态存储，并校验现有状态可读
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let parent = parent_dir(&path);
        fs::create_dir_all(&parent)?;

        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        let store = Self {
            path,
            lock_path: PathBuf::from(lock_path),
            local: Mutex::new(()),
            _state: PhantomData,
        };

        // 启动时加载一次，尽早发现损坏的状态文件
        store.read()?;
        debug!("Opened state store: {:?}", store.path);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取当前状态（共享锁）
    pub fn read(&self) -> Result<T> {
        let _local = self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _guard = self.acquire(false)?;
        self.load()
    }

    /// 在独占锁内修改状态；闭包返回错误时不写盘
    pub fn transact<R>(&self, mutate: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let _local = self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _guard = self.acquire(true)?;

        let mut state = self.load()?;
        let result = mutate(&mut state)?;
        self.commit(&state)?;
        Ok(result)
    }

    fn acquire(&self, exclusive: bool) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| FabricatorError::Storage(format!("无法锁定 {:?}: {}", self.lock_path, e)))?;

        Ok(LockGuard { file })
    }

    fn load(&self) -> Result<T> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(T::default()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                FabricatorError::Storage(format!("状态文件损坏 {:?}: {}", self.path, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, state: &T) -> Result<()> {
        let parent = parent_dir(&self.path);
        let mut temp = NamedTempFile::new_in(&parent)?;
        serde_json::to_writer_pretty(temp.as_file_mut(), state)?;
        temp.as_file_mut().write_all(b"\n")?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|e| FabricatorError::Storage(format!("无法提交状态 {:?}: {}", self.path, e.error)))?;

        #[cfg(unix)]
        if let Ok(dir) = File::open(&parent) {
            let _ = dir.sync_all();
        }

        debug!("Committed state: {:?}", self.path);
        Ok(())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
