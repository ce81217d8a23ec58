//! 标识符分配器
//!
//! 每类标识符（患者ID、检查号）持有一个持久化游标和已用集合。
//! 分配、预留、释放都在状态锁内完成并原子提交。

use crate::pattern::Generator;
use fabricator_core::config::IdentifiersConfig;
use fabricator_core::{FabricatorError, IdentifierKind, Result};
use fabricator_storage::StateStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// 单类标识符的持久化状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindState {
    #[serde(default)]
    pub cursor: Option<u64>,
    #[serde(default)]
    pub used: BTreeSet<String>,
}

/// 分配器持久化状态（identifiers.json）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorState {
    #[serde(default)]
    pub kinds: BTreeMap<IdentifierKind, KindState>,
}

impl AllocatorState {
    fn kind_mut(&mut self, kind: IdentifierKind) -> &mut KindState {
        self.kinds.entry(kind).or_default()
    }

    fn contains(&self, kind: IdentifierKind, identifier: &str) -> bool {
        self.kinds
            .get(&kind)
            .map(|state| state.used.contains(identifier))
            .unwrap_or(false)
    }
}

/// 标识符分配器
#[derive(Debug)]
pub struct IdentifierAllocator {
    store: StateStore<AllocatorState>,
    patient_id: Generator,
    accession: Generator,
    max_attempts: u32,
}

impl IdentifierAllocator {
    /// 打开分配器状态；模式在此编译，错误的模式直接返回 PatternError
    pub fn open(path: impl Into<PathBuf>, config: &IdentifiersConfig) -> Result<Self> {
        let patient_id = Generator::from_config(&config.patient_id)?;
        let accession = Generator::from_config(&config.accession)?;
        let store = StateStore::open(path)?;

        info!(
            "Identifier allocator ready (patient_id: {}, accession: {})",
            patient_id.pattern().template(),
            accession.pattern().template()
        );

        Ok(Self {
            store,
            patient_id,
            accession,
            max_attempts: config.max_attempts.max(1),
        })
    }

    pub fn generator(&self, kind: IdentifierKind) -> &Generator {
        match kind {
            IdentifierKind::PatientId => &self.patient_id,
            IdentifierKind::Accession => &self.accession,
        }
    }

    /// 分配一个新的标识符
    pub fn allocate<R: Rng + ?Sized>(&self, kind: IdentifierKind, rng: &mut R) -> Result<String> {
        let outcome = self.store.transact(|state| Ok(self.allocate_in(state, kind, rng)))?;
        match &outcome {
            Ok(identifier) => debug!("Allocated {} {}", kind, identifier),
            Err(e) => warn!("Allocation failed for {}: {}", kind, e),
        }
        outcome
    }

    /// 在已持有的状态上分配（游标推进即使在耗尽时也会提交）
    pub(crate) fn allocate_in<R: Rng + ?Sized>(
        &self,
        state: &mut AllocatorState,
        kind: IdentifierKind,
        rng: &mut R,
    ) -> Result<String> {
        let generator = self.generator(kind);
        let entry = state.kind_mut(kind);
        let mut cursor = entry.cursor.unwrap_or(0).max(generator.start_value());

        for _ in 0..self.max_attempts {
            let (candidate, next) = generator.next(cursor, rng);
            cursor = next;
            if entry.used.insert(candidate.clone()) {
                entry.cursor = Some(cursor);
                return Ok(candidate);
            }
            debug!("Identifier collision for {}: {}", kind, candidate);
        }

        entry.cursor = Some(cursor);
        Err(FabricatorError::AllocationExhausted {
            kind,
            attempts: self.max_attempts,
        })
    }

    /// 预留外部提供的标识符；已被使用时报错
    pub fn reserve(&self, kind: IdentifierKind, identifier: &str) -> Result<()> {
        self.store.transact(|state| {
            if state.kind_mut(kind).used.insert(identifier.to_string()) {
                Ok(())
            } else {
                Err(duplicate(kind, identifier))
            }
        })?;
        info!("Reserved {} {}", kind, identifier);
        Ok(())
    }

    /// 记录标识符为已用（幂等），返回是否为新记录
    pub fn claim(&self, kind: IdentifierKind, identifier: &str) -> Result<bool> {
        self.store
            .transact(|state| Ok(state.kind_mut(kind).used.insert(identifier.to_string())))
    }

    /// 释放预留（生成失败时回滚）
    pub fn release(&self, kind: IdentifierKind, identifier: &str) -> Result<bool> {
        let removed = self
            .store
            .transact(|state| Ok(state.kind_mut(kind).used.remove(identifier)))?;
        if removed {
            info!("Released {} {}", kind, identifier);
        }
        Ok(removed)
    }

    pub fn is_used(&self, kind: IdentifierKind, identifier: &str) -> Result<bool> {
        Ok(self.store.read()?.contains(kind, identifier))
    }

    /// 预览接下来的标识符，不修改状态
    pub fn preview<R: Rng + ?Sized>(&self, kind: IdentifierKind, count: usize, rng: &mut R) -> Result<Vec<String>> {
        let mut state = self.store.read()?;
        let mut tokens = Vec::with_capacity(count);
        for _ in 0..count {
            tokens.push(self.allocate_in(&mut state, kind, rng)?);
        }
        Ok(tokens)
    }

    /// 已用数量
    pub fn used_count(&self, kind: IdentifierKind) -> Result<usize> {
        Ok(self
            .store
            .read()?
            .kinds
            .get(&kind)
            .map(|state| state.used.len())
            .unwrap_or(0))
    }
}

fn duplicate(kind: IdentifierKind, identifier: &str) -> FabricatorError {
    match kind {
        IdentifierKind::Accession => FabricatorError::DuplicateAccession(identifier.to_string()),
        IdentifierKind::PatientId => FabricatorError::DuplicateIdentifier {
            kind,
            value: identifier.to_string(),
        },
    }
}
