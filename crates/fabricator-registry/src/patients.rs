//! 合成患者注册表
//!
//! 状态保存在 `patients.json`。解析（`prepare`）只读注册表，使用记录（`record_usage`）
//! 在检查发布后才写入。认领ID时在注册表锁内调用分配器，锁顺序固定为 注册表 → 分配器。

use crate::allocator::IdentifierAllocator;
use crate::demographics::DemographicSynthesizer;
use chrono::{DateTime, NaiveDate, Utc};
use fabricator_core::config::{DemographicsConfig, UnknownPatientPolicy};
use fabricator_core::{FabricatorError, IdentifierKind, Patient, Result, Sex};
use fabricator_storage::StateStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// 注册表持久化状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub patients: BTreeMap<String, Patient>,
}

/// 患者解析请求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientRequest {
    pub patient_id: Option<String>,
    /// 姓名提示（`FAMILY^GIVEN`）
    pub name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
}

impl PatientRequest {
    pub fn with_id(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: Some(patient_id.into()),
            ..Default::default()
        }
    }

    fn requested_id(&self) -> Option<&str> {
        self.patient_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

/// 已解析但尚未记录使用的患者
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatient {
    patient: Patient,
    is_new: bool,
}

impl PendingPatient {
    pub fn patient(&self) -> &Patient {
        &self.patient
    }

    /// 注册表中尚无该患者
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

/// 注册表统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_patients: usize,
    pub total_studies: u64,
    pub most_recent_patient: Option<String>,
    pub most_used_patient: Option<String>,
    pub average_studies_per_patient: f64,
}

/// 患者注册表
#[derive(Debug)]
pub struct PatientRegistry {
    store: StateStore<RegistryState>,
    allocator: Arc<IdentifierAllocator>,
    demographics: DemographicSynthesizer,
    policy: UnknownPatientPolicy,
}

impl PatientRegistry {
    /// 打开注册表状态
    pub fn open(
        path: impl Into<PathBuf>,
        allocator: Arc<IdentifierAllocator>,
        demographics: &DemographicsConfig,
        policy: UnknownPatientPolicy,
    ) -> Result<Self> {
        let store = StateStore::open(path)?;
        let registry = Self {
            store,
            allocator,
            demographics: DemographicSynthesizer::new(demographics)?,
            policy,
        };
        info!("Patient registry opened with {} patients", registry.store.read()?.patients.len());
        Ok(registry)
    }

    pub fn allocator(&self) -> &Arc<IdentifierAllocator> {
        &self.allocator
    }

    /// 按ID解析患者，不存在时按策略创建；每次调用记为一次使用
    pub fn resolve_or_create<R: Rng + ?Sized>(&self, request: &PatientRequest, rng: &mut R) -> Result<Patient> {
        let pending = self.prepare(request, rng)?;
        self.record_usage(&pending)
    }

    /// 解析患者但不修改注册表
    ///
    /// 未知ID按策略处理（Reject 直接报错）；未给ID时从分配器取新ID。
    /// 返回的患者要等 [`record_usage`](Self::record_usage) 之后才写入注册表。
    pub fn prepare<R: Rng + ?Sized>(&self, request: &PatientRequest, rng: &mut R) -> Result<PendingPatient> {
        let now = Utc::now();
        let state = self.store.read()?;

        if let Some(id) = request.requested_id() {
            if let Some(existing) = state.patients.get(id) {
                debug!("Resolved existing patient {} (studies: {})", id, existing.study_count);
                return Ok(PendingPatient {
                    patient: existing.clone(),
                    is_new: false,
                });
            }
            if self.policy == UnknownPatientPolicy::Reject {
                return Err(FabricatorError::PatientNotFound(id.to_string()));
            }
            return Ok(PendingPatient {
                patient: self.synthesize(id.to_string(), request, now, 0, rng),
                is_new: true,
            });
        }

        let id = self.fresh_id(&state, rng)?;
        Ok(PendingPatient {
            patient: self.synthesize(id, request, now, 0, rng),
            is_new: true,
        })
    }

    /// 记录一次使用：新患者写入注册表，已有患者计数加一
    pub fn record_usage(&self, pending: &PendingPatient) -> Result<Patient> {
        let now = Utc::now();
        let id = pending.patient.patient_id.as_str();
        self.store.transact(|state| {
            if let Some(existing) = state.patients.get_mut(id) {
                existing.study_count += 1;
                existing.last_used = now;
                debug!("Recorded study for patient {} (studies: {})", id, existing.study_count);
                return Ok(existing.clone());
            }

            self.allocator.claim(IdentifierKind::PatientId, id)?;
            let mut patient = pending.patient.clone();
            patient.study_count = 1;
            patient.last_used = now;
            state.patients.insert(patient.patient_id.clone(), patient.clone());
            info!("Created patient {}", patient.patient_id);
            Ok(patient)
        })
    }

    /// 生成一个新患者（尚无检查）
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Patient> {
        let now = Utc::now();
        self.store.transact(|state| {
            let id = self.fresh_id(state, rng)?;
            let patient = self.synthesize(id, &PatientRequest::default(), now, 0, rng);
            state.patients.insert(patient.patient_id.clone(), patient.clone());
            info!("Generated patient {}", patient.patient_id);
            Ok(patient)
        })
    }

    /// 按ID查找，不会自动创建
    pub fn lookup(&self, patient_id: &str) -> Result<Patient> {
        self.store
            .read()?
            .patients
            .get(patient_id.trim())
            .cloned()
            .ok_or_else(|| FabricatorError::PatientNotFound(patient_id.to_string()))
    }

    /// 搜索患者（ID、姓名、地址、电话、出生日期，不区分大小写）
    pub fn search(&self, query: &str) -> Result<PatientSearch> {
        Ok(PatientSearch::new(query, self.store.read()?))
    }

    /// 最近使用的患者
    pub fn list(&self, limit: usize) -> Result<Vec<Patient>> {
        Ok(self.search("")?.iter().take(limit).cloned().collect())
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        let state = self.store.read()?;
        let patients: Vec<&Patient> = state.patients.values().collect();
        if patients.is_empty() {
            return Ok(RegistryStats::default());
        }

        let total_studies: u64 = patients.iter().map(|p| u64::from(p.study_count)).sum();
        let most_recent = patients
            .iter()
            .max_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| b.patient_id.cmp(&a.patient_id)))
            .map(|p| p.patient_id.clone());
        let most_used = patients
            .iter()
            .max_by(|a, b| a.study_count.cmp(&b.study_count).then_with(|| b.patient_id.cmp(&a.patient_id)))
            .map(|p| p.patient_id.clone());

        Ok(RegistryStats {
            total_patients: patients.len(),
            total_studies,
            most_recent_patient: most_recent,
            most_used_patient: most_used,
            average_studies_per_patient: total_studies as f64 / patients.len() as f64,
        })
    }

    fn fresh_id<R: Rng + ?Sized>(&self, state: &RegistryState, rng: &mut R) -> Result<String> {
        // 注册表中可能有未登记到分配器的旧患者
        loop {
            let id = self.allocator.allocate(IdentifierKind::PatientId, rng)?;
            if !state.patients.contains_key(&id) {
                return Ok(id);
            }
            debug!("Allocated patient ID {} already in registry, retrying", id);
        }
    }

    fn synthesize<R: Rng + ?Sized>(
        &self,
        patient_id: String,
        request: &PatientRequest,
        now: DateTime<Utc>,
        study_count: u32,
        rng: &mut R,
    ) -> Patient {
        let name = match request.name.as_deref().map(str::trim) {
            Some(hint) if !hint.is_empty() => hint.to_string(),
            _ => self.demographics.name(rng),
        };
        let birth_date = request.birth_date.unwrap_or_else(|| self.demographics.birth_date(rng));
        let sex = request.sex.unwrap_or_else(|| self.demographics.sex(rng));

        Patient {
            patient_id,
            name,
            birth_date,
            sex,
            address: self.demographics.address(rng),
            phone: self.demographics.phone(rng),
            created_at: now,
            last_used: now,
            study_count,
        }
    }
}

/// 搜索结果
///
/// 持有查询时刻的快照，按 `last_used` 降序（相同时按ID升序）。
/// `iter()` 惰性过滤，可反复调用。
#[derive(Debug, Clone)]
pub struct PatientSearch {
    query: String,
    patients: Vec<Patient>,
}

impl PatientSearch {
    fn new(query: &str, state: RegistryState) -> Self {
        let mut patients: Vec<Patient> = state.patients.into_values().collect();
        patients.sort_by(|a, b| {
            b.last_used
                .cmp(&a.last_used)
                .then_with(|| a.patient_id.cmp(&b.patient_id))
        });
        Self {
            query: query.trim().to_lowercase(),
            patients,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patient> + '_ {
        self.patients.iter().filter(move |p| matches_query(p, &self.query))
    }
}

impl<'a> IntoIterator for &'a PatientSearch {
    type Item = &'a Patient;
    type IntoIter = Box<dyn Iterator<Item = &'a Patient> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

fn matches_query(patient: &Patient, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }
    let fields = [
        patient.patient_id.to_lowercase(),
        patient.name.to_lowercase(),
        patient.name.replace('^', " ").to_lowercase(),
        patient.address.to_lowercase(),
        patient.phone.to_lowercase(),
        patient.birth_date.format("%Y-%m-%d").to_string(),
        patient.birth_date.format("%Y%m%d").to_string(),
    ];
    fields.iter().any(|field| field.contains(query))
}
