//! 检查合成器
//!
//! 从申请单或手动参数生成 检查 → 序列 → 实例 树，渲染并写出每个实例，
//! 最后整体发布检查目录。任何一步失败都不会留下半成品，显式检查号的预留也会释放；
//! 患者使用记录在发布成功后才写入注册表。

use crate::glyphs::printable;
use crate::markers::MarkerSet;
use crate::metadata::{MetadataRecord, SeriesHeader, StudyHeader};
use crate::render::ImageSynthesizer;
use crate::writer::write_instance;
use chrono::{Timelike, Utc};
use fabricator_core::utils::{is_valid_dicom_uid, sanitize_path_component, UidGenerator, MAX_UID_LENGTH};
use fabricator_core::{
    FabricatorConfig, FabricatorError, GenerationParams, IdentifierKind, Instance, OrderRecord, Patient, Result,
    Series, Study,
};
use fabricator_integration::normalize_modality;
use fabricator_registry::{IdentifierAllocator, PatientRegistry, PatientRequest};
use fabricator_storage::StagedDirectory;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// 检查清单文件名（位于检查目录根部）
pub const STUDY_MANIFEST: &str = "study.json";

/// 合成请求
#[derive(Debug, Clone, Default)]
pub struct CompositionRequest {
    pub order: Option<OrderRecord>,
    pub params: GenerationParams,
}

impl CompositionRequest {
    pub fn manual(params: GenerationParams) -> Self {
        Self { order: None, params }
    }

    pub fn from_order(order: OrderRecord, params: GenerationParams) -> Self {
        Self {
            order: Some(order),
            params,
        }
    }

    /// 显式检查号：参数优先于申请单
    fn explicit_accession(&self) -> Option<String> {
        non_empty(self.params.accession.as_deref())
            .or_else(|| self.order.as_ref().and_then(|o| non_empty(Some(o.accession_number.as_str()))))
    }

    fn patient_request(&self) -> PatientRequest {
        let order = self.order.as_ref();
        PatientRequest {
            patient_id: non_empty(self.params.patient_id.as_deref())
                .or_else(|| order.and_then(|o| non_empty(Some(o.patient_id.as_str())))),
            name: non_empty(self.params.patient_name.as_deref())
                .or_else(|| order.and_then(|o| non_empty(Some(o.patient_name.as_str())))),
            birth_date: order.and_then(|o| o.birth_date),
            sex: order.and_then(|o| o.sex),
        }
    }
}

/// 合成结果
#[derive(Debug, Clone)]
pub struct ComposedStudy {
    pub study: Arc<Study>,
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
    /// 可序列化摘要
    pub summary: serde_json::Value,
}

/// 经过边界检查的生成计划
#[derive(Debug, Clone, PartialEq, Eq)]
struct SeriesPlan {
    number: u32,
    procedure_code: String,
    description: String,
    modality: String,
    images: u32,
}

/// 检查合成器
#[derive(Debug)]
pub struct StudyComposer {
    config: FabricatorConfig,
    allocator: Arc<IdentifierAllocator>,
    registry: PatientRegistry,
    uids: UidGenerator,
    synthesizer: ImageSynthesizer,
    rng: Mutex<StdRng>,
}

impl StudyComposer {
    /// 按配置打开状态文件并创建合成器
    pub fn open(config: &FabricatorConfig) -> Result<Self> {
        let allocator = Arc::new(IdentifierAllocator::open(
            config.identifiers_state_path(),
            &config.identifiers,
        )?);
        let registry = PatientRegistry::open(
            config.patients_state_path(),
            allocator.clone(),
            &config.demographics,
            config.registry.unknown_patient_policy,
        )?;
        Ok(Self::new(config.clone(), allocator, registry))
    }

    pub fn new(config: FabricatorConfig, allocator: Arc<IdentifierAllocator>, registry: PatientRegistry) -> Self {
        let rng = match config.rendering.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            uids: UidGenerator::new(&config.dicom.uid_root),
            synthesizer: ImageSynthesizer::new(&config.rendering),
            allocator,
            registry,
            rng: Mutex::new(rng),
            config,
        }
    }

    pub fn registry(&self) -> &PatientRegistry {
        &self.registry
    }

    pub fn allocator(&self) -> &Arc<IdentifierAllocator> {
        &self.allocator
    }

    pub fn config(&self) -> &FabricatorConfig {
        &self.config
    }

    /// 生成并发布一个检查
    pub fn compose(&self, request: &CompositionRequest) -> Result<ComposedStudy> {
        let plan = self.plan(request)?;
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let explicit = request.explicit_accession();
        let accession = match &explicit {
            Some(accession) => {
                self.allocator.reserve(IdentifierKind::Accession, accession)?;
                accession.clone()
            }
            None => self.allocator.allocate(IdentifierKind::Accession, &mut *rng)?,
        };
        info!(
            "Composing study: accession {}, {} series, {} images",
            accession,
            plan.len(),
            plan.iter().map(|s| s.images).sum::<u32>()
        );

        let result = self.build(request, &plan, &accession, &mut *rng);
        if let Err(e) = &result {
            warn!("Study composition failed: {}", e);
            if explicit.is_some() {
                if let Err(release_err) = self.allocator.release(IdentifierKind::Accession, &accession) {
                    warn!("Failed to release accession {}: {}", accession, release_err);
                }
            }
        }
        result
    }

    /// 边界检查，超出限制直接报错，不做截断
    fn plan(&self, request: &CompositionRequest) -> Result<Vec<SeriesPlan>> {
        let limits = &self.config.limits;
        let params = &request.params;
        let requested = request.order.as_ref().map(|o| o.series.as_slice()).unwrap_or(&[]);

        let series_count = if params.series_count > 0 {
            params.series_count
        } else {
            requested.len() as u32
        };
        if series_count == 0 || series_count > limits.max_series {
            return Err(FabricatorError::GenerationLimitExceeded(format!(
                "series_count {} outside 1..={}",
                series_count, limits.max_series
            )));
        }

        let images: Vec<u32> = match params.images_per_series.as_slice() {
            [] => vec![limits.min_images; series_count as usize],
            [single] => vec![*single; series_count as usize],
            many if many.len() == series_count as usize => many.to_vec(),
            many => {
                return Err(FabricatorError::GenerationLimitExceeded(format!(
                    "images_per_series has {} entries for {} series",
                    many.len(),
                    series_count
                )))
            }
        };
        if let Some(bad) = images
            .iter()
            .find(|n| **n < limits.min_images || **n > limits.max_images)
        {
            return Err(FabricatorError::GenerationLimitExceeded(format!(
                "images per series {} outside {}..={}",
                bad, limits.min_images, limits.max_images
            )));
        }

        let explicit_modality = match non_empty(params.modality.as_deref()) {
            Some(raw) => Some(
                normalize_modality(&raw)
                    .ok_or_else(|| FabricatorError::Validation(format!("invalid modality: {}", raw)))?,
            ),
            None => None,
        };

        let dicom = &self.config.dicom;
        Ok(images
            .into_iter()
            .enumerate()
            .map(|(index, images)| {
                let number = index as u32 + 1;
                let ordered = requested.get(index);
                SeriesPlan {
                    number,
                    procedure_code: printable(
                        &ordered
                            .and_then(|s| non_empty(Some(s.procedure_code.as_str())))
                            .unwrap_or_else(|| dicom.default_procedure_code.clone()),
                    ),
                    description: printable(
                        &ordered
                            .and_then(|s| non_empty(Some(s.description.as_str())))
                            .unwrap_or_else(|| dicom.default_series_description.replace("{n}", &number.to_string())),
                    ),
                    modality: explicit_modality
                        .clone()
                        .or_else(|| ordered.and_then(|s| normalize_modality(&s.modality)))
                        .unwrap_or_else(|| dicom.default_modality.clone()),
                    images,
                }
            })
            .collect())
    }

    fn build(
        &self,
        request: &CompositionRequest,
        plan: &[SeriesPlan],
        accession: &str,
        rng: &mut StdRng,
    ) -> Result<ComposedStudy> {
        let pending = self.registry.prepare(&request.patient_request(), rng)?;
        let patient = pending.patient();

        let markers = MarkerSet::choose(rng);
        let base_description = non_empty(request.params.study_description.as_deref())
            .or_else(|| {
                request
                    .order
                    .as_ref()
                    .and_then(|o| non_empty(Some(o.requested_procedure.as_str())))
            })
            .unwrap_or_else(|| self.config.dicom.default_study_description.clone());

        let now = Utc::now();
        let header = StudyHeader {
            study_uid: self.uids.generate(),
            accession_number: accession.to_string(),
            description: printable(&format!("{} - {}", base_description, markers.description())),
            study_date: request
                .params
                .study_date
                .or_else(|| request.order.as_ref().and_then(|o| o.study_date))
                .unwrap_or_else(|| now.date_naive()),
            study_time: now.time().with_nanosecond(0).unwrap_or_else(|| now.time()),
            study_id: format!("STU{:04}", rng.random_range(1..=9999)),
        };
        self.check_layout(patient, &header, plan)?;

        let staged = StagedDirectory::begin(&self.config.output.output_dir, &header.study_uid)?;
        let mut files = Vec::new();
        let mut series_list = Vec::with_capacity(plan.len());

        for series_plan in plan {
            let series = self.build_series(&staged, patient, &header, series_plan, &markers, &mut files)?;
            series_list.push(series);
        }

        let study = Study {
            study_uid: header.study_uid.clone(),
            accession_number: header.accession_number.clone(),
            patient_id: patient.patient_id.clone(),
            patient_name: printable(&patient.name),
            description: header.description.clone(),
            study_date: header.study_date,
            study_time: header.study_time,
            study_id: header.study_id.clone(),
            referring_physician: self.config.dicom.referring_physician.clone(),
            directory: staged.target().to_path_buf(),
            series: series_list,
        };
        validate_uids(&study)?;

        staged.store_file(Path::new(STUDY_MANIFEST), &serde_json::to_vec_pretty(&study)?)?;
        let directory = staged.commit()?;

        if let Err(e) = self.registry.record_usage(&pending) {
            warn!("Failed to record patient usage, withdrawing {:?}", directory);
            if let Err(remove_err) = fs::remove_dir_all(&directory) {
                warn!("Failed to remove {:?}: {}", directory, remove_err);
            }
            return Err(e);
        }

        let summary = summarize(&study, &files);
        info!(
            "Study {} published at {:?} ({} instances)",
            study.study_uid,
            directory,
            study.instance_count()
        );
        Ok(ComposedStudy {
            study: Arc::new(study),
            directory,
            files,
            summary,
        })
    }

    /// 用最长的UID和最大实例号预排版每个序列，放不下时在写任何文件前报错
    fn check_layout(&self, patient: &Patient, study: &StudyHeader, plan: &[SeriesPlan]) -> Result<()> {
        let widest_uid = "9".repeat(MAX_UID_LENGTH);
        let study = StudyHeader {
            study_uid: widest_uid.clone(),
            ..study.clone()
        };
        for series_plan in plan {
            let series = SeriesHeader {
                series_uid: widest_uid.clone(),
                series_number: series_plan.number,
                procedure_code: series_plan.procedure_code.clone(),
                description: series_plan.description.clone(),
                modality: series_plan.modality.clone(),
            };
            let record =
                MetadataRecord::build(&self.config.dicom, patient, &study, &series, &widest_uid, series_plan.images);
            self.synthesizer.check_fits(&record)?;
        }
        Ok(())
    }

    fn build_series(
        &self,
        staged: &StagedDirectory,
        patient: &Patient,
        study: &StudyHeader,
        plan: &SeriesPlan,
        markers: &MarkerSet,
        files: &mut Vec<PathBuf>,
    ) -> Result<Series> {
        let header = SeriesHeader {
            series_uid: self.uids.generate(),
            series_number: plan.number,
            procedure_code: plan.procedure_code.clone(),
            description: plan.description.clone(),
            modality: plan.modality.clone(),
        };
        let directory = PathBuf::from(format!(
            "{:03}_{}",
            plan.number,
            sanitize_path_component(&plan.procedure_code)
        ));
        let modality_prefix = sanitize_path_component(&plan.modality);

        let mut instances = Vec::with_capacity(plan.images as usize);
        for instance_number in 1..=plan.images {
            let sop_uid = self.uids.generate();
            let record = MetadataRecord::build(&self.config.dicom, patient, study, &header, &sop_uid, instance_number);
            let image = self
                .synthesizer
                .render(&record, markers, plan.number, instance_number)?;

            let relative = directory.join(format!(
                "{}_S{:03}_I{:03}.dcm",
                modality_prefix, plan.number, instance_number
            ));
            let staging_path = staged.prepare_file(&relative)?;
            write_instance(&staging_path, &record, &image)?;

            let file_path = staged.published_path(&relative);
            debug!("Instance {} -> {:?}", sop_uid, file_path);
            files.push(file_path.clone());
            instances.push(Instance {
                sop_instance_uid: sop_uid,
                series_uid: header.series_uid.clone(),
                instance_number,
                file_path,
                tags: record.tag_map(),
                pixel_data: image.pixels,
            });
        }

        Ok(Series {
            series_uid: header.series_uid,
            study_uid: study.study_uid.clone(),
            series_number: plan.number,
            procedure_code: header.procedure_code,
            description: header.description,
            modality: header.modality,
            directory: staged.published_path(&directory),
            instances,
        })
    }
}

/// 检查内UID必须合法且互不重复
pub fn validate_uids(study: &Study) -> Result<()> {
    let mut seen = HashSet::new();
    for uid in study.all_uids() {
        if !is_valid_dicom_uid(uid) {
            return Err(FabricatorError::Validation(format!("invalid UID: {}", uid)));
        }
        if !seen.insert(uid) {
            return Err(FabricatorError::Validation(format!("duplicate UID: {}", uid)));
        }
    }
    Ok(())
}

fn summarize(study: &Study, files: &[PathBuf]) -> serde_json::Value {
    let series: Vec<serde_json::Value> = study
        .series
        .iter()
        .map(|s| {
            json!({
                "series_uid": s.series_uid,
                "series_number": s.series_number,
                "procedure_code": s.procedure_code,
                "description": s.description,
                "modality": s.modality,
                "image_count": s.instances.len(),
            })
        })
        .collect();

    json!({
        "study_uid": study.study_uid,
        "accession_number": study.accession_number,
        "patient_id": study.patient_id,
        "patient_name": study.patient_name,
        "study_description": study.description,
        "study_date": study.study_date.format("%Y%m%d").to_string(),
        "directory": study.directory,
        "series": series,
        "files": files,
        "total_images": files.len(),
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}
