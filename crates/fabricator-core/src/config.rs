//! 配置管理
//!
//! 默认值 → 可选的TOML配置文件 → `FABRICATOR__*` 环境变量，逐层覆盖

use crate::error::{FabricatorError, Result};
use crate::models::{IdentifierKind, Sex};
use crate::utils::{is_valid_dicom_uid, DEFAULT_UID_ROOT};
use chrono::{Datelike, Utc};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 合成器完整配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricatorConfig {
    /// 输出配置
    pub output: OutputConfig,
    /// 标识符生成配置
    pub identifiers: IdentifiersConfig,
    /// 生成数量限制
    pub limits: LimitsConfig,
    /// 人口统计学数据合成配置
    pub demographics: DemographicsConfig,
    /// 患者注册表配置
    pub registry: RegistryConfig,
    /// DICOM属性配置
    pub dicom: DicomConfig,
    /// 图像渲染配置
    pub rendering: RenderingConfig,
}

/// 输出配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// 检查输出根目录
    pub output_dir: PathBuf,
    /// 注册表与分配器状态目录
    pub state_dir: PathBuf,
}

/// 单个标识符模式配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// 模式，如 `PID{6digits}`
    pub pattern: String,
    /// 起始值
    pub start_value: u64,
    /// 增量
    pub increment: u64,
}

/// 标识符生成配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiersConfig {
    pub patient_id: PatternConfig,
    pub accession: PatternConfig,
    /// 冲突重试次数上限
    pub max_attempts: u32,
}

impl IdentifiersConfig {
    pub fn pattern_for(&self, kind: IdentifierKind) -> &PatternConfig {
        match kind {
            IdentifierKind::PatientId => &self.patient_id,
            IdentifierKind::Accession => &self.accession,
        }
    }
}

/// 生成数量限制
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_series: u32,
    pub min_images: u32,
    pub max_images: u32,
}

/// 姓名条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEntry {
    pub family: String,
    pub given: String,
}

/// 性别权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SexWeight {
    pub sex: Sex,
    pub weight: f64,
}

/// 人口统计学数据合成配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicsConfig {
    pub names: Vec<NameEntry>,
    pub birth_year_min: i32,
    pub birth_year_max: i32,
    pub sex_distribution: Vec<SexWeight>,
    pub addresses: Vec<String>,
    /// 电话号码模式，如 `04{2digits} {3digits} {3digits}`
    pub phone_pattern: String,
}

/// 未知患者ID的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPatientPolicy {
    /// 按请求的ID自动创建患者
    AutoCreate,
    /// 返回 PatientNotFound
    Reject,
}

/// 患者注册表配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub unknown_patient_policy: UnknownPatientPolicy,
}

/// DICOM属性配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomConfig {
    pub uid_root: String,
    pub institution_name: String,
    pub manufacturer: String,
    pub manufacturer_model_name: String,
    pub station_name: String,
    pub referring_physician: String,
    pub default_modality: String,
    pub default_study_description: String,
    pub default_procedure_code: String,
    /// 序列描述缺省模板，`{n}` 替换为序列号
    pub default_series_description: String,
}

/// 图像渲染配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderingConfig {
    /// 正方形画布边长（像素）
    pub canvas_size: u32,
    /// 随机种子；为空时使用系统熵
    pub seed: Option<u64>,
    pub footer_text: String,
}

impl FabricatorConfig {
    /// 加载配置：默认值、可选TOML文件、环境变量
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&FabricatorConfig::default())?);

        if let Some(path) = config_path {
            debug!("Loading configuration file: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let settings = builder
            .add_source(Environment::with_prefix("FABRICATOR").separator("__"))
            .build()?;

        let config: FabricatorConfig = settings.try_deserialize()?;
        config.validate()?;

        info!("Configuration loaded (file: {:?})", config_path);
        Ok(config)
    }

    /// 从TOML字符串加载（叠加在默认值上）
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(Config::try_from(&FabricatorConfig::default())?)
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        let config: FabricatorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_series == 0 {
            return Err(FabricatorError::Config("limits.max_series cannot be 0".to_string()));
        }
        if limits.min_images == 0 || limits.min_images > limits.max_images {
            return Err(FabricatorError::Config(format!(
                "limits.min_images/max_images out of order: {}..{}",
                limits.min_images, limits.max_images
            )));
        }

        for kind in IdentifierKind::ALL {
            let pattern = self.identifiers.pattern_for(kind);
            if pattern.increment == 0 {
                return Err(FabricatorError::Config(format!("identifiers.{}.increment cannot be 0", kind)));
            }
            if pattern.pattern.is_empty() {
                return Err(FabricatorError::Config(format!("identifiers.{}.pattern is empty", kind)));
            }
        }
        if self.identifiers.max_attempts == 0 {
            return Err(FabricatorError::Config("identifiers.max_attempts cannot be 0".to_string()));
        }

        let demographics = &self.demographics;
        if demographics.names.is_empty() || demographics.addresses.is_empty() {
            return Err(FabricatorError::Config("demographics.names and addresses must not be empty".to_string()));
        }
        if demographics.birth_year_min > demographics.birth_year_max {
            return Err(FabricatorError::Config("demographics.birth_year_min > birth_year_max".to_string()));
        }
        let total_weight: f64 = demographics.sex_distribution.iter().map(|w| w.weight).sum();
        if demographics.sex_distribution.iter().any(|w| w.weight < 0.0) || total_weight <= 0.0 {
            return Err(FabricatorError::Config("demographics.sex_distribution needs positive weights".to_string()));
        }

        // 根 + 时间戳/计数器/随机数后缀必须落在64字符以内
        if !is_valid_dicom_uid(&self.dicom.uid_root) || self.dicom.uid_root.len() > 30 {
            return Err(FabricatorError::Config(format!("dicom.uid_root is not usable: {}", self.dicom.uid_root)));
        }

        if self.rendering.canvas_size < 512 || self.rendering.canvas_size > 4096 {
            return Err(FabricatorError::Config("rendering.canvas_size must be within 512..=4096".to_string()));
        }

        Ok(())
    }

    /// 注册表状态文件
    pub fn patients_state_path(&self) -> PathBuf {
        self.output.state_dir.join("patients.json")
    }

    /// 分配器状态文件
    pub fn identifiers_state_path(&self) -> PathBuf {
        self.output.state_dir.join("identifiers.json")
    }
}

impl Default for FabricatorConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            identifiers: IdentifiersConfig::default(),
            limits: LimitsConfig::default(),
            demographics: DemographicsConfig::default(),
            registry: RegistryConfig::default(),
            dicom: DicomConfig::default(),
            rendering: RenderingConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/dicom_output"),
            state_dir: PathBuf::from("./data/state"),
        }
    }
}

impl Default for IdentifiersConfig {
    fn default() -> Self {
        Self {
            patient_id: PatternConfig {
                pattern: "PID{6digits}".to_string(),
                start_value: 100000,
                increment: 1,
            },
            // 4位年份 + 2个字母 + 7位序号
            accession: PatternConfig {
                pattern: format!("{}{{2letters}}{{7digits}}", Utc::now().year()),
                start_value: 1,
                increment: 1,
            },
            max_attempts: 10,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_series: 9,
            min_images: 1,
            max_images: 10,
        }
    }
}

impl Default for DemographicsConfig {
    fn default() -> Self {
        let names = [
            ("PATIENT", "TEST"),
            ("USER", "DEMO"),
            ("PERSON", "SAMPLE"),
            ("NAME", "FAKE"),
            ("DATA", "SYNTHETIC"),
            ("TESTCASE", "CLINICAL"),
            ("PHANTOM", "RADIOLOGY"),
        ]
        .into_iter()
        .map(|(family, given)| NameEntry {
            family: family.to_string(),
            given: given.to_string(),
        })
        .collect();

        let addresses = [
            "123 Test Street, Sydney NSW 2000",
            "456 Sample Road, Melbourne VIC 3000",
            "789 Fake Avenue, Brisbane QLD 4000",
            "321 Mock Boulevard, Perth WA 6000",
            "159 Demo Crescent, Adelaide SA 5000",
            "742 Example Drive, Hobart TAS 7000",
            "88 Synthetic Close, Darwin NT 0800",
            "264 Clinical Way, Canberra ACT 2600",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            names,
            birth_year_min: 1940,
            birth_year_max: 2005,
            sex_distribution: vec![
                SexWeight { sex: Sex::Male, weight: 0.45 },
                SexWeight { sex: Sex::Female, weight: 0.45 },
                SexWeight { sex: Sex::Other, weight: 0.1 },
            ],
            addresses,
            phone_pattern: "04{2digits} {3digits} {3digits}".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unknown_patient_policy: UnknownPatientPolicy::AutoCreate,
        }
    }
}

impl Default for DicomConfig {
    fn default() -> Self {
        Self {
            uid_root: DEFAULT_UID_ROOT.to_string(),
            institution_name: "Test Hospital".to_string(),
            manufacturer: "DICOM Fabricator".to_string(),
            manufacturer_model_name: "Fabricator v1.0".to_string(),
            station_name: "TEST_STATION".to_string(),
            referring_physician: "TEST^DOCTOR".to_string(),
            default_modality: "DX".to_string(),
            default_study_description: "Test Study".to_string(),
            default_procedure_code: "PA-VIEW".to_string(),
            default_series_description: "Series {n}".to_string(),
        }
    }
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            canvas_size: 512,
            seed: None,
            footer_text: "DICOM Fabricator - synthetic test data".to_string(),
        }
    }
}
