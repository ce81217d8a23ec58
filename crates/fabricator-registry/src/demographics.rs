//! 人口统计学数据合成

use crate::pattern::{compile, CompiledPattern};
use chrono::NaiveDate;
use fabricator_core::config::DemographicsConfig;
use fabricator_core::{FabricatorError, Result, Sex};
use rand::Rng;

/// 按配置随机生成姓名、出生日期、性别、地址和电话
#[derive(Debug, Clone)]
pub struct DemographicSynthesizer {
    config: DemographicsConfig,
    phone: CompiledPattern,
}

impl DemographicSynthesizer {
    pub fn new(config: &DemographicsConfig) -> Result<Self> {
        if config.names.is_empty() || config.addresses.is_empty() {
            return Err(FabricatorError::Config("demographics.names and addresses must not be empty".to_string()));
        }
        Ok(Self {
            config: config.clone(),
            phone: compile(&config.phone_pattern)?,
        })
    }

    /// `FAMILY^GIVEN`
    pub fn name<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let entry = &self.config.names[rng.random_range(0..self.config.names.len())];
        format!("{}^{}", entry.family, entry.given)
    }

    /// 日期取 1–28，避免月末无效日期
    pub fn birth_date<R: Rng + ?Sized>(&self, rng: &mut R) -> NaiveDate {
        let year = rng.random_range(self.config.birth_year_min..=self.config.birth_year_max);
        let month = rng.random_range(1..=12);
        let day = rng.random_range(1..=28);
        NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
    }

    pub fn sex<R: Rng + ?Sized>(&self, rng: &mut R) -> Sex {
        let total: f64 = self.config.sex_distribution.iter().map(|w| w.weight).sum();
        if total <= 0.0 {
            return Sex::Other;
        }
        let mut roll = rng.random::<f64>() * total;
        for weight in &self.config.sex_distribution {
            if roll < weight.weight {
                return weight.sex;
            }
            roll -= weight.weight;
        }
        self.config
            .sex_distribution
            .last()
            .map(|w| w.sex)
            .unwrap_or(Sex::Other)
    }

    pub fn address<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.config.addresses[rng.random_range(0..self.config.addresses.len())].clone()
    }

    pub fn phone<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.phone.sample(rng)
    }
}
