//! DICOM合成器命令行程序

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use fabricator_core::{FabricatorConfig, GenerationParams, IdentifierKind, PacsDestination, Study};
use fabricator_dicom::{CompositionRequest, StudyComposer, STUDY_MANIFEST};
use fabricator_integration::{OrderMessageParser, StorescuTransport, StudyTransport, TransportRequest};
use fabricator_registry::IdentifierAllocator;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "dicom-fabricator")]
#[command(about = "合成DICOM测试检查（虚构患者、唯一标识符、带元数据的图像）")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 生成一个检查
    Generate {
        /// HL7 ORM 申请单文件
        #[arg(long)]
        order: Option<PathBuf>,
        #[arg(long)]
        patient_id: Option<String>,
        /// 姓名（FAMILY^GIVEN）
        #[arg(long)]
        patient_name: Option<String>,
        #[arg(long)]
        accession: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// 序列数；0 表示按申请单
        #[arg(long, default_value_t = 0)]
        series: u32,
        /// 每个序列的图像数，逗号分隔；只给一个值时应用到所有序列
        #[arg(long, value_delimiter = ',')]
        images: Vec<u32>,
        /// 检查日期 (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        modality: Option<String>,
    },
    /// 解析申请单并输出JSON
    ParseOrder { file: PathBuf },
    /// 患者注册表
    Patients {
        #[command(subcommand)]
        action: PatientsAction,
    },
    /// 预览标识符（不占用）
    TestIds {
        #[arg(long, value_enum, default_value = "patient")]
        kind: KindArg,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// 输出当前生效的配置
    Config,
    /// 用 storescu 发送已生成的检查
    Send {
        /// 检查目录（包含 study.json）
        #[arg(long)]
        study: PathBuf,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 104)]
        port: u16,
        #[arg(long, default_value = "FABRICATOR")]
        calling_ae: String,
        #[arg(long, default_value = "ANY-SCP")]
        called_ae: String,
        #[arg(long, default_value = "storescu")]
        program: PathBuf,
        /// 超时（秒）
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[derive(Subcommand, Debug)]
enum PatientsAction {
    /// 最近使用的患者
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Search { query: String },
    Show { patient_id: String },
    /// 生成新患者
    Generate {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    Stats,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Patient,
    Accession,
}

impl From<KindArg> for IdentifierKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Patient => IdentifierKind::PatientId,
            KindArg::Accession => IdentifierKind::Accession,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .with_writer(std::io::stderr)
        .init();

    let config = FabricatorConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Err(e) = run(args.command, config).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, config: FabricatorConfig) -> Result<()> {
    match command {
        Command::Generate {
            order,
            patient_id,
            patient_name,
            accession,
            description,
            series,
            images,
            date,
            modality,
        } => {
            let params = GenerationParams {
                patient_id,
                patient_name,
                accession,
                study_description: description,
                series_count: series,
                images_per_series: images,
                study_date: date,
                modality,
            };
            let request = match order {
                Some(path) => {
                    let raw = fs::read_to_string(&path).with_context(|| format!("failed to read {:?}", path))?;
                    let record = OrderMessageParser::new().parse(&raw)?;
                    CompositionRequest::from_order(record, params)
                }
                None => CompositionRequest::manual(params),
            };

            let composer = StudyComposer::open(&config)?;
            let composed = composer.compose(&request)?;
            info!("Generated study {} in {:?}", composed.study.study_uid, composed.directory);
            print_json(&composed.summary)?;
        }
        Command::ParseOrder { file } => {
            let raw = fs::read_to_string(&file).with_context(|| format!("failed to read {:?}", file))?;
            let record = OrderMessageParser::new().parse(&raw)?;
            print_json(&record)?;
        }
        Command::Patients { action } => {
            let composer = StudyComposer::open(&config)?;
            let registry = composer.registry();
            match action {
                PatientsAction::List { limit } => print_json(&registry.list(limit)?)?,
                PatientsAction::Search { query } => {
                    let results = registry.search(&query)?;
                    let matches: Vec<_> = results.iter().collect();
                    print_json(&matches)?;
                }
                PatientsAction::Show { patient_id } => print_json(&registry.lookup(&patient_id)?)?,
                PatientsAction::Generate { count } => {
                    let mut rng = seeded_rng(&config);
                    let mut created = Vec::with_capacity(count);
                    for _ in 0..count {
                        created.push(registry.generate(&mut rng)?);
                    }
                    print_json(&created)?;
                }
                PatientsAction::Stats => print_json(&registry.stats()?)?,
            }
        }
        Command::TestIds { kind, count } => {
            let allocator = IdentifierAllocator::open(config.identifiers_state_path(), &config.identifiers)?;
            let kind = IdentifierKind::from(kind);
            let preview = allocator.preview(kind, count, &mut seeded_rng(&config))?;
            println!("pattern: {}", allocator.generator(kind).pattern().template());
            for identifier in preview {
                println!("{}", identifier);
            }
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config).context("failed to render configuration")?);
        }
        Command::Send {
            study,
            host,
            port,
            calling_ae,
            called_ae,
            program,
            timeout,
        } => {
            let manifest = study.join(STUDY_MANIFEST);
            let raw = fs::read_to_string(&manifest).with_context(|| format!("failed to read {:?}", manifest))?;
            let parsed: Study = serde_json::from_str(&raw).with_context(|| format!("invalid manifest {:?}", manifest))?;

            let request = TransportRequest {
                study: Arc::new(parsed),
                study_dir: study,
                destination: PacsDestination {
                    host,
                    port,
                    calling_ae,
                    called_ae,
                },
            };
            let transport = StorescuTransport::new(program, Duration::from_secs(timeout));
            info!("Sending study {} via {}", request.study.study_uid, transport.name());
            let outcome = transport.send(&request).await?;
            print_json(&outcome)?;
            if !outcome.success {
                bail!("transport failed with exit status {:?}", outcome.exit_status);
            }
        }
    }
    Ok(())
}

fn seeded_rng(config: &FabricatorConfig) -> StdRng {
    match config.rendering.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
