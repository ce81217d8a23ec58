//! 检查传输模块
//!
//! 生成结果通过 [`StudyTransport`] 交给外部系统。默认实现调用 DCMTK 的 `storescu`。

use async_trait::async_trait;
use fabricator_core::{FabricatorError, PacsDestination, Result, Study, TransportOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// 传输请求
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub study: Arc<Study>,
    pub study_dir: PathBuf,
    pub destination: PacsDestination,
}

/// 检查传输接口
#[async_trait]
pub trait StudyTransport: Send + Sync {
    /// 传输名称
    fn name(&self) -> &str;

    /// 发送检查
    async fn send(&self, request: &TransportRequest) -> Result<TransportOutcome>;
}

/// storescu 传输
#[derive(Debug, Clone)]
pub struct StorescuTransport {
    program: PathBuf,
    timeout: Duration,
}

impl Default for StorescuTransport {
    fn default() -> Self {
        Self {
            program: PathBuf::from("storescu"),
            timeout: Duration::from_secs(60),
        }
    }
}

impl StorescuTransport {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// 构造命令行参数：`-aet <calling> -aec <called> <host> <port> <files...>`
    pub fn arguments(&self, request: &TransportRequest) -> Result<Vec<String>> {
        let destination = &request.destination;
        if destination.host.trim().is_empty() {
            return Err(FabricatorError::Transport("destination host is empty".to_string()));
        }

        let files = collect_dicom_files(&request.study_dir)?;
        if files.is_empty() {
            return Err(FabricatorError::Transport(format!(
                "no DICOM files found in {:?}",
                request.study_dir
            )));
        }

        let mut args = vec![
            "-aet".to_string(),
            destination.calling_ae.clone(),
            "-aec".to_string(),
            destination.called_ae.clone(),
            destination.host.clone(),
            destination.port.to_string(),
        ];
        args.extend(files.iter().map(|f| f.to_string_lossy().to_string()));
        Ok(args)
    }
}

#[async_trait]
impl StudyTransport for StorescuTransport {
    fn name(&self) -> &str {
        "storescu"
    }

    async fn send(&self, request: &TransportRequest) -> Result<TransportOutcome> {
        let args = self.arguments(request)?;
        info!(
            "Sending study {} ({} instances) to {}@{}:{}",
            request.study.study_uid,
            request.study.instance_count(),
            request.destination.called_ae,
            request.destination.host,
            request.destination.port
        );
        debug!("{:?} {}", self.program, args.join(" "));

        let run = Command::new(&self.program).args(&args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| FabricatorError::Transport(format!("{:?} timed out after {:?}", self.program, self.timeout)))?
            .map_err(|e| FabricatorError::Transport(format!("failed to execute {:?}: {}", self.program, e)))?;

        let mut captured_output = String::from_utf8_lossy(&output.stdout).to_string();
        captured_output.push_str(&String::from_utf8_lossy(&output.stderr));

        let outcome = TransportOutcome {
            success: output.status.success(),
            exit_status: output.status.code(),
            captured_output,
        };
        if outcome.success {
            info!("Study {} sent", request.study.study_uid);
        } else {
            error!(
                "{:?} exited with {:?} for study {}",
                self.program, outcome.exit_status, request.study.study_uid
            );
        }
        Ok(outcome)
    }
}

/// 递归收集 `.dcm` 文件（按路径排序）
pub fn collect_dicom_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter() {
        let entry = entry.map_err(|e| FabricatorError::Transport(format!("failed to walk {:?}: {}", dir, e)))?;
        let is_dicom = entry
            .path()
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("dcm"))
            .unwrap_or(false);
        if entry.file_type().is_file() && is_dicom {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::fs;

    fn request(dir: &Path) -> TransportRequest {
        let study = Study {
            study_uid: "1.2.3".to_string(),
            accession_number: "ACC1".to_string(),
            patient_id: "P1".to_string(),
            patient_name: "DOE^JANE".to_string(),
            description: "Test".to_string(),
            study_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            study_time: NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            study_id: "STU0001".to_string(),
            referring_physician: "TEST^DOCTOR".to_string(),
            directory: dir.to_path_buf(),
            series: Vec::new(),
        };
        TransportRequest {
            study: Arc::new(study),
            study_dir: dir.to_path_buf(),
            destination: PacsDestination {
                host: "pacs.local".to_string(),
                port: 104,
                calling_ae: "FABRICATOR".to_string(),
                called_ae: "ORTHANC".to_string(),
            },
        }
    }

    fn study_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("002_LAT")).unwrap();
        fs::create_dir_all(dir.path().join("001_PA")).unwrap();
        fs::write(dir.path().join("002_LAT/DX_S002_I001.dcm"), b"x").unwrap();
        fs::write(dir.path().join("001_PA/DX_S001_I001.dcm"), b"x").unwrap();
        fs::write(dir.path().join("study.json"), b"{}").unwrap();
        dir
    }

    #[test]
    fn test_arguments() {
        let dir = study_dir();
        let args = StorescuTransport::default().arguments(&request(dir.path())).unwrap();

        assert_eq!(&args[..6], &["-aet", "FABRICATOR", "-aec", "ORTHANC", "pacs.local", "104"]);
        assert_eq!(args.len(), 8);
        assert!(args[6].ends_with("DX_S001_I001.dcm"));
        assert!(args[7].ends_with("DX_S002_I001.dcm"));
    }

    #[test]
    fn test_collect_skips_other_files() {
        let dir = study_dir();
        fs::create_dir_all(dir.path().join("001_PA/nested")).unwrap();
        fs::write(dir.path().join("001_PA/nested/DX_S001_I002.DCM"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("003_DIR.dcm")).unwrap();

        let files = collect_dicom_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            names,
            vec!["001_PA/DX_S001_I001.dcm", "001_PA/nested/DX_S001_I002.DCM", "002_LAT/DX_S002_I001.dcm"]
        );
    }

    #[test]
    fn test_missing_dir_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = collect_dicom_files(&dir.path().join("absent"));
        assert!(matches!(result, Err(FabricatorError::Transport(_))));
    }

    #[test]
    fn test_empty_study_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = StorescuTransport::default().arguments(&request(dir.path()));
        assert!(matches!(result, Err(FabricatorError::Transport(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_captures_output() {
        let dir = study_dir();
        let transport = StorescuTransport::new("echo", Duration::from_secs(5));
        let outcome = transport.send(&request(dir.path())).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.exit_status, Some(0));
        assert!(outcome.captured_output.contains("-aec ORTHANC pacs.local 104"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_reports_failure_status() {
        let dir = study_dir();
        let transport = StorescuTransport::new("false", Duration::from_secs(5));
        let outcome = transport.send(&request(dir.path())).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_status, Some(1));
    }

    #[tokio::test]
    async fn test_missing_program_is_transport_error() {
        let dir = study_dir();
        let transport = StorescuTransport::new("/nonexistent/storescu", Duration::from_secs(5));
        let result = transport.send(&request(dir.path())).await;
        assert!(matches!(result, Err(FabricatorError::Transport(_))));
    }
}
