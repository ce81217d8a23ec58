use fabricator_core::{FabricatorConfig, FabricatorError, GenerationParams, IdentifierKind, TagId};
use fabricator_dicom::{read_instance, wrap_text, CompositionRequest, StudyComposer, STUDY_MANIFEST, UTF8_CHARACTER_SET};
use fabricator_integration::OrderMessageParser;
use std::fs;
use std::path::Path;

const CHEST_ORDER: &str = "MSH|^~\\&|RIS|HOSPITAL|PACS|HOSPITAL|20250115103000||ORM^O01|MSG1|P|2.5\r\
PID|1||MRN555^^^HOSP^MR||DOE^JANE||19800101|F\r\
ORC|NW|PLACER1|\r\
OBR|1|PLACER1|ACC2025X1|XR001^Chest PA|||20250115103000\r\
OBR|2|PLACER1||XR002^Chest Lateral|||20250115\r";

fn test_config(root: &Path) -> FabricatorConfig {
    let mut config = FabricatorConfig::default();
    config.output.output_dir = root.join("output");
    config.output.state_dir = root.join("state");
    config.rendering.seed = Some(2025);
    config
}

fn params(series_count: u32, images: Vec<u32>) -> GenerationParams {
    GenerationParams {
        series_count,
        images_per_series: images,
        ..Default::default()
    }
}

fn visible_entries(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect()
}

#[test]
fn test_order_round_trip_produces_series_in_order() {
    let root = tempfile::tempdir().unwrap();
    let composer = StudyComposer::open(&test_config(root.path())).unwrap();
    let order = OrderMessageParser::new().parse(CHEST_ORDER).unwrap();

    let composed = composer
        .compose(&CompositionRequest::from_order(order, GenerationParams::default()))
        .unwrap();
    let study = &composed.study;

    assert_eq!(study.patient_id, "MRN555");
    assert_eq!(study.patient_name, "DOE^JANE");
    assert_eq!(study.accession_number, "ACC2025X1");
    assert_eq!(study.study_date.format("%Y%m%d").to_string(), "20250115");
    assert!(study.description.starts_with("Chest PA - Image: "));

    let descriptions: Vec<&str> = study.series.iter().map(|s| s.description.as_str()).collect();
    assert_eq!(descriptions, vec!["Chest PA", "Chest Lateral"]);
    assert_eq!(study.series[0].series_number, 1);
    assert_eq!(study.series[1].series_number, 2);
    assert_eq!(study.series[1].procedure_code, "XR002");

    let first = &study.series[0].instances[0].file_path;
    assert_eq!(
        first.strip_prefix(&composed.directory).unwrap(),
        Path::new("001_XR001").join("DX_S001_I001.dcm")
    );
    assert!(first.is_file());
    assert!(composed.directory.join(STUDY_MANIFEST).is_file());
    assert_eq!(composed.summary["total_images"], 2);
}

#[test]
fn test_rendered_values_match_stored_elements() {
    let root = tempfile::tempdir().unwrap();
    let composer = StudyComposer::open(&test_config(root.path())).unwrap();
    let mut request = params(2, vec![2]);
    request.patient_name = Some("DOE^JANE".to_string());
    request.study_description = Some("Chest".to_string());

    let composed = composer.compose(&CompositionRequest::manual(request)).unwrap();
    assert_eq!(composed.files.len(), 4);

    for series in &composed.study.series {
        for instance in &series.instances {
            let parsed = read_instance(&instance.file_path).unwrap();
            assert_eq!(parsed.sop_instance_uid, instance.sop_instance_uid);
            assert_eq!(parsed.pixel_data, instance.pixel_data);
            assert_eq!((parsed.rows, parsed.columns), (512, 512));
            for (tag, value) in &instance.tags {
                assert_eq!(parsed.get(*tag), Some(value.as_str()), "tag {}", tag);
            }
            assert_eq!(parsed.get(TagId(0x0008, 0x1030)), Some(composed.study.description.as_str()));
            assert_eq!(parsed.get(TagId(0x0020, 0x000E)), Some(series.series_uid.as_str()));
        }
    }
}

#[test]
fn test_uids_are_unique_valid_and_not_identifiers() {
    let root = tempfile::tempdir().unwrap();
    let composer = StudyComposer::open(&test_config(root.path())).unwrap();
    let composed = composer
        .compose(&CompositionRequest::manual(params(3, vec![1, 2, 3])))
        .unwrap();

    let uids = composed.study.all_uids();
    assert_eq!(uids.len(), 1 + 3 + 6);
    fabricator_dicom::validate_uids(&composed.study).unwrap();

    let allocator = composer.allocator();
    for uid in uids {
        for kind in IdentifierKind::ALL {
            assert!(!allocator.is_used(kind, uid).unwrap());
        }
    }
}

#[test]
fn test_maximum_study_succeeds_and_limit_is_enforced() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let composer = StudyComposer::open(&config).unwrap();

    let composed = composer.compose(&CompositionRequest::manual(params(9, vec![10]))).unwrap();
    assert_eq!(composed.study.series.len(), 9);
    assert_eq!(composed.study.instance_count(), 90);

    let result = composer.compose(&CompositionRequest::manual(params(10, vec![1])));
    assert!(matches!(result, Err(FabricatorError::GenerationLimitExceeded(_))));
    assert_eq!(visible_entries(&config.output.output_dir).len(), 1);
}

#[test]
fn test_duplicate_accession_leaves_nothing_on_disk() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let composer = StudyComposer::open(&config).unwrap();

    let mut request = params(1, vec![1]);
    request.accession = Some("ACC0001".to_string());
    composer.compose(&CompositionRequest::manual(request.clone())).unwrap();
    let before = visible_entries(&config.output.output_dir);

    let result = composer.compose(&CompositionRequest::manual(request));
    assert!(matches!(result, Err(FabricatorError::DuplicateAccession(ref a)) if a == "ACC0001"));
    assert_eq!(visible_entries(&config.output.output_dir), before);
}

#[test]
fn test_repeated_patient_counts_usage() {
    let root = tempfile::tempdir().unwrap();
    let composer = StudyComposer::open(&test_config(root.path())).unwrap();

    let mut request = params(1, vec![1]);
    request.patient_id = Some("PATIENT7".to_string());
    let first = composer.compose(&CompositionRequest::manual(request.clone())).unwrap();
    let second = composer.compose(&CompositionRequest::manual(request)).unwrap();

    assert_eq!(first.study.patient_id, second.study.patient_id);
    assert_eq!(first.study.patient_name, second.study.patient_name);
    assert_ne!(first.study.accession_number, second.study.accession_number);
    assert_eq!(composer.registry().lookup("PATIENT7").unwrap().study_count, 2);
}

#[test]
fn test_state_survives_reopening() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let first = {
        let composer = StudyComposer::open(&config).unwrap();
        composer.compose(&CompositionRequest::manual(params(1, vec![1]))).unwrap()
    };
    let composer = StudyComposer::open(&config).unwrap();
    let second = composer.compose(&CompositionRequest::manual(params(1, vec![1]))).unwrap();

    assert_ne!(first.study.accession_number, second.study.accession_number);
    assert_ne!(first.study.patient_id, second.study.patient_id);
    assert_eq!(composer.registry().stats().unwrap().total_patients, 2);
}

#[test]
fn test_non_ascii_patient_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let composer = StudyComposer::open(&test_config(root.path())).unwrap();
    let mut request = params(1, vec![1]);
    request.patient_id = Some("MUE01".to_string());
    request.patient_name = Some("MÜLLER^JOSÉ".to_string());

    let composed = composer.compose(&CompositionRequest::manual(request)).unwrap();
    let instance = &composed.study.series[0].instances[0];
    let parsed = read_instance(&instance.file_path).unwrap();

    assert_eq!(parsed.get(TagId(0x0008, 0x0005)), Some(UTF8_CHARACTER_SET));
    assert_eq!(parsed.get(TagId(0x0010, 0x0010)), Some("MÜLLER^JOSÉ"));
    assert_eq!(composed.study.patient_name, "MÜLLER^JOSÉ");

    // 图像上画的是同一个值
    let line = "(0010,0010) Patient Name: MÜLLER^JOSÉ";
    assert_eq!(wrap_text(line, 60, 12), vec![line.to_string()]);
    assert_eq!(instance.tags.get(&TagId(0x0010, 0x0010)).map(String::as_str), Some("MÜLLER^JOSÉ"));
}

#[test]
fn test_overlong_description_is_rejected_before_writing() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let composer = StudyComposer::open(&config).unwrap();

    let mut request = params(1, vec![1]);
    request.accession = Some("ACC-LONG".to_string());
    request.patient_id = Some("NEWPAT".to_string());
    request.study_description = Some("Chest radiograph two views ".repeat(40));

    let result = composer.compose(&CompositionRequest::manual(request));
    assert!(matches!(result, Err(FabricatorError::Validation(_))), "{:?}", result.err());
    assert!(visible_entries(&config.output.output_dir).is_empty());
    assert!(!composer.allocator().is_used(IdentifierKind::Accession, "ACC-LONG").unwrap());
    assert!(matches!(composer.registry().lookup("NEWPAT"), Err(FabricatorError::PatientNotFound(_))));
}

#[test]
fn test_failed_composition_leaves_patient_usage_unchanged() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let composer = StudyComposer::open(&config).unwrap();

    let mut request = params(1, vec![1]);
    request.patient_id = Some("PATIENT7".to_string());
    composer.compose(&CompositionRequest::manual(request.clone())).unwrap();
    let before = composer.registry().lookup("PATIENT7").unwrap();
    assert_eq!(before.study_count, 1);

    let mut too_long = request.clone();
    too_long.study_description = Some("Chest radiograph two views ".repeat(40));
    assert!(composer.compose(&CompositionRequest::manual(too_long)).is_err());

    // 输出目录被普通文件占用，暂存目录无法创建
    let blocked_path = root.path().join("blocked");
    fs::write(&blocked_path, b"not a directory").unwrap();
    let mut blocked = config.clone();
    blocked.output.output_dir = blocked_path;
    let blocked_composer = StudyComposer::open(&blocked).unwrap();
    assert!(blocked_composer.compose(&CompositionRequest::manual(request.clone())).is_err());

    let mut unknown = request;
    unknown.patient_id = Some("NEVER-STORED".to_string());
    assert!(blocked_composer.compose(&CompositionRequest::manual(unknown)).is_err());

    assert_eq!(composer.registry().lookup("PATIENT7").unwrap(), before);
    assert!(composer.registry().lookup("NEVER-STORED").is_err());
    assert_eq!(composer.registry().stats().unwrap().total_studies, 1);
}
