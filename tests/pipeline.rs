mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;

use geo_ingest::archive::TarGzCodec;
use geo_ingest::domain::{DatasetId, Stage};
use geo_ingest::error::IngestError;
use geo_ingest::marker::Markers;
use geo_ingest::pipeline::StageAction;

use common::{
    ANNOTATION, BytesFetch, CountingCodec, FailingFetch, FlakyFetch, TarFetch, gzip, pipeline,
    workspace,
};

const PROBES_ONLY: &str = "[Probes]\nID\tDefinition\nILMN_5\tx\n";

fn gse() -> DatasetId {
    "GSE102902".parse().unwrap()
}

fn annotation_fetch() -> Arc<TarFetch> {
    Arc::new(TarFetch::new(vec![(
        "GSM1_annot.txt.gz".to_string(),
        gzip(ANNOTATION),
    )]))
}

#[test]
fn full_run_builds_tables_and_trims_probes() {
    let (_temp, layout) = workspace();
    let fetch = annotation_fetch();
    let (pipeline, _sink) = pipeline(&layout, fetch.clone(), TarGzCodec);
    let id = gse();

    let report = pipeline.execute_all(&id).unwrap();
    assert_eq!(report.executed(), Stage::ALL.to_vec());
    assert_eq!(
        fetch.urls.lock().unwrap().as_slice(),
        ["ftp://ftp.ncbi.nlm.nih.gov/geo/series/GSE102nnn/GSE102902/suppl/GSE102902_RAW.tar"]
    );

    let tables = layout.tables_dir(&id, "GSM1_annot.txt");
    assert!(tables.join("Probes.tsv").is_file());
    assert!(tables.join("Controls.tsv").is_file());
    assert!(!tables.join("Columns.tsv").exists());
    assert_eq!(
        fs::read_to_string(tables.join("Heading.tsv")).unwrap(),
        "0\t1\nDate\t10/5/2010\nScannerName\tN0123\n"
    );

    let trimmed = layout
        .trimmed_dir(&id)
        .join("GSM1_annot.txt")
        .join("Probes_trimmed.tsv");
    assert_eq!(
        fs::read_to_string(trimmed).unwrap(),
        "Species\tSource\tID\tSymbol\n\
         Homo sapiens\tRefSeq\tILMN_1\tTP53\n\
         Homo sapiens\tRefSeq\tILMN_2\tBRCA1\n"
    );

    assert!(!layout.decompressed_text(&id, "GSM1_annot.txt").exists());
    assert!(layout.raw_archive(&id).is_file());
    assert!(layout.extracted_dir(&id).join("GSM1_annot.txt.gz").is_file());

    let markers = Markers::new(layout.clone());
    for stage in Stage::ALL {
        assert!(markers.exists(&id, stage), "{stage} marker missing");
    }
}

#[test]
fn second_run_executes_nothing() {
    let (_temp, layout) = workspace();
    let fetch = annotation_fetch();
    let codec = Arc::new(CountingCodec::default());
    let (pipeline, _sink) = pipeline(&layout, fetch.clone(), codec.clone());
    let id = gse();

    pipeline.execute_all(&id).unwrap();
    let trimmed = layout.trimmed_dir(&id).join("GSM1_annot.txt/Probes_trimmed.tsv");
    let first = fs::read(&trimmed).unwrap();

    let again = pipeline.execute_all(&id).unwrap();
    assert!(again.executed().is_empty());
    assert!(
        again
            .stages
            .iter()
            .all(|report| report.action == StageAction::Skipped)
    );
    assert_eq!(fetch.calls(), 1);
    assert_eq!(codec.extracts.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read(&trimmed).unwrap(), first);
}

#[test]
fn deleted_marker_reruns_only_that_stage() {
    let (_temp, layout) = workspace();
    let fetch = annotation_fetch();
    let codec = Arc::new(CountingCodec::default());
    let (pipeline, _sink) = pipeline(&layout, fetch.clone(), codec.clone());
    let id = gse();
    pipeline.execute_all(&id).unwrap();

    let markers = Markers::new(layout.clone());
    markers.clear(&id, Stage::Process).unwrap();

    let report = pipeline.execute_all(&id).unwrap();
    assert_eq!(report.executed(), vec![Stage::Process]);
    assert_eq!(fetch.calls(), 1);
    assert_eq!(codec.extracts.load(Ordering::SeqCst), 1);
    assert!(markers.exists(&id, Stage::Process));
}

#[test]
fn reset_reruns_stage_and_successors() {
    let (_temp, layout) = workspace();
    let fetch = annotation_fetch();
    let (pipeline, _sink) = pipeline(&layout, fetch.clone(), TarGzCodec);
    let id = gse();
    pipeline.execute_all(&id).unwrap();

    let cleared = pipeline.reset(&id, Stage::Trim).unwrap();
    assert_eq!(cleared, vec![Stage::Trim, Stage::Cleanup]);

    let status = pipeline.status(&id);
    let complete: Vec<bool> = status.stages.iter().map(|stage| stage.complete).collect();
    assert_eq!(complete, vec![true, true, true, false, false]);

    assert!(layout.lock(&id, Stage::Trim).is_file());

    let report = pipeline.execute_all(&id).unwrap();
    assert_eq!(report.executed(), vec![Stage::Trim, Stage::Cleanup]);
    assert_eq!(fetch.calls(), 1);
}

#[test]
fn process_without_extract_marker_is_refused() {
    let (_temp, layout) = workspace();
    let (pipeline, _sink) = pipeline(&layout, annotation_fetch(), TarGzCodec);
    let id = gse();

    let err = pipeline.run_stage(&id, Stage::Process).unwrap_err();
    assert_matches!(
        err,
        IngestError::Dependency {
            stage: Stage::Process,
            predecessor: Stage::Extract,
            ..
        }
    );
    assert!(!layout.root().join("data/processed").exists());
}

#[test]
fn one_corrupt_member_does_not_fail_process() {
    let (_temp, layout) = workspace();
    let fetch = Arc::new(TarFetch::new(vec![
        ("GSM1.txt.gz".to_string(), gzip(PROBES_ONLY)),
        ("GSM2.txt.gz".to_string(), b"this is not gzip".to_vec()),
        ("GSM3.txt.gz".to_string(), gzip(PROBES_ONLY)),
    ]));
    let (pipeline, sink) = pipeline(&layout, fetch, TarGzCodec);
    let id = gse();

    let report = pipeline.execute_until(&id, Stage::Process).unwrap();
    let process = report.stages.last().unwrap();
    assert_eq!(process.stage, Stage::Process);
    assert_eq!(process.action, StageAction::Executed);
    assert_eq!(process.warnings.len(), 1);
    assert!(process.warnings[0].contains("GSM2.txt.gz"));
    assert_eq!(sink.warnings(), process.warnings);

    assert!(Markers::new(layout.clone()).exists(&id, Stage::Process));
    assert!(layout.tables_dir(&id, "GSM1.txt").join("Probes.tsv").is_file());
    assert!(layout.tables_dir(&id, "GSM3.txt").join("Probes.tsv").is_file());
    assert!(!layout.tables_dir(&id, "GSM2.txt").join("Probes.tsv").exists());
}

#[test]
fn unparseable_member_is_skipped() {
    let (_temp, layout) = workspace();
    let fetch = Arc::new(TarFetch::new(vec![
        ("GSM1.txt.gz".to_string(), gzip("[Probes]\nID\n1\t2\t3\n")),
        ("GSM2.txt.gz".to_string(), gzip(ANNOTATION)),
    ]));
    let (pipeline, _sink) = pipeline(&layout, fetch, TarGzCodec);
    let id = gse();

    let report = pipeline.execute_all(&id).unwrap();
    let process = &report.stages[2];
    assert_eq!(process.stage, Stage::Process);
    assert!(
        process
            .warnings
            .iter()
            .any(|warning| warning.starts_with("failed to parse") && warning.contains("GSM1.txt"))
    );
    assert!(
        process
            .warnings
            .iter()
            .any(|warning| warning.contains("empty section Columns"))
    );
    assert!(
        layout
            .trimmed_dir(&id)
            .join("GSM2.txt/Probes_trimmed.tsv")
            .is_file()
    );
}

#[test]
fn download_failure_is_fatal() {
    let (_temp, layout) = workspace();
    let (pipeline, sink) = pipeline(&layout, FailingFetch, TarGzCodec);
    let id = gse();

    let err = pipeline.execute_all(&id).unwrap_err();
    assert_matches!(
        &err,
        IngestError::Stage { stage: Stage::Download, source, .. }
            if matches!(**source, IngestError::Transfer(_))
    );
    assert!(err.to_string().contains("GSE102902"));
    assert!(!layout.raw_archive(&id).exists());
    assert!(!layout.extracted_dir(&id).exists());
    assert_eq!(sink.warnings().len(), 1);
}

#[test]
fn interrupted_download_leaves_no_archive() {
    let (_temp, layout) = workspace();
    let fetch = Arc::new(FlakyFetch::new(TarFetch::new(vec![(
        "GSM1_annot.txt.gz".to_string(),
        gzip(ANNOTATION),
    )])));
    let (pipeline, _sink) = pipeline(&layout, fetch.clone(), TarGzCodec);
    let id = gse();

    let err = pipeline.execute_all(&id).unwrap_err();
    assert_matches!(
        &err,
        IngestError::Stage { stage: Stage::Download, source, .. }
            if matches!(**source, IngestError::Transfer(_))
    );
    assert!(!Markers::new(layout.clone()).exists(&id, Stage::Download));
    let raw_dir = layout.raw_archive(&id).parent().unwrap().to_path_buf();
    assert_eq!(fs::read_dir(&raw_dir).unwrap().count(), 0);

    let report = pipeline.execute_all(&id).unwrap();
    assert_eq!(report.executed(), Stage::ALL.to_vec());
    assert_eq!(fetch.inner.calls(), 1);
}

#[cfg(unix)]
#[test]
fn non_utf8_entry_does_not_fail_process() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use geo_ingest::archive::ArchiveCodec;

    struct OddNameCodec;

    impl ArchiveCodec for OddNameCodec {
        fn extract_all(&self, archive_path: &Path, target_dir: &Path) -> Result<(), IngestError> {
            TarGzCodec.extract_all(archive_path, target_dir)?;
            let odd = target_dir.join(OsStr::from_bytes(b"notes_\xff.txt"));
            fs::write(odd, "x").unwrap();
            Ok(())
        }

        fn decompress(&self, gz_path: &Path, dest_path: &Path) -> Result<(), IngestError> {
            TarGzCodec.decompress(gz_path, dest_path)
        }
    }

    let (_temp, layout) = workspace();
    let (pipeline, _sink) = pipeline(&layout, annotation_fetch(), OddNameCodec);
    let id = gse();

    let report = pipeline.execute_until(&id, Stage::Process).unwrap();
    let process = report.stages.last().unwrap();
    assert!(
        process
            .warnings
            .iter()
            .any(|warning| warning.starts_with("skipping unreadable entry"))
    );
    assert!(
        layout
            .tables_dir(&id, "GSM1_annot.txt")
            .join("Probes.tsv")
            .is_file()
    );
}

#[test]
fn corrupt_archive_stops_at_extract() {
    let (_temp, layout) = workspace();
    let (pipeline, _sink) = pipeline(&layout, BytesFetch(vec![b'A'; 1024]), TarGzCodec);
    let id = gse();

    let err = pipeline.execute_all(&id).unwrap_err();
    assert_matches!(
        &err,
        IngestError::Stage { stage: Stage::Extract, source, .. }
            if matches!(**source, IngestError::Archive(_))
    );
    let markers = Markers::new(layout.clone());
    assert!(markers.exists(&id, Stage::Download));
    assert!(!markers.exists(&id, Stage::Extract));
    assert!(!layout.processed_dir(&id).exists());
}

#[test]
fn held_lock_blocks_same_stage() {
    let (_temp, layout) = workspace();
    let (pipeline, _sink) = pipeline(&layout, annotation_fetch(), TarGzCodec);
    let id = gse();

    let markers = Markers::new(layout.clone());
    let held = markers.lock(&id, Stage::Download, Duration::ZERO).unwrap();
    assert_matches!(
        pipeline.run_stage(&id, Stage::Download),
        Err(IngestError::StageLocked { stage: Stage::Download, .. })
    );
    drop(held);
    pipeline.run_stage(&id, Stage::Download).unwrap();
}

#[test]
fn distinct_datasets_run_concurrently() {
    let (_temp, layout) = workspace();
    let fetch = annotation_fetch();
    let (pipeline, _sink) = pipeline(&layout, fetch.clone(), TarGzCodec);
    let ids: Vec<DatasetId> = ["GSE1000", "GSE2000", "GSE3000"]
        .iter()
        .map(|id| id.parse().unwrap())
        .collect();

    std::thread::scope(|scope| {
        for id in &ids {
            let pipeline = &pipeline;
            scope.spawn(move || pipeline.execute_all(id).unwrap());
        }
    });

    assert_eq!(fetch.calls(), 3);
    for id in &ids {
        assert!(
            layout
                .trimmed_dir(id)
                .join("GSM1_annot.txt/Probes_trimmed.tsv")
                .is_file()
        );
    }
}

#[test]
fn same_dataset_never_runs_a_stage_twice() {
    let (_temp, layout) = workspace();
    let fetch = annotation_fetch();
    let codec = Arc::new(CountingCodec::default());
    let (pipeline, _sink) = pipeline(&layout, fetch.clone(), codec.clone());
    let id = gse();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| pipeline.execute_all(&id)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });
    for result in &results {
        if let Err(err) = result {
            assert_matches!(err, IngestError::StageLocked { .. });
        }
    }

    pipeline.execute_all(&id).unwrap();
    assert_eq!(fetch.calls(), 1);
    assert_eq!(codec.extracts.load(Ordering::SeqCst), 1);
}
