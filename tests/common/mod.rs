#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;

use geo_ingest::archive::{ArchiveCodec, TarGzCodec};
use geo_ingest::error::IngestError;
use geo_ingest::layout::Layout;
use geo_ingest::pipeline::{
    EventLevel, Pipeline, PipelineOptions, ProgressEvent, ProgressSink,
};
use geo_ingest::remote::RemoteFetch;

pub const ANNOTATION: &str = "Illumina, Inc.\n\
[Heading]\n\
Date\t10/5/2010\n\
ScannerName\tN0123\n\
[Probes]\n\
Species\tSource\tID\tDefinition\tSynonyms\tProbe_Sequence\tSymbol\n\
Homo sapiens\tRefSeq\tILMN_1\tdesc one\tsyn\tACGT\tTP53\n\
Homo sapiens\tRefSeq\tILMN_2\tdesc two\tsyn\tTTTT\tBRCA1\n\
[Controls]\n\
Probe_Id\tArray_Address_Id\tReporter_Group_Name\n\
ILMN_9\t123\thousekeeping\n\
[Columns]\n\
Name\tRowsCount\n";

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

pub fn write_tar(path: &Path, members: &[(String, Vec<u8>)]) {
    let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
    for (name, body) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_slice()).unwrap();
    }
    builder.into_inner().unwrap();
}

/// Serves a tar built from `members` for every URL.
#[derive(Default)]
pub struct TarFetch {
    pub members: Vec<(String, Vec<u8>)>,
    pub calls: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
}

impl TarFetch {
    pub fn new(members: Vec<(String, Vec<u8>)>) -> Self {
        Self {
            members,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteFetch for TarFetch {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        write_tar(destination, &self.members);
        Ok(())
    }
}

/// Writes arbitrary bytes as the archive.
pub struct BytesFetch(pub Vec<u8>);

impl RemoteFetch for BytesFetch {
    fn fetch(&self, _url: &str, destination: &Path) -> Result<(), IngestError> {
        fs::write(destination, &self.0).map_err(|err| IngestError::Filesystem(err.to_string()))
    }
}

pub struct FailingFetch;

impl RemoteFetch for FailingFetch {
    fn fetch(&self, _url: &str, _destination: &Path) -> Result<(), IngestError> {
        Err(IngestError::Transfer("connection refused".to_string()))
    }
}

/// Counts collaborator calls while delegating to the real codec.
#[derive(Default)]
pub struct CountingCodec {
    pub extracts: AtomicUsize,
    pub decompressions: AtomicUsize,
}

impl ArchiveCodec for CountingCodec {
    fn extract_all(&self, archive_path: &Path, target_dir: &Path) -> Result<(), IngestError> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        TarGzCodec.extract_all(archive_path, target_dir)
    }

    fn decompress(&self, gz_path: &Path, dest_path: &Path) -> Result<(), IngestError> {
        self.decompressions.fetch_add(1, Ordering::SeqCst);
        TarGzCodec.decompress(gz_path, dest_path)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.level == EventLevel::Warn)
            .map(|event| event.message.clone())
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn workspace() -> (tempfile::TempDir, Layout) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, Layout::new(root))
}

pub fn pipeline<F: RemoteFetch, A: ArchiveCodec>(
    layout: &Layout,
    fetcher: F,
    codec: A,
) -> (Pipeline<F, A>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let pipeline = Pipeline::new(
        layout.clone(),
        fetcher,
        codec,
        PipelineOptions::default(),
        sink.clone(),
    );
    (pipeline, sink)
}

/// Writes a truncated body and fails on the first call, then behaves like
/// `inner`.
pub struct FlakyFetch {
    pub inner: TarFetch,
    pub failures: AtomicUsize,
}

impl FlakyFetch {
    pub fn new(inner: TarFetch) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }
}

impl RemoteFetch for FlakyFetch {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), IngestError> {
        if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
            fs::write(destination, b"truncated").unwrap();
            return Err(IngestError::Transfer("connection reset".to_string()));
        }
        self.inner.fetch(url, destination)
    }
}
