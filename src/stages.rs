//! Stage bodies. Each one is safe to re-run over its own partial output.

use std::cell::RefCell;
use std::fs;
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};

use crate::archive::ArchiveCodec;
use crate::cleanup::remove_intermediates;
use crate::domain::{DatasetId, Stage};
use crate::error::IngestError;
use crate::layout::{Layout, member_stem};
use crate::pipeline::{EventLevel, PipelineOptions, ProgressEvent, ProgressSink};
use crate::prune::{find_probe_tables, trim_probe_table};
use crate::remote::{RemoteFetch, raw_archive_url};
use crate::section::parse_tables;
use crate::table::write_tables;

pub struct StageContext<'a> {
    pub id: &'a DatasetId,
    pub stage: Stage,
    pub layout: &'a Layout,
    pub fetcher: &'a dyn RemoteFetch,
    pub codec: &'a dyn ArchiveCodec,
    pub options: &'a PipelineOptions,
    sink: &'a dyn ProgressSink,
    warnings: RefCell<Vec<String>>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        id: &'a DatasetId,
        stage: Stage,
        layout: &'a Layout,
        fetcher: &'a dyn RemoteFetch,
        codec: &'a dyn ArchiveCodec,
        options: &'a PipelineOptions,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            id,
            stage,
            layout,
            fetcher,
            codec,
            options,
            sink,
            warnings: RefCell::new(Vec::new()),
        }
    }

    fn info(&self, message: String) {
        self.sink.event(ProgressEvent {
            dataset: self.id.clone(),
            stage: Some(self.stage),
            level: EventLevel::Info,
            message,
            elapsed: None,
        });
    }

    fn warn(&self, message: String) {
        self.sink.event(ProgressEvent {
            dataset: self.id.clone(),
            stage: Some(self.stage),
            level: EventLevel::Warn,
            message: message.clone(),
            elapsed: None,
        });
        self.warnings.borrow_mut().push(message);
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings.into_inner()
    }
}

pub fn run(ctx: &StageContext<'_>) -> Result<(), IngestError> {
    match ctx.stage {
        Stage::Download => download(ctx),
        Stage::Extract => extract(ctx),
        Stage::Process => process(ctx),
        Stage::Trim => trim(ctx),
        Stage::Cleanup => cleanup(ctx),
    }
}

fn create_dir(path: &Utf8Path) -> Result<(), IngestError> {
    fs::create_dir_all(path.as_std_path()).map_err(|err| IngestError::fs(format!("create {path}"), err))
}

fn download(ctx: &StageContext<'_>) -> Result<(), IngestError> {
    let archive = ctx.layout.raw_archive(ctx.id);
    let parent = archive
        .parent()
        .ok_or_else(|| IngestError::Filesystem(format!("no parent directory for {archive}")))?;
    create_dir(parent)?;
    let url = raw_archive_url(&ctx.options.remote_base_url, ctx.id);
    ctx.info(format!("downloading {url}"));

    // The archive is the download marker; it appears only once the fetch
    // succeeded. A failed fetch leaves nothing behind when `partial` drops.
    let partial = tempfile::Builder::new()
        .prefix(".geo-ingest-download")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| IngestError::fs(format!("temp file in {parent}"), err))?;
    ctx.fetcher.fetch(&url, partial.path())?;
    partial
        .persist(archive.as_std_path())
        .map_err(|err| IngestError::fs(format!("persist {archive}"), err.error))?;
    Ok(())
}

fn extract(ctx: &StageContext<'_>) -> Result<(), IngestError> {
    let archive = ctx.layout.raw_archive(ctx.id);
    let target = ctx.layout.extracted_dir(ctx.id);
    create_dir(&target)?;
    ctx.info(format!("extracting {archive}"));
    ctx.codec
        .extract_all(archive.as_std_path(), target.as_std_path())
}

/// Top-level `*.gz` members of the extracted archive, sorted by name.
/// Entries that cannot be read or named are reported and skipped.
fn compressed_members(
    ctx: &StageContext<'_>,
    dir: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, IngestError> {
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| IngestError::fs(format!("read {dir}"), err))?;
    let mut members = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                ctx.warn(format!("skipping unreadable entry in {dir}: {err}"));
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && path.extension() == Some("gz") {
            members.push(path.to_path_buf());
        }
    }
    members.sort();
    Ok(members)
}

fn process(ctx: &StageContext<'_>) -> Result<(), IngestError> {
    let input_dir = ctx.layout.extracted_dir(ctx.id);
    create_dir(&ctx.layout.processed_dir(ctx.id))?;

    let members = compressed_members(ctx, &input_dir)?;
    ctx.info(format!("processing {} compressed files", members.len()));
    let mut processed = 0usize;
    for member in &members {
        let Some(file_name) = member.file_name() else {
            continue;
        };
        if process_member(ctx, member, member_stem(file_name)) {
            processed += 1;
        }
    }
    ctx.info(format!("processed {processed} of {} files", members.len()));
    Ok(())
}

/// One file's failure is reported and skipped; returns whether it produced
/// output.
fn process_member(ctx: &StageContext<'_>, member: &Utf8Path, stem: &str) -> bool {
    let file_dir = ctx.layout.processed_file_dir(ctx.id, stem);
    let text_path = ctx.layout.decompressed_text(ctx.id, stem);
    let tables_dir = ctx.layout.tables_dir(ctx.id, stem);

    if let Err(err) = create_dir(&file_dir) {
        ctx.warn(format!("skipping {member}: {err}"));
        return false;
    }
    if let Err(err) = ctx
        .codec
        .decompress(member.as_std_path(), text_path.as_std_path())
    {
        ctx.warn(format!("failed to decompress {member}: {err}"));
        let _ = fs::remove_file(text_path.as_std_path());
        return false;
    }

    let parsed = fs::File::open(text_path.as_std_path())
        .map_err(|err| IngestError::fs(format!("open {text_path}"), err))
        .and_then(|file| parse_tables(BufReader::new(file), ctx.options.limits));
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            ctx.warn(format!("failed to parse {text_path}: {err}"));
            return false;
        }
    };
    for section in &parsed.empty {
        ctx.warn(format!("empty section {section} in {text_path}"));
    }

    match write_tables(&tables_dir, &parsed.tables) {
        Ok(count) => {
            tracing::debug!(file = %text_path, tables = count, "tables written");
            true
        }
        Err(err) => {
            ctx.warn(format!("failed to write tables for {text_path}: {err}"));
            false
        }
    }
}

fn trim(ctx: &StageContext<'_>) -> Result<(), IngestError> {
    let processed_dir = ctx.layout.processed_dir(ctx.id);
    let trimmed_dir = ctx.layout.trimmed_dir(ctx.id);
    create_dir(&trimmed_dir)?;

    let matches = find_probe_tables(&processed_dir, |skipped| {
        ctx.warn(format!("skipping probe table match: {skipped}"));
    })?;
    ctx.info(format!("trimming {} probe tables", matches.len()));
    for probes in &matches {
        if let Err(err) = trim_probe_table(probes, &processed_dir, &trimmed_dir) {
            ctx.warn(format!("failed to trim {probes}: {err}"));
        }
    }
    Ok(())
}

fn cleanup(ctx: &StageContext<'_>) -> Result<(), IngestError> {
    let processed_dir = ctx.layout.processed_dir(ctx.id);
    let report = remove_intermediates(processed_dir.as_std_path());
    ctx.info(format!(
        "removed {} intermediate files and {} empty directories",
        report.files_removed, report.dirs_removed
    ));
    Ok(())
}
