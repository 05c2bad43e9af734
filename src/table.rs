//! Structured tables built from section buffers, plus delimited-text I/O.

use std::collections::HashSet;
use std::fs;
use std::io;

use camino::Utf8Path;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::error::IngestError;

/// Section whose rows carry no header line.
pub const HEADING_SECTION: &str = "Heading";

pub const TAB: u8 = b'\t';

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row[index].as_str()).collect())
    }

    pub fn write_delimited(&self, path: &Utf8Path, delimiter: u8) -> Result<(), IngestError> {
        let mut buffer = Vec::new();
        {
            let mut writer = WriterBuilder::new()
                .delimiter(delimiter)
                .from_writer(&mut buffer);
            writer
                .write_record(&self.columns)
                .map_err(|err| IngestError::fs(format!("encode {path}"), err))?;
            for row in &self.rows {
                writer
                    .write_record(row)
                    .map_err(|err| IngestError::fs(format!("encode {path}"), err))?;
            }
            writer
                .flush()
                .map_err(|err| IngestError::fs(format!("encode {path}"), err))?;
        }
        crate::marker::write_bytes_atomic(path, &buffer)
    }

    pub fn read_delimited(
        path: &Utf8Path,
        delimiter: u8,
        has_header: bool,
    ) -> Result<Self, IngestError> {
        let file = fs::File::open(path.as_std_path())
            .map_err(|err| IngestError::fs(format!("open {path}"), err))?;
        let section = path.file_stem().unwrap_or(path.as_str());
        let records = read_records(io::BufReader::new(file), delimiter, section)?;
        if !has_header {
            return Ok(build_positional(records).unwrap_or_default());
        }
        let mut records = records.into_iter();
        let Some((_, header)) = records.next() else {
            return Ok(Table::default());
        };
        let columns = unique_columns(&header);
        let width = columns.len();
        let rows = records.map(|(_, record)| pad(record, width)).collect();
        Ok(Table { columns, rows })
    }
}

/// Turns one section's raw buffer into a table.
///
/// `Heading` is headerless; every other section takes its first row as the
/// header. `Ok(None)` means the buffer held no data rows.
pub fn materialize(section: &str, buffer: &str) -> Result<Option<Table>, IngestError> {
    let records = read_records(buffer.as_bytes(), TAB, section)?;
    if section == HEADING_SECTION {
        Ok(build_positional(records))
    } else {
        build_with_header(section, records)
    }
}

fn read_records<R: io::Read>(
    reader: R,
    delimiter: u8,
    section: &str,
) -> Result<Vec<(u64, StringRecord)>, IngestError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| IngestError::Parse {
            section: section.to_string(),
            message: err.to_string(),
        })?;
        if record.len() == 1 && record[0].is_empty() {
            continue;
        }
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        records.push((line, record));
    }
    Ok(records)
}

fn build_positional(records: Vec<(u64, StringRecord)>) -> Option<Table> {
    let width = records.iter().map(|(_, record)| record.len()).max()?;
    let rows = records
        .into_iter()
        .map(|(_, record)| pad(record, width))
        .collect();
    Some(Table {
        columns: (0..width).map(|index| index.to_string()).collect(),
        rows,
    })
}

fn build_with_header(
    section: &str,
    records: Vec<(u64, StringRecord)>,
) -> Result<Option<Table>, IngestError> {
    let mut records = records.into_iter();
    let Some((_, header)) = records.next() else {
        return Ok(None);
    };
    let columns = unique_columns(&header);
    let width = columns.len();

    let mut rows = Vec::new();
    for (line, record) in records {
        if record.len() > width {
            return Err(IngestError::Parse {
                section: section.to_string(),
                message: format!(
                    "line {line}: expected {width} fields, saw {}",
                    record.len()
                ),
            });
        }
        rows.push(pad(record, width));
    }
    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(Table { columns, rows }))
}

/// Repeated header names get a `.N` suffix so column names stay unique.
fn unique_columns(header: &StringRecord) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(header.len());
    for name in header.iter() {
        let mut candidate = name.to_string();
        let mut n = 1;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{name}.{n}");
            n += 1;
        }
        columns.push(candidate);
    }
    columns
}

fn pad(record: StringRecord, width: usize) -> Vec<String> {
    let mut row: Vec<String> = record.iter().map(str::to_string).collect();
    row.resize(width, String::new());
    row
}

/// Writes every table as `<section>.tsv` under `dir`.
pub fn write_tables<'a>(
    dir: &Utf8Path,
    tables: impl IntoIterator<Item = (&'a String, &'a Table)>,
) -> Result<usize, IngestError> {
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| IngestError::fs(format!("create {dir}"), err))?;
    let mut written = 0;
    for (section, table) in tables {
        let path = dir.join(format!("{}.tsv", crate::layout::section_file_name(section)));
        table.write_delimited(&path, TAB)?;
        written += 1;
    }
    Ok(written)
}
