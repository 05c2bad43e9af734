use camino::{Utf8Path, Utf8PathBuf};

use crate::error::IngestError;
use crate::layout::{TABLES_DIR, TRIMMED_PROBES_FILE};
use crate::table::{TAB, Table};

pub const PROBES_SECTION: &str = "Probes";

/// Annotation columns dropped from `Probes` tables.
pub const PROBE_DENY_LIST: [&str; 7] = [
    "Definition",
    "Ontology_Component",
    "Ontology_Process",
    "Ontology_Function",
    "Synonyms",
    "Obsolete_Probe_Id",
    "Probe_Sequence",
];

/// Removes deny-listed columns, keeping the rest in order. Deny-listed
/// names missing from the table are ignored.
pub fn prune(table: &Table) -> Table {
    let keep: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| !PROBE_DENY_LIST.contains(&name.as_str()))
        .map(|(index, _)| index)
        .collect();

    Table {
        columns: keep.iter().map(|&index| table.columns[index].clone()).collect(),
        rows: table
            .rows
            .iter()
            .map(|row| keep.iter().map(|&index| row[index].clone()).collect())
            .collect(),
    }
}

/// Every `Probes.tsv` under `processed_dir`, at any depth. Matches that
/// cannot be read or are not UTF-8 go to `on_skip` instead of failing the
/// search.
pub fn find_probe_tables<F>(
    processed_dir: &Utf8Path,
    mut on_skip: F,
) -> Result<Vec<Utf8PathBuf>, IngestError>
where
    F: FnMut(String),
{
    let pattern = format!(
        "{}/**/{PROBES_SECTION}.tsv",
        glob::Pattern::escape(processed_dir.as_str())
    );
    let paths = glob::glob(&pattern).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let mut found = Vec::new();
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                on_skip(err.to_string());
                continue;
            }
        };
        match Utf8PathBuf::from_path_buf(path) {
            Ok(path) if path.is_file() => found.push(path),
            Ok(_) => {}
            Err(path) => on_skip(format!("non-utf8 path {}", path.display())),
        }
    }
    found.sort();
    Ok(found)
}

/// Reads one `Probes.tsv`, prunes it and writes `Probes_trimmed.tsv` into
/// the mirrored per-file directory under `trimmed_dir`.
pub fn trim_probe_table(
    probes_path: &Utf8Path,
    processed_dir: &Utf8Path,
    trimmed_dir: &Utf8Path,
) -> Result<Utf8PathBuf, IngestError> {
    let mut relative = probes_path
        .parent()
        .and_then(|parent| parent.strip_prefix(processed_dir).ok())
        .ok_or_else(|| {
            IngestError::Filesystem(format!("{probes_path} is outside {processed_dir}"))
        })?;
    // `<file>/tables/Probes.tsv` trims to `<file>/Probes_trimmed.tsv`.
    if relative.file_name() == Some(TABLES_DIR) {
        relative = relative.parent().unwrap_or(relative);
    }
    let table = Table::read_delimited(probes_path, TAB, true)?;
    let output = trimmed_dir.join(relative).join(TRIMMED_PROBES_FILE);
    prune(&table).write_delimited(&output, TAB)?;
    Ok(output)
}
