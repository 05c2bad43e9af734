//! Streaming splitter for bracket-sectioned annotation files.
//!
//! A file looks like
//!
//! ```text
//! [Heading]
//! Date	10/5/2010
//! [Probes]
//! ID	Gene
//! ILMN_1	TP53
//! ```
//!
//! Lines before the first `[name]` header are ignored. Only the section
//! currently being read is held in memory.

use std::collections::BTreeMap;
use std::io::BufRead;

use crate::error::IngestError;
use crate::table::{Table, materialize};

pub const DEFAULT_MAX_SECTION_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_section_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_section_bytes: DEFAULT_MAX_SECTION_BYTES,
        }
    }
}

/// A finalized section: its name and the trimmed lines seen under it, each
/// terminated by `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection {
    pub name: String,
    pub buffer: String,
}

#[derive(Debug)]
enum State {
    Idle,
    InSection { name: String, buffer: String },
}

#[derive(Debug)]
pub struct SectionParser {
    state: State,
    limits: ParserLimits,
}

impl SectionParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            state: State::Idle,
            limits,
        }
    }

    /// Feeds one line. Returns the section closed by a header line, if any.
    pub fn push_line(&mut self, line: &str) -> Result<Option<RawSection>, IngestError> {
        let line = line.trim();
        if line.starts_with('[') {
            let finished = self.take_active();
            let name = line.trim_start_matches('[').trim_end_matches(']');
            // `[]` names nothing; its lines are dropped like preamble.
            if !name.is_empty() {
                self.state = State::InSection {
                    name: name.to_string(),
                    buffer: String::new(),
                };
            }
            return Ok(finished);
        }

        if let State::InSection { name, buffer } = &mut self.state {
            if buffer.len() + line.len() + 1 > self.limits.max_section_bytes {
                return Err(IngestError::Parse {
                    section: name.clone(),
                    message: format!(
                        "section exceeds {} bytes",
                        self.limits.max_section_bytes
                    ),
                });
            }
            buffer.push_str(line);
            buffer.push('\n');
        }
        Ok(None)
    }

    /// Closes the active section at end of input.
    pub fn finish(mut self) -> Option<RawSection> {
        self.take_active()
    }

    fn take_active(&mut self) -> Option<RawSection> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::InSection { name, buffer } if !buffer.is_empty() => {
                Some(RawSection { name, buffer })
            }
            _ => None,
        }
    }
}

/// Streams `reader` and calls `on_section` for every non-empty section in
/// file order. Invalid UTF-8 is replaced rather than rejected.
pub fn for_each_section<R, F>(
    mut reader: R,
    limits: ParserLimits,
    mut on_section: F,
) -> Result<(), IngestError>
where
    R: BufRead,
    F: FnMut(RawSection) -> Result<(), IngestError>,
{
    let mut parser = SectionParser::new(limits);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let read = reader
            .read_until(b'\n', &mut raw)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        if let Some(section) = parser.push_line(&line)? {
            on_section(section)?;
        }
    }
    if let Some(section) = parser.finish() {
        on_section(section)?;
    }
    Ok(())
}

/// Collects every section as raw lines. A repeated name replaces the
/// earlier section.
pub fn parse_sections<R: BufRead>(
    reader: R,
    limits: ParserLimits,
) -> Result<BTreeMap<String, Vec<String>>, IngestError> {
    let mut sections = BTreeMap::new();
    for_each_section(reader, limits, |section| {
        let lines = section.buffer.lines().map(str::to_string).collect();
        sections.insert(section.name, lines);
        Ok(())
    })?;
    Ok(sections)
}

/// Tables recovered from one file.
#[derive(Debug, Default)]
pub struct SectionTables {
    pub tables: BTreeMap<String, Table>,
    /// Sections that had content but no data rows.
    pub empty: Vec<String>,
}

/// Splits `reader` into sections and materializes each one. The last
/// section with a given name wins.
pub fn parse_tables<R: BufRead>(
    reader: R,
    limits: ParserLimits,
) -> Result<SectionTables, IngestError> {
    let mut out = SectionTables::default();
    for_each_section(reader, limits, |section| {
        match materialize(&section.name, &section.buffer)? {
            Some(table) => {
                out.tables.insert(section.name, table);
            }
            None => out.empty.push(section.name),
        }
        Ok(())
    })?;
    Ok(out)
}
