//! URL list parsing
//!
//! One job per line. Blank lines and `#` comments are skipped, and a line
//! may carry several TAB-separated mirrors of the same resource, which is
//! the layout aria2 uses for its own input files. Anything that is not an
//! absolute `http`/`https` URL with a host is reported back as a skipped
//! line instead of failing the whole batch.

use crate::error::Result;
use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

/// Mirror separator within a single line
const MIRROR_SEPARATOR: char = '\t';

/// Result of parsing a URL list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedSources {
    /// Accepted jobs in input order, each a list of one or more mirror URLs
    pub groups: Vec<Vec<String>>,
    /// Lines that were rejected, with the reason
    pub skipped: Vec<SkippedLine>,
    /// Number of lines dropped because an identical entry was already accepted
    pub duplicates: usize,
}

impl ParsedSources {
    /// Number of accepted jobs
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no job was accepted
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of warnings worth telling the user about
    pub fn warning_count(&self) -> usize {
        self.skipped.len() + self.duplicates
    }
}

/// A rejected input line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number
    pub line: usize,
    /// Trimmed line content
    pub content: String,
    /// Why the line was not accepted
    pub reason: String,
}

/// Parse a URL list from any buffered reader
///
/// Parsing is deterministic: the same content always yields the same groups
/// in the same order. Only read errors are fatal; a line that is not valid
/// UTF-8 is skipped like any other invalid line.
pub fn parse_sources<R: BufRead>(mut reader: R) -> Result<ParsedSources> {
    let mut parsed = ParsedSources::default();
    let mut seen = HashSet::new();
    let mut buf = Vec::new();
    let mut line_no = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                let content = String::from_utf8_lossy(&buf).trim().to_string();
                tracing::warn!(line = line_no, error = %e, "skipping line that is not valid UTF-8");
                parsed.skipped.push(SkippedLine {
                    line: line_no,
                    content,
                    reason: "not valid UTF-8".to_string(),
                });
                continue;
            }
        };
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut mirrors = Vec::new();
        let mut rejected = Vec::new();
        for candidate in trimmed.split(MIRROR_SEPARATOR) {
            let candidate = candidate.trim();
            if candidate.is_empty() {
                continue;
            }
            match validate_url(candidate) {
                Ok(()) => mirrors.push(candidate.to_string()),
                Err(reason) => rejected.push(format!("{candidate}: {reason}")),
            }
        }

        if mirrors.is_empty() {
            let reason = rejected.join("; ");
            tracing::warn!(line = line_no, content = trimmed, %reason, "skipping invalid URL line");
            parsed.skipped.push(SkippedLine {
                line: line_no,
                content: trimmed.to_string(),
                reason,
            });
            continue;
        }

        for reason in &rejected {
            tracing::warn!(line = line_no, %reason, "ignoring invalid mirror");
        }

        let key = mirrors.join("\t");
        if !seen.insert(key) {
            tracing::warn!(line = line_no, url = %mirrors[0], "duplicate URL collapsed");
            parsed.duplicates += 1;
            continue;
        }

        parsed.groups.push(mirrors);
    }

    tracing::debug!(
        accepted = parsed.groups.len(),
        skipped = parsed.skipped.len(),
        duplicates = parsed.duplicates,
        "parsed URL list"
    );

    Ok(parsed)
}

/// Read a URL list from a file, or from stdin when `source` is `-`
pub fn read_sources(source: &str) -> Result<ParsedSources> {
    if source == "-" {
        let stdin = std::io::stdin();
        return parse_sources(stdin.lock());
    }

    let file = std::fs::File::open(Path::new(source))?;
    parse_sources(std::io::BufReader::new(file))
}

fn validate_url(candidate: &str) -> std::result::Result<(), String> {
    let url = url::Url::parse(candidate).map_err(|e| e.to_string())?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}'")),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err("missing host".to_string()),
    }
}
