//! Parsing of verifier error reports.
//!
//! The verifier reports problems as
//! `<source>(<line>,<col>-<line>,<col>):<message>` with 1-based lines and
//! 0-based columns. Reports about the text fed through stdin use the source
//! name `<input>` and are relative to the start of the checked region.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::position::Position;
use crate::position::Range;

/// Source name the verifier uses for text received on stdin.
pub const CURRENT_BUFFER_SOURCE: &str = "<input>";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiagnosticSource {
    CurrentBuffer,
    File(String),
}

impl DiagnosticSource {
    pub fn from_name(name: &str) -> Self {
        if name == CURRENT_BUFFER_SOURCE {
            DiagnosticSource::CurrentBuffer
        } else {
            DiagnosticSource::File(name.to_string())
        }
    }
}

impl fmt::Display for DiagnosticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSource::CurrentBuffer => f.write_str(CURRENT_BUFFER_SOURCE),
            DiagnosticSource::File(name) => f.write_str(name),
        }
    }
}

/// One report exactly as printed, coordinates untranslated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDiagnostic {
    pub source: DiagnosticSource,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub message: String,
}

fn diagnostic_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^(]+)\((\d+),(\d+)-(\d+),(\d+)\):(.*)$").ok())
        .as_ref()
}

/// Parses a single output line, `None` when it is not a diagnostic.
pub fn parse_diagnostic_line(line: &str) -> Option<RawDiagnostic> {
    let caps = diagnostic_line_re()?.captures(line)?;
    let number = |index: usize| caps.get(index)?.as_str().parse::<u32>().ok();
    Some(RawDiagnostic {
        source: DiagnosticSource::from_name(caps.get(1)?.as_str()),
        start_line: number(2)?,
        start_column: number(3)?,
        end_line: number(4)?,
        end_column: number(5)?,
        message: caps.get(6)?.as_str().trim().to_string(),
    })
}

/// Extracts every diagnostic in `output`, in emission order.
pub fn parse_diagnostics(output: &str) -> Vec<RawDiagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let parsed = parse_diagnostic_line(line);
            if parsed.is_none() && !line.trim().is_empty() {
                tracing::trace!("not a diagnostic: {line}");
            }
            parsed
        })
        .collect()
}

/// A diagnostic with coordinates resolved for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub source: DiagnosticSource,
    pub start: Position,
    pub end: Position,
    pub message: String,
}

/// Where a diagnostic points, for jump-to-error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Buffer(Position),
    /// Another file. `line` is 0-based, `column` as reported.
    File {
        path: PathBuf,
        line: u32,
        column: u32,
    },
}

impl Diagnostic {
    /// Resolves a raw report against the start of the region that was checked.
    ///
    /// Current-buffer lines are offset by `base.line`. Columns are only offset
    /// by `base.column` on the region's first line, since every later line
    /// starts at column 0 of the document. This intentionally differs from
    /// translating both components by `base`, which would shift later lines
    /// right whenever the region starts mid-line. Reports about other files
    /// keep their raw coordinates.
    pub fn from_raw(raw: RawDiagnostic, base: Position) -> Self {
        let (mut start, mut end) = match raw.source {
            DiagnosticSource::CurrentBuffer => (
                map_point(raw.start_line, raw.start_column, base),
                map_point(raw.end_line, raw.end_column, base),
            ),
            DiagnosticSource::File(_) => (
                Position::new(raw.start_line, raw.start_column),
                Position::new(raw.end_line, raw.end_column),
            ),
        };
        if end < start {
            std::mem::swap(&mut start, &mut end);
        }
        if start == end {
            end.column += 1;
        }
        Self {
            source: raw.source,
            start,
            end,
            message: raw.message,
        }
    }

    pub fn range(&self) -> Range {
        Range {
            start: self.start,
            end: self.end,
        }
    }

    pub fn is_current_buffer(&self) -> bool {
        self.source == DiagnosticSource::CurrentBuffer
    }

    /// Navigation target. Relative file names resolve against
    /// `working_directory`, where the verifier was started.
    pub fn location(&self, working_directory: &Path) -> Location {
        match &self.source {
            DiagnosticSource::CurrentBuffer => Location::Buffer(self.start),
            DiagnosticSource::File(name) => Location::File {
                path: working_directory.join(name),
                line: self.start.line.saturating_sub(1),
                column: self.start.column,
            },
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({},{}-{},{}): {}",
            self.source,
            self.start.line,
            self.start.column,
            self.end.line,
            self.end.column,
            self.message
        )
    }
}

fn map_point(raw_line: u32, raw_column: u32, base: Position) -> Position {
    let line = raw_line.max(1);
    let column = if line == 1 {
        base.column.saturating_add(raw_column)
    } else {
        raw_column
    };
    Position::new(base.line.saturating_add(line - 1), column)
}

/// Parses `output` and resolves every diagnostic against `base`.
pub fn diagnostics_from_output(output: &str, base: Position) -> Vec<Diagnostic> {
    parse_diagnostics(output)
        .into_iter()
        .map(|raw| Diagnostic::from_raw(raw, base))
        .collect()
}
