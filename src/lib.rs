//! # covermerge
//!
//! A self-contained Rust library for merging Go cover profiles produced by
//! independent test runs of the same codebase into one consolidated report.
//!
//! A build pipeline can run tests in parallel shards (by package, by test
//! tag, by machine), collect one cover profile per shard, and recombine them
//! here into a single, accurate picture of which code paths executed across
//! the whole suite. Two steps are used in sequence:
//!
//! 1. [`concatenate`] — the textual union of all input profiles, gated on a
//!    single counting mode shared by every input.
//! 2. [`merge`] — parse the concatenated profile, coalesce records that
//!    describe the identical source span, and re-emit a deterministic,
//!    minimal profile.
//!
//! ## References
//!
//! - Cover profile format: <https://pkg.go.dev/golang.org/x/tools/cover>
//!
//! ## Example Usage
//!
//! ```no_run
//! let intermediate =
//!     covermerge::concatenate_to_temp_file(&["shard1.txt", "shard2.txt"]).unwrap();
//! covermerge::merge_files(intermediate.path(), "coverage.txt").unwrap();
//! ```

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use tempfile::NamedTempFile;

/// A specialized `Result` type for covermerge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while concatenating or merging profiles.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred while reading or writing.
    Io(io::Error),
    /// A mode line is missing, malformed, or names an unknown counting mode.
    InvalidMode(String),
    /// A coverage record line is malformed.
    InvalidRecord(String),
    /// Two input profiles declare different counting modes.
    ModeConflict {
        expected: String,
        found: String,
        file: String,
    },
    /// Two records for the identical source span disagree on the number of
    /// statements it covers.
    StmtCountMismatch {
        file: String,
        span: String,
        left: u32,
        right: u32,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidMode(msg) => write!(f, "Invalid mode: {msg}"),
            Error::InvalidRecord(msg) => write!(f, "Invalid record: {msg}"),
            Error::ModeConflict {
                expected,
                found,
                file,
            } => write!(
                f,
                "Cannot merge profiles of different modes '{expected}' and '{found}' (coming from '{file}')"
            ),
            Error::StmtCountMismatch {
                file,
                span,
                left,
                right,
            } => write!(
                f,
                "Inconsistent statement counts for {file}:{span}: {left} vs {right}"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Constants used throughout the library.
mod consts {
    pub(crate) const MODE_PREFIX: &str = "mode: ";
}

/// The counting mode declared once per profile, governing the semantics of
/// each record's execution count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountingMode {
    /// Boolean semantics: did this range execute at all.
    Set,
    /// Raw execution count.
    Count,
    /// Execution count under concurrency-safe instrumentation.
    Atomic,
}

impl CountingMode {
    /// Combines two execution counts for the identical source span.
    ///
    /// `set` ORs the counts (did this range ever execute, anywhere); `count`
    /// and `atomic` sum them (total executions across all merged runs).
    pub fn combine(self, a: u64, b: u64) -> u64 {
        match self {
            CountingMode::Set => u64::from(a != 0 || b != 0),
            CountingMode::Count | CountingMode::Atomic => a.saturating_add(b),
        }
    }
}

impl FromStr for CountingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "set" => Ok(CountingMode::Set),
            "count" => Ok(CountingMode::Count),
            "atomic" => Ok(CountingMode::Atomic),
            other => Err(Error::InvalidMode(format!(
                "unknown counting mode '{other}'"
            ))),
        }
    }
}

impl Display for CountingMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            CountingMode::Set => "set",
            CountingMode::Count => "count",
            CountingMode::Atomic => "atomic",
        };
        write!(f, "{name}")
    }
}

/// One coverage record: a half-open source range, the number of statements
/// it covers, and how many times it executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageBlock {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    /// Number of source statements in the range. Static per span; records
    /// for the same span from different inputs must agree on it.
    pub num_stmt: u32,
    /// Execution count, or 1/0 under `set` mode.
    pub count: u64,
}

impl CoverageBlock {
    /// Returns the span ordering key. Two blocks describe the same source
    /// span iff their keys are equal.
    pub fn span(&self) -> (u32, u32, u32, u32) {
        (self.start_line, self.start_col, self.end_line, self.end_col)
    }

    /// Checks whether both blocks describe the identical source span.
    pub fn same_span(&self, other: &CoverageBlock) -> bool {
        self.span() == other.span()
    }

    fn span_text(&self) -> String {
        format!(
            "{}.{},{}.{}",
            self.start_line, self.start_col, self.end_line, self.end_col
        )
    }
}

/// All coverage blocks belonging to one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProfile {
    pub file_name: String,
    pub blocks: Vec<CoverageBlock>,
}

/// A parsed cover profile: one counting mode plus the per-file block lists,
/// files kept in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageProfile {
    pub mode: CountingMode,
    pub files: Vec<FileProfile>,
}

impl CoverageProfile {
    /// Coalesces duplicate spans within each file.
    ///
    /// Blocks are sorted by span; adjacent blocks with the identical span are
    /// folded into one, combining their counts per the counting mode. Records
    /// that merely overlap without matching exactly are left untouched, since
    /// well-formed instrumentation emits canonical statement-granular ranges.
    ///
    /// # Errors
    /// Returns `StmtCountMismatch` if two records for the same span disagree
    /// on `num_stmt`.
    pub fn coalesce(&mut self) -> Result<()> {
        let mode = self.mode;
        for file in &mut self.files {
            file.blocks.sort_by_key(CoverageBlock::span);
            let mut merged: Vec<CoverageBlock> = Vec::with_capacity(file.blocks.len());
            for block in std::mem::take(&mut file.blocks) {
                match merged.last_mut() {
                    Some(last) if last.same_span(&block) => {
                        if last.num_stmt != block.num_stmt {
                            return Err(Error::StmtCountMismatch {
                                file: file.file_name.clone(),
                                span: block.span_text(),
                                left: last.num_stmt,
                                right: block.num_stmt,
                            });
                        }
                        last.count = mode.combine(last.count, block.count);
                    }
                    _ => merged.push(block),
                }
            }
            file.blocks = merged;
        }
        Ok(())
    }

    /// Returns the total number of blocks across all files.
    pub fn num_blocks(&self) -> usize {
        self.files.iter().map(|f| f.blocks.len()).sum()
    }
}

/// Parses a cover profile from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<CoverageProfile> {
    from_reader(File::open(path)?)
}

/// Parses a cover profile from any reader.
///
/// The first non-blank line must be `mode: <set|count|atomic>`; every
/// subsequent non-blank line must be a record of the form
/// `<path>:<startLine>.<startCol>,<endLine>.<endCol> <numStmt> <count>`.
/// Blocks are grouped by file path in first-seen order; no coalescing is
/// performed here.
pub fn from_reader<R: Read>(reader: R) -> Result<CoverageProfile> {
    let reader = BufReader::new(reader);
    let mut mode: Option<CountingMode> = None;
    let mut files: Vec<FileProfile> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if mode.is_none() {
            let name = line
                .strip_prefix(consts::MODE_PREFIX)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| Error::InvalidMode(format!("bad mode line: {line}")))?;
            mode = Some(name.parse()?);
            continue;
        }
        let (file_name, block) = parse_record(line)?;
        let slot = match index.get(&file_name) {
            Some(&slot) => slot,
            None => {
                index.insert(file_name.clone(), files.len());
                files.push(FileProfile {
                    file_name,
                    blocks: Vec::new(),
                });
                files.len() - 1
            }
        };
        files[slot].blocks.push(block);
    }

    let mode = mode.ok_or_else(|| Error::InvalidMode("missing mode line".to_string()))?;
    Ok(CoverageProfile { mode, files })
}

fn parse_record(line: &str) -> Result<(String, CoverageBlock)> {
    let malformed = || Error::InvalidRecord(format!("malformed record line: {line}"));

    let mut fields = line.split_whitespace();
    let position = fields.next().ok_or_else(malformed)?;
    let num_stmt = fields.next().ok_or_else(malformed)?;
    let count = fields.next().ok_or_else(malformed)?;
    if fields.next().is_some() {
        return Err(malformed());
    }

    // Split on the last ':' so file paths containing colons survive.
    let (file_name, span) = position.rsplit_once(':').ok_or_else(malformed)?;
    let (start, end) = span.split_once(',').ok_or_else(malformed)?;
    let (start_line, start_col) = start.split_once('.').ok_or_else(malformed)?;
    let (end_line, end_col) = end.split_once('.').ok_or_else(malformed)?;

    let parse_u32 = |s: &str| s.parse::<u32>().map_err(|_| malformed());

    let block = CoverageBlock {
        start_line: parse_u32(start_line)?,
        start_col: parse_u32(start_col)?,
        end_line: parse_u32(end_line)?,
        end_col: parse_u32(end_col)?,
        num_stmt: parse_u32(num_stmt)?,
        count: count.parse::<u64>().map_err(|_| malformed())?,
    };
    Ok((file_name.to_string(), block))
}

/// Writes a cover profile to a file path.
pub fn to_file<P: AsRef<Path>>(profile: &CoverageProfile, path: P) -> Result<()> {
    to_writer(profile, &mut File::create(path)?)
}

/// Writes a cover profile to any writer.
///
/// Emits exactly one mode line, then one line per block, files in their
/// stored order and blocks in their stored order, so the output is
/// byte-for-byte deterministic for a given profile.
pub fn to_writer<W: Write>(profile: &CoverageProfile, writer: &mut W) -> Result<()> {
    writeln!(writer, "{}{}", consts::MODE_PREFIX, profile.mode)?;
    for file in &profile.files {
        for b in &file.blocks {
            writeln!(
                writer,
                "{}:{}.{},{}.{} {} {}",
                file.file_name, b.start_line, b.start_col, b.end_line, b.end_col, b.num_stmt, b.count
            )?;
        }
    }
    Ok(())
}

/// Concatenates the input profiles into one intermediate profile.
///
/// Inputs are read strictly in the supplied order, line by line. Surrounding
/// whitespace is trimmed and blank lines are skipped. The first mode line
/// encountered establishes the mode of the whole report and is written once,
/// verbatim, as the first output line; every later mode line must match it
/// exactly. All other lines are copied verbatim — this step performs no
/// record parsing and no coalescing.
///
/// # Errors
/// Fails on the first unreadable input, on a file whose first non-blank line
/// is not a valid mode declaration, or on a mode conflict. Whatever was
/// already written to `out` is left for the caller to discard.
pub fn concatenate<P: AsRef<Path>, W: Write>(inputs: &[P], out: &mut W) -> Result<()> {
    let mut report_mode: Option<String> = None;

    for input in inputs {
        let path = input.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("failed to open profile '{}' for reading: {e}", path.display()),
            ))
        })?;

        let mut saw_mode = false;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !saw_mode {
                let name = line
                    .strip_prefix(consts::MODE_PREFIX)
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| {
                        Error::InvalidMode(format!(
                            "bad mode line: {line} (in '{}')",
                            path.display()
                        ))
                    })?;
                saw_mode = true;
                match &report_mode {
                    None => {
                        report_mode = Some(name.to_string());
                        write!(out, "{line}")?;
                    }
                    Some(expected) if expected != name => {
                        return Err(Error::ModeConflict {
                            expected: expected.clone(),
                            found: name.to_string(),
                            file: path.display().to_string(),
                        });
                    }
                    Some(_) => {}
                }
                continue;
            }
            write!(out, "\n{line}")?;
        }
    }
    Ok(())
}

/// Concatenates the input profiles into a new temporary file.
///
/// The returned handle is flushed and ready to be read. Dropping it removes
/// the file, including on the error path, so a failed concatenation leaves
/// nothing behind.
pub fn concatenate_to_temp_file<P: AsRef<Path>>(inputs: &[P]) -> Result<NamedTempFile> {
    let mut temp = NamedTempFile::new().map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("failed to create temporary file for merging profiles: {e}"),
        ))
    })?;
    let mut writer = BufWriter::new(temp.as_file_mut());
    concatenate(inputs, &mut writer)?;
    writer.flush()?;
    drop(writer);
    Ok(temp)
}

/// Merges a concatenated profile: parse, coalesce duplicate spans, and write
/// the normalized result.
pub fn merge<R: Read, W: Write>(reader: R, out: &mut W) -> Result<()> {
    let mut profile = from_reader(reader)?;
    profile.coalesce()?;
    to_writer(&profile, out)
}

/// Merges a concatenated profile file into an output file.
pub fn merge_files<P: AsRef<Path>, Q: AsRef<Path>>(intermediate: P, output: Q) -> Result<()> {
    let reader = File::open(intermediate)?;
    let out_path = output.as_ref();
    let out_file = File::create(out_path).map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("failed to create result file '{}': {e}", out_path.display()),
        ))
    })?;
    let mut writer = BufWriter::new(out_file);
    merge(reader, &mut writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_error_display() {
        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        assert!(io_err.to_string().contains("I/O error"));

        let mode_err = Error::InvalidMode("bad mode line: moo: count".to_string());
        assert_eq!(
            mode_err.to_string(),
            "Invalid mode: bad mode line: moo: count"
        );

        let conflict = Error::ModeConflict {
            expected: "set".to_string(),
            found: "count".to_string(),
            file: "b.txt".to_string(),
        };
        let msg = conflict.to_string();
        assert!(msg.contains("'set'"));
        assert!(msg.contains("'count'"));
        assert!(msg.contains("b.txt"));

        let mismatch = Error::StmtCountMismatch {
            file: "f.go".to_string(),
            span: "1.1,1.10".to_string(),
            left: 2,
            right: 3,
        };
        assert_eq!(
            mismatch.to_string(),
            "Inconsistent statement counts for f.go:1.1,1.10: 2 vs 3"
        );
    }

    #[test]
    fn test_counting_mode_parse_and_display() {
        assert_eq!("set".parse::<CountingMode>().unwrap(), CountingMode::Set);
        assert_eq!(
            "count".parse::<CountingMode>().unwrap(),
            CountingMode::Count
        );
        assert_eq!(
            "atomic".parse::<CountingMode>().unwrap(),
            CountingMode::Atomic
        );
        assert!(matches!(
            "lines".parse::<CountingMode>(),
            Err(Error::InvalidMode(_))
        ));

        assert_eq!(CountingMode::Set.to_string(), "set");
        assert_eq!(CountingMode::Count.to_string(), "count");
        assert_eq!(CountingMode::Atomic.to_string(), "atomic");
    }

    #[test]
    fn test_count_combination_rules() {
        assert_eq!(CountingMode::Set.combine(0, 0), 0);
        assert_eq!(CountingMode::Set.combine(0, 1), 1);
        assert_eq!(CountingMode::Set.combine(7, 0), 1);
        assert_eq!(CountingMode::Count.combine(3, 3), 6);
        assert_eq!(CountingMode::Atomic.combine(2, 5), 7);
        assert_eq!(CountingMode::Count.combine(u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_block_span_identity() {
        let a = CoverageBlock {
            start_line: 1,
            start_col: 1,
            end_line: 1,
            end_col: 10,
            num_stmt: 2,
            count: 3,
        };
        let b = CoverageBlock { count: 9, ..a };
        let c = CoverageBlock { end_col: 11, ..a };

        assert!(a.same_span(&b));
        assert!(!a.same_span(&c));
        assert_eq!(a.span(), (1, 1, 1, 10));
    }

    #[test]
    fn test_parse_simple_profile() {
        let profile = from_reader(Cursor::new(
            "mode: count\nfoo/bar.go:1.1,2.10 3 4\nfoo/bar.go:3.1,4.2 1 0\n",
        ))
        .unwrap();

        assert_eq!(profile.mode, CountingMode::Count);
        assert_eq!(profile.files.len(), 1);
        assert_eq!(profile.files[0].file_name, "foo/bar.go");
        assert_eq!(profile.files[0].blocks.len(), 2);
        assert_eq!(
            profile.files[0].blocks[0],
            CoverageBlock {
                start_line: 1,
                start_col: 1,
                end_line: 2,
                end_col: 10,
                num_stmt: 3,
                count: 4,
            }
        );
    }

    #[test]
    fn test_parse_preserves_first_seen_file_order() {
        let profile = from_reader(Cursor::new(
            "mode: set\nzz.go:1.1,1.2 1 1\naa.go:1.1,1.2 1 1\nzz.go:2.1,2.2 1 0\n",
        ))
        .unwrap();

        assert_eq!(profile.files.len(), 2);
        assert_eq!(profile.files[0].file_name, "zz.go");
        assert_eq!(profile.files[1].file_name, "aa.go");
        assert_eq!(profile.files[0].blocks.len(), 2);
        assert_eq!(profile.num_blocks(), 3);
    }

    #[test]
    fn test_parse_path_with_colons() {
        let profile = from_reader(Cursor::new("mode: set\nC:/src/main.go:1.1,1.2 1 1\n")).unwrap();
        assert_eq!(profile.files[0].file_name, "C:/src/main.go");
    }

    #[test]
    fn test_parse_missing_mode_line() {
        assert!(matches!(
            from_reader(Cursor::new("")),
            Err(Error::InvalidMode(_))
        ));
        assert!(matches!(
            from_reader(Cursor::new("f.go:1.1,1.10 2 3\n")),
            Err(Error::InvalidMode(_))
        ));
    }

    #[test]
    fn test_parse_malformed_records() {
        let cases = [
            "mode: count\nf.go:1.1,1.10 2\n",       // too few fields
            "mode: count\nf.go:1.1,1.10 2 3 4\n",   // too many fields
            "mode: count\nf.go 1.1,1.10 2 3\n",     // no span separator
            "mode: count\nf.go:1.1-1.10 2 3\n",     // bad span delimiter
            "mode: count\nf.go:1.x,1.10 2 3\n",     // non-integer position
            "mode: count\nf.go:1.1,1.10 two 3\n",   // non-integer numStmt
            "mode: count\nf.go:1.1,1.10 2 three\n", // non-integer count
        ];
        for case in cases {
            assert!(
                matches!(from_reader(Cursor::new(case)), Err(Error::InvalidRecord(_))),
                "expected rejection of: {case}"
            );
        }
    }

    #[test]
    fn test_coalesce_sums_counts() {
        let mut profile = from_reader(Cursor::new(
            "mode: count\nf.go:1.1,1.10 2 3\nf.go:1.1,1.10 2 3\n",
        ))
        .unwrap();
        profile.coalesce().unwrap();

        assert_eq!(profile.files[0].blocks.len(), 1);
        assert_eq!(profile.files[0].blocks[0].count, 6);
        assert_eq!(profile.files[0].blocks[0].num_stmt, 2);
    }

    #[test]
    fn test_coalesce_stmt_mismatch() {
        let mut profile = from_reader(Cursor::new(
            "mode: count\nf.go:1.1,1.10 2 1\nf.go:1.1,1.10 3 1\n",
        ))
        .unwrap();

        match profile.coalesce() {
            Err(Error::StmtCountMismatch {
                file,
                span,
                left,
                right,
            }) => {
                assert_eq!(file, "f.go");
                assert_eq!(span, "1.1,1.10");
                assert_eq!((left, right), (2, 3));
            }
            other => panic!("expected StmtCountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_serialize_layout() {
        let profile = CoverageProfile {
            mode: CountingMode::Atomic,
            files: vec![FileProfile {
                file_name: "pkg/a.go".to_string(),
                blocks: vec![CoverageBlock {
                    start_line: 10,
                    start_col: 2,
                    end_line: 12,
                    end_col: 16,
                    num_stmt: 4,
                    count: 7,
                }],
            }],
        };

        let mut buffer = Vec::new();
        to_writer(&profile, &mut buffer).unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "mode: atomic\npkg/a.go:10.2,12.16 4 7\n"
        );
    }

    #[test]
    fn test_merge_in_memory() {
        let input = "mode: count\nf.go:1.1,1.10 2 3\ng.go:5.1,6.2 1 1\nf.go:1.1,1.10 2 3\n";
        let mut out = Vec::new();
        merge(Cursor::new(input), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "mode: count\nf.go:1.1,1.10 2 6\ng.go:5.1,6.2 1 1\n"
        );
    }
}
