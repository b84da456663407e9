//! Line-oriented content search inside a single file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;

use filekit_core::{FsError, OperationKind};
use regex::{Regex, RegexBuilder};

use crate::binary::{self, SAMPLE_SIZE};
use crate::query::LineMatch;

/// A compiled content pattern.
#[derive(Debug, Clone)]
pub struct ContentPattern {
    regex: Regex,
}

impl ContentPattern {
    /// Compile `pattern`; literal text is escaped unless `use_regex` is set.
    pub fn new(pattern: &str, use_regex: bool, case_sensitive: bool) -> Result<Self, FsError> {
        let source = if use_regex {
            pattern.to_string()
        } else {
            regex::escape(pattern)
        };
        let regex = RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| FsError::invalid_pattern(pattern, e))?;
        Ok(Self { regex })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Limits applied to one file.
#[derive(Debug, Clone, Copy)]
pub struct GrepOptions {
    /// Files larger than this are skipped.
    pub max_file_size: u64,
    /// Files larger than this are read through a buffer instead of at once.
    pub stream_threshold: u64,
    /// Lines of context before and after each hit.
    pub context_lines: usize,
}

/// Why a file was not searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Binary,
    TooLarge,
}

/// Result of grepping one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrepOutcome {
    Matched(Vec<LineMatch>),
    NoMatch,
    Skipped(SkipReason),
}

/// Search `path` line by line.
pub fn grep_path(
    path: &Path,
    pattern: &ContentPattern,
    options: &GrepOptions,
) -> Result<GrepOutcome, FsError> {
    let io_err = |e| FsError::io(path, OperationKind::Read, e);

    let mut file = File::open(path).map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();
    if len > options.max_file_size {
        return Ok(GrepOutcome::Skipped(SkipReason::TooLarge));
    }

    let mut sample = Vec::with_capacity(SAMPLE_SIZE);
    (&mut file)
        .take(SAMPLE_SIZE as u64)
        .read_to_end(&mut sample)
        .map_err(io_err)?;
    if binary::is_binary(&sample) {
        return Ok(GrepOutcome::Skipped(SkipReason::Binary));
    }

    let reader = sample.as_slice().chain(file);
    let scanned = if len > options.stream_threshold {
        scan_lines(BufReader::with_capacity(64 * 1024, reader), pattern, options.context_lines)
    } else {
        let mut content = Vec::with_capacity(len as usize);
        BufReader::new(reader)
            .read_to_end(&mut content)
            .map_err(io_err)?;
        scan_lines(Cursor::new(content), pattern, options.context_lines)
    };
    let matches = scanned.map_err(io_err)?;

    Ok(if matches.is_empty() {
        GrepOutcome::NoMatch
    } else {
        GrepOutcome::Matched(matches)
    })
}

struct OpenContext {
    index: usize,
    remaining: usize,
}

/// Run `pattern` over every line of `reader`. Lines end at `\n` with an
/// optional preceding `\r`; numbering starts at 1.
pub fn scan_lines<R: BufRead>(
    mut reader: R,
    pattern: &ContentPattern,
    context_lines: usize,
) -> std::io::Result<Vec<LineMatch>> {
    let mut matches: Vec<LineMatch> = Vec::new();
    let mut before: VecDeque<(usize, String)> = VecDeque::with_capacity(context_lines);
    let mut open: Vec<OpenContext> = Vec::new();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();

        if context_lines > 0 {
            open.retain_mut(|ctx| {
                if let Some(context) = matches[ctx.index].context.as_mut() {
                    context.push(context_line(false, line_no, &line));
                }
                ctx.remaining -= 1;
                ctx.remaining > 0
            });
        }

        if pattern.is_match(&line) {
            let context = (context_lines > 0).then(|| {
                let mut context: Vec<String> = before
                    .iter()
                    .map(|(n, text)| context_line(false, *n, text))
                    .collect();
                context.push(context_line(true, line_no, &line));
                context
            });
            matches.push(LineMatch {
                line: line_no,
                content: line.clone(),
                context,
            });
            if context_lines > 0 {
                open.push(OpenContext {
                    index: matches.len() - 1,
                    remaining: context_lines,
                });
            }
        }

        if context_lines > 0 {
            if before.len() == context_lines {
                before.pop_front();
            }
            before.push_back((line_no, line));
        }
    }

    Ok(matches)
}

fn context_line(hit: bool, line_no: usize, text: &str) -> String {
    let marker = if hit { '>' } else { ' ' };
    format!("{marker} {line_no}: {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> GrepOptions {
        GrepOptions {
            max_file_size: 10 * filekit_core::MIB,
            stream_threshold: 50 * filekit_core::MIB,
            context_lines: 0,
        }
    }

    #[test]
    fn test_literal_pattern_is_escaped() {
        let pattern = ContentPattern::new("a.b(c)", false, true).unwrap();
        assert!(pattern.is_match("x a.b(c) y"));
        assert!(!pattern.is_match("axb(c)"));
    }

    #[test]
    fn test_invalid_regex_reported() {
        let err = ContentPattern::new("[oops", true, true).unwrap_err();
        assert!(matches!(err, FsError::InvalidPattern { .. }));
    }

    #[test]
    fn test_crlf_and_line_numbers() {
        let pattern = ContentPattern::new("error", false, false).unwrap();
        let text = "ok\r\nError: Disk Full\r\nfine\nerror again";
        let matches = scan_lines(Cursor::new(text), &pattern, 0).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].line, 2);
        assert_eq!(matches[0].content, "Error: Disk Full");
        assert_eq!(matches[1].line, 4);
        assert!(matches[0].context.is_none());
    }

    #[test]
    fn test_context_window() {
        let pattern = ContentPattern::new("hit", false, true).unwrap();
        let text = "l1\nl2\nhit3\nl4\nhit5\nl6\nl7\n";
        let matches = scan_lines(Cursor::new(text), &pattern, 1).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(
            matches[0].context.as_deref().unwrap(),
            ["  2: l2", "> 3: hit3", "  4: l4"]
        );
        assert_eq!(
            matches[1].context.as_deref().unwrap(),
            ["  4: l4", "> 5: hit5", "  6: l6"]
        );
    }

    #[test]
    fn test_grep_path_skips_binary_and_large() {
        let temp = tempfile::TempDir::new().unwrap();
        let pattern = ContentPattern::new("needle", false, true).unwrap();

        let bin = temp.path().join("data.txt");
        std::fs::write(&bin, b"needle\0\x01\x02").unwrap();
        assert_eq!(
            grep_path(&bin, &pattern, &options()).unwrap(),
            GrepOutcome::Skipped(SkipReason::Binary)
        );

        let big = temp.path().join("big.txt");
        std::fs::write(&big, "needle\n".repeat(20)).unwrap();
        let small_cap = GrepOptions {
            max_file_size: 16,
            ..options()
        };
        assert_eq!(
            grep_path(&big, &pattern, &small_cap).unwrap(),
            GrepOutcome::Skipped(SkipReason::TooLarge)
        );
    }

    #[test]
    fn test_nul_past_the_sample_is_still_searched() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("late_nul.log");
        let mut data = vec![b'x'; SAMPLE_SIZE];
        data.extend(b"\0\nneedle\n");
        std::fs::write(&path, &data).unwrap();

        let pattern = ContentPattern::new("needle", false, true).unwrap();
        let GrepOutcome::Matched(matches) = grep_path(&path, &pattern, &options()).unwrap() else {
            panic!("expected a match");
        };
        assert_eq!(matches[0].line, 2);
    }

    #[test]
    fn test_streaming_matches_whole_read() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("log.txt");
        let mut text = String::new();
        for i in 0..2000 {
            text.push_str(&format!("line {i} {}\n", if i % 97 == 0 { "needle" } else { "hay" }));
        }
        std::fs::write(&path, &text).unwrap();

        let pattern = ContentPattern::new("needle", false, true).unwrap();
        let whole = grep_path(&path, &pattern, &options()).unwrap();
        let streamed = grep_path(
            &path,
            &pattern,
            &GrepOptions {
                stream_threshold: 0,
                ..options()
            },
        )
        .unwrap();
        assert_eq!(whole, streamed);
        assert!(matches!(whole, GrepOutcome::Matched(_)));
    }
}
