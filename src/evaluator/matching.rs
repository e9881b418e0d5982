//! Output comparison for `test` and `diff` steps.

use std::fmt::Write;

use crate::grading::MatchOptions;

/// Lines of context shown before the first difference
const CONTEXT_LINES: usize = 2;
/// Lines shown per side after the first difference
const CHANGED_LINES: usize = 5;

/// Compares program output with expected output
///
/// With every option off this is a byte-exact comparison. Otherwise both
/// sides are normalized line by line the way `diff -i -w -b -B` would.
pub fn outputs_match(actual: &str, expected: &str, options: &MatchOptions) -> bool {
    if *options == MatchOptions::default() {
        return actual == expected;
    }
    normalize_lines(actual, options) == normalize_lines(expected, options)
}

fn normalize_lines(text: &str, options: &MatchOptions) -> Vec<String> {
    text.lines()
        .map(|line| normalize_line(line, options))
        .filter(|line| !(options.ignore_blank_lines && line.trim().is_empty()))
        .collect()
}

fn normalize_line(line: &str, options: &MatchOptions) -> String {
    let mut line = if options.ignore_case {
        line.to_lowercase()
    } else {
        line.to_string()
    };

    if options.ignore_whitespace {
        line.retain(|c| !c.is_whitespace());
    } else if options.ignore_whitespace_changes {
        // Runs collapse to one space and trailing whitespace goes away, but
        // whitespace where there was none still counts
        let mut collapsed = String::with_capacity(line.len());
        let mut in_run = false;
        for c in line.chars() {
            if c.is_whitespace() {
                in_run = true;
            } else {
                if in_run {
                    collapsed.push(' ');
                    in_run = false;
                }
                collapsed.push(c);
            }
        }
        line = collapsed;
    }
    line
}

/// A short unified-style excerpt around the first differing line
pub fn diff_excerpt(expected: &str, actual: &str, options: &MatchOptions) -> String {
    let expected = normalize_lines(expected, options);
    let actual = normalize_lines(actual, options);

    let Some(first) = (0..expected.len().max(actual.len())).find(|&i| expected.get(i) != actual.get(i))
    else {
        return "outputs differ only in trailing newlines".to_string();
    };

    let start = first.saturating_sub(CONTEXT_LINES);
    let mut out = String::new();
    let _ = writeln!(out, "--- expected\n+++ actual\n@@ line {} @@", first + 1);
    for line in &expected[start..first] {
        let _ = writeln!(out, " {line}");
    }
    for line in expected.iter().skip(first).take(CHANGED_LINES) {
        let _ = writeln!(out, "-{line}");
    }
    for line in actual.iter().skip(first).take(CHANGED_LINES) {
        let _ = writeln!(out, "+{line}");
    }
    out
}

/// Cuts `text` to at most `limit` bytes on a char boundary
pub fn truncate_text(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
