//! Output comparison helpers shared by task types.
//!
//! Nothing here touches processes; the sandbox-facing wrappers only read files
//! back and delegate to the pure functions.

use anyhow::Result;

use crate::sandbox::Sandbox;

pub const CORRECT_TEXT: &str = "Output is correct";
pub const INCORRECT_TEXT: &str = "Output isn't correct";
pub const DEFAULT_COMPARATOR_TEXT: &str = "Output evaluated by the comparator.";

/// Compares two outputs ignoring whitespace differences
///
/// Each line is reduced to its whitespace-separated tokens, so runs of spaces,
/// tabs and `\r\n` line endings do not matter, and trailing blank lines are
/// dropped. Line structure otherwise counts.
pub fn white_diff(output: &[u8], reference: &[u8]) -> bool {
    normalize(output) == normalize(reference)
}

fn normalize(content: &[u8]) -> Vec<Vec<&[u8]>> {
    let mut lines: Vec<Vec<&[u8]>> = content
        .split(|&b| b == b'\n')
        .map(|line| {
            line.split(|b| b.is_ascii_whitespace())
                .filter(|token| !token.is_empty())
                .collect()
        })
        .collect();

    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    lines
}

/// Runs a white diff between two files staged in `sandbox`
///
/// Returns the outcome (1.0 or 0.0) and the message to show.
pub fn white_diff_step(
    sandbox: &dyn Sandbox,
    output_name: &str,
    reference_name: &str,
) -> Result<(f64, String)> {
    let output = sandbox.read_file(output_name)?;
    let reference = sandbox.read_file(reference_name)?;

    if white_diff(&output, &reference) {
        Ok((1.0, CORRECT_TEXT.to_string()))
    } else {
        Ok((0.0, INCORRECT_TEXT.to_string()))
    }
}

/// Parses what a comparator printed into an outcome and a text
///
/// The first whitespace-separated token of stdout must be a finite number in
/// `[0, 1]`; what follows it is the text. When stdout carries nothing else the
/// first non-empty stderr line is used instead, then a fixed message.
/// Returns `None` when no usable outcome was printed.
pub fn extract_outcome_and_text(stdout: &[u8], stderr: &[u8]) -> Option<(f64, String)> {
    let stdout = String::from_utf8_lossy(stdout);
    let trimmed = stdout.trim_start();
    let token_end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let (token, rest) = trimmed.split_at(token_end);

    let outcome: f64 = token.parse().ok()?;
    if !outcome.is_finite() || !(0.0..=1.0).contains(&outcome) {
        return None;
    }
    // "-0" parses as negative zero
    let outcome = outcome + 0.0;

    let rest = rest.trim();
    let text = if !rest.is_empty() {
        rest.to_string()
    } else {
        String::from_utf8_lossy(stderr)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(DEFAULT_COMPARATOR_TEXT)
            .to_string()
    };

    Some((outcome, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_white_diff_ignores_whitespace() {
        assert!(white_diff(b"42\n", b"42"));
        assert!(white_diff(b"1  2\t3\r\n4\n\n\n", b"1 2 3\n4"));
        assert!(white_diff(b"  a b  \n", b"a b"));
        assert!(white_diff(b"", b"\n\n"));
    }

    #[test]
    fn test_white_diff_detects_differences() {
        assert!(!white_diff(b"43", b"42"));
        assert!(!white_diff(b"1 2", b"1\n2"));
        assert!(!white_diff(b"\n42", b"42"));
        assert!(!white_diff(b"12", b"1 2"));
    }

    #[test]
    fn test_extract_outcome_and_text() {
        assert_eq!(
            extract_outcome_and_text(b"0.5\npartially correct\n", b""),
            Some((0.5, "partially correct".to_string()))
        );
        assert_eq!(
            extract_outcome_and_text(b"1 all good, well done\n", b""),
            Some((1.0, "all good, well done".to_string()))
        );
        assert_eq!(
            extract_outcome_and_text(b"  0\n", b"\nwrong third line\n"),
            Some((0.0, "wrong third line".to_string()))
        );
        assert_eq!(
            extract_outcome_and_text(b"1.0", b""),
            Some((1.0, DEFAULT_COMPARATOR_TEXT.to_string()))
        );
    }

    #[test]
    fn test_negative_zero_outcome_is_zero() {
        let (outcome, text) = extract_outcome_and_text(b"-0 nothing right\n", b"").unwrap();
        assert!(outcome.is_sign_positive());
        assert_eq!(text, "nothing right");
        assert_eq!(serde_json::to_string(&outcome).unwrap(), "0.0");
    }

    #[test]
    fn test_extract_outcome_rejects_malformed_output() {
        assert_eq!(extract_outcome_and_text(b"", b""), None);
        assert_eq!(extract_outcome_and_text(b"correct 1.0\n", b""), None);
        assert_eq!(extract_outcome_and_text(b"NaN\n", b""), None);
        assert_eq!(extract_outcome_and_text(b"1.5\n", b""), None);
        assert_eq!(extract_outcome_and_text(b"-0.1\n", b""), None);
    }
}
