//! Sanitization of analyzer diagnostics and program paths

use crate::core::errors::TealError;
use crate::Result;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

fn ansi_escape_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ANSI escape pattern is valid")
    })
}

/// Clean analyzer stderr before echoing it back to a client
///
/// Strips ANSI escape sequences and control characters (newlines and tabs
/// survive), trims surrounding whitespace and truncates to `max_bytes` on a
/// character boundary.
pub fn sanitize_diagnostics(raw: &str, max_bytes: usize) -> String {
    let without_ansi = ansi_escape_regex().replace_all(raw, "");

    let cleaned: String = without_ansi
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.len() <= max_bytes {
        return cleaned.to_string();
    }

    let mut cut = max_bytes;
    while !cleaned.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!(
        original_len = cleaned.len(),
        kept = cut,
        "Truncated analyzer diagnostics"
    );
    format!("{}…", cleaned[..cut].trim_end())
}

/// Check the operator-supplied analyzer program
///
/// The program is spawned directly without a shell, so relative segments and
/// shell metacharacters are legal path text. Only values that can never name
/// an executable are rejected.
pub fn validate_program_path(program: &str) -> Result<()> {
    if program.trim().is_empty() {
        return Err(TealError::Config("analyzer program cannot be empty".to_string()));
    }

    if program.contains('\0') {
        return Err(TealError::Config(format!(
            "analyzer program '{}' contains a NUL byte",
            program.escape_debug()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_strip_ansi_and_controls() {
        let raw = "\x1b[31mError:\x1b[0m trace file\x07 is truncated\n";
        assert_eq!(
            sanitize_diagnostics(raw, 1024),
            "Error: trace file is truncated"
        );
    }

    #[test]
    fn test_diagnostics_keep_newlines() {
        let raw = "line one\n\tline two";
        assert_eq!(sanitize_diagnostics(raw, 1024), raw);
    }

    #[test]
    fn test_diagnostics_truncate_on_char_boundary() {
        let raw = "ééééé";
        let truncated = sanitize_diagnostics(raw, 3);
        assert_eq!(truncated, "é…");
    }

    #[test]
    fn test_validate_program_path() {
        assert!(validate_program_path("tracy").is_ok());
        assert!(validate_program_path("/opt/teal/src/teal").is_ok());
        assert!(validate_program_path("/srv/teal/ws/../src/teal").is_ok());
        assert!(validate_program_path("/opt/R&D/teal$1").is_ok());

        assert!(validate_program_path("").is_err());
        assert!(validate_program_path("   ").is_err());
        assert!(validate_program_path("tracy\0").is_err());
    }
}
