//! Validation helpers shared by workflow and plugin preflight checks.

use regex::Regex;

/// Validate `value` against an optional regular expression.
///
/// `subject` names the thing being checked (for example `argument 'BRANCH'`)
/// and is used verbatim in the error. The value itself is left out of the
/// message because arguments frequently carry credentials.
pub fn validate_pattern(subject: &str, value: &str, pattern: Option<&str>) -> Result<(), String> {
    let Some(pattern) = pattern.filter(|pattern| !pattern.is_empty()) else {
        return Ok(());
    };
    let regex = Regex::new(pattern).map_err(|error| format!("{subject} has an invalid pattern '{pattern}': {error}"))?;
    if regex.is_match(value) {
        Ok(())
    } else {
        Err(format!("{subject} does not match the pattern {pattern}"))
    }
}

#[cfg(test)]
mod tests {
    use super::validate_pattern;

    #[test]
    fn missing_pattern_accepts_anything() {
        assert!(validate_pattern("argument 'A'", "", None).is_ok());
        assert!(validate_pattern("argument 'A'", "x", Some("")).is_ok());
    }

    #[test]
    fn mismatch_names_subject_and_pattern() {
        let error = validate_pattern("argument 'BRANCH'", "main", Some("^release/")).unwrap_err();
        assert_eq!(error, "argument 'BRANCH' does not match the pattern ^release/");
        assert!(validate_pattern("argument 'BRANCH'", "release/1.0", Some("^release/")).is_ok());
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let error = validate_pattern("env 'X'", "value", Some("(")).unwrap_err();
        assert!(error.contains("invalid pattern"), "unexpected error: {error}");
    }
}
