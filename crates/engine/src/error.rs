//! Error aggregation shared by the lifecycle phases.

use std::fmt;

/// Return code used when a container fails with one or more joined errors.
pub const AGGREGATE_FAILURE_CODE: i32 = 255;

/// Several independent failures reported together.
///
/// Displays as the newline-joined member messages so a single report lists
/// every structural or preflight problem at once.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.errors {
            if !first {
                f.write_str("\n")?;
            }
            write!(f, "{error:#}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Join a list of errors: `None` when empty, the error itself when alone, a
/// [`MultiError`] otherwise.
pub fn join_errors(mut errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        _ => Some(anyhow::Error::new(MultiError { errors })),
    }
}

/// Convenience wrapper turning a joined error list into a `Result`.
pub fn into_result(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
    match join_errors(errors) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn join_errors_collapses_trivial_cases() {
        assert!(join_errors(Vec::new()).is_none());
        let single = join_errors(vec![anyhow!("only")]).unwrap();
        assert_eq!(single.to_string(), "only");
    }

    #[test]
    fn multi_error_lists_every_message() {
        let joined = join_errors(vec![anyhow!("first"), anyhow!("second"), anyhow!("third")]).unwrap();
        assert_eq!(joined.to_string(), "first\nsecond\nthird");
        let multi = joined.downcast_ref::<MultiError>().expect("multi error");
        assert_eq!(multi.errors().len(), 3);
    }
}
