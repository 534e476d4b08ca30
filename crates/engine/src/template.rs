//! `${{ expr }}` template scanning and evaluation.
//!
//! A template string is split into raw text and variable segments by
//! [`scan_tokens`]. Variable bodies are script expressions evaluated through
//! the [`ScriptContext`]. Two consumers exist:
//!
//! - [`interpolate`] replaces every variable with its stringified value.
//! - [`evaluate_bool`] requires the whole input to be exactly one variable and
//!   coerces its value to a boolean; this backs `if` and `continue-on-error`.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use stepline_types::ControlExpression;
use stepline_util::SharedEnv;
use thiserror::Error;

use crate::script::{ScriptContext, Variables};

const OPEN_DELIMITER: &str = "${{";
const CLOSE_DELIMITER: &str = "}}";

/// Kind of a scanned template segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    RawString,
    VarString,
}

/// A scanned template segment. For variables, `value` is the trimmed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
}

impl Token {
    fn raw(value: &str) -> Self {
        Self {
            kind: TokenKind::RawString,
            value: value.to_string(),
        }
    }

    fn variable(value: &str) -> Self {
        Self {
            kind: TokenKind::VarString,
            value: value.trim().to_string(),
        }
    }
}

/// Template syntax and shape errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("nested variable at position {position}: '{prefix}'")]
    NestedVariable { position: usize, prefix: String },
    #[error("newline in variable at position {position}")]
    NewlineInVariable { position: usize },
    #[error("unclosed variable starting at position {position}")]
    UnclosedVariable { position: usize },
    #[error("only one expression is allowed, got '{input}'")]
    NotSingleExpression { input: String },
}

/// Split `input` into raw and variable segments.
///
/// The result is never empty: input without variables yields a single raw
/// token equal to the input (including the empty string). Positions in errors
/// are byte offsets.
pub fn scan_tokens(input: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut raw_start = 0usize;
    let mut variable_start: Option<usize> = None;
    let mut index = 0usize;

    while index < input.len() {
        let rest = &input[index..];
        match variable_start {
            None => {
                if rest.starts_with(OPEN_DELIMITER) {
                    if index > raw_start {
                        tokens.push(Token::raw(&input[raw_start..index]));
                    }
                    variable_start = Some(index);
                    index += OPEN_DELIMITER.len();
                    continue;
                }
            }
            Some(start) => {
                if rest.starts_with(OPEN_DELIMITER) {
                    return Err(TemplateError::NestedVariable {
                        position: index,
                        prefix: input[start..index + OPEN_DELIMITER.len()].to_string(),
                    });
                }
                if rest.starts_with(CLOSE_DELIMITER) {
                    tokens.push(Token::variable(&input[start + OPEN_DELIMITER.len()..index]));
                    index += CLOSE_DELIMITER.len();
                    raw_start = index;
                    variable_start = None;
                    continue;
                }
                if rest.starts_with('\n') {
                    return Err(TemplateError::NewlineInVariable { position: index });
                }
            }
        }
        index += rest.chars().next().map(char::len_utf8).unwrap_or(1);
    }

    if let Some(start) = variable_start {
        return Err(TemplateError::UnclosedVariable { position: start });
    }
    if raw_start < input.len() || tokens.is_empty() {
        tokens.push(Token::raw(&input[raw_start..]));
    }
    Ok(tokens)
}

/// True when `input` contains a variable opener.
pub fn contains_template(input: &str) -> bool {
    input.contains(OPEN_DELIMITER)
}

/// Replace every `${{ expr }}` in `input` with the expression's string value.
pub fn interpolate(input: &str, scripts: &mut ScriptContext, env: &SharedEnv, variables: &Variables) -> Result<String> {
    if input.is_empty() {
        return Ok(String::new());
    }
    let tokens = scan_tokens(input)?;
    let mut output = String::with_capacity(input.len());
    for token in tokens {
        match token.kind {
            TokenKind::RawString => output.push_str(&token.value),
            TokenKind::VarString => {
                let value = scripts
                    .eval_str(env, &token.value, variables)
                    .with_context(|| format!("failed to evaluate '{}'", token.value))?;
                output.push_str(&value);
            }
        }
    }
    Ok(output)
}

/// Interpolate every value of a map, preserving key order.
pub fn interpolate_map(
    values: &IndexMap<String, String>,
    scripts: &mut ScriptContext,
    env: &SharedEnv,
    variables: &Variables,
) -> Result<IndexMap<String, String>> {
    values
        .iter()
        .map(|(key, value)| {
            let interpolated = interpolate(value, scripts, env, variables).with_context(|| format!("invalid value for '{key}'"))?;
            Ok((key.clone(), interpolated))
        })
        .collect()
}

/// Evaluate `input` as a single boolean expression.
///
/// The input must be exactly one `${{ expr }}` with nothing around it.
pub fn evaluate_bool(input: &str, scripts: &mut ScriptContext, env: &SharedEnv, variables: &Variables) -> Result<bool> {
    let tokens = scan_tokens(input)?;
    let [token] = tokens.as_slice() else {
        return Err(TemplateError::NotSingleExpression { input: input.to_string() }.into());
    };
    if token.kind != TokenKind::VarString {
        return Err(TemplateError::NotSingleExpression { input: input.to_string() }.into());
    }
    let value = scripts
        .eval_bool(env, &token.value, variables)
        .with_context(|| format!("failed to evaluate '{}'", token.value))?;
    Ok(value)
}

/// Evaluate an `if` / `continue-on-error` value.
pub fn evaluate_control(
    expression: &ControlExpression,
    scripts: &mut ScriptContext,
    env: &SharedEnv,
    variables: &Variables,
) -> Result<bool> {
    match expression {
        ControlExpression::Constant(flag) => Ok(*flag),
        ControlExpression::Template(text) => evaluate_bool(text, scripts, env, variables),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepline_util::ScopedEnv;

    fn raw(value: &str) -> Token {
        Token::raw(value)
    }

    fn var(value: &str) -> Token {
        Token::variable(value)
    }

    fn empty_env() -> SharedEnv {
        ScopedEnv::detached(IndexMap::new()).into_shared()
    }

    #[test]
    fn input_without_markers_is_one_raw_token() {
        for input in ["", "plain text", "$ { { not a variable } }", "}} stray", "${ HOME }"] {
            assert_eq!(scan_tokens(input).unwrap(), vec![raw(input)], "input: {input:?}");
        }
    }

    #[test]
    fn variables_are_split_and_trimmed() {
        let tokens = scan_tokens("tar -czvf pkg-${{ a }}-1.0.${{b}}.tar.gz").unwrap();
        assert_eq!(
            tokens,
            vec![raw("tar -czvf pkg-"), var("a"), raw("-1.0."), var("b"), raw(".tar.gz")]
        );
        assert_eq!(scan_tokens("${{ x }}").unwrap(), vec![var("x")]);
        assert_eq!(scan_tokens("é${{ x }}ü").unwrap(), vec![raw("é"), var("x"), raw("ü")]);
    }

    #[test]
    fn nested_variable_is_rejected() {
        let error = scan_tokens("a ${{ b ${{ c }} }}").unwrap_err();
        assert_eq!(
            error,
            TemplateError::NestedVariable {
                position: 8,
                prefix: "${{ b ${{".to_string()
            }
        );
        assert!(error.to_string().contains("nested variable"));
    }

    #[test]
    fn unclosed_variable_is_rejected() {
        let error = scan_tokens("value ${{ a ").unwrap_err();
        assert_eq!(error, TemplateError::UnclosedVariable { position: 6 });
        assert!(error.to_string().contains("unclosed variable"));
    }

    #[test]
    fn newline_inside_variable_is_rejected() {
        let error = scan_tokens("${{ a\n }}").unwrap_err();
        assert!(error.to_string().contains("newline"));
        assert!(scan_tokens("line one\n${{ a }}\nline three").is_ok());
    }

    #[test]
    fn interpolation_joins_raw_and_evaluated_segments() {
        let mut scripts = ScriptContext::new().unwrap();
        let mut variables = Variables::new();
        variables.insert("a".into(), json!("PR-7"));
        variables.insert("b".into(), json!("12"));

        let output = interpolate("tar -czvf pkg-${{ a }}-1.0.${{ b }}.tar.gz", &mut scripts, &empty_env(), &variables).unwrap();
        assert_eq!(output, "tar -czvf pkg-PR-7-1.0.12.tar.gz");
        assert_eq!(interpolate("", &mut scripts, &empty_env(), &variables).unwrap(), "");
    }

    #[test]
    fn interpolation_reads_env_scope() {
        let mut scripts = ScriptContext::new().unwrap();
        let env = ScopedEnv::detached(indexmap::indexmap! { "REGION".to_string() => "eu".to_string() }).into_shared();
        let output = interpolate("deploy-${{ env.get('REGION') }}", &mut scripts, &env, &Variables::new()).unwrap();
        assert_eq!(output, "deploy-eu");
    }

    #[test]
    fn interpolation_of_missing_value_fails() {
        let mut scripts = ScriptContext::new().unwrap();
        let error = interpolate("x-${{ args }}", &mut scripts, &empty_env(), &Variables::new()).unwrap_err();
        assert!(format!("{error:#}").contains("no output"), "unexpected error: {error:#}");
    }

    #[test]
    fn single_expression_evaluates_to_bool() {
        let mut scripts = ScriptContext::new().unwrap();
        let env = empty_env();
        let variables = Variables::new();
        assert!(evaluate_bool("${{ true }}", &mut scripts, &env, &variables).unwrap());
        assert!(!evaluate_bool("${{ 1 > 2 }}", &mut scripts, &env, &variables).unwrap());

        for input in ["hello ${{ true }}", "hello", "${{ true }}${{ true }}", "${{ true }} "] {
            let error = evaluate_bool(input, &mut scripts, &env, &variables).unwrap_err();
            assert!(error.to_string().contains("only one expression is allowed"), "input {input:?}: {error}");
        }
    }

    #[test]
    fn constant_control_expression_skips_evaluation() {
        let mut scripts = ScriptContext::new().unwrap();
        let env = empty_env();
        assert!(evaluate_control(&ControlExpression::Constant(true), &mut scripts, &env, &Variables::new()).unwrap());
        assert!(
            !evaluate_control(
                &ControlExpression::Template("${{ false }}".into()),
                &mut scripts,
                &env,
                &Variables::new()
            )
            .unwrap()
        );
        assert_eq!(scripts.cached_len(), 1);
    }
}
