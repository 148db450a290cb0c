//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` or `${VAR}` - substitute with env var value, error if missing
//! - `${VAR:-default}` - use default if VAR is unset OR empty
//! - `${VAR-default}` - use default only if VAR is unset (empty is OK)
//! - `$$` - escape sequence for literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # escaped dollar
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)   # 1: braced name
            (?:(:?-)([^}]*))?          # 2: default operator, 3: default value
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)     # 4: bare name
        ",
    )
    .expect("Invalid regex pattern")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// Every problem found, so all missing variables surface at once.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();
    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| substitute(caps, &mut errors))
        .into_owned();
    InterpolationResult { text, errors }
}

fn substitute(caps: &Captures, errors: &mut Vec<String>) -> String {
    let whole = &caps[0];
    if whole == "$$" {
        return "$".to_string();
    }

    let name = caps
        .get(1)
        .or_else(|| caps.get(4))
        .map(|m| m.as_str())
        .unwrap_or_default();
    let operator = caps.get(2).map(|m| m.as_str());
    let default = caps.get(3).map(|m| m.as_str());

    match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => {
            errors.push(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
            whole.to_string()
        }
        Ok(value) if value.is_empty() && operator == Some(":-") => {
            default.unwrap_or_default().to_string()
        }
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                errors.push(format!("environment variable '{name}' is not set"));
                whole.to_string()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        // SAFETY: each test uses its own variable names, restored below
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        let result = f();

        // SAFETY: restoring original environment state
        for (key, original) in originals {
            match original {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_bare_and_braced_substitution() {
        with_env_vars(&[("SPILLWAY_TEST_DIR", Some("/var/spool"))], || {
            let result = interpolate("a: $SPILLWAY_TEST_DIR\nb: ${SPILLWAY_TEST_DIR}/x");
            assert!(result.is_ok());
            assert_eq!(result.text, "a: /var/spool\nb: /var/spool/x");
        });
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        with_env_vars(
            &[("SPILLWAY_TEST_GONE_A", None), ("SPILLWAY_TEST_GONE_B", None)],
            || {
                let result = interpolate("$SPILLWAY_TEST_GONE_A ${SPILLWAY_TEST_GONE_B}");
                assert_eq!(result.errors.len(), 2);
                assert!(result.errors[0].contains("SPILLWAY_TEST_GONE_A"));
                assert!(result.errors[1].contains("not set"));
            },
        );
    }

    #[test]
    fn test_default_operators() {
        with_env_vars(
            &[
                ("SPILLWAY_TEST_EMPTY", Some("")),
                ("SPILLWAY_TEST_UNSET", None),
            ],
            || {
                assert_eq!(interpolate("${SPILLWAY_TEST_EMPTY:-dflt}").text, "dflt");
                assert_eq!(interpolate("${SPILLWAY_TEST_EMPTY-dflt}").text, "");
                assert_eq!(interpolate("${SPILLWAY_TEST_UNSET-dflt}").text, "dflt");
            },
        );
    }

    #[test]
    fn test_newline_injection_rejected() {
        with_env_vars(&[("SPILLWAY_TEST_NL", Some("a\nb: c"))], || {
            let result = interpolate("key: $SPILLWAY_TEST_NL");
            assert!(!result.is_ok());
            assert_eq!(result.text, "key: $SPILLWAY_TEST_NL");
        });
    }

    #[test]
    fn test_escape_sequence() {
        let result = interpolate("cost: $$5");
        assert!(result.is_ok());
        assert_eq!(result.text, "cost: $5");
    }
}
