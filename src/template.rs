//! Minimal template engine — replaces `{key}` placeholders in a single pass.
//!
//! Templates use single-brace `{key}` syntax. A literal brace in the output
//! (YAML flow mappings, Python dicts in rendered scripts) is written as
//! `{{` / `}}`; those are swapped for sentinels before substitution and
//! restored after, so a substituted value containing `{` can never trigger
//! a second round of substitution.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const SENTINEL_L: &str = "\u{0}LBRACE\u{0}";
const SENTINEL_R: &str = "\u{0}RBRACE\u{0}";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("valid regex"));

/// Replace `{key}` placeholders in `template` with values from `replacements`.
///
/// Unknown keys are left untouched so provider-level placeholders embedded
/// in a rendered artifact survive. Substitution happens exactly once.
pub fn render(template: &str, replacements: &HashMap<String, String>) -> String {
    let escaped = template
        .replace("{{", SENTINEL_L)
        .replace("}}", SENTINEL_R);

    let substituted = PLACEHOLDER.replace_all(&escaped, |caps: &Captures| {
        let key = &caps[1];
        match replacements.get(key) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        }
    });

    substituted
        .replace(SENTINEL_L, "{")
        .replace(SENTINEL_R, "}")
}

/// Convenience for building a replacement map from `(&str, String)` pairs.
pub fn replacements<I, K>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, String)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_substitution() {
        let out = render("hello {name}", &map(&[("name", "world")]));
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let out = render("keep {unknown} as-is", &map(&[("name", "x")]));
        assert_eq!(out, "keep {unknown} as-is");
    }

    #[test]
    fn test_escaped_braces_survive() {
        let out = render("dict = {{\"k\": \"{v}\"}}", &map(&[("v", "1")]));
        assert_eq!(out, "dict = {\"k\": \"1\"}");
    }

    #[test]
    fn test_no_recursive_substitution() {
        // A value that looks like a placeholder must not be expanded again.
        let out = render("{k}", &map(&[("k", "{k}")]));
        assert_eq!(out, "{k}");
    }

    #[test]
    fn test_value_with_braces_is_inert() {
        let out = render("{a} {b}", &map(&[("a", "{b}"), ("b", "2")]));
        assert_eq!(out, "{b} 2");
    }

    #[test]
    fn test_multiple_occurrences() {
        let out = render("{x}-{x}-{x}", &map(&[("x", "y")]));
        assert_eq!(out, "y-y-y");
    }

    #[test]
    fn test_non_word_keys_ignored() {
        let out = render("{not a key} {key}", &map(&[("key", "v")]));
        assert_eq!(out, "{not a key} v");
    }
}
