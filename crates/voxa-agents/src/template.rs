// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `{{ var }}` placeholder rendering for prompts and greetings.

use std::collections::HashMap;

use tracing::warn;

/// Substitute `{{ var }}` placeholders from `vars`.
///
/// Whitespace inside the braces is ignored (`{{name}}` ≡ `{{ name }}`).
/// Unknown variables render as the empty string with a warning; a template
/// must never leak raw placeholder syntax into a spoken prompt.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match vars.get(key) {
                    Some(v) => out.push_str(v),
                    None => {
                        warn!(var = %key, "prompt template references unknown variable");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unclosed braces: emit verbatim and stop scanning.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_known_variable() {
        let v = vars(&[("customer", "Ada")]);
        assert_eq!(render_template("Hello {{ customer }}!", &v), "Hello Ada!");
    }

    #[test]
    fn whitespace_inside_braces_is_ignored() {
        let v = vars(&[("name", "Bo")]);
        assert_eq!(render_template("{{name}} {{  name  }}", &v), "Bo Bo");
    }

    #[test]
    fn unknown_variable_renders_empty() {
        let v = vars(&[]);
        assert_eq!(render_template("Hi {{ nobody }}.", &v), "Hi .");
    }

    #[test]
    fn multiple_variables_in_order() {
        let v = vars(&[("a", "1"), ("b", "2")]);
        assert_eq!(render_template("{{a}}-{{b}}-{{a}}", &v), "1-2-1");
    }

    #[test]
    fn unclosed_braces_emitted_verbatim() {
        let v = vars(&[("a", "1")]);
        assert_eq!(render_template("x {{ a", &v), "x {{ a");
    }

    #[test]
    fn plain_text_passes_through() {
        let v = vars(&[]);
        assert_eq!(render_template("no placeholders here", &v), "no placeholders here");
    }
}
