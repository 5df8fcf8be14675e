//! Single-pass prompt template renderer.
//!
//! Pipeline YAML is static data, not code: the only substitutions a prompt
//! template may carry are `{{ input }}` (the run's input payload) and
//! `{{ artifact:<name> }}` (the workspace-relative path of an artifact the
//! step declared in its memory configuration). Anything else passes through
//! untouched, so templates stay inspectable and deterministic.

use std::collections::BTreeMap;
use std::ops::Range;

/// Parsed template fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Literal text (range into the original string).
    Literal(Range<usize>),
    /// `{{ input }}`
    Input,
    /// `{{ artifact:<name> }}`
    Artifact(String),
    /// A `{{ ... }}` reference that is neither of the above; preserved
    /// verbatim at render time so prompts never silently lose content.
    Unknown(Range<usize>),
}

/// Values available to a render pass.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// The run's input payload.
    pub input: String,
    /// Artifact name -> workspace-relative injected path.
    pub artifacts: BTreeMap<String, String>,
}

impl RenderContext {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn with_artifact(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.artifacts.insert(name.into(), path.into());
        self
    }
}

/// Tokenize a template in a single pass.
pub fn tokenize(template: &str) -> Vec<Token> {
    let bytes = template.as_bytes();
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = template[i + 2..].find("}}") {
                let inner_start = i + 2;
                let inner_end = inner_start + close;
                let inner = template[inner_start..inner_end].trim();

                if literal_start < i {
                    tokens.push(Token::Literal(literal_start..i));
                }

                if inner == "input" {
                    tokens.push(Token::Input);
                } else if let Some(name) = inner.strip_prefix("artifact:") {
                    tokens.push(Token::Artifact(name.trim().to_string()));
                } else {
                    tokens.push(Token::Unknown(i..inner_end + 2));
                }

                i = inner_end + 2;
                literal_start = i;
                continue;
            }
        }
        i += 1;
    }

    if literal_start < template.len() {
        tokens.push(Token::Literal(literal_start..template.len()));
    }

    tokens
}

/// Render a template against the given context.
pub fn render(template: &str, ctx: &RenderContext) -> String {
    let tokens = tokenize(template);
    let mut out = String::with_capacity(template.len() + ctx.input.len());

    for token in &tokens {
        match token {
            Token::Literal(range) | Token::Unknown(range) => {
                out.push_str(&template[range.clone()]);
            }
            Token::Input => out.push_str(&ctx.input),
            Token::Artifact(name) => match ctx.artifacts.get(name) {
                Some(path) => out.push_str(path),
                // Unknown artifact names are caught at pipeline validation;
                // preserve the reference if one slips through.
                None => {
                    out.push_str("{{ artifact:");
                    out.push_str(name);
                    out.push_str(" }}");
                }
            },
        }
    }

    out
}

/// Collect the artifact names a template references.
pub fn artifact_refs(template: &str) -> Vec<String> {
    tokenize(template)
        .into_iter()
        .filter_map(|t| match t {
            Token::Artifact(name) => Some(name),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_plain_literal() {
        let tokens = tokenize("review the diff");
        assert_eq!(tokens.len(), 1);
        assert!(matches!(&tokens[0], Token::Literal(r) if *r == (0..15)));
    }

    #[test]
    fn tokenize_input_ref() {
        let tokens = tokenize("{{ input }}");
        assert_eq!(tokens, vec![Token::Input]);
    }

    #[test]
    fn tokenize_input_ref_without_spaces() {
        let tokens = tokenize("{{input}}");
        assert_eq!(tokens, vec![Token::Input]);
    }

    #[test]
    fn tokenize_artifact_ref() {
        let tokens = tokenize("read {{ artifact:unit }} first");
        assert_eq!(tokens.len(), 3);
        assert!(matches!(&tokens[1], Token::Artifact(n) if n == "unit"));
    }

    #[test]
    fn tokenize_unknown_ref_preserved() {
        let tokens = tokenize("{{ secrets }}");
        assert_eq!(tokens.len(), 1);
        assert!(matches!(&tokens[0], Token::Unknown(_)));
    }

    #[test]
    fn tokenize_unclosed_braces_stay_literal() {
        let tokens = tokenize("a {{ dangling");
        assert_eq!(tokens.len(), 1);
        assert!(matches!(&tokens[0], Token::Literal(_)));
    }

    #[test]
    fn render_substitutes_input() {
        let ctx = RenderContext::new("fix issue #42");
        assert_eq!(
            render("Task: {{ input }}", &ctx),
            "Task: fix issue #42"
        );
    }

    #[test]
    fn render_substitutes_artifacts() {
        let ctx = RenderContext::new("").with_artifact("unit", "inputs/unit.json");
        assert_eq!(
            render("Read {{ artifact:unit }} before editing.", &ctx),
            "Read inputs/unit.json before editing."
        );
    }

    #[test]
    fn render_preserves_unknown_refs() {
        let ctx = RenderContext::new("x");
        assert_eq!(render("{{ not_a_thing }}", &ctx), "{{ not_a_thing }}");
    }

    #[test]
    fn render_preserves_missing_artifact_ref() {
        let ctx = RenderContext::new("x");
        assert_eq!(
            render("{{ artifact:ghost }}", &ctx),
            "{{ artifact:ghost }}"
        );
    }

    #[test]
    fn render_mixed_template() {
        let ctx = RenderContext::new("payload").with_artifact("plan", "inputs/plan.md");
        let out = render(
            "Do {{ input }} using {{ artifact:plan }} and {{ artifact:plan }}.",
            &ctx,
        );
        assert_eq!(out, "Do payload using inputs/plan.md and inputs/plan.md.");
    }

    #[test]
    fn artifact_refs_collects_names() {
        let refs = artifact_refs("{{ artifact:a }} {{ input }} {{ artifact:b }}");
        assert_eq!(refs, vec!["a".to_string(), "b".to_string()]);
    }
}
