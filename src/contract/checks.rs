//! Content and quality checks applied after the structural contract.
//!
//! Each rule is a small pure function from output text to an optional
//! [`ContractFailure`], so individual rules stay unit-testable and the
//! dispatcher in the parent module stays flat.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ContractFailure, FailureClass};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(TODO|TBD|FIXME|XXX)\b|<placeholder>|\[placeholder\]|lorem ipsum")
        .expect("placeholder pattern compiles")
});

static CONVENTIONAL_COMMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(feat|fix|docs|style|refactor|perf|test|build|ci|chore|revert)(\([a-z0-9_-]+\))?!?: .+")
        .expect("commit pattern compiles")
});

static MARKDOWN_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]\(([^)]+)\)").expect("link pattern compiles"));

/// Every named `#`/`##`... section must be present as a heading.
pub fn required_sections(
    target: &str,
    text: &str,
    sections: &[String],
) -> Option<ContractFailure> {
    let headings: Vec<String> = text
        .lines()
        .filter(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_lowercase())
        .collect();

    for section in sections {
        let wanted = section.to_lowercase();
        if !headings.iter().any(|h| h == &wanted) {
            return Some(
                ContractFailure::new(
                    FailureClass::MissingContent,
                    target,
                    format!("required section '{section}' is missing"),
                )
                .with_suggestion(format!("add a '# {section}' heading with real content")),
            );
        }
    }
    None
}

/// Bound the length of a whole document or one JSON string field.
pub fn length_bounds(
    target: &str,
    text: &str,
    field: Option<&str>,
    min: Option<usize>,
    max: Option<usize>,
) -> Option<ContractFailure> {
    let (subject, len) = match field {
        None => (target.to_string(), text.len()),
        Some(field) => {
            let value: serde_json::Value = match serde_json::from_str(text) {
                Ok(v) => v,
                Err(e) => {
                    return Some(ContractFailure::new(
                        FailureClass::FormatError,
                        target,
                        format!("length check needs JSON but parsing failed: {e}"),
                    ))
                }
            };
            let pointer = format!("/{}", field.replace('.', "/"));
            match value.pointer(&pointer).and_then(|v| v.as_str()) {
                Some(s) => (format!("{target}#{field}"), s.len()),
                None => {
                    return Some(
                        ContractFailure::new(
                            FailureClass::MissingContent,
                            format!("{target}#{field}"),
                            "field is absent or not a string",
                        )
                        .with_suggestion(format!("populate the '{field}' field")),
                    )
                }
            }
        }
    };

    if let Some(min) = min {
        if len < min {
            return Some(
                ContractFailure::new(
                    FailureClass::FormatError,
                    &subject,
                    format!("length {len} below minimum {min}"),
                )
                .with_suggestion("expand the content to meet the minimum length"),
            );
        }
    }
    if let Some(max) = max {
        if len > max {
            return Some(
                ContractFailure::new(
                    FailureClass::FormatError,
                    &subject,
                    format!("length {len} above maximum {max}"),
                )
                .with_suggestion("tighten the content to fit the maximum length"),
            );
        }
    }
    None
}

/// Reject unresolved placeholder markers.
pub fn no_placeholders(target: &str, text: &str) -> Option<ContractFailure> {
    PLACEHOLDER.find(text).map(|m| {
        ContractFailure::new(
            FailureClass::MissingContent,
            target,
            format!("unresolved placeholder '{}'", m.as_str()),
        )
        .with_suggestion("replace every placeholder marker with finished content")
    })
}

/// First line must be a conventional-commit header.
pub fn conventional_commit(target: &str, text: &str) -> Option<ContractFailure> {
    let first = text.lines().next().unwrap_or("");
    if CONVENTIONAL_COMMIT.is_match(first) {
        None
    } else {
        Some(
            ContractFailure::new(
                FailureClass::FormatError,
                target,
                format!("first line is not a conventional commit header: '{first}'"),
            )
            .with_suggestion("use 'type(scope): summary', e.g. 'fix(executor): retry on timeout'"),
        )
    }
}

/// Relative markdown links must resolve inside the workspace.
pub fn links_resolve(target: &str, text: &str, workspace: &Path) -> Option<ContractFailure> {
    for captures in MARKDOWN_LINK.captures_iter(text) {
        let href = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        if href.starts_with("http://")
            || href.starts_with("https://")
            || href.starts_with('#')
            || href.starts_with("mailto:")
        {
            continue;
        }
        let path = href.split('#').next().unwrap_or(href);
        if path.is_empty() {
            continue;
        }
        if !workspace.join(path).exists() {
            return Some(
                ContractFailure::new(
                    FailureClass::Structure,
                    target,
                    format!("link target '{href}' does not resolve in the workspace"),
                )
                .with_suggestion("point the link at a file the step actually produced"),
            );
        }
    }
    None
}
