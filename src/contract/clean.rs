//! Best-effort JSON cleaning.
//!
//! LLM-produced JSON frequently arrives with `//` or `/* */` comments and
//! trailing commas. Before schema validation the candidate is repaired:
//! comments are stripped, trailing commas before `}` / `]` removed, and
//! whitespace normalized line-wise - always preserving content inside
//! string literals, including raw newlines. If the original already
//! parses it is used unchanged, which also makes cleaning idempotent. If
//! cleaning cannot produce valid JSON the caller gets the specific defect
//! rather than silently discarded data.

use serde_json::Value;

/// Result of a cleaning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Cleaned {
    pub text: String,
    /// Whether the text differs from the input.
    pub changed: bool,
}

/// Clean a JSON candidate. `Err` carries the defect description when even
/// the cleaned text fails to parse.
pub fn clean(input: &str) -> Result<Cleaned, String> {
    if serde_json::from_str::<Value>(input).is_ok() {
        return Ok(Cleaned {
            text: input.to_string(),
            changed: false,
        });
    }

    let stripped = strip_comments(input);
    let without_commas = strip_trailing_commas(&stripped);
    let normalized = normalize_line_whitespace(&without_commas);

    match serde_json::from_str::<Value>(&normalized) {
        Ok(_) => Ok(Cleaned {
            text: normalized,
            changed: true,
        }),
        Err(e) => Err(format!("still unparseable after cleaning: {e}")),
    }
}

/// Remove `//` line comments and `/* */` block comments outside strings.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Remove commas whose next significant character closes an object or
/// array. String-aware.
fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Trim trailing whitespace per line, leaving string interiors (and any
/// raw newlines inside them) untouched.
fn normalize_line_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '\n' => {
                while out.ends_with(' ') || out.ends_with('\t') || out.ends_with('\r') {
                    out.pop();
                }
                out.push('\n');
            }
            _ => out.push(c),
        }
    }
    if !in_string {
        while out.ends_with(' ') || out.ends_with('\t') {
            out.pop();
        }
    }
    out
}
