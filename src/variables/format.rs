// src/variables/format.rs

//! `[Name]` template substitution

use super::{Snapshot, Value, REDACTED};
use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap());

/// Expand every token in `template`
///
/// Tokens:
/// - `[Name]` → value of the variable (first namespace that defines it)
/// - `[\[]` / `[\]]` → literal bracket
///
/// An unresolved name, an unterminated bracket, or an empty/malformed token
/// is an error; nothing is ever left in place.
pub(super) fn format_template(template: &str, vars: &Snapshot<'_>, obscure: bool) -> Result<String> {
    let fail = |reason: String| Error::FormatError {
        template: template.to_string(),
        reason,
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        // Escaped bracket: exactly one character after the backslash
        if let Some(escaped) = after.strip_prefix('\\') {
            let mut chars = escaped.chars();
            match (chars.next(), chars.next()) {
                (Some(c), Some(']')) => {
                    out.push(c);
                    rest = &escaped[c.len_utf8() + 1..];
                    continue;
                }
                _ => return Err(fail(format!("malformed escape at offset {}", offset(template, rest) + open))),
            }
        }

        let close = after
            .find(']')
            .ok_or_else(|| fail(format!("unterminated '[' at offset {}", offset(template, rest) + open)))?;
        let name = &after[..close];

        if !IDENT_RE.is_match(name) {
            return Err(fail(format!("invalid token '[{}]'", name)));
        }

        match vars.lookup(name) {
            Some(Value::SecureString(_)) if obscure => out.push_str(REDACTED),
            Some(value) => out.push_str(&value.render()),
            None => return Err(fail(format!("unresolved variable '{}'", name))),
        }

        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn offset(template: &str, rest: &str) -> usize {
    template.len() - rest.len()
}
