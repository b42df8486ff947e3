//! Command pattern interpolation
//!
//! Two placeholder forms:
//!
//! - `${var}`: replaced from the variable map (template defaults, caller
//!   vars, and values of the template's declared resources)
//! - `%type`: replaced by a value of resource type `type`, allocated on the
//!   spot if the instance does not hold one yet. `%%` is a literal `%`.

use std::collections::BTreeMap;

/// Replace every `${key}` with its value
pub fn substitute_vars(pattern: &str, vars: &BTreeMap<String, String>) -> String {
    vars.iter().fold(pattern.to_string(), |cmd, (key, value)| {
        cmd.replace(&format!("${{{}}}", key), value)
    })
}

/// The first `${name}` left in `cmd`, if any
pub fn unresolved_var(cmd: &str) -> Option<&str> {
    let start = cmd.find("${")?;
    let rest = &cmd[start + 2..];
    let end = rest.find('}')?;
    Some(&rest[..end])
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

enum Token<'a> {
    Text(&'a str),
    Percent,
    Placeholder(&'a str),
}

fn tokens(cmd: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    let mut rest = cmd;

    while let Some(idx) = rest.find('%') {
        if idx > 0 {
            out.push(Token::Text(&rest[..idx]));
        }
        let after = &rest[idx + 1..];

        if after.starts_with('%') {
            out.push(Token::Percent);
            rest = &after[1..];
            continue;
        }

        let len = after.find(|c: char| !is_word(c)).unwrap_or(after.len());
        if len == 0 {
            // Lone `%` before a non-word char stays as is
            out.push(Token::Text("%"));
        } else {
            out.push(Token::Placeholder(&after[..len]));
        }
        rest = &after[len..];
    }

    if !rest.is_empty() {
        out.push(Token::Text(rest));
    }
    out
}

/// Distinct `%name` placeholders in order of first appearance
pub fn placeholders(cmd: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in tokens(cmd) {
        if let Token::Placeholder(name) = token {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Replace `%name` placeholders with resolved values and `%%` with `%`.
/// Returns the name of the first placeholder missing from `values`.
pub fn fill_placeholders(cmd: &str, values: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(cmd.len());
    for token in tokens(cmd) {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Percent => out.push('%'),
            Token::Placeholder(name) => match values.get(name) {
                Some(value) => out.push_str(value),
                None => return Err(name.to_string()),
            },
        }
    }
    Ok(out)
}
