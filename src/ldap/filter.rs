//! RFC 4515 search filters and RFC 4514 DN values.
//!
//! Templates use positional placeholders (`{0}`, `{1}`, ...). Arguments are
//! always escaped before substitution, and substitution is a single pass so
//! an argument can never introduce a new placeholder.

use thiserror::Error;

/// A template that does not yield a well-formed filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{0}` is not a valid search filter")]
pub struct InvalidFilter(pub String);

/// Escape a value for use inside a search filter.
pub fn escape_filter_value(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '*' => out.push_str(r"\2a"),
            '(' => out.push_str(r"\28"),
            ')' => out.push_str(r"\29"),
            '\\' => out.push_str(r"\5c"),
            '\0' => out.push_str(r"\00"),
            c => out.push(c),
        }
    }
    out
}

/// Escape an attribute value for use inside a DN.
pub fn escape_dn_value(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let last = input.chars().count().saturating_sub(1);
    for (i, c) in input.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(c);
            },
            '#' if i == 0 => out.push_str(r"\#"),
            ' ' if i == 0 || i == last => out.push_str(r"\ "),
            '\0' => out.push_str(r"\00"),
            c => out.push(c),
        }
    }
    out
}

/// Substitute `{n}` placeholders in one pass.
///
/// Arguments are inserted verbatim, so callers escape them first.
/// Placeholders without a matching argument are left untouched.
pub fn format_template(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let index = after
            .find('}')
            .and_then(|close| after[..close].parse::<usize>().ok().map(|i| (i, close)));

        match index.and_then(|(i, close)| args.get(i).map(|arg| (arg, close))) {
            Some((arg, close)) => {
                out.push_str(arg);
                rest = &after[close + 1..];
            },
            None => {
                out.push('{');
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

/// Build a search filter from a template, escaping every argument.
pub fn build_filter(template: &str, args: &[&str]) -> String {
    let escaped: Vec<String> =
        args.iter().map(|a| escape_filter_value(a)).collect();
    let refs: Vec<&str> = escaped.iter().map(String::as_str).collect();
    format_template(template, &refs)
}

/// Check that a template yields a well-formed filter once filled.
pub fn validate_template(
    template: &str,
    placeholders: usize,
) -> Result<(), InvalidFilter> {
    let sample: Vec<&str> = (0..placeholders).map(|_| "sample").collect();
    let filter = format_template(template, &sample);
    match ldap3::parse_filter(&filter) {
        Ok(_) => Ok(()),
        Err(()) => Err(InvalidFilter(filter)),
    }
}
