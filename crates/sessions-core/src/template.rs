use crate::error::{Result, SessionsError};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Substitute `{name}` placeholders from `vars`.
///
/// `{{` and `}}` produce literal braces. A placeholder without a value is an
/// error rather than being left in place, so half-rendered commands never run.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = None;
    let out = placeholder_re().replace_all(template, |caps: &Captures| {
        match caps.get(1) {
            None if &caps[0] == "{{" => "{".to_string(),
            None => "}".to_string(),
            Some(name) => match vars.get(name.as_str()) {
                Some(v) => v.clone(),
                None => {
                    missing.get_or_insert_with(|| name.as_str().to_string());
                    String::new()
                }
            },
        }
    });
    match missing {
        Some(name) => Err(SessionsError::Template(format!(
            "no value for placeholder '{{{name}}}' in '{template}'"
        ))),
        None => Ok(out.into_owned()),
    }
}

/// Build a variable map from `(key, value)` pairs.
pub fn vars<'a, I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
