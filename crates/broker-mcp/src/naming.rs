//! Name codec: LLM-safe identifiers and allow/block pattern matching
//!
//! Tool-calling APIs only accept names matching `^[A-Za-z0-9_-]+$`, so both
//! the server id and the provider's tool name are sanitized before being
//! joined into the namespaced name.

use regex::Regex;
use std::collections::HashMap;

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `sanitize(server_id) + "_" + sanitize(tool_name)`, case preserved
pub fn base_tool_name(server_id: &str, tool_name: &str) -> String {
    format!("{}_{}", sanitize(server_id), sanitize(tool_name))
}

/// Case-insensitive key used to drop near-duplicate tools within one server
pub fn canonical_key(server_id: &str, tool_name: &str) -> String {
    base_tool_name(server_id, tool_name).to_lowercase()
}

/// Namespaced name unique among the keys of `taken`.
///
/// The base name is used verbatim when free; otherwise `_1`, `_2`, ... is
/// appended until an unused key is found. The check is case-sensitive.
pub fn generate_tool_name<V>(server_id: &str, tool_name: &str, taken: &HashMap<String, V>) -> String {
    let base = base_tool_name(server_id, tool_name);
    if !taken.contains_key(&base) {
        return base;
    }

    let mut suffix = 1usize;
    loop {
        let candidate = format!("{}_{}", base, suffix);
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Compiled allow/block pattern
#[derive(Debug, Clone)]
pub enum ToolMatcher {
    Exact(String),
    Glob(Regex),
}

impl ToolMatcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            ToolMatcher::Exact(pattern) => pattern == name,
            ToolMatcher::Glob(regex) => regex.is_match(name),
        }
    }
}

/// Exact equality without `*`; otherwise an anchored regex where `*` is `.*`
/// and every other character is literal.
pub fn create_matcher(pattern: &str) -> ToolMatcher {
    if !pattern.contains('*') {
        return ToolMatcher::Exact(pattern.to_string());
    }

    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("^{}$", body)) {
        Ok(regex) => ToolMatcher::Glob(regex),
        // only reachable past the regex size limit
        Err(_) => ToolMatcher::Exact(pattern.to_string()),
    }
}
