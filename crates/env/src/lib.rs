//! Environment helpers for the bridge configuration layer.

use std::path::PathBuf;

/// Parse a positive (`> 0`) u64 env var.
#[must_use]
pub fn positive_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Split a comma-separated list, keeping first-seen order and dropping blanks and duplicates.
#[must_use]
pub fn csv_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|seen| seen == item) {
            out.push(item.to_string());
        }
    }
    out
}

/// Expand a leading `~/` to `$HOME/`.
///
/// Paths without the prefix, or when `HOME` is unset, are returned unchanged.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

/// Expand `${VAR}` occurrences in a string using environment variables.
///
/// An unterminated `${` is left as-is.
///
/// # Errors
///
/// Returns `Err(...)` when a referenced environment variable is not set.
pub fn expand_env_string(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(open) = rest.find("${") {
        let Some(close) = rest[open + 2..].find('}') else {
            break;
        };
        let var_name = &rest[open + 2..open + 2 + close];
        let value = std::env::var(var_name).map_err(|_| {
            format!("Environment variable '{var_name}' not found (referenced in config)")
        })?;
        out.push_str(&rest[..open]);
        out.push_str(&value);
        rest = &rest[open + 2 + close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

pub mod serde_helpers {
    use super::expand_env_string;
    use serde::{Deserialize, Deserializer};

    /// Deserialize `Option<u64>` that may reference `${ENV}` inside a string.
    ///
    /// Supported forms: `null`, number, or string.
    pub fn deserialize_option_u64_env<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as DeError;

        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| D::Error::custom("expected unsigned integer")),
            Some(serde_json::Value::String(s)) => {
                let expanded = expand_env_string(&s).map_err(D::Error::custom)?;
                let expanded = expanded.trim();
                expanded.parse::<u64>().map(Some).map_err(|e| {
                    D::Error::custom(format!("expected unsigned integer, got '{expanded}': {e}"))
                })
            }
            Some(other) => Err(D::Error::custom(format!(
                "expected unsigned integer or string, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_list_keeps_order_and_drops_duplicates() {
        assert_eq!(csv_list(" git, fs,,git ,time"), vec!["git", "fs", "time"]);
        assert!(csv_list(" , ").is_empty());
    }

    #[test]
    fn expand_env_string_replaces_every_reference() {
        unsafe { std::env::set_var("MCP_BRIDGE_ENV_TEST_A", "alpha") };
        unsafe { std::env::set_var("MCP_BRIDGE_ENV_TEST_B", "beta") };
        assert_eq!(
            expand_env_string("${MCP_BRIDGE_ENV_TEST_A}-${MCP_BRIDGE_ENV_TEST_B}/x").unwrap(),
            "alpha-beta/x"
        );
        assert_eq!(expand_env_string("plain").unwrap(), "plain");
        assert_eq!(expand_env_string("open ${ only").unwrap(), "open ${ only");
    }

    #[test]
    fn expand_env_string_reports_missing_variable() {
        let err = expand_env_string("${MCP_BRIDGE_ENV_TEST_MISSING_9911}").unwrap_err();
        assert!(err.contains("MCP_BRIDGE_ENV_TEST_MISSING_9911"), "{err}");
    }

    #[test]
    fn expand_home_leaves_other_paths_alone() {
        assert_eq!(expand_home("/etc/mcp.json"), PathBuf::from("/etc/mcp.json"));
        assert_eq!(expand_home("relative.json"), PathBuf::from("relative.json"));
    }
}
