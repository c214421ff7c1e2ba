//! Effective environment construction for a spawned command: process env
//! overlaid with the request's env entries, then HOME/PATH defaults filled
//! in when absent or blank, plus TERM substitution for the TTY path.

use std::collections::HashMap;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/root/.local/bin";

/// Merge the guest process's own environment with the request's overlay
/// (`KEY=VALUE`, or bare `KEY` for an empty value; last write wins), then
/// fill in HOME/PATH when the merged value is absent or whitespace-only.
pub fn build_env(overlay: &Option<Vec<String>>) -> Vec<(String, String)> {
    let mut order = Vec::new();
    let mut map: HashMap<String, String> = HashMap::new();
    let mut set = |order: &mut Vec<String>, map: &mut HashMap<String, String>, key: String, value: String| {
        if !map.contains_key(&key) {
            order.push(key.clone());
        }
        map.insert(key, value);
    };

    for (key, value) in std::env::vars() {
        set(&mut order, &mut map, key, value);
    }
    if let Some(entries) = overlay {
        for entry in entries {
            let (key, value) = match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.clone(), String::new()),
            };
            set(&mut order, &mut map, key, value);
        }
    }
    if map.get("HOME").map(|v| v.trim().is_empty()).unwrap_or(true) {
        set(&mut order, &mut map, "HOME".to_string(), "/root".to_string());
    }
    if map.get("PATH").map(|v| v.trim().is_empty()).unwrap_or(true) {
        set(&mut order, &mut map, "PATH".to_string(), DEFAULT_PATH.to_string());
    }

    order
        .into_iter()
        .map(|key| {
            let value = map.remove(&key).unwrap_or_default();
            (key, value)
        })
        .collect()
}

/// TERM unset, empty, `dumb`, or `linux` is replaced with `xterm-256color`;
/// anything else is preserved as-is.
pub fn effective_term(env: &[(String, String)]) -> String {
    let current = env
        .iter()
        .find(|(k, _)| k == "TERM")
        .map(|(_, v)| v.as_str())
        .unwrap_or("");
    if current.is_empty() || current.eq_ignore_ascii_case("dumb") || current.eq_ignore_ascii_case("linux") {
        "xterm-256color".to_string()
    } else {
        current.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_last_write_wins_and_bare_key_is_empty() {
        let env = build_env(&Some(vec!["FOO=bar".to_string(), "FOO=baz".to_string(), "BARE".to_string()]));
        let as_map: HashMap<_, _> = env.into_iter().collect();
        assert_eq!(as_map.get("FOO"), Some(&"baz".to_string()));
        assert_eq!(as_map.get("BARE"), Some(&String::new()));
    }

    #[test]
    fn home_and_path_defaults_fill_when_absent() {
        let env = build_env(&None);
        let as_map: HashMap<_, _> = env.into_iter().collect();
        assert!(as_map.contains_key("HOME"));
        assert!(as_map.contains_key("PATH"));
    }

    #[test]
    fn blank_home_is_replaced() {
        let env = build_env(&Some(vec!["HOME=   ".to_string()]));
        let as_map: HashMap<_, _> = env.into_iter().collect();
        assert_eq!(as_map.get("HOME"), Some(&"/root".to_string()));
    }

    #[test]
    fn term_substitution_rules() {
        let mk = |v: &str| vec![("TERM".to_string(), v.to_string())];
        assert_eq!(effective_term(&mk("")), "xterm-256color");
        assert_eq!(effective_term(&mk("dumb")), "xterm-256color");
        assert_eq!(effective_term(&mk("linux")), "xterm-256color");
        assert_eq!(effective_term(&[]), "xterm-256color");
        assert_eq!(effective_term(&mk("screen-256color")), "screen-256color");
    }
}
