use regex::RegexBuilder;
use std::cmp::Ordering;

use super::types::{Lorebook, LorebookEntry, MatchType, MatchedEntry, Message};

fn keyword_matches(keyword: &str, lowered_text: &str) -> bool {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return false;
    }
    lowered_text.contains(&keyword.to_lowercase())
}

const JS_REGEX_FLAGS: &str = "gimsuy";

/// Splits a JavaScript-style `/pattern/flags` literal. Anything else, including path-like
/// text such as `/usr/bin`, is a bare pattern.
fn regex_source(raw: &str) -> (&str, &str) {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('/') {
        if let Some(end) = trimmed.rfind('/') {
            let flags = &trimmed[end + 1..];
            if end > 0 && flags.chars().all(|c| JS_REGEX_FLAGS.contains(c)) {
                return (&trimmed[1..end], flags);
            }
        }
    }
    (trimmed, "")
}

fn regex_matches(entry: &LorebookEntry, pattern: &str, text: &str) -> bool {
    let (source, flags) = regex_source(pattern);
    // Matching is always case-insensitive; `g`, `u` and `y` have no effect on a yes/no test.
    match RegexBuilder::new(source)
        .case_insensitive(true)
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
    {
        Ok(re) => re.is_match(text),
        Err(err) => {
            tracing::warn!(
                entry = entry.name.as_str(),
                pattern,
                error = %err,
                "skipping lorebook entry with invalid regex"
            );
            false
        }
    }
}

fn match_entry(entry: &LorebookEntry, text: &str, lowered_text: &str) -> Option<MatchedEntry> {
    if entry.is_constant() {
        return Some(MatchedEntry {
            entry: entry.clone(),
            matched_keys: Vec::new(),
            match_type: MatchType::Constant,
        });
    }
    if !entry.enabled {
        return None;
    }

    let matched_keys: Vec<String> = entry
        .keys
        .iter()
        .filter(|key| keyword_matches(key, lowered_text))
        .cloned()
        .collect();
    if !matched_keys.is_empty() {
        return Some(MatchedEntry {
            entry: entry.clone(),
            matched_keys,
            match_type: MatchType::Keyword,
        });
    }

    match entry.regex.as_deref() {
        Some(pattern) if !pattern.trim().is_empty() && regex_matches(entry, pattern, text) => {
            Some(MatchedEntry {
                entry: entry.clone(),
                matched_keys: Vec::new(),
                match_type: MatchType::Regex,
            })
        }
        _ => None,
    }
}

/// Matches entries against `text`, highest priority first. Equal priorities keep input order.
pub fn scan(entries: &[LorebookEntry], text: &str) -> Vec<MatchedEntry> {
    let lowered = text.to_lowercase();
    let mut matched: Vec<MatchedEntry> = entries
        .iter()
        .filter_map(|entry| match_entry(entry, text, &lowered))
        .collect();

    // sort_by is stable, which is what keeps ties in array order.
    matched.sort_by(|a, b| {
        b.entry
            .priority
            .partial_cmp(&a.entry.priority)
            .unwrap_or(Ordering::Equal)
    });
    matched
}

/// Builds the text a lorebook is scanned against: the last `scan_depth` messages, or the
/// whole history when `scan_depth` is 0.
pub fn build_scan_text(messages: &[Message], scan_depth: usize) -> String {
    let start = if scan_depth == 0 {
        0
    } else {
        messages.len().saturating_sub(scan_depth)
    };
    messages[start..]
        .iter()
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn process_lorebook(
    lorebook: &Lorebook,
    messages: &[Message],
    scan_depth: usize,
) -> Vec<MatchedEntry> {
    if lorebook.entries.is_empty() {
        return Vec::new();
    }
    let text = build_scan_text(messages, scan_depth);
    let matched = scan(&lorebook.entries, &text);
    tracing::debug!(
        lorebook = lorebook.name.as_str(),
        scanned_chars = text.len(),
        matched = matched.len(),
        "lorebook scanned"
    );
    matched
}

/// Merges matches from several lorebooks into one priority-ordered list.
pub fn merge_matches(groups: Vec<Vec<MatchedEntry>>) -> Vec<MatchedEntry> {
    let mut all: Vec<MatchedEntry> = groups.into_iter().flatten().collect();
    all.sort_by(|a, b| {
        b.entry
            .priority
            .partial_cmp(&a.entry.priority)
            .unwrap_or(Ordering::Equal)
    });
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: serde_json::Value) -> LorebookEntry {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn keyword_and_constant_ordered_by_priority() {
        let entries = vec![
            entry(json!({"name": "dragon", "keys": ["dragon"], "content": "D", "priority": 100})),
            entry(json!({"name": "always", "constant": true, "content": "C", "priority": 50})),
        ];
        let matched = scan(&entries, "I see a dragon");
        let contents: Vec<&str> = matched.iter().map(|m| m.entry.content.as_str()).collect();
        assert_eq!(contents, vec!["D", "C"]);
        assert_eq!(matched[0].match_type, MatchType::Keyword);
        assert_eq!(matched[0].matched_keys, vec!["dragon".to_string()]);
        assert_eq!(matched[1].match_type, MatchType::Constant);
    }

    #[test]
    fn constant_matches_any_text_and_disabled_never_matches() {
        let entries = vec![
            entry(json!({"name": "c", "constant": true, "enabled": false, "content": "C"})),
            entry(json!({"name": "on", "alwaysOn": true, "content": "O"})),
            entry(json!({"name": "off", "enabled": false, "keys": ["x"], "content": "X"})),
        ];
        for text in ["", "x", "anything at all"] {
            let names: Vec<String> = scan(&entries, text)
                .into_iter()
                .map(|m| m.entry.name)
                .collect();
            assert_eq!(names, vec!["c".to_string(), "on".to_string()]);
        }
    }

    #[test]
    fn keywords_are_case_insensitive_and_collect_every_hit() {
        let entries = vec![entry(
            json!({"name": "k", "keys": ["Castle", "moat", "  ", "tower"], "content": "K"}),
        )];
        let matched = scan(&entries, "The CASTLE had a moat.");
        assert_eq!(matched.len(), 1);
        assert_eq!(
            matched[0].matched_keys,
            vec!["Castle".to_string(), "moat".to_string()]
        );
    }

    #[test]
    fn regex_is_fallback_and_errors_are_skipped() {
        let entries = vec![
            entry(json!({"name": "re", "keys": ["nope"], "regex": "sw(o|a)rd", "content": "R"})),
            entry(json!({"name": "lit", "regex": "/SHIELD/i", "content": "S"})),
            entry(json!({"name": "bad", "regex": "([unclosed", "content": "B"})),
        ];
        let matched = scan(&entries, "a Sword and a shield");
        let names: Vec<&str> = matched.iter().map(|m| m.entry.name.as_str()).collect();
        assert_eq!(names, vec!["re", "lit"]);
        assert!(matched.iter().all(|m| m.match_type == MatchType::Regex));
    }

    #[test]
    fn regex_literals_only_unwrap_with_known_flags() {
        assert_eq!(regex_source("/SHIELD/i"), ("SHIELD", "i"));
        assert_eq!(regex_source("/a.b/s"), ("a.b", "s"));
        assert_eq!(regex_source("/usr/bin"), ("/usr/bin", ""));

        let entries = vec![
            entry(json!({"name": "path", "regex": "/usr/bin", "content": "P"})),
            entry(json!({"name": "dotall", "regex": "/start.end/s", "content": "S"})),
            entry(json!({"name": "lines", "regex": "/^second$/m", "content": "L"})),
        ];
        let names: Vec<String> = scan(&entries, "see /usr/bin here\nstart\nend\nsecond")
            .into_iter()
            .map(|m| m.entry.name)
            .collect();
        assert_eq!(names, vec!["path", "dotall", "lines"]);
        assert!(scan(&entries, "usr only").is_empty());
    }

    #[test]
    fn equal_priority_keeps_array_order() {
        let entries = vec![
            entry(json!({"name": "a", "constant": true})),
            entry(json!({"name": "b", "constant": true, "priority": 5})),
            entry(json!({"name": "c", "constant": true})),
        ];
        let names: Vec<String> = scan(&entries, "").into_iter().map(|m| m.entry.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn scan_depth_limits_history() {
        let messages = vec![
            Message::user("the dragon appears"),
            Message::assistant("it flies away"),
            Message::user("quiet now"),
        ];
        let book = Lorebook {
            name: "w".into(),
            entries: vec![entry(json!({"name": "d", "keys": ["dragon"], "content": "D"}))],
            scan_depth: None,
        };
        assert!(process_lorebook(&book, &messages, 2).is_empty());
        assert_eq!(process_lorebook(&book, &messages, 3).len(), 1);
        assert_eq!(process_lorebook(&book, &messages, 0).len(), 1);
        assert_eq!(build_scan_text(&messages, 2), "it flies away\nquiet now");
    }
}
