use lazy_static::lazy_static;
use rand::Rng;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::types::{MacroContext, Message};

lazy_static! {
    static ref CHAR_RE: Regex = Regex::new(r"(?i)\{\{char\}\}").unwrap();
    static ref USER_RE: Regex = Regex::new(r"(?i)\{\{(?:user|persona)\}\}").unwrap();
    static ref RANDOM_RE: Regex = Regex::new(r"(?is)\{\{random:(.*?)\}\}").unwrap();
    static ref PICK_RE: Regex = Regex::new(r"(?is)\{\{pick:(.*?)\}\}").unwrap();
    static ref ROLL_RE: Regex = Regex::new(r"(?i)\{\{roll:\s*d?(\d+)\s*\}\}").unwrap();
    static ref REVERSE_RE: Regex = Regex::new(r"(?is)\{\{reverse:(.*?)\}\}").unwrap();
    static ref COMMENT_RE: Regex =
        Regex::new(r"(?is)\{\{(?://|comment:|hidden_key:).*?\}\}").unwrap();
}

/// Remembers `{{pick:...}}` choices keyed by `"pick:" + options`.
///
/// Shared by every expansion that receives the same handle; the owner decides when a
/// conversation ends and calls [`PickCache::clear`].
#[derive(Debug, Default, Clone)]
pub struct PickCache {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl PickCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().ok().and_then(|map| map.get(key).cloned())
    }

    fn get_or_insert_with<F>(&self, key: String, pick: F) -> String
    where
        F: FnOnce() -> String,
    {
        match self.inner.lock() {
            Ok(mut map) => map.entry(key).or_insert_with(pick).clone(),
            // A poisoned lock only loses memoization, not the draw itself.
            Err(_) => pick(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.inner.lock() {
            map.clear();
        }
    }
}

/// Splits a macro option list on commas, honouring `\,` as a literal comma.
fn split_options(raw: &str) -> Vec<String> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => options.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    options.push(current);
    options.into_iter().map(|o| o.trim().to_string()).collect()
}

fn draw(options: &[String]) -> String {
    if options.is_empty() {
        return String::new();
    }
    let idx = rand::thread_rng().gen_range(0..options.len());
    options[idx].clone()
}

pub struct MacroExpander {
    picks: PickCache,
}

impl MacroExpander {
    pub fn new(picks: PickCache) -> Self {
        Self { picks }
    }

    pub fn pick_cache(&self) -> &PickCache {
        &self.picks
    }

    pub fn expand(&self, text: &str, context: &MacroContext, remove_comments: bool) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }

        let char_name = context
            .char_nickname
            .as_deref()
            .or(context.char_name.as_deref())
            .unwrap_or("Character");
        let user_name = context.user_name.as_deref().unwrap_or("User");

        let out = CHAR_RE.replace_all(text, regex::NoExpand(char_name));
        let out = USER_RE.replace_all(&out, regex::NoExpand(user_name));

        let out = RANDOM_RE.replace_all(&out, |caps: &Captures| draw(&split_options(&caps[1])));

        let out = PICK_RE.replace_all(&out, |caps: &Captures| {
            let raw = &caps[1];
            self.picks
                .get_or_insert_with(format!("pick:{}", raw), || draw(&split_options(raw)))
        });

        let out = ROLL_RE.replace_all(&out, |caps: &Captures| match caps[1].parse::<u64>() {
            Ok(sides) if sides >= 1 => rand::thread_rng().gen_range(1..=sides).to_string(),
            _ => caps[0].to_string(),
        });

        let out = REVERSE_RE.replace_all(&out, |caps: &Captures| {
            caps[1].chars().rev().collect::<String>()
        });

        if remove_comments {
            COMMENT_RE.replace_all(&out, "").into_owned()
        } else {
            out.into_owned()
        }
    }

    /// Expands every text piece of every message; image parts pass through.
    pub fn expand_messages(
        &self,
        messages: &[Message],
        context: &MacroContext,
        remove_comments: bool,
    ) -> Vec<Message> {
        messages
            .iter()
            .map(|m| Message {
                role: m.role,
                content: m
                    .content
                    .map_text(|t| self.expand(t, context, remove_comments)),
            })
            .collect()
    }
}
