use super::types::{MatchedEntry, Message, Role};

/// Number of consecutive `system` messages at the head of the list.
pub fn leading_system_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count()
}

/// Inserts one system message per matched entry as a contiguous block at `anchor_index`
/// (clamped to the list length). Matched order is preserved.
pub fn inject(messages: &[Message], matched: &[MatchedEntry], anchor_index: usize) -> Vec<Message> {
    let anchor = anchor_index.min(messages.len());
    let mut out = Vec::with_capacity(messages.len() + matched.len());
    out.extend_from_slice(&messages[..anchor]);
    out.extend(
        matched
            .iter()
            .map(|m| Message::system(m.entry.injected_content())),
    );
    out.extend_from_slice(&messages[anchor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_manager::types::{LorebookEntry, MatchType};

    fn matched(content: &str) -> MatchedEntry {
        MatchedEntry {
            entry: LorebookEntry {
                name: content.to_lowercase(),
                enabled: true,
                constant: true,
                always_on: false,
                keys: vec![],
                regex: None,
                content: content.to_string(),
                text: None,
                priority: 0.0,
            },
            matched_keys: vec![],
            match_type: MatchType::Constant,
        }
    }

    #[test]
    fn lands_after_leading_system_messages() {
        let messages = vec![
            Message::system("preset"),
            Message::user("hi"),
            Message::system("late system"),
        ];
        let anchor = leading_system_count(&messages);
        assert_eq!(anchor, 1);

        let out = inject(&messages, &[matched("A"), matched("B")], anchor);
        let texts: Vec<String> = out.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["preset", "A", "B", "hi", "late system"]);
        assert_eq!(out[1].role, Role::System);
        // input untouched
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn anchor_past_end_appends() {
        let messages = vec![Message::user("hi")];
        let out = inject(&messages, &[matched("A")], 10);
        assert_eq!(out.last().map(|m| m.text()), Some("A".to_string()));
    }
}
