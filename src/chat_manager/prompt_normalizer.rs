//! Reshapes an arbitrary role sequence into the forms completion providers accept.
//!
//! Every function here is pure: it clones what it needs and never mutates its input.

use super::types::{ContentPart, Message, MessageContent, ProcessingMode, Role};

const SEPARATOR: &str = "\n\n";
const START_PLACEHOLDER: &str = "[Start of conversation]";
const ACK_PLACEHOLDER: &str = "[Acknowledged]";

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    pub prefill: Option<String>,
}

pub fn normalize(messages: &[Message], mode: ProcessingMode, options: &NormalizeOptions) -> Vec<Message> {
    match mode {
        ProcessingMode::None => messages.to_vec(),
        ProcessingMode::MergeSystem => merge_system(messages),
        ProcessingMode::SemiStrict => semi_strict(messages),
        ProcessingMode::Strict => strict(messages),
        ProcessingMode::SingleUser => single_user(messages),
        ProcessingMode::AnthropicPrefill => anthropic_prefill(messages, options.prefill.as_deref()),
    }
}

fn system_text(messages: &[Message]) -> Option<String> {
    let parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.text())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(SEPARATOR))
    }
}

/// One leading system message holding every system text, then everything else in order.
pub fn merge_system(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    if let Some(system) = system_text(messages) {
        out.push(Message::system(system));
    }
    out.extend(messages.iter().filter(|m| m.role != Role::System).cloned());
    out
}

/// Collapses adjacent messages that share a role into one.
pub fn merge_consecutive(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == message.role => {
                let previous = std::mem::take(&mut last.content);
                last.content = previous.concat(message.content, SEPARATOR);
            }
            _ => out.push(message),
        }
    }
    out
}

pub fn semi_strict(messages: &[Message]) -> Vec<Message> {
    merge_consecutive(merge_system(messages))
}

/// User-first, strictly alternating. System text is folded into the first user turn and
/// synthetic placeholder turns are inserted where needed; real messages are never dropped.
pub fn strict(messages: &[Message]) -> Vec<Message> {
    let mut rest: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    if let Some(system) = system_text(messages).filter(|s| !s.is_empty()) {
        match rest.iter_mut().find(|m| m.role == Role::User) {
            Some(first_user) => {
                let content = std::mem::take(&mut first_user.content);
                first_user.content = MessageContent::Text(system).concat(content, SEPARATOR);
            }
            None => rest.insert(0, Message::user(system)),
        }
    }

    if rest.is_empty() {
        return rest;
    }
    if rest[0].role != Role::User {
        rest.insert(0, Message::user(START_PLACEHOLDER));
    }

    let merged = merge_consecutive(rest);
    let mut out = Vec::with_capacity(merged.len());
    let mut expected = Role::User;
    for message in merged {
        if message.role != expected {
            match message.role {
                Role::User => out.push(Message::assistant(ACK_PLACEHOLDER)),
                _ => out.push(Message::user(START_PLACEHOLDER)),
            }
        }
        expected = if message.role == Role::User {
            Role::Assistant
        } else {
            Role::User
        };
        out.push(message);
    }
    out
}

/// Flattens the conversation into one user message of `[Role]\ncontent` blocks. Images on
/// the final non-system turn ride along as separate parts.
pub fn single_user(messages: &[Message]) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let transcript = messages
        .iter()
        .map(|m| format!("[{}]\n{}", m.role.label(), m.text()))
        .collect::<Vec<_>>()
        .join(SEPARATOR);

    let images = messages
        .iter()
        .rev()
        .find(|m| m.role != Role::System)
        .map(|m| m.content.image_parts())
        .unwrap_or_default();

    let content = if images.is_empty() {
        MessageContent::Text(transcript)
    } else {
        let mut parts = vec![ContentPart::text(transcript)];
        parts.extend(images);
        MessageContent::Parts(parts)
    };
    vec![Message::user(content)]
}

pub fn anthropic_prefill(messages: &[Message], prefill: Option<&str>) -> Vec<Message> {
    let mut out = semi_strict(messages);
    if let Some(prefill) = prefill.filter(|p| !p.is_empty()) {
        if out.last().map(|m| m.role) == Some(Role::User) {
            out.push(Message::assistant(prefill));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roles(messages: &[Message]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    fn assert_alternates_from_user(messages: &[Message]) {
        assert_eq!(messages.first().map(|m| m.role), Some(Role::User));
        for pair in messages.windows(2) {
            assert_ne!(pair[0].role, pair[1].role, "{:?}", roles(messages));
            assert_ne!(pair[1].role, Role::System);
        }
    }

    #[test]
    fn none_is_identity() {
        let input = vec![
            Message::assistant("a"),
            Message::system("s"),
            Message::assistant("b"),
        ];
        assert_eq!(normalize(&input, ProcessingMode::None, &NormalizeOptions::default()), input);
    }

    #[test]
    fn merge_system_combines_in_order() {
        let input = vec![
            Message::system("Be nice"),
            Message::system("Be brief"),
            Message::user("Hi"),
        ];
        let out = merge_system(&input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::System);
        let system = out[0].text();
        let nice = system.find("Be nice").unwrap();
        let brief = system.find("Be brief").unwrap();
        assert!(nice < brief);
        assert_eq!(out[1], Message::user("Hi"));
    }

    #[test]
    fn merge_system_is_idempotent() {
        let input = vec![
            Message::user("u1"),
            Message::system("s1"),
            Message::assistant("a1"),
            Message::system(""),
            Message::system("s2"),
        ];
        let once = merge_system(&input);
        assert_eq!(merge_system(&once), once);
    }

    #[test]
    fn semi_strict_merges_adjacent_roles() {
        let input = vec![
            Message::system("s"),
            Message::user("one"),
            Message::user("two"),
            Message::assistant("three"),
        ];
        let out = semi_strict(&input);
        assert_eq!(roles(&out), vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(out[1].text(), "one\n\ntwo");
    }

    #[test]
    fn semi_strict_keeps_image_parts() {
        let image: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}]
        }))
        .unwrap();
        let out = semi_strict(&[Message::user("look"), image]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content.image_parts().len(), 1);
        assert_eq!(out[0].text(), "look");
    }

    #[test]
    fn strict_folds_system_into_first_user() {
        let input = vec![
            Message::system("rules"),
            Message::user("hello"),
            Message::assistant("hi"),
        ];
        let out = strict(&input);
        assert_eq!(roles(&out), vec![Role::User, Role::Assistant]);
        assert_eq!(out[0].text(), "rules\n\nhello");
    }

    #[test]
    fn strict_inserts_placeholders() {
        let input = vec![
            Message::system("rules"),
            Message::assistant("greeting"),
            Message::user("u1"),
            Message::user("u2"),
            Message::assistant("a1"),
            Message::assistant("a2"),
        ];
        let out = strict(&input);
        assert_alternates_from_user(&out);
        assert_eq!(out[0].text(), START_PLACEHOLDER);
        assert_eq!(out[1].text(), "greeting");
        assert_eq!(out[2].text(), "rules\n\nu1\n\nu2");
        assert_eq!(out[3].text(), "a1\n\na2");
    }

    #[test]
    fn strict_always_alternates() {
        let shapes: Vec<Vec<Role>> = vec![
            vec![Role::Assistant],
            vec![Role::System],
            vec![Role::User, Role::System, Role::User],
            vec![Role::Assistant, Role::Assistant, Role::System, Role::User],
            vec![Role::System, Role::Assistant, Role::User, Role::Assistant, Role::User],
        ];
        for shape in shapes {
            let input: Vec<Message> = shape
                .iter()
                .enumerate()
                .map(|(i, role)| Message::new(*role, format!("m{}", i)))
                .collect();
            let out = strict(&input);
            assert_alternates_from_user(&out);
            // No real text lost.
            let joined: String = out.iter().map(|m| m.text()).collect::<Vec<_>>().join("|");
            for m in &input {
                assert!(joined.contains(&m.text()));
            }
        }
        assert!(strict(&[]).is_empty());
    }

    #[test]
    fn single_user_flattens_with_labels() {
        let input = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let out = single_user(&input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[0].text(), "[System]\nsys\n\n[User]\nhi\n\n[Assistant]\nhello");
    }

    #[test]
    fn single_user_preserves_last_turn_images() {
        let last: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]
        }))
        .unwrap();
        let out = single_user(&[Message::system("sys"), last]);
        match &out[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(parts[0].is_text());
                assert!(!parts[1].is_text());
            }
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn prefill_appended_only_after_user() {
        let opts = NormalizeOptions {
            prefill: Some("Sure,".into()),
        };
        let out = normalize(
            &[Message::system("s"), Message::user("go")],
            ProcessingMode::AnthropicPrefill,
            &opts,
        );
        assert_eq!(out.last(), Some(&Message::assistant("Sure,")));

        let out = normalize(
            &[Message::user("go"), Message::assistant("done")],
            ProcessingMode::AnthropicPrefill,
            &opts,
        );
        assert_eq!(out.last(), Some(&Message::assistant("done")));

        let empty = NormalizeOptions {
            prefill: Some(String::new()),
        };
        let out = normalize(&[Message::user("go")], ProcessingMode::AnthropicPrefill, &empty);
        assert_eq!(out.len(), 1);
    }
}
