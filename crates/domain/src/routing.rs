//! Mention extraction and routing-target resolution.
//!
//! An agent's reply decides where the conversation goes next: the first
//! `@mention` becomes the target, the rest queue up as later hops. With
//! no mentions, the pending queue (if any) pops its head; otherwise the
//! reply goes back to whoever triggered the call.

use std::sync::LazyLock;

use regex::Regex;

use crate::message::RoutingMeta;

/// Matches `@name` where the mention is not glued to a preceding word
/// character, and `name` is word chars optionally extended with `.`/`-`
/// (but never ending on one).
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9A-Za-z_])@([0-9A-Za-z_](?:[0-9A-Za-z_.\-]*[0-9A-Za-z_])?)")
        .expect("mention regex is valid")
});

/// Extract all `@mentions` from `text` in order of appearance.
pub fn extract_mentions(text: &str) -> Vec<String> {
    MENTION_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Resolve the routing target for an agent response.
///
/// - With mentions: first is the target, the rest become the queue.
/// - Without: pop the head of the inherited queue, or fall back to the
///   sender of the source message.
pub fn resolve_route(
    response: &str,
    inherited_queue: &[String],
    source_sender_id: Option<&str>,
) -> RoutingMeta {
    let mentions = extract_mentions(response);
    if let Some((first, rest)) = mentions.split_first() {
        return RoutingMeta {
            target_id: Some(first.clone()),
            target_queue: rest.to_vec(),
        };
    }
    if let Some((head, tail)) = inherited_queue.split_first() {
        return RoutingMeta {
            target_id: Some(head.clone()),
            target_queue: tail.to_vec(),
        };
    }
    RoutingMeta {
        target_id: source_sender_id.map(str::to_string),
        target_queue: Vec::new(),
    }
}

/// Strip a leading self-reference (`[Name]:` or `@Name `) from an
/// agent's own output. Models echo these back when history prefixes
/// other speakers the same way.
pub fn strip_self_prefix<'a>(answer: &'a str, agent_name: &str) -> &'a str {
    let trimmed = answer.trim_start();
    let bracket = format!("[{agent_name}]:");
    if let Some(rest) = trimmed.strip_prefix(&bracket) {
        return rest.trim_start();
    }
    let at = format!("@{agent_name}");
    if let Some(rest) = trimmed.strip_prefix(&at) {
        if rest.starts_with([' ', ',', ':']) {
            return rest[1..].trim_start();
        }
    }
    answer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_mentions() {
        assert_eq!(extract_mentions("@Writer, hello"), vec!["Writer"]);
        assert_eq!(
            extract_mentions("@Researcher and @Writer, collaborate"),
            vec!["Researcher", "Writer"]
        );
    }

    #[test]
    fn mention_not_glued_to_word() {
        // An email-style `a@b` is not a mention.
        assert!(extract_mentions("mail me at alex@example.com").is_empty());
        assert_eq!(extract_mentions("(@Helper)"), vec!["Helper"]);
        assert_eq!(extract_mentions("@a@b"), vec!["a"]);
    }

    #[test]
    fn mention_allows_inner_dots_and_dashes() {
        assert_eq!(extract_mentions("ping @data-bot.v2 now"), vec!["data-bot.v2"]);
        // Trailing punctuation is not part of the name.
        assert_eq!(extract_mentions("thanks @Writer."), vec!["Writer"]);
    }

    #[test]
    fn route_prefers_mentions() {
        let r = resolve_route("@X please, then @Y", &["Z".to_string()], Some("Alex"));
        assert_eq!(r.target_id.as_deref(), Some("X"));
        assert_eq!(r.target_queue, vec!["Y"]);
    }

    #[test]
    fn route_pops_inherited_queue() {
        let r = resolve_route(
            "done, here are my findings",
            &["Writer".to_string(), "Reviewer".to_string()],
            Some("Alex"),
        );
        assert_eq!(r.target_id.as_deref(), Some("Writer"));
        assert_eq!(r.target_queue, vec!["Reviewer"]);
    }

    #[test]
    fn route_falls_back_to_sender() {
        let r = resolve_route("all done", &[], Some("Alex"));
        assert_eq!(r.target_id.as_deref(), Some("Alex"));
        assert!(r.target_queue.is_empty());
    }

    #[test]
    fn strips_bracket_prefix() {
        assert_eq!(strip_self_prefix("[Writer]: Here it is", "Writer"), "Here it is");
        assert_eq!(strip_self_prefix("@Writer here", "Writer"), "here");
        // Another agent's prefix is left alone.
        assert_eq!(
            strip_self_prefix("[Reviewer]: notes", "Writer"),
            "[Reviewer]: notes"
        );
        // A mention of someone else at the start is routing, not a prefix.
        assert_eq!(
            strip_self_prefix("@Reviewer take a look", "Writer"),
            "@Reviewer take a look"
        );
    }
}
