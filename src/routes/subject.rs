//! Bus subject matching.
//!
//! Subjects are `.`-separated tokens. In a filter `*` matches exactly one
//! token and a trailing `>` matches one or more tokens.

/// Subject filter for a route, narrowed by its subtopic if set
pub fn route_filter(nats_topic: &str, subtopic: &str) -> String {
    if subtopic.is_empty() {
        nats_topic.to_string()
    } else {
        format!("{}.{}", nats_topic, subtopic)
    }
}

/// Check that `filter` is a usable subscription pattern.
///
/// Tokens must be non-empty and `>` may only be the last token, so a
/// tail-wildcard topic cannot be narrowed by a subtopic.
pub fn check_filter(filter: &str) -> Result<(), String> {
    let tokens: Vec<&str> = filter.split('.').collect();

    if tokens.iter().any(|token| token.is_empty()) {
        return Err(format!("empty token in subject '{}'", filter));
    }
    if tokens[..tokens.len() - 1].contains(&">") {
        return Err(format!("'>' must be the last token in subject '{}'", filter));
    }
    Ok(())
}

/// Whether `subject` matches `filter`
pub fn matches(filter: &str, subject: &str) -> bool {
    if filter.is_empty() || subject.is_empty() {
        return false;
    }

    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(matches("channels.1", "channels.1"));
        assert!(!matches("channels.1", "channels.2"));
        assert!(!matches("channels", "channels.1"));
    }

    #[test]
    fn test_single_token_wildcard() {
        assert!(matches("channels.*", "channels.abc"));
        assert!(!matches("channels.*", "channels.abc.temp"));
        assert!(matches("channels.*.temp", "channels.abc.temp"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(matches("channels.>", "channels.abc"));
        assert!(matches("channels.>", "channels.abc.temp.x"));
        assert!(!matches("channels.>", "channels"));
    }

    #[test]
    fn test_route_filter() {
        assert_eq!(route_filter("channels.*", ""), "channels.*");
        assert_eq!(route_filter("channels.*", "temp"), "channels.*.temp");
    }

    #[test]
    fn test_check_filter() {
        assert!(check_filter("channels.>").is_ok());
        assert!(check_filter("channels.*.temp").is_ok());
        assert!(check_filter(&route_filter("channels.>", "temp")).is_err());
        assert!(check_filter("channels..temp").is_err());
        assert!(check_filter("").is_err());
    }
}
