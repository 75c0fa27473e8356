//! Topic-pattern matching with MQTT wildcard semantics.

/// True when `topic` matches `pattern`.
///
/// `+` matches exactly one level; `#` matches zero or more trailing levels
/// and is only valid as the final segment.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut top = topic.split('/');

    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn plus_matches_exactly_one_level() {
        assert!(topic_matches("logs/+/web/info", "logs/1/web/info"));
        assert!(!topic_matches("logs/+/info", "logs/1/web/info"));
        assert!(!topic_matches("a/+", "a"));
    }

    #[test]
    fn hash_matches_zero_or_more_trailing_levels() {
        assert!(topic_matches("logs/#", "logs/1/web/info"));
        assert!(topic_matches("logs/#", "logs"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn jobs_namespace_shape() {
        assert!(topic_matches(
            "$aws/things/+/jobs/#",
            "$aws/things/dev-1/jobs/notify-next"
        ));
        assert!(!topic_matches("$aws/things/+/jobs/#", "$aws/things/dev-1/shadow"));
    }

    #[test]
    fn shadow_topics() {
        assert!(topic_matches(
            "shadow/device-state/+/update/delta",
            "shadow/device-state/u-1/update/delta"
        ));
        assert!(!topic_matches(
            "shadow/device-state/+/update/delta",
            "shadow/device-state/u-1/update/accepted"
        ));
    }
}
