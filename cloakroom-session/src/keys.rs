//! Key layout shared by the Redis repository and the expiration strategies.
//!
//! Session ids are wrapped in `{...}` hash tags so that every key belonging
//! to one session routes to the same cluster partition, which is what makes
//! the per-session commit transaction atomic there.

/// Prefix of every session hash key and derived channel.
pub const SESSION_PREFIX: &str = "cloakroom:session";

/// Prefix of the per-session expire marker keys.
pub const EXPIRE_PREFIX: &str = "cloakroom:session:expire";

/// Prefix of the global sorted expiry index.
pub const ALL_SESSIONS_PREFIX: &str = "cloakroom:all-sessions-set:";

/// Meta hash field: last access timestamp, 8-byte big-endian.
pub const META_LAST_ACCESSED: &str = "#:lastAccessed";
/// Meta hash field: maximum inactive interval in seconds, 4-byte big-endian.
pub const META_MAX_INACTIVE: &str = "#:maxInactiveInterval";
/// Meta hash field: creation timestamp, 8-byte big-endian.
pub const META_CREATION_TIME: &str = "#:creationTime";
/// Meta hash field: set when the session is claimed for deletion.
pub const META_INVALID: &str = "#:invalidSession";
/// Meta hash field: owning node, written only with sticky routing.
pub const META_OWNER: &str = "#:owner";
/// Every field starting with this prefix is internal.
pub const META_FIELD_PREFIX: &str = "#:";

/// Grace added to key TTLs so index entries outlive the cleanup that
/// consumes them.
pub const SAFETY_MARGIN_SECS: i64 = 300;
/// [`SAFETY_MARGIN_SECS`] in milliseconds.
pub const SAFETY_MARGIN_MS: i64 = 300_000;

/// Keyspace notification pattern for expired keys, all databases.
pub const EXPIRY_SUBSCRIPTION_PATTERN: &str = "__keyevent@*__:expired";
/// Channel suffix identifying expired-key notifications.
pub const EXPIRED_CHANNEL_SUFFIX: &str = ":expired";

/// Upper bound for the sorted-set cleanup interval, in seconds.
pub const REGULAR_CLEANUP_INTERVAL_SECS: u64 = 10;

/// Key of the session hash: `cloakroom:session:<ns>:{<id>}`.
pub fn session_key(namespace: &str, id: &str) -> String {
    format!("{SESSION_PREFIX}:{namespace}:{{{id}}}")
}

/// Key of the expire marker: `cloakroom:session:expire:<ns>:{<id>}`, with the
/// owning node spliced in before the id in sticky mode.
pub fn expire_key(namespace: &str, owner: Option<&str>, id: &str) -> String {
    match owner {
        Some(node) => format!("{EXPIRE_PREFIX}:{namespace}:{node}:{{{id}}}"),
        None => format!("{EXPIRE_PREFIX}:{namespace}:{{{id}}}"),
    }
}

/// Prefix that all of this deployment's expire markers share; the listener
/// filters notifications against it.
pub fn expire_key_prefix(namespace: &str, owner: Option<&str>) -> String {
    match owner {
        Some(node) => format!("{EXPIRE_PREFIX}:{namespace}:{node}:"),
        None => format!("{EXPIRE_PREFIX}:{namespace}:"),
    }
}

/// Key of a minute bucket: `cloakroom:session:<ns>:expirations:<instant-ms>`.
pub fn expirations_key(namespace: &str, instant_ms: i64) -> String {
    format!("{SESSION_PREFIX}:{namespace}:expirations:{instant_ms}")
}

/// Key of a forced-expiration bucket (sticky mode only).
pub fn forced_expirations_key(namespace: &str, instant_ms: i64) -> String {
    format!("{SESSION_PREFIX}:{namespace}:forced-expirations:{instant_ms}")
}

/// Key of the global sorted expiry index for a namespace.
pub fn sorted_set_key(namespace: &str) -> String {
    format!("{ALL_SESSIONS_PREFIX}{namespace}")
}

/// Channel carrying rename notifications for a namespace.
pub fn redirection_channel(namespace: &str) -> String {
    format!("{SESSION_PREFIX}:{namespace}:redirection")
}

/// Round an instant up to the start of the next whole minute.
pub fn round_up_to_next_minute(instant_ms: i64) -> i64 {
    (instant_ms.div_euclid(60_000) + 1) * 60_000
}

/// Round an instant down to the start of its minute.
pub fn round_down_minute(instant_ms: i64) -> i64 {
    instant_ms - instant_ms.rem_euclid(60_000)
}

/// Extract the session id from an expire-marker key: the segment after the
/// last `:`, with hash-tag braces stripped.
pub fn marker_session_id(marker_key: &str) -> String {
    let tail = marker_key.rsplit(':').next().unwrap_or(marker_key);
    tail.trim_start_matches('{').trim_end_matches('}').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_layout() {
        assert_eq!(session_key("default", "abc"), "cloakroom:session:default:{abc}");
    }

    #[test]
    fn test_expire_key_with_and_without_owner() {
        assert_eq!(
            expire_key("ns", None, "abc"),
            "cloakroom:session:expire:ns:{abc}"
        );
        assert_eq!(
            expire_key("ns", Some("node-1"), "abc"),
            "cloakroom:session:expire:ns:node-1:{abc}"
        );
    }

    #[test]
    fn test_session_keys_share_hash_tag() {
        // Session hash, expire marker and rename target must all route to the
        // same cluster slot; the {id} tag is what guarantees it.
        let hash = session_key("ns", "abc");
        let marker = expire_key("ns", None, "abc");

        assert!(hash.contains("{abc}"));
        assert!(marker.contains("{abc}"));
    }

    #[test]
    fn test_minute_rounding() {
        assert_eq!(round_up_to_next_minute(0), 60_000);
        assert_eq!(round_up_to_next_minute(59_999), 60_000);
        // An instant on a minute boundary still rounds to the next one.
        assert_eq!(round_up_to_next_minute(120_000), 180_000);

        assert_eq!(round_down_minute(119_999), 60_000);
        assert_eq!(round_down_minute(120_000), 120_000);
    }

    #[test]
    fn test_marker_session_id_extraction() {
        assert_eq!(marker_session_id("cloakroom:session:expire:ns:{abc}"), "abc");
        assert_eq!(
            marker_session_id("cloakroom:session:expire:ns:node-1:{abc}"),
            "abc"
        );
    }
}
