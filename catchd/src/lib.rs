//! Catch daemon library.
//!
//! Core components of the single-host service manager: the state store,
//! installer pipeline, supervisor runners, embedded container registry, and
//! the SSH/HTTP administrative surfaces.

pub mod api;
pub mod authz;
pub mod classify;
pub mod cli;
pub mod cron;
pub mod daemon;
pub mod events;
pub mod installer;
pub mod mounts;
pub mod netns;
pub mod registry;
pub mod render;
pub mod runner;
pub mod settings;
pub mod ssh;
pub mod store;

/// Name of the meta-service used for cross-cutting commands.
pub const SYSTEM_SERVICE: &str = "sys";

/// Name of the self-service that manages the daemon itself.
pub const CATCH_SERVICE: &str = "catch";

/// Whether a service name is well-formed: non-empty `[a-z0-9_-]+`.
///
/// Every caller-supplied service name passes through this before it is
/// joined into a filesystem path, so nothing resembling a path component
/// separator ever reaches the service root.
pub fn valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_match_the_allowed_alphabet() {
        assert!(valid_service_name("web"));
        assert!(valid_service_name("my_app-2"));
        assert!(valid_service_name(SYSTEM_SERVICE));
        assert!(valid_service_name(CATCH_SERVICE));

        assert!(!valid_service_name(""));
        assert!(!valid_service_name("Web"));
        assert!(!valid_service_name("a b"));
        assert!(!valid_service_name("../../etc"));
        assert!(!valid_service_name("a/b"));
        assert!(!valid_service_name("a.b"));
    }
}
