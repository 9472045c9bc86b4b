/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for cache directories.
/// Bump this when changing the URL index or manifest cache formats.
pub const SCHEMA_VERSION: u32 = 1;

/// User agent sent with every HTTP request.
#[must_use]
pub fn user_agent() -> String {
    format!("opamfetch/{VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_contains_version() {
        let ua = user_agent();
        assert!(ua.starts_with("opamfetch/"));
        assert!(ua.ends_with(VERSION));
    }

    #[test]
    fn test_schema_version_positive() {
        assert_eq!(format!("v{SCHEMA_VERSION}"), "v1");
    }
}
