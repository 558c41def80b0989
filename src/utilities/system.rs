//! Host OS identification for task compatibility checks.

/// The OS family name tasks declare in their `supported_os` metadata.
pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "darwin",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_os_is_a_known_family() {
        let os = current_os();
        assert!(!os.is_empty());
        assert_ne!(os, "macos");
    }
}
