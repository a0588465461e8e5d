//! Login and session wrapper pages.

use std::path::Path;

use anyhow::{Context, Result};
use log::info;

/// Fallback pages compiled into the binary.
mod embedded {
    pub const LOGIN: &str = include_str!("embedded/login.html");
    pub const SESSION: &str = include_str!("embedded/session.html");
}

const SESSION_ID_PLACEHOLDER: &str = "{{session_id}}";

#[derive(Debug, Clone)]
pub struct Pages {
    login: String,
    session: String,
}

impl Default for Pages {
    fn default() -> Self {
        Self {
            login: embedded::LOGIN.to_string(),
            session: embedded::SESSION.to_string(),
        }
    }
}

impl Pages {
    /// Load pages, preferring `login.html` / `session.html` from `dir`.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut pages = Self::default();
        let Some(dir) = dir else {
            return Ok(pages);
        };

        for (name, slot) in [
            ("login.html", &mut pages.login),
            ("session.html", &mut pages.session),
        ] {
            let path = dir.join(name);
            if path.is_file() {
                *slot = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading template {}", path.display()))?;
                info!("Using template override {}", path.display());
            }
        }
        Ok(pages)
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    /// Session wrapper page for `session_id`.
    pub fn session(&self, session_id: &str) -> String {
        self.session.replace(SESSION_ID_PLACEHOLDER, session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_page_wires_endpoints() {
        let page = Pages::default().session("abc123");
        assert!(page.contains("/proxy/abc123/vnc.html"));
        assert!(page.contains("path=proxy/abc123/websockify"));
        assert!(page.contains("/ping/abc123"));
        assert!(page.contains("/logout/abc123"));
        assert!(!page.contains(SESSION_ID_PLACEHOLDER));
    }

    #[test]
    fn test_login_posts_credentials() {
        let pages = Pages::default();
        assert!(pages.login().contains(r#"action="/login""#));
        assert!(pages.login().contains(r#"name="username""#));
        assert!(pages.login().contains(r#"name="password""#));
    }

    #[test]
    fn test_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("login.html"), "<p>custom</p>").unwrap();

        let pages = Pages::load(Some(dir.path())).unwrap();
        assert_eq!(pages.login(), "<p>custom</p>");
        assert!(pages.session("x").contains("/ping/x"));
    }
}
