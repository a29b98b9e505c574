//! Browser detection and tab identity extraction from window titles.
//!
//! Capture sources call [`metadata_for_window`] to turn a raw window title into
//! structured [`FocusMetadata`]; the segmenter only ever compares identity keys.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::{BrowserTabInfo, FocusMetadata};

/// Executable names recognised as browsers.
const BROWSER_EXECUTABLES: &[&str] = &[
    "chrome.exe",
    "msedge.exe",
    "firefox.exe",
    "brave.exe",
    "opera.exe",
    "safari.exe",
    "chromium.exe",
];

/// Substrings of executable paths (and display names) that indicate a browser.
const BROWSER_MARKERS: &[&str] = &[
    "chrome", "edge", "firefox", "brave", "opera", "safari", "chromium",
];

/// Title fragments that carry no identity.
const TITLE_ARTIFACTS: &[&str] = &[
    " - New Tab",
    " - New tab",
    " (Private)",
    " (Incognito)",
    " - InPrivate",
    " - Private browsing",
];

/// "Page - Google Chrome".
static CHROME_SUFFIX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?)\s*-\s*Google Chrome$").ok());

/// "Page - [Profile N - ]Microsoft Edge", tolerating a zero-width space.
static EDGE_SUFFIX: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)^(.+?)\s*-\s*(?:Profile \d+\s*-\s*)?Microsoft[\x{200B}\s]*Edge$").ok()
});

/// "Page - Firefox", "Page - Brave", ...
static GENERIC_SUFFIX: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)^(.+?)\s*-\s*(?:Brave|Mozilla Firefox|Firefox|Opera|Safari)$").ok()
});

/// Hostname-looking token, then fallbacks tried in order.
static DOMAIN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})",
        r"(?i)https?://([^/\s]+)",
        r"(?i)www\.([^/\s\-]+)",
    ]
    .into_iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// True when the process looks like a desktop web browser.
pub fn is_browser_process(process_name: &str, executable_path: &str) -> bool {
    let name = process_name.to_ascii_lowercase();
    let bare = name.trim_end_matches(".exe");
    if BROWSER_EXECUTABLES
        .iter()
        .any(|exe| *exe == name || exe.trim_end_matches(".exe") == bare)
    {
        return true;
    }
    let path = executable_path.to_ascii_lowercase();
    BROWSER_MARKERS
        .iter()
        .any(|m| path.contains(m) || name.contains(m))
}

/// Browser family derived from the process name.
pub fn browser_type(process_name: &str) -> &'static str {
    let name = process_name.to_ascii_lowercase();
    ["chrome", "edge", "firefox", "brave", "opera", "safari"]
        .into_iter()
        .find(|b| name.contains(b))
        .unwrap_or("browser")
}

/// Remove the browser suffix and known artifacts from a window title.
fn clean_title(window_title: &str) -> String {
    let page = [
        CHROME_SUFFIX.as_ref(),
        EDGE_SUFFIX.as_ref(),
        GENERIC_SUFFIX.as_ref(),
    ]
    .into_iter()
    .flatten()
    .find_map(|re| re.captures(window_title).and_then(|c| c.get(1)))
    .map_or(window_title, |m| m.as_str());

    let mut cleaned = page.to_string();
    for artifact in TITLE_ARTIFACTS {
        if let Some(pos) = cleaned.find(artifact) {
            cleaned.truncate(pos);
        }
    }
    cleaned.trim().to_string()
}

/// Find a hostname in a cleaned title.
fn find_domain(title: &str) -> Option<String> {
    let found = DOMAIN_PATTERNS
        .iter()
        .find_map(|re| re.captures(title).and_then(|c| c.get(1)))?
        .as_str();
    let host = found.strip_prefix("www.").unwrap_or(found);
    Some(host.trim_matches('.').to_string()).filter(|h| !h.is_empty())
}

/// Extract tab details from a browser window title.
pub fn extract_tab_info(window_title: &str, process_name: &str) -> BrowserTabInfo {
    let title = clean_title(window_title);
    let domain = find_domain(&title);
    let url = domain.as_ref().map(|d| format!("https://{d}"));
    BrowserTabInfo {
        domain,
        url,
        title,
        browser_type: browser_type(process_name).to_string(),
    }
}

/// Identity key for a tab: the tab's own key, else the raw window title.
pub fn tab_identity(info: &BrowserTabInfo, window_title: &str) -> String {
    let key = info.identity();
    if key.is_empty() {
        window_title.to_string()
    } else {
        key
    }
}

/// Build metadata for a focused window, detecting browsers and their tabs.
pub fn metadata_for_window(
    process_name: &str,
    executable_path: &str,
    window_title: &str,
) -> FocusMetadata {
    if is_browser_process(process_name, executable_path) {
        FocusMetadata::browser(window_title, extract_tab_info(window_title, process_name))
    } else {
        FocusMetadata::window(window_title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_browsers_by_name_and_path() {
        assert!(is_browser_process("chrome.exe", ""));
        assert!(is_browser_process("MSEDGE.EXE", ""));
        assert!(is_browser_process("Safari", "/Applications/Safari.app"));
        assert!(is_browser_process(
            "app.exe",
            "C:\\Program Files\\BraveSoftware\\Brave-Browser\\brave_helper.exe"
        ));
        assert!(!is_browser_process("Code.exe", "C:\\Program Files\\VS Code\\Code.exe"));
    }

    #[test]
    fn browser_family() {
        assert_eq!(browser_type("chrome.exe"), "chrome");
        assert_eq!(browser_type("msedge.exe"), "edge");
        assert_eq!(browser_type("Firefox"), "firefox");
        assert_eq!(browser_type("vivaldi.exe"), "browser");
    }

    #[test]
    fn chrome_title_with_domain() {
        let info = extract_tab_info("docs.rs - serde - Google Chrome", "chrome.exe");
        assert_eq!(info.title, "docs.rs - serde");
        assert_eq!(info.domain.as_deref(), Some("docs.rs"));
        assert_eq!(info.url.as_deref(), Some("https://docs.rs"));
        assert_eq!(info.browser_type, "chrome");
        assert_eq!(info.identity(), "docs.rs");
    }

    #[test]
    fn edge_profile_suffix_and_artifacts() {
        let info = extract_tab_info("Inbox (Private) - Profile 2 - Microsoft Edge", "msedge.exe");
        assert_eq!(info.title, "Inbox");
        assert_eq!(info.domain, None);
        assert_eq!(info.identity(), "Inbox");
    }

    #[test]
    fn www_prefix_is_stripped() {
        let info = extract_tab_info("www.example.com - Mozilla Firefox", "firefox.exe");
        assert_eq!(info.domain.as_deref(), Some("example.com"));
    }

    #[test]
    fn title_without_domain_uses_sanitized_identity() {
        let info = extract_tab_info("Issue 1234, comments - Brave", "brave.exe");
        assert_eq!(info.domain, None);
        assert_eq!(info.identity(), "Issue  comments");
    }

    #[test]
    fn identity_falls_back_to_window_title() {
        let info = extract_tab_info("2024 - Google Chrome", "chrome.exe");
        assert_eq!(info.identity(), "");
        assert_eq!(tab_identity(&info, "2024 - Google Chrome"), "2024 - Google Chrome");
    }

    #[test]
    fn window_metadata_for_non_browser() {
        let meta = metadata_for_window("Code.exe", "C:\\Code.exe", "main.rs - project");
        assert!(!meta.is_browser);
        assert!(meta.browser_tab.is_none());
        assert_eq!(meta.window_title.as_deref(), Some("main.rs - project"));
    }
}
