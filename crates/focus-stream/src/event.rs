//! Event types flowing through the pipeline.
//!
//! Semantics:
//! - [`RawTick`]: what a capture source reports. `duration_us` is cumulative
//!   since the whole focus session began.
//! - [`FocusEvent`]: what consumers receive. `duration_us` is relative to the
//!   current segment, so a title or tab switch restarts the count.

use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tab;

/// Durations at or above this are always significant (5 s).
pub const SIGNIFICANT_DURATION_US: u64 = 5_000_000;

/// Process-wide counter used to make generated ids unique.
static ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Generate a unique event id of the form `evt_<µs>_<n>`.
pub fn next_event_id(timestamp: u64) -> String {
    let n = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("evt_{timestamp}_{n}")
}

/// Generate a unique session id of the form `session_<µs>_<n>`.
pub fn next_session_id() -> String {
    let n = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("session_{}_{n}", now_micros())
}

/// Kind of a delivered focus event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// The app gained focus; starts a session.
    Gained,
    /// The app lost focus; ends a session.
    Lost,
    /// Periodic cumulative-duration update within a segment.
    DurationUpdate,
    /// A tab or window-title switch inside the same app; ends a segment.
    TabChange,
}

impl EventType {
    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gained => "gained",
            Self::Lost => "lost",
            Self::DurationUpdate => "durationUpdate",
            Self::TabChange => "tabChange",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a raw tick from the capture source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TickKind {
    /// Focus moved to this app.
    Gained,
    /// Focus left this app.
    Lost,
    /// Periodic update while the app keeps focus.
    DurationUpdate,
}

impl From<TickKind> for EventType {
    fn from(kind: TickKind) -> Self {
        match kind {
            TickKind::Gained => Self::Gained,
            TickKind::Lost => Self::Lost,
            TickKind::DurationUpdate => Self::DurationUpdate,
        }
    }
}

/// Browser tab details extracted from a browser window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserTabInfo {
    /// Hostname, when one could be found.
    pub domain: Option<String>,
    /// Full or reconstructed URL.
    pub url: Option<String>,
    /// Cleaned page title.
    pub title: String,
    /// Browser family (`chrome`, `edge`, `firefox`, ...).
    pub browser_type: String,
}

impl BrowserTabInfo {
    /// Identity key: domain, else url, else the sanitized title.
    pub fn identity(&self) -> String {
        if let Some(domain) = self.domain.as_deref().filter(|d| !d.is_empty()) {
            return domain.to_string();
        }
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        sanitize_title(&self.title)
    }
}

/// Strip characters that churn in titles (digits, `.` and `,`).
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| !c.is_ascii_digit() && *c != '.' && *c != ',')
        .collect()
}

/// Previous and current identities carried by a `tabChange` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSwitch {
    /// Identity of the tab or title being left.
    pub previous: Option<String>,
    /// Identity of the tab or title being entered.
    pub current: Option<String>,
}

/// Structured metadata attached to ticks and events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusMetadata {
    /// Whether the owning process is a web browser.
    #[serde(default)]
    pub is_browser: bool,
    /// Title of the focused window.
    pub window_title: Option<String>,
    /// Browser tab details, for browsers.
    pub browser_tab: Option<BrowserTabInfo>,
    /// Set on `tabChange` events.
    pub tab_switch: Option<TabSwitch>,
    /// Unclassified extension keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl FocusMetadata {
    /// Metadata for a plain (non-browser) window.
    pub fn window(title: impl Into<String>) -> Self {
        Self {
            window_title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Metadata for a browser window with extracted tab details.
    pub fn browser(title: impl Into<String>, tab: BrowserTabInfo) -> Self {
        Self {
            is_browser: true,
            window_title: Some(title.into()),
            browser_tab: Some(tab),
            ..Self::default()
        }
    }

    /// Tab identity: the browser tab key, else the sanitized window title.
    pub fn tab_identity(&self) -> Option<String> {
        match (&self.browser_tab, &self.window_title) {
            (Some(tab), title) => {
                Some(tab::tab_identity(tab, title.as_deref().unwrap_or_default()))
                    .filter(|key| !key.is_empty())
            }
            (None, Some(title)) => Some(sanitize_title(title)),
            (None, None) => None,
        }
    }
}

/// A raw focus tick from the capture collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTick {
    /// Display name of the app.
    pub app_name: String,
    /// Stable identifier (bundle id or executable path).
    pub app_identifier: Option<String>,
    /// Owning process id.
    pub process_id: Option<u32>,
    /// Tick kind.
    pub kind: TickKind,
    /// Duration since the focus session began, in microseconds.
    pub duration_us: u64,
    /// Capture time in microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Window/tab metadata, when the source collects it.
    pub metadata: Option<FocusMetadata>,
}

impl RawTick {
    /// Build a tick for `app_name` with no identifier or metadata.
    pub fn new(app_name: impl Into<String>, kind: TickKind, timestamp: u64, duration_us: u64) -> Self {
        Self {
            app_name: app_name.into(),
            app_identifier: None,
            process_id: None,
            kind,
            duration_us,
            timestamp,
            metadata: None,
        }
    }

    /// Attach an identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.app_identifier = Some(identifier.into());
        self
    }

    /// Attach a process id.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: FocusMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Key identifying the app instance: identifier (or name) plus pid.
    pub fn app_key(&self) -> String {
        let ident = self.app_identifier.as_deref().unwrap_or(&self.app_name);
        match self.process_id {
            Some(pid) => format!("{ident}:{pid}"),
            None => ident.to_string(),
        }
    }

    /// Whether the tick comes from a browser window.
    pub fn is_browser(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.is_browser)
    }

    /// Window title, if reported.
    pub fn window_title(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.window_title.as_deref())
    }

    /// Tab identity key, if the metadata allows one.
    pub fn tab_identity(&self) -> Option<String> {
        self.metadata.as_ref().and_then(FocusMetadata::tab_identity)
    }
}

/// A normalized focus event delivered to consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusEvent {
    /// Display name of the app.
    pub app_name: String,
    /// Stable identifier (bundle id or executable path).
    pub app_identifier: Option<String>,
    /// Event time in microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Segment-relative cumulative duration in microseconds.
    #[serde(rename = "durationMicroseconds")]
    pub duration_us: u64,
    /// Owning process id.
    pub process_id: Option<u32>,
    /// Event kind.
    pub event_type: EventType,
    /// Unique event id.
    pub event_id: String,
    /// Tracking session the event belongs to.
    pub session_id: Option<String>,
    /// Window/tab metadata.
    pub metadata: Option<FocusMetadata>,
}

impl FocusEvent {
    /// Build an event of `event_type` for `app_name`, with a fresh id.
    pub fn new(app_name: impl Into<String>, event_type: EventType, timestamp: u64, duration_us: u64) -> Self {
        Self {
            app_name: app_name.into(),
            app_identifier: None,
            timestamp,
            duration_us,
            process_id: None,
            event_type,
            event_id: next_event_id(timestamp),
            session_id: None,
            metadata: None,
        }
    }

    /// Convert a raw tick verbatim, stamping a new id and the session.
    pub fn from_tick(tick: &RawTick, session_id: Option<&str>) -> Self {
        Self {
            app_name: tick.app_name.clone(),
            app_identifier: tick.app_identifier.clone(),
            timestamp: tick.timestamp,
            duration_us: tick.duration_us,
            process_id: tick.process_id,
            event_type: tick.kind.into(),
            event_id: next_event_id(tick.timestamp),
            session_id: session_id.map(str::to_string),
            metadata: tick.metadata.clone(),
        }
    }

    /// Gained and lost are always significant, as are long duration updates.
    pub fn is_significant(&self) -> bool {
        match self.event_type {
            EventType::Gained | EventType::Lost => true,
            EventType::DurationUpdate => self.duration_us >= SIGNIFICANT_DURATION_US,
            EventType::TabChange => false,
        }
    }

    /// Key used for per-app bookkeeping in the buffer.
    pub fn app_key(&self) -> &str {
        &self.app_name
    }
}
