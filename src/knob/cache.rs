//! Settings audit for one init transaction.
//!
//! While an init transaction is open every command line that reaches the device is
//! recorded per site together with its effective value. Closing the transaction
//! hands back the collected settings as JSON, which is the applied-commands log of
//! the shot.

use super::schema::KnobSchema;
use parking_lot::Mutex;
use std::collections::BTreeMap;

type SiteSettings = BTreeMap<String, String>;

/// Map of knob path to last value, keyed by site, alive during one init.
#[derive(Debug)]
pub struct SettingsCache {
    host: String,
    entries: Mutex<Option<BTreeMap<u8, SiteSettings>>>,
}

impl SettingsCache {
    /// Create a closed cache for `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            entries: Mutex::new(None),
        }
    }

    /// Open a transaction, discarding anything left from a previous one.
    pub fn begin(&self) {
        let mut entries = self.entries.lock();
        if entries.is_some() {
            tracing::warn!(host = %self.host, "settings transaction reopened, previous entries dropped");
        }
        *entries = Some(BTreeMap::new());
    }

    /// Whether a transaction is open.
    pub fn is_open(&self) -> bool {
        self.entries.lock().is_some()
    }

    /// Record one request line and the response it produced.
    ///
    /// The response wins when it carries a value; a set with an empty answer records
    /// the value that was sent. Volatile commands are skipped.
    pub fn record(&self, site: u8, schema: &KnobSchema, line: &str, response: &str) {
        let mut guard = self.entries.lock();
        let Some(entries) = guard.as_mut() else {
            return;
        };
        let line = line.trim();
        if schema.is_volatile(line) {
            return;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or("");
        let sent = parts.next().map(str::trim).unwrap_or("");
        let answer = strip_echo(name, response.trim());

        let value = if !answer.is_empty() {
            answer
        } else if !sent.is_empty() {
            sent
        } else {
            return;
        };
        entries
            .entry(site)
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    /// Last recorded value for `path` on `site`.
    pub fn get(&self, site: u8, path: &str) -> Option<String> {
        self.entries
            .lock()
            .as_ref()
            .and_then(|e| e.get(&site))
            .and_then(|s| s.get(path))
            .cloned()
    }

    /// Close the transaction and return the audit log.
    ///
    /// Returns `None` when no transaction was open.
    pub fn close(&self) -> Option<serde_json::Value> {
        let entries = self.entries.lock().take()?;
        let log: BTreeMap<String, SiteSettings> = entries
            .into_iter()
            .map(|(site, settings)| (site.to_string(), settings))
            .collect();
        let json = serde_json::to_value(&log).ok()?;
        tracing::info!(host = %self.host, commands = %json, "applied settings");
        Some(json)
    }
}

/// Remove a leading `<name> ` echo from a response.
pub fn strip_echo<'a>(name: &str, response: &'a str) -> &'a str {
    match response.strip_prefix(name) {
        Some(rest) if rest.is_empty() => "",
        Some(rest) if rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => response,
    }
}
