//! Credential scrubbing for outbound log lines and dataclips.
//!
//! Every string leaf of a resolved credential is registered as a secret;
//! any occurrence in emitted text is replaced before it leaves the worker.

use std::sync::Mutex;

use serde_json::Value;

const REDACTED: &str = "***";

/// Very short values are skipped: redacting them would shred ordinary
/// words that merely coincide with a credential field.
const MIN_SECRET_LEN: usize = 4;

#[derive(Debug, Default)]
pub struct Scrubber {
    secrets: Mutex<Vec<String>>,
}

impl Scrubber {
    /// Register every string leaf of a credential object as a secret.
    pub fn add_secrets(&self, configuration: &Value) {
        let mut found = Vec::new();
        collect_strings(configuration, &mut found);
        if found.is_empty() {
            return;
        }
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        for secret in found {
            if !secrets.contains(&secret) {
                secrets.push(secret);
            }
        }
        // Longest first, so overlapping secrets redact fully.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }

    pub fn scrub(&self, text: &str) -> String {
        let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = text.to_string();
        for secret in secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.len() >= MIN_SECRET_LEN => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_credential_values_in_logs() {
        let scrubber = Scrubber::default();
        scrubber.add_secrets(&json!({"user": "admin", "password": "hunter22"}));
        assert_eq!(
            scrubber.scrub("login as admin with hunter22"),
            "login as *** with ***"
        );
    }

    #[test]
    fn skips_trivially_short_values() {
        let scrubber = Scrubber::default();
        scrubber.add_secrets(&json!({"port": "22"}));
        assert_eq!(scrubber.scrub("listening on 22"), "listening on 22");
    }

    #[test]
    fn nested_structures_are_walked() {
        let scrubber = Scrubber::default();
        scrubber.add_secrets(&json!({"oauth": {"tokens": ["tok_abcdef"]}}));
        assert_eq!(scrubber.scrub("sent tok_abcdef"), "sent ***");
    }
}
