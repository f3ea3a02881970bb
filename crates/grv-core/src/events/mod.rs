//! Gerrit stream-events data model.
//!
//! One JSON object per line arrives on the SSH channel. Only the fields the
//! daemon consumes are modeled; unknown fields are ignored.

mod filter;
mod stream;

pub use filter::EventFilter;
pub use stream::{EventStream, StreamTuning};

use serde::Deserialize;

/// A single Gerrit stream event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GerritEvent {
    /// Event kind, e.g. `patchset-created`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The change the event refers to, when present.
    #[serde(default)]
    pub change: Option<Change>,
    /// The patchset the event refers to, when present.
    #[serde(default, rename = "patchSet")]
    pub patch_set: Option<PatchSet>,
    /// Server-side creation time (epoch seconds).
    #[serde(default, rename = "eventCreatedOn")]
    pub event_created_on: i64,
}

/// Change information embedded in an event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Change {
    /// Project the change belongs to.
    pub project: String,
    /// Destination branch.
    #[serde(default)]
    pub branch: String,
    /// Stable change number.
    pub number: u64,
    /// First line of the commit message.
    #[serde(default)]
    pub subject: String,
    /// Change owner.
    #[serde(default)]
    pub owner: Option<Account>,
    /// Web URL of the change.
    #[serde(default)]
    pub url: String,
}

/// Patchset information embedded in an event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatchSet {
    /// Patchset number, monotonic within a change.
    pub number: u32,
    /// Git ref the patchset can be fetched from.
    #[serde(default, rename = "ref")]
    pub ref_name: String,
    /// Commit SHA of the patchset.
    #[serde(default)]
    pub revision: String,
    /// Account that uploaded the patchset.
    #[serde(default)]
    pub uploader: Option<Account>,
}

/// A Gerrit user account.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Account {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
    /// Login name.
    #[serde(default)]
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"type":"patchset-created","change":{"project":"tools/build","branch":"main","number":12345,"subject":"Fix flaky scheduler test","owner":{"name":"J. Dev","email":"jdev@example.com","username":"jdev"},"url":"https://gerrit.example.com/c/tools/build/+/12345"},"patchSet":{"number":3,"ref":"refs/changes/45/12345/3","revision":"deadbeef","uploader":{"username":"jdev"}},"eventCreatedOn":1712000000}"#;

    #[test]
    fn parses_patchset_created_line() {
        let event: GerritEvent = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(event.event_type, "patchset-created");
        let change = event.change.unwrap();
        assert_eq!(change.project, "tools/build");
        assert_eq!(change.number, 12345);
        assert_eq!(change.subject, "Fix flaky scheduler test");
        let ps = event.patch_set.unwrap();
        assert_eq!(ps.number, 3);
        assert_eq!(ps.ref_name, "refs/changes/45/12345/3");
        assert_eq!(event.event_created_on, 1_712_000_000);
    }

    #[test]
    fn tolerates_missing_optional_sections() {
        let event: GerritEvent =
            serde_json::from_str(r#"{"type":"ref-updated","eventCreatedOn":1}"#).unwrap();
        assert_eq!(event.event_type, "ref-updated");
        assert!(event.change.is_none());
        assert!(event.patch_set.is_none());
    }

    #[test]
    fn ignores_unknown_fields() {
        let event: GerritEvent = serde_json::from_str(
            r#"{"type":"patchset-created","somethingNew":{"a":1},"eventCreatedOn":2}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "patchset-created");
    }
}
