//! Notification dispatcher boundary.
//!
//! The core does not deliver notifications; it decides whether delivery is
//! configured, shapes the resource snapshot the external engine evaluates
//! its trigger expressions against, and records delivery attempts, deduped
//! on (commit, trigger, destination, recipient) so a steady-state sync
//! produces exactly one event per transition.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::crd::{NotificationConfig, SyncApi};
use crate::manager::error::{Error, Result};

/// Annotation prefix for per-object subscriptions:
/// `notifications.argoproj.io/subscribe.<trigger>.<destination>`.
pub const SUBSCRIBE_ANNOTATION_PREFIX: &str = "notifications.argoproj.io/subscribe.";

/// ConfigMap field holding globally configured subscriptions.
pub const MULTI_SUBSCRIPTIONS_FIELD: &str = "subscriptions";

/// One parsed subscription.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Subscription {
    pub trigger: String,
    pub destination: String,
    /// Optional comma-separated recipients from the annotation value.
    pub recipients: Vec<String>,
}

/// Parse `subscribe.<trigger>.<destination>` annotations.
pub fn parse_subscriptions(annotations: &BTreeMap<String, String>) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();
    for (key, value) in annotations {
        let Some(rest) = key.strip_prefix(SUBSCRIBE_ANNOTATION_PREFIX) else {
            continue;
        };
        let Some((trigger, destination)) = rest.split_once('.') else {
            continue;
        };
        if trigger.is_empty() || destination.is_empty() {
            continue;
        }
        let recipients = value
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect();
        subscriptions.push(Subscription {
            trigger: trigger.to_string(),
            destination: destination.to_string(),
            recipients,
        });
    }
    subscriptions.sort();
    subscriptions
}

/// Whether notifications are configured for a sync: either a subscription
/// annotation on the object, or a referenced ConfigMap with a
/// `subscriptions` block.
pub async fn notification_enabled(
    client: &Client,
    namespace: &str,
    annotations: Option<&BTreeMap<String, String>>,
    config: Option<&NotificationConfig>,
) -> Result<bool> {
    if let Some(annotations) = annotations
        && annotations
            .keys()
            .any(|k| k.starts_with(SUBSCRIBE_ANNOTATION_PREFIX))
    {
        return Ok(true);
    }

    let Some(cm_name) = config
        .and_then(|c| c.config_map_ref.as_ref())
        .and_then(|r| r.name.as_deref())
        .filter(|n| !n.is_empty())
    else {
        return Ok(false);
    };

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.get(cm_name).await {
        Ok(cm) => Ok(cm
            .data
            .as_ref()
            .is_some_and(|d| d.contains_key(MULTI_SUBSCRIPTIONS_FIELD))),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::Secret(format!(
            "notification ConfigMap {cm_name} not found in the {namespace} namespace"
        ))),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// A notification event as handed to the external delivery engine.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct NotificationEvent {
    /// Commit the event is keyed by (`lastSyncedCommit` at render time).
    pub commit: String,
    pub trigger: String,
    pub destination: String,
    #[serde(default)]
    pub recipient: String,
}

impl NotificationEvent {
    /// The dedup fingerprint: one delivery per commit/trigger/destination/
    /// recipient combination.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.commit, self.trigger, self.destination, self.recipient
        )
    }
}

/// Outcome of one delivery attempt reported by the engine.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DeliveryRecord {
    #[serde(flatten)]
    pub event: NotificationEvent,
    /// RFC 3339 timestamp of the attempt.
    pub delivered_at: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Delivery bookkeeping for one sync.
///
/// `accept` answers whether the engine should deliver an event; an event
/// already recorded (same fingerprint) is suppressed.
#[derive(Debug, Default)]
pub struct DeliveryLog {
    seen: BTreeSet<String>,
    records: Vec<DeliveryRecord>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this event has not been attempted yet.
    pub fn accept(&self, event: &NotificationEvent) -> bool {
        !self.seen.contains(&event.fingerprint())
    }

    /// Record a delivery attempt; returns false for a duplicate.
    pub fn record(&mut self, record: DeliveryRecord) -> bool {
        if !self.seen.insert(record.event.fingerprint()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn records(&self) -> &[DeliveryRecord] {
        &self.records
    }
}

/// Render the resource snapshot the engine evaluates triggers against:
/// the full sync object with status, keyed by its last synced commit.
pub fn render_snapshot<S: SyncApi>(obj: &S) -> serde_json::Value {
    let commit = obj
        .sync_status()
        .map(|s| s.last_synced_commit.clone())
        .unwrap_or_default();
    serde_json::json!({
        "apiVersion": format!("{}/v1beta1", crate::crd::API_GROUP),
        "kind": S::sync_kind(),
        "metadata": {
            "name": obj.name_any(),
            "namespace": obj.meta().namespace,
            "annotations": obj.meta().annotations,
        },
        "syncedCommit": commit,
        "resource": serde_json::to_value(obj).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_annotations() {
        let annotations = BTreeMap::from([
            (
                "notifications.argoproj.io/subscribe.on-sync-synced.local".to_string(),
                "".to_string(),
            ),
            (
                "notifications.argoproj.io/subscribe.on-sync-failed.slack".to_string(),
                "channel-a, channel-b".to_string(),
            ),
            ("unrelated".to_string(), "x".to_string()),
        ]);
        let subs = parse_subscriptions(&annotations);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].trigger, "on-sync-failed");
        assert_eq!(subs[0].recipients, vec!["channel-a", "channel-b"]);
        assert_eq!(subs[1].trigger, "on-sync-synced");
        assert_eq!(subs[1].destination, "local");
        assert!(subs[1].recipients.is_empty());
    }

    #[test]
    fn delivery_log_dedups_on_fingerprint() {
        let mut log = DeliveryLog::new();
        let event = NotificationEvent {
            commit: "abc123".into(),
            trigger: "on-sync-synced".into(),
            destination: "local".into(),
            recipient: String::new(),
        };
        assert!(log.accept(&event));
        assert!(log.record(DeliveryRecord {
            event: event.clone(),
            delivered_at: "2026-01-01T00:00:00Z".into(),
            succeeded: true,
            message: String::new(),
        }));
        // Same commit: suppressed.
        assert!(!log.accept(&event));
        assert!(!log.record(DeliveryRecord {
            event: event.clone(),
            delivered_at: "2026-01-01T00:00:30Z".into(),
            succeeded: true,
            message: String::new(),
        }));
        assert_eq!(log.records().len(), 1);

        // A new commit is a new fingerprint.
        let next = NotificationEvent {
            commit: "def456".into(),
            ..event
        };
        assert!(log.accept(&next));
    }
}
