//! Kubernetes Events about the objects the controller manages.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use uuid::Uuid;

use crate::api::{object_meta, Event, EventSource, MetaExt, Resource};
use crate::client::ResourceClient;
use crate::config::DEFAULT_NAMESPACE;

/// `source.component` of every event this controller records.
pub const COMPONENT: &str = "jx-controller";

pub const REASON_CREATED_POD: &str = "SuccessfulCreatePod";
pub const REASON_FAILED_CREATE_POD: &str = "FailedCreatePod";
pub const REASON_DELETED_POD: &str = "SuccessfulDeletePod";
pub const REASON_FAILED_DELETE_POD: &str = "FailedDeletePod";
pub const REASON_SUCCEEDED: &str = "JxTaskSucceeded";
pub const REASON_FAILED: &str = "JxTaskFailed";
pub const REASON_INVALID: &str = "InvalidJxTask";
pub const REASON_POD_NAME_TAKEN: &str = "PodNameTaken";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Writes events through the cluster client.
///
/// Recording is best effort: a failed write is logged and never fails the reconcile
/// that produced the event.
#[derive(Clone)]
pub struct EventRecorder {
    client: Arc<dyn ResourceClient<Event>>,
    component: String,
}

impl EventRecorder {
    pub fn new(client: Arc<dyn ResourceClient<Event>>, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }

    pub async fn normal<K: Resource>(&self, object: &K, reason: &str, message: impl Into<String>) {
        self.record(object, EventType::Normal, reason, message.into())
            .await
    }

    pub async fn warning<K: Resource>(
        &self,
        object: &K,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.record(object, EventType::Warning, reason, message.into())
            .await
    }

    pub async fn record<K: Resource>(
        &self,
        object: &K,
        event_type: EventType,
        reason: &str,
        message: String,
    ) {
        tracing::debug!(
            object = %object.key(),
            kind = K::KIND,
            event_type = event_type.as_str(),
            reason,
            message = %message,
            "Recording event"
        );
        let event = self.event(object, event_type, reason, message);
        if let Err(e) = self.client.create(event).await {
            tracing::warn!(object = %object.key(), reason, error = %e, "Failed to record event");
        }
    }

    fn event<K: Resource>(
        &self,
        object: &K,
        event_type: EventType,
        reason: &str,
        message: String,
    ) -> Event {
        let meta = object.meta();
        let namespace = match meta.namespace_str() {
            "" => DEFAULT_NAMESPACE,
            ns => ns,
        };
        let name = format!("{}.{}", meta.name_str(), Uuid::new_v4().simple());
        let now = Time(Utc::now());

        Event {
            metadata: object_meta(namespace, name),
            involved_object: object.object_ref(&()),
            reason: Some(reason.to_string()),
            message: Some(message),
            type_: Some(event_type.as_str().to_string()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        }
    }
}
