//! Collaborator seams consumed by the conversation controller.
//!
//! Settings, model registry, notifications, and sound live outside this
//! crate; the controller only sees these traits, injected at construction.

use std::time::Duration;

use serde_json::{json, Value};

/// One deployable version of a model, with its own streaming capability flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelVersion {
    pub version_name: String,
    pub streaming: bool,
}

/// A registered model and its available versions.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub versions: Vec<ModelVersion>,
}

/// How long a notification toast stays on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationDisplayTime {
    TwoSeconds,
    #[default]
    ThreeSeconds,
    FiveSeconds,
    TenSeconds,
}

impl NotificationDisplayTime {
    pub fn duration(self) -> Duration {
        match self {
            NotificationDisplayTime::TwoSeconds => Duration::from_secs(2),
            NotificationDisplayTime::ThreeSeconds => Duration::from_secs(3),
            NotificationDisplayTime::FiveSeconds => Duration::from_secs(5),
            NotificationDisplayTime::TenSeconds => Duration::from_secs(10),
        }
    }
}

/// Read-only view of user and system settings.
pub trait SettingsProvider: Send + Sync {
    /// Process-wide switch for the streaming transport. Both this and the
    /// model version's own flag must be set for a send to stream.
    fn streaming_enabled(&self) -> bool;

    /// The model registry as last fetched from the backend.
    fn models(&self) -> Vec<ModelEntry>;

    /// Per-model generation parameters forwarded verbatim to the backend.
    fn model_params(&self, _model: &str) -> Value {
        json!({})
    }

    /// Retrieval-augmentation config forwarded verbatim to the backend.
    fn rag_config(&self) -> Value {
        json!({})
    }

    fn notification_display_time(&self) -> NotificationDisplayTime {
        NotificationDisplayTime::default()
    }

    fn new_message_notifications_enabled(&self) -> bool {
        true
    }

    fn sound_enabled(&self) -> bool {
        false
    }
}

/// Fire-and-forget toast surface.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, display_time: Duration);
}

/// Fire-and-forget notification sound.
pub trait SoundPlayer: Send + Sync {
    fn play_notification(&self);
}

/// Qualify a bare version name into the `model-version` form the backend
/// expects. Names already containing `-` pass through unchanged, as do names
/// the registry does not know.
pub fn qualify_model_name(model: &str, registry: &[ModelEntry]) -> String {
    if model.contains('-') {
        return model.to_string();
    }
    for entry in registry {
        for version in &entry.versions {
            if version.version_name == model {
                return format!("{}-{}", entry.name, version.version_name);
            }
        }
    }
    model.to_string()
}

/// Whether the given `model-version` identifier supports streaming according
/// to the registry. Unknown models do not.
pub fn model_supports_streaming(model: &str, registry: &[ModelEntry]) -> bool {
    let Some((name, version_name)) = model.split_once('-') else {
        return false;
    };
    registry
        .iter()
        .find(|entry| entry.name == name)
        .and_then(|entry| {
            entry
                .versions
                .iter()
                .find(|version| version.version_name == version_name)
        })
        .map(|version| version.streaming)
        .unwrap_or(false)
}
