use crate::tracker::{ResourceKind, ResourceTracker, Token};

/// Display mode configuration. The mock device registers no CRTCs or connectors; the object
/// exists so that code asking about KMS users gets an answer.
#[derive(Debug)]
pub struct ModeConfig {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    crtcs: Vec<String>,
    _token: Token,
}

impl ModeConfig {
    pub fn init(tracker: &ResourceTracker) -> Self {
        Self {
            min_width: 0,
            min_height: 0,
            max_width: 0,
            max_height: 0,
            crtcs: Vec::new(),
            _token: tracker.acquire(ResourceKind::ModeConfig),
        }
    }

    pub fn has_kms_users(&self) -> bool {
        !self.crtcs.is_empty()
    }

    pub fn cleanup(self) {
        tracing::debug!(crtcs = self.crtcs.len(), "mode config cleanup");
    }
}
