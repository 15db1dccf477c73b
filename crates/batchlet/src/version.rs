//! Version information for batchlet.

/// Batchlet version from Cargo.toml
pub const BATCHLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported in server metadata.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Batchlet server version.
    pub batchlet: &'static str,
    /// Version of the packaged model, if the model declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            batchlet: BATCHLET_VERSION,
            model: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, version: String) -> Self {
        self.model = Some(version);
        self
    }
}
