//! Engine configuration.

use keelmcp_protocol::{Implementation, default_supported_versions};

/// Configuration for the protocol engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity advertised in the `initialize` response
    pub server_info: Implementation,
    /// Optional instructions returned to the client after the handshake
    pub instructions: Option<String>,
    /// Protocol versions this server speaks, preferred first
    pub supported_versions: Vec<String>,
    /// How long a suspended session waits for a reconnect before closing
    pub resume_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::new("keelmcp", env!("CARGO_PKG_VERSION")),
            instructions: None,
            supported_versions: default_supported_versions(),
            resume_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the given server identity.
    pub fn new(server_info: Implementation) -> Self {
        Self {
            server_info,
            ..Default::default()
        }
    }

    /// Set the post-handshake instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Replace the supported protocol versions. The first entry is preferred
    /// and empty lists are ignored.
    #[must_use]
    pub fn with_supported_versions(mut self, versions: Vec<String>) -> Self {
        if !versions.is_empty() {
            self.supported_versions = versions;
        }
        self
    }

    /// Set the resume deadline.
    #[must_use]
    pub fn with_resume_timeout_ms(mut self, ms: u64) -> Self {
        self.resume_timeout_ms = ms;
        self
    }
}
