//! Capability negotiation.
//!
//! The negotiated capability set is the intersection of what each side
//! advertised. Standard capabilities intersect structurally (a side that did
//! not advertise a capability removes it from the negotiated set for that
//! side); `experimental` maps intersect by key, with the advertising side's
//! value carried through opaquely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ClientCapabilities, Implementation, ServerCapabilities};

/// State frozen after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedState {
    /// The protocol version both sides speak
    pub protocol_version: String,
    /// Client capabilities after intersection
    pub client_capabilities: ClientCapabilities,
    /// Server capabilities after intersection
    pub server_capabilities: ServerCapabilities,
    /// Client implementation info
    pub client_info: Implementation,
    /// Server implementation info
    pub server_info: Implementation,
}

impl NegotiatedState {
    /// Merge both sides' advertisements into the frozen negotiated state.
    ///
    /// The server's advertisement is what its registry actually enables, so
    /// the intersection here is the final gate set for dispatch.
    pub fn negotiate(
        protocol_version: String,
        client: ClientCapabilities,
        server: ServerCapabilities,
        client_info: Implementation,
        server_info: Implementation,
    ) -> Self {
        let experimental = intersect_experimental(
            client.experimental.as_ref(),
            server.experimental.as_ref(),
        );
        let client_capabilities = ClientCapabilities {
            experimental: experimental.clone(),
            ..client
        };
        let server_capabilities = ServerCapabilities {
            experimental,
            ..server
        };
        Self {
            protocol_version,
            client_capabilities,
            server_capabilities,
            client_info,
            server_info,
        }
    }

    /// Whether the server side negotiated logging.
    pub fn has_logging(&self) -> bool {
        self.server_capabilities.logging.is_some()
    }

    /// Whether the server side negotiated tools.
    pub fn has_tools(&self) -> bool {
        self.server_capabilities.tools.is_some()
    }

    /// Whether the server side negotiated prompts.
    pub fn has_prompts(&self) -> bool {
        self.server_capabilities.prompts.is_some()
    }

    /// Whether the server side negotiated resources.
    pub fn has_resources(&self) -> bool {
        self.server_capabilities.resources.is_some()
    }

    /// Whether per-resource subscriptions were negotiated.
    pub fn has_resource_subscriptions(&self) -> bool {
        self.server_capabilities
            .resources
            .as_ref()
            .is_some_and(|r| r.subscribe.unwrap_or(false))
    }

    /// Whether the server side negotiated completions.
    pub fn has_completions(&self) -> bool {
        self.server_capabilities.completions.is_some()
    }

    /// Whether the client side negotiated elicitation.
    pub fn has_elicitation(&self) -> bool {
        self.client_capabilities.elicitation.is_some()
    }
}

/// Keys present on both sides survive; values come from the server side.
fn intersect_experimental(
    client: Option<&HashMap<String, Value>>,
    server: Option<&HashMap<String, Value>>,
) -> Option<HashMap<String, Value>> {
    let (client, server) = (client?, server?);
    let merged: HashMap<String, Value> = server
        .iter()
        .filter(|(key, _)| client.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if merged.is_empty() { None } else { Some(merged) }
}
