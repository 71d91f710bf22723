//! Protocol version negotiation.
//!
//! The server holds an ordered list of supported versions, preferred first.
//! Negotiation never fails: a client asking for an unknown version gets the
//! server's preferred version echoed back and may terminate on its own if it
//! cannot accept it.

/// Protocol versions this core speaks, preferred first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26"];

/// Pick the version to answer an `initialize` with.
///
/// If the client's requested version appears in `supported`, it is echoed
/// back; otherwise the first (preferred) entry wins. `supported` must be
/// non-empty; the engine guarantees this via its config validation.
pub fn negotiate_version(supported: &[String], requested: &str) -> String {
    if let Some(found) = supported.iter().find(|v| v.as_str() == requested) {
        return found.clone();
    }
    let preferred = supported
        .first()
        .map_or(SUPPORTED_PROTOCOL_VERSIONS[0], String::as_str);
    tracing::warn!(
        requested,
        negotiated = preferred,
        "protocol version fallback: client requested unsupported version"
    );
    preferred.to_string()
}

/// The default supported-version list as owned strings.
pub fn default_supported_versions() -> Vec<String> {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .map(ToString::to_string)
        .collect()
}
