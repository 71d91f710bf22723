//! Handler registry: method names mapped to typed handlers behind
//! capability gates.
//!
//! Dispatch is a method-name-keyed table of closures sharing one
//! `(params, context) -> result` shape. Invoking a method whose gate is
//! absent from the negotiated capability set fails with `MethodNotFound`,
//! exactly like an unregistered method, so capability probing leaks nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Value, json};

use keelmcp_protocol::types::{
    CompletionsCapability, LoggingCapability, PromptsCapability, ResourcesCapability,
    ToolsCapability,
};
use keelmcp_protocol::{
    LogLevel, NegotiatedState, ProtocolError, ProtocolResult, Prompt, Resource, ServerCapabilities,
    Tool, methods,
};

use crate::context::RequestContext;

/// Future returned by every handler.
pub type HandlerFuture = BoxFuture<'static, ProtocolResult<Value>>;

/// A registered method handler.
pub type MethodHandler = Arc<dyn Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync>;

/// Which negotiated capability a method requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityGate {
    /// Always dispatchable once the session is ready
    Always,
    /// Requires the server `logging` capability
    Logging,
    /// Requires the server `tools` capability
    Tools,
    /// Requires the server `prompts` capability
    Prompts,
    /// Requires the server `resources` capability
    Resources,
    /// Requires `resources.subscribe`
    ResourcesSubscribe,
    /// Requires the server `completions` capability
    Completions,
    /// Requires the client `elicitation` capability (server→client methods)
    Elicitation,
}

impl CapabilityGate {
    /// Whether the negotiated capability set opens this gate.
    pub fn allowed(&self, negotiated: &NegotiatedState) -> bool {
        match self {
            Self::Always => true,
            Self::Logging => negotiated.has_logging(),
            Self::Tools => negotiated.has_tools(),
            Self::Prompts => negotiated.has_prompts(),
            Self::Resources => negotiated.has_resources(),
            Self::ResourcesSubscribe => negotiated.has_resource_subscriptions(),
            Self::Completions => negotiated.has_completions(),
            Self::Elicitation => negotiated.has_elicitation(),
        }
    }
}

struct Registration {
    gate: CapabilityGate,
    handler: MethodHandler,
}

/// Method table with capability gating and collection auto-derivation.
pub struct HandlerRegistry {
    handlers: DashMap<String, Registration>,
    tools: Arc<RwLock<Vec<Tool>>>,
    prompts: Arc<RwLock<Vec<Prompt>>>,
    resources: Arc<RwLock<Vec<Resource>>>,
    logging_enabled: AtomicBool,
    completions_enabled: AtomicBool,
    experimental: RwLock<Option<HashMap<String, Value>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Create a registry with the engine-provided built-ins: `ping`,
    /// `logging/setLevel`, and the resource subscription no-ops.
    pub fn new() -> Self {
        let registry = Self {
            handlers: DashMap::new(),
            tools: Arc::new(RwLock::new(Vec::new())),
            prompts: Arc::new(RwLock::new(Vec::new())),
            resources: Arc::new(RwLock::new(Vec::new())),
            logging_enabled: AtomicBool::new(true),
            completions_enabled: AtomicBool::new(false),
            experimental: RwLock::new(None),
        };

        registry.register(methods::PING, CapabilityGate::Always, |_, _| {
            Box::pin(async { Ok(json!({})) })
        });

        registry.register(
            methods::LOGGING_SET_LEVEL,
            CapabilityGate::Logging,
            |params, ctx| {
                Box::pin(async move {
                    let level: LogLevel = params
                        .as_ref()
                        .and_then(|p| p.get("level"))
                        .cloned()
                        .ok_or_else(|| ProtocolError::invalid_params("missing level"))
                        .and_then(|v| {
                            serde_json::from_value(v)
                                .map_err(|e| ProtocolError::invalid_params(e.to_string()))
                        })?;
                    ctx.session.set_min_log_level(level);
                    Ok(json!({}))
                })
            },
        );

        for method in [methods::RESOURCES_SUBSCRIBE, methods::RESOURCES_UNSUBSCRIBE] {
            registry.register(method, CapabilityGate::ResourcesSubscribe, |_, _| {
                Box::pin(async { Ok(json!({})) })
            });
        }

        registry
    }

    /// Register a handler for a method. Replaces any previous registration.
    pub fn register<F>(&self, method: impl Into<String>, gate: CapabilityGate, handler: F)
    where
        F: Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(
            method.into(),
            Registration {
                gate,
                handler: Arc::new(handler),
            },
        );
    }

    /// Whether a method is registered (gating aside).
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Provide the tool collection and its call implementation; `tools/list`
    /// and `tools/call` are synthesized and the tools capability advertised
    /// with `listChanged: true`.
    pub fn set_tools<F>(&self, tools: Vec<Tool>, call: F)
    where
        F: Fn(String, Value, RequestContext) -> HandlerFuture + Send + Sync + 'static,
    {
        *self.tools.write() = tools;

        let collection = Arc::clone(&self.tools);
        self.register(methods::TOOLS_LIST, CapabilityGate::Tools, move |_, _| {
            let tools = collection.read().clone();
            Box::pin(async move { Ok(json!({"tools": tools})) })
        });

        let collection = Arc::clone(&self.tools);
        let call = Arc::new(call);
        self.register(methods::TOOLS_CALL, CapabilityGate::Tools, move |params, ctx| {
            let collection = Arc::clone(&collection);
            let call = Arc::clone(&call);
            Box::pin(async move {
                let params = params
                    .ok_or_else(|| ProtocolError::invalid_params("missing tool call params"))?;
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::invalid_params("missing tool name"))?
                    .to_string();
                if !collection.read().iter().any(|t| t.name == name) {
                    return Err(ProtocolError::invalid_params(format!("unknown tool: {name}")));
                }
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                call(name, arguments, ctx).await
            })
        });
    }

    /// Provide the prompt collection and its get implementation;
    /// `prompts/list` and `prompts/get` are synthesized.
    pub fn set_prompts<F>(&self, prompts: Vec<Prompt>, get: F)
    where
        F: Fn(String, Option<Value>, RequestContext) -> HandlerFuture + Send + Sync + 'static,
    {
        *self.prompts.write() = prompts;

        let collection = Arc::clone(&self.prompts);
        self.register(methods::PROMPTS_LIST, CapabilityGate::Prompts, move |_, _| {
            let prompts = collection.read().clone();
            Box::pin(async move { Ok(json!({"prompts": prompts})) })
        });

        let collection = Arc::clone(&self.prompts);
        let get = Arc::new(get);
        self.register(methods::PROMPTS_GET, CapabilityGate::Prompts, move |params, ctx| {
            let collection = Arc::clone(&collection);
            let get = Arc::clone(&get);
            Box::pin(async move {
                let params = params
                    .ok_or_else(|| ProtocolError::invalid_params("missing prompt params"))?;
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::invalid_params("missing prompt name"))?
                    .to_string();
                if !collection.read().iter().any(|p| p.name == name) {
                    return Err(ProtocolError::invalid_params(format!(
                        "unknown prompt: {name}"
                    )));
                }
                let arguments = params.get("arguments").cloned();
                get(name, arguments, ctx).await
            })
        });
    }

    /// Provide the resource collection and its read implementation;
    /// `resources/list` and `resources/read` are synthesized, and the
    /// subscription no-ops become reachable through `resources.subscribe`.
    pub fn set_resources<F>(&self, resources: Vec<Resource>, read: F)
    where
        F: Fn(String, RequestContext) -> HandlerFuture + Send + Sync + 'static,
    {
        *self.resources.write() = resources;

        let collection = Arc::clone(&self.resources);
        self.register(
            methods::RESOURCES_LIST,
            CapabilityGate::Resources,
            move |_, _| {
                let resources = collection.read().clone();
                Box::pin(async move { Ok(json!({"resources": resources})) })
            },
        );

        let read = Arc::new(read);
        self.register(
            methods::RESOURCES_READ,
            CapabilityGate::Resources,
            move |params, ctx| {
                let read = Arc::clone(&read);
                Box::pin(async move {
                    let uri = params
                        .as_ref()
                        .and_then(|p| p.get("uri"))
                        .and_then(Value::as_str)
                        .ok_or_else(|| ProtocolError::invalid_params("missing resource uri"))?
                        .to_string();
                    read(uri, ctx).await
                })
            },
        );
    }

    /// Provide the completion implementation; `completion/complete` is
    /// registered and the completions capability advertised.
    pub fn set_completions<F>(&self, complete: F)
    where
        F: Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync + 'static,
    {
        self.completions_enabled.store(true, Ordering::Release);
        self.register(methods::COMPLETION_COMPLETE, CapabilityGate::Completions, complete);
    }

    /// Advertise experimental capabilities.
    pub fn set_experimental(&self, experimental: HashMap<String, Value>) {
        *self.experimental.write() = Some(experimental);
    }

    /// Turn off the logging capability (and with it `logging/setLevel`).
    pub fn disable_logging(&self) {
        self.logging_enabled.store(false, Ordering::Release);
    }

    /// The capabilities this registry enables, advertised on `initialize`.
    pub fn server_capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            experimental: self.experimental.read().clone(),
            logging: self
                .logging_enabled
                .load(Ordering::Acquire)
                .then(LoggingCapability::default),
            completions: self
                .completions_enabled
                .load(Ordering::Acquire)
                .then(CompletionsCapability::default),
            prompts: (!self.prompts.read().is_empty()).then(|| PromptsCapability {
                list_changed: Some(true),
            }),
            resources: (!self.resources.read().is_empty()).then(|| ResourcesCapability {
                subscribe: Some(true),
                list_changed: Some(true),
            }),
            tools: (!self.tools.read().is_empty()).then(|| ToolsCapability {
                list_changed: Some(true),
            }),
        }
    }

    /// Dispatch a method against the negotiated capability set.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MethodNotFound`] for unregistered methods
    /// and for methods whose gate the negotiation left closed; otherwise
    /// whatever the handler returns.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> ProtocolResult<Value> {
        let handler = {
            let Some(entry) = self.handlers.get(method) else {
                return Err(ProtocolError::method_not_found(method));
            };
            let allowed = match ctx.session.negotiated() {
                Some(negotiated) => entry.gate.allowed(&negotiated),
                None => entry.gate == CapabilityGate::Always,
            };
            if !allowed {
                tracing::debug!(method, "method gated off by negotiated capabilities");
                return Err(ProtocolError::method_not_found(method));
            }
            Arc::clone(&entry.handler)
        };
        handler(params, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelmcp_protocol::{ClientCapabilities, Implementation};
    use keelmcp_session::{MemoryBackend, SessionStore, StoreConfig};
    use tokio_util::sync::CancellationToken;

    async fn ready_ctx(registry: &HandlerRegistry) -> RequestContext {
        let store = SessionStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default());
        let session = store.create().await.unwrap();
        session.set_negotiated(NegotiatedState::negotiate(
            "2025-06-18".into(),
            ClientCapabilities::default(),
            registry.server_capabilities(),
            Implementation::new("c", "1"),
            Implementation::new("s", "1"),
        ));
        RequestContext::new(session, CancellationToken::new(), None)
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let registry = HandlerRegistry::new();
        let ctx = ready_ctx(&registry).await;
        let result = registry.dispatch(methods::PING, None, ctx).await.unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let registry = HandlerRegistry::new();
        let ctx = ready_ctx(&registry).await;
        let err = registry.dispatch("no/such", None, ctx).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn gated_method_is_method_not_found_when_capability_absent() {
        let registry = HandlerRegistry::new();
        // tools/call registered, but no tools collection → no tools capability.
        registry.register(methods::TOOLS_CALL, CapabilityGate::Tools, |_, _| {
            Box::pin(async { Ok(json!({})) })
        });
        let ctx = ready_ctx(&registry).await;
        let err = registry
            .dispatch(methods::TOOLS_CALL, None, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn set_level_stores_per_session_minimum() {
        let registry = HandlerRegistry::new();
        let ctx = ready_ctx(&registry).await;
        registry
            .dispatch(
                methods::LOGGING_SET_LEVEL,
                Some(json!({"level": "error"})),
                ctx.clone(),
            )
            .await
            .unwrap();
        assert_eq!(ctx.session.min_log_level(), Some(LogLevel::Error));
    }

    #[tokio::test]
    async fn derived_tool_handlers_list_and_call() {
        let registry = HandlerRegistry::new();
        registry.set_tools(vec![Tool::new("echo", "echoes input")], |name, args, _| {
            Box::pin(async move { Ok(json!({"content": [{"type": "text", "text": format!("{name}: {args}")}]})) })
        });

        let caps = registry.server_capabilities();
        assert_eq!(caps.tools.unwrap().list_changed, Some(true));

        let ctx = ready_ctx(&registry).await;
        let listed = registry
            .dispatch(methods::TOOLS_LIST, None, ctx.clone())
            .await
            .unwrap();
        assert_eq!(listed["tools"][0]["name"], "echo");

        let called = registry
            .dispatch(
                methods::TOOLS_CALL,
                Some(json!({"name": "echo", "arguments": {"x": 1}})),
                ctx.clone(),
            )
            .await
            .unwrap();
        assert!(called["content"][0]["text"].as_str().unwrap().starts_with("echo"));

        let err = registry
            .dispatch(
                methods::TOOLS_CALL,
                Some(json!({"name": "missing"})),
                ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn derived_resource_handlers_and_subscription_noops() {
        let registry = HandlerRegistry::new();
        registry.set_resources(
            vec![Resource {
                uri: "file:///a.txt".into(),
                name: "a".into(),
                description: None,
                mime_type: Some("text/plain".into()),
            }],
            |uri, _| {
                Box::pin(async move {
                    if uri == "file:///a.txt" {
                        Ok(json!({"contents": [{"uri": uri, "text": "hello"}]}))
                    } else {
                        Err(ProtocolError::ResourceNotFound(uri))
                    }
                })
            },
        );

        let caps = registry.server_capabilities();
        assert_eq!(caps.resources.as_ref().unwrap().subscribe, Some(true));

        let ctx = ready_ctx(&registry).await;
        let read = registry
            .dispatch(
                methods::RESOURCES_READ,
                Some(json!({"uri": "file:///a.txt"})),
                ctx.clone(),
            )
            .await
            .unwrap();
        assert_eq!(read["contents"][0]["text"], "hello");

        let err = registry
            .dispatch(
                methods::RESOURCES_READ,
                Some(json!({"uri": "file:///nope"})),
                ctx.clone(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ResourceNotFound(_)));

        // Default no-op subscription handlers are reachable.
        let subscribed = registry
            .dispatch(
                methods::RESOURCES_SUBSCRIBE,
                Some(json!({"uri": "file:///a.txt"})),
                ctx,
            )
            .await
            .unwrap();
        assert_eq!(subscribed, json!({}));
    }

    #[tokio::test]
    async fn pre_handshake_sessions_only_reach_always_methods() {
        let registry = HandlerRegistry::new();
        let store = SessionStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default());
        let session = store.create().await.unwrap();
        let ctx = RequestContext::new(session, CancellationToken::new(), None);

        assert!(registry.dispatch(methods::PING, None, ctx.clone()).await.is_ok());
        let err = registry
            .dispatch(methods::LOGGING_SET_LEVEL, Some(json!({"level": "info"})), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MethodNotFound(_)));
    }
}
