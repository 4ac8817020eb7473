//! The MCP client.
//!
//! Wraps a protocol engine with typed operations. The client must be
//! connected to a transport and then initialized; the handshake records the
//! server's declared capabilities, and any call against an undeclared
//! capability fails locally before touching the wire.

use std::sync::RwLock as StdRwLock;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use plexmcp_protocol::engine::{
    HandlerFuture, ProgressCallback, Protocol, ProtocolOptions, RequestOptions, StreamFrame,
};
use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::transport::Transport;
use plexmcp_protocol::types::{
    CallToolParams, CallToolResult, CancelTaskParams, ClientCapabilities, CreateTaskResult,
    ElicitationCapability, GetPromptParams, GetPromptResult, GetTaskParams,
    InitializeRequestParams, InitializeResult, Implementation, ListPromptsParams,
    ListPromptsResult, ListResourceTemplatesParams, ListResourceTemplatesResult,
    ListResourcesParams, ListResourcesResult, ListRootsResult, ListTasksParams, ListTasksResult,
    ListToolsParams, ListToolsResult, LoggingLevel, LoggingMessageParams, ReadResourceParams,
    ReadResourceResult, RemoteCapabilities, RootsCapability, SamplingCapability, SetLevelParams,
    SubscribeParams, Task, TaskRequest, TaskResultParams, UnsubscribeParams,
    LATEST_PROTOCOL_VERSION,
};

use crate::handlers::HandlerRegistry;

/// Per-call options for [`Client::call_tool`]
#[derive(Clone, Default)]
pub struct CallToolOptions {
    /// Overrides the engine's default timeout
    pub timeout: Option<Duration>,
    /// Progress callback; threads a progress token through the request
    pub on_progress: Option<ProgressCallback>,
    /// Caller-side cancellation
    pub cancellation: Option<CancellationToken>,
    /// Request task augmentation
    pub task: Option<TaskRequest>,
}

/// Result of a tool call: inline, or a task envelope to poll
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The tool ran inline
    Inline(CallToolResult),
    /// The server created a task; poll `tasks/result` for the outcome
    Task(CreateTaskResult),
}

/// A typed MCP client over any transport.
pub struct Client {
    protocol: Protocol,
    info: Implementation,
    handlers: HandlerRegistry,
    server: StdRwLock<Option<InitializeResult>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.info.name)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Client {
    /// Create a client identifying as `name`/`version`
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::new(ProtocolOptions::client()),
            info: Implementation::new(name, version),
            handlers: HandlerRegistry::default(),
            server: StdRwLock::new(None),
        }
    }

    /// Handler registry for server-initiated requests; populate before
    /// [`Client::initialize`] so the handshake declares the capabilities.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The underlying protocol engine
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Whether `initialize` has completed
    pub fn is_initialized(&self) -> bool {
        self.server.read().expect("server lock poisoned").is_some()
    }

    /// The server's `initialize` result, once initialized
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server.read().expect("server lock poisoned").clone()
    }

    /// The capability declaration computed from the installed handlers
    pub fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            roots: self.handlers.roots().map(|_| RootsCapability {
                list_changed: Some(true),
            }),
            sampling: self
                .handlers
                .sampling_handler()
                .map(|_| SamplingCapability::default()),
            elicitation: self
                .handlers
                .elicitation_handler()
                .map(|_| ElicitationCapability::default()),
            experimental: None,
        }
    }

    /// Attach a transport and register client-side handlers
    pub async fn connect<T: Transport + 'static>(&self, transport: T) -> Result<()> {
        self.register_handlers();
        self.protocol.connect(transport).await
    }

    /// Perform the `initialize` handshake and record server capabilities
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeRequestParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities(),
            client_info: self.info.clone(),
        };
        let value = self
            .protocol
            .request(
                "initialize",
                Some(serde_json::to_value(params)?),
                RequestOptions::default(),
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;
        debug!(
            server = %result.server_info.name,
            version = %result.protocol_version,
            "initialized"
        );
        self.protocol
            .set_remote_capabilities(RemoteCapabilities::Server(result.capabilities.clone()));
        self.protocol
            .notify("notifications/initialized", None)
            .await?;
        *self.server.write().expect("server lock poisoned") = Some(result.clone());
        Ok(result)
    }

    /// Ping the server
    pub async fn ping(&self) -> Result<()> {
        self.protocol.ping().await
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.protocol.close().await
    }

    // ----- tools ---------------------------------------------------------

    /// List tools, one page at a time
    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.typed_request("tools/list", &ListToolsParams { cursor })
            .await
    }

    /// Call a tool
    pub async fn call_tool(
        &self,
        name: impl Into<String>,
        arguments: Option<Map<String, Value>>,
        options: CallToolOptions,
    ) -> Result<ToolOutcome> {
        let task_requested = options.task.is_some();
        let params = CallToolParams {
            name: name.into(),
            arguments,
            task: options.task,
            meta: None,
        };
        let value = self
            .protocol
            .request(
                "tools/call",
                Some(serde_json::to_value(params)?),
                RequestOptions {
                    timeout: options.timeout,
                    on_progress: options.on_progress,
                    cancellation: options.cancellation,
                    related_request_id: None,
                },
            )
            .await?;
        // The task envelope is a first-class alternative to the inline
        // result; an envelope only comes back when the call asked for one.
        if task_requested && value.get("task").and_then(|t| t.get("taskId")).is_some() {
            return Ok(ToolOutcome::Task(serde_json::from_value(value)?));
        }
        Ok(ToolOutcome::Inline(serde_json::from_value(value)?))
    }

    /// Call a tool and observe progress and the terminal frame as a stream
    pub fn call_tool_stream(
        &self,
        name: impl Into<String>,
        arguments: Option<Map<String, Value>>,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamFrame>> {
        let params = CallToolParams {
            name: name.into(),
            arguments,
            task: None,
            meta: None,
        };
        Ok(self.protocol.request_stream(
            "tools/call",
            Some(serde_json::to_value(params)?),
            RequestOptions::default(),
        ))
    }

    // ----- prompts -------------------------------------------------------

    /// List prompts, one page at a time
    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        self.typed_request("prompts/list", &ListPromptsParams { cursor })
            .await
    }

    /// Retrieve a rendered prompt
    pub async fn get_prompt(
        &self,
        name: impl Into<String>,
        arguments: Option<std::collections::HashMap<String, Value>>,
    ) -> Result<GetPromptResult> {
        self.typed_request(
            "prompts/get",
            &GetPromptParams {
                name: name.into(),
                arguments,
            },
        )
        .await
    }

    // ----- resources -----------------------------------------------------

    /// List resources, one page at a time
    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.typed_request("resources/list", &ListResourcesParams { cursor })
            .await
    }

    /// List resource templates, one page at a time
    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult> {
        self.typed_request(
            "resources/templates/list",
            &ListResourceTemplatesParams { cursor },
        )
        .await
    }

    /// Read a resource by URI
    pub async fn read_resource(&self, uri: impl Into<String>) -> Result<ReadResourceResult> {
        self.typed_request("resources/read", &ReadResourceParams { uri: uri.into() })
            .await
    }

    /// Subscribe to updates for a resource URI
    pub async fn subscribe_resource(&self, uri: impl Into<String>) -> Result<()> {
        let _: Value = self
            .typed_request("resources/subscribe", &SubscribeParams { uri: uri.into() })
            .await?;
        Ok(())
    }

    /// Drop a resource subscription
    pub async fn unsubscribe_resource(&self, uri: impl Into<String>) -> Result<()> {
        let _: Value = self
            .typed_request(
                "resources/unsubscribe",
                &UnsubscribeParams { uri: uri.into() },
            )
            .await?;
        Ok(())
    }

    // ----- logging -------------------------------------------------------

    /// Set the minimum level for `notifications/message` traffic
    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        let _: Value = self
            .typed_request("logging/setLevel", &SetLevelParams { level })
            .await?;
        Ok(())
    }

    // ----- tasks ---------------------------------------------------------

    /// Poll a task's status
    pub async fn get_task(&self, task_id: impl Into<String>) -> Result<Task> {
        self.typed_request(
            "tasks/get",
            &GetTaskParams {
                task_id: task_id.into(),
            },
        )
        .await
    }

    /// Retrieve a completed task's stored result
    pub async fn get_task_result(&self, task_id: impl Into<String>) -> Result<Value> {
        self.typed_request(
            "tasks/result",
            &TaskResultParams {
                task_id: task_id.into(),
            },
        )
        .await
    }

    /// List tasks visible to this session
    pub async fn list_tasks(&self, cursor: Option<String>) -> Result<ListTasksResult> {
        self.typed_request("tasks/list", &ListTasksParams { cursor })
            .await
    }

    /// Cancel a running task
    pub async fn cancel_task(
        &self,
        task_id: impl Into<String>,
        reason: Option<String>,
    ) -> Result<Task> {
        self.typed_request(
            "tasks/cancel",
            &CancelTaskParams {
                task_id: task_id.into(),
                reason,
            },
        )
        .await
    }

    // ----- roots ---------------------------------------------------------

    /// Replace the declared roots and notify the server
    pub async fn set_roots(&self, roots: Vec<plexmcp_protocol::types::Root>) -> Result<()> {
        self.handlers.set_roots(roots);
        if self.is_initialized() {
            self.protocol
                .notify("notifications/roots/list_changed", None)
                .await?;
        }
        Ok(())
    }

    // ----- internals -----------------------------------------------------

    async fn typed_request<P: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R> {
        let value = self
            .protocol
            .request(
                method,
                Some(serde_json::to_value(params)?),
                RequestOptions::default(),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    fn register_handlers(&self) {
        // sampling/createMessage
        {
            let handlers = self.handlers.clone();
            self.protocol
                .set_request_handler("sampling/createMessage", move |params, _ctx| {
                    let handlers = handlers.clone();
                    Box::pin(async move {
                        let handler = handlers
                            .sampling_handler()
                            .ok_or_else(|| Error::method_not_found("sampling/createMessage"))?;
                        let params = serde_json::from_value(params.unwrap_or(Value::Null))
                            .map_err(|e| Error::invalid_params(e.to_string()))?;
                        let result = handler.create_message(params).await?;
                        Ok(serde_json::to_value(result)?)
                    }) as HandlerFuture
                });
        }

        // elicitation/create
        {
            let handlers = self.handlers.clone();
            self.protocol
                .set_request_handler("elicitation/create", move |params, _ctx| {
                    let handlers = handlers.clone();
                    Box::pin(async move {
                        let handler = handlers
                            .elicitation_handler()
                            .ok_or_else(|| Error::method_not_found("elicitation/create"))?;
                        let params = serde_json::from_value(params.unwrap_or(Value::Null))
                            .map_err(|e| Error::invalid_params(e.to_string()))?;
                        let result = handler.elicit(params).await?;
                        Ok(serde_json::to_value(result)?)
                    }) as HandlerFuture
                });
        }

        // roots/list
        {
            let handlers = self.handlers.clone();
            self.protocol
                .set_request_handler("roots/list", move |_params, _ctx| {
                    let handlers = handlers.clone();
                    Box::pin(async move {
                        let roots = handlers
                            .roots()
                            .ok_or_else(|| Error::method_not_found("roots/list"))?;
                        Ok(serde_json::to_value(ListRootsResult { roots })?)
                    }) as HandlerFuture
                });
        }

        // ping (server-initiated liveness)
        self.protocol.set_request_handler("ping", |_params, _ctx| {
            Box::pin(async { Ok(serde_json::json!({})) }) as HandlerFuture
        });

        // notifications/message
        {
            let handlers = self.handlers.clone();
            self.protocol
                .on_notification("notifications/message", move |params, _extra| {
                    let handlers = handlers.clone();
                    Box::pin(async move {
                        let Some(callback) = handlers.log_callback() else {
                            return;
                        };
                        if let Some(params) = params
                            .and_then(|p| serde_json::from_value::<LoggingMessageParams>(p).ok())
                        {
                            callback(params);
                        }
                    })
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::SamplingHandler;
    use async_trait::async_trait;
    use plexmcp_protocol::types::{ContentBlock, Role};
    use std::sync::Arc;

    struct NullSampling;

    #[async_trait]
    impl SamplingHandler for NullSampling {
        async fn create_message(
            &self,
            _params: plexmcp_protocol::types::CreateMessageParams,
        ) -> Result<plexmcp_protocol::types::CreateMessageResult> {
            Ok(plexmcp_protocol::types::CreateMessageResult {
                role: Role::Assistant,
                content: ContentBlock::text("ok"),
                model: "null".into(),
                stop_reason: None,
            })
        }
    }

    #[test]
    fn capabilities_follow_installed_handlers() {
        let client = Client::new("test", "0.0.0");
        let caps = client.capabilities();
        assert!(caps.sampling.is_none());
        assert!(caps.roots.is_none());

        client.handlers().set_sampling(Arc::new(NullSampling));
        client.handlers().set_roots(vec![]);
        let caps = client.capabilities();
        assert!(caps.sampling.is_some());
        assert!(caps.roots.is_some());
        assert!(caps.elicitation.is_none());
    }

    #[test]
    fn tool_outcome_distinguishes_task_envelope() {
        let envelope = serde_json::json!({
            "task": {
                "taskId": "t-1",
                "status": "working",
                "createdAt": "2025-01-01T00:00:00Z"
            }
        });
        let parsed: CreateTaskResult = serde_json::from_value(envelope).unwrap();
        assert_eq!(parsed.task.task_id, "t-1");

        let inline = serde_json::json!({"content": [{"type": "text", "text": "hi"}]});
        let parsed: CallToolResult = serde_json::from_value(inline).unwrap();
        assert_eq!(parsed.content[0].as_text(), Some("hi"));
    }

    #[test]
    fn uninitialized_client_reports_no_server() {
        let client = Client::new("test", "0.0.0");
        assert!(!client.is_initialized());
        assert!(client.server_info().is_none());
    }
}
