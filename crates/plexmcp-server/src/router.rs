//! Request routing: wires the registries and task store into a protocol
//! engine's handler table.
//!
//! One handler per wire method. Handlers parse params, consult the shared
//! registries, and serialize typed results; anything thrown inside a tool
//! body that does not carry a protocol code surfaces as an `isError` tool
//! result rather than a JSON-RPC failure.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use plexmcp_protocol::engine::{HandlerFuture, RequestContext};
use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::types::{
    negotiate_protocol_version, CallToolParams, CallToolResult, CancelTaskParams, CreateTaskResult,
    EmptyResult, GetPromptParams, GetTaskParams, InitializeRequestParams, InitializeResult,
    ListPromptsParams, ListPromptsResult, ListResourceTemplatesParams, ListResourceTemplatesResult,
    ListResourcesParams, ListResourcesResult, ListTasksParams, ListTasksResult, ListToolsParams,
    ListToolsResult, ReadResourceParams, RemoteCapabilities, SetLevelParams, SubscribeParams,
    TaskResultParams, TaskStatus, TaskStatusNotificationParams, UnsubscribeParams,
};

use crate::pagination::paginate;
use crate::server::{ConnectionState, ServerCore};

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let value = params.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| Error::invalid_params(e.to_string()))
}

fn parse_params_or_default<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T> {
    match params {
        None => Ok(T::default()),
        Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| Error::invalid_params(e.to_string())),
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::internal(e.to_string()))
}

/// Install every server-side request and notification handler.
pub(crate) fn register_handlers(core: &Arc<ServerCore>, state: &Arc<ConnectionState>) {
    let protocol = &state.protocol;

    // initialize
    {
        let core = core.clone();
        let state = state.clone();
        protocol.set_request_handler("initialize", move |params, _ctx| {
            let core = core.clone();
            let state = state.clone();
            Box::pin(async move {
                let params: InitializeRequestParams = parse_params(params)?;
                let version = negotiate_protocol_version(&params.protocol_version);
                debug!(
                    client = %params.client_info.name,
                    version = %version,
                    "initialize"
                );
                state
                    .protocol
                    .set_remote_capabilities(RemoteCapabilities::Client(params.capabilities));
                to_result(&InitializeResult {
                    protocol_version: version.to_string(),
                    capabilities: core.capabilities.clone(),
                    server_info: core.info.clone(),
                    instructions: core.instructions.clone(),
                })
            }) as HandlerFuture
        });
    }

    {
        let state = state.clone();
        protocol.on_notification("notifications/initialized", move |_params, _extra| {
            let state = state.clone();
            Box::pin(async move {
                state.initialized.store(true, Ordering::SeqCst);
            })
        });
    }

    // ping
    protocol.set_request_handler("ping", |_params, _ctx| {
        Box::pin(async { to_result(&EmptyResult::default()) }) as HandlerFuture
    });

    register_tool_handlers(core, state);
    register_prompt_handlers(core, state);
    register_resource_handlers(core, state);
    register_logging_handler(core, state);
    register_task_handlers(core, state);
}

fn register_tool_handlers(core: &Arc<ServerCore>, state: &Arc<ConnectionState>) {
    let protocol = &state.protocol;

    {
        let core = core.clone();
        protocol.set_request_handler("tools/list", move |params, _ctx| {
            let core = core.clone();
            Box::pin(async move {
                let params: ListToolsParams = parse_params_or_default(params)?;
                let tools: Vec<_> = core.tools.list_enabled().iter().map(|t| t.to_wire()).collect();
                let (page, next_cursor) = paginate(
                    &tools,
                    params.cursor.as_deref(),
                    core.page_size,
                    |t| t.name.clone(),
                );
                to_result(&ListToolsResult {
                    tools: page,
                    next_cursor,
                })
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        protocol.set_request_handler("tools/call", move |params, ctx| {
            let core = core.clone();
            Box::pin(async move {
                let params: CallToolParams = parse_params(params)?;
                let entry = core
                    .tools
                    .get_enabled(&params.name)
                    .ok_or_else(|| Error::invalid_params(format!("unknown tool: {}", params.name)))?;
                let (callback, supports_tasks) = {
                    let entry = entry.read().expect("entry lock poisoned");
                    (entry.callback.clone(), entry.supports_tasks)
                };
                let arguments = params.arguments.unwrap_or_default();

                if let Some(task_request) = params.task {
                    if !supports_tasks {
                        return Err(Error::invalid_params(format!(
                            "tool {} does not support task execution",
                            params.name
                        )));
                    }
                    if core.capabilities.tasks.is_none() {
                        return Err(Error::method_not_found("tasks capability not declared"));
                    }
                    let task = core
                        .task_store
                        .create_task(
                            task_request,
                            ctx.request_id.clone(),
                            "tools/call".to_string(),
                            Some(serde_json::json!({
                                "name": params.name.clone(),
                                "arguments": arguments.clone(),
                            })),
                            ctx.session_id.clone(),
                        )
                        .await?;
                    spawn_task_runner(&core, task.task_id.clone(), callback, arguments, ctx)
                        .await?;
                    return to_result(&CreateTaskResult { task });
                }

                match callback(arguments, ctx).await {
                    Ok(result) => to_result(&result),
                    // Errors carrying a protocol code reject the request;
                    // everything else is a tool execution failure and comes
                    // back inline as an isError result.
                    Err(err @ Error::Internal(_)) => {
                        to_result(&CallToolResult::error_text(err.to_string()))
                    }
                    Err(err) => Err(err),
                }
            }) as HandlerFuture
        });
    }
}

/// Run a task-augmented tool call in the background: the envelope has
/// already been returned, so outcomes land in the task store and a status
/// notification trails on whichever stream is open.
async fn spawn_task_runner(
    core: &Arc<ServerCore>,
    task_id: String,
    callback: crate::registry::ToolCallback,
    arguments: serde_json::Map<String, Value>,
    ctx: RequestContext,
) -> Result<()> {
    let store = core.task_store.clone();
    let cancel = store.cancellation_token(&task_id).await?;
    tokio::spawn(async move {
        let session_id = ctx.session_id.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = callback(arguments, ctx.clone()) => Some(result),
        };
        let status = match outcome {
            // tasks/cancel already moved the task to its terminal state.
            None => return,
            Some(Ok(result)) => {
                let value = serde_json::to_value(&result).unwrap_or(Value::Null);
                match store
                    .store_task_result(&task_id, TaskStatus::Completed, value, session_id.as_deref())
                    .await
                {
                    Ok(()) => TaskStatus::Completed,
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "failed to store task result");
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                let value = serde_json::to_value(&CallToolResult::error_text(err.to_string()))
                    .unwrap_or(Value::Null);
                match store
                    .store_task_result(&task_id, TaskStatus::Failed, value, session_id.as_deref())
                    .await
                {
                    Ok(()) => TaskStatus::Failed,
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "failed to store task failure");
                        return;
                    }
                }
            }
        };
        let params = TaskStatusNotificationParams {
            task_id: task_id.clone(),
            status,
            status_message: None,
        };
        if let Ok(params) = serde_json::to_value(&params) {
            let note = plexmcp_protocol::jsonrpc::JsonRpcNotification::new(
                "notifications/tasks/status",
                Some(params.clone()),
            );
            // Capture for delivery on a later poll, then attempt the live
            // path (standalone stream or retained for replay).
            let _ = store.enqueue_message(&task_id, note.into()).await;
            if let Err(err) = ctx
                .send_notification("notifications/tasks/status", Some(params))
                .await
            {
                debug!(task_id = %task_id, error = %err, "status notification not delivered");
            }
        }
    });
    Ok(())
}

fn register_prompt_handlers(core: &Arc<ServerCore>, state: &Arc<ConnectionState>) {
    let protocol = &state.protocol;

    {
        let core = core.clone();
        protocol.set_request_handler("prompts/list", move |params, _ctx| {
            let core = core.clone();
            Box::pin(async move {
                let params: ListPromptsParams = parse_params_or_default(params)?;
                let prompts: Vec<_> =
                    core.prompts.list_enabled().iter().map(|p| p.to_wire()).collect();
                let (page, next_cursor) = paginate(
                    &prompts,
                    params.cursor.as_deref(),
                    core.page_size,
                    |p| p.name.clone(),
                );
                to_result(&ListPromptsResult {
                    prompts: page,
                    next_cursor,
                })
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        protocol.set_request_handler("prompts/get", move |params, ctx| {
            let core = core.clone();
            Box::pin(async move {
                let params: GetPromptParams = parse_params(params)?;
                let entry = core.prompts.get_enabled(&params.name).ok_or_else(|| {
                    Error::invalid_params(format!("unknown prompt: {}", params.name))
                })?;
                let callback = entry.read().expect("entry lock poisoned").callback.clone();
                let result = callback(params.arguments.unwrap_or_default(), ctx).await?;
                to_result(&result)
            }) as HandlerFuture
        });
    }
}

fn register_resource_handlers(core: &Arc<ServerCore>, state: &Arc<ConnectionState>) {
    let protocol = &state.protocol;

    {
        let core = core.clone();
        protocol.set_request_handler("resources/list", move |params, _ctx| {
            let core = core.clone();
            Box::pin(async move {
                let params: ListResourcesParams = parse_params_or_default(params)?;
                let resources: Vec<_> =
                    core.resources.list_enabled().iter().map(|r| r.to_wire()).collect();
                let (page, next_cursor) = paginate(
                    &resources,
                    params.cursor.as_deref(),
                    core.page_size,
                    |r| r.name.clone(),
                );
                to_result(&ListResourcesResult {
                    resources: page,
                    next_cursor,
                })
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        protocol.set_request_handler("resources/templates/list", move |params, _ctx| {
            let core = core.clone();
            Box::pin(async move {
                let params: ListResourceTemplatesParams = parse_params_or_default(params)?;
                let templates: Vec<_> =
                    core.templates.list_enabled().iter().map(|t| t.to_wire()).collect();
                let (page, next_cursor) = paginate(
                    &templates,
                    params.cursor.as_deref(),
                    core.page_size,
                    |t| t.name.clone(),
                );
                to_result(&ListResourceTemplatesResult {
                    resource_templates: page,
                    next_cursor,
                })
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        protocol.set_request_handler("resources/read", move |params, ctx| {
            let core = core.clone();
            Box::pin(async move {
                let params: ReadResourceParams = parse_params(params)?;

                // Concrete resources first, then template matches.
                let direct = core.resources.list_enabled().into_iter().find(|r| r.uri == params.uri);
                if let Some(resource) = direct {
                    let result = (resource.callback)(params.uri, ctx).await?;
                    return to_result(&result);
                }
                for template in core.templates.list_enabled() {
                    if let Some(vars) = template.template.match_uri(&params.uri) {
                        let result = (template.callback)(params.uri, vars, ctx).await?;
                        return to_result(&result);
                    }
                }
                Err(Error::resource_not_found(params.uri))
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        let state = state.clone();
        protocol.set_request_handler("resources/subscribe", move |params, _ctx| {
            let core = core.clone();
            let state = state.clone();
            Box::pin(async move {
                if !subscriptions_declared(&core) {
                    return Err(Error::method_not_found(
                        "resources.subscribe capability not declared",
                    ));
                }
                let params: SubscribeParams = parse_params(params)?;
                state.subscriptions.insert(params.uri, ());
                to_result(&EmptyResult::default())
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        let state = state.clone();
        protocol.set_request_handler("resources/unsubscribe", move |params, _ctx| {
            let core = core.clone();
            let state = state.clone();
            Box::pin(async move {
                if !subscriptions_declared(&core) {
                    return Err(Error::method_not_found(
                        "resources.subscribe capability not declared",
                    ));
                }
                let params: UnsubscribeParams = parse_params(params)?;
                state.subscriptions.remove(&params.uri);
                to_result(&EmptyResult::default())
            }) as HandlerFuture
        });
    }
}

fn subscriptions_declared(core: &Arc<ServerCore>) -> bool {
    core.capabilities
        .resources
        .as_ref()
        .is_some_and(|r| r.subscribe.unwrap_or(false))
}

fn register_logging_handler(core: &Arc<ServerCore>, state: &Arc<ConnectionState>) {
    let core = core.clone();
    let state = state.clone();
    state
        .protocol
        .clone()
        .set_request_handler("logging/setLevel", move |params, _ctx| {
            let core = core.clone();
            let state = state.clone();
            Box::pin(async move {
                if core.capabilities.logging.is_none() {
                    return Err(Error::method_not_found("logging capability not declared"));
                }
                let params: SetLevelParams = parse_params(params)?;
                *state.log_level.write().expect("level lock poisoned") = Some(params.level);
                to_result(&EmptyResult::default())
            }) as HandlerFuture
        });
}

fn register_task_handlers(core: &Arc<ServerCore>, state: &Arc<ConnectionState>) {
    let protocol = &state.protocol;

    let tasks_declared =
        |core: &Arc<ServerCore>| -> Result<()> {
            core.capabilities
                .tasks
                .as_ref()
                .map(|_| ())
                .ok_or_else(|| Error::method_not_found("tasks capability not declared"))
        };

    {
        let core = core.clone();
        protocol.set_request_handler("tasks/get", move |params, ctx| {
            let core = core.clone();
            Box::pin(async move {
                tasks_declared(&core)?;
                let params: GetTaskParams = parse_params(params)?;
                // Ownership check first; only then flush captured traffic.
                let task = core
                    .task_store
                    .get_task(&params.task_id, ctx.session_id.as_deref())
                    .await?;
                drain_task_queue(&core, &params.task_id, &ctx).await;
                to_result(&task)
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        protocol.set_request_handler("tasks/result", move |params, ctx| {
            let core = core.clone();
            Box::pin(async move {
                tasks_declared(&core)?;
                let params: TaskResultParams = parse_params(params)?;
                core.task_store
                    .get_task(&params.task_id, ctx.session_id.as_deref())
                    .await?;
                drain_task_queue(&core, &params.task_id, &ctx).await;
                core.task_store
                    .get_task_result(&params.task_id, ctx.session_id.as_deref())
                    .await
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        protocol.set_request_handler("tasks/list", move |params, ctx| {
            let core = core.clone();
            Box::pin(async move {
                tasks_declared(&core)?;
                let params: ListTasksParams = parse_params_or_default(params)?;
                let (tasks, next_cursor) = core
                    .task_store
                    .list_tasks(ctx.session_id.as_deref(), params.cursor.as_deref())
                    .await?;
                to_result(&ListTasksResult { tasks, next_cursor })
            }) as HandlerFuture
        });
    }

    {
        let core = core.clone();
        protocol.set_request_handler("tasks/cancel", move |params, ctx| {
            let core = core.clone();
            Box::pin(async move {
                tasks_declared(&core)?;
                let params: CancelTaskParams = parse_params(params)?;
                let task = core
                    .task_store
                    .cancel_task(&params.task_id, params.reason, ctx.session_id.as_deref())
                    .await?;
                to_result(&task)
            }) as HandlerFuture
        });
    }
}

/// Deliver messages captured while no stream was open: they ride the
/// current poll's response stream, before the poll result itself.
async fn drain_task_queue(core: &Arc<ServerCore>, task_id: &str, ctx: &RequestContext) {
    let Ok(messages) = core.task_store.drain_messages(task_id).await else {
        return;
    };
    for message in messages {
        if let plexmcp_protocol::jsonrpc::JsonRpcMessage::Notification(note) = message {
            if let Err(err) = ctx.send_notification(&note.method, note.params).await {
                debug!(task_id = %task_id, error = %err, "queued task message not delivered");
            }
        }
    }
}
