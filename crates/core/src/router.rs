//! Downstream request routing.
//!
//! List requests fan out to every upstream that declares the category and
//! come back with namespaced identifiers. Targeted requests are resolved to
//! exactly one upstream and forwarded with the upstream-local identifier.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use toolmux_mcp::{
    empty_result, methods, CallToolParams, CompleteParams, GetPromptParams, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, LoggingLevel, McpError,
    PaginatedParams, ProgressParams, ReadResourceResult, Reference, RequestMeta, ResourceParams,
    ServerCapabilities, SetLevelParams,
};

use crate::codec::{decode_progress_token, decode_uri, encode_progress_token, encode_uri, unique_name};
use crate::connection::{Connection, ConnectionSet};
use crate::error::HubError;

/// Requests the router answers. Anything else is `MethodNotFound`.
pub const ROUTED_METHODS: &[&str] = &[
    methods::TOOLS_LIST,
    methods::TOOLS_CALL,
    methods::PROMPTS_LIST,
    methods::PROMPTS_GET,
    methods::RESOURCES_LIST,
    methods::RESOURCE_TEMPLATES_LIST,
    methods::RESOURCES_READ,
    methods::RESOURCES_SUBSCRIBE,
    methods::RESOURCES_UNSUBSCRIBE,
    methods::COMPLETION_COMPLETE,
    methods::LOGGING_SET_LEVEL,
];

/// Where a global name points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub server: String,
    pub local: String,
}

/// Global name -> owning server and local name, built by one list call.
#[derive(Debug, Default)]
pub struct NameTable {
    entries: HashMap<String, NameEntry>,
}

impl NameTable {
    /// Assign `local` a global name not yet in the table.
    pub fn insert(&mut self, server: &str, local: &str) -> Option<String> {
        let global = unique_name(server, local, |candidate| {
            self.entries.contains_key(candidate)
        })?;
        self.entries.insert(
            global.clone(),
            NameEntry {
                server: server.to_string(),
                local: local.to_string(),
            },
        );
        Some(global)
    }

    pub fn resolve(&self, global: &str) -> Option<&NameEntry> {
        self.entries.get(global)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type TableSlot = RwLock<Option<Arc<NameTable>>>;

pub struct Router {
    connections: ConnectionSet,
    tools: TableSlot,
    prompts: TableSlot,
}

impl Router {
    pub fn new(connections: ConnectionSet) -> Self {
        Self {
            connections,
            tools: RwLock::new(None),
            prompts: RwLock::new(None),
        }
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn routes(method: &str) -> bool {
        ROUTED_METHODS.contains(&method)
    }

    /// Parse `params` for `method` and run it.
    pub async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, HubError> {
        match method {
            methods::TOOLS_LIST => {
                note_downstream_cursor(method, params);
                to_result(self.list_tools().await)
            }
            methods::PROMPTS_LIST => {
                note_downstream_cursor(method, params);
                to_result(self.list_prompts().await)
            }
            methods::RESOURCES_LIST => {
                note_downstream_cursor(method, params);
                to_result(self.list_resources().await)
            }
            methods::RESOURCE_TEMPLATES_LIST => {
                note_downstream_cursor(method, params);
                to_result(self.list_resource_templates().await)
            }
            methods::TOOLS_CALL => self.call_tool(parse(params)?).await,
            methods::PROMPTS_GET => self.get_prompt(parse(params)?).await,
            methods::RESOURCES_READ => to_result(self.read_resource(parse(params)?).await?),
            methods::RESOURCES_SUBSCRIBE => self.subscribe(parse(params)?).await,
            methods::RESOURCES_UNSUBSCRIBE => self.unsubscribe(parse(params)?).await,
            methods::COMPLETION_COMPLETE => self.complete(parse(params)?).await,
            methods::LOGGING_SET_LEVEL => {
                let params: SetLevelParams = parse(params)?;
                self.set_logging_level(params.level).await
            }
            other => Err(HubError::MethodNotFound(other.to_string())),
        }
    }

    // ── Lists ───────────────────────────────────────────────────────

    pub async fn list_tools(&self) -> ListToolsResult {
        let pages = self
            .collect("tools", |caps| caps.tools.is_some(), |conn| {
                conn.client().list_tools(None)
            })
            .await;

        let mut table = NameTable::default();
        let mut tools = Vec::new();
        for (conn, page) in pages {
            note_truncated(conn.name(), "tools", page.next_cursor.as_deref());
            for mut tool in page.tools {
                match table.insert(conn.name(), &tool.name) {
                    Some(global) => {
                        tool.name = global;
                        tools.push(tool);
                    }
                    None => tracing::warn!(
                        server = %conn.name(),
                        tool = %tool.name,
                        "no unique name available, hiding tool"
                    ),
                }
            }
        }

        tracing::debug!(count = tools.len(), "listed tools");
        publish(&self.tools, table);
        ListToolsResult {
            tools,
            next_cursor: None,
        }
    }

    pub async fn list_prompts(&self) -> ListPromptsResult {
        let pages = self
            .collect("prompts", |caps| caps.prompts.is_some(), |conn| {
                conn.client().list_prompts(None)
            })
            .await;

        let mut table = NameTable::default();
        let mut prompts = Vec::new();
        for (conn, page) in pages {
            note_truncated(conn.name(), "prompts", page.next_cursor.as_deref());
            for mut prompt in page.prompts {
                match table.insert(conn.name(), &prompt.name) {
                    Some(global) => {
                        prompt.name = global;
                        prompts.push(prompt);
                    }
                    None => tracing::warn!(
                        server = %conn.name(),
                        prompt = %prompt.name,
                        "no unique name available, hiding prompt"
                    ),
                }
            }
        }

        tracing::debug!(count = prompts.len(), "listed prompts");
        publish(&self.prompts, table);
        ListPromptsResult {
            prompts,
            next_cursor: None,
        }
    }

    pub async fn list_resources(&self) -> ListResourcesResult {
        let pages = self
            .collect("resources", |caps| caps.resources.is_some(), |conn| {
                conn.client().list_resources(None)
            })
            .await;

        let mut resources = Vec::new();
        for (conn, page) in pages {
            note_truncated(conn.name(), "resources", page.next_cursor.as_deref());
            resources.extend(page.resources.into_iter().map(|mut resource| {
                resource.uri = encode_uri(conn.name(), &resource.uri);
                resource
            }));
        }

        ListResourcesResult {
            resources,
            next_cursor: None,
        }
    }

    pub async fn list_resource_templates(&self) -> ListResourceTemplatesResult {
        let pages = self
            .collect("resource templates", |caps| caps.resources.is_some(), |conn| {
                conn.client().list_resource_templates(None)
            })
            .await;

        let mut resource_templates = Vec::new();
        for (conn, page) in pages {
            note_truncated(conn.name(), "resource templates", page.next_cursor.as_deref());
            resource_templates.extend(page.resource_templates.into_iter().map(|mut template| {
                template.uri_template = encode_uri(conn.name(), &template.uri_template);
                template
            }));
        }

        ListResourceTemplatesResult {
            resource_templates,
            next_cursor: None,
        }
    }

    // ── Targeted requests ───────────────────────────────────────────

    pub async fn call_tool(&self, mut params: CallToolParams) -> Result<Value, HubError> {
        let not_found = || HubError::InvalidParams(format!("Tool {} not found", params.name));
        let entry = self.resolve_tool(&params.name).await.ok_or_else(not_found)?;
        let conn = self
            .connection_with(&entry.server, |caps| caps.tools.is_some())
            .ok_or_else(not_found)?;

        tracing::debug!(server = %entry.server, tool = %entry.local, "calling tool");
        params.name = entry.local;
        params.meta = encode_meta(conn.name(), params.meta);
        conn.client()
            .call_tool(&params)
            .await
            .map_err(|e| HubError::upstream(conn.name(), e))
    }

    pub async fn get_prompt(&self, mut params: GetPromptParams) -> Result<Value, HubError> {
        let not_found = || HubError::InvalidParams(format!("Prompt {} not found", params.name));
        let entry = self.resolve_prompt(&params.name).await.ok_or_else(not_found)?;
        let conn = self
            .connection_with(&entry.server, |caps| caps.prompts.is_some())
            .ok_or_else(not_found)?;

        params.name = entry.local;
        params.meta = encode_meta(conn.name(), params.meta);
        conn.client()
            .get_prompt(&params)
            .await
            .map_err(|e| HubError::upstream(conn.name(), e))
    }

    /// Forwards with the local URI; content URIs come back namespaced.
    pub async fn read_resource(&self, params: ResourceParams) -> Result<ReadResourceResult, HubError> {
        let (conn, params) = self.resource_target(params)?;
        let mut result = conn
            .client()
            .read_resource(&params)
            .await
            .map_err(|e| HubError::upstream(conn.name(), e))?;
        for contents in &mut result.contents {
            contents.uri = encode_uri(conn.name(), &contents.uri);
        }
        Ok(result)
    }

    /// `{}` without forwarding when the owner cannot subscribe.
    pub async fn subscribe(&self, params: ResourceParams) -> Result<Value, HubError> {
        let (conn, params) = self.resource_target(params)?;
        if !supports_subscribe(conn.capabilities()) {
            tracing::debug!(server = %conn.name(), "subscriptions unsupported, ignoring subscribe");
            return Ok(empty_result());
        }
        conn.client()
            .subscribe_resource(&params)
            .await
            .map_err(|e| HubError::upstream(conn.name(), e))
    }

    pub async fn unsubscribe(&self, params: ResourceParams) -> Result<Value, HubError> {
        let (conn, params) = self.resource_target(params)?;
        if !supports_subscribe(conn.capabilities()) {
            tracing::debug!(server = %conn.name(), "subscriptions unsupported, ignoring unsubscribe");
            return Ok(empty_result());
        }
        conn.client()
            .unsubscribe_resource(&params)
            .await
            .map_err(|e| HubError::upstream(conn.name(), e))
    }

    pub async fn complete(&self, mut params: CompleteParams) -> Result<Value, HubError> {
        let conn = match params.reference.clone() {
            Reference::Prompt { name, extra } => {
                let not_found = || HubError::InvalidParams(format!("Prompt {name} not found"));
                let entry = self.resolve_prompt(&name).await.ok_or_else(not_found)?;
                let conn = self
                    .connection_with(&entry.server, |caps| caps.prompts.is_some())
                    .ok_or_else(not_found)?;
                params.reference = Reference::Prompt {
                    name: entry.local,
                    extra,
                };
                conn
            }
            Reference::Resource { uri, extra } => {
                let not_found = || HubError::InvalidParams(format!("Resource {uri} not found"));
                let decoded = decode_uri(&uri);
                let conn = decoded
                    .server
                    .as_deref()
                    .and_then(|server| self.connection_with(server, |caps| caps.resources.is_some()))
                    .ok_or_else(not_found)?;
                params.reference = Reference::Resource {
                    uri: decoded.local,
                    extra,
                };
                conn
            }
        };

        params.meta = encode_meta(conn.name(), params.meta);
        conn.client()
            .complete(&params)
            .await
            .map_err(|e| HubError::upstream(conn.name(), e))
    }

    /// Sent to every upstream that declares logging. Failures are logged
    /// and never fail the downstream request.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<Value, HubError> {
        let targets: Vec<&Arc<Connection>> = self
            .connections
            .values()
            .filter(|conn| conn.capabilities().logging.is_some())
            .collect();
        let results = join_all(targets.iter().map(|conn| conn.client().set_logging_level(level))).await;
        for (conn, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server = %conn.name(), error = %e, "setting log level failed");
            }
        }
        Ok(empty_result())
    }

    // ── Downstream notifications ────────────────────────────────────

    /// Route a downstream progress report to the upstream its token names.
    pub async fn forward_progress(&self, mut params: ProgressParams) {
        let decoded = decode_progress_token(&params.progress_token);
        let Some(conn) = decoded
            .server
            .as_deref()
            .and_then(|server| self.connections.get(server))
        else {
            tracing::debug!(token = ?params.progress_token, "progress for unknown token, dropping");
            return;
        };

        params.progress_token = decoded.local;
        if let Err(e) = conn.client().notify_progress(&params).await {
            tracing::warn!(server = %conn.name(), error = %e, "forwarding progress failed");
        }
    }

    pub async fn roots_list_changed(&self) {
        let conns: Vec<&Arc<Connection>> = self.connections.values().collect();
        let results = join_all(conns.iter().map(|conn| conn.client().notify_roots_list_changed())).await;
        for (conn, result) in conns.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server = %conn.name(), error = %e, "forwarding roots change failed");
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Query every upstream that declares a category. Failing upstreams
    /// contribute nothing.
    async fn collect<'a, T, F, Fut>(
        &'a self,
        category: &'static str,
        declares: fn(&ServerCapabilities) -> bool,
        fetch: F,
    ) -> Vec<(&'a Connection, T)>
    where
        F: Fn(&'a Connection) -> Fut,
        Fut: Future<Output = Result<T, McpError>> + 'a,
    {
        let targets: Vec<&'a Connection> = self
            .connections
            .values()
            .map(|conn| conn.as_ref())
            .filter(|conn| declares(conn.capabilities()))
            .collect();

        let results = join_all(targets.iter().map(|conn| fetch(*conn))).await;
        targets
            .into_iter()
            .zip(results)
            .filter_map(|(conn, result)| match result {
                Ok(page) => Some((conn, page)),
                Err(e) => {
                    tracing::warn!(
                        server = %conn.name(),
                        category,
                        error = %e,
                        "listing failed, omitting server"
                    );
                    None
                }
            })
            .collect()
    }

    fn connection_with(
        &self,
        server: &str,
        declares: fn(&ServerCapabilities) -> bool,
    ) -> Option<&Arc<Connection>> {
        self.connections
            .get(server)
            .filter(|conn| declares(conn.capabilities()))
    }

    fn resource_target(
        &self,
        mut params: ResourceParams,
    ) -> Result<(&Arc<Connection>, ResourceParams), HubError> {
        let decoded = decode_uri(&params.uri);
        let conn = decoded
            .server
            .as_deref()
            .and_then(|server| self.connection_with(server, |caps| caps.resources.is_some()))
            .ok_or_else(|| HubError::InvalidParams(format!("Resource {} not found", params.uri)))?;

        params.uri = decoded.local;
        params.meta = encode_meta(conn.name(), params.meta);
        Ok((conn, params))
    }

    async fn resolve_tool(&self, name: &str) -> Option<NameEntry> {
        if snapshot(&self.tools).is_none() {
            self.list_tools().await;
        }
        snapshot(&self.tools)?.resolve(name).cloned()
    }

    async fn resolve_prompt(&self, name: &str) -> Option<NameEntry> {
        if snapshot(&self.prompts).is_none() {
            self.list_prompts().await;
        }
        snapshot(&self.prompts)?.resolve(name).cloned()
    }
}

fn snapshot(slot: &TableSlot) -> Option<Arc<NameTable>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Replace the table wholesale so readers never see a partial build.
fn publish(slot: &TableSlot, table: NameTable) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(table));
}

fn supports_subscribe(caps: &ServerCapabilities) -> bool {
    caps.resources.as_ref().is_some_and(|r| r.subscribe)
}

fn encode_meta(server: &str, meta: Option<RequestMeta>) -> Option<RequestMeta> {
    meta.map(|mut meta| {
        meta.progress_token = meta
            .progress_token
            .map(|token| encode_progress_token(server, &token));
        meta
    })
}

fn note_truncated(server: &str, category: &'static str, next_cursor: Option<&str>) {
    if next_cursor.is_some() {
        tracing::warn!(server = %server, category, "pagination unsupported, using first page only");
    }
}

fn note_downstream_cursor(method: &str, params: Option<Value>) {
    let cursor = params
        .and_then(|p| serde_json::from_value::<PaginatedParams>(p).ok())
        .and_then(|p| p.cursor);
    if let Some(cursor) = cursor {
        tracing::debug!(method, cursor = %cursor, "ignoring cursor, lists are never paginated");
    }
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, HubError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| HubError::InvalidParams(format!("Invalid params: {e}")))
}

fn to_result<T: Serialize>(value: T) -> Result<Value, HubError> {
    serde_json::to_value(value).map_err(|e| HubError::Internal(e.to_string()))
}
