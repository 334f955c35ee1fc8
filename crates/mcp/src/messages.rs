//! Method names and payload types for the MCP requests and notifications
//! this crate routes.
//!
//! Items that a proxy rewrites but does not otherwise interpret (tools,
//! prompts, resources, resource contents, request params and `_meta`,
//! completion references) keep every field
//! they do not name in a flattened `extra` map, so forwarding them never
//! drops data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::RpcId;

/// MCP method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";

    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCE_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";

    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const ROOTS_LIST: &str = "roots/list";

    pub const NOTIFY_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFY_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFY_PROGRESS: &str = "notifications/progress";
    pub const NOTIFY_MESSAGE: &str = "notifications/message";
    pub const NOTIFY_RESOURCE_UPDATED: &str = "notifications/resources/updated";
    pub const NOTIFY_RESOURCE_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFY_TOOL_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFY_PROMPT_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFY_ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
}

// ── Progress & request metadata ─────────────────────────────────────

/// Progress token attached to a request's `_meta`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

/// The `_meta` object of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters shared by every paginated list request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginatedParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

// ── Listable items ──────────────────────────────────────────────────

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A prompt as advertised by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A concrete resource as advertised by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A parameterised resource as advertised by `resources/templates/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub uri_template: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of `prompts/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    pub prompts: Vec<Prompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of `resources/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of `resources/templates/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesResult {
    pub resource_templates: Vec<ResourceTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ── Targeted requests ───────────────────────────────────────────────

/// Parameters for `tools/call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters for `prompts/get`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters for `resources/read`, `resources/subscribe` and
/// `resources/unsubscribe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceParams {
    pub uri: String,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One text or blob entry of a `resources/read` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What a completion request completes an argument for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reference {
    #[serde(rename = "ref/prompt")]
    Prompt {
        name: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    #[serde(rename = "ref/resource")]
    Resource {
        uri: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

/// Parameters for `completion/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteParams {
    #[serde(rename = "ref")]
    pub reference: Reference,
    pub argument: Value,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Severity levels for `logging/setLevel` and log notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// Parameters for `logging/setLevel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLevelParams {
    pub level: LoggingLevel,
}

// ── Notifications ───────────────────────────────────────────────────

/// Parameters of `notifications/progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of `notifications/resources/updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdatedParams {
    pub uri: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of `notifications/message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingMessageParams {
    pub level: LoggingLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

/// Parameters of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The `{}` result returned by requests that produce nothing.
pub fn empty_result() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "name": "search",
            "description": "Search the web",
            "inputSchema": {"type": "object"},
            "annotations": {"readOnlyHint": true}
        });
        let tool: Tool = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(tool.name, "search");
        assert_eq!(tool.extra["description"], "Search the web");
        assert_eq!(serde_json::to_value(&tool).unwrap(), raw);
    }

    #[test]
    fn test_request_meta_progress_token_variants() {
        let params: CallToolParams = serde_json::from_value(serde_json::json!({
            "name": "search",
            "arguments": {"q": "rust"},
            "_meta": {"progressToken": 7, "traceId": "abc"}
        }))
        .unwrap();
        assert!(params.extra.is_empty());
        let meta = params.meta.unwrap();
        assert_eq!(meta.progress_token, Some(ProgressToken::Number(7)));
        assert_eq!(meta.extra["traceId"], "abc");

        let token: ProgressToken = serde_json::from_value(serde_json::json!("tok")).unwrap();
        assert_eq!(token, ProgressToken::String("tok".to_string()));
    }

    #[test]
    fn test_request_params_keep_unknown_fields() {
        let raw = serde_json::json!({
            "name": "search",
            "arguments": {},
            "task": {"ttl": 5}
        });
        let params: CallToolParams = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(params.extra["task"], serde_json::json!({"ttl": 5}));
        assert_eq!(serde_json::to_value(&params).unwrap(), raw);

        let complete: CompleteParams = serde_json::from_value(serde_json::json!({
            "ref": {"type": "ref/prompt", "name": "greet"},
            "argument": {"name": "who", "value": "w"},
            "context": {"arguments": {"k": "v"}}
        }))
        .unwrap();
        assert_eq!(complete.extra["context"]["arguments"]["k"], "v");
    }

    #[test]
    fn test_reference_kinds() {
        let prompt: Reference =
            serde_json::from_value(serde_json::json!({"type": "ref/prompt", "name": "greet"}))
                .unwrap();
        assert_eq!(
            prompt,
            Reference::Prompt {
                name: "greet".into(),
                extra: Map::new()
            }
        );

        let raw = serde_json::json!({"type": "ref/resource", "uri": "file:///a", "title": "A"});
        let resource: Reference = serde_json::from_value(raw.clone()).unwrap();
        match &resource {
            Reference::Resource { uri, extra } => {
                assert_eq!(uri, "file:///a");
                assert_eq!(extra["title"], "A");
            }
            other => panic!("unexpected reference: {other:?}"),
        }
        assert_eq!(serde_json::to_value(&resource).unwrap(), raw);

        let bogus = serde_json::from_value::<Reference>(
            serde_json::json!({"type": "ref/tool", "name": "x"}),
        );
        assert!(bogus.is_err());
    }

    #[test]
    fn test_list_result_pagination_cursor() {
        let result: ListPromptsResult = serde_json::from_value(serde_json::json!({
            "prompts": [{"name": "greet"}],
            "nextCursor": "page-2"
        }))
        .unwrap();
        assert_eq!(result.next_cursor.as_deref(), Some("page-2"));

        let json = serde_json::to_value(ListToolsResult::default()).unwrap();
        assert_eq!(json, serde_json::json!({"tools": []}));
    }

    #[test]
    fn test_logging_level_names() {
        let params: SetLevelParams =
            serde_json::from_value(serde_json::json!({"level": "warning"})).unwrap();
        assert_eq!(params.level, LoggingLevel::Warning);
    }
}
