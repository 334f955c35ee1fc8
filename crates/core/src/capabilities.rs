//! Merges upstream capabilities into what the hub advertises downstream.

use toolmux_mcp::{
    CompletionsCapability, LoggingCapability, PromptsCapability, ResourcesCapability,
    ServerCapabilities, ToolsCapability,
};

use crate::connection::ConnectionSet;

const INSTRUCTIONS_PREAMBLE: &str =
    "This server is a proxy that aggregates several other servers.\n\nProxied servers:";

/// Capability categories are present when any upstream declares them;
/// sub-flags are OR-ed together.
pub fn merge_capabilities<'a>(
    upstreams: impl IntoIterator<Item = &'a ServerCapabilities>,
) -> ServerCapabilities {
    let mut merged = ServerCapabilities::default();

    for caps in upstreams {
        if let Some(tools) = &caps.tools {
            let entry = merged.tools.get_or_insert_with(ToolsCapability::default);
            entry.list_changed |= tools.list_changed;
        }
        if let Some(prompts) = &caps.prompts {
            let entry = merged.prompts.get_or_insert_with(PromptsCapability::default);
            entry.list_changed |= prompts.list_changed;
        }
        if let Some(resources) = &caps.resources {
            let entry = merged
                .resources
                .get_or_insert_with(ResourcesCapability::default);
            entry.subscribe |= resources.subscribe;
            entry.list_changed |= resources.list_changed;
        }
        if caps.logging.is_some() {
            merged.logging.get_or_insert_with(LoggingCapability::default);
        }
        if caps.completions.is_some() {
            merged
                .completions
                .get_or_insert_with(CompletionsCapability::default);
        }
    }

    merged
}

/// Preamble followed by one `# name` section per upstream, in order.
pub fn combine_instructions<'a>(
    upstreams: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
) -> String {
    std::iter::once(INSTRUCTIONS_PREAMBLE.to_string())
        .chain(
            upstreams
                .into_iter()
                .map(|(name, instructions)| format!("# {name}\n{}", instructions.unwrap_or(""))),
        )
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Advertised capabilities and combined instructions for a connection set.
pub fn aggregate(connections: &ConnectionSet) -> (ServerCapabilities, String) {
    let capabilities = merge_capabilities(connections.values().map(|c| c.capabilities()));
    let instructions = combine_instructions(
        connections
            .values()
            .map(|c| (c.name(), c.instructions())),
    );
    (capabilities, instructions)
}
