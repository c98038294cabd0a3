//! Per-tool OpenAPI document for the REST surface.

use crate::http::AppState;
use crate::registry::{CatalogSnapshot, RegisteredTool};
use axum::{Json, extract::State};
use serde_json::{Map, Value, json};
use std::sync::Arc;

const ERROR_RESPONSE_REF: &str = "#/components/schemas/ErrorResponse";

/// GET /tools/openapi.json - Regenerated from the current catalog on every request.
pub async fn tools_openapi(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.router.registry().snapshot();
    Json(build_tools_openapi(&snapshot, state.version))
}

#[must_use]
pub fn build_tools_openapi(snapshot: &CatalogSnapshot, version: &str) -> Value {
    let mut paths = Map::new();
    paths.insert(
        "/health".to_string(),
        json!({
            "get": {
                "summary": "Health Check",
                "operationId": "health_check",
                "tags": ["Bridge"],
                "responses": { "200": { "description": "Bridge health status" } },
            }
        }),
    );

    for tool in snapshot.tools() {
        paths.insert(
            format!("/tools/{}/{}", tool.server_id, tool.local_name),
            json!({ "post": tool_operation(tool) }),
        );
    }

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "MCP Bridge - Tool API",
            "description": "Each MCP tool is exposed as a separate endpoint.",
            "version": version,
        },
        "paths": paths,
        "components": {
            "schemas": {
                "ErrorResponse": {
                    "type": "object",
                    "required": ["error"],
                    "properties": {
                        "error": {
                            "type": "object",
                            "required": ["kind", "message"],
                            "properties": {
                                "kind": { "type": "string" },
                                "message": { "type": "string" },
                            },
                        },
                    },
                },
            },
        },
    })
}

fn tool_operation(tool: &RegisteredTool) -> Value {
    let required = tool
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .is_some_and(|r| !r.is_empty());

    let error = |description: &str| {
        json!({
            "description": description,
            "content": { "application/json": { "schema": { "$ref": ERROR_RESPONSE_REF } } },
        })
    };

    let mut operation = json!({
        "summary": summary(&tool.local_name),
        "operationId": operation_id(&tool.server_id, &tool.local_name),
        "tags": [tool.server_id],
        "requestBody": {
            "required": required,
            "content": { "application/json": { "schema": tool.input_schema } },
        },
        "responses": {
            "200": {
                "description": "Tool execution result",
                "content": { "application/json": { "schema": { "type": "object" } } },
            },
            "400": error("Invalid request body"),
            "404": error("Tool not found"),
            "502": error("Backend returned an error or malformed reply"),
            "503": error("Backend unavailable"),
            "504": error("Tool call timed out"),
        },
    });
    if let Some(description) = &tool.description {
        operation["description"] = Value::String(description.clone());
    }
    operation
}

/// `{server}_{tool}` with `-` replaced by `_`.
#[must_use]
pub fn operation_id(server_id: &str, tool: &str) -> String {
    format!("{server_id}_{tool}").replace('-', "_")
}

/// Tool name with `_` as spaces, title-cased.
#[must_use]
pub fn summary(tool: &str) -> String {
    let mut out = String::with_capacity(tool.len());
    let mut at_word_start = true;
    for c in tool.replace('_', " ").chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}
