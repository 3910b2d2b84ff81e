//! Tool catalog for the project agent.
//!
//! Each tool is a named, schema-described operation bound to the domain
//! gateway. The catalog validates input against the tool's schema before the
//! gateway is reached, and reports failures as `ToolCallError` so the
//! orchestrator can feed them back to the reasoner.

pub mod epic;
pub mod project;
pub mod sprint;
pub mod task;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{DomainGateway, UserId};
use crate::error::{CatalogError, DomainError, ToolCallError};

/// Default and maximum page sizes for list-style tools.
pub(crate) const DEFAULT_LIST_LIMIT: usize = 20;
pub(crate) const MAX_LIST_LIMIT: usize = 100;

/// Tool definition advertised to the reasoner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Whether a tool mutates domain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEffect {
    /// Reads only; safe to retry.
    Pure,
    /// Creates, updates, deletes or assigns.
    Impure,
}

/// Per-invocation context.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Acting user, derived from the session key.
    pub user_id: Option<UserId>,

    /// Optional timeout for a single gateway round trip.
    pub timeout: Option<Duration>,

    /// Extra attempts for pure tools when the gateway is unavailable.
    pub pure_retries: u32,
}

impl ToolContext {
    pub fn new(user_id: Option<UserId>) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pure_retries(mut self, retries: u32) -> Self {
        self.pure_retries = retries;
        self
    }
}

/// Async tool handler function.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolCallError>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

/// A registered tool: definition, classification and bound callable.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub definition: ToolDefinition,
    pub effect: ToolEffect,
    handler: ToolHandler,
}

impl ToolDescriptor {
    pub fn new(definition: ToolDefinition, effect: ToolEffect, handler: ToolHandler) -> Self {
        Self {
            definition,
            effect,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.definition.name)
            .field("effect", &self.effect)
            .finish_non_exhaustive()
    }
}

/// Binds an async tool function to a gateway.
pub fn bind<F, Fut>(gateway: &Arc<dyn DomainGateway>, f: F) -> ToolHandler
where
    F: Fn(Arc<dyn DomainGateway>, Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolCallError>> + Send + 'static,
{
    let gateway = Arc::clone(gateway);
    Arc::new(move |input, ctx| Box::pin(f(Arc::clone(&gateway), input, ctx)))
}

/// Tool catalog (descriptors keyed by lowercase name).
///
/// Built once at startup and shared read-only behind an `Arc`.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    descriptors: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every project/task/epic/sprint tool bound to `gateway`.
    pub fn builtins(gateway: &Arc<dyn DomainGateway>) -> Self {
        let mut catalog = Self::new();
        for descriptor in project::descriptors(gateway)
            .into_iter()
            .chain(task::descriptors(gateway))
            .chain(epic::descriptors(gateway))
            .chain(sprint::descriptors(gateway))
        {
            // Builtin names are distinct constants; a clash is a programming error
            // caught by `test_builtin_names_are_unique`.
            if let Err(err) = catalog.register(descriptor) {
                tracing::error!(%err, "skipping builtin tool");
            }
        }
        catalog
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), CatalogError> {
        let key = descriptor.name().to_ascii_lowercase();
        if self.index.contains_key(&key) {
            return Err(CatalogError::DuplicateTool(descriptor.name().to_string()));
        }
        self.index.insert(key, self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.descriptors[i])
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.descriptors
            .iter()
            .map(|d| d.definition.clone())
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Validates `input` and runs the named tool.
    ///
    /// Names match case-insensitively. Pure tools are retried while the
    /// gateway reports `Unavailable`, up to `ctx.pure_retries` extra attempts.
    pub async fn invoke(
        &self,
        name: &str,
        input: &Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolCallError> {
        let Some(descriptor) = self.get(name) else {
            let mut available = self.tool_names();
            available.sort();
            return Err(ToolCallError::UnknownTool {
                name: name.to_string(),
                available,
            });
        };
        let tool = descriptor.name();

        validate_input(&descriptor.definition.input_schema, input)
            .map_err(|message| ToolCallError::invalid_input(tool, message))?;

        let attempts = match descriptor.effect {
            ToolEffect::Pure => 1 + ctx.pure_retries,
            ToolEffect::Impure => 1,
        };
        let mut attempt = 1;
        loop {
            let result = call_with_timeout(descriptor, input.clone(), ctx).await;
            match result {
                Err(ToolCallError::Domain { ref source, .. })
                    if source.is_transient() && attempt < attempts =>
                {
                    tracing::debug!(tool, attempt, error = %source, "retrying pure tool");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

async fn call_with_timeout(
    descriptor: &ToolDescriptor,
    input: Value,
    ctx: &ToolContext,
) -> Result<Value, ToolCallError> {
    let fut = (descriptor.handler)(input, ctx.clone());
    match ctx.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ToolCallError::domain(
                descriptor.name(),
                DomainError::Unavailable(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                )),
            )),
        },
        None => fut.await,
    }
}

/// Parses tool input into its typed form.
pub(crate) fn parse_input<T: DeserializeOwned>(tool: &str, input: Value) -> Result<T, ToolCallError> {
    serde_json::from_value(input)
        .map_err(|e| ToolCallError::invalid_input(tool, format!("Parse error: {e}")))
}

/// Serializes a domain object as tool output data.
pub(crate) fn encode<T: Serialize>(tool: &str, value: &T) -> Result<Value, ToolCallError> {
    serde_json::to_value(value)
        .map_err(|e| ToolCallError::domain(tool, DomainError::Invalid(e.to_string())))
}

pub(crate) fn list_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Checks `input` against the JSON schema subset the tool definitions use:
/// `type`, `properties`, `required`, `additionalProperties: false`, `enum`,
/// `minimum`, `minLength` and `maxLength`.
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), String> {
    let Some(object) = input.as_object() else {
        return Err("input must be a JSON object".to_string());
    };
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if object.get(field).is_none_or(Value::is_null) {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
    for (field, value) in object {
        match properties.and_then(|p| p.get(field)) {
            Some(_) if value.is_null() => {}
            Some(property) => check_value(field, property, value)?,
            None if closed => return Err(format!("unexpected field '{field}'")),
            None => {}
        }
    }
    Ok(())
}

fn check_value(field: &str, schema: &Value, value: &Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let matches = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !matches {
            return Err(format!("field '{field}' must be of type {expected}"));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        let names: Vec<String> = allowed.iter().map(ToString::to_string).collect();
        return Err(format!(
            "field '{field}' must be one of {}",
            names.join(", ")
        ));
    }

    if let (Some(minimum), Some(n)) = (
        schema.get("minimum").and_then(Value::as_f64),
        value.as_f64(),
    ) && n < minimum
    {
        return Err(format!("field '{field}' must be >= {minimum}"));
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64)
            && len < min
        {
            return Err(format!("field '{field}' must not be empty"));
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64)
            && len > max
        {
            return Err(format!("field '{field}' exceeds {max} characters"));
        }
    }

    if let (Some(items), Some(elements)) = (schema.get("items"), value.as_array()) {
        for element in elements {
            check_value(field, items, element)?;
        }
    }
    Ok(())
}
