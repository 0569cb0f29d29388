use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{GatewayError, TransportError};
use crate::metrics;
use crate::operation::{OperationKind, Selection};
use crate::query_planner::{Fetch, FetchKind, KEY_ALIAS, QueryPlan, REPRESENTATIONS_VAR, TYPENAME_ALIAS};
use crate::schema_merger::MergedSchema;
use crate::{GraphQLError, GraphQLRequest, GraphQLResponse, UpstreamService};

#[async_trait]
pub trait QueryExecutor {
    async fn execute_plan(
        &self,
        plan: QueryPlan,
        schema: &MergedSchema,
    ) -> Result<GraphQLResponse, GatewayError>;
}

/// Runs plans level by level over each upstream's transport.
pub struct FetchExecutor {
    timeout: Duration,
    tracing: bool,
}

struct FetchTiming {
    service: String,
    depth: usize,
    duration: Duration,
}

impl FetchExecutor {
    pub fn new(timeout: Duration) -> Self {
        FetchExecutor {
            timeout,
            tracing: false,
        }
    }

    /// Attach per-fetch timings under `extensions.tracing`.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    async fn dispatch(
        &self,
        upstream: &UpstreamService,
        request: &GraphQLRequest,
    ) -> (Duration, Result<Value, GatewayError>) {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.timeout,
            upstream.transport.send(&upstream.url, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        };
        let elapsed = started.elapsed();
        metrics::record_upstream_request(&upstream.name, elapsed, outcome.is_ok());

        let outcome = outcome.map_err(|e| {
            warn!(service = %upstream.name, error = %e, "Upstream request failed");
            GatewayError::UpstreamFailed {
                service: upstream.name.clone(),
                reason: e.to_string(),
            }
        });
        (elapsed, outcome)
    }
}

#[async_trait]
impl QueryExecutor for FetchExecutor {
    async fn execute_plan(
        &self,
        plan: QueryPlan,
        schema: &MergedSchema,
    ) -> Result<GraphQLResponse, GatewayError> {
        let started = Instant::now();
        let operation = &plan.operation;

        let mut data = Value::Object(Map::new());
        let mut errors: Vec<GraphQLError> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut first_failure: Option<GatewayError> = None;
        let mut root_failures = 0;
        let mut timings: Vec<FetchTiming> = Vec::new();

        let mut level: Vec<&Fetch> = plan.fetches.iter().collect();
        let mut depth = 0;

        while !level.is_empty() {
            // Each fetch carries the response locations its fields land under.
            let mut prepared: Vec<(&Fetch, GraphQLRequest, Vec<Vec<Value>>)> =
                Vec::with_capacity(level.len());
            for fetch in level {
                let mut variables = operation.variables_for(&fetch.variables);
                let mut locations = vec![Vec::new()];
                if let FetchKind::Entity {
                    type_name,
                    key_field,
                    path,
                    ..
                } = &fetch.kind
                {
                    let (targets, representations): (Vec<_>, Vec<_>) =
                        representations(&data, path, type_name, key_field)
                            .into_iter()
                            .unzip();
                    if representations.is_empty() {
                        continue;
                    }
                    locations = targets;
                    variables.insert(
                        REPRESENTATIONS_VAR.to_string(),
                        Value::Array(representations),
                    );
                }
                let request = GraphQLRequest {
                    query: fetch.query.clone(),
                    variables: Some(Value::Object(variables)),
                    operation_name: None,
                };
                prepared.push((fetch, request, locations));
            }

            // Root mutation fields run one after another.
            let outcomes = if depth == 0 && operation.kind == OperationKind::Mutation {
                let mut outcomes = Vec::with_capacity(prepared.len());
                for (fetch, request, _) in &prepared {
                    outcomes.push(self.dispatch(schema.upstream(fetch.upstream), request).await);
                }
                outcomes
            } else {
                join_all(
                    prepared
                        .iter()
                        .map(|(fetch, request, _)| self.dispatch(schema.upstream(fetch.upstream), request)),
                )
                .await
            };

            let mut next = Vec::new();
            for ((fetch, _, locations), (elapsed, outcome)) in prepared.into_iter().zip(outcomes) {
                let service = schema.upstream(fetch.upstream).name.clone();
                debug!(service = %service, depth, elapsed_ms = elapsed.as_millis() as u64, "Fetch completed");
                timings.push(FetchTiming {
                    service: service.clone(),
                    depth,
                    duration: elapsed,
                });

                match outcome {
                    Ok(body) => {
                        collect_upstream_errors(&body, &service, &mut errors);
                        match &fetch.kind {
                            FetchKind::Root { .. } => merge_root_data(&mut data, &body),
                            FetchKind::Entity {
                                type_name, path, ..
                            } => apply_entities(&mut data, path, type_name, &body),
                        }
                        next.extend(fetch.children.iter());
                    }
                    Err(error) => {
                        let keys = match &fetch.kind {
                            FetchKind::Root { response_keys } => {
                                root_failures += 1;
                                response_keys
                            }
                            FetchKind::Entity { response_keys, .. } => response_keys,
                        };
                        for location in &locations {
                            for key in keys {
                                let mut path = location.clone();
                                path.push(json!(key));
                                errors.push(
                                    GraphQLError::new(error.to_string())
                                        .with_path(path)
                                        .with_extension("code", json!(error.code()))
                                        .with_extension("service", json!(service)),
                                );
                            }
                        }
                        failed.push(service);
                        first_failure.get_or_insert(error);
                    }
                }
            }

            level = next;
            depth += 1;
        }

        if !plan.fetches.is_empty() && root_failures == plan.fetches.len() {
            return Err(match first_failure {
                Some(error) if failed.len() == 1 => error,
                _ => GatewayError::UpstreamFailed {
                    service: failed.join(", "),
                    reason: "every upstream request failed".to_string(),
                },
            });
        }

        if let Value::Object(root) = &mut data {
            for selection in &operation.selections {
                if let Selection::Field(field) = selection {
                    if field.name == "__typename" {
                        root.insert(field.response_key.clone(), json!(operation.root_type()));
                    }
                }
            }
        }

        let shaped = shape_value(schema, &data, &operation.selections);
        let extensions = self.tracing.then(|| tracing_extension(started.elapsed(), &timings));
        let response = GraphQLResponse {
            data: Some(shaped),
            errors,
            extensions,
        };

        if failed.is_empty() {
            Ok(response)
        } else {
            Err(GatewayError::PartialFailure {
                response: Box::new(response),
                failed,
            })
        }
    }
}

fn merge_root_data(data: &mut Value, body: &Value) {
    let (Value::Object(target), Some(Value::Object(fields))) = (data, body.get("data")) else {
        return;
    };
    for (key, value) in fields {
        target.insert(key.clone(), value.clone());
    }
}

fn collect_upstream_errors(body: &Value, service: &str, errors: &mut Vec<GraphQLError>) {
    let Some(Value::Array(reported)) = body.get("errors") else {
        return;
    };
    for error in reported {
        let parsed = serde_json::from_value::<GraphQLError>(error.clone())
            .unwrap_or_else(|_| GraphQLError::new(error.to_string()));
        errors.push(parsed.with_extension("service", json!(service)));
    }
}

/// Objects at `path` whose typename matches and which carry a key, with
/// the response location of each.
fn representations(
    data: &Value,
    path: &[String],
    type_name: &str,
    key_field: &str,
) -> Vec<(Vec<Value>, Value)> {
    let mut targets = Vec::new();
    collect_targets(data, path, &mut Vec::new(), &mut targets);
    targets
        .into_iter()
        .filter(|(_, object)| is_entity_target(object, type_name))
        .map(|(location, object)| {
            let representation = json!({
                "__typename": type_name,
                key_field: object[KEY_ALIAS].clone(),
            });
            (location, representation)
        })
        .collect()
}

fn apply_entities(data: &mut Value, path: &[String], type_name: &str, body: &Value) {
    let Some(Value::Array(entities)) = body.pointer("/data/_entities") else {
        return;
    };
    let mut targets = Vec::new();
    collect_targets_mut(data, path, &mut targets);
    let targets = targets
        .into_iter()
        .filter(|object| is_entity_target(object, type_name));

    for (target, entity) in targets.zip(entities) {
        if let Value::Object(fields) = entity {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn is_entity_target(object: &Map<String, Value>, type_name: &str) -> bool {
    object.get(TYPENAME_ALIAS).and_then(Value::as_str) == Some(type_name)
        && object.get(KEY_ALIAS).is_some_and(|key| !key.is_null())
}

fn collect_targets<'v>(
    value: &'v Value,
    path: &[String],
    location: &mut Vec<Value>,
    out: &mut Vec<(Vec<Value>, &'v Map<String, Value>)>,
) {
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                location.push(json!(index));
                collect_targets(item, path, location, out);
                location.pop();
            }
        }
        Value::Object(map) => match path.split_first() {
            None => out.push((location.clone(), map)),
            Some((head, rest)) => {
                if let Some(child) = map.get(head) {
                    location.push(json!(head));
                    collect_targets(child, rest, location, out);
                    location.pop();
                }
            }
        },
        _ => {}
    }
}

fn collect_targets_mut<'v>(
    value: &'v mut Value,
    path: &[String],
    out: &mut Vec<&'v mut Map<String, Value>>,
) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_targets_mut(item, path, out);
            }
        }
        Value::Object(map) => match path.split_first() {
            None => out.push(map),
            Some((head, rest)) => {
                if let Some(child) = map.get_mut(head) {
                    collect_targets_mut(child, rest, out);
                }
            }
        },
        _ => {}
    }
}

/// Projects `value` onto the requested selections, dropping gateway
/// aliases and filling absent fields with `null`.
fn shape_value(schema: &MergedSchema, value: &Value, selections: &[Selection]) -> Value {
    if selections.is_empty() {
        return value.clone();
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| shape_value(schema, item, selections))
                .collect(),
        ),
        Value::Object(source) => {
            let mut out = Map::new();
            shape_object(schema, source, selections, &mut out);
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn shape_object(
    schema: &MergedSchema,
    source: &Map<String, Value>,
    selections: &[Selection],
    out: &mut Map<String, Value>,
) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                let value = source.get(&field.response_key).unwrap_or(&Value::Null);
                let shaped = shape_value(schema, value, &field.selections);
                merge_shaped(out, &field.response_key, shaped);
            }
            Selection::Fragment {
                type_condition,
                selections,
            } => {
                let typename = source
                    .get(TYPENAME_ALIAS)
                    .or_else(|| source.get("__typename"))
                    .and_then(Value::as_str);
                if typename.is_some_and(|t| schema.type_applies(t, type_condition)) {
                    shape_object(schema, source, selections, out);
                }
            }
        }
    }
}

fn merge_shaped(out: &mut Map<String, Value>, key: &str, value: Value) {
    match (out.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_shaped(existing, &k, v);
            }
        }
        (Some(Value::Array(existing)), Value::Array(incoming)) if existing.len() == incoming.len() => {
            for (slot, item) in existing.iter_mut().zip(incoming) {
                if let (Value::Object(existing), Value::Object(incoming)) = (slot, item) {
                    for (k, v) in incoming {
                        merge_shaped(existing, &k, v);
                    }
                }
            }
        }
        (_, value) => {
            out.insert(key.to_string(), value);
        }
    }
}

fn tracing_extension(total: Duration, timings: &[FetchTiming]) -> Map<String, Value> {
    let fetches: Vec<Value> = timings
        .iter()
        .map(|t| {
            json!({
                "service": t.service,
                "depth": t.depth,
                "duration": t.duration.as_nanos() as u64,
            })
        })
        .collect();
    let mut extensions = Map::new();
    extensions.insert(
        "tracing".to_string(),
        json!({
            "version": 1,
            "duration": total.as_nanos() as u64,
            "fetches": fetches,
        }),
    );
    extensions
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn collects_targets_through_lists() {
        let data = json!({
            "orders": [
                { "buyer": { "_gw_typename": "User", "_gw_key": "1" } },
                { "buyer": null },
                { "buyer": { "_gw_typename": "User", "_gw_key": "2" } }
            ]
        });
        let path = vec!["orders".to_string(), "buyer".to_string()];
        let reps = representations(&data, &path, "User", "id");
        assert_eq!(
            reps,
            vec![
                (
                    vec![json!("orders"), json!(0), json!("buyer")],
                    json!({ "__typename": "User", "id": "1" })
                ),
                (
                    vec![json!("orders"), json!(2), json!("buyer")],
                    json!({ "__typename": "User", "id": "2" })
                )
            ]
        );
    }

    #[test]
    fn applies_entities_in_order() {
        let mut data = json!({
            "orders": [
                { "buyer": { "_gw_typename": "User", "_gw_key": "1" } },
                { "buyer": { "_gw_typename": "User", "_gw_key": "2" } }
            ]
        });
        let body = json!({ "data": { "_entities": [{ "name": "Ada" }, { "name": "Grace" }] } });
        apply_entities(
            &mut data,
            &["orders".to_string(), "buyer".to_string()],
            "User",
            &body,
        );
        assert_eq!(data["orders"][0]["buyer"]["name"], "Ada");
        assert_eq!(data["orders"][1]["buyer"]["name"], "Grace");
    }

    #[test]
    fn upstream_errors_are_tagged_with_the_service() {
        let body = json!({ "errors": [{ "message": "boom", "path": ["user"] }] });
        let mut errors = Vec::new();
        collect_upstream_errors(&body, "users", &mut errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");
        assert_eq!(errors[0].path, Some(vec![json!("user")]));
        assert_eq!(
            errors[0].extensions.as_ref().unwrap()["service"],
            json!("users")
        );
    }

    #[test]
    fn merges_overlapping_shapes() {
        let mut out = Map::new();
        merge_shaped(&mut out, "user", json!({ "id": "1" }));
        merge_shaped(&mut out, "user", json!({ "name": "Ada" }));
        assert_eq!(Value::Object(out), json!({ "user": { "id": "1", "name": "Ada" } }));
    }
}
