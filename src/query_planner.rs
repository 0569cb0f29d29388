use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::GraphQLRequest;
use crate::error::GatewayError;
use crate::operation::{self, FieldSelection, Operation, OperationKind, Selection, render_selections};
use crate::schema::TypeKind;
use crate::schema_merger::{MergedSchema, UpstreamId};

/// Alias under which the entity key is selected for a later lookup.
pub const KEY_ALIAS: &str = "_gw_key";
/// Alias under which `__typename` is selected for fragment matching.
pub const TYPENAME_ALIAS: &str = "_gw_typename";
pub const REPRESENTATIONS_VAR: &str = "_gw_representations";

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &MergedSchema,
    ) -> Result<QueryPlan, GatewayError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchKind {
    /// Root fields owned by one upstream.
    Root { response_keys: Vec<String> },
    /// Fields of an entity type looked up by key through `_entities`.
    Entity {
        type_name: String,
        key_field: String,
        /// Response keys from the data root to the entity objects.
        path: Vec<String>,
        response_keys: Vec<String>,
    },
}

/// One sub-request. Children depend on its result and run afterwards.
#[derive(Clone, Debug)]
pub struct Fetch {
    pub upstream: UpstreamId,
    pub kind: FetchKind,
    pub query: String,
    pub variables: BTreeSet<String>,
    pub children: Vec<Fetch>,
}

pub struct QueryPlan {
    pub operation: Operation,
    pub fetches: Vec<Fetch>,
}

impl QueryPlan {
    /// Fetches per level, root first.
    pub fn levels(&self) -> Vec<Vec<&Fetch>> {
        let mut levels = Vec::new();
        let mut current: Vec<&Fetch> = self.fetches.iter().collect();
        while !current.is_empty() {
            let next = current.iter().flat_map(|f| f.children.iter()).collect();
            levels.push(current);
            current = next;
        }
        levels
    }
}

pub struct FederatedQueryPlanner;

impl FederatedQueryPlanner {
    pub fn new() -> Self {
        FederatedQueryPlanner
    }

    pub fn plan(&self, operation: Operation, schema: &MergedSchema) -> Result<QueryPlan, GatewayError> {
        let root = operation.root_type();

        let mut groups: Vec<(UpstreamId, Vec<Selection>)> = Vec::new();
        for selection in &operation.selections {
            let Selection::Field(field) = selection else {
                continue;
            };
            if field.name == "__typename" {
                continue;
            }
            let owner = schema
                .field_owners(root, &field.name)
                .first()
                .copied()
                .ok_or_else(|| {
                    GatewayError::validation(format!("No service resolves field \"{}\"", field.name))
                })?;
            // Mutation fields only share a fetch with adjacent fields of the
            // same owner, so the fetches replay the document order.
            let group = if operation.kind == OperationKind::Mutation {
                groups.last_mut().filter(|(id, _)| *id == owner)
            } else {
                groups.iter_mut().find(|(id, _)| *id == owner)
            };
            match group {
                Some((_, fields)) => fields.push(selection.clone()),
                None => groups.push((owner, vec![selection.clone()])),
            }
        }

        let mut fetches = Vec::with_capacity(groups.len());
        for (upstream, fields) in groups {
            let mut builder = FetchBuilder {
                schema,
                operation: &operation,
                children: Vec::new(),
            };
            let selections = builder.plan_selections(upstream, root, &fields, &[])?;
            let response_keys = response_keys(&selections);
            let (query, variables) = builder.render(operation.kind, &selections, &[]);
            fetches.push(Fetch {
                upstream,
                kind: FetchKind::Root { response_keys },
                query,
                variables,
                children: builder.children,
            });
        }

        Ok(QueryPlan { operation, fetches })
    }
}

impl Default for FederatedQueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryPlanner for FederatedQueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &MergedSchema,
    ) -> Result<QueryPlan, GatewayError> {
        let operation = operation::validate(request, schema)?;
        self.plan(operation, schema)
    }
}

struct FetchBuilder<'p> {
    schema: &'p MergedSchema,
    operation: &'p Operation,
    children: Vec<Fetch>,
}

impl FetchBuilder<'_> {
    /// Keeps the selections `upstream` can resolve under `parent`, turning
    /// the rest into entity fetches against their owners.
    fn plan_selections(
        &mut self,
        upstream: UpstreamId,
        parent: &str,
        selections: &[Selection],
        path: &[String],
    ) -> Result<Vec<Selection>, GatewayError> {
        let mut local = Vec::new();
        let mut remote: Vec<(UpstreamId, Vec<Selection>)> = Vec::new();
        let mut has_fragments = false;

        for selection in selections {
            match selection {
                Selection::Field(field) if field.name == "__typename" => {
                    local.push(selection.clone());
                }
                Selection::Field(field) => {
                    let owners = self.schema.field_owners(parent, &field.name);
                    if owners.contains(&upstream) {
                        let mut child_path = path.to_vec();
                        child_path.push(field.response_key.clone());
                        let children = if field.selections.is_empty() {
                            Vec::new()
                        } else {
                            self.plan_selections(
                                upstream,
                                &field.return_type,
                                &field.selections,
                                &child_path,
                            )?
                        };
                        local.push(Selection::Field(field.with_selections(children)));
                        continue;
                    }
                    let Some(&owner) = owners.first() else {
                        return Err(GatewayError::validation(format!(
                            "No service resolves field \"{}.{}\"",
                            parent, field.name
                        )));
                    };
                    match remote.iter_mut().find(|(id, _)| *id == owner) {
                        Some((_, fields)) => fields.push(selection.clone()),
                        None => remote.push((owner, vec![selection.clone()])),
                    }
                }
                Selection::Fragment {
                    type_condition,
                    selections,
                } => {
                    has_fragments = true;
                    let inner = self.plan_selections(upstream, type_condition, selections, path)?;
                    if !inner.is_empty() {
                        local.push(Selection::Fragment {
                            type_condition: type_condition.clone(),
                            selections: inner,
                        });
                    }
                }
            }
        }

        if has_fragments || !remote.is_empty() {
            push_synthetic(&mut local, TYPENAME_ALIAS, "__typename", "String");
        }
        if remote.is_empty() {
            return Ok(local);
        }

        let entity = self
            .schema
            .get_type(parent)
            .filter(|t| t.definition.kind == TypeKind::Object)
            .ok_or_else(|| {
                GatewayError::validation(format!(
                    "Fields of \"{}\" span several services but it is not an entity type",
                    parent
                ))
            })?;
        let key_field = entity.definition.key_field().to_string();
        push_synthetic(&mut local, KEY_ALIAS, &key_field, "ID");

        for (owner, fields) in remote {
            let mut nested = FetchBuilder {
                schema: self.schema,
                operation: self.operation,
                children: Vec::new(),
            };
            let selections = nested.plan_selections(owner, parent, &fields, path)?;
            let response_keys = response_keys(&selections);
            let lookup = FieldSelection {
                response_key: "_entities".to_string(),
                alias: None,
                name: "_entities".to_string(),
                arguments: vec![(
                    "representations".to_string(),
                    format!("${}", REPRESENTATIONS_VAR),
                )],
                directives: Vec::new(),
                variables: BTreeSet::new(),
                return_type: "_Entity".to_string(),
                selections: vec![Selection::Fragment {
                    type_condition: parent.to_string(),
                    selections,
                }],
            };
            let (query, variables) = nested.render(
                OperationKind::Query,
                &[Selection::Field(lookup)],
                &[(REPRESENTATIONS_VAR, "[_Any!]!")],
            );

            self.children.push(Fetch {
                upstream: owner,
                kind: FetchKind::Entity {
                    type_name: parent.to_string(),
                    key_field: key_field.clone(),
                    path: path.to_vec(),
                    response_keys,
                },
                query,
                variables,
                children: nested.children,
            });
        }

        Ok(local)
    }

    fn render(
        &self,
        kind: OperationKind,
        selections: &[Selection],
        extra: &[(&str, &str)],
    ) -> (String, BTreeSet<String>) {
        let mut variables = BTreeSet::new();
        for selection in selections {
            selection.collect_variables(&mut variables);
        }
        let mut query = self.operation.header(kind, &variables, extra);
        query.push(' ');
        render_selections(selections, &mut query);
        (query, variables)
    }
}

fn push_synthetic(selections: &mut Vec<Selection>, alias: &str, name: &str, return_type: &str) {
    let present = selections
        .iter()
        .any(|s| matches!(s, Selection::Field(f) if f.response_key == alias));
    if !present {
        selections.push(Selection::Field(FieldSelection::synthetic(alias, name, return_type)));
    }
}

fn response_keys(selections: &[Selection]) -> Vec<String> {
    selections
        .iter()
        .filter_map(|s| match s {
            Selection::Field(f) if !f.response_key.starts_with("_gw_") => Some(f.response_key.clone()),
            _ => None,
        })
        .collect()
}
