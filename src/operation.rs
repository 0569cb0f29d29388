//! Validation of client operations against the merged schema.
//!
//! A valid operation is lowered into a small selection tree with fragments
//! resolved, `@skip`/`@include` applied, and argument literals rendered.
//! The planner slices that tree per upstream and the executor uses it to
//! shape the final response.

use std::collections::{BTreeSet, HashMap, HashSet};

use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, OperationDefinition,
    Selection as AstSelection, SelectionSet, Type, TypeCondition, Value as AstValue,
    VariableDefinition as AstVariableDefinition,
};
use serde_json::{Map, Value};

use crate::GraphQLRequest;
use crate::error::GatewayError;
use crate::schema::{TypeKind, TypeRef, render_value};
use crate::schema_merger::MergedSchema;

/// Prefix of aliases and variables the gateway adds to upstream requests.
pub const RESERVED_PREFIX: &str = "_gw_";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub var_type: String,
    pub default_value: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSelection {
    pub response_key: String,
    pub alias: Option<String>,
    pub name: String,
    /// Argument name and rendered literal.
    pub arguments: Vec<(String, String)>,
    /// Rendered directives forwarded upstream.
    pub directives: Vec<String>,
    /// Variables referenced by arguments and directives of this field only.
    pub variables: BTreeSet<String>,
    /// Named return type.
    pub return_type: String,
    pub selections: Vec<Selection>,
}

impl FieldSelection {
    /// A leaf selection added by the gateway, e.g. `_gw_key: id`.
    pub fn synthetic(alias: &str, name: &str, return_type: &str) -> Self {
        FieldSelection {
            response_key: alias.to_string(),
            alias: Some(alias.to_string()),
            name: name.to_string(),
            arguments: Vec::new(),
            directives: Vec::new(),
            variables: BTreeSet::new(),
            return_type: return_type.to_string(),
            selections: Vec::new(),
        }
    }

    /// Same field with children replaced.
    pub fn with_selections(&self, selections: Vec<Selection>) -> Self {
        FieldSelection {
            response_key: self.response_key.clone(),
            alias: self.alias.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            directives: self.directives.clone(),
            variables: self.variables.clone(),
            return_type: self.return_type.clone(),
            selections,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(FieldSelection),
    /// Inline fragment on a type other than the parent's own type.
    Fragment {
        type_condition: String,
        selections: Vec<Selection>,
    },
}

impl Selection {
    pub fn render(&self, out: &mut String) {
        match self {
            Selection::Field(field) => {
                if let Some(alias) = &field.alias {
                    out.push_str(alias);
                    out.push_str(": ");
                }
                out.push_str(&field.name);
                if !field.arguments.is_empty() {
                    let args: Vec<String> = field
                        .arguments
                        .iter()
                        .map(|(name, value)| format!("{}: {}", name, value))
                        .collect();
                    out.push('(');
                    out.push_str(&args.join(", "));
                    out.push(')');
                }
                for directive in &field.directives {
                    out.push(' ');
                    out.push_str(directive);
                }
                if !field.selections.is_empty() {
                    out.push(' ');
                    render_selections(&field.selections, out);
                }
            }
            Selection::Fragment {
                type_condition,
                selections,
            } => {
                out.push_str("... on ");
                out.push_str(type_condition);
                out.push(' ');
                render_selections(selections, out);
            }
        }
    }

    pub fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Selection::Field(field) => {
                out.extend(field.variables.iter().cloned());
                for child in &field.selections {
                    child.collect_variables(out);
                }
            }
            Selection::Fragment { selections, .. } => {
                for child in selections {
                    child.collect_variables(out);
                }
            }
        }
    }
}

pub fn render_selections(selections: &[Selection], out: &mut String) {
    out.push_str("{ ");
    for selection in selections {
        selection.render(out);
        out.push(' ');
    }
    out.push('}');
}

/// A validated operation.
#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDefinition>,
    pub variables: Map<String, Value>,
    pub selections: Vec<Selection>,
}

impl Operation {
    pub fn root_type(&self) -> &'static str {
        MergedSchema::root_type_name(self.kind)
    }

    /// Header such as `query Name($id: ID!)` restricted to `used` variables.
    pub fn header(
        &self,
        kind: OperationKind,
        used: &BTreeSet<String>,
        extra: &[(&str, &str)],
    ) -> String {
        let mut definitions: Vec<String> = self
            .variable_definitions
            .iter()
            .filter(|v| used.contains(&v.name))
            .map(|v| match &v.default_value {
                Some(default) => format!("${}: {} = {}", v.name, v.var_type, default),
                None => format!("${}: {}", v.name, v.var_type),
            })
            .collect();
        definitions.extend(extra.iter().map(|(name, ty)| format!("${}: {}", name, ty)));

        let mut header = kind.as_str().to_string();
        if let Some(name) = &self.name {
            header.push(' ');
            header.push_str(name);
        }
        if !definitions.is_empty() {
            header.push('(');
            header.push_str(&definitions.join(", "));
            header.push(')');
        }
        header
    }

    /// Request variables restricted to `used`.
    pub fn variables_for(&self, used: &BTreeSet<String>) -> Map<String, Value> {
        self.variables
            .iter()
            .filter(|(name, _)| used.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Parses and validates `request` against `schema`.
pub fn validate(request: &GraphQLRequest, schema: &MergedSchema) -> Result<Operation, GatewayError> {
    let document = graphql_parser::parse_query::<String>(&request.query)
        .map_err(|e| GatewayError::validation(format!("Syntax error: {}", e)))?;

    let variables = match &request.variables {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(GatewayError::validation("Variables must be a JSON object")),
    };

    let operation = select_operation(&document, request.operation_name.as_deref())?;
    let (kind, name, variable_definitions, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, &[][..], set),
        OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.name.clone(),
            &q.variable_definitions[..],
            &q.selection_set,
        ),
        OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.name.clone(),
            &m.variable_definitions[..],
            &m.selection_set,
        ),
        OperationDefinition::Subscription(_) => {
            return Err(GatewayError::validation("Subscriptions are not supported"));
        }
    };

    if kind == OperationKind::Mutation && !schema.supports(kind) {
        return Err(GatewayError::validation("Schema is not configured for mutations"));
    }

    let fragments = document
        .definitions
        .iter()
        .filter_map(|d| match d {
            Definition::Fragment(fragment) => Some((fragment.name.as_str(), fragment)),
            _ => None,
        })
        .collect();

    let mut validator = Validator {
        schema,
        fragments,
        variables: &variables,
        defined: HashMap::new(),
        spreads: Vec::new(),
    };
    let variable_definitions = validator.variable_definitions(variable_definitions)?;

    let mut selections = Vec::new();
    validator.selections(MergedSchema::root_type_name(kind), selection_set, &mut selections)?;

    Ok(Operation {
        kind,
        name,
        variable_definitions,
        variables,
        selections,
    })
}

fn select_operation<'d, 'a>(
    document: &'d Document<'a, String>,
    operation_name: Option<&str>,
) -> Result<&'d OperationDefinition<'a, String>, GatewayError> {
    let operations: Vec<&OperationDefinition<'a, String>> = document
        .definitions
        .iter()
        .filter_map(|d| match d {
            Definition::Operation(op) => Some(op),
            Definition::Fragment(_) => None,
        })
        .collect();

    match operation_name {
        Some(wanted) => operations
            .into_iter()
            .find(|op| operation_name_of(op) == Some(wanted))
            .ok_or_else(|| GatewayError::validation(format!("Unknown operation named \"{}\"", wanted))),
        None => match operations.as_slice() {
            [single] => Ok(*single),
            [] => Err(GatewayError::validation("Document contains no operation")),
            _ => Err(GatewayError::validation(
                "Must provide operation name if query contains multiple operations",
            )),
        },
    }
}

fn operation_name_of<'a>(operation: &'a OperationDefinition<'_, String>) -> Option<&'a str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

struct Validator<'d, 'a> {
    schema: &'d MergedSchema,
    fragments: HashMap<&'d str, &'d FragmentDefinition<'a, String>>,
    variables: &'d Map<String, Value>,
    /// Defined variables and their boolean default, if any.
    defined: HashMap<String, Option<bool>>,
    spreads: Vec<String>,
}

impl<'d, 'a> Validator<'d, 'a> {
    fn variable_definitions(
        &mut self,
        definitions: &[AstVariableDefinition<'a, String>],
    ) -> Result<Vec<VariableDefinition>, GatewayError> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(definitions.len());

        for definition in definitions {
            if !seen.insert(definition.name.as_str()) {
                return Err(GatewayError::validation(format!(
                    "There can be only one variable named \"${}\"",
                    definition.name
                )));
            }
            if definition.name.starts_with(RESERVED_PREFIX) {
                return Err(GatewayError::validation(format!(
                    "Variable \"${}\" is reserved by the gateway",
                    definition.name
                )));
            }
            let var_type = TypeRef::from_ast(&definition.var_type);
            match self.schema.kind_of(var_type.named()) {
                Some(TypeKind::Scalar | TypeKind::Enum | TypeKind::InputObject) => {}
                _ => {
                    return Err(GatewayError::validation(format!(
                        "Variable \"${}\" cannot be of non-input type \"{}\"",
                        definition.name, var_type
                    )));
                }
            }

            let provided = self
                .variables
                .get(&definition.name)
                .is_some_and(|v| !v.is_null());
            if matches!(definition.var_type, Type::NonNullType(_))
                && definition.default_value.is_none()
                && !provided
            {
                return Err(GatewayError::validation(format!(
                    "Variable \"${}\" of required type \"{}\" was not provided",
                    definition.name, var_type
                )));
            }

            let default_bool = match &definition.default_value {
                Some(AstValue::Boolean(flag)) => Some(*flag),
                _ => None,
            };
            self.defined.insert(definition.name.clone(), default_bool);
            out.push(VariableDefinition {
                name: definition.name.clone(),
                var_type: var_type.to_string(),
                default_value: definition.default_value.as_ref().map(render_value),
            });
        }
        Ok(out)
    }

    fn selections(
        &mut self,
        parent: &str,
        set: &'d SelectionSet<'a, String>,
        out: &mut Vec<Selection>,
    ) -> Result<(), GatewayError> {
        for item in &set.items {
            match item {
                AstSelection::Field(field) => {
                    if !self.included(&field.directives)? {
                        continue;
                    }
                    let node = self.field(parent, field)?;
                    push_field(out, node)?;
                }
                AstSelection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives)? {
                        continue;
                    }
                    let name = spread.fragment_name.as_str();
                    let fragment = *self.fragments.get(name).ok_or_else(|| {
                        GatewayError::validation(format!("Unknown fragment \"{}\"", name))
                    })?;
                    if self.spreads.iter().any(|s| s == name) {
                        return Err(GatewayError::validation(format!(
                            "Cannot spread fragment \"{}\" within itself",
                            name
                        )));
                    }
                    let TypeCondition::On(condition) = &fragment.type_condition;
                    self.spreads.push(name.to_string());
                    self.fragment(parent, condition, &fragment.selection_set, out)?;
                    self.spreads.pop();
                }
                AstSelection::InlineFragment(inline) => {
                    if !self.included(&inline.directives)? {
                        continue;
                    }
                    let condition = match &inline.type_condition {
                        Some(TypeCondition::On(condition)) => condition.as_str(),
                        None => parent,
                    };
                    self.fragment(parent, condition, &inline.selection_set, out)?;
                }
            }
        }
        Ok(())
    }

    fn fragment(
        &mut self,
        parent: &str,
        condition: &str,
        set: &'d SelectionSet<'a, String>,
        out: &mut Vec<Selection>,
    ) -> Result<(), GatewayError> {
        let kind = self
            .schema
            .kind_of(condition)
            .ok_or_else(|| GatewayError::validation(format!("Unknown type \"{}\"", condition)))?;
        if !kind.is_composite() {
            return Err(GatewayError::validation(format!(
                "Fragment cannot condition on non composite type \"{}\"",
                condition
            )));
        }

        let parent_is_object = self.schema.kind_of(parent) == Some(TypeKind::Object);
        if condition == parent || (parent_is_object && self.schema.type_applies(parent, condition)) {
            return self.selections(parent, set, out);
        }
        if parent_is_object {
            return Err(GatewayError::validation(format!(
                "Fragment cannot be spread here as objects of type \"{}\" can never be of type \"{}\"",
                parent, condition
            )));
        }

        let mut inner = Vec::new();
        self.selections(condition, set, &mut inner)?;
        if !inner.is_empty() {
            out.push(Selection::Fragment {
                type_condition: condition.to_string(),
                selections: inner,
            });
        }
        Ok(())
    }

    fn field(
        &mut self,
        parent: &str,
        field: &'d Field<'a, String>,
    ) -> Result<FieldSelection, GatewayError> {
        if let Some(alias) = field.alias.as_deref().filter(|a| a.starts_with(RESERVED_PREFIX)) {
            return Err(GatewayError::validation(format!(
                "Alias \"{}\" is reserved by the gateway",
                alias
            )));
        }
        let response_key = field.alias.clone().unwrap_or_else(|| field.name.clone());

        if field.name == "__typename" {
            if !field.selection_set.items.is_empty() {
                return Err(GatewayError::validation(
                    "Field \"__typename\" must not have a selection",
                ));
            }
            let mut typename = FieldSelection::synthetic(&response_key, "__typename", "String");
            typename.alias = field.alias.clone();
            return Ok(typename);
        }
        if field.name.starts_with("__") {
            return Err(GatewayError::validation(format!(
                "Introspection field \"{}\" is not supported by the gateway",
                field.name
            )));
        }

        let definition = self
            .schema
            .field(parent, &field.name)
            .cloned()
            .ok_or_else(|| {
                GatewayError::validation(format!(
                    "Cannot query field \"{}\" on type \"{}\"",
                    field.name, parent
                ))
            })?;

        let mut variables = BTreeSet::new();
        let mut arguments = Vec::with_capacity(field.arguments.len());
        for (name, value) in &field.arguments {
            if !definition.arguments.contains_key(name) {
                return Err(GatewayError::validation(format!(
                    "Unknown argument \"{}\" on field \"{}.{}\"",
                    name, parent, field.name
                )));
            }
            self.referenced_variables(value, &mut variables)?;
            arguments.push((name.clone(), render_value(value)));
        }
        for (name, argument) in &definition.arguments {
            let supplied = field
                .arguments
                .iter()
                .any(|(n, v)| n == name && !matches!(v, AstValue::Null));
            if argument.is_required() && !supplied {
                return Err(GatewayError::validation(format!(
                    "Field \"{}\" argument \"{}\" of type \"{}\" is required, but it was not provided",
                    field.name, name, argument.value_type
                )));
            }
        }

        let mut directives = Vec::new();
        for directive in forwarded_directives(&field.directives) {
            for (_, value) in &directive.arguments {
                self.referenced_variables(value, &mut variables)?;
            }
            directives.push(render_directive(directive));
        }

        let return_type = definition.field_type.named().to_string();
        let kind = self.schema.kind_of(&return_type).ok_or_else(|| {
            GatewayError::validation(format!("Unknown type \"{}\"", return_type))
        })?;

        let mut selections = Vec::new();
        if kind.is_composite() {
            if field.selection_set.items.is_empty() {
                return Err(GatewayError::validation(format!(
                    "Field \"{}\" of type \"{}\" must have a selection of subfields",
                    field.name, definition.field_type
                )));
            }
            self.selections(&return_type, &field.selection_set, &mut selections)?;
            if selections.is_empty() {
                selections.push(Selection::Field(FieldSelection::synthetic(
                    "__typename",
                    "__typename",
                    "String",
                )));
            }
        } else if !field.selection_set.items.is_empty() {
            return Err(GatewayError::validation(format!(
                "Field \"{}\" must not have a selection since type \"{}\" has no subfields",
                field.name, definition.field_type
            )));
        }

        Ok(FieldSelection {
            response_key,
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments,
            directives,
            variables,
            return_type,
            selections,
        })
    }

    fn referenced_variables(
        &self,
        value: &AstValue<'a, String>,
        out: &mut BTreeSet<String>,
    ) -> Result<(), GatewayError> {
        match value {
            AstValue::Variable(name) => {
                if !self.defined.contains_key(name) {
                    return Err(GatewayError::validation(format!(
                        "Variable \"${}\" is not defined",
                        name
                    )));
                }
                out.insert(name.clone());
            }
            AstValue::List(items) => {
                for item in items {
                    self.referenced_variables(item, out)?;
                }
            }
            AstValue::Object(fields) => {
                for item in fields.values() {
                    self.referenced_variables(item, out)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluates `@skip` and `@include`.
    fn included(&self, directives: &[Directive<'a, String>]) -> Result<bool, GatewayError> {
        for directive in directives {
            let expected = match directive.name.as_str() {
                "skip" => false,
                "include" => true,
                _ => continue,
            };
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| value)
                .ok_or_else(|| {
                    GatewayError::validation(format!(
                        "Directive \"@{}\" argument \"if\" is required",
                        directive.name
                    ))
                })?;
            let flag = match condition {
                AstValue::Boolean(flag) => *flag,
                AstValue::Variable(name) => match self.defined.get(name) {
                    None => {
                        return Err(GatewayError::validation(format!(
                            "Variable \"${}\" is not defined",
                            name
                        )));
                    }
                    Some(default) => self
                        .variables
                        .get(name)
                        .and_then(Value::as_bool)
                        .or(*default)
                        .unwrap_or(false),
                },
                _ => {
                    return Err(GatewayError::validation(format!(
                        "Directive \"@{}\" argument \"if\" must be a Boolean",
                        directive.name
                    )));
                }
            };
            if flag != expected {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn forwarded_directives<'x, 'a>(
    directives: &'x [Directive<'a, String>],
) -> impl Iterator<Item = &'x Directive<'a, String>> {
    directives
        .iter()
        .filter(|d| d.name != "skip" && d.name != "include")
}

fn render_directive(directive: &Directive<'_, String>) -> String {
    if directive.arguments.is_empty() {
        return format!("@{}", directive.name);
    }
    let args: Vec<String> = directive
        .arguments
        .iter()
        .map(|(name, value)| format!("{}: {}", name, render_value(value)))
        .collect();
    format!("@{}({})", directive.name, args.join(", "))
}

/// Appends `field`, folding it into an earlier selection with the same
/// response key.
fn push_field(out: &mut Vec<Selection>, field: FieldSelection) -> Result<(), GatewayError> {
    for existing in out.iter_mut() {
        let Selection::Field(current) = existing else {
            continue;
        };
        if current.response_key != field.response_key {
            continue;
        }
        if current.name != field.name || current.arguments != field.arguments {
            return Err(GatewayError::validation(format!(
                "Fields \"{}\" conflict because they select different fields or arguments",
                field.response_key
            )));
        }
        for child in field.selections {
            match child {
                Selection::Field(child) => push_field(&mut current.selections, child)?,
                fragment => current.selections.push(fragment),
            }
        }
        return Ok(());
    }
    out.push(Selection::Field(field));
    Ok(())
}
