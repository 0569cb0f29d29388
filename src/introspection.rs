//! Standard introspection query and its conversion into a [`SchemaDocument`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::schema::{FieldDefinition, InputValue, SchemaDocument, TypeDefinition, TypeKind, TypeRef};

pub const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    types {
      kind
      name
      fields(includeDeprecated: true) {
        name
        args { name type { ...TypeRef } defaultValue }
        type { ...TypeRef }
      }
      inputFields { name type { ...TypeRef } defaultValue }
      interfaces { name }
      enumValues(includeDeprecated: true) { name }
      possibleTypes { name }
    }
  }
}

fragment TypeRef on __Type {
  kind
  name
  ofType {
    kind
    name
    ofType {
      kind
      name
      ofType {
        kind
        name
        ofType { kind name ofType { kind name ofType { kind name } } }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionSchema {
    query_type: Option<NamedRef>,
    mutation_type: Option<NamedRef>,
    types: Vec<FullType>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullType {
    kind: TypeKind,
    name: String,
    #[serde(default)]
    fields: Option<Vec<IntrospectedField>>,
    #[serde(default)]
    input_fields: Option<Vec<IntrospectedInputValue>>,
    #[serde(default)]
    interfaces: Option<Vec<NamedRef>>,
    #[serde(default)]
    enum_values: Option<Vec<NamedRef>>,
    #[serde(default)]
    possible_types: Option<Vec<NamedRef>>,
}

#[derive(Debug, Deserialize)]
struct IntrospectedField {
    name: String,
    #[serde(default)]
    args: Vec<IntrospectedInputValue>,
    #[serde(rename = "type")]
    field_type: IntrospectedTypeRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectedInputValue {
    name: String,
    #[serde(rename = "type")]
    value_type: IntrospectedTypeRef,
    default_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectedTypeRef {
    kind: String,
    name: Option<String>,
    of_type: Option<Box<IntrospectedTypeRef>>,
}

impl IntrospectedTypeRef {
    fn convert(&self) -> Result<TypeRef, String> {
        match self.kind.as_str() {
            "NON_NULL" => Ok(TypeRef::NonNull(Box::new(self.inner()?.convert()?))),
            "LIST" => Ok(TypeRef::List(Box::new(self.inner()?.convert()?))),
            _ => self
                .name
                .clone()
                .map(TypeRef::Named)
                .ok_or_else(|| format!("named type reference of kind {} has no name", self.kind)),
        }
    }

    fn inner(&self) -> Result<&IntrospectedTypeRef, String> {
        self.of_type
            .as_deref()
            .ok_or_else(|| format!("{} type reference without ofType", self.kind))
    }
}

impl IntrospectedInputValue {
    fn convert(&self) -> Result<InputValue, String> {
        Ok(InputValue {
            name: self.name.clone(),
            value_type: self.value_type.convert()?,
            default_value: self.default_value.clone(),
        })
    }
}

/// Converts an introspection response body (`{"data": {"__schema": ...}}`)
/// into a schema document.
pub fn parse_introspection_response(body: &Value) -> Result<SchemaDocument, String> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() && body.pointer("/data/__schema").is_none() {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            return Err(format!("introspection rejected: {}", messages.join("; ")));
        }
    }

    let raw = body
        .pointer("/data/__schema")
        .ok_or_else(|| "response has no data.__schema".to_string())?;
    let schema: IntrospectionSchema = serde_json::from_value(raw.clone())
        .map_err(|e| format!("malformed introspection result: {}", e))?;

    let query_type = schema
        .query_type
        .map(|t| t.name)
        .ok_or_else(|| "introspection result has no queryType".to_string())?;

    let mut types = BTreeMap::new();
    for full_type in schema.types {
        if full_type.name.starts_with("__") {
            continue;
        }
        let def = convert_full_type(full_type)?;
        types.insert(def.name.clone(), def);
    }

    if !types.contains_key(&query_type) {
        return Err(format!("query type {} is not among the returned types", query_type));
    }

    let supports_entities = types
        .get(&query_type)
        .is_some_and(|q| q.fields.contains_key("_entities"));

    Ok(SchemaDocument {
        query_type,
        mutation_type: schema.mutation_type.map(|t| t.name),
        types,
        supports_entities,
    })
}

fn convert_full_type(full_type: FullType) -> Result<TypeDefinition, String> {
    let mut def = TypeDefinition::new(full_type.name, full_type.kind);

    for field in full_type.fields.unwrap_or_default() {
        let mut arguments = BTreeMap::new();
        for arg in &field.args {
            arguments.insert(arg.name.clone(), arg.convert()?);
        }
        let converted = FieldDefinition {
            name: field.name.clone(),
            arguments,
            field_type: field.field_type.convert()?,
        };
        def.fields.insert(field.name, converted);
    }
    for value in full_type.input_fields.unwrap_or_default() {
        def.input_fields.insert(value.name.clone(), value.convert()?);
    }
    def.interfaces = full_type
        .interfaces
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.name)
        .collect();
    def.enum_values = full_type
        .enum_values
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.name)
        .collect();
    def.possible_types = full_type
        .possible_types
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.name)
        .collect();

    Ok(def)
}
