//! Internal representation of an upstream type system.
//!
//! Upstreams describe themselves either through introspection (see
//! [`crate::introspection`]) or through SDL. Both end up as a
//! [`SchemaDocument`], which is what the merger works on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};

use graphql_parser::schema::{
    Definition, Directive, Field, InputValue as SdlInputValue, ObjectType, ObjectTypeExtension,
    Type, TypeDefinition as SdlTypeDefinition, TypeExtension, Value,
};
use serde::{Deserialize, Serialize};

pub const BUILTIN_SCALARS: [&str; 5] = ["Boolean", "Float", "ID", "Int", "String"];

pub const DEFAULT_KEY_FIELD: &str = "id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl TypeKind {
    pub fn is_composite(self) -> bool {
        matches!(self, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, TypeKind::Scalar | TypeKind::Enum)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    /// Innermost named type.
    pub fn named(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    pub(crate) fn from_ast(ty: &Type<'_, String>) -> Self {
        match ty {
            Type::NamedType(name) => TypeRef::Named(name.clone()),
            Type::ListType(inner) => TypeRef::List(Box::new(TypeRef::from_ast(inner))),
            Type::NonNullType(inner) => TypeRef::NonNull(Box::new(TypeRef::from_ast(inner))),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => write!(f, "{name}"),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputValue {
    pub name: String,
    pub value_type: TypeRef,
    pub default_value: Option<String>,
}

impl InputValue {
    pub fn is_required(&self) -> bool {
        self.value_type.is_non_null() && self.default_value.is_none()
    }

    fn from_sdl(value: &SdlInputValue<'_, String>) -> Self {
        InputValue {
            name: value.name.clone(),
            value_type: TypeRef::from_ast(&value.value_type),
            default_value: value.default_value.as_ref().map(render_value),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub arguments: BTreeMap<String, InputValue>,
    pub field_type: TypeRef,
}

impl FieldDefinition {
    fn from_sdl(field: &Field<'_, String>) -> Self {
        FieldDefinition {
            name: field.name.clone(),
            arguments: field
                .arguments
                .iter()
                .map(|arg| (arg.name.clone(), InputValue::from_sdl(arg)))
                .collect(),
            field_type: TypeRef::from_ast(&field.field_type),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    pub fields: BTreeMap<String, FieldDefinition>,
    pub input_fields: BTreeMap<String, InputValue>,
    pub interfaces: BTreeSet<String>,
    pub possible_types: BTreeSet<String>,
    pub enum_values: BTreeSet<String>,
    /// Entity key declared with `@key(fields: "...")`, if any.
    pub key: Option<String>,
}

impl TypeDefinition {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        TypeDefinition {
            name: name.into(),
            kind,
            fields: BTreeMap::new(),
            input_fields: BTreeMap::new(),
            interfaces: BTreeSet::new(),
            possible_types: BTreeSet::new(),
            enum_values: BTreeSet::new(),
            key: None,
        }
    }

    /// Equality of everything clients can observe; the entity key is
    /// gateway metadata and does not take part.
    pub fn structurally_eq(&self, other: &TypeDefinition) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.fields == other.fields
            && self.input_fields == other.input_fields
            && self.interfaces == other.interfaces
            && self.possible_types == other.possible_types
            && self.enum_values == other.enum_values
    }

    pub fn key_field(&self) -> &str {
        self.key.as_deref().unwrap_or(DEFAULT_KEY_FIELD)
    }
}

/// One upstream's type system.
#[derive(Clone, Debug)]
pub struct SchemaDocument {
    pub query_type: String,
    pub mutation_type: Option<String>,
    pub types: BTreeMap<String, TypeDefinition>,
    /// Whether the upstream answers `_entities` lookups.
    pub supports_entities: bool,
}

impl SchemaDocument {
    /// Parses a schema written in SDL, including `extend type` blocks.
    pub fn from_sdl(sdl: &str) -> Result<Self, String> {
        let document = graphql_parser::parse_schema::<String>(sdl)
            .map_err(|e| format!("failed to parse SDL: {}", e))?;

        let mut query_type = None;
        let mut mutation_type = None;
        let mut types: BTreeMap<String, TypeDefinition> = BTreeMap::new();
        let mut extensions: Vec<&ObjectTypeExtension<'_, String>> = Vec::new();

        for definition in &document.definitions {
            match definition {
                Definition::SchemaDefinition(schema) => {
                    query_type = schema.query.clone();
                    mutation_type = schema.mutation.clone();
                }
                Definition::TypeDefinition(typedef) => {
                    let converted = convert_type_definition(typedef);
                    types.insert(converted.name.clone(), converted);
                }
                Definition::TypeExtension(TypeExtension::Object(extension)) => {
                    extensions.push(extension);
                }
                Definition::TypeExtension(_) | Definition::DirectiveDefinition(_) => {}
            }
        }

        for extension in extensions {
            let target = types
                .entry(extension.name.clone())
                .or_insert_with(|| TypeDefinition::new(extension.name.clone(), TypeKind::Object));
            if target.kind != TypeKind::Object {
                return Err(format!("cannot extend non-object type {}", extension.name));
            }
            for field in &extension.fields {
                target
                    .fields
                    .insert(field.name.clone(), FieldDefinition::from_sdl(field));
            }
            target
                .interfaces
                .extend(extension.implements_interfaces.iter().cloned());
            if target.key.is_none() {
                target.key = key_directive(&extension.directives);
            }
        }

        let query_type = query_type.unwrap_or_else(|| "Query".to_string());
        let mutation_type = mutation_type.or_else(|| {
            types
                .contains_key("Mutation")
                .then(|| "Mutation".to_string())
        });

        if !types.contains_key(&query_type) {
            return Err(format!("schema has no query type `{}`", query_type));
        }

        let supports_entities = types.values().any(|t| t.key.is_some())
            || types
                .get(&query_type)
                .is_some_and(|q| q.fields.contains_key("_entities"));

        Ok(SchemaDocument {
            query_type,
            mutation_type,
            types,
            supports_entities,
        })
    }

    pub fn root_type(&self, name: &str) -> bool {
        name == self.query_type || self.mutation_type.as_deref() == Some(name)
    }

    /// Number of client-visible fields: root fields plus object and
    /// interface fields, excluding federation plumbing.
    pub fn field_count(&self) -> usize {
        self.types
            .values()
            .filter(|t| matches!(t.kind, TypeKind::Object | TypeKind::Interface))
            .filter(|t| !is_federation_type(&t.name))
            .map(|t| {
                if self.root_type(&t.name) {
                    t.fields
                        .keys()
                        .filter(|name| !is_federation_field(name))
                        .count()
                } else {
                    t.fields.len()
                }
            })
            .sum()
    }
}

/// Root fields that exist only for gateway-to-upstream traffic.
pub fn is_federation_field(name: &str) -> bool {
    matches!(name, "_entities" | "_service") || name.starts_with("__")
}

pub fn is_federation_type(name: &str) -> bool {
    matches!(name, "_Any" | "_Entity" | "_Service" | "_FieldSet") || name.starts_with("__")
}

fn convert_type_definition(typedef: &SdlTypeDefinition<'_, String>) -> TypeDefinition {
    match typedef {
        SdlTypeDefinition::Scalar(scalar) => TypeDefinition::new(scalar.name.clone(), TypeKind::Scalar),
        SdlTypeDefinition::Object(object) => convert_object(object),
        SdlTypeDefinition::Interface(iface) => {
            let mut def = TypeDefinition::new(iface.name.clone(), TypeKind::Interface);
            def.fields = iface
                .fields
                .iter()
                .map(|f| (f.name.clone(), FieldDefinition::from_sdl(f)))
                .collect();
            def.interfaces = iface.implements_interfaces.iter().cloned().collect();
            def
        }
        SdlTypeDefinition::Union(union_type) => {
            let mut def = TypeDefinition::new(union_type.name.clone(), TypeKind::Union);
            def.possible_types = union_type.types.iter().cloned().collect();
            def
        }
        SdlTypeDefinition::Enum(enum_type) => {
            let mut def = TypeDefinition::new(enum_type.name.clone(), TypeKind::Enum);
            def.enum_values = enum_type.values.iter().map(|v| v.name.clone()).collect();
            def
        }
        SdlTypeDefinition::InputObject(input) => {
            let mut def = TypeDefinition::new(input.name.clone(), TypeKind::InputObject);
            def.input_fields = input
                .fields
                .iter()
                .map(|v| (v.name.clone(), InputValue::from_sdl(v)))
                .collect();
            def
        }
    }
}

fn convert_object(object: &ObjectType<'_, String>) -> TypeDefinition {
    let mut def = TypeDefinition::new(object.name.clone(), TypeKind::Object);
    def.fields = object
        .fields
        .iter()
        .map(|f| (f.name.clone(), FieldDefinition::from_sdl(f)))
        .collect();
    def.interfaces = object.implements_interfaces.iter().cloned().collect();
    def.key = key_directive(&object.directives);
    def
}

/// First field named in `@key(fields: "...")`.
fn key_directive(directives: &[Directive<'_, String>]) -> Option<String> {
    directives
        .iter()
        .filter(|d| d.name == "key")
        .flat_map(|d| d.arguments.iter())
        .find_map(|(name, value)| match (name.as_str(), value) {
            ("fields", Value::String(fields)) => {
                fields.split_whitespace().next().map(str::to_string)
            }
            _ => None,
        })
}

/// Renders a literal the way it appears in a GraphQL document.
pub(crate) fn render_value(value: &Value<'_, String>) -> String {
    match value {
        Value::Variable(name) => format!("${}", name),
        Value::Int(number) => number.as_i64().map(|n| n.to_string()).unwrap_or_default(),
        Value::Float(float) => float.to_string(),
        Value::String(string) => {
            serde_json::to_string(string).unwrap_or_else(|_| format!("\"{}\"", string))
        }
        Value::Boolean(flag) => flag.to_string(),
        Value::Null => "null".to_string(),
        Value::Enum(name) => name.clone(),
        Value::List(items) => {
            let items: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|(name, value)| format!("{}: {}", name, render_value(value)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
    }
}

/// Appends the SDL form of `def` to `out`.
pub(crate) fn write_type(out: &mut String, def: &TypeDefinition) -> fmt::Result {
    match def.kind {
        TypeKind::Scalar => writeln!(out, "scalar {}", def.name),
        TypeKind::Union => {
            let members: Vec<&str> = def.possible_types.iter().map(String::as_str).collect();
            writeln!(out, "union {} = {}", def.name, members.join(" | "))
        }
        TypeKind::Enum => {
            writeln!(out, "enum {} {{", def.name)?;
            for value in &def.enum_values {
                writeln!(out, "  {}", value)?;
            }
            writeln!(out, "}}")
        }
        TypeKind::InputObject => {
            writeln!(out, "input {} {{", def.name)?;
            for value in def.input_fields.values() {
                writeln!(out, "  {}", render_input_value(value))?;
            }
            writeln!(out, "}}")
        }
        TypeKind::Object | TypeKind::Interface => {
            let keyword = if def.kind == TypeKind::Object { "type" } else { "interface" };
            write!(out, "{} {}", keyword, def.name)?;
            if !def.interfaces.is_empty() {
                let names: Vec<&str> = def.interfaces.iter().map(String::as_str).collect();
                write!(out, " implements {}", names.join(" & "))?;
            }
            writeln!(out, " {{")?;
            for field in def.fields.values() {
                write!(out, "  {}", field.name)?;
                if !field.arguments.is_empty() {
                    let args: Vec<String> =
                        field.arguments.values().map(render_input_value).collect();
                    write!(out, "({})", args.join(", "))?;
                }
                writeln!(out, ": {}", field.field_type)?;
            }
            writeln!(out, "}}")
        }
    }
}

fn render_input_value(value: &InputValue) -> String {
    match &value.default_value {
        Some(default) => format!("{}: {} = {}", value.name, value.value_type, default),
        None => format!("{}: {}", value.name, value.value_type),
    }
}
