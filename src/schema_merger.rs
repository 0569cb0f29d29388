//! Combines upstream schemas into one namespace.
//!
//! Root fields are unioned and must be unique across upstreams. Other
//! same-named types must be structurally identical, except for entity
//! types: an upstream may contribute extra fields to an object type as long
//! as every declaration carries the key field and the contributing upstream
//! answers `_entities` lookups.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use crate::UpstreamService;
use crate::error::GatewayError;
use crate::operation::OperationKind;
use crate::schema::{
    BUILTIN_SCALARS, FieldDefinition, TypeDefinition, TypeKind, is_federation_field,
    is_federation_type, write_type,
};

pub const QUERY_TYPE: &str = "Query";
pub const MUTATION_TYPE: &str = "Mutation";

/// Index into [`MergedSchema::upstreams`].
pub type UpstreamId = usize;

#[derive(Clone, Debug)]
pub struct RootField {
    pub owner: UpstreamId,
    pub definition: FieldDefinition,
}

#[derive(Clone, Debug)]
pub struct MergedType {
    pub definition: TypeDefinition,
    /// Upstreams able to resolve each field, in configuration order.
    pub field_owners: BTreeMap<String, Vec<UpstreamId>>,
    pub owners: Vec<UpstreamId>,
}

/// Read-only merged view over every healthy upstream.
#[derive(Clone, Debug)]
pub struct MergedSchema {
    upstreams: Vec<Arc<UpstreamService>>,
    query: BTreeMap<String, RootField>,
    mutation: BTreeMap<String, RootField>,
    types: BTreeMap<String, MergedType>,
}

impl MergedSchema {
    pub fn upstreams(&self) -> &[Arc<UpstreamService>] {
        &self.upstreams
    }

    pub fn upstream(&self, id: UpstreamId) -> &Arc<UpstreamService> {
        &self.upstreams[id]
    }

    pub fn root_fields(&self, kind: OperationKind) -> &BTreeMap<String, RootField> {
        match kind {
            OperationKind::Query => &self.query,
            OperationKind::Mutation => &self.mutation,
        }
    }

    pub fn root_type_name(kind: OperationKind) -> &'static str {
        match kind {
            OperationKind::Query => QUERY_TYPE,
            OperationKind::Mutation => MUTATION_TYPE,
        }
    }

    pub fn supports(&self, kind: OperationKind) -> bool {
        !self.root_fields(kind).is_empty()
    }

    pub fn get_type(&self, name: &str) -> Option<&MergedType> {
        self.types.get(name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn kind_of(&self, name: &str) -> Option<TypeKind> {
        match name {
            QUERY_TYPE => Some(TypeKind::Object),
            MUTATION_TYPE if self.supports(OperationKind::Mutation) => Some(TypeKind::Object),
            _ => self.types.get(name).map(|t| t.definition.kind),
        }
    }

    pub fn field(&self, parent: &str, name: &str) -> Option<&FieldDefinition> {
        match parent {
            QUERY_TYPE => self.query.get(name).map(|f| &f.definition),
            MUTATION_TYPE => self.mutation.get(name).map(|f| &f.definition),
            _ => self.types.get(parent)?.definition.fields.get(name),
        }
    }

    /// Upstreams able to resolve `parent.field`; root fields have exactly one.
    pub fn field_owners(&self, parent: &str, field: &str) -> Vec<UpstreamId> {
        match parent {
            QUERY_TYPE => self.query.get(field).map(|f| vec![f.owner]).unwrap_or_default(),
            MUTATION_TYPE => self.mutation.get(field).map(|f| vec![f.owner]).unwrap_or_default(),
            _ => self
                .types
                .get(parent)
                .and_then(|t| t.field_owners.get(field))
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Whether an object of type `concrete` matches a fragment on `condition`.
    pub fn type_applies(&self, concrete: &str, condition: &str) -> bool {
        if concrete == condition {
            return true;
        }
        let implements = self
            .types
            .get(concrete)
            .is_some_and(|t| t.definition.interfaces.contains(condition));
        let member = self
            .types
            .get(condition)
            .is_some_and(|t| t.definition.possible_types.contains(concrete));
        implements || member
    }

    pub fn field_count(&self) -> usize {
        let nested: usize = self
            .types
            .values()
            .filter(|t| matches!(t.definition.kind, TypeKind::Object | TypeKind::Interface))
            .map(|t| t.definition.fields.len())
            .sum();
        self.query.len() + self.mutation.len() + nested
    }

    /// Prints the merged schema as SDL.
    pub fn to_sdl(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_sdl(&mut out);
        out
    }

    fn write_sdl(&self, out: &mut String) -> std::fmt::Result {
        for kind in [OperationKind::Query, OperationKind::Mutation] {
            let fields = self.root_fields(kind);
            if fields.is_empty() {
                continue;
            }
            let mut root = TypeDefinition::new(MergedSchema::root_type_name(kind), TypeKind::Object);
            root.fields = fields
                .iter()
                .map(|(name, f)| (name.clone(), f.definition.clone()))
                .collect();
            write_type(out, &root)?;
            writeln!(out)?;
        }
        for merged in self.types.values() {
            if BUILTIN_SCALARS.contains(&merged.definition.name.as_str()) {
                continue;
            }
            write_type(out, &merged.definition)?;
            writeln!(out)?;
        }
        Ok(())
    }
}

/// Merges the schemas of `upstreams`, in order.
pub fn merge(upstreams: Vec<Arc<UpstreamService>>) -> Result<MergedSchema, GatewayError> {
    let mut query: BTreeMap<String, RootField> = BTreeMap::new();
    let mut mutation: BTreeMap<String, RootField> = BTreeMap::new();
    let mut types: BTreeMap<String, MergedType> = BTreeMap::new();

    for (id, upstream) in upstreams.iter().enumerate() {
        let doc = &upstream.schema;

        let roots = [
            (QUERY_TYPE, Some(doc.query_type.as_str()), &mut query),
            (MUTATION_TYPE, doc.mutation_type.as_deref(), &mut mutation),
        ];
        for (merged_name, own_name, target) in roots {
            let Some(root) = own_name.and_then(|name| doc.types.get(name)) else {
                continue;
            };
            for (field_name, definition) in &root.fields {
                if is_federation_field(field_name) {
                    continue;
                }
                if let Some(existing) = target.get(field_name) {
                    return Err(GatewayError::Conflict {
                        name: format!("{}.{}", merged_name, field_name),
                        first: upstreams[existing.owner].name.clone(),
                        second: upstream.name.clone(),
                        reason: "root field is declared by more than one upstream".to_string(),
                    });
                }
                target.insert(
                    field_name.clone(),
                    RootField {
                        owner: id,
                        definition: definition.clone(),
                    },
                );
            }
        }

        for (type_name, definition) in &doc.types {
            if doc.root_type(type_name) || is_federation_type(type_name) {
                continue;
            }
            if type_name == QUERY_TYPE || type_name == MUTATION_TYPE {
                return Err(GatewayError::Conflict {
                    name: type_name.clone(),
                    first: upstream.name.clone(),
                    second: upstream.name.clone(),
                    reason: "name is reserved for a merged root type".to_string(),
                });
            }
            match types.get_mut(type_name) {
                None => {
                    types.insert(type_name.clone(), MergedType::new(definition, id));
                }
                Some(existing) => merge_type(existing, definition, id, &upstreams)?,
            }
        }
    }

    for scalar in BUILTIN_SCALARS {
        types.entry(scalar.to_string()).or_insert_with(|| MergedType {
            definition: TypeDefinition::new(scalar, TypeKind::Scalar),
            field_owners: BTreeMap::new(),
            owners: Vec::new(),
        });
    }

    Ok(MergedSchema {
        upstreams,
        query,
        mutation,
        types,
    })
}

impl MergedType {
    fn new(definition: &TypeDefinition, owner: UpstreamId) -> Self {
        MergedType {
            definition: definition.clone(),
            field_owners: definition
                .fields
                .keys()
                .map(|name| (name.clone(), vec![owner]))
                .collect(),
            owners: vec![owner],
        }
    }
}

fn merge_type(
    existing: &mut MergedType,
    incoming: &TypeDefinition,
    id: UpstreamId,
    upstreams: &[Arc<UpstreamService>],
) -> Result<(), GatewayError> {
    let first = existing.owners.first().copied().unwrap_or(id);
    let conflict = |reason: String| GatewayError::Conflict {
        name: incoming.name.clone(),
        first: upstreams[first].name.clone(),
        second: upstreams[id].name.clone(),
        reason,
    };

    let current = &existing.definition;
    if current.kind != incoming.kind {
        return Err(conflict(format!(
            "declared as {:?} and as {:?}",
            current.kind, incoming.kind
        )));
    }

    if current.structurally_eq(incoming) {
        existing.owners.push(id);
        for owners in existing.field_owners.values_mut() {
            owners.push(id);
        }
        if existing.definition.key.is_none() {
            existing.definition.key = incoming.key.clone();
        }
        return Ok(());
    }

    if current.kind != TypeKind::Object {
        return Err(conflict("definitions are not identical".to_string()));
    }

    for (name, field) in &incoming.fields {
        if let Some(known) = current.fields.get(name) {
            if known != field {
                return Err(conflict(format!(
                    "field `{}` is `{}` in one upstream and `{}` in the other",
                    name, known.field_type, field.field_type
                )));
            }
        }
    }
    if current.interfaces != incoming.interfaces {
        return Err(conflict("implemented interfaces differ".to_string()));
    }

    let key = current
        .key
        .clone()
        .or_else(|| incoming.key.clone())
        .unwrap_or_else(|| incoming.key_field().to_string());
    if !current.fields.contains_key(&key) || !incoming.fields.contains_key(&key) {
        return Err(conflict(format!(
            "field sets differ and key field `{}` is not declared by both",
            key
        )));
    }

    let adds_fields = incoming.fields.keys().any(|f| !current.fields.contains_key(f));
    if adds_fields && !upstreams[id].schema.supports_entities {
        return Err(conflict(format!(
            "`{}` adds fields but does not answer entity lookups",
            upstreams[id].name
        )));
    }
    for (name, owners) in &existing.field_owners {
        if incoming.fields.contains_key(name) {
            continue;
        }
        let resolvable = owners
            .iter()
            .any(|&owner| upstreams[owner].schema.supports_entities);
        if !resolvable {
            return Err(conflict(format!(
                "field `{}` is only reachable through an upstream without entity lookups",
                name
            )));
        }
    }

    existing.definition.key = Some(key);
    for (name, field) in &incoming.fields {
        existing
            .definition
            .fields
            .entry(name.clone())
            .or_insert_with(|| field.clone());
        existing.field_owners.entry(name.clone()).or_default().push(id);
    }
    existing.owners.push(id);
    Ok(())
}
