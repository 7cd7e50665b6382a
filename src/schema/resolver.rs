//! Field -> column resolution, including relational targets that may not be materialized yet.

use crate::definition::validator::{
    int_param, parse_default, string_param, DEFAULT_DECIMAL_PLACES, DEFAULT_MAX_DIGITS, DEFAULT_MAX_LENGTH,
};
use crate::definition::{FieldDefinition, FieldType};
use crate::error::{DefinitionError, EngineError};
use crate::schema::descriptor::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Allow-list of entities outside the dynamic set that relations may point at.
#[derive(Clone, Debug)]
pub struct ExternalCatalog {
    entries: Vec<ExternalEntity>,
}

impl Default for ExternalCatalog {
    fn default() -> Self {
        ExternalCatalog::new(vec![
            ExternalEntity::new("auth", "User", "auth_user"),
            ExternalEntity::new("auth", "Group", "auth_group"),
            ExternalEntity::new("contenttypes", "ContentType", "django_content_type"),
        ])
    }
}

impl ExternalCatalog {
    pub fn new(entries: Vec<ExternalEntity>) -> Self {
        ExternalCatalog { entries }
    }

    pub fn empty() -> Self {
        ExternalCatalog { entries: Vec::new() }
    }

    pub fn entries(&self) -> &[ExternalEntity] {
        &self.entries
    }

    pub fn find_qualified(&self, namespace: &str, name: &str) -> Option<&ExternalEntity> {
        self.entries
            .iter()
            .find(|e| e.namespace.eq_ignore_ascii_case(namespace) && e.name.eq_ignore_ascii_case(name))
    }

    pub fn find_bare(&self, name: &str) -> Option<&ExternalEntity> {
        self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }
}

/// What a resolution can see: external allow-list, materialized descriptors, and active definitions
/// (entity name -> storage name).
pub struct ResolveContext<'a> {
    pub externals: &'a ExternalCatalog,
    pub materialized: &'a HashMap<String, Arc<EntityDescriptor>>,
    pub definitions: &'a HashMap<String, String>,
}

/// Column and/or relation produced for one field. Many-valued relations have no owner column.
#[derive(Clone, Debug)]
pub struct ResolvedField {
    pub column: Option<ColumnSpec>,
    pub relation: Option<RelationSpec>,
}

pub struct FieldTypeResolver;

impl FieldTypeResolver {
    /// Resolve one field of the entity stored as `owner_storage`.
    pub fn resolve(
        owner_storage: &str,
        field: &FieldDefinition,
        ctx: &ResolveContext<'_>,
    ) -> Result<ResolvedField, EngineError> {
        if !field.field_type.is_relational() {
            let column = Self::scalar_column(field)?;
            return Ok(ResolvedField {
                column: Some(column),
                relation: None,
            });
        }

        let target_name = field
            .target_entity_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DefinitionError::field(&field.name, "relational fields require a target entity"))?;
        let resolution = Self::resolve_target(&field.name, target_name, ctx)?;
        let target_storage = match &resolution {
            Resolution::Resolved(t) => t.storage_name().to_string(),
            Resolution::Forward(name) => ctx
                .definitions
                .get(name)
                .cloned()
                .unwrap_or_else(|| crate::case::to_snake_case(name)),
        };

        if field.field_type == FieldType::ReferenceMany {
            let join = join_table_spec(owner_storage, &field.name, &target_storage);
            let relation = RelationSpec {
                field_name: field.name.clone(),
                kind: field.field_type,
                resolution,
                on_delete: None,
                inverse_name: field.inverse_name.clone(),
                column: None,
                join_table: Some(join),
            };
            return Ok(ResolvedField {
                column: None,
                relation: Some(relation),
            });
        }

        let on_delete = field
            .on_delete
            .ok_or_else(|| DefinitionError::field(&field.name, "single-valued relations require an on-delete action"))?;
        let column_name = format!("{}_id", field.name);
        let column = ColumnSpec {
            name: column_name.clone(),
            field_name: Some(field.name.clone()),
            field_type: Some(field.field_type),
            physical: PhysicalType::Integer,
            nullable: !field.required,
            unique: field.unique || field.field_type == FieldType::ReferenceOneToOne,
            primary_key: false,
            default: None,
            references: Some(ForeignKey {
                table: target_storage,
                column: PK_COLUMN.into(),
                on_delete,
            }),
            upload_to: None,
        };
        let relation = RelationSpec {
            field_name: field.name.clone(),
            kind: field.field_type,
            resolution,
            on_delete: Some(on_delete),
            inverse_name: field.inverse_name.clone(),
            column: Some(column_name),
            join_table: None,
        };
        Ok(ResolvedField {
            column: Some(column),
            relation: Some(relation),
        })
    }

    /// Resolution order: qualified external name, bare external name (case-insensitive),
    /// materialized entity, active definition (forward reference).
    pub fn resolve_target(field: &str, target: &str, ctx: &ResolveContext<'_>) -> Result<Resolution, EngineError> {
        let unresolved = || EngineError::UnresolvedReference {
            field: field.to_string(),
            target: target.to_string(),
        };
        if let Some((namespace, name)) = target.split_once('.') {
            return ctx
                .externals
                .find_qualified(namespace, name)
                .map(|e| Resolution::Resolved(ResolvedTarget::External(e.clone())))
                .ok_or_else(unresolved);
        }
        if let Some(e) = ctx.externals.find_bare(target) {
            return Ok(Resolution::Resolved(ResolvedTarget::External(e.clone())));
        }
        if let Some(d) = ctx.materialized.get(target) {
            return Ok(Resolution::Resolved(ResolvedTarget::Entity(Arc::clone(d))));
        }
        if ctx.definitions.contains_key(target) {
            return Ok(Resolution::Forward(target.to_string()));
        }
        Err(unresolved())
    }

    fn scalar_column(field: &FieldDefinition) -> Result<ColumnSpec, EngineError> {
        let physical = Self::physical_type(field)?;
        let default = match field.default_value.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(parse_default(&field.name, field.field_type, raw)?),
            None => None,
        };
        let upload_to = match field.field_type {
            FieldType::File => Some(
                string_param(&field.name, &field.type_params, "upload_to")?
                    .unwrap_or("uploads/")
                    .to_string(),
            ),
            FieldType::Image => Some(
                string_param(&field.name, &field.type_params, "upload_to")?
                    .unwrap_or("images/")
                    .to_string(),
            ),
            _ => None,
        };
        Ok(ColumnSpec {
            name: field.name.clone(),
            field_name: Some(field.name.clone()),
            field_type: Some(field.field_type),
            physical,
            nullable: !field.required,
            unique: field.unique,
            primary_key: false,
            default,
            references: None,
            upload_to,
        })
    }

    pub fn physical_type(field: &FieldDefinition) -> Result<PhysicalType, DefinitionError> {
        let name = field.name.as_str();
        let params = &field.type_params;
        Ok(match field.field_type {
            FieldType::ShortText => {
                let n = int_param(name, params, "max_length")?.unwrap_or(DEFAULT_MAX_LENGTH);
                PhysicalType::Varchar {
                    max_length: positive_u32(name, "max_length", n)?,
                }
            }
            FieldType::LongText => PhysicalType::Text,
            FieldType::Integer => PhysicalType::Integer,
            FieldType::Decimal => {
                let digits = int_param(name, params, "max_digits")?.unwrap_or(DEFAULT_MAX_DIGITS);
                let places = int_param(name, params, "decimal_places")?.unwrap_or(DEFAULT_DECIMAL_PLACES);
                let digits = positive_u32(name, "max_digits", digits)?;
                if places < 0 {
                    return Err(DefinitionError::field(name, "decimal_places cannot be negative"));
                }
                if places > i64::from(digits) {
                    return Err(DefinitionError::field(name, "decimal_places cannot exceed max_digits"));
                }
                PhysicalType::Decimal {
                    digits,
                    places: places as u32,
                }
            }
            FieldType::Boolean => PhysicalType::Boolean,
            FieldType::Date => PhysicalType::Date,
            FieldType::Datetime => PhysicalType::DateTime,
            FieldType::Email => PhysicalType::Varchar { max_length: 254 },
            FieldType::Url => PhysicalType::Varchar { max_length: 200 },
            FieldType::File | FieldType::Image => PhysicalType::Varchar { max_length: 100 },
            FieldType::ReferenceOne | FieldType::ReferenceOneToOne => PhysicalType::Integer,
            FieldType::ReferenceMany => {
                return Err(DefinitionError::field(name, "many-valued relations have no owner column"));
            }
        })
    }
}

fn positive_u32(field: &str, key: &str, n: i64) -> Result<u32, DefinitionError> {
    if n <= 0 {
        return Err(DefinitionError::field(field, format!("{} must be a positive number", key)));
    }
    u32::try_from(n).map_err(|_| DefinitionError::field(field, format!("{} is too large", key)))
}

fn join_table_spec(owner_storage: &str, field: &str, target_storage: &str) -> JoinTableSpec {
    let (owner_column, target_column) = if owner_storage == target_storage {
        (format!("from_{}_id", owner_storage), format!("to_{}_id", target_storage))
    } else {
        (format!("{}_id", owner_storage), format!("{}_id", target_storage))
    };
    JoinTableSpec {
        name: format!("{}_{}", owner_storage, field),
        owner_table: owner_storage.to_string(),
        owner_column,
        target_table: target_storage.to_string(),
        target_column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::OnDeleteAction;
    use chrono::Utc;
    use serde_json::json;

    fn field(name: &str, ty: FieldType) -> FieldDefinition {
        FieldDefinition {
            id: 1,
            entity_id: 1,
            name: name.into(),
            field_type: ty,
            required: false,
            unique: false,
            default_value: None,
            type_params: Default::default(),
            target_entity_name: None,
            on_delete: None,
            inverse_name: None,
            position: 0,
            created_at: Utc::now(),
        }
    }

    fn relation(name: &str, ty: FieldType, target: &str) -> FieldDefinition {
        let mut f = field(name, ty);
        f.target_entity_name = Some(target.into());
        if ty.is_single_valued_relation() {
            f.on_delete = Some(OnDeleteAction::Cascade);
        }
        f
    }

    struct Fixture {
        externals: ExternalCatalog,
        materialized: HashMap<String, Arc<EntityDescriptor>>,
        definitions: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                externals: ExternalCatalog::default(),
                materialized: HashMap::new(),
                definitions: HashMap::new(),
            }
        }

        fn ctx(&self) -> ResolveContext<'_> {
            ResolveContext {
                externals: &self.externals,
                materialized: &self.materialized,
                definitions: &self.definitions,
            }
        }

        fn materialize(&mut self, name: &str, storage: &str) {
            self.definitions.insert(name.into(), storage.into());
            self.materialized.insert(
                name.into(),
                Arc::new(EntityDescriptor {
                    name: name.into(),
                    storage_name: storage.into(),
                    columns: vec![ColumnSpec::primary_key()],
                    relations: vec![],
                }),
            );
        }
    }

    #[test]
    fn decimal_maps_to_precision_and_scale() {
        let mut f = field("amount", FieldType::Decimal);
        f.type_params.insert("max_digits".into(), json!(10));
        f.type_params.insert("decimal_places".into(), json!(2));
        let fx = Fixture::new();
        let col = FieldTypeResolver::resolve("invoice", &f, &fx.ctx()).unwrap().column.unwrap();
        assert_eq!(col.physical, PhysicalType::Decimal { digits: 10, places: 2 });
        assert_eq!(col.physical.sql(), "DECIMAL(10, 2)");
        assert!(col.nullable);
    }

    #[test]
    fn malformed_params_fail_validation() {
        let fx = Fixture::new();
        let mut f = field("title", FieldType::ShortText);
        f.type_params.insert("max_length".into(), json!("long"));
        let err = FieldTypeResolver::resolve("t", &f, &fx.ctx()).unwrap_err();
        assert!(matches!(err, EngineError::DefinitionValidation(_)));

        let mut f = field("amount", FieldType::Decimal);
        f.type_params.insert("max_digits".into(), json!(3));
        f.type_params.insert("decimal_places".into(), json!(5));
        let err = FieldTypeResolver::resolve("t", &f, &fx.ctx()).unwrap_err();
        assert!(matches!(err, EngineError::DefinitionValidation(_)));
    }

    #[test]
    fn defaults_and_upload_paths() {
        let fx = Fixture::new();
        let mut f = field("paid", FieldType::Boolean);
        f.default_value = Some("yes".into());
        let col = FieldTypeResolver::resolve("t", &f, &fx.ctx()).unwrap().column.unwrap();
        assert_eq!(col.default, Some(DefaultValue::Boolean(true)));

        let col = FieldTypeResolver::resolve("t", &field("photo", FieldType::Image), &fx.ctx())
            .unwrap()
            .column
            .unwrap();
        assert_eq!(col.upload_to.as_deref(), Some("images/"));
        assert_eq!(col.physical, PhysicalType::Varchar { max_length: 100 });
    }

    #[test]
    fn external_targets_resolve_qualified_and_bare() {
        let fx = Fixture::new();
        let r = FieldTypeResolver::resolve_target("owner", "auth.User", &fx.ctx()).unwrap();
        assert!(matches!(r, Resolution::Resolved(ResolvedTarget::External(ref e)) if e.storage_name == "auth_user"));
        let r = FieldTypeResolver::resolve_target("owner", "user", &fx.ctx()).unwrap();
        assert!(matches!(r, Resolution::Resolved(ResolvedTarget::External(_))));
        let err = FieldTypeResolver::resolve_target("owner", "auth.Nobody", &fx.ctx()).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedReference { .. }));
    }

    #[test]
    fn forward_reference_when_definition_exists_but_not_materialized() {
        let mut fx = Fixture::new();
        fx.definitions.insert("Customer".into(), "customer".into());
        let resolved = FieldTypeResolver::resolve("order", &relation("customer", FieldType::ReferenceOne, "Customer"), &fx.ctx())
            .unwrap();
        let rel = resolved.relation.unwrap();
        assert_eq!(rel.resolution, Resolution::Forward("Customer".into()));
        let col = resolved.column.unwrap();
        assert_eq!(col.name, "customer_id");
        assert_eq!(col.references.unwrap().table, "customer");

        fx.materialize("Customer", "customer");
        let resolved = FieldTypeResolver::resolve("order", &relation("customer", FieldType::ReferenceOne, "Customer"), &fx.ctx())
            .unwrap();
        assert!(matches!(
            resolved.relation.unwrap().resolution,
            Resolution::Resolved(ResolvedTarget::Entity(ref d)) if d.name == "Customer"
        ));
    }

    #[test]
    fn unknown_target_is_unresolved() {
        let fx = Fixture::new();
        let err = FieldTypeResolver::resolve("order", &relation("customer", FieldType::ReferenceOne, "Customer"), &fx.ctx())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedReference { ref target, .. } if target == "Customer"));
    }

    #[test]
    fn many_relation_yields_join_table_only() {
        let mut fx = Fixture::new();
        fx.materialize("Tag", "tag");
        let resolved = FieldTypeResolver::resolve("post", &relation("tags", FieldType::ReferenceMany, "Tag"), &fx.ctx())
            .unwrap();
        assert!(resolved.column.is_none());
        let join = resolved.relation.unwrap().join_table.unwrap();
        assert_eq!(join.name, "post_tags");
        assert_eq!(join.owner_column, "post_id");
        assert_eq!(join.target_column, "tag_id");

        fx.materialize("Person", "person");
        let resolved = FieldTypeResolver::resolve("person", &relation("friends", FieldType::ReferenceMany, "Person"), &fx.ctx())
            .unwrap();
        let join = resolved.relation.unwrap().join_table.unwrap();
        assert_eq!(join.owner_column, "from_person_id");
        assert_eq!(join.target_column, "to_person_id");
    }

    #[test]
    fn one_to_one_is_unique() {
        let mut fx = Fixture::new();
        fx.materialize("Profile", "profile");
        let col = FieldTypeResolver::resolve("account", &relation("profile", FieldType::ReferenceOneToOne, "Profile"), &fx.ctx())
            .unwrap()
            .column
            .unwrap();
        assert!(col.unique);
    }
}
