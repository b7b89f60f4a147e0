//! Per-level output schema.
//!
//! Each granularity level declares its output fields in column order, and each
//! field carries the chain of transforms that computes it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::transform_registry::TransformRegistry;

/// Error type for schema definitions
#[derive(Debug, Clone)]
pub enum SchemaError {
    /// A schema file could not be read or parsed.
    File {
        path: PathBuf,
        message: String,
    },
    EmptyInputField {
        row: usize,
    },
    DuplicateInputField(String),
    EmptyFieldId {
        level: String,
    },
    DuplicateField {
        level: String,
        field: String,
    },
    EmptyChainElement {
        level: String,
        field: String,
        chain: String,
    },
    ChainMismatch {
        level: String,
        field: String,
        transforms: usize,
        options: usize,
    },
    UnknownLevel(String),
    UnknownField {
        level: String,
        field: String,
    },
    UnknownTransform {
        level: String,
        field: String,
        transform: String,
    },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::File { path, message } => write!(f, "{}: {}", path.display(), message),
            SchemaError::EmptyInputField { row } => {
                write!(f, "Input field on row {} is empty", row)
            }
            SchemaError::DuplicateInputField(field) => {
                write!(f, "Input field '{}' is listed twice", field)
            }
            SchemaError::EmptyFieldId { level } => {
                write!(f, "Level '{}' declares a field with an empty id", level)
            }
            SchemaError::DuplicateField { level, field } => {
                write!(f, "Field '{}' is declared twice for level '{}'", field, level)
            }
            SchemaError::EmptyChainElement {
                level,
                field,
                chain,
            } => write!(
                f,
                "Transform chain '{}' of field '{}' at level '{}' has an empty element",
                chain, field, level
            ),
            SchemaError::ChainMismatch {
                level,
                field,
                transforms,
                options,
            } => write!(
                f,
                "Field '{}' at level '{}' lists {} transforms but {} options",
                field, level, transforms, options
            ),
            SchemaError::UnknownLevel(level) => write!(f, "No schema for level '{}'", level),
            SchemaError::UnknownField { level, field } => {
                write!(f, "Level '{}' has no field '{}'", level, field)
            }
            SchemaError::UnknownTransform {
                level,
                field,
                transform,
            } => write!(
                f,
                "Field '{}' at level '{}' uses unknown transform '{}'",
                field, level, transform
            ),
        }
    }
}

impl std::error::Error for SchemaError {}

/// What to do when a field lists a different number of transforms and options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    /// Treat the mismatch as a configuration error.
    #[default]
    Reject,
    /// Pad missing options with `""` and drop surplus ones.
    Reconcile,
}

/// Dissector fields collected for every packet, in column order.
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    fields: IndexMap<String, String>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dissector field; `name` defaults to the field itself.
    pub fn add_field(&mut self, row: usize, field: &str, name: &str) -> Result<(), SchemaError> {
        let field = field.trim();
        if field.is_empty() {
            return Err(SchemaError::EmptyInputField { row });
        }
        if self.fields.contains_key(field) {
            return Err(SchemaError::DuplicateInputField(field.to_string()));
        }
        let name = match name.trim() {
            "" => field,
            name => name,
        };
        self.fields.insert(field.to_string(), name.to_string());
        Ok(())
    }

    /// Field ids in column order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|s| s.as_str())
    }

    pub fn name_of(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One step of a field's transform chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStep {
    pub name: String,
    pub option: String,
}

/// An output field and the chain that computes it.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub id: String,
    pub display_name: String,
    pub chain: Vec<TransformStep>,
}

/// Ordered output fields of one level.
#[derive(Debug, Clone, Default)]
pub struct LevelSchema {
    level: String,
    fields: IndexMap<String, FieldDef>,
}

impl LevelSchema {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    /// Register an output field.
    ///
    /// # Arguments
    ///
    /// * `field_id` - Column id, unique within the level
    /// * `display_name` - Human-readable name; defaults to `field_id` when empty
    /// * `transforms` - `;`-delimited transform names
    /// * `options` - `;`-delimited options, one per transform
    /// * `policy` - How to handle a transform/option count mismatch
    pub fn add_field(
        &mut self,
        field_id: &str,
        display_name: &str,
        transforms: &str,
        options: &str,
        policy: ChainPolicy,
    ) -> Result<(), SchemaError> {
        let field_id = field_id.trim();
        if field_id.is_empty() {
            return Err(SchemaError::EmptyFieldId {
                level: self.level.clone(),
            });
        }
        if self.fields.contains_key(field_id) {
            return Err(SchemaError::DuplicateField {
                level: self.level.clone(),
                field: field_id.to_string(),
            });
        }

        let chain = parse_chain(&self.level, field_id, transforms, options, policy)?;
        let display_name = match display_name.trim() {
            "" => field_id.to_string(),
            name => name.to_string(),
        };

        self.fields.insert(
            field_id.to_string(),
            FieldDef {
                id: field_id.to_string(),
                display_name,
                chain,
            },
        );
        Ok(())
    }

    /// Fields in registration order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    pub fn field_ids(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn field(&self, field_id: &str) -> Option<&FieldDef> {
        self.fields.get(field_id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Output schemas of every level, in chain order.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    levels: IndexMap<String, LevelSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema for `level`, created empty on first use.
    pub fn level_mut(&mut self, level: &str) -> &mut LevelSchema {
        self.levels
            .entry(level.to_string())
            .or_insert_with(|| LevelSchema::new(level))
    }

    pub fn insert(&mut self, schema: LevelSchema) {
        self.levels.insert(schema.level.clone(), schema);
    }

    pub fn add_field(
        &mut self,
        level: &str,
        field_id: &str,
        display_name: &str,
        transforms: &str,
        options: &str,
        policy: ChainPolicy,
    ) -> Result<(), SchemaError> {
        self.level_mut(level)
            .add_field(field_id, display_name, transforms, options, policy)
    }

    pub fn level(&self, level: &str) -> Result<&LevelSchema, SchemaError> {
        self.levels
            .get(level)
            .ok_or_else(|| SchemaError::UnknownLevel(level.to_string()))
    }

    /// Fields of `level` in output column order.
    pub fn fields(&self, level: &str) -> Result<Vec<&FieldDef>, SchemaError> {
        Ok(self.level(level)?.fields().collect())
    }

    /// Ordered `(transform, option)` steps of one field.
    pub fn transform_chain(
        &self,
        level: &str,
        field_id: &str,
    ) -> Result<&[TransformStep], SchemaError> {
        self.level(level)?
            .field(field_id)
            .map(|f| f.chain.as_slice())
            .ok_or_else(|| SchemaError::UnknownField {
                level: level.to_string(),
                field: field_id.to_string(),
            })
    }

    pub fn levels(&self) -> impl Iterator<Item = &LevelSchema> {
        self.levels.values()
    }

    pub fn has_level(&self, level: &str) -> bool {
        self.levels.contains_key(level)
    }

    /// Check that every transform of every chain is registered.
    pub fn validate(&self, registry: &TransformRegistry) -> Result<(), SchemaError> {
        for schema in self.levels.values() {
            for field in schema.fields() {
                for step in &field.chain {
                    if !registry.has_transform(&step.name) {
                        return Err(SchemaError::UnknownTransform {
                            level: schema.level.clone(),
                            field: field.id.clone(),
                            transform: step.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Human-readable listing of a level's fields and chains.
    pub fn describe(&self, level: &str) -> Result<String, SchemaError> {
        let schema = self.level(level)?;
        let mut out = String::new();
        let _ = writeln!(out, "Level: {} ({} fields)", level, schema.len());
        for field in schema.fields() {
            let _ = writeln!(out, "  {} ({})", field.id, field.display_name);
            for step in &field.chain {
                let _ = writeln!(out, "    {}({})", step.name, step.option);
            }
        }
        Ok(out)
    }
}

fn split_trimmed(s: &str) -> Vec<String> {
    s.split(';').map(|p| p.trim().to_string()).collect()
}

/// Pair a `;`-delimited transform list with its `;`-delimited options.
pub fn parse_chain(
    level: &str,
    field_id: &str,
    transforms: &str,
    options: &str,
    policy: ChainPolicy,
) -> Result<Vec<TransformStep>, SchemaError> {
    let transforms = transforms.trim();
    let options = options.trim();

    let names = if transforms.is_empty() {
        Vec::new()
    } else {
        split_trimmed(transforms)
    };
    if names.iter().any(|n| n.is_empty()) {
        return Err(SchemaError::EmptyChainElement {
            level: level.to_string(),
            field: field_id.to_string(),
            chain: transforms.to_string(),
        });
    }

    let mut opts = if options.is_empty() {
        vec![String::new(); names.len()]
    } else {
        split_trimmed(options)
    };

    if opts.len() != names.len() {
        match policy {
            ChainPolicy::Reject => {
                return Err(SchemaError::ChainMismatch {
                    level: level.to_string(),
                    field: field_id.to_string(),
                    transforms: names.len(),
                    options: opts.len(),
                });
            }
            ChainPolicy::Reconcile => {
                tracing::warn!(
                    "Field '{}' at level '{}' lists {} transforms but {} options; reconciling",
                    field_id,
                    level,
                    names.len(),
                    opts.len()
                );
                opts.resize(names.len(), String::new());
            }
        }
    }

    Ok(names
        .into_iter()
        .zip(opts)
        .map(|(name, option)| TransformStep { name, option })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(chain: &[TransformStep]) -> Vec<(&str, &str)> {
        chain
            .iter()
            .map(|s| (s.name.as_str(), s.option.as_str()))
            .collect()
    }

    #[test]
    fn test_chain_is_trimmed_and_paired() {
        let chain = parse_chain(
            "flow",
            "tag",
            " P_cpy ; P_fillOpt ",
            " ip.src ;X",
            ChainPolicy::Reject,
        )
        .unwrap();
        assert_eq!(names(&chain), vec![("P_cpy", "ip.src"), ("P_fillOpt", "X")]);
    }

    #[test]
    fn test_empty_options_mean_all_empty() {
        let chain = parse_chain("flow", "tag", "P_cpy;P_fill1", "", ChainPolicy::Reject).unwrap();
        assert_eq!(names(&chain), vec![("P_cpy", ""), ("P_fill1", "")]);
    }

    #[test]
    fn test_empty_options_inside_list_are_allowed() {
        let chain = parse_chain("flow", "tag", "P_cpy;P_fill1", ";0", ChainPolicy::Reject).unwrap();
        assert_eq!(names(&chain), vec![("P_cpy", ""), ("P_fill1", "0")]);
    }

    #[test]
    fn test_empty_chain_element_is_rejected() {
        let result = parse_chain("flow", "tag", "P_cpy;;P_fill1", "", ChainPolicy::Reconcile);
        assert!(matches!(result, Err(SchemaError::EmptyChainElement { .. })));
    }

    #[test]
    fn test_mismatch_policy() {
        let rejected = parse_chain("flow", "tag", "P_cpy;P_fill1", "a", ChainPolicy::Reject);
        assert!(matches!(
            rejected,
            Err(SchemaError::ChainMismatch {
                transforms: 2,
                options: 1,
                ..
            })
        ));

        let padded =
            parse_chain("flow", "tag", "P_cpy;P_fill1", "a", ChainPolicy::Reconcile).unwrap();
        assert_eq!(names(&padded), vec![("P_cpy", "a"), ("P_fill1", "")]);

        let dropped = parse_chain("flow", "tag", "P_cpy", "a;b;c", ChainPolicy::Reconcile).unwrap();
        assert_eq!(names(&dropped), vec![("P_cpy", "a")]);
    }

    #[test]
    fn test_field_without_chain() {
        let chain = parse_chain("flow", "tag", "", "", ChainPolicy::Reject).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_duplicate_field_is_fatal() {
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "tag", "", "P_fillOpt", "X", ChainPolicy::Reject)
            .unwrap();
        let result = schema.add_field("flow", "tag", "Tag", "P_fillOpt", "Y", ChainPolicy::Reject);
        assert!(matches!(result, Err(SchemaError::DuplicateField { .. })));

        let result = schema.add_field("flow", "  ", "", "", "", ChainPolicy::Reject);
        assert!(matches!(result, Err(SchemaError::EmptyFieldId { .. })));
    }

    #[test]
    fn test_fields_keep_registration_order() {
        let mut schema = SchemaRegistry::new();
        for id in ["z", "a", "m"] {
            schema
                .add_field("pkt", id, "", "P_cpy", "", ChainPolicy::Reject)
                .unwrap();
        }
        let ids: Vec<&str> = schema
            .fields("pkt")
            .unwrap()
            .iter()
            .map(|f| f.id.as_str())
            .collect();
        assert_eq!(ids, vec!["z", "a", "m"]);
        assert_eq!(schema.level("pkt").unwrap().field("a").unwrap().display_name, "a");
    }

    #[test]
    fn test_validate_reports_unknown_transform() {
        let registry = TransformRegistry::with_builtins().unwrap();
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "tag", "", "P_fillOpt;P_nope", "X;", ChainPolicy::Reject)
            .unwrap();

        match schema.validate(&registry) {
            Err(SchemaError::UnknownTransform { transform, .. }) => assert_eq!(transform, "P_nope"),
            other => panic!("expected UnknownTransform, got {:?}", other),
        }
    }

    #[test]
    fn test_input_schema() {
        let mut input = InputSchema::new();
        input.add_field(1, " ip.src ", "").unwrap();
        input.add_field(2, "frame.len", "Length").unwrap();
        assert_eq!(input.fields().collect::<Vec<_>>(), vec!["ip.src", "frame.len"]);
        assert_eq!(input.name_of("ip.src"), Some("ip.src"));
        assert!(matches!(
            input.add_field(3, "ip.src", ""),
            Err(SchemaError::DuplicateInputField(_))
        ));
        assert!(matches!(
            input.add_field(4, "", "x"),
            Err(SchemaError::EmptyInputField { row: 4 })
        ));
    }

    #[test]
    fn test_describe_lists_chain() {
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "tag", "Tag", "P_fillOpt", "X", ChainPolicy::Reject)
            .unwrap();
        let text = schema.describe("flow").unwrap();
        assert!(text.contains("tag (Tag)"));
        assert!(text.contains("P_fillOpt(X)"));
    }
}
