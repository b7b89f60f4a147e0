//! Transform executor.
//!
//! Runs each field's transform chain over every aggregate record of a level.

use std::sync::Arc;

use crate::error::EngineError;
use crate::record::Record;
use crate::runtime::context::{DispatchContext, GranularityChain};
use crate::runtime::dispatcher::CancelToken;
use crate::runtime::navigator::NavigationError;
use crate::schema::SchemaRegistry;
use crate::transform_registry::{TransformArgs, TransformFn, TransformRegistry};

struct ResolvedStep {
    name: String,
    option: String,
    handle: Arc<dyn TransformFn>,
}

struct FieldPlan {
    field: String,
    steps: Vec<ResolvedStep>,
}

/// Resolved chains of one level.
pub struct LevelPlan {
    level: String,
    position: usize,
    fields: Vec<FieldPlan>,
}

impl LevelPlan {
    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// Resolved chains of every level, in execution order.
pub struct TransformExecutor {
    plans: Vec<LevelPlan>,
}

impl TransformExecutor {
    /// Resolve every chain once, up front.
    ///
    /// # Arguments
    ///
    /// * `chain` - Granularity chain
    /// * `order` - Levels in execution order
    /// * `schema` - Output schema of every level
    /// * `registry` - Registry to resolve transforms from
    pub fn new(
        chain: &GranularityChain,
        order: &[String],
        schema: &SchemaRegistry,
        registry: &TransformRegistry,
    ) -> Result<Self, EngineError> {
        let mut plans = Vec::with_capacity(order.len());
        for level in order {
            let position = chain
                .position(level)
                .ok_or_else(|| NavigationError::UnknownLevel(level.clone()))?;

            let mut fields = Vec::new();
            for def in schema.level(level)?.fields() {
                let mut steps = Vec::with_capacity(def.chain.len());
                for step in &def.chain {
                    let handle = registry.resolve_transform(&step.name).map_err(|source| {
                        EngineError::Transform {
                            level: level.clone(),
                            key: String::new(),
                            field: def.id.clone(),
                            transform: step.name.clone(),
                            source,
                        }
                    })?;
                    steps.push(ResolvedStep {
                        name: step.name.clone(),
                        option: step.option.clone(),
                        handle,
                    });
                }
                fields.push(FieldPlan {
                    field: def.id.clone(),
                    steps,
                });
            }

            plans.push(LevelPlan {
                level: level.clone(),
                position,
                fields,
            });
        }
        Ok(Self { plans })
    }

    pub fn plans(&self) -> &[LevelPlan] {
        &self.plans
    }

    /// Run every level in execution order.
    pub fn run(&self, ctx: &mut DispatchContext, cancel: &CancelToken) -> Result<(), EngineError> {
        for plan in &self.plans {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.run_level(plan, ctx)?;
        }
        Ok(())
    }

    /// Populate every record of one level.
    ///
    /// Records are visited in creation order and fields in column order. A
    /// field left unset by its chain is set to `""`.
    pub fn run_level(
        &self,
        plan: &LevelPlan,
        ctx: &mut DispatchContext,
    ) -> Result<(), EngineError> {
        let count = ctx.level_store_at(plan.position).map(|s| s.len()).unwrap_or(0);
        tracing::debug!("Transforming {} records at level '{}'", count, plan.level);

        for idx in 0..count {
            let key = match ctx.level_store_at(plan.position).and_then(|s| s.key_at(idx)) {
                Some(key) => key.to_string(),
                None => continue,
            };
            let Some(mut record) = ctx.detach(plan.position, idx) else {
                continue;
            };

            let result = run_fields(plan, ctx, &key, &mut record);
            ctx.restore(plan.position, idx, record);
            result?;
        }
        Ok(())
    }
}

fn run_fields(
    plan: &LevelPlan,
    ctx: &DispatchContext,
    key: &str,
    record: &mut Record,
) -> Result<(), EngineError> {
    for field in &plan.fields {
        for step in &field.steps {
            let args = TransformArgs {
                option: &step.option,
                level: &plan.level,
                key,
                field: &field.field,
            };
            step.handle
                .apply(ctx, &args, record)
                .map_err(|source| EngineError::Transform {
                    level: plan.level.clone(),
                    key: key.to_string(),
                    field: field.field.clone(),
                    transform: step.name.clone(),
                    source,
                })?;
        }
        if !record.is_set(&field.field) {
            record.set(field.field.as_str(), "");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChainPolicy;
    use crate::transform_registry::TransformError;

    fn setup(levels: &str) -> DispatchContext {
        let chain = Arc::new(GranularityChain::parse(levels).unwrap());
        let mut ctx = DispatchContext::new(chain);
        for key in ["A", "B"] {
            let idx = ctx.push_raw(Record::new());
            ctx.level_store_at_mut(0)
                .unwrap()
                .insert_new(key.to_string(), Record::with_in_idx(idx));
        }
        ctx
    }

    fn executor(
        schema: &SchemaRegistry,
        registry: &TransformRegistry,
        ctx: &DispatchContext,
    ) -> TransformExecutor {
        let order = ctx.chain().levels().to_vec();
        TransformExecutor::new(ctx.chain(), &order, schema, registry).unwrap()
    }

    #[test]
    fn test_fill_option_sets_every_record() {
        let registry = TransformRegistry::with_builtins().unwrap();
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "tag", "", "P_fillOpt", "X", ChainPolicy::Reject)
            .unwrap();

        let mut ctx = setup("flow");
        executor(&schema, &registry, &ctx)
            .run(&mut ctx, &CancelToken::new())
            .unwrap();

        for (_, record) in ctx.level_store("flow").unwrap().iter() {
            assert_eq!(record.get("tag"), Some("X"));
        }
    }

    #[test]
    fn test_unset_fields_default_to_empty() {
        let mut registry = TransformRegistry::new();
        let noop = |_: &DispatchContext,
                    _: &TransformArgs<'_>,
                    _: &mut Record|
         -> Result<(), TransformError> { Ok(()) };
        registry
            .register_transform("test", "P_noop", Arc::new(noop))
            .unwrap();
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "a", "", "P_noop", "", ChainPolicy::Reject)
            .unwrap();
        schema
            .add_field("flow", "b", "", "", "", ChainPolicy::Reject)
            .unwrap();

        let mut ctx = setup("flow");
        executor(&schema, &registry, &ctx)
            .run(&mut ctx, &CancelToken::new())
            .unwrap();

        let record = ctx.record("flow", "B").unwrap();
        assert_eq!(record.get("a"), Some(""));
        assert_eq!(record.get("b"), Some(""));
        assert_eq!(record.in_idx(), Some(1));
    }

    #[test]
    fn test_chain_runs_in_order_and_sees_earlier_fields() {
        let mut registry = TransformRegistry::new();
        let append = |_: &DispatchContext,
                      args: &TransformArgs<'_>,
                      record: &mut Record|
         -> Result<(), TransformError> {
            let value = format!("{}{}", record.get_or_empty(args.field), args.option);
            record.set(args.field, value);
            Ok(())
        };
        let copy_first = |_: &DispatchContext,
                          args: &TransformArgs<'_>,
                          record: &mut Record|
         -> Result<(), TransformError> {
            let value = record.get_or_empty(args.option).to_string();
            record.set(args.field, value);
            Ok(())
        };
        registry
            .register_transform("test", "P_append", Arc::new(append))
            .unwrap();
        registry
            .register_transform("test", "P_copy", Arc::new(copy_first))
            .unwrap();

        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "first", "", "P_append;P_append", "1;2", ChainPolicy::Reject)
            .unwrap();
        schema
            .add_field("flow", "second", "", "P_copy", "first", ChainPolicy::Reject)
            .unwrap();

        let mut ctx = setup("flow");
        executor(&schema, &registry, &ctx)
            .run(&mut ctx, &CancelToken::new())
            .unwrap();
        let record = ctx.record("flow", "A").unwrap();
        assert_eq!(record.get("first"), Some("12"));
        assert_eq!(record.get("second"), Some("12"));
    }

    #[test]
    fn test_error_names_level_key_field_and_transform() {
        let mut registry = TransformRegistry::new();
        let fail = |_: &DispatchContext,
                    _: &TransformArgs<'_>,
                    _: &mut Record|
         -> Result<(), TransformError> {
            Err(TransformError::ExecutionError("boom".to_string()))
        };
        registry
            .register_transform("test", "P_fail", Arc::new(fail))
            .unwrap();
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "tag", "", "P_fail", "", ChainPolicy::Reject)
            .unwrap();

        let mut ctx = setup("flow");
        let err = executor(&schema, &registry, &ctx)
            .run(&mut ctx, &CancelToken::new())
            .unwrap_err();
        match err {
            EngineError::Transform {
                level,
                key,
                field,
                transform,
                ..
            } => {
                assert_eq!(level, "flow");
                assert_eq!(key, "A");
                assert_eq!(field, "tag");
                assert_eq!(transform, "P_fail");
            }
            other => panic!("unexpected error {}", other),
        }
        // The failing record is back in its store.
        assert_eq!(ctx.record("flow", "A").unwrap().in_idx(), Some(0));
    }

    #[test]
    fn test_unknown_transform_fails_at_plan_time() {
        let registry = TransformRegistry::new();
        let mut schema = SchemaRegistry::new();
        schema
            .add_field("flow", "tag", "", "P_missing", "", ChainPolicy::Reject)
            .unwrap();
        let ctx = setup("flow");
        let order = ctx.chain().levels().to_vec();
        assert!(TransformExecutor::new(ctx.chain(), &order, &schema, &registry).is_err());
    }
}
