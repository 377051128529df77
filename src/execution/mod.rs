//! Query execution engine.
//!
//! Executes logical plans against a StorageBackend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::model::*;
use crate::cypher::ast::{Expr, Literal, BinaryOp, UnaryOp, StringOp, SchemaCommand};
use crate::storage::{StorageBackend, ExpandDepth, ConstraintType};
use crate::planner::{LogicalPlan, CreateNodeSpec, SetOp};
use crate::{Error, Result};

/// A cooperative cancel flag, checked at every executor operator boundary.
/// Cheap to clone — shares one `Arc<AtomicBool>` with every clone, so any
/// holder calling [`CancellationToken::cancel`] is observed by the
/// in-flight execution on its next operator step.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call execution knobs: a deadline and/or a cancellation token.
/// Cancellation and timeout are distinct error conditions, both checked
/// cooperatively rather than preemptively (no operator is interrupted
/// mid-step).
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl ExecutionOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Some(Instant::now() + timeout), cancel: None }
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self { deadline: None, cancel: Some(token) }
    }

    fn check(&self) -> Result<()> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::QueryTimeout);
            }
        }
        Ok(())
    }
}

/// Query execution result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
    pub stats: ExecutionStats,
}

/// A single row in the result set. Preserves column order.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub values: Vec<(String, Value)>,
}

impl ResultRow {
    /// Get a typed value from the row by column name.
    pub fn get<T: FromValue>(&self, key: &str) -> Result<T> {
        let val = self.values.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::NotFound(format!("Column '{key}'")))?;
        T::from_value(val)
    }

    /// Get a raw Value reference by column name.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Execution statistics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
    pub properties_set: u64,
    pub labels_added: u64,
    pub labels_removed: u64,
    pub execution_time_ms: u64,
}

/// Convert from Value to concrete types.
pub trait FromValue: Sized {
    fn from_value(val: &Value) -> Result<Self>;
}

impl FromValue for Node {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Node(n) => Ok(*n.clone()),
            _ => Err(Error::TypeError {
                expected: "Node".into(),
                got: val.type_name().into(),
            }),
        }
    }
}

impl FromValue for String {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::String(s) => Ok(s.clone()),
            _ => Err(Error::TypeError {
                expected: "String".into(),
                got: val.type_name().into(),
            }),
        }
    }
}

impl FromValue for i64 {
    fn from_value(val: &Value) -> Result<Self> {
        val.as_int().ok_or_else(|| Error::TypeError {
            expected: "Integer".into(),
            got: val.type_name().into(),
        })
    }
}

impl FromValue for f64 {
    fn from_value(val: &Value) -> Result<Self> {
        val.as_float().ok_or_else(|| Error::TypeError {
            expected: "Float".into(),
            got: val.type_name().into(),
        })
    }
}

impl FromValue for bool {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Bool(b) => Ok(*b),
            _ => Err(Error::TypeError { expected: "Bool".into(), got: val.type_name().into() }),
        }
    }
}

impl FromValue for Value {
    fn from_value(val: &Value) -> Result<Self> {
        Ok(val.clone())
    }
}

impl FromValue for Relationship {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Relationship(r) => Ok(*r.clone()),
            _ => Err(Error::TypeError { expected: "Relationship".into(), got: val.type_name().into() }),
        }
    }
}

impl FromValue for Path {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Path(p) => Ok(*p.clone()),
            _ => Err(Error::TypeError { expected: "Path".into(), got: val.type_name().into() }),
        }
    }
}

impl FromValue for Vec<Value> {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::List(l) => Ok(l.clone()),
            _ => Err(Error::TypeError { expected: "List".into(), got: val.type_name().into() }),
        }
    }
}

impl FromValue for HashMap<String, Value> {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Map(m) => Ok(m.clone()),
            _ => Err(Error::TypeError { expected: "Map".into(), got: val.type_name().into() }),
        }
    }
}

/// Execute a logical plan against a storage backend.
///
/// Takes `&mut B::Tx` because write operations (CREATE, SET, DELETE) need
/// mutable transaction access. Read-only plans simply don't mutate it.
pub async fn execute<B: StorageBackend>(
    backend: &B,
    tx: &mut B::Tx,
    plan: LogicalPlan,
    params: PropertyMap,
) -> Result<QueryResult> {
    execute_with_options(backend, tx, plan, params, ExecutionOptions::none()).await
}

/// Like [`execute`], but checked for cancellation/timeout at every
/// executor operator boundary.
pub async fn execute_with_options<B: StorageBackend>(
    backend: &B,
    tx: &mut B::Tx,
    plan: LogicalPlan,
    params: PropertyMap,
    options: ExecutionOptions,
) -> Result<QueryResult> {
    let mut ctx = ExecContext::with_params(params);
    ctx.options = options;
    let rows = execute_plan(backend, tx, &plan, &mut ctx).await?;

    let columns = ctx.columns.clone();
    let result_rows: Vec<ResultRow> = rows.into_iter().map(|row| {
        let values: Vec<(String, Value)> = columns.iter()
            .map(|col| (col.clone(), row.get(col).cloned().unwrap_or(Value::Null)))
            .collect();
        ResultRow { values }
    }).collect();

    Ok(QueryResult {
        columns,
        rows: result_rows,
        stats: ctx.stats,
    })
}

// ============================================================================
// Execution context
// ============================================================================

type Row = HashMap<String, Value>;

struct ExecContext {
    columns: Vec<String>,
    stats: ExecutionStats,
    params: PropertyMap,
    /// Stack of correlated outer rows for `Apply`/`CallSubquery`/`Foreach`.
    /// `Argument` resolves to the top of this stack (or an empty row when
    /// the stack is empty, i.e. the top-level pipeline seed).
    seed_stack: Vec<Row>,
    options: ExecutionOptions,
}

impl ExecContext {
    fn with_params(params: PropertyMap) -> Self {
        Self {
            columns: Vec::new(),
            stats: ExecutionStats::default(),
            params,
            seed_stack: Vec::new(),
            options: ExecutionOptions::none(),
        }
    }
}

// ============================================================================
// Plan executor (recursive walk over LogicalPlan tree)
// ============================================================================

fn execute_plan<'a, B: StorageBackend>(
    backend: &'a B,
    tx: &'a mut B::Tx,
    plan: &'a LogicalPlan,
    ctx: &'a mut ExecContext,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Row>>> + Send + 'a>> {
    Box::pin(async move {
    // Cooperative cancellation/timeout check, re-run on every recursive
    // descent into an operator so a long-running plan notices promptly.
    ctx.options.check()?;
    match plan {
        LogicalPlan::Argument => {
            // Seeded by an enclosing Apply/CallSubquery/Foreach, or an
            // empty row at the top of a fresh pipeline.
            let seed = ctx.seed_stack.last().cloned().unwrap_or_default();
            Ok(vec![seed])
        }

        LogicalPlan::NodeScan { input, label, alias } => {
            let input_rows = execute_plan(backend, tx, input, ctx).await?;
            let nodes = backend.nodes_by_label(tx, label).await?;
            let mut rows = Vec::new();
            for input_row in &input_rows {
                for n in &nodes {
                    let mut row = input_row.clone();
                    row.insert(alias.clone(), Value::Node(Box::new(n.clone())));
                    rows.push(row);
                }
            }
            if !ctx.columns.contains(alias) {
                ctx.columns.push(alias.clone());
            }
            Ok(rows)
        }

        LogicalPlan::AllNodesScan { input, alias } => {
            let input_rows = execute_plan(backend, tx, input, ctx).await?;
            let nodes = backend.all_nodes(tx).await?;
            let mut rows = Vec::new();
            for input_row in &input_rows {
                for n in &nodes {
                    let mut row = input_row.clone();
                    row.insert(alias.clone(), Value::Node(Box::new(n.clone())));
                    rows.push(row);
                }
            }
            if !ctx.columns.contains(alias) {
                ctx.columns.push(alias.clone());
            }
            Ok(rows)
        }

        LogicalPlan::IndexLookup { input, label, property, alias, value } => {
            let input_rows = execute_plan(backend, tx, input, ctx).await?;
            let mut rows = Vec::new();
            for input_row in &input_rows {
                let want = eval_expr(value, input_row, &ctx.params)?;
                let nodes = backend.nodes_by_property(tx, label, property, &want).await?;
                for n in nodes {
                    let mut row = input_row.clone();
                    row.insert(alias.clone(), Value::Node(Box::new(n)));
                    rows.push(row);
                }
            }
            if !ctx.columns.contains(alias) {
                ctx.columns.push(alias.clone());
            }
            Ok(rows)
        }

        LogicalPlan::Expand { input, from, dir, rel_types, to, rel_alias, var_length } => {
            let input_rows = execute_plan(backend, tx, input, ctx).await?;
            let (min_depth, max_depth) = var_length.unwrap_or((1, Some(1)));
            let depth = ExpandDepth::Range { min: min_depth, max: max_depth.unwrap_or(100) };
            let rel_type_refs: Vec<&str> = rel_types.iter().map(|s| s.as_str()).collect();

            let mut rows = Vec::new();
            for input_row in &input_rows {
                if let Some(Value::Node(from_node)) = input_row.get(from) {
                    let paths = backend.expand(tx, from_node.id, *dir, &rel_type_refs, depth).await?;
                    for path in paths {
                        let mut row = input_row.clone();
                        row.insert(to.clone(), Value::Node(Box::new(path.end().clone())));
                        if let Some(ra) = rel_alias {
                            if var_length.is_some() {
                                let rels: Vec<Value> = path.relationships.iter()
                                    .cloned().map(|r| Value::Relationship(Box::new(r))).collect();
                                row.insert(ra.clone(), Value::List(rels));
                            } else if let Some(last) = path.relationships.last() {
                                row.insert(ra.clone(), Value::Relationship(Box::new(last.clone())));
                            }
                        }
                        rows.push(row);
                    }
                }
            }
            for col in [from, to] {
                if !ctx.columns.contains(col) {
                    ctx.columns.push(col.clone());
                }
            }
            if let Some(ra) = rel_alias {
                if !ctx.columns.contains(ra) {
                    ctx.columns.push(ra.clone());
                }
            }
            Ok(rows)
        }

        LogicalPlan::Apply { input, subplan, optional, new_vars } => {
            let outer_rows = execute_plan(backend, tx, input, ctx).await?;
            let mut result = Vec::new();
            for outer_row in outer_rows {
                ctx.seed_stack.push(outer_row.clone());
                let inner = execute_plan(backend, tx, subplan, ctx).await;
                ctx.seed_stack.pop();
                let inner_rows = inner?;

                if inner_rows.is_empty() {
                    if *optional {
                        let mut row = outer_row;
                        for v in new_vars {
                            row.entry(v.clone()).or_insert(Value::Null);
                            if !ctx.columns.contains(v) {
                                ctx.columns.push(v.clone());
                            }
                        }
                        result.push(row);
                    }
                    // non-optional: outer row dropped, no match
                } else {
                    result.extend(inner_rows);
                }
            }
            Ok(result)
        }

        LogicalPlan::Filter { input, predicate, on_optional } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let mut filtered = Vec::new();
            for row in rows {
                let val = eval_expr(predicate, &row, &ctx.params)?;
                let keep = if *on_optional {
                    !matches!(val, Value::Bool(false))
                } else {
                    val.is_truthy()
                };
                if keep {
                    filtered.push(row);
                }
            }
            Ok(filtered)
        }

        LogicalPlan::Project { input, items } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            // Reset columns to the projection list
            ctx.columns = items.iter().map(|(_, alias)| alias.clone()).collect();

            let mut projected = Vec::new();
            for row in &rows {
                let mut new_row = HashMap::new();
                for (expr, alias) in items {
                    let val = eval_expr(expr, row, &ctx.params)?;
                    new_row.insert(alias.clone(), val);
                }
                projected.push(new_row);
            }
            Ok(projected)
        }

        LogicalPlan::CreatePattern { input, nodes, rels } => {
            let input_rows = execute_plan(backend, tx, input, ctx).await?;
            let mut result = Vec::with_capacity(input_rows.len());
            for input_row in input_rows {
                let mut row = input_row;
                for spec in nodes {
                    if spec.already_bound {
                        continue;
                    }
                    let mut props = PropertyMap::new();
                    for (key, expr) in &spec.properties {
                        props.insert(key.clone(), eval_expr(expr, &row, &ctx.params)?);
                    }
                    let label_refs: Vec<&str> = spec.labels.iter().map(|s| s.as_str()).collect();
                    let node_id = backend.create_node(tx, &label_refs, props).await?;
                    ctx.stats.nodes_created += 1;
                    let node = backend.get_node(tx, node_id).await?
                        .ok_or_else(|| Error::ExecutionError("Created node not found".into()))?;
                    row.insert(spec.alias.clone(), Value::Node(Box::new(node)));
                    if !ctx.columns.contains(&spec.alias) {
                        ctx.columns.push(spec.alias.clone());
                    }
                }
                for rspec in rels {
                    let src_id = resolve_node_id(&row, &rspec.src_alias)?;
                    let dst_id = resolve_node_id(&row, &rspec.dst_alias)?;
                    let mut props = PropertyMap::new();
                    for (key, expr) in &rspec.properties {
                        props.insert(key.clone(), eval_expr(expr, &row, &ctx.params)?);
                    }
                    let rel_id = backend.create_relationship(tx, src_id, dst_id, &rspec.rel_type, props).await?;
                    ctx.stats.relationships_created += 1;
                    if let Some(alias) = &rspec.alias {
                        let rel = backend.get_relationship(tx, rel_id).await?
                            .ok_or_else(|| Error::ExecutionError("Created relationship not found".into()))?;
                        row.insert(alias.clone(), Value::Relationship(Box::new(rel)));
                        if !ctx.columns.contains(alias) {
                            ctx.columns.push(alias.clone());
                        }
                    }
                }
                result.push(row);
            }
            Ok(result)
        }

        LogicalPlan::Merge { input, spec } => {
            let input_rows = execute_plan(backend, tx, input, ctx).await?;
            let mut result = Vec::with_capacity(input_rows.len());
            for input_row in input_rows {
                let mut row = input_row;
                if spec.rels.is_empty() {
                    execute_merge_single_node(backend, tx, &mut row, &spec.nodes[0], &spec.on_create, &spec.on_match, ctx).await?;
                } else {
                    execute_merge_relationship(
                        backend, tx, &mut row,
                        &spec.nodes[0], &spec.nodes[1], &spec.rels[0],
                        &spec.on_create, &spec.on_match, ctx,
                    ).await?;
                }
                result.push(row);
            }
            Ok(result)
        }

        LogicalPlan::Limit { input, count } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let n = eval_expr(count, &HashMap::new(), &ctx.params)?.as_int().unwrap_or(0).max(0) as usize;
            Ok(rows.into_iter().take(n).collect())
        }

        LogicalPlan::Skip { input, count } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let n = eval_expr(count, &HashMap::new(), &ctx.params)?.as_int().unwrap_or(0).max(0) as usize;
            Ok(rows.into_iter().skip(n).collect())
        }

        LogicalPlan::Sort { input, keys } => {
            let mut rows = execute_plan(backend, tx, input, ctx).await?;
            let params = ctx.params.clone();
            // Sort is best-effort — errors during eval are treated as NULL
            rows.sort_by(|a, b| {
                for (expr, ascending) in keys {
                    let va = eval_expr(expr, a, &params).unwrap_or(Value::Null);
                    let vb = eval_expr(expr, b, &params).unwrap_or(Value::Null);
                    if let Some(ord) = va.neo4j_cmp(&vb) {
                        let ord = if *ascending { ord } else { ord.reverse() };
                        if ord != std::cmp::Ordering::Equal {
                            return ord;
                        }
                    }
                }
                std::cmp::Ordering::Equal
            });
            Ok(rows)
        }

        LogicalPlan::Distinct { input } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let mut seen = Vec::new();
            let mut result = Vec::new();
            for row in rows {
                // Serialize the row values for dedup — simple but works
                let key: Vec<(String, String)> = row.iter()
                    .map(|(k, v)| (k.clone(), format!("{v}")))
                    .collect();
                if !seen.contains(&key) {
                    seen.push(key);
                    result.push(row);
                }
            }
            Ok(result)
        }

        LogicalPlan::CartesianProduct { left, right } => {
            let left_rows = execute_plan(backend, tx, left, ctx).await?;
            let right_rows = execute_plan(backend, tx, right, ctx).await?;
            let mut result = Vec::new();
            for lr in &left_rows {
                for rr in &right_rows {
                    let mut row = lr.clone();
                    row.extend(rr.clone());
                    result.push(row);
                }
            }
            Ok(result)
        }

        LogicalPlan::CallProcedure { input, name, args, yields } => {
            let input_rows = execute_plan(backend, tx, input, ctx).await?;
            let mut rows = Vec::new();
            for input_row in &input_rows {
                let arg_vals: Vec<Value> = args.iter()
                    .map(|a| eval_expr(a, input_row, &ctx.params))
                    .collect::<Result<_>>()?;
                let proc_result = backend.call_procedure(tx, name, arg_vals).await?;
                for pr in proc_result.rows {
                    let mut row = input_row.clone();
                    for (col, alias) in yields {
                        row.insert(alias.clone(), pr.get(col).cloned().unwrap_or(Value::Null));
                    }
                    rows.push(row);
                }
            }
            for (_, alias) in yields {
                if !ctx.columns.contains(alias) {
                    ctx.columns.push(alias.clone());
                }
            }
            Ok(rows)
        }

        LogicalPlan::CallSubquery { input, inner, yields } => {
            let outer_rows = execute_plan(backend, tx, input, ctx).await?;
            let mut result = Vec::new();
            for outer_row in outer_rows {
                ctx.seed_stack.push(outer_row.clone());
                let inner_result = execute_plan(backend, tx, inner, ctx).await;
                ctx.seed_stack.pop();
                let inner_rows = inner_result?;
                for inner_row in inner_rows {
                    let mut row = outer_row.clone();
                    for (col, alias) in yields {
                        row.insert(alias.clone(), inner_row.get(col).cloned().unwrap_or(Value::Null));
                    }
                    result.push(row);
                }
            }
            for (_, alias) in yields {
                if !ctx.columns.contains(alias) {
                    ctx.columns.push(alias.clone());
                }
            }
            Ok(result)
        }

        LogicalPlan::Aggregate { input, group_by, aggregations } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let result = aggregate_rows(&rows, group_by, aggregations, &ctx.params)?;

            ctx.columns.clear();
            for (_, alias) in group_by {
                ctx.columns.push(alias.clone());
            }
            for (_, alias) in aggregations {
                ctx.columns.push(alias.clone());
            }
            Ok(result)
        }

        LogicalPlan::SetProperty { input, variable, key, value } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let params = ctx.params.clone();
            let mut result = Vec::with_capacity(rows.len());
            for mut row in rows {
                let op = SetOp::Property { variable: variable.clone(), key: key.clone(), value: value.clone() };
                apply_set_op(backend, tx, &mut row, &op, &params, &mut ctx.stats).await?;
                result.push(row);
            }
            Ok(result)
        }

        LogicalPlan::SetAllProperties { input, variable, value, merge } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let params = ctx.params.clone();
            let mut result = Vec::with_capacity(rows.len());
            for mut row in rows {
                let op = SetOp::AllProperties { variable: variable.clone(), value: value.clone(), merge: *merge };
                apply_set_op(backend, tx, &mut row, &op, &params, &mut ctx.stats).await?;
                result.push(row);
            }
            Ok(result)
        }

        LogicalPlan::SetLabel { input, variable, label } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let params = ctx.params.clone();
            let mut result = Vec::with_capacity(rows.len());
            for mut row in rows {
                let op = SetOp::Label { variable: variable.clone(), label: label.clone() };
                apply_set_op(backend, tx, &mut row, &op, &params, &mut ctx.stats).await?;
                result.push(row);
            }
            Ok(result)
        }

        LogicalPlan::DeleteNode { input, variable, detach } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            for row in &rows {
                match row.get(variable) {
                    Some(Value::Node(n)) => {
                        let deleted = if *detach {
                            backend.detach_delete_node(tx, n.id).await?
                        } else {
                            backend.delete_node(tx, n.id).await?
                        };
                        if deleted {
                            ctx.stats.nodes_deleted += 1;
                        }
                    }
                    Some(Value::Relationship(r)) => {
                        if backend.delete_relationship(tx, r.id).await? {
                            ctx.stats.relationships_deleted += 1;
                        }
                    }
                    _ => {}
                }
            }
            Ok(rows)
        }

        LogicalPlan::DeleteRel { input, variable } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            for row in &rows {
                if let Some(Value::Relationship(r)) = row.get(variable) {
                    if backend.delete_relationship(tx, r.id).await? {
                        ctx.stats.relationships_deleted += 1;
                    }
                }
            }
            Ok(rows)
        }

        LogicalPlan::Unwind { input, expr, alias } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let mut result = Vec::new();
            for row in &rows {
                let val = eval_expr(expr, row, &ctx.params)?;
                let items = match val {
                    Value::List(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                for item in items {
                    let mut new_row = row.clone();
                    new_row.insert(alias.clone(), item);
                    result.push(new_row);
                }
            }
            if !ctx.columns.contains(alias) {
                ctx.columns.push(alias.clone());
            }
            Ok(result)
        }

        LogicalPlan::RemoveProperty { input, variable, key } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let mut result = Vec::with_capacity(rows.len());
            for mut row in rows {
                match row.get(variable) {
                    Some(Value::Node(n)) => {
                        let id = n.id;
                        backend.remove_node_property(tx, id, key).await?;
                        if let Some(Value::Node(n)) = row.get_mut(variable) {
                            n.properties.remove(key);
                        }
                    }
                    Some(Value::Relationship(r)) => {
                        let id = r.id;
                        backend.remove_relationship_property(tx, id, key).await?;
                        if let Some(Value::Relationship(r)) = row.get_mut(variable) {
                            r.properties.remove(key);
                        }
                    }
                    _ => {}
                }
                result.push(row);
            }
            Ok(result)
        }

        LogicalPlan::RemoveLabel { input, variable, label } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            let mut result = Vec::with_capacity(rows.len());
            for mut row in rows {
                if let Some(Value::Node(n)) = row.get(variable) {
                    let id = n.id;
                    backend.remove_label(tx, id, label).await?;
                    ctx.stats.labels_removed += 1;
                    if let Some(Value::Node(n)) = row.get_mut(variable) {
                        n.labels.retain(|l| l != label);
                    }
                }
                result.push(row);
            }
            Ok(result)
        }

        LogicalPlan::Foreach { input, variable, list_expr, body } => {
            let rows = execute_plan(backend, tx, input, ctx).await?;
            for row in &rows {
                let val = eval_expr(list_expr, row, &ctx.params)?;
                let items = match val {
                    Value::List(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                for item in items {
                    let mut seed = row.clone();
                    seed.insert(variable.clone(), item);
                    ctx.seed_stack.push(seed);
                    for stmt_plan in body {
                        let outcome = execute_plan(backend, tx, stmt_plan, ctx).await;
                        if let Err(e) = outcome {
                            ctx.seed_stack.pop();
                            return Err(e);
                        }
                    }
                    ctx.seed_stack.pop();
                }
            }
            Ok(rows)
        }

        LogicalPlan::Union { left, right, all } => {
            let left_rows = execute_plan(backend, tx, left, ctx).await?;
            let columns = ctx.columns.clone();
            let right_rows = execute_plan(backend, tx, right, ctx).await?;
            ctx.columns = columns;

            let mut combined = left_rows;
            combined.extend(right_rows);

            if *all {
                Ok(combined)
            } else {
                let mut seen = Vec::new();
                let mut result = Vec::new();
                for row in combined {
                    let key: Vec<(String, Value)> = ctx.columns.iter()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect();
                    if !seen.contains(&key) {
                        seen.push(key);
                        result.push(row);
                    }
                }
                Ok(result)
            }
        }

        LogicalPlan::SchemaOp(cmd) => {
            match cmd {
                SchemaCommand::CreateIndex { label, property, index_type } => {
                    let it = match index_type.as_deref() {
                        Some(s) if s.eq_ignore_ascii_case("fulltext") => crate::index::IndexType::FullText,
                        Some(s) if s.eq_ignore_ascii_case("unique") => crate::index::IndexType::Unique,
                        Some(s) if s.eq_ignore_ascii_case("vector") => crate::index::IndexType::Vector,
                        _ => crate::index::IndexType::BTree,
                    };
                    backend.create_index(label, property, it).await?;
                }
                SchemaCommand::DropIndex { label, property } => {
                    backend.drop_index(label, property).await?;
                }
                SchemaCommand::CreateConstraint { label, property, constraint_type } => {
                    let ct = if constraint_type.eq_ignore_ascii_case("exists") {
                        ConstraintType::Exists
                    } else {
                        ConstraintType::Unique
                    };
                    backend.create_constraint(label, property, ct).await?;
                }
                SchemaCommand::DropConstraint { label, property } => {
                    backend.drop_constraint(label, property).await?;
                }
            }
            Ok(vec![HashMap::new()])
        }
    }
    }) // close Box::pin(async move { ... })
}

// ============================================================================
// CREATE / MERGE helpers
// ============================================================================

/// Resolve a pattern alias bound in `row` to a node id.
fn resolve_node_id(row: &Row, alias: &str) -> Result<NodeId> {
    match row.get(alias) {
        Some(Value::Node(n)) => Ok(n.id),
        _ => Err(Error::ExecutionError(format!("Cannot resolve node variable '{alias}'"))),
    }
}

/// Whether a candidate node satisfies a MERGE pattern's label+property constraints.
fn node_matches(node: &Node, spec: &CreateNodeSpec, row: &Row, params: &PropertyMap) -> Result<bool> {
    for label in &spec.labels {
        if !node.has_label(label) {
            return Ok(false);
        }
    }
    for (key, expr) in &spec.properties {
        let want = eval_expr(expr, row, params)?;
        if node.get(key) != Some(&want) {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn apply_set_op<B: StorageBackend>(
    backend: &B,
    tx: &mut B::Tx,
    row: &mut Row,
    op: &SetOp,
    params: &PropertyMap,
    stats: &mut ExecutionStats,
) -> Result<()> {
    match op {
        SetOp::Property { variable, key, value } => {
            let val = eval_expr(value, row, params)?;
            match row.get(variable) {
                Some(Value::Node(n)) => {
                    let id = n.id;
                    backend.set_node_property(tx, id, key, val.clone()).await?;
                    if let Some(Value::Node(n)) = row.get_mut(variable) {
                        n.properties.insert(key.clone(), val);
                    }
                    stats.properties_set += 1;
                }
                Some(Value::Relationship(r)) => {
                    let id = r.id;
                    backend.set_relationship_property(tx, id, key, val.clone()).await?;
                    if let Some(Value::Relationship(r)) = row.get_mut(variable) {
                        r.properties.insert(key.clone(), val);
                    }
                    stats.properties_set += 1;
                }
                _ => {}
            }
        }
        SetOp::AllProperties { variable, value, merge } => {
            let val = eval_expr(value, row, params)?;
            if let Value::Map(map) = val {
                match row.get(variable) {
                    Some(Value::Node(n)) => {
                        let id = n.id;
                        if !*merge {
                            let existing: Vec<String> = n.properties.keys().cloned().collect();
                            for k in existing {
                                if !map.contains_key(&k) {
                                    backend.remove_node_property(tx, id, &k).await?;
                                }
                            }
                        }
                        for (k, v) in &map {
                            backend.set_node_property(tx, id, k, v.clone()).await?;
                        }
                        if let Some(Value::Node(n)) = row.get_mut(variable) {
                            if !*merge {
                                n.properties.clear();
                            }
                            n.properties.extend(map);
                        }
                        stats.properties_set += 1;
                    }
                    Some(Value::Relationship(r)) => {
                        let id = r.id;
                        if !*merge {
                            let existing: Vec<String> = r.properties.keys().cloned().collect();
                            for k in existing {
                                if !map.contains_key(&k) {
                                    backend.remove_relationship_property(tx, id, &k).await?;
                                }
                            }
                        }
                        for (k, v) in &map {
                            backend.set_relationship_property(tx, id, k, v.clone()).await?;
                        }
                        if let Some(Value::Relationship(r)) = row.get_mut(variable) {
                            if !*merge {
                                r.properties.clear();
                            }
                            r.properties.extend(map);
                        }
                        stats.properties_set += 1;
                    }
                    _ => {}
                }
            }
        }
        SetOp::Label { variable, label } => {
            if let Some(Value::Node(n)) = row.get(variable) {
                let id = n.id;
                backend.add_label(tx, id, label).await?;
                if let Some(Value::Node(n)) = row.get_mut(variable) {
                    if !n.labels.iter().any(|l| l == label) {
                        n.labels.push(label.clone());
                    }
                }
                stats.labels_added += 1;
            }
        }
    }
    Ok(())
}

async fn apply_set_ops<B: StorageBackend>(
    backend: &B,
    tx: &mut B::Tx,
    row: &mut Row,
    ops: &[SetOp],
    params: &PropertyMap,
    stats: &mut ExecutionStats,
) -> Result<()> {
    for op in ops {
        apply_set_op(backend, tx, row, op, params, stats).await?;
    }
    Ok(())
}

/// `MERGE (n:Label {props})` — single node, no relationship hop.
async fn execute_merge_single_node<B: StorageBackend>(
    backend: &B,
    tx: &mut B::Tx,
    row: &mut Row,
    spec: &CreateNodeSpec,
    on_create: &[SetOp],
    on_match: &[SetOp],
    ctx: &mut ExecContext,
) -> Result<()> {
    let candidates = if let Some(label) = spec.labels.first() {
        backend.nodes_by_label(tx, label).await?
    } else {
        backend.all_nodes(tx).await?
    };

    let mut found = None;
    for candidate in candidates {
        if node_matches(&candidate, spec, row, &ctx.params)? {
            found = Some(candidate);
            break;
        }
    }

    if let Some(node) = found {
        row.insert(spec.alias.clone(), Value::Node(Box::new(node)));
        if !ctx.columns.contains(&spec.alias) {
            ctx.columns.push(spec.alias.clone());
        }
        apply_set_ops(backend, tx, row, on_match, &ctx.params.clone(), &mut ctx.stats).await?;
    } else {
        let mut props = PropertyMap::new();
        for (key, expr) in &spec.properties {
            props.insert(key.clone(), eval_expr(expr, row, &ctx.params)?);
        }
        let label_refs: Vec<&str> = spec.labels.iter().map(|s| s.as_str()).collect();
        let node_id = backend.create_node(tx, &label_refs, props).await?;
        ctx.stats.nodes_created += 1;
        let node = backend.get_node(tx, node_id).await?
            .ok_or_else(|| Error::ExecutionError("Created node not found".into()))?;
        row.insert(spec.alias.clone(), Value::Node(Box::new(node)));
        if !ctx.columns.contains(&spec.alias) {
            ctx.columns.push(spec.alias.clone());
        }
        apply_set_ops(backend, tx, row, on_create, &ctx.params.clone(), &mut ctx.stats).await?;
    }
    Ok(())
}

/// `MERGE (a)-[r:TYPE]->(b)` — single relationship hop between two node patterns.
async fn execute_merge_relationship<B: StorageBackend>(
    backend: &B,
    tx: &mut B::Tx,
    row: &mut Row,
    src_spec: &CreateNodeSpec,
    dst_spec: &CreateNodeSpec,
    rel_spec: &crate::planner::CreateRelSpec,
    on_create: &[SetOp],
    on_match: &[SetOp],
    ctx: &mut ExecContext,
) -> Result<()> {
    let src_id = if src_spec.already_bound {
        Some(resolve_node_id(row, &src_spec.alias)?)
    } else {
        let candidates = if let Some(label) = src_spec.labels.first() {
            backend.nodes_by_label(tx, label).await?
        } else {
            backend.all_nodes(tx).await?
        };
        let mut found = None;
        for candidate in candidates {
            if node_matches(&candidate, src_spec, row, &ctx.params)? {
                found = Some(candidate.id);
                break;
            }
        }
        found
    };

    // Search for an existing relationship+dst pair hanging off a resolved src.
    if let Some(src_id) = src_id {
        let rels = backend.get_relationships(tx, src_id, Direction::Outgoing, Some(&rel_spec.rel_type)).await?;
        for rel in rels {
            if let Some(dst) = backend.get_node(tx, rel.dst).await? {
                if node_matches(&dst, dst_spec, row, &ctx.params)? {
                    let src_node = backend.get_node(tx, src_id).await?
                        .ok_or_else(|| Error::ExecutionError("MERGE source node not found".into()))?;
                    row.insert(src_spec.alias.clone(), Value::Node(Box::new(src_node)));
                    row.insert(dst_spec.alias.clone(), Value::Node(Box::new(dst.clone())));
                    if let Some(alias) = &rel_spec.alias {
                        row.insert(alias.clone(), Value::Relationship(Box::new(rel.clone())));
                    }
                    for col in [&src_spec.alias, &dst_spec.alias] {
                        if !ctx.columns.contains(col) {
                            ctx.columns.push(col.clone());
                        }
                    }
                    apply_set_ops(backend, tx, row, on_match, &ctx.params.clone(), &mut ctx.stats).await?;
                    return Ok(());
                }
            }
        }
    }

    // No existing match — create whichever side is missing, then the relationship.
    let src_id = match src_id {
        Some(id) => {
            let node = backend.get_node(tx, id).await?
                .ok_or_else(|| Error::ExecutionError("MERGE source node not found".into()))?;
            row.insert(src_spec.alias.clone(), Value::Node(Box::new(node)));
            id
        }
        None => {
            let mut props = PropertyMap::new();
            for (key, expr) in &src_spec.properties {
                props.insert(key.clone(), eval_expr(expr, row, &ctx.params)?);
            }
            let label_refs: Vec<&str> = src_spec.labels.iter().map(|s| s.as_str()).collect();
            let id = backend.create_node(tx, &label_refs, props).await?;
            ctx.stats.nodes_created += 1;
            let node = backend.get_node(tx, id).await?
                .ok_or_else(|| Error::ExecutionError("Created node not found".into()))?;
            row.insert(src_spec.alias.clone(), Value::Node(Box::new(node)));
            id
        }
    };

    let dst_id = if dst_spec.already_bound {
        resolve_node_id(row, &dst_spec.alias)?
    } else {
        let mut props = PropertyMap::new();
        for (key, expr) in &dst_spec.properties {
            props.insert(key.clone(), eval_expr(expr, row, &ctx.params)?);
        }
        let label_refs: Vec<&str> = dst_spec.labels.iter().map(|s| s.as_str()).collect();
        let id = backend.create_node(tx, &label_refs, props).await?;
        ctx.stats.nodes_created += 1;
        let node = backend.get_node(tx, id).await?
            .ok_or_else(|| Error::ExecutionError("Created node not found".into()))?;
        row.insert(dst_spec.alias.clone(), Value::Node(Box::new(node)));
        id
    };

    for col in [&src_spec.alias, &dst_spec.alias] {
        if !ctx.columns.contains(col) {
            ctx.columns.push(col.clone());
        }
    }

    let mut rel_props = PropertyMap::new();
    for (key, expr) in &rel_spec.properties {
        rel_props.insert(key.clone(), eval_expr(expr, row, &ctx.params)?);
    }
    let rel_id = backend.create_relationship(tx, src_id, dst_id, &rel_spec.rel_type, rel_props).await?;
    ctx.stats.relationships_created += 1;
    if let Some(alias) = &rel_spec.alias {
        let rel = backend.get_relationship(tx, rel_id).await?
            .ok_or_else(|| Error::ExecutionError("Created relationship not found".into()))?;
        row.insert(alias.clone(), Value::Relationship(Box::new(rel)));
        if !ctx.columns.contains(alias) {
            ctx.columns.push(alias.clone());
        }
    }

    apply_set_ops(backend, tx, row, on_create, &ctx.params.clone(), &mut ctx.stats).await?;
    Ok(())
}

// ============================================================================
// Expression evaluator
// ============================================================================

/// Evaluate a Cypher expression against a row of bound variables.
fn eval_expr(expr: &Expr, row: &Row, params: &PropertyMap) -> Result<Value> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::String(s.clone()),
        }),

        Expr::Variable(name) => {
            row.get(name).cloned().ok_or_else(|| {
                Error::SemanticError(format!("Unbound variable: {name}"))
            })
        }

        Expr::Parameter(name) => {
            params.get(name).cloned().ok_or_else(|| {
                Error::SemanticError(format!("Missing parameter: ${name}"))
            })
        }

        Expr::Property { expr: inner, key } => {
            let val = eval_expr(inner, row, params)?;
            match val {
                Value::Node(n) => Ok(n.get(key).cloned().unwrap_or(Value::Null)),
                Value::Relationship(r) => Ok(r.properties.get(key).cloned().unwrap_or(Value::Null)),
                Value::Map(m) => Ok(m.get(key).cloned().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError {
                    expected: "Node, Relationship, or Map".into(),
                    got: val.type_name().into(),
                }),
            }
        }

        Expr::FunctionCall { name, args, distinct: _ } => {
            eval_function(name, args, row, params)
        }

        Expr::BinaryOp { left, op, right } => {
            let lv = eval_expr(left, row, params)?;
            // Short-circuit for AND/OR
            match op {
                BinaryOp::And => {
                    if !lv.is_truthy() { return Ok(Value::Bool(false)); }
                    let rv = eval_expr(right, row, params)?;
                    return Ok(Value::Bool(rv.is_truthy()));
                }
                BinaryOp::Or => {
                    if lv.is_truthy() { return Ok(Value::Bool(true)); }
                    let rv = eval_expr(right, row, params)?;
                    return Ok(Value::Bool(rv.is_truthy()));
                }
                _ => {}
            }
            let rv = eval_expr(right, row, params)?;
            eval_binary_op(&lv, *op, &rv)
        }

        Expr::UnaryOp { op, expr: inner } => {
            let val = eval_expr(inner, row, params)?;
            match op {
                UnaryOp::Not => match val {
                    Value::Null => Ok(Value::Null),
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    _ => Ok(Value::Bool(!val.is_truthy())),
                },
                UnaryOp::Negate => match val {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Null => Ok(Value::Null),
                    _ => Err(Error::TypeError {
                        expected: "Numeric".into(),
                        got: val.type_name().into(),
                    }),
                },
            }
        }

        Expr::List(items) => {
            let vals: Vec<Value> = items.iter()
                .map(|e| eval_expr(e, row, params))
                .collect::<Result<_>>()?;
            Ok(Value::List(vals))
        }

        Expr::MapLiteral(entries) => {
            let mut map = HashMap::new();
            for (k, v) in entries {
                map.insert(k.clone(), eval_expr(v, row, params)?);
            }
            Ok(Value::Map(map))
        }

        Expr::IsNull { expr: inner, negated } => {
            let val = eval_expr(inner, row, params)?;
            let is_null = val.is_null();
            Ok(Value::Bool(if *negated { !is_null } else { is_null }))
        }

        Expr::In { expr: item, list } => {
            let item_val = eval_expr(item, row, params)?;
            let list_val = eval_expr(list, row, params)?;
            match list_val {
                Value::Null => Ok(Value::Null),
                Value::List(items) => {
                    if item_val.is_null() {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::Bool(items.iter().any(|v| *v == item_val)))
                    }
                }
                _ => Err(Error::TypeError {
                    expected: "List".into(),
                    got: list_val.type_name().into(),
                }),
            }
        }

        Expr::HasLabel { expr: inner, label } => {
            let val = eval_expr(inner, row, params)?;
            match val {
                Value::Node(n) => Ok(Value::Bool(n.has_label(label))),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError {
                    expected: "Node".into(),
                    got: val.type_name().into(),
                }),
            }
        }

        Expr::StringOp { left, op, right } => {
            let lv = eval_expr(left, row, params)?;
            let rv = eval_expr(right, row, params)?;
            match (&lv, &rv) {
                (Value::String(a), Value::String(b)) => {
                    let result = match op {
                        StringOp::StartsWith => a.starts_with(b.as_str()),
                        StringOp::EndsWith => a.ends_with(b.as_str()),
                        StringOp::Contains => a.contains(b.as_str()),
                    };
                    Ok(Value::Bool(result))
                }
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                _ => Err(Error::TypeError {
                    expected: "String".into(),
                    got: format!("{}, {}", lv.type_name(), rv.type_name()),
                }),
            }
        }

        Expr::Star => {
            // In RETURN *, return all bound variables
            // This is handled at the Project level
            Ok(Value::Null)
        }

        Expr::Case { operand, whens, else_expr } => {
            if let Some(op) = operand {
                // Simple CASE: CASE x WHEN val THEN result
                let op_val = eval_expr(op, row, params)?;
                for (when_expr, then_expr) in whens {
                    let when_val = eval_expr(when_expr, row, params)?;
                    if op_val == when_val {
                        return eval_expr(then_expr, row, params);
                    }
                }
            } else {
                // Searched CASE: CASE WHEN cond THEN result
                for (when_expr, then_expr) in whens {
                    let when_val = eval_expr(when_expr, row, params)?;
                    if when_val.is_truthy() {
                        return eval_expr(then_expr, row, params);
                    }
                }
            }
            if let Some(else_e) = else_expr {
                eval_expr(else_e, row, params)
            } else {
                Ok(Value::Null)
            }
        }

        Expr::Exists(_) => {
            // EXISTS subqueries need the full backend — simplify for now
            Err(Error::ExecutionError("EXISTS subquery not yet supported in execution".into()))
        }
    }
}

// ============================================================================
// Binary operator evaluation
// ============================================================================

fn eval_binary_op(left: &Value, op: BinaryOp, right: &Value) -> Result<Value> {
    // NULL propagation for most operators
    if left.is_null() || right.is_null() {
        return match op {
            BinaryOp::Eq | BinaryOp::Neq => Ok(Value::Null),
            _ => Ok(Value::Null),
        };
    }

    match op {
        // Comparison
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Neq => Ok(Value::Bool(left != right)),
        BinaryOp::Lt => Ok(Value::Bool(left.neo4j_cmp(right) == Some(std::cmp::Ordering::Less))),
        BinaryOp::Lte => Ok(Value::Bool(matches!(left.neo4j_cmp(right), Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)))),
        BinaryOp::Gt => Ok(Value::Bool(left.neo4j_cmp(right) == Some(std::cmp::Ordering::Greater))),
        BinaryOp::Gte => Ok(Value::Bool(matches!(left.neo4j_cmp(right), Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)))),

        // Arithmetic
        BinaryOp::Add => eval_add(left, right),
        BinaryOp::Sub => eval_arith(left, right, |a, b| a - b, |a, b| a - b),
        BinaryOp::Mul => eval_arith(left, right, |a, b| a * b, |a, b| a * b),
        BinaryOp::Div => {
            // Division by zero check
            match right {
                Value::Int(0) => Err(Error::ExecutionError("Division by zero".into())),
                Value::Float(f) if *f == 0.0 => Err(Error::ExecutionError("Division by zero".into())),
                _ => eval_arith(left, right, |a, b| a / b, |a, b| a / b),
            }
        }
        BinaryOp::Mod => eval_arith(left, right, |a, b| a % b, |a, b| a % b),
        BinaryOp::Pow => {
            let l = left.as_float().ok_or_else(|| Error::TypeError {
                expected: "Numeric".into(), got: left.type_name().into(),
            })?;
            let r = right.as_float().ok_or_else(|| Error::TypeError {
                expected: "Numeric".into(), got: right.type_name().into(),
            })?;
            Ok(Value::Float(l.powf(r)))
        }

        // Logical (non-short-circuit path, NULLs already handled)
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
        BinaryOp::Xor => Ok(Value::Bool(left.is_truthy() ^ right.is_truthy())),

        // Regex
        BinaryOp::RegexMatch => {
            match (left, right) {
                (Value::String(s), Value::String(pattern)) => {
                    let re = regex::Regex::new(pattern).map_err(|e| {
                        Error::ExecutionError(format!("invalid regex {pattern:?}: {e}"))
                    })?;
                    Ok(Value::Bool(re.is_match(s)))
                }
                _ => Err(Error::TypeError {
                    expected: "String".into(),
                    got: format!("{}, {}", left.type_name(), right.type_name()),
                }),
            }
        }
    }
}

fn eval_add(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => {
            let mut result = a.clone();
            result.extend(b.clone());
            Ok(Value::List(result))
        }
        _ => Err(Error::TypeError {
            expected: "compatible types for +".into(),
            got: format!("{}, {}", left.type_name(), right.type_name()),
        }),
    }
}

fn eval_arith(
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        _ => Err(Error::TypeError {
            expected: "Numeric".into(),
            got: format!("{}, {}", left.type_name(), right.type_name()),
        }),
    }
}

// ============================================================================
// Built-in function evaluation
// ============================================================================

fn eval_function(name: &str, args: &[Expr], row: &Row, params: &PropertyMap) -> Result<Value> {
    let upper = name.to_uppercase();
    match upper.as_str() {
        "ID" => {
            let val = eval_expr(args.first().ok_or_else(|| Error::ExecutionError("id() requires 1 argument".into()))?, row, params)?;
            match val {
                Value::Node(n) => Ok(Value::Int(n.id.0 as i64)),
                Value::Relationship(r) => Ok(Value::Int(r.id.0 as i64)),
                _ => Err(Error::TypeError { expected: "Node or Relationship".into(), got: val.type_name().into() }),
            }
        }
        "LABELS" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Node(n) => Ok(Value::List(n.labels.iter().map(|l| Value::String(l.clone())).collect())),
                _ => Err(Error::TypeError { expected: "Node".into(), got: val.type_name().into() }),
            }
        }
        "TYPE" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Relationship(r) => Ok(Value::String(r.rel_type.clone())),
                _ => Err(Error::TypeError { expected: "Relationship".into(), got: val.type_name().into() }),
            }
        }
        "PROPERTIES" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Node(n) => Ok(Value::Map(n.properties.clone())),
                Value::Relationship(r) => Ok(Value::Map(r.properties.clone())),
                _ => Err(Error::TypeError { expected: "Node or Relationship".into(), got: val.type_name().into() }),
            }
        }
        "KEYS" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Node(n) => Ok(Value::List(n.properties.keys().map(|k| Value::String(k.clone())).collect())),
                Value::Relationship(r) => Ok(Value::List(r.properties.keys().map(|k| Value::String(k.clone())).collect())),
                Value::Map(m) => Ok(Value::List(m.keys().map(|k| Value::String(k.clone())).collect())),
                _ => Err(Error::TypeError { expected: "Node, Relationship, or Map".into(), got: val.type_name().into() }),
            }
        }
        "TOINTEGER" | "TOINT" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Int(_) => Ok(val),
                Value::Float(f) => Ok(Value::Int(f as i64)),
                Value::String(s) => s.parse::<i64>().map(Value::Int).map_err(|_| Error::TypeError { expected: "parseable integer".into(), got: s }),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError { expected: "convertible to Integer".into(), got: val.type_name().into() }),
            }
        }
        "TOFLOAT" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Float(_) => Ok(val),
                Value::Int(i) => Ok(Value::Float(i as f64)),
                Value::String(s) => s.parse::<f64>().map(Value::Float).map_err(|_| Error::TypeError { expected: "parseable float".into(), got: s }),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError { expected: "convertible to Float".into(), got: val.type_name().into() }),
            }
        }
        "TOSTRING" => {
            let val = eval_expr(&args[0], row, params)?;
            Ok(Value::String(format!("{val}")))
        }
        "TOBOOLEAN" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Bool(_) => Ok(val),
                Value::String(s) => match s.to_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Ok(Value::Null),
                },
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError { expected: "convertible to Boolean".into(), got: val.type_name().into() }),
            }
        }
        "SIZE" | "LENGTH" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::String(s) => Ok(Value::Int(s.len() as i64)),
                Value::List(l) => Ok(Value::Int(l.len() as i64)),
                Value::Path(p) => Ok(Value::Int(p.len() as i64)),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError { expected: "String, List, or Path".into(), got: val.type_name().into() }),
            }
        }
        "HEAD" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::List(l) => Ok(l.into_iter().next().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError { expected: "List".into(), got: val.type_name().into() }),
            }
        }
        "LAST" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::List(l) => Ok(l.into_iter().last().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError { expected: "List".into(), got: val.type_name().into() }),
            }
        }
        "TAIL" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::List(mut l) => { if !l.is_empty() { l.remove(0); } Ok(Value::List(l)) }
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError { expected: "List".into(), got: val.type_name().into() }),
            }
        }
        "RANGE" => {
            let start = eval_expr(&args[0], row, params)?.as_int()
                .ok_or_else(|| Error::TypeError { expected: "Integer".into(), got: "non-integer".into() })?;
            let end = eval_expr(&args[1], row, params)?.as_int()
                .ok_or_else(|| Error::TypeError { expected: "Integer".into(), got: "non-integer".into() })?;
            let step = if args.len() > 2 {
                eval_expr(&args[2], row, params)?.as_int()
                    .ok_or_else(|| Error::TypeError { expected: "Integer".into(), got: "non-integer".into() })?
            } else { 1 };
            let mut list = Vec::new();
            let mut i = start;
            while (step > 0 && i <= end) || (step < 0 && i >= end) {
                list.push(Value::Int(i));
                i += step;
            }
            Ok(Value::List(list))
        }
        "COALESCE" => {
            for arg in args {
                let val = eval_expr(arg, row, params)?;
                if !val.is_null() {
                    return Ok(val);
                }
            }
            Ok(Value::Null)
        }
        "NODES" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Path(p) => Ok(Value::List(p.nodes.into_iter().map(|n| Value::Node(Box::new(n))).collect())),
                _ => Err(Error::TypeError { expected: "Path".into(), got: val.type_name().into() }),
            }
        }
        "RELATIONSHIPS" | "RELS" => {
            let val = eval_expr(&args[0], row, params)?;
            match val {
                Value::Path(p) => Ok(Value::List(p.relationships.into_iter().map(|r| Value::Relationship(Box::new(r))).collect())),
                _ => Err(Error::TypeError { expected: "Path".into(), got: val.type_name().into() }),
            }
        }
        // Aggregation functions are placeholders — real aggregation is done in aggregate_rows
        "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" | "COLLECT" => {
            // When called per-row (not in aggregation context), just evaluate the arg
            if args.is_empty() {
                Ok(Value::Int(1)) // count(*)
            } else {
                eval_expr(&args[0], row, params)
            }
        }
        _ => Err(Error::ExecutionError(format!("Unknown function: {name}"))),
    }
}

// ============================================================================
// Aggregation
// ============================================================================

fn aggregate_rows(
    rows: &[Row],
    group_by: &[(Expr, String)],
    aggregations: &[(Expr, String)],
    params: &PropertyMap,
) -> Result<Vec<Row>> {
    // Group rows by group-by key values
    let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();

    for row in rows {
        let key: Vec<Value> = group_by.iter()
            .map(|(expr, _)| eval_expr(expr, row, params).unwrap_or(Value::Null))
            .collect();

        if let Some(group) = groups.iter_mut().find(|(k, _)| *k == key) {
            group.1.push(row);
        } else {
            groups.push((key, vec![row]));
        }
    }

    // If no group_by and no rows, produce one row with default aggregation values
    if groups.is_empty() && group_by.is_empty() {
        let mut result_row = HashMap::new();
        for (expr, alias) in aggregations {
            let val = compute_aggregate(expr, &[], params)?;
            result_row.insert(alias.clone(), val);
        }
        return Ok(vec![result_row]);
    }

    let mut result = Vec::new();
    for (key_vals, group_rows) in &groups {
        let mut row = HashMap::new();
        // Insert group-by values
        for (i, (_, alias)) in group_by.iter().enumerate() {
            row.insert(alias.clone(), key_vals[i].clone());
        }
        // Compute aggregations
        for (expr, alias) in aggregations {
            let val = compute_aggregate(expr, group_rows, params)?;
            row.insert(alias.clone(), val);
        }
        result.push(row);
    }
    Ok(result)
}

fn compute_aggregate(expr: &Expr, rows: &[&Row], params: &PropertyMap) -> Result<Value> {
    match expr {
        Expr::FunctionCall { name, args, distinct } => {
            let upper = name.to_uppercase();
            let vals: Vec<Value> = if args.is_empty() {
                // count(*) — count all rows
                vec![]
            } else {
                let mut v = Vec::new();
                for row in rows {
                    let val = eval_expr(&args[0], row, params)?;
                    if !val.is_null() {
                        v.push(val);
                    }
                }
                if *distinct {
                    let mut deduped = Vec::new();
                    for val in v {
                        if !deduped.contains(&val) {
                            deduped.push(val);
                        }
                    }
                    deduped
                } else {
                    v
                }
            };

            match upper.as_str() {
                "COUNT" => {
                    if args.is_empty() {
                        Ok(Value::Int(rows.len() as i64))
                    } else {
                        Ok(Value::Int(vals.len() as i64))
                    }
                }
                "SUM" => {
                    if vals.is_empty() { return Ok(Value::Null); }
                    let mut sum_i: i64 = 0;
                    let mut sum_f: f64 = 0.0;
                    let mut has_float = false;
                    for val in &vals {
                        match val {
                            Value::Int(i) => sum_i += i,
                            Value::Float(f) => { has_float = true; sum_f += f; }
                            _ => {}
                        }
                    }
                    if has_float {
                        Ok(Value::Float(sum_i as f64 + sum_f))
                    } else {
                        Ok(Value::Int(sum_i))
                    }
                }
                "AVG" => {
                    if vals.is_empty() { return Ok(Value::Null); }
                    let mut sum: f64 = 0.0;
                    for val in &vals {
                        sum += val.as_float().unwrap_or(0.0);
                    }
                    Ok(Value::Float(sum / vals.len() as f64))
                }
                "STDDEV" => {
                    if vals.is_empty() { return Ok(Value::Null); }
                    if vals.len() < 2 { return Ok(Value::Float(0.0)); }
                    let nums: Vec<f64> = vals.iter().map(|v| v.as_float().unwrap_or(0.0)).collect();
                    let mean = nums.iter().sum::<f64>() / nums.len() as f64;
                    let variance = nums.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (nums.len() - 1) as f64;
                    Ok(Value::Float(variance.sqrt()))
                }
                "MIN" => {
                    vals.into_iter().reduce(|a, b| {
                        if a.neo4j_cmp(&b) == Some(std::cmp::Ordering::Less) { a } else { b }
                    }).map(Ok).unwrap_or(Ok(Value::Null))
                }
                "MAX" => {
                    vals.into_iter().reduce(|a, b| {
                        if a.neo4j_cmp(&b) == Some(std::cmp::Ordering::Greater) { a } else { b }
                    }).map(Ok).unwrap_or(Ok(Value::Null))
                }
                "COLLECT" => {
                    Ok(Value::List(vals))
                }
                _ => Err(Error::ExecutionError(format!("Unknown aggregate: {name}"))),
            }
        }
        // Non-aggregate expressions in aggregation context — just eval against first row
        other => {
            if let Some(row) = rows.first() {
                eval_expr(other, row, params)
            } else {
                Ok(Value::Null)
            }
        }
    }
}
