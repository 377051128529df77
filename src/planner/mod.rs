//! Query planner — transforms Cypher AST into a logical plan.
//!
//! The planner is backend-agnostic. It produces logical operators that
//! the execution engine maps to StorageBackend calls. Every operator that
//! consumes rows threads an `input` sub-plan (defaulting to `Argument`),
//! which lets the same leaf operators serve both as pipeline starts and
//! as correlated subplans under `Apply` (used for OPTIONAL MATCH, CALL
//! subqueries and multi-pattern MATCH clauses alike).

use std::collections::HashSet;
use crate::model::{Direction, PropertyMap};
use crate::cypher::ast::*;
use crate::{Error, Result};

/// Logical plan node.
#[derive(Debug, Clone)]
pub enum LogicalPlan {
    /// Produces one row — either an empty row, or (when running inside an
    /// `Apply`) the seeded outer row.
    Argument,
    /// Scan all nodes with a given label.
    NodeScan { input: Box<LogicalPlan>, label: String, alias: String },
    /// Scan every node regardless of label.
    AllNodesScan { input: Box<LogicalPlan>, alias: String },
    /// Index-backed property equality lookup.
    IndexLookup { input: Box<LogicalPlan>, label: String, property: String, alias: String, value: Box<Expr> },
    /// Expand relationships from a bound node.
    Expand {
        input: Box<LogicalPlan>,
        from: String,
        dir: Direction,
        rel_types: Vec<String>,
        to: String,
        rel_alias: Option<String>,
        var_length: Option<(usize, Option<usize>)>,
    },
    /// Run `subplan` once per row of `input`, seeding it with that row.
    /// When `optional` is true and `subplan` yields no rows for a given
    /// outer row, the outer row passes through unchanged (its `new_vars`
    /// evaluate to null); otherwise it is dropped.
    Apply { input: Box<LogicalPlan>, subplan: Box<LogicalPlan>, optional: bool, new_vars: Vec<String> },
    /// Filter rows by predicate. `on_optional` relaxes the usual
    /// truthy-only rule: rows whose predicate evaluates to null are kept,
    /// only rows that are strictly false are dropped (OPTIONAL MATCH ...
    /// WHERE semantics).
    Filter { input: Box<LogicalPlan>, predicate: Expr, on_optional: bool },
    /// Project columns (resets the result column list).
    Project { input: Box<LogicalPlan>, items: Vec<(Expr, String)> },
    /// Create a pattern of nodes and relationships for each input row.
    CreatePattern { input: Box<LogicalPlan>, nodes: Vec<CreateNodeSpec>, rels: Vec<CreateRelSpec> },
    /// MERGE: match the pattern described by `spec`, creating it if absent.
    Merge { input: Box<LogicalPlan>, spec: MergeSpec },
    /// Limit output rows.
    Limit { input: Box<LogicalPlan>, count: Expr },
    /// Skip leading rows.
    Skip { input: Box<LogicalPlan>, count: Expr },
    /// Sort rows.
    Sort { input: Box<LogicalPlan>, keys: Vec<(Expr, bool)> },
    /// De-duplicate rows.
    Distinct { input: Box<LogicalPlan> },
    /// Cartesian product of two inputs (disjoint patterns).
    CartesianProduct { left: Box<LogicalPlan>, right: Box<LogicalPlan> },
    /// CALL proc(args) YIELD ... as a pipeline stage.
    CallProcedure { input: Box<LogicalPlan>, name: String, args: Vec<Expr>, yields: Vec<(String, String)> },
    /// CALL { inner } YIELD ... — inner runs once per input row.
    CallSubquery { input: Box<LogicalPlan>, inner: Box<LogicalPlan>, yields: Vec<(String, String)> },
    /// Group + aggregate.
    Aggregate { input: Box<LogicalPlan>, group_by: Vec<(Expr, String)>, aggregations: Vec<(Expr, String)> },
    SetProperty { input: Box<LogicalPlan>, variable: String, key: String, value: Expr },
    SetAllProperties { input: Box<LogicalPlan>, variable: String, value: Expr, merge: bool },
    SetLabel { input: Box<LogicalPlan>, variable: String, label: String },
    DeleteNode { input: Box<LogicalPlan>, variable: String, detach: bool },
    DeleteRel { input: Box<LogicalPlan>, variable: String },
    Unwind { input: Box<LogicalPlan>, expr: Expr, alias: String },
    RemoveProperty { input: Box<LogicalPlan>, variable: String, key: String },
    RemoveLabel { input: Box<LogicalPlan>, variable: String, label: String },
    /// FOREACH (variable IN list_expr | body) — body plans execute once
    /// per list element, seeded with the enclosing row plus `variable`.
    Foreach { input: Box<LogicalPlan>, variable: String, list_expr: Expr, body: Vec<LogicalPlan> },
    /// left UNION [ALL] right.
    Union { left: Box<LogicalPlan>, right: Box<LogicalPlan>, all: bool },
    /// Schema DDL — no rows, just a backend side effect.
    SchemaOp(SchemaCommand),
}

/// A single node to create as part of a pattern. `already_bound` marks a
/// pattern element that refers to a variable bound by an earlier clause
/// (e.g. `MATCH (a) CREATE (a)-[:R]->(b)`) rather than a fresh node.
#[derive(Debug, Clone)]
pub struct CreateNodeSpec {
    pub alias: String,
    pub labels: Vec<String>,
    pub properties: Vec<(String, Expr)>,
    pub already_bound: bool,
}

#[derive(Debug, Clone)]
pub struct CreateRelSpec {
    pub alias: Option<String>,
    pub src_alias: String,
    pub dst_alias: String,
    pub rel_type: String,
    pub properties: Vec<(String, Expr)>,
}

#[derive(Debug, Clone)]
pub enum SetOp {
    Property { variable: String, key: String, value: Expr },
    AllProperties { variable: String, value: Expr, merge: bool },
    Label { variable: String, label: String },
}

/// MERGE match-or-create specification. Supports a single node pattern,
/// or a single node-relationship-node hop (the common cases); deeper
/// chains are not supported (`CypherCompileError`).
#[derive(Debug, Clone)]
pub struct MergeSpec {
    pub nodes: Vec<CreateNodeSpec>,
    pub rels: Vec<CreateRelSpec>,
    pub on_create: Vec<SetOp>,
    pub on_match: Vec<SetOp>,
}

/// Compile-time state threaded through plan construction.
struct PlanCtx {
    anon_counter: usize,
    bound: HashSet<String>,
}

impl PlanCtx {
    fn new() -> Self {
        Self { anon_counter: 0, bound: HashSet::new() }
    }

    fn anon(&mut self, prefix: &str) -> String {
        self.anon_counter += 1;
        format!("_{prefix}{}", self.anon_counter)
    }
}

/// Create a logical plan from a parsed AST.
pub fn plan(ast: &Statement, _params: &PropertyMap) -> Result<LogicalPlan> {
    let mut ctx = PlanCtx::new();
    compile_statement(ast, &mut ctx)
}

/// Optimize a logical plan. Currently performs predicate pushdown of
/// simple equality filters onto the preceding scan as an `IndexLookup`
/// hint; the backend decides whether it actually has an index to use.
pub fn optimize(plan: LogicalPlan) -> Result<LogicalPlan> {
    Ok(push_down_filters(plan))
}

fn push_down_filters(plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter { input, predicate, on_optional } => {
            let input = Box::new(push_down_filters(*input));
            if let LogicalPlan::NodeScan { input: scan_input, label, alias } = input.as_ref() {
                if let Some((property, value)) = equality_on(&predicate, &alias) {
                    return LogicalPlan::IndexLookup {
                        input: scan_input.clone(),
                        label: label.clone(),
                        property,
                        alias: alias.clone(),
                        value: Box::new(value),
                    };
                }
            }
            LogicalPlan::Filter { input, predicate, on_optional }
        }
        other => other,
    }
}

/// Detect `alias.property = literal-or-param` at the top of a predicate.
fn equality_on(predicate: &Expr, alias: &str) -> Option<(String, Expr)> {
    if let Expr::BinaryOp { left, op: BinaryOp::Eq, right } = predicate {
        if let Expr::Property { expr, key } = left.as_ref() {
            if let Expr::Variable(v) = expr.as_ref() {
                if v == alias {
                    return Some((key.clone(), (**right).clone()));
                }
            }
        }
    }
    None
}

// ============================================================================
// Statement compilation
// ============================================================================

fn compile_statement(ast: &Statement, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    match ast {
        Statement::Query(q) => compile_query(q, ctx),
        Statement::Create(c) => compile_create_stmt(c, ctx),
        Statement::Merge(m) => compile_merge_stmt(m, ctx),
        Statement::Delete(d) => compile_delete_stmt(d, ctx),
        Statement::Set(s) => compile_set_stmt(s, ctx),
        Statement::Remove(r) => compile_remove_stmt(r, ctx),
        Statement::Foreach(f) => compile_foreach_stmt(f, ctx),
        Statement::Schema(cmd) => Ok(LogicalPlan::SchemaOp(cmd.clone())),
        Statement::Union(u) => {
            let left = compile_statement(&u.left, ctx)?;
            let right = compile_statement(&u.right, ctx)?;
            Ok(LogicalPlan::Union { left: Box::new(left), right: Box::new(right), all: u.all })
        }
    }
}

fn compile_query(q: &Query, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut plan = LogicalPlan::Argument;

    for part in &q.parts {
        plan = compile_query_part(plan, part, ctx)?;
    }

    compile_projection_stage(plan, &q.return_clause.items, q.return_clause.distinct,
        q.order_by.as_deref(), q.skip.as_ref(), q.limit.as_ref(), ctx)
}

fn compile_query_part(plan: LogicalPlan, part: &QueryPart, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    match part {
        QueryPart::Match(m) => {
            let before = ctx.bound.clone();
            let subplan = compile_match_clause(m, ctx)?;
            let new_vars: Vec<String> = ctx.bound.difference(&before).cloned().collect();
            Ok(LogicalPlan::Apply {
                input: Box::new(plan),
                subplan: Box::new(subplan),
                optional: m.optional,
                new_vars,
            })
        }
        QueryPart::Unwind { expr, alias } => {
            ctx.bound.insert(alias.clone());
            Ok(LogicalPlan::Unwind { input: Box::new(plan), expr: expr.clone(), alias: alias.clone() })
        }
        QueryPart::With(w) => {
            let projected = compile_projection_stage(plan, &w.items, w.distinct,
                w.order_by.as_deref(), w.skip.as_ref(), w.limit.as_ref(), ctx)?;
            // WITH's own bound set becomes exactly its projected aliases.
            ctx.bound = w.items.iter().filter_map(|item| {
                item.alias.clone().or_else(|| match &item.expr {
                    Expr::Variable(v) => Some(v.clone()),
                    _ => None,
                })
            }).collect();
            let filtered = if let Some(pred) = &w.where_clause {
                LogicalPlan::Filter { input: Box::new(projected), predicate: pred.clone(), on_optional: false }
            } else {
                projected
            };
            Ok(filtered)
        }
        QueryPart::CallSubquery(c) => {
            let mut inner_ctx = PlanCtx::new();
            inner_ctx.bound = ctx.bound.clone();
            let inner = compile_statement(&c.inner, &mut inner_ctx)?;
            let yields: Vec<(String, String)> = if c.yields.is_empty() {
                inner_ctx.bound.difference(&ctx.bound).map(|v| (v.clone(), v.clone())).collect()
            } else {
                c.yields.iter().map(|y| (y.name.clone(), y.alias.clone().unwrap_or_else(|| y.name.clone()))).collect()
            };
            for (_, alias) in &yields {
                ctx.bound.insert(alias.clone());
            }
            Ok(LogicalPlan::CallSubquery { input: Box::new(plan), inner: Box::new(inner), yields })
        }
        QueryPart::CallProcedure(c) => {
            let yields: Vec<(String, String)> = c.yields.iter()
                .map(|y| (y.name.clone(), y.alias.clone().unwrap_or_else(|| y.name.clone())))
                .collect();
            for (_, alias) in &yields {
                ctx.bound.insert(alias.clone());
            }
            Ok(LogicalPlan::CallProcedure { input: Box::new(plan), name: c.name.clone(), args: c.args.clone(), yields })
        }
        QueryPart::Foreach(f) => {
            let foreach_plan = compile_foreach(plan, f, ctx)?;
            Ok(foreach_plan)
        }
    }
}

/// Compile a MATCH clause's pattern(s) + WHERE into a self-contained
/// subplan whose leftmost leaf is `Argument` (i.e. it expects to be run
/// either standalone or seeded via `Apply`).
fn compile_match_clause(m: &MatchClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut plan: Option<LogicalPlan> = None;
    for pattern in &m.patterns {
        let sub = compile_pattern(pattern, ctx)?;
        plan = Some(match plan {
            None => sub,
            Some(acc) => LogicalPlan::CartesianProduct { left: Box::new(acc), right: Box::new(sub) },
        });
    }
    let plan = plan.ok_or_else(|| Error::PlanError("MATCH requires at least one pattern".into()))?;

    Ok(match &m.where_clause {
        Some(pred) => LogicalPlan::Filter { input: Box::new(plan), predicate: pred.clone(), on_optional: m.optional },
        None => plan,
    })
}

/// Compile a single pattern (node - rel - node - ...) into a subplan,
/// threading the bound-variable set as we go.
fn compile_pattern(pattern: &Pattern, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut elements = pattern.elements.iter();
    let first = match elements.next() {
        Some(PatternElement::Node(n)) => n,
        _ => return Err(Error::PlanError("Pattern must start with a node".into())),
    };

    let first_alias = first.alias.clone().unwrap_or_else(|| ctx.anon("anon"));
    let mut plan = compile_node_start(first, &first_alias, ctx)?;
    let mut prev_alias = first_alias;

    loop {
        let rel = match elements.next() {
            Some(PatternElement::Relationship(r)) => r,
            Some(PatternElement::Node(_)) => return Err(Error::PlanError("Malformed pattern: node without relationship".into())),
            None => break,
        };
        let node = match elements.next() {
            Some(PatternElement::Node(n)) => n,
            _ => return Err(Error::PlanError("Relationship must be followed by a node".into())),
        };

        let target_alias = node.alias.clone().unwrap_or_else(|| ctx.anon("anon"));
        let rel_alias = rel.alias.clone();
        let dir = match rel.direction {
            PatternDirection::Right => Direction::Outgoing,
            PatternDirection::Left => Direction::Incoming,
            PatternDirection::Both => Direction::Both,
        };
        let var_length = rel.var_length.as_ref().map(|vl| (vl.min.unwrap_or(1), vl.max));

        let reuse = ctx.bound.contains(&target_alias);
        let expand_alias = if reuse { ctx.anon("expand") } else { target_alias.clone() };

        plan = LogicalPlan::Expand {
            input: Box::new(plan),
            from: prev_alias.clone(),
            dir,
            rel_types: rel.rel_types.clone(),
            to: expand_alias.clone(),
            rel_alias: rel_alias.clone(),
            var_length,
        };

        if reuse {
            plan = LogicalPlan::Filter {
                input: Box::new(plan),
                predicate: Expr::BinaryOp {
                    left: Box::new(Expr::Variable(expand_alias)),
                    op: BinaryOp::Eq,
                    right: Box::new(Expr::Variable(target_alias.clone())),
                },
                on_optional: false,
            };
        } else {
            ctx.bound.insert(target_alias.clone());
        }
        if let Some(ra) = &rel_alias {
            ctx.bound.insert(ra.clone());
        }
        if !node.labels.is_empty() || !node.properties.is_empty() {
            plan = apply_node_filters(plan, &target_alias, node);
        }

        prev_alias = target_alias;
    }

    Ok(plan)
}

fn compile_node_start(node: &NodePattern, alias: &str, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let reuse = ctx.bound.contains(alias);
    let mut plan = if reuse {
        LogicalPlan::Argument
    } else if let Some(label) = node.labels.first() {
        LogicalPlan::NodeScan { input: Box::new(LogicalPlan::Argument), label: label.clone(), alias: alias.to_string() }
    } else {
        LogicalPlan::AllNodesScan { input: Box::new(LogicalPlan::Argument), alias: alias.to_string() }
    };

    if !reuse {
        ctx.bound.insert(alias.to_string());
        // Extra labels beyond the first used for the scan.
        let extra_labels = if node.labels.is_empty() { &node.labels[..] } else { &node.labels[1..] };
        plan = apply_labels_and_props(plan, alias, extra_labels, &node.properties);
    } else if !node.labels.is_empty() || !node.properties.is_empty() {
        plan = apply_node_filters(plan, alias, node);
    }

    Ok(plan)
}

fn apply_node_filters(plan: LogicalPlan, alias: &str, node: &NodePattern) -> LogicalPlan {
    apply_labels_and_props(plan, alias, &node.labels, &node.properties)
}

fn apply_labels_and_props(
    mut plan: LogicalPlan,
    alias: &str,
    labels: &[String],
    properties: &std::collections::HashMap<String, Expr>,
) -> LogicalPlan {
    for label in labels {
        plan = LogicalPlan::Filter {
            input: Box::new(plan),
            predicate: Expr::HasLabel { expr: Box::new(Expr::Variable(alias.to_string())), label: label.clone() },
            on_optional: false,
        };
    }
    for (key, value) in properties {
        plan = LogicalPlan::Filter {
            input: Box::new(plan),
            predicate: Expr::BinaryOp {
                left: Box::new(Expr::Property { expr: Box::new(Expr::Variable(alias.to_string())), key: key.clone() }),
                op: BinaryOp::Eq,
                right: Box::new(value.clone()),
            },
            on_optional: false,
        };
    }
    plan
}

/// Does `expr` contain a bare aggregate function call anywhere?
fn contains_aggregate(expr: &Expr) -> bool {
    const AGGS: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX", "COLLECT", "STDDEV"];
    match expr {
        Expr::FunctionCall { name, args, .. } => {
            AGGS.contains(&name.to_uppercase().as_str()) || args.iter().any(contains_aggregate)
        }
        Expr::BinaryOp { left, right, .. } => contains_aggregate(left) || contains_aggregate(right),
        Expr::UnaryOp { expr, .. } => contains_aggregate(expr),
        Expr::Property { expr, .. } => contains_aggregate(expr),
        Expr::List(items) => items.iter().any(contains_aggregate),
        Expr::Case { operand, whens, else_expr } => {
            operand.as_deref().map(contains_aggregate).unwrap_or(false)
                || whens.iter().any(|(w, t)| contains_aggregate(w) || contains_aggregate(t))
                || else_expr.as_deref().map(contains_aggregate).unwrap_or(false)
        }
        _ => false,
    }
}

fn compile_projection_stage(
    input: LogicalPlan,
    items: &[ReturnItem],
    distinct: bool,
    order_by: Option<&[OrderExpr]>,
    skip: Option<&Expr>,
    limit: Option<&Expr>,
    ctx: &mut PlanCtx,
) -> Result<LogicalPlan> {
    // RETURN * / WITH * expands to every currently bound variable.
    let expanded_items: Vec<ReturnItem>;
    let items: &[ReturnItem] = if items.len() == 1 && matches!(items[0].expr, Expr::Star) {
        let mut names: Vec<String> = ctx.bound.iter().cloned().collect();
        names.sort();
        expanded_items = names.into_iter().map(|n| ReturnItem { expr: Expr::Variable(n.clone()), alias: Some(n) }).collect();
        &expanded_items
    } else {
        items
    };

    let has_aggregate = items.iter().any(|i| contains_aggregate(&i.expr));

    let mut plan = if has_aggregate {
        let mut group_by = Vec::new();
        let mut aggregations = Vec::new();
        for item in items {
            let alias = item.alias.clone().unwrap_or_else(|| expr_default_alias(&item.expr));
            if contains_aggregate(&item.expr) {
                aggregations.push((item.expr.clone(), alias));
            } else {
                group_by.push((item.expr.clone(), alias));
            }
        }
        LogicalPlan::Aggregate { input: Box::new(input), group_by, aggregations }
    } else {
        let proj_items: Vec<(Expr, String)> = items.iter()
            .map(|i| (i.expr.clone(), i.alias.clone().unwrap_or_else(|| expr_default_alias(&i.expr))))
            .collect();
        LogicalPlan::Project { input: Box::new(input), items: proj_items }
    };

    if distinct {
        plan = LogicalPlan::Distinct { input: Box::new(plan) };
    }
    if let Some(keys) = order_by {
        let keys = keys.iter().map(|k| (k.expr.clone(), k.ascending)).collect();
        plan = LogicalPlan::Sort { input: Box::new(plan), keys };
    }
    if let Some(s) = skip {
        plan = LogicalPlan::Skip { input: Box::new(plan), count: s.clone() };
    }
    if let Some(l) = limit {
        plan = LogicalPlan::Limit { input: Box::new(plan), count: l.clone() };
    }

    Ok(plan)
}

fn expr_default_alias(expr: &Expr) -> String {
    match expr {
        Expr::Variable(v) => v.clone(),
        Expr::Property { expr, key } => format!("{}.{key}", expr_default_alias(expr)),
        Expr::FunctionCall { name, .. } => name.clone(),
        _ => "expr".to_string(),
    }
}

// ============================================================================
// CREATE
// ============================================================================

fn compile_create_stmt(c: &CreateClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut plan = LogicalPlan::Argument;
    for pattern in &c.patterns {
        let (nodes, rels) = compile_create_pattern(pattern, ctx)?;
        plan = LogicalPlan::CreatePattern { input: Box::new(plan), nodes, rels };
    }
    match &c.return_clause {
        Some(r) => compile_projection_stage(plan, &r.items, r.distinct, None, None, None, ctx),
        None => Ok(plan),
    }
}

fn compile_create_pattern(pattern: &Pattern, ctx: &mut PlanCtx) -> Result<(Vec<CreateNodeSpec>, Vec<CreateRelSpec>)> {
    let mut nodes = Vec::new();
    let mut rels = Vec::new();
    let mut elements = pattern.elements.iter();

    let first = match elements.next() {
        Some(PatternElement::Node(n)) => n,
        _ => return Err(Error::PlanError("CREATE pattern must start with a node".into())),
    };
    let mut prev_alias = create_node_spec(first, ctx, &mut nodes)?;

    loop {
        let rel = match elements.next() {
            Some(PatternElement::Relationship(r)) => r,
            Some(PatternElement::Node(_)) => return Err(Error::PlanError("Malformed CREATE pattern".into())),
            None => break,
        };
        let node = match elements.next() {
            Some(PatternElement::Node(n)) => n,
            _ => return Err(Error::PlanError("Relationship must be followed by a node in CREATE".into())),
        };
        let next_alias = create_node_spec(node, ctx, &mut nodes)?;

        let rel_type = rel.rel_types.first().cloned()
            .ok_or_else(|| Error::PlanError("CREATE relationship requires exactly one type".into()))?;

        let (src, dst) = match rel.direction {
            PatternDirection::Left => (next_alias.clone(), prev_alias.clone()),
            _ => (prev_alias.clone(), next_alias.clone()),
        };

        rels.push(CreateRelSpec {
            alias: rel.alias.clone(),
            src_alias: src,
            dst_alias: dst,
            rel_type,
            properties: rel.properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        });

        prev_alias = next_alias;
    }

    Ok((nodes, rels))
}

fn create_node_spec(node: &NodePattern, ctx: &mut PlanCtx, nodes: &mut Vec<CreateNodeSpec>) -> Result<String> {
    let alias = node.alias.clone().unwrap_or_else(|| ctx.anon("n"));
    let already_bound = ctx.bound.contains(&alias);
    if !already_bound {
        nodes.push(CreateNodeSpec {
            alias: alias.clone(),
            labels: node.labels.clone(),
            properties: node.properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            already_bound: false,
        });
        ctx.bound.insert(alias.clone());
    } else {
        nodes.push(CreateNodeSpec { alias: alias.clone(), labels: Vec::new(), properties: Vec::new(), already_bound: true });
    }
    Ok(alias)
}

// ============================================================================
// MERGE
// ============================================================================

fn compile_merge_stmt(m: &MergeClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let (nodes, rels) = compile_create_pattern(&m.pattern, ctx)?;
    if nodes.len() > 2 || rels.len() > 1 {
        return Err(Error::PlanError("MERGE supports at most a single relationship hop".into()));
    }

    let on_create = m.on_create.iter().map(compile_set_op).collect::<Result<Vec<_>>>()?;
    let on_match = m.on_match.iter().map(compile_set_op).collect::<Result<Vec<_>>>()?;

    let plan = LogicalPlan::Merge {
        input: Box::new(LogicalPlan::Argument),
        spec: MergeSpec { nodes, rels, on_create, on_match },
    };

    match &m.return_clause {
        Some(r) => compile_projection_stage(plan, &r.items, r.distinct, None, None, None, ctx),
        None => Ok(plan),
    }
}

fn compile_set_op(item: &SetItem) -> Result<SetOp> {
    Ok(match item {
        SetItem::Property { variable, key, value } => SetOp::Property { variable: variable.clone(), key: key.clone(), value: value.clone() },
        SetItem::AllProperties { variable, value } => SetOp::AllProperties { variable: variable.clone(), value: value.clone(), merge: false },
        SetItem::MergeProperties { variable, value } => SetOp::AllProperties { variable: variable.clone(), value: value.clone(), merge: true },
        SetItem::Label { variable, label } => SetOp::Label { variable: variable.clone(), label: label.clone() },
    })
}

// ============================================================================
// DELETE / SET / REMOVE (with leading MATCH clauses)
// ============================================================================

fn compile_matches_base(matches: &[MatchClause], ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut plan = LogicalPlan::Argument;
    for m in matches {
        let before = ctx.bound.clone();
        let subplan = compile_match_clause(m, ctx)?;
        let new_vars: Vec<String> = ctx.bound.difference(&before).cloned().collect();
        plan = LogicalPlan::Apply { input: Box::new(plan), subplan: Box::new(subplan), optional: m.optional, new_vars };
    }
    Ok(plan)
}

fn compile_delete_stmt(d: &DeleteClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut plan = compile_matches_base(&d.matches, ctx)?;
    for variable in &d.variables {
        // Relationships vs. nodes are disambiguated at execution time by
        // what the variable is actually bound to.
        plan = LogicalPlan::DeleteNode { input: Box::new(plan), variable: variable.clone(), detach: d.detach };
    }
    Ok(plan)
}

fn compile_set_stmt(s: &SetClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut plan = compile_matches_base(&s.matches, ctx)?;
    for item in &s.items {
        plan = match item {
            SetItem::Property { variable, key, value } => LogicalPlan::SetProperty {
                input: Box::new(plan), variable: variable.clone(), key: key.clone(), value: value.clone(),
            },
            SetItem::AllProperties { variable, value } => LogicalPlan::SetAllProperties {
                input: Box::new(plan), variable: variable.clone(), value: value.clone(), merge: false,
            },
            SetItem::MergeProperties { variable, value } => LogicalPlan::SetAllProperties {
                input: Box::new(plan), variable: variable.clone(), value: value.clone(), merge: true,
            },
            SetItem::Label { variable, label } => LogicalPlan::SetLabel {
                input: Box::new(plan), variable: variable.clone(), label: label.clone(),
            },
        };
    }
    match &s.return_clause {
        Some(r) => compile_projection_stage(plan, &r.items, r.distinct, None, None, None, ctx),
        None => Ok(plan),
    }
}

fn compile_remove_stmt(r: &RemoveClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut plan = compile_matches_base(&r.matches, ctx)?;
    for item in &r.items {
        plan = match item {
            RemoveItem::Property { variable, key } => LogicalPlan::RemoveProperty {
                input: Box::new(plan), variable: variable.clone(), key: key.clone(),
            },
            RemoveItem::Label { variable, label } => LogicalPlan::RemoveLabel {
                input: Box::new(plan), variable: variable.clone(), label: label.clone(),
            },
        };
    }
    match &r.return_clause {
        Some(rc) => compile_projection_stage(plan, &rc.items, rc.distinct, None, None, None, ctx),
        None => Ok(plan),
    }
}

// ============================================================================
// FOREACH
// ============================================================================

fn compile_foreach_stmt(f: &ForeachClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    compile_foreach(LogicalPlan::Argument, f, ctx)
}

fn compile_foreach(plan: LogicalPlan, f: &ForeachClause, ctx: &mut PlanCtx) -> Result<LogicalPlan> {
    let mut inner_ctx = PlanCtx::new();
    inner_ctx.bound = ctx.bound.clone();
    inner_ctx.bound.insert(f.variable.clone());

    let body = f.body.iter()
        .map(|stmt| compile_statement(stmt, &mut inner_ctx))
        .collect::<Result<Vec<_>>>()?;

    Ok(LogicalPlan::Foreach {
        input: Box::new(plan),
        variable: f.variable.clone(),
        list_expr: f.list_expr.clone(),
        body,
    })
}
