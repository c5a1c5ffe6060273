//! Predicate extraction and plan selection.
//!
//! `FILTER` expressions are split into conjuncts; each conjunct either
//! maps onto an index (equality, range, fulltext, spatial) or degrades to
//! a residual post-filter. Plan cost attributes are recorded for tracing.

use crate::aql::{BinaryOp, Expr, Literal, Query, SortSpec};
use crate::error::CoreResult;
use crate::query::eval::{as_mbr, as_point};
use crate::spatial::ewkb::Mbr;
use serde_json::Value as Json;
use std::collections::HashMap;

/// An extracted equality predicate on the primary `FOR` variable.
#[derive(Debug, Clone, PartialEq)]
pub struct EqPred {
    /// Column name.
    pub column: String,
    /// Comparison value, rendered for the index key.
    pub value: String,
}

/// An extracted range predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct RangePred {
    /// Column name.
    pub column: String,
    /// Lower bound.
    pub lo: Option<Json>,
    /// Upper bound.
    pub hi: Option<Json>,
    /// Bound inclusivity.
    pub inclusive: (bool, bool),
}

/// An extracted fulltext predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct FulltextPred {
    /// Column name.
    pub column: String,
    /// Query text (AND over tokens).
    pub query: String,
}

/// An extracted spatial predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialPred {
    /// Geometry column (`geometry` for the entity slot).
    pub column: String,
    /// Query box.
    pub bbox: Mbr,
    /// Require containment (`ST_Within`) rather than intersection.
    pub within: bool,
}

/// A vector ordering extracted from `SORT SIMILARITY(...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSort {
    /// Vector field name.
    pub field: String,
    /// Query vector.
    pub query: Vec<f32>,
    /// Descending similarity = ascending distance.
    pub descending: bool,
}

/// The conjunctive decomposition of a query's filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConjunctiveQuery {
    /// Equality predicates.
    pub eq_preds: Vec<EqPred>,
    /// Range predicates.
    pub range_preds: Vec<RangePred>,
    /// At most one fulltext predicate is pushed down.
    pub fulltext_pred: Option<FulltextPred>,
    /// At most one spatial predicate is pushed down.
    pub spatial_pred: Option<SpatialPred>,
    /// Vector ordering from SORT, if any.
    pub vector_sort: Option<VectorSort>,
    /// Conjuncts no index can serve; evaluated as post-filters.
    pub residual: Vec<Expr>,
}

/// Cost attributes recorded while planning, surfaced for tracing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanTrace {
    /// Chosen strategy name.
    pub strategy: String,
    /// Estimated cost of a spatial-first plan.
    pub spatial_first_cost: Option<f64>,
    /// Estimated cost of a vector-first plan.
    pub vector_first_cost: Option<f64>,
    /// Estimated cost of a fulltext-first plan.
    pub fulltext_first_cost: Option<f64>,
    /// Sampled traversal branching factor.
    pub branching_estimate: Option<f64>,
    /// Projected traversal expansion.
    pub expanded_estimate: Option<u64>,
    /// Whether a composite index served several equality predicates.
    pub composite_prefilter_applied: bool,
    /// Entities loaded during materialization.
    pub entities_loaded: usize,
}

/// Splits an expression into its conjuncts. Non-conjunctive trees return
/// themselves whole.
pub fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Binary(BinaryOp::And, left, right) => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        other => vec![other],
    }
}

/// Extracts the conjunctive decomposition of a query's filters with
/// respect to its primary `FOR` variable.
///
/// # Errors
///
/// Returns an error if a bind parameter referenced by a pushed-down
/// predicate is missing.
pub fn extract(
    query: &Query,
    primary_var: &str,
    params: &HashMap<String, Json>,
) -> CoreResult<ConjunctiveQuery> {
    let mut cq = ConjunctiveQuery::default();

    for filter in &query.filters {
        for conjunct in conjuncts(filter) {
            if !try_extract(conjunct, primary_var, params, &mut cq)? {
                cq.residual.push(conjunct.clone());
            }
        }
    }

    cq.vector_sort = extract_vector_sort(&query.sort, primary_var, params)?;
    Ok(cq)
}

/// Attempts to push one conjunct into an index-servable predicate.
fn try_extract(
    expr: &Expr,
    primary_var: &str,
    params: &HashMap<String, Json>,
    cq: &mut ConjunctiveQuery,
) -> CoreResult<bool> {
    match expr {
        Expr::Binary(op, left, right) => {
            // Normalize `literal op var.col` to `var.col op' literal`.
            let (column, value_expr, op) = match (column_of(left, primary_var), column_of(right, primary_var)) {
                (Some(column), None) => (column, right.as_ref(), *op),
                (None, Some(column)) => (column, left.as_ref(), flip(*op)),
                _ => return Ok(false),
            };
            let Some(value) = const_value(value_expr, params) else {
                return Ok(false);
            };

            match op {
                BinaryOp::Eq => {
                    let Some(rendered) = render_eq_value(&value) else {
                        return Ok(false);
                    };
                    cq.eq_preds.push(EqPred {
                        column,
                        value: rendered,
                    });
                    Ok(true)
                }
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    let (lo, hi, inclusive) = match op {
                        BinaryOp::Lt => (None, Some(value), (true, false)),
                        BinaryOp::Le => (None, Some(value), (true, true)),
                        BinaryOp::Gt => (Some(value), None, (false, true)),
                        BinaryOp::Ge => (Some(value), None, (true, true)),
                        _ => unreachable!(),
                    };
                    merge_range(cq, column, lo, hi, inclusive);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        Expr::Call(name, args) => match name.as_str() {
            "FULLTEXT" => {
                let (Some(column), Some(Expr::Literal(Literal::Str(text)))) =
                    (args.first().and_then(|a| column_of(a, primary_var)), args.get(1))
                else {
                    return Ok(false);
                };
                if cq.fulltext_pred.is_some() {
                    return Ok(false);
                }
                cq.fulltext_pred = Some(FulltextPred {
                    column,
                    query: text.clone(),
                });
                Ok(true)
            }
            "ST_WITHIN" | "ST_INTERSECTS" => {
                let Some(column) = args.first().and_then(|a| column_of(a, primary_var)) else {
                    return Ok(false);
                };
                let Some(bbox) = args
                    .get(1)
                    .and_then(|a| const_value(a, params))
                    .as_ref()
                    .and_then(as_mbr)
                else {
                    return Ok(false);
                };
                if cq.spatial_pred.is_some() {
                    return Ok(false);
                }
                cq.spatial_pred = Some(SpatialPred {
                    column,
                    bbox,
                    within: name == "ST_WITHIN",
                });
                Ok(true)
            }
            _ => Ok(false),
        },
        _ => Ok(false),
    }
}

/// `PROXIMITY(var.col, p) < d` in a conjunct becomes a spatial box; the
/// exact distance check stays residual, so extraction adds the broadphase
/// and keeps the conjunct.
pub fn proximity_bbox(
    expr: &Expr,
    primary_var: &str,
    params: &HashMap<String, Json>,
) -> Option<(String, Mbr)> {
    let Expr::Binary(op, left, right) = expr else {
        return None;
    };
    if !matches!(op, BinaryOp::Lt | BinaryOp::Le) {
        return None;
    }
    let Expr::Call(name, args) = left.as_ref() else {
        return None;
    };
    if name != "PROXIMITY" {
        return None;
    }
    let column = args.first().and_then(|a| column_of(a, primary_var))?;
    let point = args.get(1).and_then(|a| const_value(a, params))?;
    let (x, y) = as_point(&point)?;
    let distance = const_value(right, params)?.as_f64()?;
    Some((
        column,
        Mbr {
            min_x: x - distance,
            min_y: y - distance,
            max_x: x + distance,
            max_y: y + distance,
        },
    ))
}

fn extract_vector_sort(
    sort: &[SortSpec],
    primary_var: &str,
    params: &HashMap<String, Json>,
) -> CoreResult<Option<VectorSort>> {
    let Some(first) = sort.first() else {
        return Ok(None);
    };
    let Expr::Call(name, args) = &first.expr else {
        return Ok(None);
    };
    if name != "SIMILARITY" {
        return Ok(None);
    }
    let Some(field) = args.first().and_then(|a| column_of(a, primary_var)) else {
        return Ok(None);
    };
    let Some(query_value) = args.get(1).and_then(|a| const_value(a, params)) else {
        return Ok(None);
    };
    let Json::Array(items) = query_value else {
        return Ok(None);
    };
    let mut query = Vec::with_capacity(items.len());
    for item in items {
        let Some(f) = item.as_f64() else {
            return Ok(None);
        };
        #[allow(clippy::cast_possible_truncation)]
        query.push(f as f32);
    }
    Ok(Some(VectorSort {
        field,
        query,
        descending: first.descending,
    }))
}

/// `var.column` for the primary variable; longer paths are not indexable.
fn column_of(expr: &Expr, primary_var: &str) -> Option<String> {
    let (root, path) = expr.as_field_path()?;
    if root == primary_var && path.len() == 1 {
        Some(path[0].to_string())
    } else {
        None
    }
}

/// A literal or bound parameter, evaluated to its JSON value.
fn const_value(expr: &Expr, params: &HashMap<String, Json>) -> Option<Json> {
    match expr {
        Expr::Literal(Literal::Null) => Some(Json::Null),
        Expr::Literal(Literal::Bool(b)) => Some(Json::Bool(*b)),
        Expr::Literal(Literal::Int(n)) => Some(Json::Number((*n).into())),
        Expr::Literal(Literal::Float(f)) => {
            serde_json::Number::from_f64(*f).map(Json::Number)
        }
        Expr::Literal(Literal::Str(s)) => Some(Json::String(s.clone())),
        Expr::Param(name) => params.get(name).cloned(),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(const_value(item, params)?);
            }
            Some(Json::Array(out))
        }
        _ => None,
    }
}

/// Renders an equality comparison value the way index entries render it.
fn render_eq_value(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flip(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Ge => BinaryOp::Le,
        other => other,
    }
}

fn merge_range(
    cq: &mut ConjunctiveQuery,
    column: String,
    lo: Option<Json>,
    hi: Option<Json>,
    inclusive: (bool, bool),
) {
    if let Some(existing) = cq.range_preds.iter_mut().find(|p| p.column == column) {
        if lo.is_some() {
            existing.lo = lo;
            existing.inclusive.0 = inclusive.0;
        }
        if hi.is_some() {
            existing.hi = hi;
            existing.inclusive.1 = inclusive.1;
        }
    } else {
        cq.range_preds.push(RangePred {
            column,
            lo,
            hi,
            inclusive,
        });
    }
}
