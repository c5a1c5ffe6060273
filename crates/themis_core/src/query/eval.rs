//! Expression evaluation over JSON rows.
//!
//! Entities materialize into JSON objects (`_key` plus fields; byte
//! payloads appear as `{"$bytes": <base64>}` markers so geometry functions
//! can recover EWKB). Evaluation is total over the AST: anything an index
//! couldn't serve is evaluated here as a residual post-filter.

use crate::aql::{BinaryOp, Expr, Literal, Quantifier, Query, UnaryOp};
use crate::error::{CoreError, CoreResult};
use crate::index::fulltext::{unique_tokens, TokenizerConfig};
use crate::spatial::ewkb::{parse_ewkb, Mbr};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::collections::HashMap;
use themis_codec::{Entity, Value};

/// Variable bindings during evaluation.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, Json>,
}

impl Env {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a variable, returning the environment for chaining.
    pub fn bind(&mut self, name: impl Into<String>, value: Json) -> &mut Self {
        self.vars.insert(name.into(), value);
        self
    }

    /// Looks up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Json> {
        self.vars.get(name)
    }
}

/// Executor hook for subquery expressions.
pub trait SubqueryExec {
    /// Runs a subquery under the given bindings, returning its rows.
    fn execute_subquery(&self, query: &Query, env: &Env) -> CoreResult<Vec<Json>>;
}

/// Renders an entity as a JSON row.
#[must_use]
pub fn entity_to_json(entity: &Entity) -> Json {
    let mut object = serde_json::Map::new();
    object.insert("_key".to_string(), Json::String(entity.key().to_string()));
    for (name, value) in entity.fields() {
        object.insert(name.clone(), field_to_json(value));
    }
    Json::Object(object)
}

fn field_to_json(value: &Value) -> Json {
    match value {
        Value::Str(s) => Json::String(s.clone()),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::Bool(b) => Json::Bool(*b),
        Value::FloatVec(v) => Json::Array(
            v.iter()
                .map(|f| {
                    serde_json::Number::from_f64(f64::from(*f)).map_or(Json::Null, Json::Number)
                })
                .collect(),
        ),
        Value::Bytes(b) => serde_json::json!({ "$bytes": BASE64.encode(b) }),
        Value::Json(j) => j.clone(),
        Value::Absent => Json::Null,
    }
}

/// Evaluates an expression to a JSON value.
///
/// # Errors
///
/// Returns `Cardinality` for scalar subqueries with row count != 1 and
/// evaluation errors for missing parameters.
pub fn eval(
    expr: &Expr,
    env: &Env,
    params: &HashMap<String, Json>,
    exec: Option<&dyn SubqueryExec>,
) -> CoreResult<Json> {
    match expr {
        Expr::Literal(literal) => Ok(match literal {
            Literal::Null => Json::Null,
            Literal::Bool(b) => Json::Bool(*b),
            Literal::Int(n) => Json::Number((*n).into()),
            Literal::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number)
            }
            Literal::Str(s) => Json::String(s.clone()),
        }),
        Expr::Param(name) => params.get(name).cloned().ok_or_else(|| {
            CoreError::plan(format!("missing bind parameter @{name}"))
        }),
        Expr::Var(name) => Ok(env.get(name).cloned().unwrap_or(Json::Null)),
        Expr::Field(base, field) => {
            let base = eval_scalar(base, env, params, exec)?;
            Ok(base.get(field).cloned().unwrap_or(Json::Null))
        }
        Expr::Index(base, index) => {
            let base = eval(base, env, params, exec)?;
            let index = eval_scalar(index, env, params, exec)?;
            match (&base, &index) {
                (Json::Array(items), Json::Number(n)) => {
                    let idx = n.as_i64().unwrap_or(-1);
                    if idx < 0 {
                        return Ok(Json::Null);
                    }
                    #[allow(clippy::cast_sign_loss)]
                    Ok(items.get(idx as usize).cloned().unwrap_or(Json::Null))
                }
                (Json::Object(map), Json::String(key)) => {
                    Ok(map.get(key).cloned().unwrap_or(Json::Null))
                }
                _ => Ok(Json::Null),
            }
        }
        Expr::Unary(op, inner) => {
            let value = eval_scalar(inner, env, params, exec)?;
            Ok(match op {
                UnaryOp::Not => Json::Bool(!truthy(&value)),
                UnaryOp::Neg => match as_f64(&value) {
                    Some(n) => number(-n),
                    None => Json::Null,
                },
            })
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, env, params, exec),
        Expr::Call(name, args) => eval_call(name, args, env, params, exec),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, env, params, exec)?);
            }
            Ok(Json::Array(out))
        }
        Expr::Object(fields) => {
            let mut map = serde_json::Map::new();
            for (name, value) in fields {
                map.insert(name.clone(), eval(value, env, params, exec)?);
            }
            Ok(Json::Object(map))
        }
        Expr::Subquery(query) => {
            let exec = exec.ok_or_else(|| {
                CoreError::plan("subquery in a context without an executor")
            })?;
            Ok(Json::Array(exec.execute_subquery(query, env)?))
        }
        Expr::Quantified {
            quantifier,
            var,
            list,
            cond,
        } => {
            let list = eval(list, env, params, exec)?;
            let Json::Array(items) = list else {
                return Ok(Json::Bool(false));
            };
            let mut scoped = env.clone();
            let mut any = false;
            let mut all = true;
            for item in items {
                scoped.bind(var.clone(), item);
                let holds = truthy(&eval(cond, &scoped, params, exec)?);
                any |= holds;
                all &= holds;
            }
            Ok(Json::Bool(match quantifier {
                Quantifier::Any => any,
                Quantifier::All => all,
            }))
        }
    }
}

/// Evaluates in a scalar position: a bare subquery must yield exactly one
/// row (wrap with `[0]` for first-or-null).
fn eval_scalar(
    expr: &Expr,
    env: &Env,
    params: &HashMap<String, Json>,
    exec: Option<&dyn SubqueryExec>,
) -> CoreResult<Json> {
    if let Expr::Subquery(_) = expr {
        let Json::Array(rows) = eval(expr, env, params, exec)? else {
            unreachable!("subqueries evaluate to arrays");
        };
        if rows.len() != 1 {
            return Err(CoreError::Cardinality { rows: rows.len() });
        }
        return Ok(rows.into_iter().next().expect("len checked"));
    }
    eval(expr, env, params, exec)
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    env: &Env,
    params: &HashMap<String, Json>,
    exec: Option<&dyn SubqueryExec>,
) -> CoreResult<Json> {
    // Short-circuit logical operators.
    match op {
        BinaryOp::And => {
            let left = eval_scalar(left, env, params, exec)?;
            if !truthy(&left) {
                return Ok(Json::Bool(false));
            }
            let right = eval_scalar(right, env, params, exec)?;
            return Ok(Json::Bool(truthy(&right)));
        }
        BinaryOp::Or => {
            let left = eval_scalar(left, env, params, exec)?;
            if truthy(&left) {
                return Ok(Json::Bool(true));
            }
            let right = eval_scalar(right, env, params, exec)?;
            return Ok(Json::Bool(truthy(&right)));
        }
        _ => {}
    }

    // IN takes its right side as a whole collection, so a subquery there
    // is not scalar.
    let left_value = eval_scalar(left, env, params, exec)?;
    let right_value = if op == BinaryOp::In {
        eval(right, env, params, exec)?
    } else {
        eval_scalar(right, env, params, exec)?
    };

    Ok(match op {
        BinaryOp::Eq => Json::Bool(left_value == right_value),
        BinaryOp::Neq => Json::Bool(left_value != right_value),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            match cmp_json(&left_value, &right_value) {
                Some(ordering) => Json::Bool(match op {
                    BinaryOp::Lt => ordering == Ordering::Less,
                    BinaryOp::Le => ordering != Ordering::Greater,
                    BinaryOp::Gt => ordering == Ordering::Greater,
                    BinaryOp::Ge => ordering != Ordering::Less,
                    _ => unreachable!(),
                }),
                None => Json::Bool(false),
            }
        }
        BinaryOp::In => match &right_value {
            Json::Array(items) => Json::Bool(items.contains(&left_value)),
            Json::String(s) => match &left_value {
                Json::String(needle) => Json::Bool(s.contains(needle.as_str())),
                _ => Json::Bool(false),
            },
            _ => Json::Bool(false),
        },
        BinaryOp::Add => match (&left_value, &right_value) {
            (Json::String(a), Json::String(b)) => Json::String(format!("{a}{b}")),
            _ => numeric(left_value, right_value, |a, b| a + b),
        },
        BinaryOp::Sub => numeric(left_value, right_value, |a, b| a - b),
        BinaryOp::Mul => numeric(left_value, right_value, |a, b| a * b),
        BinaryOp::Div => match (as_f64(&left_value), as_f64(&right_value)) {
            (Some(_), Some(b)) if b == 0.0 => Json::Null,
            (Some(a), Some(b)) => number(a / b),
            _ => Json::Null,
        },
        BinaryOp::Mod => match (as_f64(&left_value), as_f64(&right_value)) {
            (Some(_), Some(b)) if b == 0.0 => Json::Null,
            (Some(a), Some(b)) => number(a % b),
            _ => Json::Null,
        },
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    })
}

fn eval_call(
    name: &str,
    args: &[Expr],
    env: &Env,
    params: &HashMap<String, Json>,
    exec: Option<&dyn SubqueryExec>,
) -> CoreResult<Json> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval(arg, env, params, exec)?);
    }

    Ok(match name {
        "SIMILARITY" => {
            let (Some(a), Some(b)) = (
                values.first().and_then(as_float_vec),
                values.get(1).and_then(as_float_vec),
            ) else {
                return Ok(Json::Null);
            };
            number(cosine_similarity(&a, &b))
        }
        "PROXIMITY" => {
            let (Some(a), Some(b)) = (
                values.first().and_then(as_point),
                values.get(1).and_then(as_point),
            ) else {
                return Ok(Json::Null);
            };
            let dx = a.0 - b.0;
            let dy = a.1 - b.1;
            number((dx * dx + dy * dy).sqrt())
        }
        "ST_WITHIN" => {
            match (values.first().and_then(as_mbr), values.get(1).and_then(as_mbr)) {
                (Some(geom), Some(bbox)) => Json::Bool(geom.within(&bbox)),
                _ => Json::Bool(false),
            }
        }
        "ST_INTERSECTS" => {
            match (values.first().and_then(as_mbr), values.get(1).and_then(as_mbr)) {
                (Some(geom), Some(bbox)) => Json::Bool(geom.intersects(&bbox)),
                _ => Json::Bool(false),
            }
        }
        "FULLTEXT" => {
            let (Some(Json::String(text)), Some(Json::String(query))) =
                (values.first(), values.get(1))
            else {
                return Ok(Json::Bool(false));
            };
            let config = TokenizerConfig::default();
            let have: std::collections::HashSet<String> =
                unique_tokens(&config, text).into_iter().collect();
            let hit = unique_tokens(&config, query)
                .iter()
                .all(|token| have.contains(token));
            Json::Bool(hit)
        }
        "CONTAINS" => match (values.first(), values.get(1)) {
            (Some(Json::String(s)), Some(Json::String(needle))) => {
                Json::Bool(s.contains(needle.as_str()))
            }
            (Some(Json::Array(items)), Some(needle)) => Json::Bool(items.contains(needle)),
            _ => Json::Bool(false),
        },
        "LENGTH" => match values.first() {
            Some(Json::String(s)) => Json::Number((s.chars().count() as u64).into()),
            Some(Json::Array(items)) => Json::Number((items.len() as u64).into()),
            Some(Json::Object(map)) => Json::Number((map.len() as u64).into()),
            _ => Json::Null,
        },
        "ABS" => match values.first().and_then(as_f64) {
            Some(n) => number(n.abs()),
            None => Json::Null,
        },
        "LOWER" => match values.first() {
            Some(Json::String(s)) => Json::String(s.to_lowercase()),
            _ => Json::Null,
        },
        "UPPER" => match values.first() {
            Some(Json::String(s)) => Json::String(s.to_uppercase()),
            _ => Json::Null,
        },
        other => {
            return Err(CoreError::plan(format!("unknown function {other}()")));
        }
    })
}

/// AQL truthiness: null and false are falsy, zero and empty string too.
#[must_use]
pub fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(_) | Json::Object(_) => true,
    }
}

/// Total-ish ordering for sorting: by type rank, then value.
#[must_use]
pub fn cmp_json(a: &Json, b: &Json) -> Option<Ordering> {
    fn rank(value: &Json) -> u8 {
        match value {
            Json::Null => 0,
            Json::Bool(_) => 1,
            Json::Number(_) => 2,
            Json::String(_) => 3,
            Json::Array(_) => 4,
            Json::Object(_) => 5,
        }
    }

    if rank(a) != rank(b) {
        return Some(rank(a).cmp(&rank(b)));
    }
    match (a, b) {
        (Json::Null, Json::Null) => Some(Ordering::Equal),
        (Json::Bool(x), Json::Bool(y)) => Some(x.cmp(y)),
        (Json::Number(x), Json::Number(y)) => {
            Some(x.as_f64()?.total_cmp(&y.as_f64()?))
        }
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        (Json::Array(x), Json::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match cmp_json(xi, yi)? {
                    Ordering::Equal => {}
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        _ => Some(Ordering::Equal),
    }
}

fn as_f64(value: &Json) -> Option<f64> {
    value.as_f64()
}

fn number(n: f64) -> Json {
    serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
}

fn numeric(a: Json, b: Json, op: impl Fn(f64, f64) -> f64) -> Json {
    match (as_f64(&a), as_f64(&b)) {
        (Some(a), Some(b)) => number(op(a, b)),
        _ => Json::Null,
    }
}

fn as_float_vec(value: &Json) -> Option<Vec<f64>> {
    let Json::Array(items) = value else {
        return None;
    };
    items.iter().map(Json::as_f64).collect()
}

/// Cosine similarity over raw (unnormalized) vectors.
#[must_use]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Reads a `{"$bytes": ...}` marker back into raw bytes.
#[must_use]
pub fn as_entity_bytes(value: &Json) -> Option<Vec<u8>> {
    let marker = value.get("$bytes")?.as_str()?;
    BASE64.decode(marker).ok()
}

/// Interprets a value as a bounding box or geometry extent.
///
/// Accepts `[min_x, min_y, max_x, max_y]` arrays and EWKB `$bytes`
/// markers (which contribute their MBR).
#[must_use]
pub fn as_mbr(value: &Json) -> Option<Mbr> {
    if let Some(bytes) = as_entity_bytes(value) {
        let geometry = parse_ewkb(&bytes).ok()?;
        return geometry.mbr().ok();
    }
    let Json::Array(items) = value else {
        return None;
    };
    if items.len() != 4 {
        return None;
    }
    let mut coords = [0.0f64; 4];
    for (slot, item) in coords.iter_mut().zip(items) {
        *slot = item.as_f64()?;
    }
    Some(Mbr {
        min_x: coords[0],
        min_y: coords[1],
        max_x: coords[2],
        max_y: coords[3],
    })
}

/// Interprets a value as a point: `[x, y]` or a geometry's centroid.
#[must_use]
pub fn as_point(value: &Json) -> Option<(f64, f64)> {
    if let Some(bytes) = as_entity_bytes(value) {
        let geometry = parse_ewkb(&bytes).ok()?;
        return geometry.centroid().ok();
    }
    let Json::Array(items) = value else {
        return None;
    };
    if items.len() < 2 {
        return None;
    }
    Some((items[0].as_f64()?, items[1].as_f64()?))
}
