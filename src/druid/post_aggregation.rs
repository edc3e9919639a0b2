//! Post-aggregation expression trees.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{json, Value};

/// Arithmetic operator of an `arithmetic` post-aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Subtract => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
        }
    }

    /// `+` and `*` may take any number of operands.
    pub fn is_associative(self) -> bool {
        matches!(self, ArithmeticOp::Add | ArithmeticOp::Multiply)
    }
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A post-aggregation computed from already-resolved aggregation results.
#[derive(Debug, Clone, PartialEq)]
pub enum PostAggExpr {
    /// Reference to an aggregation or earlier post-aggregation key.
    FieldAccess(String),

    Constant(f64),

    /// Left fold of `op` over `fields`.
    Arithmetic {
        op: ArithmeticOp,
        fields: Vec<PostAggExpr>,
    },

    /// Druid expression-language string, evaluated by the engine as-is.
    Expression(String),
}

impl PostAggExpr {
    pub fn field(key: impl Into<String>) -> Self {
        PostAggExpr::FieldAccess(key.into())
    }

    /// Build an arithmetic node, splicing nested nodes of the same associative
    /// operator into a single n-ary node.
    pub fn arithmetic(op: ArithmeticOp, operands: impl IntoIterator<Item = PostAggExpr>) -> Self {
        let mut fields = Vec::new();
        for operand in operands {
            match operand {
                PostAggExpr::Arithmetic {
                    op: inner_op,
                    fields: inner,
                } if inner_op == op && op.is_associative() => fields.extend(inner),
                other => fields.push(other),
            }
        }
        PostAggExpr::Arithmetic { op, fields }
    }

    pub fn divide(numerator: PostAggExpr, denominator: PostAggExpr) -> Self {
        PostAggExpr::Arithmetic {
            op: ArithmeticOp::Divide,
            fields: vec![numerator, denominator],
        }
    }

    /// Keys referenced through `fieldAccess` nodes.
    ///
    /// `Expression` nodes are opaque here; callers that need their references
    /// tokenize the expression string.
    pub fn field_refs(&self) -> BTreeSet<&str> {
        let mut refs = BTreeSet::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut BTreeSet<&'a str>) {
        match self {
            PostAggExpr::FieldAccess(key) => {
                refs.insert(key.as_str());
            }
            PostAggExpr::Arithmetic { fields, .. } => {
                for field in fields {
                    field.collect_refs(refs);
                }
            }
            PostAggExpr::Constant(_) | PostAggExpr::Expression(_) => {}
        }
    }

    /// Render as Druid post-aggregator JSON. Only the root carries a name.
    pub fn to_druid_json(&self, name: Option<&str>) -> Value {
        let mut object = match self {
            PostAggExpr::FieldAccess(key) => json!({
                "type": "fieldAccess",
                "fieldName": key,
            }),
            PostAggExpr::Constant(value) => json!({
                "type": "constant",
                "value": value,
            }),
            PostAggExpr::Arithmetic { op, fields } => json!({
                "type": "arithmetic",
                "fn": op.symbol(),
                "fields": fields.iter().map(|f| f.to_druid_json(None)).collect::<Vec<_>>(),
            }),
            PostAggExpr::Expression(expression) => json!({
                "type": "expression",
                "expression": expression,
            }),
        };
        if let (Some(name), Value::Object(map)) = (name, &mut object) {
            map.insert("name".to_string(), Value::String(name.to_string()));
        }
        object
    }
}

impl fmt::Display for PostAggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostAggExpr::FieldAccess(key) => f.write_str(key),
            PostAggExpr::Constant(value) => write!(f, "{}", value),
            PostAggExpr::Arithmetic { op, fields } => {
                f.write_str("(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op)?;
                    }
                    write!(f, "{}", field)?;
                }
                f.write_str(")")
            }
            PostAggExpr::Expression(expression) => f.write_str(expression),
        }
    }
}
