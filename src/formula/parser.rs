//! Formula string → post-aggregation tree.
//!
//! Parsing is delegated to sqlparser's expression parser. Indicator IDs are
//! first swapped for neutral placeholder identifiers so that IDs colliding with
//! SQL keywords (`year`, `count`, `interval`, ...) still parse as plain names.

use regex::Captures;
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use super::{FormulaError, FormulaResult, TOKEN_PATTERN};
use crate::druid::{ArithmeticOp, PostAggExpr};

/// Prefix used for token substitution
const FIELD_PREFIX: &str = "__FIELD_";

/// Parse an infix arithmetic formula (`+ - * /`, unary minus, parentheses and
/// numeric constants) into a [`PostAggExpr`].
pub fn parse_formula(formula: &str) -> FormulaResult<PostAggExpr> {
    let mut fields: Vec<String> = Vec::new();
    let substituted = TOKEN_PATTERN
        .replace_all(formula, |caps: &Captures| {
            let token = &caps[0];
            let index = match fields.iter().position(|f| f == token) {
                Some(index) => index,
                None => {
                    fields.push(token.to_string());
                    fields.len() - 1
                }
            };
            format!("{}{}", FIELD_PREFIX, index)
        })
        .into_owned();

    let syntax = |message: String| FormulaError::Syntax {
        formula: formula.to_string(),
        message,
    };

    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(&substituted)
        .map_err(|e| syntax(e.to_string()))?;
    let expr = parser.parse_expr().map_err(|e| syntax(e.to_string()))?;

    let trailing = parser.peek_token().token;
    if trailing != Token::EOF {
        return Err(syntax(format!("unexpected trailing input '{}'", trailing)));
    }

    Converter {
        formula,
        fields: &fields,
    }
    .convert(&expr)
}

struct Converter<'a> {
    formula: &'a str,
    fields: &'a [String],
}

impl Converter<'_> {
    fn convert(&self, expr: &Expr) -> FormulaResult<PostAggExpr> {
        match expr {
            Expr::Identifier(ident) => self.resolve_field(&ident.value),
            Expr::Value(Value::Number(number, _)) => number
                .parse::<f64>()
                .map(PostAggExpr::Constant)
                .map_err(|_| self.unsupported(number)),
            Expr::Nested(inner) => self.convert(inner),
            Expr::UnaryOp {
                op: UnaryOperator::Plus,
                expr,
            } => self.convert(expr),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match self.convert(expr)? {
                PostAggExpr::Constant(value) => Ok(PostAggExpr::Constant(-value)),
                other => Ok(PostAggExpr::arithmetic(
                    ArithmeticOp::Multiply,
                    [PostAggExpr::Constant(-1.0), other],
                )),
            },
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Plus => ArithmeticOp::Add,
                    BinaryOperator::Minus => ArithmeticOp::Subtract,
                    BinaryOperator::Multiply => ArithmeticOp::Multiply,
                    BinaryOperator::Divide => ArithmeticOp::Divide,
                    other => return Err(self.unsupported(&other.to_string())),
                };
                let left = self.convert(left)?;
                let right = self.convert(right)?;
                if op.is_associative() {
                    Ok(PostAggExpr::arithmetic(op, [left, right]))
                } else {
                    Ok(PostAggExpr::Arithmetic {
                        op,
                        fields: vec![left, right],
                    })
                }
            }
            other => Err(self.unsupported(&self.restore(&other.to_string()))),
        }
    }

    fn resolve_field(&self, name: &str) -> FormulaResult<PostAggExpr> {
        name.strip_prefix(FIELD_PREFIX)
            .and_then(|index| index.parse::<usize>().ok())
            .and_then(|index| self.fields.get(index))
            .map(|field| PostAggExpr::FieldAccess(field.clone()))
            .ok_or_else(|| self.unsupported(name))
    }

    /// Put original token names back into a rendered fragment for error messages.
    fn restore(&self, fragment: &str) -> String {
        let mut restored = fragment.to_string();
        // Highest index first so `__FIELD_1` never clobbers `__FIELD_10`.
        for (index, field) in self.fields.iter().enumerate().rev() {
            restored = restored.replace(&format!("{}{}", FIELD_PREFIX, index), field);
        }
        restored
    }

    fn unsupported(&self, construct: &str) -> FormulaError {
        FormulaError::Unsupported {
            formula: self.formula.to_string(),
            construct: construct.to_string(),
        }
    }
}
