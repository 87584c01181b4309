//! Constraint expressions checked against freshly cracked elements.
//!
//! The cracker is agnostic to the expression language; it hands the
//! expression and the element to a [`ConstraintEvaluator`]. A `false` result
//! turns into a cracking failure, which lets selectors and arrays reject an
//! alternative on content rather than on shape.
//!
//! [`SimpleEvaluator`] understands `value <op> <literal>` where the literal is
//! a decimal or `0x` hex integer or a double-quoted string.

use crate::error::{Error, Result};
use crate::model::Element;
use std::cmp::Ordering;
use std::fmt::Debug;

/// Evaluates constraint expressions
pub trait ConstraintEvaluator: Debug + Send + Sync {
    /// Returns whether `element` satisfies `expression`
    fn evaluate(&self, expression: &str, element: &Element) -> Result<bool>;
}

/// Comparisons of an element's value against a literal
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Lt => ordering == Ordering::Less,
            Op::Le => ordering != Ordering::Greater,
            Op::Gt => ordering == Ordering::Greater,
            Op::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Literal {
    Int(i64),
    Text(Vec<u8>),
}

fn parse(expression: &str) -> Result<(Op, Literal)> {
    let rest = expression
        .trim()
        .strip_prefix("value")
        .ok_or_else(|| Error::constraint(expression, "expected 'value' on the left"))?
        .trim_start();

    // Two-character operators first so `<=` isn't read as `<`
    let (op, rest) = [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("<", Op::Lt),
        (">", Op::Gt),
    ]
    .iter()
    .find_map(|(token, op)| rest.strip_prefix(*token).map(|r| (*op, r.trim())))
    .ok_or_else(|| Error::constraint(expression, "missing comparison operator"))?;

    let literal = if let Some(text) = rest.strip_prefix('"') {
        let text = text
            .strip_suffix('"')
            .ok_or_else(|| Error::constraint(expression, "unterminated string literal"))?;
        Literal::Text(text.as_bytes().to_vec())
    } else if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
            .map(Literal::Int)
            .map_err(|e| Error::constraint(expression, e.to_string()))?
    } else {
        rest.parse()
            .map(Literal::Int)
            .map_err(|e| Error::constraint(expression, e.to_string()))?
    };

    Ok((op, literal))
}

impl ConstraintEvaluator for SimpleEvaluator {
    fn evaluate(&self, expression: &str, element: &Element) -> Result<bool> {
        let (op, literal) = parse(expression)?;

        let ordering = match literal {
            Literal::Int(expected) => {
                let Some(actual) = element.integer() else {
                    return Ok(false);
                };
                actual.cmp(&expected)
            }
            Literal::Text(expected) => {
                let Some(value) = element.value() else {
                    return Ok(false);
                };
                let data = &value.data[..];
                let actual = data.strip_suffix(&[0u8]).unwrap_or(data);
                actual.cmp(&expected[..])
            }
        };

        Ok(op.holds(ordering))
    }
}
