//! Query evaluation for the in-memory service.
//!
//! Supports the subset of the service's SQL dialect that tests and offline development
//! need: `SELECT * FROM <alias>` with an optional `WHERE` clause of comparisons joined by
//! `AND`. Each comparison is `<alias>.<field>[.<field>...] <op> <operand>`, where `op` is one
//! of `=`, `!=`, `<`, `<=`, `>`, `>=` and the operand is a `@parameter` or a JSON literal.

use serde_json::Value;
use std::{cmp::Ordering, collections::HashMap};

use doclink_core::query::QuerySpec;

/// Comparable view of a JSON value. Numbers are normalized to f64.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    String(&'a str),
    Other(&'a Value),
}

impl<'a> From<&'a Value> for Comparable<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Null => Comparable::Null,
            Value::Bool(value) => Comparable::Bool(*value),
            Value::Number(value) => value.as_f64().map_or(Comparable::Null, Comparable::Number),
            Value::String(value) => Comparable::String(value),
            other => Comparable::Other(other),
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Other(a), Comparable::Other(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
struct Comparison {
    field: Vec<String>,
    op: Op,
    operand: Value,
}

/// A parsed query: a conjunction of comparisons. An empty conjunction matches everything.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Filter {
    comparisons: Vec<Comparison>,
}

const OPERATORS: [(&str, Op); 6] = [
    ("!=", Op::Ne),
    ("<=", Op::Le),
    (">=", Op::Ge),
    ("=", Op::Eq),
    ("<", Op::Lt),
    (">", Op::Gt),
];

/// Finds `keyword` as a whole word, ignoring case.
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let upper = text.to_ascii_uppercase();
    let keyword = format!(" {keyword} ");

    upper.find(&keyword).map(|index| index + 1)
}

impl Filter {
    /// Parses `spec`, resolving its parameters.
    pub(crate) fn parse(spec: &QuerySpec) -> Result<Self, String> {
        let text = spec.query.trim();
        let upper = text.to_ascii_uppercase();

        let rest = upper
            .strip_prefix("SELECT * FROM ")
            .map(|_| text["SELECT * FROM ".len()..].trim())
            .ok_or_else(|| format!("unsupported query: {text}"))?;

        let (source, clause) = match find_keyword(rest, "WHERE") {
            Some(index) => (rest[..index].trim(), Some(rest[index + "WHERE".len()..].trim())),
            None => (rest.trim(), None),
        };
        // `root`, `root r` and `root AS r` all name the alias last.
        let alias = source
            .split_whitespace()
            .last()
            .ok_or_else(|| "query has no source".to_string())?;

        let parameters: HashMap<&str, &Value> = spec
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), &p.value))
            .collect();

        let mut comparisons = Vec::new();
        if let Some(mut clause) = clause {
            loop {
                let (term, remainder) = match find_keyword(clause, "AND") {
                    Some(index) => (&clause[..index], Some(&clause[index + "AND".len()..])),
                    None => (clause, None),
                };
                comparisons.push(Self::parse_comparison(term.trim(), alias, &parameters)?);

                match remainder {
                    Some(remainder) => clause = remainder,
                    None => break,
                }
            }
        }

        Ok(Self { comparisons })
    }

    fn parse_comparison(
        term: &str,
        alias: &str,
        parameters: &HashMap<&str, &Value>,
    ) -> Result<Comparison, String> {
        let (index, symbol, op) = OPERATORS
            .iter()
            .filter_map(|(symbol, op)| term.find(symbol).map(|index| (index, *symbol, *op)))
            .min_by_key(|(index, symbol, _)| (*index, std::cmp::Reverse(symbol.len())))
            .ok_or_else(|| format!("no comparison in {term:?}"))?;

        let left = term[..index].trim();
        let right = term[index + symbol.len()..].trim();

        let field: Vec<String> = left
            .strip_prefix(alias)
            .and_then(|path| path.strip_prefix('.'))
            .ok_or_else(|| format!("{left:?} does not reference {alias:?}"))?
            .split('.')
            .map(str::to_string)
            .collect();

        let operand = if right.starts_with('@') {
            (*parameters
                .get(right)
                .ok_or_else(|| format!("parameter {right} is not bound"))?)
            .clone()
        } else {
            serde_json::from_str(&right.replace('\'', "\""))
                .map_err(|e| format!("invalid literal {right:?}: {e}"))?
        };

        Ok(Comparison { field, op, operand })
    }

    pub(crate) fn matches(&self, document: &Value) -> bool {
        self.comparisons.iter().all(|comparison| {
            let Some(value) = comparison
                .field
                .iter()
                .try_fold(document, |value, key| value.get(key))
            else {
                return false;
            };

            let left = Comparable::from(value);
            let right = Comparable::from(&comparison.operand);

            match comparison.op {
                Op::Eq => left == right,
                Op::Ne => left != right,
                Op::Lt => left < right,
                Op::Le => left <= right,
                Op::Gt => left > right,
                Op::Ge => left >= right,
            }
        })
    }
}
