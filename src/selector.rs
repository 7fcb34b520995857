//! Attribute queries over the queue catalog.
//!
//! A selector is an OR of clauses separated by `|`. Each clause is an AND
//! of terms separated by `&`. A term compares one worker attribute with a
//! `,`-separated value list using `=` (any value matches) or `!=` (no value
//! matches):
//!
//! ```text
//! feature_category=continuous_integration&urgency=high|resource_boundary=memory,cpu
//! ```
//!
//! The bare selector `*` matches every worker.

use std::str::FromStr;

use crate::catalog::WorkerMetadata;
use crate::errors::QueryError;

pub const WILDCARD_MATCH: &str = "*";

const OR_OPERATOR: char = '|';
const AND_OPERATOR: char = '&';
const CONCATENATE_OPERATOR: char = ',';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    FeatureCategory,
    HasExternalDependencies,
    Name,
    ResourceBoundary,
    Tags,
    Urgency,
    WorkerName,
}

impl FromStr for Field {
    type Err = QueryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "feature_category" => Ok(Field::FeatureCategory),
            "has_external_dependencies" => Ok(Field::HasExternalDependencies),
            "name" => Ok(Field::Name),
            "resource_boundary" => Ok(Field::ResourceBoundary),
            "tags" => Ok(Field::Tags),
            "urgency" => Ok(Field::Urgency),
            "worker_name" => Ok(Field::WorkerName),
            other => Err(QueryError::UnknownPredicate(other.to_string())),
        }
    }
}

impl Field {
    fn normalize(self, value: &str) -> String {
        match self {
            Field::HasExternalDependencies => (value == "true").to_string(),
            _ => value.to_string(),
        }
    }

    fn values_of(self, worker: &WorkerMetadata) -> Vec<String> {
        match self {
            Field::FeatureCategory => worker.feature_category.iter().cloned().collect(),
            Field::HasExternalDependencies => vec![worker.has_external_dependencies.to_string()],
            Field::Name => vec![worker.name.clone()],
            Field::ResourceBoundary => worker.resource_boundary.iter().cloned().collect(),
            Field::Tags => worker.tags.clone(),
            Field::Urgency => worker.urgency.iter().cloned().collect(),
            Field::WorkerName => worker.worker_name.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub field: Field,
    pub negated: bool,
    pub values: Vec<String>,
}

impl Term {
    fn matches(&self, worker: &WorkerMetadata) -> bool {
        let attribute = self.field.values_of(worker);
        let intersects = self.values.iter().any(|value| attribute.contains(value));
        intersects != self.negated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Wildcard,
    /// Outer list is OR, inner list is AND.
    AnyOf(Vec<Vec<Term>>),
}

impl Selector {
    pub fn parse(query: &str) -> Result<Self, QueryError> {
        if query.trim() == WILDCARD_MATCH {
            return Ok(Selector::Wildcard);
        }

        let clauses = split_terms(query, OR_OPERATOR)
            .into_iter()
            .map(|clause| {
                let terms = split_terms(clause, AND_OPERATOR)
                    .into_iter()
                    .map(parse_term)
                    .collect::<Result<Vec<_>, _>>()?;
                if terms.is_empty() {
                    return Err(QueryError::InvalidTerm(clause.to_string()));
                }
                Ok(terms)
            })
            .collect::<Result<Vec<_>, _>>()?;

        if clauses.is_empty() {
            return Err(QueryError::InvalidTerm(query.to_string()));
        }
        Ok(Selector::AnyOf(clauses))
    }

    pub fn matches(&self, worker: &WorkerMetadata) -> bool {
        match self {
            Selector::Wildcard => true,
            Selector::AnyOf(clauses) => clauses
                .iter()
                .any(|terms| terms.iter().all(|term| term.matches(worker))),
        }
    }

    pub fn select<'a>(&self, workers: impl IntoIterator<Item = &'a WorkerMetadata>) -> Vec<String> {
        workers
            .into_iter()
            .filter(|worker| self.matches(worker))
            .map(|worker| worker.name.clone())
            .collect()
    }
}

// Trailing separators are tolerated; empty pieces elsewhere are not.
fn split_terms(input: &str, separator: char) -> Vec<&str> {
    let mut pieces: Vec<&str> = input.split(separator).collect();
    while pieces.last().is_some_and(|piece| piece.is_empty()) {
        pieces.pop();
    }
    pieces
}

fn parse_term(term: &str) -> Result<Term, QueryError> {
    let invalid = || QueryError::InvalidTerm(term.to_string());

    let lhs_end = term
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .ok_or_else(invalid)?;
    let (lhs, rest) = term.split_at(lhs_end);
    if lhs.is_empty() {
        return Err(invalid());
    }

    let op_end = rest
        .find(|ch: char| !matches!(ch, '!' | '=' | '<' | '>' | '~'))
        .unwrap_or(rest.len());
    let (op, rhs) = rest.split_at(op_end);
    let negated = match op {
        "=" => false,
        "!=" => true,
        _ => return Err(invalid()),
    };

    let valid_rhs = !rhs.is_empty()
        && rhs
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | ':' | CONCATENATE_OPERATOR));
    if !valid_rhs {
        return Err(invalid());
    }

    let field: Field = lhs.parse()?;
    let values = rhs
        .split(CONCATENATE_OPERATOR)
        .filter(|value| !value.is_empty())
        .map(|value| field.normalize(value))
        .collect();

    Ok(Term {
        field,
        negated,
        values,
    })
}
