use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default)]
    values: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of resources by their labels.
///
/// An empty selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(String);

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().map_or(true, |m| m.is_empty())
            && self.match_expressions.as_ref().map_or(true, |e| e.is_empty())
    }

    pub fn matches(&self, labels: &Map) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

/// Parses the label selector syntax used in list query parameters, e.g.
/// `env=prod,tier!=cache,region in (us-east, us-west),!deprecated`.
impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let exprs = split_requirements(s)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Expressions, _>>()?;
        Ok(Self::from_expressions(exprs))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

/// Splits a selector on the commas that are not enclosed in a value set.
fn split_requirements(s: &str) -> Result<Vec<&str>, ParseError> {
    let mut reqs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ParseError(format!("unbalanced ')' in {s:?}")))?;
            }
            ',' if depth == 0 => {
                reqs.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError(format!("unbalanced '(' in {s:?}")));
    }
    reqs.push(&s[start..]);

    Ok(reqs
        .into_iter()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .collect())
}

fn parse_requirement(req: &str) -> Result<Expression, ParseError> {
    if let Some(key) = req.strip_prefix('!') {
        return Expression::new(key.trim(), Operator::DoesNotExist, None::<&str>);
    }

    if let Some((key, value)) = req.split_once("!=") {
        return Expression::new(key.trim(), Operator::NotIn, Some(value.trim()));
    }

    if let Some((key, value)) = req.split_once('=') {
        // Accept both `=` and `==`.
        let value = value.strip_prefix('=').unwrap_or(value);
        return Expression::new(key.trim(), Operator::In, Some(value.trim()));
    }

    if let Some((key, rest)) = req.split_once(char::is_whitespace) {
        let rest = rest.trim_start();
        let (operator, values) = if let Some(values) = rest.strip_prefix("notin") {
            (Operator::NotIn, values)
        } else if let Some(values) = rest.strip_prefix("in") {
            (Operator::In, values)
        } else {
            return Err(ParseError(format!("unknown operator in {req:?}")));
        };
        let values = values
            .trim()
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| ParseError(format!("expected a parenthesized value set in {req:?}")))?;
        let values = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>();
        if values.is_empty() {
            return Err(ParseError(format!("empty value set in {req:?}")));
        }
        return Expression::new(key, operator, values);
    }

    Expression::new(req, Operator::Exists, None::<&str>)
}

// === Expression ===

impl Expression {
    fn new(
        key: &str,
        operator: Operator,
        values: impl IntoIterator<Item = impl ToString>,
    ) -> Result<Self, ParseError> {
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError(format!("invalid label key {key:?}")));
        }
        Ok(Self {
            key: key.to_string(),
            operator,
            values: values.into_iter().map(|v| v.to_string()).collect(),
        })
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map_or(false, |v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}
