//! Label-selector style expressions, used both for broker catalog restrictions and for store
//! list queries.
//!
//! An expression is a comma separated conjunction of predicates. Each predicate is one of
//! `key==value`, `key=value`, `key!=value`, `key in (a,b,c)` or `key notin (a,b,c)`.
//! A predicate on a missing field only matches for `!=` and `notin`.
use crate::resource::{ServiceClass, ServicePlan};

use lazy_static::lazy_static;
use regex::Regex;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

lazy_static! {
    static ref SET_PREDICATE: Regex =
        Regex::new(r"^([A-Za-z0-9_./-]+)\s+(in|notin)\s*\(([^()]*)\)$").unwrap();
    static ref EQ_PREDICATE: Regex =
        Regex::new(r"^([A-Za-z0-9_./-]+)\s*(==|!=|=)\s*([^\s,()]*)$").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectorParseError {
    EmptyPredicate(String),
    Malformed(String),
    EmptyValueSet(String),
    UnbalancedParens(String),
    UnknownField(String),
}

impl Display for SelectorParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SelectorParseError::EmptyPredicate(expr) => {
                write!(f, "empty predicate in selector: {:?}", expr)
            }
            SelectorParseError::Malformed(pred) => write!(f, "malformed predicate: {:?}", pred),
            SelectorParseError::EmptyValueSet(pred) => {
                write!(f, "set predicate has no values: {:?}", pred)
            }
            SelectorParseError::UnbalancedParens(expr) => {
                write!(f, "unbalanced parentheses in selector: {:?}", expr)
            }
            SelectorParseError::UnknownField(field) => {
                write!(f, "unsupported field in selector: {:?}", field)
            }
        }
    }
}

impl std::error::Error for SelectorParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    fn matches(&self, fields: &dyn Fields) -> bool {
        let actual = fields.field(&self.key);
        match (self.operator, actual) {
            (Operator::Equals, Some(v)) | (Operator::In, Some(v)) => {
                self.values.iter().any(|expected| *expected == v)
            }
            (Operator::NotEquals, Some(v)) | (Operator::NotIn, Some(v)) => {
                self.values.iter().all(|expected| *expected != v)
            }
            (Operator::Equals, None) | (Operator::In, None) => false,
            (Operator::NotEquals, None) | (Operator::NotIn, None) => true,
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}=={}", self.key, self.values.join("")),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values.join("")),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
        }
    }
}

/// Something selector keys can be looked up in
pub trait Fields {
    fn field(&self, key: &str) -> Option<String>;
}

impl Fields for BTreeMap<String, String> {
    fn field(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// A selector that matches everything
    pub fn everything() -> Selector {
        Selector::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn parse(input: &str) -> Result<Selector, SelectorParseError> {
        let mut requirements = Vec::new();
        if input.trim().is_empty() {
            return Ok(Selector { requirements });
        }
        for predicate in split_top_level(input)? {
            let predicate = predicate.trim();
            if predicate.is_empty() {
                return Err(SelectorParseError::EmptyPredicate(input.to_owned()));
            }
            requirements.push(parse_predicate(predicate)?);
        }
        Ok(Selector { requirements })
    }

    /// The conjunction of several expressions
    pub fn parse_all<S: AsRef<str>>(inputs: &[S]) -> Result<Selector, SelectorParseError> {
        let mut combined = Selector::everything();
        for input in inputs {
            combined.requirements.extend(Selector::parse(input.as_ref())?.requirements);
        }
        Ok(combined)
    }

    pub fn matches(&self, fields: &dyn Fields) -> bool {
        self.requirements.iter().all(|r| r.matches(fields))
    }

    /// Rewrites every key through `normalize`, which returns `None` for unsupported keys
    pub fn normalize_keys<F>(self, normalize: F) -> Result<Selector, SelectorParseError>
    where
        F: Fn(&str) -> Option<&'static str>,
    {
        let mut requirements = Vec::with_capacity(self.requirements.len());
        for mut req in self.requirements {
            match normalize(req.key.as_str()) {
                Some(key) => req.key = key.to_owned(),
                None => return Err(SelectorParseError::UnknownField(req.key)),
            }
            requirements.push(req);
        }
        Ok(Selector { requirements })
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", req)?;
        }
        Ok(())
    }
}

fn split_top_level(input: &str) -> Result<Vec<&str>, SelectorParseError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SelectorParseError::UnbalancedParens(input.to_owned()));
                }
            }
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorParseError::UnbalancedParens(input.to_owned()));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_predicate(predicate: &str) -> Result<Requirement, SelectorParseError> {
    if let Some(caps) = SET_PREDICATE.captures(predicate) {
        let operator = if &caps[2] == "in" {
            Operator::In
        } else {
            Operator::NotIn
        };
        let values: Vec<String> = caps[3]
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .collect();
        if values.is_empty() {
            return Err(SelectorParseError::EmptyValueSet(predicate.to_owned()));
        }
        return Ok(Requirement {
            key: caps[1].to_owned(),
            operator,
            values,
        });
    }
    if let Some(caps) = EQ_PREDICATE.captures(predicate) {
        let operator = if &caps[2] == "!=" {
            Operator::NotEquals
        } else {
            Operator::Equals
        };
        return Ok(Requirement {
            key: caps[1].to_owned(),
            operator,
            values: vec![caps[3].to_owned()],
        });
    }
    Err(SelectorParseError::Malformed(predicate.to_owned()))
}

pub const FIELD_NAME: &str = "name";
pub const FIELD_EXTERNAL_NAME: &str = "spec.externalName";
pub const FIELD_EXTERNAL_ID: &str = "spec.externalID";
pub const FIELD_SERVICE_CLASS_REF: &str = "spec.serviceClassRef.name";

fn class_field(key: &str) -> Option<&'static str> {
    match key {
        "name" => Some(FIELD_NAME),
        "spec.externalName" | "externalName" => Some(FIELD_EXTERNAL_NAME),
        "spec.externalID" | "externalID" => Some(FIELD_EXTERNAL_ID),
        _ => None,
    }
}

fn plan_field(key: &str) -> Option<&'static str> {
    match key {
        "spec.serviceClassRef.name"
        | "serviceClassRef.name"
        | "spec.clusterServiceClass.name"
        | "spec.serviceClass.name" => Some(FIELD_SERVICE_CLASS_REF),
        other => class_field(other),
    }
}

/// Parses the `serviceClass` restrictions of a broker. Keys are normalized to the canonical
/// field names and unknown keys are rejected.
pub fn class_restrictions<S: AsRef<str>>(exprs: &[S]) -> Result<Selector, SelectorParseError> {
    Selector::parse_all(exprs)?.normalize_keys(class_field)
}

pub fn plan_restrictions<S: AsRef<str>>(exprs: &[S]) -> Result<Selector, SelectorParseError> {
    Selector::parse_all(exprs)?.normalize_keys(plan_field)
}

pub fn class_fields(class: &ServiceClass) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert(FIELD_NAME.to_owned(), class.metadata.name.clone());
    fields.insert(FIELD_EXTERNAL_NAME.to_owned(), class.spec.external_name.clone());
    fields.insert(FIELD_EXTERNAL_ID.to_owned(), class.spec.external_id.clone());
    fields
}

pub fn plan_fields(plan: &ServicePlan) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert(FIELD_NAME.to_owned(), plan.metadata.name.clone());
    fields.insert(FIELD_EXTERNAL_NAME.to_owned(), plan.spec.external_name.clone());
    fields.insert(FIELD_EXTERNAL_ID.to_owned(), plan.spec.external_id.clone());
    fields.insert(
        FIELD_SERVICE_CLASS_REF.to_owned(),
        plan.spec.service_class_ref.name.clone(),
    );
    fields
}

#[cfg(test)]
mod test {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equality_predicates() {
        let f = fields(&[("name", "foo")]);
        assert!(Selector::parse("name==foo").unwrap().matches(&f));
        assert!(Selector::parse("name=foo").unwrap().matches(&f));
        assert!(!Selector::parse("name!=foo").unwrap().matches(&f));
        assert!(Selector::parse("name != bar").unwrap().matches(&f));
    }

    #[test]
    fn set_predicates_and_conjunction() {
        let f = fields(&[("spec.externalName", "b"), ("name", "x")]);
        let sel = Selector::parse("spec.externalName in (a, b, c),name notin (y,z)").unwrap();
        assert_eq!(2, sel.requirements().len());
        assert!(sel.matches(&f));
        assert!(!Selector::parse("spec.externalName in (a,b),name==y")
            .unwrap()
            .matches(&f));
        assert!(!Selector::parse("spec.externalName notin (b)").unwrap().matches(&f));
    }

    #[test]
    fn missing_fields_only_match_negative_predicates() {
        let f = fields(&[]);
        assert!(!Selector::parse("name==foo").unwrap().matches(&f));
        assert!(!Selector::parse("name in (foo)").unwrap().matches(&f));
        assert!(Selector::parse("name!=foo").unwrap().matches(&f));
        assert!(Selector::parse("name notin (foo)").unwrap().matches(&f));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = Selector::parse("  ").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&fields(&[("a", "b")])));
    }

    #[test]
    fn malformed_predicates_are_rejected() {
        assert!(matches!(
            Selector::parse("name"),
            Err(SelectorParseError::Malformed(_))
        ));
        assert!(matches!(
            Selector::parse("name==a,"),
            Err(SelectorParseError::EmptyPredicate(_))
        ));
        assert!(matches!(
            Selector::parse("name in (a,b"),
            Err(SelectorParseError::UnbalancedParens(_))
        ));
        assert!(matches!(
            Selector::parse("name in ()"),
            Err(SelectorParseError::EmptyValueSet(_))
        ));
        assert!(Selector::parse("name >< a").is_err());
    }

    #[test]
    fn catalog_restriction_keys_are_normalized() {
        let sel = class_restrictions(&["externalName==foo", "spec.externalID!=bar"]).unwrap();
        assert_eq!(
            "spec.externalName==foo,spec.externalID!=bar",
            sel.to_string()
        );

        let plans = plan_restrictions(&["spec.clusterServiceClass.name in (a,b)"]).unwrap();
        assert_eq!(FIELD_SERVICE_CLASS_REF, plans.requirements()[0].key);

        assert_eq!(
            Err(SelectorParseError::UnknownField("spec.free".to_owned())),
            class_restrictions(&["spec.free==true"])
        );
        // class selectors can't reference the plan-only field
        assert!(class_restrictions(&["serviceClassRef.name==x"]).is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let sel = Selector::parse("a==1,b notin (x,y)").unwrap();
        assert_eq!(sel, Selector::parse(&sel.to_string()).unwrap());
    }
}
