//! Household-deduplicated dashboard counts over merged entities.

use std::collections::{BTreeMap, BTreeSet};

use opsdash_adapters::fields;
use opsdash_core::{CategoryCount, MergedEntity, Summary};
use serde::{Deserialize, Serialize};

/// Boolean test over a [`MergedEntity`], loadable from YAML/JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Always,
    /// Entity carries this category (case-insensitive).
    Category { equals: String },
    /// Some category contains this substring (case-insensitive).
    CategoryContains { contains: String },
    Scalar { field: String, equals: String },
    NonEmpty { field: String },
    SetContains { field: String, value: String },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn set_contains(field: &str, value: &str) -> Self {
        Predicate::SetContains {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn category(equals: &str) -> Self {
        Predicate::Category {
            equals: equals.to_string(),
        }
    }

    pub fn matches(&self, entity: &MergedEntity) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Category { equals } => entity.has_category(equals),
            Predicate::CategoryContains { contains } => {
                let needle = contains.to_lowercase();
                entity
                    .categories
                    .iter()
                    .any(|c| c.to_lowercase().contains(&needle))
            }
            Predicate::Scalar { field, equals } => entity
                .scalar(field)
                .is_some_and(|v| v.eq_ignore_ascii_case(equals.trim())),
            Predicate::NonEmpty { field } => {
                entity.scalar(field).is_some() || !entity.set(field).is_empty()
            }
            Predicate::SetContains { field, value } => entity
                .set(field)
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value.trim())),
            Predicate::All { of } => of.iter().all(|p| p.matches(entity)),
            Predicate::Any { of } => of.iter().any(|p| p.matches(entity)),
            Predicate::Not { predicate } => !predicate.matches(entity),
        }
    }
}

/// One dashboard card: who is counted, and who counts as converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    pub when: Predicate,
    #[serde(default)]
    pub converted: Option<Predicate>,
}

impl CategoryRule {
    /// Prospect/converted pair for a classifier service label.
    pub fn service(name: &str, service: &str) -> Self {
        Self {
            name: name.to_string(),
            when: Predicate::set_contains(fields::PROSPECT_SERVICES, service),
            converted: Some(Predicate::set_contains(fields::CONVERTED_SERVICES, service)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Scalar identifying the household; entities without it stand alone.
    #[serde(default = "default_household_field")]
    pub household_field: String,
    #[serde(default = "default_dimension_field")]
    pub dimension_field: Option<String>,
    #[serde(default)]
    pub categories: Vec<CategoryRule>,
    #[serde(default = "default_set_fields")]
    pub set_fields: Vec<String>,
}

fn default_household_field() -> String {
    fields::CONTRACT_ID.to_string()
}

fn default_dimension_field() -> Option<String> {
    Some(fields::CONTRACT_TYPE.to_string())
}

fn default_set_fields() -> Vec<String> {
    vec![fields::COUNTRIES.to_string()]
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            household_field: default_household_field(),
            dimension_field: default_dimension_field(),
            categories: Vec::new(),
            set_fields: default_set_fields(),
        }
    }
}

/// `household:<value>` when the field is populated, else a key unique to the entity.
pub fn household_key(entity: &MergedEntity, household_field: &str) -> String {
    match entity.scalar(household_field) {
        Some(value) => format!("household:{value}"),
        None => format!("standalone:{}#{}", entity.key, entity.sequence),
    }
}

pub fn aggregate(entities: &[MergedEntity], config: &AggregatorConfig) -> Summary {
    aggregate_with(
        entities,
        &config.categories,
        |e| household_key(e, &config.household_field),
        |e| {
            config
                .dimension_field
                .as_deref()
                .and_then(|field| e.scalar(field))
                .map(ToString::to_string)
        },
        &config.set_fields,
    )
}

/// Count each household once per category.
///
/// A household is in a category when any member matches `when`; it is
/// converted when any member matches both `when` and `converted`. Dimension
/// values are collected from every matching member, so a household whose
/// members disagree on the dimension appears once under each value. Members
/// without a dimension value only contribute to the totals.
pub fn aggregate_with<H, D>(
    entities: &[MergedEntity],
    rules: &[CategoryRule],
    household_fn: H,
    dimension_fn: D,
    set_fields: &[String],
) -> Summary
where
    H: Fn(&MergedEntity) -> String,
    D: Fn(&MergedEntity) -> Option<String>,
{
    let mut households: BTreeMap<String, Vec<&MergedEntity>> = BTreeMap::new();
    for entity in entities {
        households.entry(household_fn(entity)).or_default().push(entity);
    }

    let mut categories = BTreeMap::new();
    for rule in rules {
        let mut count = CategoryCount::default();
        for members in households.values() {
            let matching = members
                .iter()
                .copied()
                .filter(|e| rule.when.matches(e))
                .collect::<Vec<&MergedEntity>>();
            if matching.is_empty() {
                continue;
            }
            count.total += 1;
            let dims = matching
                .iter()
                .filter_map(|e| dimension_fn(*e))
                .collect::<BTreeSet<_>>();
            for dim in &dims {
                *count.by_dimension.entry(dim.clone()).or_insert(0) += 1;
            }

            let converted = match &rule.converted {
                Some(predicate) => matching
                    .iter()
                    .copied()
                    .filter(|e| predicate.matches(e))
                    .collect::<Vec<&MergedEntity>>(),
                None => Vec::new(),
            };
            if !converted.is_empty() {
                count.converted += 1;
                let dims = converted
                    .iter()
                    .filter_map(|e| dimension_fn(*e))
                    .collect::<BTreeSet<_>>();
                for dim in dims {
                    *count.converted_by_dimension.entry(dim).or_insert(0) += 1;
                }
            }
        }
        categories.insert(rule.name.clone(), count);
    }

    let mut set_breakdowns = BTreeMap::new();
    for field in set_fields {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for members in households.values() {
            let values = members
                .iter()
                .flat_map(|e| e.set(field).iter().cloned())
                .collect::<BTreeSet<_>>();
            for value in values {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        set_breakdowns.insert(field.clone(), counts);
    }

    Summary {
        total_entities: entities.len(),
        total_households: households.len(),
        categories,
        set_breakdowns,
    }
}
