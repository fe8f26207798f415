//! Retention policy resolution.
//!
//! Picks a TTL from a fixed ladder of durations by inspecting a query's
//! arguments. Resolution is pure: no I/O, no shared state.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::keys::{EntityType, OperationId, OperationKind};

const STATUS_FIELD: &str = "status";
const PUBLISHED_STATES: &[&str] = &["published"];

/// Named step on the retention ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTier {
    Short,
    Medium,
    Long,
    VeryLong,
}

/// Concrete durations for each retention tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLadder {
    pub short: Duration,
    pub medium: Duration,
    pub long: Duration,
    pub very_long: Duration,
}

impl Default for RetentionLadder {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(60),
            medium: Duration::from_secs(300),
            long: Duration::from_secs(3600),
            very_long: Duration::from_secs(86400),
        }
    }
}

impl RetentionLadder {
    pub fn duration(&self, tier: RetentionTier) -> Duration {
        match tier {
            RetentionTier::Short => self.short,
            RetentionTier::Medium => self.medium,
            RetentionTier::Long => self.long,
            RetentionTier::VeryLong => self.very_long,
        }
    }
}

/// How an operation's TTL is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlRule {
    /// Always the same tier.
    Fixed(RetentionTier),
    /// An explicit duration, bypassing the ladder.
    Exact(Duration),
    /// Long for published-only filters, short for other status filters,
    /// medium when the filter is absent or cannot be classified.
    PublishedAware,
}

/// What a query's `filter` argument says about content status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterClass {
    /// Restricted to published-equivalent content.
    PublishedOnly,
    /// Filters on status but may include drafts or other states.
    MayIncludeUnpublished,
    /// Absent, unparseable, or silent about status.
    Unknown,
}

/// The TTL rule an operation gets when registered from the standard table.
pub fn default_rule(operation: OperationId) -> TtlRule {
    use EntityType as E;
    use OperationKind as K;
    use RetentionTier::*;

    match (operation.entity, operation.kind) {
        (E::Posts, K::GetAll) => TtlRule::PublishedAware,
        (E::Pages, K::GetBySlug) => TtlRule::Fixed(VeryLong),
        (E::Globals, _) => TtlRule::Fixed(VeryLong),
        (E::Navigation, K::GetActive) => TtlRule::Fixed(VeryLong),
        (E::Redirects, K::GetAll | K::GetByFromUrl) => TtlRule::Fixed(VeryLong),
        (E::FormSubmissions, _) => TtlRule::Fixed(Short),
        (_, K::GetById) => TtlRule::Fixed(Medium),
        (_, K::GetAll | K::GetBySlug | K::GetPublished) => TtlRule::Fixed(Long),
        _ => TtlRule::Fixed(Medium),
    }
}

/// Resolves TTLs against a configured ladder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    ladder: RetentionLadder,
}

impl RetentionPolicy {
    pub fn new(ladder: RetentionLadder) -> Self {
        Self { ladder }
    }

    pub fn ladder(&self) -> &RetentionLadder {
        &self.ladder
    }

    /// TTL for `operation` called with `args`, using its standard rule.
    pub fn resolve(&self, operation: OperationId, args: &Value) -> Duration {
        self.resolve_rule(default_rule(operation), args)
    }

    pub fn resolve_rule(&self, rule: TtlRule, args: &Value) -> Duration {
        match rule {
            TtlRule::Exact(duration) => duration,
            TtlRule::Fixed(tier) => self.ladder.duration(tier),
            TtlRule::PublishedAware => self.ladder.duration(tier_for_filter(args)),
        }
    }
}

fn tier_for_filter(args: &Value) -> RetentionTier {
    match classify_filter(args) {
        FilterClass::PublishedOnly => RetentionTier::Long,
        FilterClass::MayIncludeUnpublished => RetentionTier::Short,
        FilterClass::Unknown => RetentionTier::Medium,
    }
}

/// Classify the `filter` member of a query's arguments.
pub fn classify_filter(args: &Value) -> FilterClass {
    match args.get("filter") {
        Some(filter) => classify_node(filter),
        None => FilterClass::Unknown,
    }
}

fn classify_node(node: &Value) -> FilterClass {
    let Value::Object(map) = node else {
        return FilterClass::Unknown;
    };

    let mut classes = Vec::new();
    if let Some(predicate) = map.get(STATUS_FIELD) {
        classes.push(classify_status(predicate));
    }
    if let Some(Value::Array(children)) = map.get("_and") {
        classes.push(classify_conjunction(children));
    }
    if let Some(Value::Array(children)) = map.get("_or") {
        classes.push(classify_disjunction(children));
    }

    // Members of one object are ANDed together.
    combine_conjunction(classes)
}

fn classify_conjunction(children: &[Value]) -> FilterClass {
    combine_conjunction(children.iter().map(classify_node).collect())
}

fn combine_conjunction(classes: Vec<FilterClass>) -> FilterClass {
    if classes.contains(&FilterClass::PublishedOnly) {
        FilterClass::PublishedOnly
    } else if classes.contains(&FilterClass::MayIncludeUnpublished) {
        FilterClass::MayIncludeUnpublished
    } else {
        FilterClass::Unknown
    }
}

fn classify_disjunction(children: &[Value]) -> FilterClass {
    if children.is_empty() {
        return FilterClass::Unknown;
    }
    let classes: Vec<_> = children.iter().map(classify_node).collect();
    if classes.iter().all(|class| *class == FilterClass::PublishedOnly) {
        FilterClass::PublishedOnly
    } else if classes.contains(&FilterClass::Unknown) {
        FilterClass::Unknown
    } else {
        FilterClass::MayIncludeUnpublished
    }
}

fn classify_status(predicate: &Value) -> FilterClass {
    let Value::Object(operators) = predicate else {
        return FilterClass::Unknown;
    };
    if operators.len() != 1 {
        return FilterClass::Unknown;
    }

    match operators.iter().next() {
        Some((op, Value::String(state))) if op == "_eq" => {
            if is_published(state) {
                FilterClass::PublishedOnly
            } else {
                FilterClass::MayIncludeUnpublished
            }
        }
        Some((op, Value::Array(states))) if op == "_in" => {
            let all_published = !states.is_empty()
                && states
                    .iter()
                    .all(|state| state.as_str().is_some_and(is_published));
            if all_published {
                FilterClass::PublishedOnly
            } else if states.iter().all(Value::is_string) {
                FilterClass::MayIncludeUnpublished
            } else {
                FilterClass::Unknown
            }
        }
        Some((op, _)) if matches!(op.as_str(), "_neq" | "_nin" | "_null" | "_nnull") => {
            FilterClass::MayIncludeUnpublished
        }
        _ => FilterClass::Unknown,
    }
}

fn is_published(state: &str) -> bool {
    PUBLISHED_STATES.contains(&state)
}
