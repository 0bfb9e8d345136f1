//! Single clause evaluation.
//!
//! A clause matches an attribute against a list of values (OR'd together),
//! then applies `negate`. Multi-valued (array) attributes match if ANY
//! element matches ANY clause value. `segmentMatch` is special: its
//! `values` name segments rather than operator operands.

use crate::models::{Clause, Operator, Value};
use crate::operators;
use crate::preprocessor::{preprocess_clause, ClauseValueAux, PreprocessedClause};
use crate::segment::SegmentEvalContext;
use crate::user::User;

/// Evaluate a clause against a user, given a context that can resolve
/// segment membership for `segmentMatch` clauses.
pub fn matches(clause: &Clause, user: &User, ctx: &mut SegmentEvalContext) -> bool {
    let raw = match clause.attribute.name() {
        "key" => Some(Value::from(user.key.clone())),
        _ => user.get(&clause.attribute),
    };

    let base_match = if clause.op == Operator::SegmentMatch {
        segment_match(clause, user, ctx)
    } else {
        let aux = clause.aux.clone().unwrap_or_else(|| preprocess_clause(clause));
        match raw {
            Some(Value::Array(items)) => items
                .iter()
                .any(|item| value_matches(clause, item, &aux)),
            Some(single) => value_matches(clause, &single, &aux),
            None => false,
        }
    };

    base_match != clause.negate
}

fn value_matches(clause: &Clause, attribute_value: &Value, aux: &PreprocessedClause) -> bool {
    if clause.op == Operator::In {
        if let Some(set) = &aux.in_set {
            let key = serde_json::to_string(attribute_value).unwrap_or_default();
            return set.contains(&key);
        }
    }

    clause
        .values
        .iter()
        .enumerate()
        .any(|(i, clause_value)| {
            let value_aux = aux.per_value.get(i).unwrap_or(&ClauseValueAux::None);
            operators::apply(clause.op, attribute_value, clause_value, Some(value_aux))
        })
}

fn segment_match(clause: &Clause, user: &User, ctx: &mut SegmentEvalContext) -> bool {
    clause.values.iter().any(|v| {
        v.as_str()
            .map(|segment_key| ctx.is_in_segment(segment_key, user))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Operator, UserAttribute};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn clause(attribute: UserAttribute, op: Operator, values: Vec<Value>, negate: bool) -> Clause {
        Clause {
            attribute,
            op,
            values,
            negate,
            aux: None,
        }
    }

    fn ctx(store: &MemoryStore) -> SegmentEvalContext<'_> {
        SegmentEvalContext::new(store, None)
    }

    #[test]
    fn in_clause_matches_key() {
        let store = MemoryStore::new();
        let c = clause(UserAttribute::Key, Operator::In, vec![json!("abc")], false);
        let user = User::new("abc");
        assert!(matches(&c, &user, &mut ctx(&store)));
        let user2 = User::new("xyz");
        assert!(!matches(&c, &user2, &mut ctx(&store)));
    }

    #[test]
    fn negate_inverts_result() {
        let store = MemoryStore::new();
        let c = clause(UserAttribute::Key, Operator::In, vec![json!("abc")], true);
        let user = User::new("abc");
        assert!(!matches(&c, &user, &mut ctx(&store)));
    }

    #[test]
    fn array_attribute_matches_any_element() {
        let store = MemoryStore::new();
        let c = clause(
            UserAttribute::Custom("groups".into()),
            Operator::In,
            vec![json!("admins")],
            false,
        );
        let user = User::new("u").with_attribute("groups", json!(["users", "admins"]));
        assert!(matches(&c, &user, &mut ctx(&store)));
    }

    #[test]
    fn missing_attribute_never_matches() {
        let store = MemoryStore::new();
        let c = clause(
            UserAttribute::Custom("missing".into()),
            Operator::In,
            vec![json!("x")],
            false,
        );
        let user = User::new("u");
        assert!(!matches(&c, &user, &mut ctx(&store)));
    }
}
