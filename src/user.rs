//! The user record an evaluation is performed against.
//!
//! Carries standard and custom attributes, since clause matching and
//! bucketing both need more than a key to resolve.

use crate::models::{UserAttribute, Value};
use std::collections::HashMap;

/// A user (or other evaluation subject) record.
///
/// `key` is required; an empty key is accepted (it still hashes, it's just
/// likely to bucket consistently for every empty-keyed user). A missing user
/// entirely is a different case: [`crate::evaluator::Evaluator::evaluate`]
/// takes `Option<&User>` and reports `None` as `ErrorKind::UserNotSpecified`.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub key: String,
    pub secondary: Option<String>,
    pub anonymous: bool,
    attributes: HashMap<String, Value>,
}

impl User {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self {
            key: key.into(),
            secondary: None,
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    pub fn with_secondary<S: Into<String>>(mut self, secondary: S) -> Self {
        self.secondary = Some(secondary.into());
        self
    }

    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn with_attribute<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Resolve the value of a named attribute
    ///
    /// `key` and `secondary` are synthesized from dedicated fields; anything
    /// else (including standard attributes like `email` or `country`, which
    /// this crate treats uniformly as custom ones since it does not parse
    /// user JSON itself) comes from the attribute map.
    pub fn get(&self, attr: &UserAttribute) -> Option<Value> {
        match attr {
            UserAttribute::Key => Some(Value::String(self.key.clone())),
            UserAttribute::Secondary => self.secondary.clone().map(Value::String),
            UserAttribute::Custom(name) => {
                if name == "anonymous" {
                    Some(Value::Bool(self.anonymous))
                } else {
                    self.attributes.get(name).cloned()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_secondary_resolve() {
        let user = User::new("user-1").with_secondary("sec-1");
        assert_eq!(user.get(&UserAttribute::Key), Some(Value::from("user-1")));
        assert_eq!(
            user.get(&UserAttribute::Secondary),
            Some(Value::from("sec-1"))
        );
    }

    #[test]
    fn custom_attribute_roundtrips() {
        let user = User::new("u").with_attribute("country", "US");
        assert_eq!(
            user.get(&UserAttribute::Custom("country".into())),
            Some(Value::from("US"))
        );
        assert_eq!(user.get(&UserAttribute::Custom("missing".into())), None);
    }
}
