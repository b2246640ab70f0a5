//! Deterministic cache key composition.
//!
//! A key is `namespace|name=value|name=value...` with fields ordered by name.
//! List values are sorted, absent values are written as `~`, and delimiter
//! characters inside the namespace, names and values are backslash-escaped, so two filters produce the
//! same key exactly when they are logically identical.

use std::collections::BTreeMap;
use std::fmt::Display;

const FIELD_SEPARATOR: char = '|';
const NULL_MARKER: &str = "~";
const RESERVED: &[char] = &['\\', '|', '=', ',', '~', '[', ']'];

/// Builder for cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    namespace: String,
    fields: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: escape(namespace),
            fields: BTreeMap::new(),
        }
    }

    /// The prefix shared by every key in `namespace`, for prefix
    /// invalidation.
    pub fn namespace_prefix(namespace: &str) -> String {
        format!("{}{FIELD_SEPARATOR}", escape(namespace))
    }

    /// Adds a scalar field.
    pub fn field(mut self, name: &str, value: impl Display) -> Self {
        self.fields.insert(escape(name), escape(&value.to_string()));
        self
    }

    /// Adds an optional field; `None` is recorded explicitly.
    pub fn optional<T: Display>(self, name: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.field(name, value),
            None => self.null(name),
        }
    }

    /// Adds a field explicitly set to null.
    pub fn null(mut self, name: &str) -> Self {
        self.fields.insert(escape(name), NULL_MARKER.to_string());
        self
    }

    /// Adds a multi-valued field. Element order does not affect the key.
    pub fn list<I>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Display,
    {
        let mut items: Vec<String> = values
            .into_iter()
            .map(|v| escape(&v.to_string()))
            .collect();
        items.sort_unstable();
        self.fields
            .insert(escape(name), format!("[{}]", items.join(",")));
        self
    }

    pub fn build(&self) -> String {
        let mut key = format!("{}{FIELD_SEPARATOR}", self.namespace);
        let mut first = true;
        for (name, value) in &self.fields {
            if !first {
                key.push(FIELD_SEPARATOR);
            }
            first = false;
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.build())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.build()
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if RESERVED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_ordered_by_name() {
        let a = CacheKey::new("tasks").field("status", "open").field("assignee", "U1");
        let b = CacheKey::new("tasks").field("assignee", "U1").field("status", "open");
        assert_eq!(a.build(), b.build());
        assert_eq!(a.build(), "tasks|assignee=U1|status=open");
    }

    #[test]
    fn list_order_does_not_matter() {
        let a = CacheKey::new("tasks").list("tags", ["urgent", "backend", "api"]);
        let b = CacheKey::new("tasks").list("tags", ["api", "urgent", "backend"]);
        assert_eq!(a.build(), b.build());
        assert_eq!(a.build(), "tasks|tags=[api,backend,urgent]");
    }

    #[test]
    fn null_differs_from_literal_values() {
        let null = CacheKey::new("tasks").optional::<&str>("assignee", None);
        let tilde = CacheKey::new("tasks").field("assignee", "~");
        let empty = CacheKey::new("tasks").field("assignee", "");
        let absent = CacheKey::new("tasks");

        let keys = [null.build(), tilde.build(), empty.build(), absent.build()];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn delimiters_cannot_forge_collisions() {
        let forged = CacheKey::new("tasks").field("status", "open|assignee=U1");
        let honest = CacheKey::new("tasks").field("status", "open").field("assignee", "U1");
        assert_ne!(forged.build(), honest.build());

        let one_tag = CacheKey::new("tasks").list("tags", ["a,b"]);
        let two_tags = CacheKey::new("tasks").list("tags", ["a", "b"]);
        assert_ne!(one_tag.build(), two_tags.build());

        let list_like = CacheKey::new("tasks").field("tags", "[a]");
        let list = CacheKey::new("tasks").list("tags", ["a"]);
        assert_ne!(list_like.build(), list.build());
    }

    #[test]
    fn namespace_cannot_forge_fields() {
        let forged = CacheKey::new("tasks|assignee=U1").field("status", "open");
        let honest = CacheKey::new("tasks").field("assignee", "U1").field("status", "open");
        assert_ne!(forged.build(), honest.build());
        assert!(!forged.build().starts_with(&CacheKey::namespace_prefix("tasks")));
        assert!(forged.build().starts_with(&CacheKey::namespace_prefix("tasks|assignee=U1")));
    }

    #[test]
    fn empty_list_differs_from_null() {
        let empty = CacheKey::new("tasks").list("tags", Vec::<String>::new());
        let null = CacheKey::new("tasks").null("tags");
        assert_ne!(empty.build(), null.build());
    }

    #[test]
    fn keys_share_namespace_prefix() {
        let key = CacheKey::new("tasks").field("page", 2).build();
        assert!(key.starts_with(&CacheKey::namespace_prefix("tasks")));
        assert!(!key.starts_with(&CacheKey::namespace_prefix("task")));
    }
}
