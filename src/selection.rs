use crate::models::{FieldSpec, FieldValue};
use crate::notify::{Listeners, Subscription};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Field name to value. Every declared field is always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Selection {
    fields: BTreeMap<String, FieldValue>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(field.into(), value)
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Canonical JSON of the sorted field map.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|err| {
            warn!("selection fingerprint fell back to debug form: {err}");
            format!("{:?}", self.fields)
        })
    }

    /// Names of fields whose values differ from `other`.
    pub fn diff(&self, other: &Selection) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(name, value)| other.fields.get(*name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl FromIterator<(String, FieldValue)> for Selection {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Snapshot handed to subscribers after a (possibly batched) change.
#[derive(Debug, Clone)]
pub struct SelectionChange {
    pub changed: Vec<String>,
    pub selection: Selection,
}

impl SelectionChange {
    pub fn touches(&self, field: &str) -> bool {
        self.changed.iter().any(|name| name == field)
    }
}

/// Owns the current selection and notifies subscribers once per effective change.
#[derive(Clone)]
pub struct SelectionStore {
    defaults: Arc<Selection>,
    current: Arc<Mutex<Selection>>,
    listeners: Listeners<SelectionChange>,
}

impl SelectionStore {
    pub fn new(fields: &[FieldSpec]) -> Self {
        let defaults: Selection = fields
            .iter()
            .map(|spec| (spec.name.clone(), spec.default.clone()))
            .collect();
        Self {
            current: Arc::new(Mutex::new(defaults.clone())),
            defaults: Arc::new(defaults),
            listeners: Listeners::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.current.lock().get(field).cloned()
    }

    pub fn snapshot(&self) -> Selection {
        self.current.lock().clone()
    }

    pub fn defaults(&self) -> &Selection {
        &self.defaults
    }

    pub fn fingerprint(&self) -> String {
        self.current.lock().fingerprint()
    }

    /// Returns whether the value changed.
    pub fn set(&self, field: &str, value: FieldValue) -> bool {
        self.set_many([(field.to_owned(), value)])
    }

    /// Applies every update, then notifies once if anything changed.
    pub fn set_many<I>(&self, updates: I) -> bool
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        let change = {
            let mut current = self.current.lock();
            let mut changed = Vec::new();
            for (field, value) in updates {
                let Some(default) = self.defaults.get(&field) else {
                    warn!(%field, "ignoring update to undeclared field");
                    continue;
                };
                if !default.same_kind(&value) {
                    warn!(%field, ?value, "ignoring update with mismatched value kind");
                    continue;
                }
                if current.get(&field) == Some(&value) {
                    continue;
                }
                current.insert(field.clone(), value);
                if !changed.contains(&field) {
                    changed.push(field);
                }
            }
            if changed.is_empty() {
                return false;
            }
            SelectionChange {
                changed,
                selection: current.clone(),
            }
        };

        self.listeners.emit(&change);
        true
    }

    /// Replaces the whole selection; unspecified fields revert to defaults.
    pub fn replace(&self, selection: &Selection) -> bool {
        let updates: Vec<(String, FieldValue)> = self
            .defaults
            .iter()
            .map(|(name, default)| {
                let value = selection.get(name).unwrap_or(default).clone();
                (name.to_owned(), value)
            })
            .collect();
        self.set_many(updates)
    }

    pub fn reset(&self) -> bool {
        let defaults = self.defaults.as_ref().clone();
        self.replace(&defaults)
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&SelectionChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::analysis_page_fields;

    fn recorder(store: &SelectionStore) -> (Arc<Mutex<Vec<SelectionChange>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            store.subscribe(move |change| seen.lock().push(change.clone()))
        };
        (seen, sub)
    }

    #[test]
    fn fingerprint_ignores_construction_order() {
        let a = Selection::new()
            .with("website", FieldValue::text("a"))
            .with("page", FieldValue::Number(2))
            .with("from", FieldValue::date(2026, 1, 1));
        let b = Selection::new()
            .with("from", FieldValue::date(2026, 1, 1))
            .with("website", FieldValue::text("a"))
            .with("page", FieldValue::Number(2));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(
            a.fingerprint(),
            r#"{"from":"2026-01-01","page":2,"website":"a"}"#
        );
    }

    #[test]
    fn stores_built_in_different_orders_agree() {
        let first = SelectionStore::new(&analysis_page_fields());
        first.set("website", FieldValue::text("a"));
        first.set("period", FieldValue::text("today"));

        let second = SelectionStore::new(&analysis_page_fields());
        second.set("period", FieldValue::text("today"));
        second.set("website", FieldValue::text("a"));

        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_value_kinds() {
        let text = Selection::new().with("page", FieldValue::text("1"));
        let number = Selection::new().with("page", FieldValue::Number(1));
        assert_ne!(text.fingerprint(), number.fingerprint());
    }

    #[test]
    fn equal_value_does_not_notify() {
        let store = SelectionStore::new(&analysis_page_fields());
        let (seen, _sub) = recorder(&store);

        assert!(!store.set("period", FieldValue::text("last_7_days")));
        assert!(store.set("period", FieldValue::text("today")));
        assert!(!store.set("period", FieldValue::text("today")));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].changed, vec!["period".to_owned()]);
    }

    #[test]
    fn batched_updates_notify_once_with_final_state() {
        let store = SelectionStore::new(&analysis_page_fields());
        let (seen, _sub) = recorder(&store);

        store.set_many([
            ("website".to_owned(), FieldValue::text("a")),
            ("metric".to_owned(), FieldValue::text("visitors")),
            ("compare".to_owned(), FieldValue::Flag(true)),
        ]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].changed.len(), 3);
        assert_eq!(seen[0].selection.text("metric"), Some("visitors"));
        assert_eq!(seen[0].selection.fingerprint(), store.fingerprint());
    }

    #[test]
    fn undeclared_and_mismatched_updates_are_ignored() {
        let store = SelectionStore::new(&analysis_page_fields());
        assert!(!store.set("colour", FieldValue::text("red")));
        assert!(!store.set("page", FieldValue::text("2")));
        assert_eq!(store.get("page"), Some(FieldValue::Number(1)));
        assert_eq!(store.get("colour"), None);
    }

    #[test]
    fn reset_restores_defaults() {
        let store = SelectionStore::new(&analysis_page_fields());
        store.set("website", FieldValue::text("a"));
        store.set("path", FieldValue::list(["/blog"]));
        assert!(store.reset());
        assert_eq!(store.snapshot(), *store.defaults());
    }

    #[test]
    fn unsubscribed_callbacks_stop_receiving() {
        let store = SelectionStore::new(&analysis_page_fields());
        let (seen, sub) = recorder(&store);
        store.set("page", FieldValue::Number(2));
        sub.unsubscribe();
        store.set("page", FieldValue::Number(3));
        assert_eq!(seen.lock().len(), 1);
    }
}
