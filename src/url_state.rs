//! Query-string state: a [`Location`] abstraction over browser history and
//! the whitelisting [`UrlState`] adapter the controller writes through.

use crate::notify::{Listeners, Subscription};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use url::form_urlencoded;

/// Param name to its values. An empty vector deletes the param on write.
pub type Params = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Rewrites the current history entry.
    #[default]
    Replace,
    /// Adds a history entry.
    Push,
}

pub trait Location: Send + Sync {
    /// Current query string without the leading `?`.
    fn query(&self) -> String;
    fn replace_query(&self, query: &str);
    fn push_query(&self, query: &str);
    /// Fires on back/forward navigation.
    fn on_pop_state(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

struct HistoryStack {
    entries: Vec<String>,
    cursor: usize,
}

/// History stack with browser semantics: push truncates forward entries,
/// back/forward move the cursor and fire pop-state.
pub struct MemoryHistory {
    stack: Mutex<HistoryStack>,
    pops: Listeners<()>,
}

impl MemoryHistory {
    pub fn new(initial_query: &str) -> Self {
        Self {
            stack: Mutex::new(HistoryStack {
                entries: vec![initial_query.trim_start_matches('?').to_owned()],
                cursor: 0,
            }),
            pops: Listeners::new(),
        }
    }

    pub fn back(&self) -> bool {
        self.traverse(-1)
    }

    pub fn forward(&self) -> bool {
        self.traverse(1)
    }

    pub fn len(&self) -> usize {
        self.stack.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current(&self) -> String {
        self.query()
    }

    fn traverse(&self, delta: isize) -> bool {
        {
            let mut stack = self.stack.lock();
            let Some(target) = stack.cursor.checked_add_signed(delta) else {
                return false;
            };
            if target >= stack.entries.len() {
                return false;
            }
            stack.cursor = target;
        }
        self.pops.emit(&());
        true
    }
}

impl Location for MemoryHistory {
    fn query(&self) -> String {
        let stack = self.stack.lock();
        stack.entries[stack.cursor].clone()
    }

    fn replace_query(&self, query: &str) {
        let mut stack = self.stack.lock();
        let cursor = stack.cursor;
        stack.entries[cursor] = query.to_owned();
    }

    fn push_query(&self, query: &str) {
        let mut stack = self.stack.lock();
        let next = stack.cursor + 1;
        stack.entries.truncate(next);
        stack.entries.push(query.to_owned());
        stack.cursor = next;
    }

    fn on_pop_state(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.pops.subscribe(move |_| callback())
    }
}

/// Reads and writes a whitelisted set of query params without disturbing
/// anything else on the URL.
#[derive(Clone)]
pub struct UrlState {
    location: Arc<dyn Location>,
    allowed: Arc<BTreeSet<String>>,
}

impl UrlState {
    pub fn new<I, S>(location: Arc<dyn Location>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            location,
            allowed: Arc::new(allowed.into_iter().map(Into::into).collect()),
        }
    }

    pub fn read(&self, name: &str) -> Option<String> {
        self.read_all(name).into_iter().next()
    }

    pub fn read_all(&self, name: &str) -> Vec<String> {
        parse_pairs(&self.location.query())
            .into_iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value)
            .collect()
    }

    /// Whitelisted params currently on the URL.
    pub fn snapshot(&self) -> Params {
        let mut params = Params::new();
        for (key, value) in parse_pairs(&self.location.query()) {
            if self.allowed.contains(&key) {
                params.entry(key).or_default().push(value);
            }
        }
        params
    }

    /// Applies `updates` and returns whether the URL changed. Writing the
    /// state the URL already holds is a no-op in either mode.
    pub fn write(&self, updates: &Params, mode: WriteMode) -> bool {
        let updates: BTreeMap<&str, &Vec<String>> = updates
            .iter()
            .filter(|(name, _)| {
                let allowed = self.allowed.contains(name.as_str());
                if !allowed {
                    warn!(param = %name, "refusing to write unknown url param");
                }
                allowed
            })
            .map(|(name, values)| (name.as_str(), values))
            .collect();

        let current = self.location.query();
        let next = rewrite_query(&current, &updates);
        if next == current {
            return false;
        }

        debug!(from = %current, to = %next, ?mode, "writing url");
        match mode {
            WriteMode::Replace => self.location.replace_query(&next),
            WriteMode::Push => self.location.push_query(&next),
        }
        true
    }

    /// The callback receives freshly-read whitelisted params, not a diff.
    pub fn on_pop_state(&self, callback: impl Fn(Params) + Send + Sync + 'static) -> Subscription {
        let reader = self.clone();
        self.location
            .on_pop_state(Box::new(move || callback(reader.snapshot())))
    }
}

fn parse_pairs(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn segment_key(segment: &str) -> Option<String> {
    form_urlencoded::parse(segment.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
}

fn encode_segments(name: &str, values: &[String], out: &mut Vec<String>) {
    for value in values {
        out.push(
            form_urlencoded::Serializer::new(String::new())
                .append_pair(name, value)
                .finish(),
        );
    }
}

/// Untouched segments are kept byte-for-byte; an updated param takes the
/// position of its first occurrence, new params are appended in name order.
fn rewrite_query(current: &str, updates: &BTreeMap<&str, &Vec<String>>) -> String {
    let mut out = Vec::new();
    let mut placed = BTreeSet::new();

    for segment in current.split('&').filter(|s| !s.is_empty()) {
        match segment_key(segment) {
            Some(key) if updates.contains_key(key.as_str()) => {
                if placed.insert(key.clone()) {
                    encode_segments(&key, updates[key.as_str()], &mut out);
                }
            }
            _ => out.push(segment.to_owned()),
        }
    }

    for (name, values) in updates {
        if !placed.contains(*name) {
            encode_segments(name, values, &mut out);
        }
    }

    out.join("&")
}
