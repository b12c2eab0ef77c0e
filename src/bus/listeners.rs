//! Listener registry: message name → window → origin. Window keys are held
//! weakly (parallel pairs with periodic sweep) so closed windows can be
//! collected; origin keys are literal strings plus an in-order list of regex
//! entries.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use regex::Regex;

use crate::bus::data::Data;
use crate::error::Error;
use crate::win::identity::DomainPattern;
use crate::win::{WeakWindow, WindowHandle};

/// A message as seen by a listener.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub source: WindowHandle,
    pub origin: String,
    pub data: Data,
}

pub type ListenerFn =
    Arc<dyn Fn(MessageEvent) -> BoxFuture<'static, Result<Data, Error>> + Send + Sync>;
pub type ErrorHandlerFn = Arc<dyn Fn(&Error) + Send + Sync>;

pub struct ListenerEntry {
    pub handler: ListenerFn,
    pub once: bool,
    pub error_handler: Option<ErrorHandlerFn>,
}

const WILDCARD_DOMAIN: &str = "*";

/// Weak-keyed map over window handles. Entries for dropped or closed windows
/// are pruned on sweep.
pub struct WindowKeyedMap<V> {
    entries: Vec<(WeakWindow, V)>,
}

impl<V> WindowKeyedMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, win: &WindowHandle) -> Option<usize> {
        self.entries.iter().position(|(weak, _)| {
            weak.upgrade()
                .map(|candidate| candidate.ptr_eq(win))
                .unwrap_or(false)
        })
    }

    pub fn get(&self, win: &WindowHandle) -> Option<&V> {
        self.position(win).map(|idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, win: &WindowHandle) -> Option<&mut V> {
        self.position(win).map(move |idx| &mut self.entries[idx].1)
    }

    pub fn get_or_insert_with<F: FnOnce() -> V>(&mut self, win: &WindowHandle, init: F) -> &mut V {
        let idx = match self.position(win) {
            Some(idx) => idx,
            None => {
                self.entries.push((win.downgrade(), init()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx].1
    }

    pub fn remove(&mut self, win: &WindowHandle) -> Option<V> {
        self.position(win).map(|idx| self.entries.remove(idx).1)
    }

    /// Drop entries whose window is gone or closed.
    pub fn sweep(&mut self) {
        self.entries.retain(|(weak, _)| {
            weak.upgrade()
                .map(|win| !win.is_closed())
                .unwrap_or(false)
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = (WindowHandle, &V)> {
        self.entries
            .iter()
            .filter_map(|(weak, value)| weak.upgrade().map(|win| (win, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<V> Default for WindowKeyedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct DomainListeners {
    literal: HashMap<String, Arc<ListenerEntry>>,
    regex: Vec<(Regex, Arc<ListenerEntry>)>,
}

impl DomainListeners {
    fn insert(&mut self, domain: &DomainPattern, entry: Arc<ListenerEntry>) -> Result<(), Error> {
        match domain {
            DomainPattern::Wildcard => self.insert_literal(WILDCARD_DOMAIN, entry),
            DomainPattern::Literal(origin) => self.insert_literal(origin, entry),
            DomainPattern::Regex(re) => {
                self.regex.push((re.clone(), entry));
                Ok(())
            }
            DomainPattern::Any(patterns) => {
                for pattern in patterns {
                    self.insert(pattern, Arc::clone(&entry))?;
                }
                Ok(())
            }
        }
    }

    fn insert_literal(&mut self, key: &str, entry: Arc<ListenerEntry>) -> Result<(), Error> {
        if self.literal.contains_key(key) {
            return Err(Error::Integration(format!(
                "listener already registered for domain {key}"
            )));
        }
        self.literal.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&mut self, domain: &DomainPattern) {
        match domain {
            DomainPattern::Wildcard => {
                self.literal.remove(WILDCARD_DOMAIN);
            }
            DomainPattern::Literal(origin) => {
                self.literal.remove(origin);
            }
            DomainPattern::Regex(re) => {
                self.regex.retain(|(candidate, _)| candidate.as_str() != re.as_str());
            }
            DomainPattern::Any(patterns) => {
                for pattern in patterns {
                    self.remove(pattern);
                }
            }
        }
    }

    /// Literal lookup first, then regex entries in insertion order, then the
    /// domain wildcard.
    fn lookup(&self, origin: &str) -> Option<Arc<ListenerEntry>> {
        if let Some(entry) = self.literal.get(origin) {
            return Some(Arc::clone(entry));
        }
        for (re, entry) in &self.regex {
            if re.is_match(origin) {
                return Some(Arc::clone(entry));
            }
        }
        self.literal.get(WILDCARD_DOMAIN).map(Arc::clone)
    }

    fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.regex.is_empty()
    }
}

#[derive(Default)]
struct NameListeners {
    windows: WindowKeyedMap<DomainListeners>,
    wildcard: DomainListeners,
}

/// The full listener table for one bus instance.
#[derive(Default)]
pub struct ListenerTable {
    by_name: HashMap<String, NameListeners>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. `window: None` registers the window wildcard.
    /// Registering a second listener for an identical `(name, window,
    /// literal-domain)` key fails.
    pub fn add(
        &mut self,
        name: &str,
        window: Option<&WindowHandle>,
        domain: &DomainPattern,
        entry: Arc<ListenerEntry>,
    ) -> Result<(), Error> {
        let bucket = self.by_name.entry(name.to_string()).or_default();
        match window {
            Some(win) => bucket
                .windows
                .get_or_insert_with(win, DomainListeners::default)
                .insert(domain, entry),
            None => bucket.wildcard.insert(domain, entry),
        }
    }

    pub fn remove(&mut self, name: &str, window: Option<&WindowHandle>, domain: &DomainPattern) {
        let Some(bucket) = self.by_name.get_mut(name) else {
            return;
        };
        match window {
            Some(win) => {
                if let Some(listeners) = bucket.windows.get_mut(win) {
                    listeners.remove(domain);
                }
            }
            None => bucket.wildcard.remove(domain),
        }
        if bucket.wildcard.is_empty() && bucket.windows.is_empty() {
            self.by_name.remove(name);
        }
    }

    /// Find the listener for `(name, source, origin)` under the shadowing
    /// rules: a specific-window entry shadows the window wildcard, and
    /// within each, a literal domain shadows regex entries, which shadow the
    /// domain wildcard.
    pub fn lookup(
        &self,
        name: &str,
        source: &WindowHandle,
        origin: &str,
    ) -> Option<Arc<ListenerEntry>> {
        let bucket = self.by_name.get(name)?;
        if let Some(listeners) = bucket.windows.get(source) {
            if let Some(entry) = listeners.lookup(origin) {
                return Some(entry);
            }
        }
        bucket.wildcard.lookup(origin)
    }

    /// Remove a listener everywhere it appears, by entry identity. Used for
    /// `once` listeners, where the receive path only holds the entry.
    pub fn remove_entry(&mut self, name: &str, entry: &Arc<ListenerEntry>) {
        let Some(bucket) = self.by_name.get_mut(name) else {
            return;
        };
        let prune = |listeners: &mut DomainListeners| {
            listeners
                .literal
                .retain(|_, candidate| !Arc::ptr_eq(candidate, entry));
            listeners
                .regex
                .retain(|(_, candidate)| !Arc::ptr_eq(candidate, entry));
        };
        prune(&mut bucket.wildcard);
        for (_, listeners) in bucket.windows.entries.iter_mut() {
            prune(listeners);
        }
        if bucket.wildcard.is_empty() {
            bucket.windows.sweep();
        }
        if bucket.wildcard.is_empty() && bucket.windows.is_empty() {
            self.by_name.remove(name);
        }
    }

    /// Remove every listener keyed to `win`.
    pub fn remove_window(&mut self, win: &WindowHandle) {
        for bucket in self.by_name.values_mut() {
            bucket.windows.remove(win);
        }
        self.by_name
            .retain(|_, bucket| !bucket.wildcard.is_empty() || !bucket.windows.is_empty());
    }

    /// Prune dead window keys.
    pub fn sweep(&mut self) {
        for bucket in self.by_name.values_mut() {
            bucket.windows.sweep();
        }
        self.by_name
            .retain(|_, bucket| !bucket.wildcard.is_empty() || !bucket.windows.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::win::Browser;
    use url::Url;

    fn entry(tag: &'static str, log: Arc<std::sync::Mutex<Vec<&'static str>>>) -> Arc<ListenerEntry> {
        Arc::new(ListenerEntry {
            handler: Arc::new(move |_event| {
                log.lock().unwrap().push(tag);
                Box::pin(async { Ok(Data::Null) })
            }),
            once: false,
            error_handler: None,
        })
    }

    fn windows() -> (WindowHandle, WindowHandle) {
        let browser = Browser::new();
        let a = browser.open_window(Some(Url::parse("https://a.example/").unwrap()));
        let b = browser.open_window(Some(Url::parse("https://b.example/").unwrap()));
        (a, b)
    }

    #[tokio::test]
    async fn specific_window_shadows_wildcard() {
        let (a, b) = windows();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut table = ListenerTable::new();
        table
            .add("init", None, &DomainPattern::Wildcard, entry("wild", Arc::clone(&log)))
            .unwrap();
        table
            .add(
                "init",
                Some(&a),
                &DomainPattern::literal("https://a.example"),
                entry("specific", Arc::clone(&log)),
            )
            .unwrap();

        let found = table.lookup("init", &a, "https://a.example").unwrap();
        (found.handler)(MessageEvent {
            source: a.clone(),
            origin: "https://a.example".into(),
            data: Data::Null,
        })
        .await
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["specific"]);

        // Different window falls back to the wildcard entry.
        assert!(table.lookup("init", &b, "https://b.example").is_some());
    }

    #[test]
    fn duplicate_registration_fails() {
        let (a, _) = windows();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut table = ListenerTable::new();
        let domain = DomainPattern::literal("https://a.example");
        table
            .add("init", Some(&a), &domain, entry("one", Arc::clone(&log)))
            .unwrap();
        assert!(matches!(
            table.add("init", Some(&a), &domain, entry("two", Arc::clone(&log))),
            Err(Error::Integration(_))
        ));
    }

    #[test]
    fn remove_restores_pre_registration_state() {
        let (a, _) = windows();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut table = ListenerTable::new();
        let domain = DomainPattern::literal("https://a.example");
        table
            .add("init", Some(&a), &domain, entry("one", Arc::clone(&log)))
            .unwrap();
        table.remove("init", Some(&a), &domain);
        assert!(table.is_empty());
        assert!(table.lookup("init", &a, "https://a.example").is_none());
    }

    #[test]
    fn sweep_drops_closed_windows() {
        let (a, _) = windows();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut table = ListenerTable::new();
        table
            .add("init", Some(&a), &DomainPattern::Wildcard, entry("one", log))
            .unwrap();
        a.close();
        table.sweep();
        assert!(table.is_empty());
    }

    #[test]
    fn regex_listener_matches_after_literal_miss() {
        let (a, _) = windows();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut table = ListenerTable::new();
        table
            .add(
                "init",
                Some(&a),
                &DomainPattern::Regex(Regex::new(r"^https://a\.").unwrap()),
                entry("re", log),
            )
            .unwrap();
        assert!(table.lookup("init", &a, "https://a.example").is_some());
        assert!(table.lookup("init", &a, "https://b.example").is_none());
    }
}
