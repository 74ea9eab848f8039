//! Hierarchical attribute store.
//!
//! The store is the state-transfer object shared by the build orchestrator,
//! every extension hook, and every template render. It is an open-ended tree
//! of named values where intermediate nodes are created on demand:
//!
//! ```text
//! config
//! ├── site
//! │   ├── url = "http://example.com"
//! │   └── file_ignore_patterns = [...]
//! ├── controllers
//! │   └── blog
//! │       ├── enabled = true
//! │       ├── priority = 90.0
//! │       └── auto_permalink
//! │           └── path = ":blog_path/:year/:title"
//! └── filters
//!     └── markdown ...
//! ```
//!
//! ## Auto-vivification
//!
//! Reading a child that has never been set creates an empty [`Store`] at that
//! position and returns it. The new child is attached permanently, so a second
//! read returns the *same* store (compare with [`Store::ptr_eq`]). This is what
//! makes `controllers.blog.auto_permalink.path = ...` work without declaring
//! each level first.
//!
//! Dotted paths are interchangeable with nested access: `store.resolve("a.b.c")`
//! walks `a`, then `b`, then `c`, vivifying as it goes.
//!
//! Names that look like internals (leading `_`), call or index expressions
//! (`(`, `[`), or introspection names are never vivified. Reading one that was
//! never explicitly set fails with [`StoreError::ReservedName`].
//!
//! ## Strict records
//!
//! [`Record`] is the plain variant: a fixed-shape bag of values where a missing
//! key is an error rather than a silent creation. Template bindings use it.
//!
//! ## Enumeration
//!
//! [`Store::entries`] and [`Store::keys`] return snapshots taken at call time.
//! They never vivify, and reads performed while walking a snapshot do not
//! change what the snapshot contains.

use indexmap::IndexMap;
use regex::Regex;
use std::cell::RefCell;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;
use thiserror::Error;

use crate::extension::{ExtensionLogger, Implementation};
use crate::template::TemplateEngine;

/// Names that are never auto-vivified even though they look like plain names.
const RESERVED_NAMES: &[&str] = &["trait_names"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("'{0}' is a reserved name and cannot be created implicitly")]
    ReservedName(String),
    #[error(
        "stores are not indexable nor sliceable (got {0}); if you were expecting \
         another value here, a parent store may be improperly configured"
    )]
    NotIndexable(String),
    #[error(
        "stores are not callable; if you were expecting a function here, \
         a parent store may be improperly configured"
    )]
    NotCallable,
    #[error("no value named '{0}'")]
    NotFound(String),
    #[error("'{0}' holds a value, not a store")]
    NotAStore(String),
}

/// A lookup key.
///
/// Only [`Key::Path`] addresses anything. The other variants exist so that
/// call sites handing over an integer or a range get a descriptive error
/// instead of an auto-vivified nonsense result.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Path(String),
    Index(i64),
    Slice(Option<i64>, Option<i64>),
}

impl From<&str> for Key {
    fn from(path: &str) -> Self {
        Key::Path(path.to_string())
    }
}

impl From<String> for Key {
    fn from(path: String) -> Self {
        Key::Path(path)
    }
}

impl From<&String> for Key {
    fn from(path: &String) -> Self {
        Key::Path(path.clone())
    }
}

impl From<i32> for Key {
    fn from(index: i32) -> Self {
        Key::Index(index.into())
    }
}

impl From<i64> for Key {
    fn from(index: i64) -> Self {
        Key::Index(index)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index as i64)
    }
}

impl From<Range<i32>> for Key {
    fn from(range: Range<i32>) -> Self {
        Key::Slice(Some(range.start.into()), Some(range.end.into()))
    }
}

impl From<Range<i64>> for Key {
    fn from(range: Range<i64>) -> Self {
        Key::Slice(Some(range.start), Some(range.end))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Path(path) => write!(f, "'{path}'"),
            Key::Index(index) => write!(f, "index {index}"),
            Key::Slice(start, end) => {
                let bound = |b: &Option<i64>| b.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "slice [{}:{}]", bound(start), bound(end))
            }
        }
    }
}

/// A value held by a [`Store`] or [`Record`].
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Store(Store),
    /// A compiled regular expression (e.g. a file-ignore pattern).
    Pattern(Regex),
    /// A loaded extension implementation (the `mod` entry of a record).
    Extension(Rc<Implementation>),
    /// The per-extension logger attached at load time.
    Logger(ExtensionLogger),
    /// A template engine registered under `templates.engines`.
    Engine(Rc<dyn TemplateEngine>),
}

impl Value {
    /// Short name of the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Store(_) => "store",
            Value::Pattern(_) => "pattern",
            Value::Extension(_) => "extension",
            Value::Logger(_) => "logger",
            Value::Engine(_) => "engine",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view: integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_store(&self) -> Option<&Store> {
        match self {
            Value::Store(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_extension(&self) -> Option<&Rc<Implementation>> {
        match self {
            Value::Extension(implementation) => Some(implementation),
            _ => None,
        }
    }

    /// Convert a parsed TOML value. Tables become stores, datetimes strings.
    pub fn from_toml(value: toml::Value) -> Value {
        match value {
            toml::Value::String(s) => Value::Str(s),
            toml::Value::Integer(i) => Value::Int(i),
            toml::Value::Float(f) => Value::Float(f),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::Str(dt.to_string()),
            toml::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_toml).collect())
            }
            toml::Value::Table(table) => {
                let store = Store::new();
                for (key, value) in table {
                    store.insert(key, Value::from_toml(value));
                }
                Value::Store(store)
            }
        }
    }

    /// Serializable view for template bindings.
    ///
    /// Runtime-only values (extensions, loggers, engines) have no JSON form
    /// and return `None`; compiled patterns render as their source string.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Int(i) => Some(serde_json::Value::from(*i)),
            Value::Float(f) => Some(
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            ),
            Value::Str(s) => Some(serde_json::Value::String(s.clone())),
            Value::List(items) => Some(serde_json::Value::Array(
                items.iter().filter_map(Value::to_json).collect(),
            )),
            Value::Store(store) => Some(store.to_json()),
            Value::Pattern(re) => Some(serde_json::Value::String(re.as_str().to_string())),
            Value::Extension(_) | Value::Logger(_) | Value::Engine(_) => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Store(store) => fmt::Debug::fmt(store, f),
            Value::Pattern(re) => write!(f, "Pattern({:?})", re.as_str()),
            Value::Extension(implementation) => write!(f, "Extension({:?})", implementation),
            Value::Logger(logger) => write!(f, "Logger({})", logger.name()),
            Value::Engine(engine) => write!(f, "Engine({})", engine.name()),
        }
    }
}

/// Structural equality for plain values, identity for everything else.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Store(a), Value::Store(b)) => a.ptr_eq(b),
            (Value::Pattern(a), Value::Pattern(b)) => a.as_str() == b.as_str(),
            (Value::Extension(a), Value::Extension(b)) => Rc::ptr_eq(a, b),
            (Value::Logger(a), Value::Logger(b)) => a.name() == b.name(),
            (Value::Engine(a), Value::Engine(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Store> for Value {
    fn from(store: Store) -> Self {
        Value::Store(store)
    }
}

impl From<Regex> for Value {
    fn from(re: Regex) -> Self {
        Value::Pattern(re)
    }
}

/// An auto-vivifying, insertion-ordered tree node.
///
/// Cloning a `Store` clones the handle, not the contents: both handles see
/// the same mutations.
#[derive(Clone, Default)]
pub struct Store {
    inner: Rc<RefCell<IndexMap<String, Value>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity comparison: `true` when both handles point at one store.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    /// Whether `name` is set on this node. Never vivifies.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.borrow().contains_key(name)
    }

    /// Read a direct entry without vivifying.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.borrow().get(name).cloned()
    }

    /// Read a dotted path without vivifying anything along the way.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let mut value = self.get(parts.next()?)?;
        for part in parts {
            value = value.as_store()?.get(part)?;
        }
        Some(value)
    }

    /// Return the child store `name`, creating and attaching it if unset.
    pub fn child(&self, name: &str) -> Result<Store, StoreError> {
        match self.get_or_vivify(name)? {
            Value::Store(store) => Ok(store),
            _ => Err(StoreError::NotAStore(name.to_string())),
        }
    }

    /// Resolve a dotted path, vivifying every missing segment.
    ///
    /// The value at the end of the path is returned as-is; missing segments
    /// (including the last one) come back as fresh empty stores.
    pub fn resolve(&self, key: impl Into<Key>) -> Result<Value, StoreError> {
        let path = match key.into() {
            Key::Path(path) => path,
            other => return Err(StoreError::NotIndexable(other.to_string())),
        };
        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path.as_str()),
        };
        let mut current = self.clone();
        let mut walked: Vec<&str> = Vec::new();
        for part in parents.into_iter().flat_map(|p| p.split('.')) {
            walked.push(part);
            current = match current.get_or_vivify(part)? {
                Value::Store(store) => store,
                _ => return Err(StoreError::NotAStore(walked.join("."))),
            };
        }
        current.get_or_vivify(leaf)
    }

    /// Assign `value` at a dotted path, vivifying intermediate stores.
    ///
    /// Non-string keys are accepted and ignored: some call sites pass
    /// structured keys and rely on the assignment being a no-op. An empty
    /// leaf (`""`, `"a."`) is rejected.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<(), StoreError> {
        let path = match key.into() {
            Key::Path(path) => path,
            _ => return Ok(()),
        };
        let leaf = path.rsplit_once('.').map_or(path.as_str(), |(_, leaf)| leaf);
        if leaf.is_empty() {
            return Err(StoreError::ReservedName(leaf.to_string()));
        }
        match path.rsplit_once('.') {
            Some((parent, leaf)) => match self.resolve(parent)? {
                Value::Store(store) => {
                    store.insert(leaf, value);
                    Ok(())
                }
                _ => Err(StoreError::NotAStore(parent.to_string())),
            },
            None => {
                self.insert(path, value);
                Ok(())
            }
        }
    }

    /// Insert a direct entry. The name is used literally, dots included.
    pub fn insert(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.borrow_mut().insert(name.into(), value.into());
    }

    /// Remove a direct entry, preserving the order of the others.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.inner.borrow_mut().shift_remove(name)
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }

    /// Snapshot of the direct entries, in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.inner
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of the direct entry names, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.borrow().keys().cloned().collect()
    }

    /// Deep-merge `other` into this store; `other` wins on conflicts.
    ///
    /// Nested stores present on both sides are merged recursively, so a
    /// sparse overlay only replaces the leaves it actually names.
    pub fn merge_from(&self, other: &Store) {
        for (key, value) in other.entries() {
            match (self.get(&key), value) {
                (Some(Value::Store(mine)), Value::Store(theirs)) if !mine.ptr_eq(&theirs) => {
                    mine.merge_from(&theirs)
                }
                (_, value) => self.insert(key, value),
            }
        }
    }

    /// Stores are never callable.
    pub fn call(&self) -> Result<Value, StoreError> {
        Err(StoreError::NotCallable)
    }

    pub fn bool_at(&self, path: &str) -> Option<bool> {
        self.get_path(path)?.as_bool()
    }

    pub fn f64_at(&self, path: &str) -> Option<f64> {
        self.get_path(path)?.as_f64()
    }

    pub fn str_at(&self, path: &str) -> Option<String> {
        self.get_path(path)?.as_str().map(str::to_string)
    }

    pub fn list_at(&self, path: &str) -> Option<Vec<Value>> {
        self.get_path(path)?.as_list().map(<[Value]>::to_vec)
    }

    /// JSON object view of this subtree, skipping runtime-only values.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .inner
            .borrow()
            .iter()
            .filter_map(|(k, v)| v.to_json().map(|json| (k.clone(), json)))
            .collect();
        serde_json::Value::Object(map)
    }

    fn get_or_vivify(&self, name: &str) -> Result<Value, StoreError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        check_vivifiable(name)?;
        let child = Store::new();
        self.insert(name, Value::Store(child.clone()));
        Ok(Value::Store(child))
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.borrow().iter()).finish()
    }
}

fn check_vivifiable(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || name.starts_with('_')
        || name.contains('(')
        || name.contains('[')
        || RESERVED_NAMES.contains(&name)
    {
        return Err(StoreError::ReservedName(name.to_string()));
    }
    Ok(())
}

/// A strict, fixed-shape bag of values. Missing keys are errors.
#[derive(Debug, Clone, Default)]
pub struct Record {
    values: IndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the direct entries of a store.
    pub fn from_store(store: &Store) -> Self {
        store.entries().into_iter().collect()
    }

    pub fn get(&self, name: &str) -> Result<&Value, StoreError> {
        self.values
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .filter_map(|(k, v)| v.to_json().map(|json| (k.clone(), json)))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
