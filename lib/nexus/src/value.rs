//! The in-memory value algebra carried across connections. Wire encoding of
//! these values is the payload processor's job; this module only defines the
//! shapes and the path-walking used to execute remote operations.

use crate::error::SerializedError;
use crate::rpc::proxy::ResourceProxy;
use indexmap::IndexMap;
use lattice::sequence::Sequence;
use std::fmt;
use std::sync::{Arc, Mutex};

static CALLBACK_TAGS: Sequence = Sequence::new(1);

pub type NativeFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, SerializedError> + Send + Sync>;

/// A locally held function made addressable to remote peers when it crosses
/// a connection. Identity is by handle, not by code.
#[derive(Clone)]
pub struct Callback {
    func: NativeFn,
    tag: u64,
}

impl Callback {
    pub fn new<F>(func: F) -> Callback
    where
        F: Fn(Vec<Value>) -> Result<Value, SerializedError> + Send + Sync + 'static,
    {
        Callback {
            func: Arc::new(func),
            tag: CALLBACK_TAGS.next(),
        }
    }

    #[inline]
    pub fn invoke(&self, args: Vec<Value>) -> Result<Value, SerializedError> {
        (self.func)(args)
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<fn#{}>", self.tag)
    }
}

impl PartialEq for Callback {
    #[inline]
    fn eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

/// A shared, mutable value cell. Wrapping a value in an `ObjectRef` marks it
/// for pass-by-reference: sanitize interns the handle instead of copying the
/// contents.
#[derive(Clone)]
pub struct ObjectRef {
    inner: Arc<Mutex<Value>>,
}

impl ObjectRef {
    pub fn new(value: Value) -> ObjectRef {
        ObjectRef {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Runs `op` against the shared value under the cell lock.
    pub fn with<R>(&self, op: impl FnOnce(&mut Value) -> R) -> R {
        let mut guard = self.inner.lock().expect("Ref cell poisoned");
        op(&mut guard)
    }

    pub fn snapshot(&self) -> Value {
        self.with(|value| value.clone())
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<ref>")
    }
}

impl PartialEq for ObjectRef {
    #[inline]
    fn eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Structured-clonable data plus the three reference-passing variants.
/// `Callback` and `Ref` exist only on the sending side; `Proxy` is minted
/// only by revive on the receiving side.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    String(String),
    BigInt(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Callback(Callback),
    Ref(ObjectRef),
    Proxy(ResourceProxy),
}

impl Value {
    #[inline]
    pub fn string<S: Into<String>>(text: S) -> Value {
        Value::String(text.into())
    }

    pub fn object<I>(entries: I) -> Value
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    pub fn callback<F>(func: F) -> Value
    where
        F: Fn(Vec<Value>) -> Result<Value, SerializedError> + Send + Sync + 'static,
    {
        Value::Callback(Callback::new(func))
    }

    /// Tags a value for pass-by-reference.
    pub fn reference(value: Value) -> Value {
        Value::Ref(ObjectRef::new(value))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::BigInt(_) => "bigint",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Callback(_) => "function",
            Value::Ref(_) => "ref",
            Value::Proxy(_) => "proxy",
        }
    }

    /// Follows `path` through objects and arrays. Array segments must parse
    /// as indices.
    pub fn walk(&self, path: &[String]) -> Option<&Value> {
        let mut current = self;

        for segment in path {
            current = match current {
                Value::Object(fields) => fields.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    pub fn walk_mut(&mut self, path: &[String]) -> Option<&mut Value> {
        let mut current = self;

        for segment in path {
            current = match current {
                Value::Object(fields) => fields.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    /// Assigns into the container at `path`. The parent of the final segment
    /// must already exist; object assignment inserts, array assignment
    /// overwrites an existing index.
    pub fn assign(&mut self, path: &[String], value: Value) -> bool {
        let (last, parents) = match path.split_last() {
            Some(split) => split,
            None => return false,
        };

        match self.walk_mut(parents) {
            Some(Value::Object(fields)) => {
                fields.insert(last.clone(), value);
                true
            }
            Some(Value::Array(items)) => match last.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    items[index] = value;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Callback(a), Value::Callback(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Proxy(a), Value::Proxy(b)) => a.resource_id() == b.resource_id(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(value: bool) -> Value {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(value: f64) -> Value {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(value: i32) -> Value {
        Value::Number(f64::from(value))
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Value {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    #[inline]
    fn from(value: String) -> Value {
        Value::String(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::object(vec![
            ("name", Value::from("calc")),
            (
                "stats",
                Value::object(vec![("calls", Value::from(3)), ("errors", Value::from(0))]),
            ),
            (
                "history",
                Value::Array(vec![Value::from("a"), Value::from("b")]),
            ),
        ])
    }

    #[test]
    fn test_walk_object_path() {
        let value = sample();

        assert_eq!(
            value.walk(&["stats".to_string(), "calls".to_string()]),
            Some(&Value::from(3))
        );
    }

    #[test]
    fn test_walk_array_index() {
        let value = sample();

        assert_eq!(
            value.walk(&["history".to_string(), "1".to_string()]),
            Some(&Value::from("b"))
        );
    }

    #[test]
    fn test_walk_missing() {
        let value = sample();

        assert_eq!(value.walk(&["nope".to_string()]), None);
        assert_eq!(value.walk(&["history".to_string(), "x".to_string()]), None);
        assert_eq!(value.walk(&["name".to_string(), "deeper".to_string()]), None);
    }

    #[test]
    fn test_assign_inserts_object_field() {
        let mut value = sample();

        assert!(value.assign(&["stats".to_string(), "calls".to_string()], Value::from(4)));
        assert_eq!(
            value.walk(&["stats".to_string(), "calls".to_string()]),
            Some(&Value::from(4))
        );
    }

    #[test]
    fn test_assign_rejects_empty_path() {
        let mut value = sample();

        assert!(!value.assign(&[], Value::Null));
    }

    #[test]
    fn test_assign_rejects_array_growth() {
        let mut value = sample();

        assert!(!value.assign(&["history".to_string(), "5".to_string()], Value::Null));
    }

    #[test]
    fn test_callback_identity() {
        let a = Callback::new(|_| Ok(Value::Null));
        let b = a.clone();
        let c = Callback::new(|_| Ok(Value::Null));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ref_shares_state() {
        let cell = ObjectRef::new(Value::object(vec![("count", Value::from(0))]));
        let alias = cell.clone();

        alias.with(|value| {
            assert!(value.assign(&["count".to_string()], Value::from(1)));
        });

        assert_eq!(
            cell.snapshot().walk(&["count".to_string()]),
            Some(&Value::from(1))
        );
    }

    #[test]
    fn test_callback_invoke() {
        let callback = Callback::new(|args| match (&args[0], &args[1]) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            _ => Err(SerializedError::new("TypeError", "ERR_ARGS", "numbers required")),
        });

        assert_eq!(
            callback.invoke(vec![Value::from(1), Value::from(2)]),
            Ok(Value::from(3))
        );
    }
}
