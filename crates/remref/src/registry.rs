//! Shared function registry and argument validation.
//!
//! Named functions are registered with a signature on every worker (the
//! registry is constructed identically cluster-wide, out of band). The
//! caller validates and binds arguments against its local copy of the
//! signature before anything is sent, so an `ArgumentMismatch` is always
//! a local error. Builtin operators are dispatched by name on the callee
//! without a registered signature, and opaque user functions go through
//! the pluggable [`UdfExecutor`] boundary.

use crate::types::{RpcError, RpcResult, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Expected kind of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Integer number.
    Int,
    /// Any number (integer or floating point).
    Float,
    /// Boolean.
    Bool,
    /// String.
    Str,
    /// Any value.
    Any,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::Int => value.is_i64() || value.is_u64(),
            ParamKind::Float => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Str => value.is_string(),
            ParamKind::Any => true,
        }
    }
}

/// A named, typed parameter of a registered function.
#[derive(Debug, Clone)]
pub struct Param {
    /// Parameter name, usable as a keyword.
    pub name: String,
    /// Expected kind.
    pub kind: ParamKind,
}

impl Param {
    /// Create a new parameter.
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// The registered signature of a named function.
#[derive(Debug, Clone)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    /// Create a signature from its parameter list.
    pub fn new(params: Vec<Param>) -> Self {
        Self { params }
    }

    /// The registered parameters, in positional order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Bind positional and keyword arguments to the parameter list.
    ///
    /// Positional arguments fill parameters left to right; keyword
    /// arguments fill the remainder by name. Every parameter must be
    /// bound exactly once and match its expected kind.
    ///
    /// # Errors
    ///
    /// Returns `ArgumentMismatch` for surplus positional arguments,
    /// duplicate or unknown keywords, missing parameters, or kind
    /// mismatches.
    pub fn bind(&self, args: Vec<Value>, kwargs: HashMap<String, Value>) -> RpcResult<Vec<Value>> {
        if args.len() > self.params.len() {
            return Err(RpcError::ArgumentMismatch(format!(
                "expected at most {} positional arguments, got {}",
                self.params.len(),
                args.len()
            )));
        }

        let mut bound: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        bound.resize_with(self.params.len(), || None);

        let mut kwargs = kwargs;
        for (i, param) in self.params.iter().enumerate() {
            if let Some(value) = kwargs.remove(&param.name) {
                if bound[i].is_some() {
                    return Err(RpcError::ArgumentMismatch(format!(
                        "parameter '{}' bound both positionally and by keyword",
                        param.name
                    )));
                }
                bound[i] = Some(value);
            }
        }

        if let Some(name) = kwargs.keys().next() {
            return Err(RpcError::ArgumentMismatch(format!(
                "unknown keyword argument '{}'",
                name
            )));
        }

        let mut out = Vec::with_capacity(self.params.len());
        for (param, slot) in self.params.iter().zip(bound) {
            let value = slot.ok_or_else(|| {
                RpcError::ArgumentMismatch(format!("missing argument '{}'", param.name))
            })?;
            if !param.kind.matches(&value) {
                return Err(RpcError::ArgumentMismatch(format!(
                    "argument '{}' has the wrong kind (expected {:?})",
                    param.name, param.kind
                )));
            }
            out.push(value);
        }
        Ok(out)
    }
}

/// Handler invoked on the callee for a named function or builtin operator.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> RpcResult<Value> + Send + Sync>;

/// Registry of named functions and builtin operators.
///
/// Lookups and registrations are individually atomic; the registry is
/// expected to be populated at startup and shared read-mostly afterwards.
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, (Signature, Handler)>>,
    ops: RwLock<HashMap<String, Handler>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
            ops: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry pre-populated with the builtin operators
    /// (`identity`, `add`, `sub`, `mul`, `concat`).
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_op("identity", |mut args| {
            if args.len() != 1 {
                return Err(RpcError::RemoteExecution(
                    "identity expects exactly one argument".to_string(),
                ));
            }
            Ok(args.remove(0))
        });
        registry.register_op("add", |args| {
            numeric_binop(&args, "add", i64::checked_add, |a, b| a + b)
        });
        registry.register_op("sub", |args| {
            numeric_binop(&args, "sub", i64::checked_sub, |a, b| a - b)
        });
        registry.register_op("mul", |args| {
            numeric_binop(&args, "mul", i64::checked_mul, |a, b| a * b)
        });
        registry.register_op("concat", |args| {
            let mut out = String::new();
            for arg in &args {
                match arg.as_str() {
                    Some(s) => out.push_str(s),
                    None => {
                        return Err(RpcError::RemoteExecution(
                            "concat expects string arguments".to_string(),
                        ))
                    }
                }
            }
            Ok(Value::from(out))
        });
        registry
    }

    /// Register a named function with its signature.
    ///
    /// Re-registering a name replaces the previous entry.
    pub fn register_function(
        &self,
        name: impl Into<String>,
        signature: Signature,
        handler: impl Fn(Vec<Value>) -> RpcResult<Value> + Send + Sync + 'static,
    ) {
        let name = name.into();
        debug!("registering function '{}'", name);
        self.functions
            .write()
            .expect("registry lock poisoned")
            .insert(name, (signature, Arc::new(handler)));
    }

    /// Register a builtin operator.
    pub fn register_op(
        &self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Value>) -> RpcResult<Value> + Send + Sync + 'static,
    ) {
        self.ops
            .write()
            .expect("registry lock poisoned")
            .insert(name.into(), Arc::new(handler));
    }

    /// Resolve the signature of a named function.
    ///
    /// # Errors
    ///
    /// Returns `ArgumentMismatch` naming the function if it is not
    /// registered; resolution failures are local errors.
    pub fn resolve(&self, name: &str) -> RpcResult<Signature> {
        self.functions
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .map(|(sig, _)| sig.clone())
            .ok_or_else(|| {
                RpcError::ArgumentMismatch(format!("function '{}' is not registered", name))
            })
    }

    /// Invoke a named function with already-bound positional arguments.
    pub fn invoke_function(&self, name: &str, args: Vec<Value>) -> RpcResult<Value> {
        let handler = self
            .functions
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .map(|(_, h)| Arc::clone(h))
            .ok_or_else(|| {
                RpcError::RemoteExecution(format!("function '{}' is not registered", name))
            })?;
        handler(args)
    }

    /// Invoke a builtin operator.
    pub fn invoke_op(&self, op: &str, args: Vec<Value>) -> RpcResult<Value> {
        let handler = self
            .ops
            .read()
            .expect("registry lock poisoned")
            .get(op)
            .cloned()
            .ok_or_else(|| {
                RpcError::RemoteExecution(format!("unknown builtin operator '{}'", op))
            })?;
        handler(args)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn numeric_binop(
    args: &[Value],
    op: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> RpcResult<Value> {
    if args.len() != 2 {
        return Err(RpcError::RemoteExecution(format!(
            "{} expects exactly two arguments",
            op
        )));
    }
    // Integers that fit stay integers; overflow falls back to f64.
    if let (Some(a), Some(b)) = (args[0].as_i64(), args[1].as_i64()) {
        if let Some(v) = int_op(a, b) {
            return Ok(Value::from(v));
        }
    }
    match (args[0].as_f64(), args[1].as_f64()) {
        (Some(a), Some(b)) => Ok(Value::from(float_op(a, b))),
        _ => Err(RpcError::RemoteExecution(format!(
            "{} expects numeric arguments",
            op
        ))),
    }
}

/// Executor for opaque user-function payloads.
///
/// The blob format and its interpretation are external concerns; the
/// callee only needs an "invoke blob with tensors, get value" capability.
pub trait UdfExecutor: Send + Sync {
    /// Execute the serialized user function with its tensor arguments.
    fn execute(&self, payload: &[u8], tensors: &[Vec<u8>]) -> RpcResult<Value>;
}

/// Default executor for processes that do not serve user functions.
pub struct UnsupportedUdfExecutor;

impl UdfExecutor for UnsupportedUdfExecutor {
    fn execute(&self, _payload: &[u8], _tensors: &[Vec<u8>]) -> RpcResult<Value> {
        Err(RpcError::RemoteExecution(
            "this worker has no user-function executor configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_int_sig() -> Signature {
        Signature::new(vec![
            Param::new("a", ParamKind::Int),
            Param::new("b", ParamKind::Int),
        ])
    }

    #[test]
    fn test_bind_positional() {
        let sig = two_int_sig();
        let bound = sig.bind(vec![json!(2), json!(3)], HashMap::new()).unwrap();
        assert_eq!(bound, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_bind_keywords() {
        let sig = two_int_sig();
        let mut kwargs = HashMap::new();
        kwargs.insert("b".to_string(), json!(3));
        let bound = sig.bind(vec![json!(2)], kwargs).unwrap();
        assert_eq!(bound, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_bind_too_many_positional() {
        let sig = two_int_sig();
        let err = sig
            .bind(vec![json!(1), json!(2), json!(3)], HashMap::new())
            .unwrap_err();
        assert!(matches!(err, RpcError::ArgumentMismatch(_)));
    }

    #[test]
    fn test_bind_missing_argument() {
        let sig = two_int_sig();
        let err = sig.bind(vec![json!(1)], HashMap::new()).unwrap_err();
        assert!(matches!(err, RpcError::ArgumentMismatch(_)));
    }

    #[test]
    fn test_bind_unknown_keyword() {
        let sig = two_int_sig();
        let mut kwargs = HashMap::new();
        kwargs.insert("c".to_string(), json!(1));
        let err = sig.bind(vec![json!(1), json!(2)], kwargs).unwrap_err();
        assert!(matches!(err, RpcError::ArgumentMismatch(_)));
    }

    #[test]
    fn test_bind_duplicate_binding() {
        let sig = two_int_sig();
        let mut kwargs = HashMap::new();
        kwargs.insert("a".to_string(), json!(1));
        let err = sig.bind(vec![json!(1), json!(2)], kwargs).unwrap_err();
        assert!(matches!(err, RpcError::ArgumentMismatch(_)));
    }

    #[test]
    fn test_bind_kind_mismatch() {
        let sig = two_int_sig();
        let err = sig
            .bind(vec![json!(1), json!("two")], HashMap::new())
            .unwrap_err();
        assert!(matches!(err, RpcError::ArgumentMismatch(_)));
    }

    #[test]
    fn test_builtin_add() {
        let registry = FunctionRegistry::with_builtins();
        let v = registry
            .invoke_op("add", vec![json!(2), json!(3)])
            .unwrap();
        assert_eq!(v, json!(5));

        let v = registry
            .invoke_op("add", vec![json!(2.5), json!(3)])
            .unwrap();
        assert_eq!(v.as_f64().unwrap(), 5.5);
    }

    #[test]
    fn test_builtin_arithmetic_overflow_widens_to_float() {
        let registry = FunctionRegistry::with_builtins();

        let v = registry
            .invoke_op("add", vec![json!(i64::MAX), json!(1)])
            .unwrap();
        assert_eq!(v.as_f64().unwrap(), i64::MAX as f64 + 1.0);

        let v = registry
            .invoke_op("mul", vec![json!(i64::MAX), json!(2)])
            .unwrap();
        assert_eq!(v.as_f64().unwrap(), i64::MAX as f64 * 2.0);

        let v = registry
            .invoke_op("sub", vec![json!(i64::MIN), json!(1)])
            .unwrap();
        assert_eq!(v.as_f64().unwrap(), i64::MIN as f64 - 1.0);
    }

    #[test]
    fn test_builtin_identity_and_concat() {
        let registry = FunctionRegistry::with_builtins();
        let v = registry
            .invoke_op("identity", vec![json!({"k": [1, 2]})])
            .unwrap();
        assert_eq!(v, json!({"k": [1, 2]}));

        let v = registry
            .invoke_op("concat", vec![json!("foo"), json!("bar")])
            .unwrap();
        assert_eq!(v, json!("foobar"));
    }

    #[test]
    fn test_unknown_op() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry.invoke_op("frobnicate", vec![]).unwrap_err();
        assert!(matches!(err, RpcError::RemoteExecution(_)));
    }

    #[test]
    fn test_resolve_and_invoke_function() {
        let registry = FunctionRegistry::new();
        registry.register_function("math.scale", two_int_sig(), |args| {
            let a = args[0].as_i64().unwrap();
            let b = args[1].as_i64().unwrap();
            Ok(json!(a * b))
        });

        let sig = registry.resolve("math.scale").unwrap();
        assert_eq!(sig.params().len(), 2);

        let v = registry
            .invoke_function("math.scale", vec![json!(4), json!(5)])
            .unwrap();
        assert_eq!(v, json!(20));

        assert!(registry.resolve("math.other").is_err());
    }

    #[test]
    fn test_unsupported_udf_executor() {
        let exec = UnsupportedUdfExecutor;
        assert!(exec.execute(b"blob", &[]).is_err());
    }
}
