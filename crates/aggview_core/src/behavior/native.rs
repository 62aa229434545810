//! Native implementation registry.
//!
//! # Responsibility
//! - Map implementation names to factories producing behavior handles.
//! - Configure each produced behavior from the spec's named parameters.
//!
//! # Invariants
//! - Names follow the `segment(.segment)*` lowercase id convention.
//! - Every spec parameter must be consumed by the factory; leftovers fail
//!   resolution with `UnknownParameter`.

use crate::behavior::builtin;
use crate::behavior::capability::BehaviorHandle;
use crate::behavior::resolver::ResolveError;
use log::debug;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::str::FromStr;
use std::sync::Arc;

/// Builds one configured behavior from its parameters.
pub type NativeFactory =
    Arc<dyn Fn(&mut NativeParams) -> Result<BehaviorHandle, ResolveError> + Send + Sync>;

/// Named parameters handed to a factory.
///
/// Each accessor consumes the parameter it reads.
#[derive(Debug)]
pub struct NativeParams {
    implementation: String,
    remaining: BTreeMap<String, String>,
}

impl NativeParams {
    fn new(implementation: &str, params: &BTreeMap<String, String>) -> Self {
        Self {
            implementation: implementation.to_string(),
            remaining: params.clone(),
        }
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    pub fn optional(&mut self, name: &str) -> Option<String> {
        self.remaining.remove(name)
    }

    pub fn required(&mut self, name: &str) -> Result<String, ResolveError> {
        self.optional(name)
            .ok_or_else(|| ResolveError::MissingParameter {
                implementation: self.implementation.clone(),
                name: name.to_string(),
            })
    }

    /// Parses an optional parameter with `FromStr`.
    pub fn parsed<T>(&mut self, name: &str) -> Result<Option<T>, ResolveError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.optional(name) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ResolveError::InvalidParameter {
                implementation: self.implementation.clone(),
                name: name.to_string(),
                message: err.to_string(),
            })
    }

    pub fn required_parsed<T>(&mut self, name: &str) -> Result<T, ResolveError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parsed(name)?
            .ok_or_else(|| ResolveError::MissingParameter {
                implementation: self.implementation.clone(),
                name: name.to_string(),
            })
    }

    /// `InvalidParameter` error for `name` on this implementation.
    pub fn invalid(&self, name: &str, message: impl Into<String>) -> ResolveError {
        ResolveError::InvalidParameter {
            implementation: self.implementation.clone(),
            name: name.to_string(),
            message: message.into(),
        }
    }

    fn finish(self) -> Result<(), ResolveError> {
        match self.remaining.into_keys().next() {
            Some(name) => Err(ResolveError::UnknownParameter {
                implementation: self.implementation,
                name,
            }),
            None => Ok(()),
        }
    }
}

/// Registry of native implementations keyed by name.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    factories: BTreeMap<String, NativeFactory>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `builtin.*` implementations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::install(&mut registry);
        registry
    }

    /// Registers one factory under `name`.
    ///
    /// # Errors
    /// - `InvalidSpec` when the name is not a valid implementation id.
    /// - `DuplicateRegistration` when the name is taken.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), ResolveError>
    where
        F: Fn(&mut NativeParams) -> Result<BehaviorHandle, ResolveError> + Send + Sync + 'static,
    {
        let name = name.trim();
        if !is_valid_implementation_name(name) {
            return Err(ResolveError::InvalidSpec(format!(
                "invalid native implementation name `{name}`"
            )));
        }
        if self.factories.contains_key(name) {
            return Err(ResolveError::DuplicateRegistration(name.to_string()));
        }
        self.insert(name, Arc::new(factory));
        Ok(())
    }

    pub(crate) fn insert(&mut self, name: &str, factory: NativeFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name.trim())
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Looks `name` up and configures a fresh instance from `params`.
    pub fn instantiate(
        &self,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<BehaviorHandle, ResolveError> {
        let name = name.trim();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ResolveError::UnknownImplementation(name.to_string()))?;
        let mut reader = NativeParams::new(name, params);
        let handle = factory(&mut reader)?;
        reader.finish()?;
        debug!(
            "event=native_instantiated module=behavior status=ok name={} params={} product={}",
            name,
            params.len(),
            handle.product_name()
        );
        Ok(handle)
    }
}

impl Debug for NativeRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("names", &self.names())
            .finish()
    }
}

pub(crate) fn is_valid_implementation_name(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }

    let mut prev_separator = false;
    for c in chars {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prev_separator = false;
            continue;
        }
        if c == '.' || c == '_' || c == '-' {
            if prev_separator {
                return false;
            }
            prev_separator = true;
            continue;
        }
        return false;
    }
    !prev_separator
}

#[cfg(test)]
mod tests {
    use super::{is_valid_implementation_name, NativeRegistry};
    use crate::behavior::capability::{BehaviorHandle, ScriptValue};
    use crate::behavior::resolver::ResolveError;
    use std::collections::BTreeMap;

    fn echo_registry() -> NativeRegistry {
        let mut registry = NativeRegistry::new();
        registry
            .register("acme.echo", |params| {
                let reply = params.required("reply")?;
                let _times: Option<u32> = params.parsed("times")?;
                Ok(BehaviorHandle::function(move |_| {
                    Ok(ScriptValue::Text(reply.clone()))
                }))
            })
            .expect("register echo");
        registry
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn instantiates_with_consumed_params() {
        let registry = echo_registry();
        let handle = registry
            .instantiate("acme.echo", &params(&[("reply", "hi"), ("times", "2")]))
            .expect("instantiate");
        assert_eq!(handle.product_name(), "function");
    }

    #[test]
    fn unknown_parameter_fails() {
        let registry = echo_registry();
        let err = registry
            .instantiate("acme.echo", &params(&[("reply", "hi"), ("colour", "red")]))
            .expect_err("colour is not a setter");
        assert_eq!(
            err,
            ResolveError::UnknownParameter {
                implementation: "acme.echo".into(),
                name: "colour".into()
            }
        );
    }

    #[test]
    fn missing_and_invalid_parameters_fail() {
        let registry = echo_registry();
        let missing = registry
            .instantiate("acme.echo", &BTreeMap::new())
            .expect_err("reply is required");
        assert!(matches!(missing, ResolveError::MissingParameter { .. }));

        let invalid = registry
            .instantiate("acme.echo", &params(&[("reply", "hi"), ("times", "-1")]))
            .expect_err("times must be unsigned");
        assert!(matches!(invalid, ResolveError::InvalidParameter { .. }));
    }

    #[test]
    fn rejects_duplicate_and_invalid_names() {
        let mut registry = echo_registry();
        let err = registry
            .register("acme.echo", |_| Ok(BehaviorHandle::function(|_| Ok(ScriptValue::Unit))))
            .expect_err("duplicate");
        assert_eq!(err, ResolveError::DuplicateRegistration("acme.echo".into()));

        assert!(!is_valid_implementation_name("Acme.Echo"));
        assert!(!is_valid_implementation_name("acme..echo"));
        assert!(is_valid_implementation_name("builtin.melder.sum"));
    }

    #[test]
    fn unknown_name_fails() {
        let err = NativeRegistry::new()
            .instantiate("acme.none", &BTreeMap::new())
            .expect_err("not registered");
        assert_eq!(err, ResolveError::UnknownImplementation("acme.none".into()));
    }

    #[test]
    fn builtins_are_preloaded() {
        let registry = NativeRegistry::with_builtins();
        assert!(registry.contains("builtin.melder.sum"));
        assert!(registry.contains("builtin.predicate.always"));
        assert_eq!(registry.len(), 6);
    }
}
