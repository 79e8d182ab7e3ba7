use std::collections::HashMap;

use coap_lite::RequestType;
use log::{debug, warn};

use crate::router::method::{method_name, RequestTypeKey};
use crate::router::request_handler::RequestHandler;

/// Set of (path, method) → handler bindings served by one endpoint.  Paths are compared by
/// their segments so `/a/b`, `a/b` and `/a/b/` all name the same resource.
pub struct ResourceRegistry<Endpoint> {
    bindings_by_path: HashMap<Vec<String>, Vec<ResourceBinding<Endpoint>>>,
}

pub struct ResourceBinding<Endpoint> {
    path: String,
    method: RequestType,
    handler: Box<dyn RequestHandler<Endpoint>>,
}

impl<Endpoint> ResourceBinding<Endpoint> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> RequestType {
        self.method
    }

    fn key(&self) -> RequestTypeKey {
        RequestTypeKey::from(self.method)
    }
}

/// Outcome of a route lookup.  Path and method misses are kept apart so the dispatcher can
/// answer 4.04 and 4.05 respectively.
pub enum MatchResult<Endpoint> {
    NoPathMatch,
    PathMatchNoMethodMatch,
    Matched(Vec<Box<dyn RequestHandler<Endpoint>>>),
}

impl<Endpoint> Default for ResourceRegistry<Endpoint> {
    fn default() -> Self {
        Self {
            bindings_by_path: HashMap::new(),
        }
    }
}

impl<Endpoint> ResourceRegistry<Endpoint> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a binding unless one already exists for the same path and method, in which case the
    /// existing binding is left untouched and the new one is refused.
    pub fn register(
        &mut self,
        path: &str,
        method: RequestType,
        handler: impl RequestHandler<Endpoint>,
    ) -> Result<(), RegistryError> {
        self.register_boxed(path, method, Box::new(handler))
    }

    pub fn register_boxed(
        &mut self,
        path: &str,
        method: RequestType,
        handler: Box<dyn RequestHandler<Endpoint>>,
    ) -> Result<(), RegistryError> {
        if RequestTypeKey::from(method) == RequestTypeKey::from(RequestType::UnKnown) {
            return Err(RegistryError::UnsupportedMethod(method_name(method)));
        }
        let path = normalize_path(path);
        if self.contains(&path, method) {
            warn!("Resource {} {path} already exists, refusing", method_name(method));
            return Err(RegistryError::DuplicateBinding {
                path,
                method: method_name(method),
            });
        }
        debug!("Registered {} {path}", method_name(method));
        self.bindings_by_path
            .entry(key_from_path(&path))
            .or_default()
            .push(ResourceBinding {
                path,
                method,
                handler,
            });
        Ok(())
    }

    /// Removes the binding for `path` and `method`, returning whether one was present.
    pub fn unregister(&mut self, path: &str, method: RequestType) -> bool {
        let key = key_from_path(path);
        let method_key = RequestTypeKey::from(method);
        let Some(bindings) = self.bindings_by_path.get_mut(&key) else {
            return false;
        };
        let before = bindings.len();
        bindings.retain(|b| b.key() != method_key);
        let removed = bindings.len() != before;
        if bindings.is_empty() {
            self.bindings_by_path.remove(&key);
        }
        removed
    }

    pub fn contains(&self, path: &str, method: RequestType) -> bool {
        let method_key = RequestTypeKey::from(method);
        self.bindings_by_path
            .get(&key_from_path(path))
            .map_or(false, |bindings| bindings.iter().any(|b| b.key() == method_key))
    }

    /// Looks up every handler bound to exactly `path` and `method`.
    pub fn lookup(&self, path: &[String], method: RequestType) -> MatchResult<Endpoint> {
        let Some(bindings) = self.bindings_by_path.get(path) else {
            return MatchResult::NoPathMatch;
        };
        let method_key = RequestTypeKey::from(method);
        let handlers: Vec<_> = bindings
            .iter()
            .filter(|b| b.key() == method_key)
            .map(|b| dyn_clone::clone_box(b.handler.as_ref()))
            .collect();
        if handlers.is_empty() {
            MatchResult::PathMatchNoMethodMatch
        } else {
            MatchResult::Matched(handlers)
        }
    }

    pub fn lookup_path(&self, path: &str, method: RequestType) -> MatchResult<Endpoint> {
        self.lookup(&key_from_path(path), method)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ResourceBinding<Endpoint>> {
        self.bindings_by_path.values().flatten()
    }

    pub fn clear(&mut self) {
        self.bindings_by_path.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings_by_path.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings_by_path.is_empty()
    }
}

/// Ensures the path begins with `/`.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub fn key_from_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("resource with the specified path and method already exists: {method} {path}")]
    DuplicateBinding { path: String, method: &'static str },

    #[error("cannot bind a resource to method {0}")]
    UnsupportedMethod(&'static str),
}
