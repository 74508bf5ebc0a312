// Services Module
//
// INTENTION:
// Define what a callable service is on the server side. A service object
// exposes named actions; each action is an explicit handler taking the
// decoded parameter list and returning a future of the result. Nothing is
// looked up by reflection: the set of invocable actions is whatever the
// object reports at registration time.
//
// Synchronous actions are wrapped in an already-completed future, so the
// dispatcher only ever awaits.

pub mod dispatcher;
pub mod service_registry;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use dispatcher::CallDispatcher;
pub use service_registry::{RegisteredService, ServiceRegistry};

/// Future returned by every action handler
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Handler for a service action
///
/// INTENTION: One uniform signature for every action so handlers can be
/// stored in a table and invoked without knowing how they were written.
pub type ActionHandler = Arc<dyn Fn(Vec<Value>) -> ServiceFuture + Send + Sync>;

/// Which actions of an alias may be called remotely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermittedActions {
    AllowAll,
    Only(BTreeSet<String>),
}

impl PermittedActions {
    pub fn allows(&self, action: &str) -> bool {
        match self {
            PermittedActions::AllowAll => true,
            PermittedActions::Only(actions) => actions.contains(action),
        }
    }

    pub fn is_allow_all(&self) -> bool {
        matches!(self, PermittedActions::AllowAll)
    }
}

impl std::fmt::Display for PermittedActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermittedActions::AllowAll => write!(f, "*"),
            PermittedActions::Only(actions) => {
                let names: Vec<&str> = actions.iter().map(String::as_str).collect();
                write!(f, "[{}]", names.join(", "))
            }
        }
    }
}

/// A local object whose actions can be registered under an alias
pub trait ServiceObject: Send + Sync {
    /// Default alias when a registration does not name one
    fn name(&self) -> &str;

    /// The handler for `action`, if the object exposes it
    fn action(&self, action: &str) -> Option<ActionHandler>;

    fn action_names(&self) -> Vec<String>;
}

/// Wrap a plain closure as an action handler
pub fn sync_action<F>(f: F) -> ActionHandler
where
    F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(move |params: Vec<Value>| -> ServiceFuture {
        let result = f(params);
        Box::pin(async move { result })
    })
}

/// Service object built from closures
///
/// ```rust
/// use beacon_node::services::LocalService;
/// use serde_json::{json, Value};
///
/// let service = LocalService::new("strings")
///     .with_sync_action("upper", |params| {
///         let s = params.first().and_then(Value::as_str).unwrap_or_default();
///         Ok(json!(s.to_uppercase()))
///     });
/// ```
#[derive(Clone)]
pub struct LocalService {
    name: String,
    actions: HashMap<String, ActionHandler>,
}

impl LocalService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: HashMap::new(),
        }
    }

    /// Add an async action
    pub fn with_action<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: ActionHandler =
            Arc::new(move |params: Vec<Value>| -> ServiceFuture { Box::pin(handler(params)) });
        self.actions.insert(name.into(), handler);
        self
    }

    pub fn with_sync_action<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), sync_action(handler));
        self
    }
}

impl ServiceObject for LocalService {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self, action: &str) -> Option<ActionHandler> {
        self.actions.get(action).cloned()
    }

    fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for LocalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalService")
            .field("name", &self.name)
            .field("actions", &self.action_names())
            .finish()
    }
}

/// What a server asks to expose: an object, the alias to publish it under
/// and the actions callers may use (empty means all of them).
#[derive(Clone)]
pub struct ServiceRegistration {
    pub alias: String,
    pub service: Arc<dyn ServiceObject>,
    pub actions: Vec<String>,
}

impl ServiceRegistration {
    /// Register `service` under its own name with every action allowed
    pub fn new(service: Arc<dyn ServiceObject>) -> Self {
        Self {
            alias: service.name().to_string(),
            service,
            actions: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }
}
