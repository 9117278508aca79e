//! Handler argument resolution.
//!
//! Handlers declare what they need as a list of [`ArgumentDescriptor`]s. Before
//! each invocation the executor asks the configured [`ArgumentResolver`]s to
//! supply every declared argument and hands the handler an [`Arguments`] bag.
//!
//! Three resolvers ship with the bus:
//!
//! | Resolver | Supplies |
//! |---|---|
//! | [`MessageArgumentResolver`] | the decoded message |
//! | [`ContextArgumentResolver`] | the [`MessageContext`] |
//! | [`ContainerArgumentResolver`] | a named service from [`Dependencies`] |

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::MessageContext;
use crate::error::ExecutionError;

/// What kind of value an argument expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgumentKind {
    /// The decoded message.
    Message,
    /// The execution context.
    Context,
    /// A named service.
    Dependency(String),
}

/// A declared handler parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgumentDescriptor {
    /// Parameter name.
    pub name: String,
    /// Expected value.
    pub kind: ArgumentKind,
}

impl ArgumentDescriptor {
    /// Parameter receiving the decoded message.
    pub fn message(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgumentKind::Message,
        }
    }

    /// Parameter receiving the execution context.
    pub fn context(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgumentKind::Context,
        }
    }

    /// Parameter receiving the service registered as `service`.
    pub fn dependency(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgumentKind::Dependency(service.into()),
        }
    }
}

/// A resolved argument value.
#[derive(Clone)]
pub enum ArgumentValue {
    /// The decoded message.
    Message(Arc<dyn Any + Send + Sync>),
    /// The execution context.
    Context(MessageContext),
    /// A service instance.
    Service(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for ArgumentValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgumentValue::Message(_) => f.write_str("Message(..)"),
            ArgumentValue::Context(ctx) => f.debug_tuple("Context").field(ctx).finish(),
            ArgumentValue::Service(_) => f.write_str("Service(..)"),
        }
    }
}

/// Supplies values for declared arguments.
pub trait ArgumentResolver: Send + Sync + 'static {
    /// Whether this resolver handles the descriptor at all.
    fn supports(&self, descriptor: &ArgumentDescriptor) -> bool;

    /// Produce the value, or `None` if it is unavailable.
    fn resolve(
        &self,
        descriptor: &ArgumentDescriptor,
        message: &Arc<dyn Any + Send + Sync>,
        context: &MessageContext,
    ) -> Option<ArgumentValue>;
}

/// Resolves [`ArgumentKind::Message`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageArgumentResolver;

impl ArgumentResolver for MessageArgumentResolver {
    fn supports(&self, descriptor: &ArgumentDescriptor) -> bool {
        descriptor.kind == ArgumentKind::Message
    }

    fn resolve(
        &self,
        _descriptor: &ArgumentDescriptor,
        message: &Arc<dyn Any + Send + Sync>,
        _context: &MessageContext,
    ) -> Option<ArgumentValue> {
        Some(ArgumentValue::Message(message.clone()))
    }
}

/// Resolves [`ArgumentKind::Context`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextArgumentResolver;

impl ArgumentResolver for ContextArgumentResolver {
    fn supports(&self, descriptor: &ArgumentDescriptor) -> bool {
        descriptor.kind == ArgumentKind::Context
    }

    fn resolve(
        &self,
        _descriptor: &ArgumentDescriptor,
        _message: &Arc<dyn Any + Send + Sync>,
        context: &MessageContext,
    ) -> Option<ArgumentValue> {
        Some(ArgumentValue::Context(context.clone()))
    }
}

/// Named services available to handlers.
#[derive(Default, Clone)]
pub struct Dependencies {
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Dependencies {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under `name`, replacing any previous one.
    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, service: Arc<T>) {
        self.services.insert(name.into(), service);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with<T: Send + Sync + 'static>(mut self, name: impl Into<String>, service: Arc<T>) -> Self {
        self.insert(name, service);
        self
    }

    /// Typed lookup.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get(name)?.clone().downcast::<T>().ok()
    }

    fn get_raw(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(name).cloned()
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolves [`ArgumentKind::Dependency`] from a [`Dependencies`] container.
#[derive(Debug, Clone)]
pub struct ContainerArgumentResolver {
    dependencies: Arc<Dependencies>,
}

impl ContainerArgumentResolver {
    /// Create a resolver over `dependencies`.
    pub fn new(dependencies: Arc<Dependencies>) -> Self {
        Self { dependencies }
    }
}

impl ArgumentResolver for ContainerArgumentResolver {
    fn supports(&self, descriptor: &ArgumentDescriptor) -> bool {
        matches!(descriptor.kind, ArgumentKind::Dependency(_))
    }

    fn resolve(
        &self,
        descriptor: &ArgumentDescriptor,
        _message: &Arc<dyn Any + Send + Sync>,
        _context: &MessageContext,
    ) -> Option<ArgumentValue> {
        match &descriptor.kind {
            ArgumentKind::Dependency(service) => {
                self.dependencies.get_raw(service).map(ArgumentValue::Service)
            }
            _ => None,
        }
    }
}

/// Resolved arguments, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: HashMap<String, ArgumentValue>,
}

impl Arguments {
    /// Resolve every descriptor, failing on the first one nobody can supply.
    pub fn resolve(
        handler: &str,
        descriptors: &[ArgumentDescriptor],
        resolvers: &[Arc<dyn ArgumentResolver>],
        message: &Arc<dyn Any + Send + Sync>,
        context: &MessageContext,
    ) -> Result<Self, ExecutionError> {
        let mut values = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let value = resolvers
                .iter()
                .filter(|resolver| resolver.supports(descriptor))
                .find_map(|resolver| resolver.resolve(descriptor, message, context))
                .ok_or_else(|| ExecutionError::UnresolvedArgument {
                    handler: handler.to_string(),
                    argument: descriptor.name.clone(),
                })?;
            values.insert(descriptor.name.clone(), value);
        }

        Ok(Self { values })
    }

    /// The decoded message, if it was declared and has type `M`.
    pub fn message<M: Any>(&self) -> Option<&M> {
        self.values.values().find_map(|value| match value {
            ArgumentValue::Message(message) => message.downcast_ref::<M>(),
            _ => None,
        })
    }

    /// The execution context, if it was declared.
    pub fn context(&self) -> Option<&MessageContext> {
        self.values.values().find_map(|value| match value {
            ArgumentValue::Context(ctx) => Some(ctx),
            _ => None,
        })
    }

    /// The service bound to parameter `name`, if it has type `T`.
    pub fn dependency<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        match self.values.get(name)? {
            ArgumentValue::Service(service) => service.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Raw value for parameter `name`.
    pub fn get(&self, name: &str) -> Option<&ArgumentValue> {
        self.values.get(name)
    }

    /// Number of resolved arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if no arguments were declared.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The resolvers every bus starts with.
pub fn default_resolvers(dependencies: Arc<Dependencies>) -> Vec<Arc<dyn ArgumentResolver>> {
    vec![
        Arc::new(MessageArgumentResolver),
        Arc::new(ContextArgumentResolver),
        Arc::new(ContainerArgumentResolver::new(dependencies)),
    ]
}
