//! Message type to executor routing.
//!
//! The routing table is built once at startup from the registered
//! [`HandlerDescriptor`](crate::HandlerDescriptor)s and never changes after.
//! Commands are point-to-point (one handler per type), events fan out to
//! every listener in registration order.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::RouterError;
use crate::executor::MessageExecutor;
use crate::handler::HandlerKind;

type Executors = SmallVec<[Arc<dyn MessageExecutor>; 2]>;

struct Route {
    name: &'static str,
    has_command_handler: bool,
    executors: Executors,
}

/// Maps message types to their executors.
#[derive(Default)]
pub struct MessageRouter {
    routes: HashMap<TypeId, Route>,
    names: HashMap<&'static str, TypeId>,
}

impl MessageRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an executor for a message type.
    ///
    /// Fails when a second command handler is registered for the same type,
    /// or when `name` already routes another type.
    pub fn register(
        &mut self,
        kind: HandlerKind,
        type_id: TypeId,
        name: &'static str,
        executor: Arc<dyn MessageExecutor>,
    ) -> Result<(), RouterError> {
        if let Some(existing) = self.names.get(name) {
            if *existing != type_id {
                return Err(RouterError::NamespaceConflict {
                    namespace: name.to_string(),
                });
            }
        }

        let route = self.routes.entry(type_id).or_insert_with(|| Route {
            name,
            has_command_handler: false,
            executors: SmallVec::new(),
        });

        if kind == HandlerKind::Command {
            if route.has_command_handler {
                return Err(RouterError::DuplicateCommandHandler {
                    message: name.to_string(),
                });
            }
            route.has_command_handler = true;
        }

        route.executors.push(executor);
        self.names.insert(name, type_id);
        Ok(())
    }

    /// Executors for a message type, in registration order.
    pub fn match_executors(&self, type_id: TypeId) -> &[Arc<dyn MessageExecutor>] {
        self.routes
            .get(&type_id)
            .map(|route| route.executors.as_slice())
            .unwrap_or_default()
    }

    /// Executors for a namespace.
    pub fn executors_for(&self, name: &str) -> &[Arc<dyn MessageExecutor>] {
        match self.names.get(name) {
            Some(type_id) => self.match_executors(*type_id),
            None => &[],
        }
    }

    /// Number of routed message types.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if nothing is routed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for route in self.routes.values() {
            let ids: Vec<&str> = route.executors.iter().map(|e| e.id()).collect();
            map.entry(&route.name, &ids);
        }
        map.finish()
    }
}
