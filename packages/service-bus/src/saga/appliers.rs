use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use super::saga::SagaState;
use crate::core::Message;

type ApplyFn<S> = Box<dyn Fn(&mut S, &dyn Any) + Send + Sync>;

/// Event application table of one saga type.
///
/// Maps each event type to the function that folds it into the saga state.
/// Events without an entry are recorded but change nothing.
///
/// ```ignore
/// impl SagaState for Checkout {
///     fn appliers() -> Appliers<Self> {
///         Appliers::<Self>::new()
///             .on::<PaymentReceived>(|state, event| state.paid = event.amount)
///             .on::<ItemsShipped>(|state, _| state.shipped = true)
///     }
/// }
/// ```
pub struct Appliers<S> {
    table: HashMap<TypeId, ApplyFn<S>>,
}

impl<S: 'static> Appliers<S> {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Apply `E` events with `apply`.
    pub fn on<E: Message>(mut self, apply: fn(&mut S, &E)) -> Self {
        self.table.insert(
            TypeId::of::<E>(),
            Box::new(move |state: &mut S, event: &dyn Any| {
                if let Some(event) = event.downcast_ref::<E>() {
                    apply(state, event);
                }
            }),
        );
        self
    }

    /// Apply `event` if an entry exists. Returns whether one did.
    pub fn apply(&self, state: &mut S, event_type: TypeId, event: &dyn Any) -> bool {
        match self.table.get(&event_type) {
            Some(apply) => {
                apply(state, event);
                true
            }
            None => false,
        }
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl<S: 'static> Default for Appliers<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// The table of `S`, built on first use and shared afterwards.
pub(crate) fn appliers_for<S: SagaState>() -> Arc<Appliers<S>> {
    static CACHE: OnceLock<DashMap<TypeId, Arc<dyn Any + Send + Sync>>> = OnceLock::new();

    let cache = CACHE.get_or_init(DashMap::new);
    let entry = cache
        .entry(TypeId::of::<S>())
        .or_insert_with(|| Arc::new(S::appliers()) as Arc<dyn Any + Send + Sync>)
        .clone();

    entry
        .downcast::<Appliers<S>>()
        .unwrap_or_else(|_| Arc::new(S::appliers()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default)]
    struct Tally {
        total: u32,
        voided: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counted {
        amount: u32,
    }

    impl Message for Counted {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Voided {}

    impl Message for Voided {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Audited {}

    impl Message for Audited {}

    #[test]
    fn test_table_applies_matching_entries_only() {
        let appliers = Appliers::<Tally>::new()
            .on::<Counted>(|state, event| state.total += event.amount)
            .on::<Voided>(|state, _| state.voided = true);
        let mut tally = Tally::default();

        assert!(appliers.apply(&mut tally, TypeId::of::<Counted>(), &Counted { amount: 4 }));
        assert!(appliers.apply(&mut tally, TypeId::of::<Voided>(), &Voided {}));
        assert!(!appliers.apply(&mut tally, TypeId::of::<Audited>(), &Audited {}));

        assert_eq!(appliers.len(), 2);
        assert_eq!(tally.total, 4);
        assert!(tally.voided);
    }
}
