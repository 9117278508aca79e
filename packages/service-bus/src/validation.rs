//! Message validation.
//!
//! A [`MessageValidator`] inspects a decoded message before its handler runs
//! and reports [`ValidationViolations`]. What happens with the violations is up
//! to the handler options: either a validation-failed event is delivered and
//! the handler is skipped, or the violations are bound to the
//! [`MessageContext`](crate::MessageContext) and the handler decides.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// A single failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Path of the offending property. Empty for message-level rules.
    pub property: String,
    /// Human readable description.
    pub message: String,
}

/// All violations found for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationViolations {
    violations: Vec<Violation>,
}

impl ValidationViolations {
    /// No violations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation.
    pub fn push(&mut self, property: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            property: property.into(),
            message: message.into(),
        });
    }

    /// Returns `true` if nothing was violated.
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Number of violations.
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    /// Iterate over violations.
    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter()
    }

    /// Messages reported for one property.
    pub fn for_property<'a>(&'a self, property: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.violations
            .iter()
            .filter(move |v| v.property == property)
            .map(|v| v.message.as_str())
    }
}

impl fmt::Display for ValidationViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for violation in &self.violations {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            if violation.property.is_empty() {
                f.write_str(&violation.message)?;
            } else {
                write!(f, "{}: {}", violation.property, violation.message)?;
            }
        }
        Ok(())
    }
}

impl From<&garde::Report> for ValidationViolations {
    fn from(report: &garde::Report) -> Self {
        let mut violations = Self::new();
        for (path, error) in report.iter() {
            violations.push(path.to_string(), error.message().to_string());
        }
        violations
    }
}

/// Validates decoded messages.
pub trait MessageValidator: Send + Sync + 'static {
    /// Validate a message against the given rule groups.
    ///
    /// An empty group list means "all rules".
    fn validate(&self, message: &(dyn Any + Send + Sync), groups: &[String]) -> ValidationViolations;
}

/// [`MessageValidator`] backed by `garde` derive rules.
///
/// garde has no rule groups, so `groups` is ignored and every rule runs.
pub struct GardeValidator<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> GardeValidator<M> {
    /// Create a validator for `M`.
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for GardeValidator<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MessageValidator for GardeValidator<M>
where
    M: garde::Validate + Send + Sync + 'static,
    M::Context: Default,
{
    fn validate(&self, message: &(dyn Any + Send + Sync), _groups: &[String]) -> ValidationViolations {
        let Some(message) = message.downcast_ref::<M>() else {
            let mut violations = ValidationViolations::new();
            violations.push("", "message has an unexpected type");
            return violations;
        };

        match message.validate() {
            Ok(()) => ValidationViolations::new(),
            Err(report) => ValidationViolations::from(&report),
        }
    }
}
