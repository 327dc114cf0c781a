//! In-process predicate filtering shared by every backend.
//!
//! No backend translates a predicate into a native query; every `get_all`
//! and `count` call fetches candidate rows and evaluates the predicate in
//! process against deserialized entities.

use std::sync::Arc;

/// A boxed, cloneable filter over entity values.
#[derive(Clone)]
pub struct Predicate<T>(Arc<dyn Fn(&T) -> bool + Send + Sync>);

impl<T> Predicate<T> {
    /// Wrap an ordinary closure as a predicate.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Evaluate the predicate against a candidate value.
    pub fn matches(&self, value: &T) -> bool {
        (self.0)(value)
    }
}

impl<T, F> From<F> for Predicate<T>
where
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        Predicate::new(f)
    }
}
