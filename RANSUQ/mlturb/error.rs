use std::{error::Error, fmt};

/// One error per failed unit of a concurrent fan-out, keyed by unit (usually dataset) id.
#[derive(Debug)]
pub struct AggregateError<E> {
    failures: Vec<(String, E)>,
}

impl<E> AggregateError<E> {
    /// Wraps the collected failures.
    #[must_use]
    pub const fn new(failures: Vec<(String, E)>) -> Self {
        Self { failures }
    }

    /// Failed units with their errors, in submission order.
    #[must_use]
    pub fn failures(&self) -> &[(String, E)] {
        &self.failures
    }

    /// Identifiers of the failed units.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(id, _)| id.as_str())
    }

    /// Number of failed units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// True when nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} unit(s) failed", self.failures.len())?;
        for (id, err) in &self.failures {
            write!(f, "\n  - {id}: {err}")?;
        }
        Ok(())
    }
}

impl<E: Error + 'static> Error for AggregateError<E> {}

/// Splits per-unit results: every success in order, or every failure.
///
/// All results are inspected; a failure never hides the ones after it.
pub fn collect_all<T, E>(
    results: impl IntoIterator<Item = (String, Result<T, E>)>,
) -> Result<Vec<T>, AggregateError<E>> {
    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for (id, result) in results {
        match result {
            Ok(value) => successes.push(value),
            Err(err) => failures.push((id, err)),
        }
    }
    if failures.is_empty() {
        Ok(successes)
    } else {
        Err(AggregateError::new(failures))
    }
}
