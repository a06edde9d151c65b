//! Deferred values: data that becomes available one step later.
//!
//! A simplified future without wakers. The producer fulfils it once; the
//! consumer polls `is_ready()` on its own schedule (typically the next step).
//!
//! No internal synchronization: share it behind whatever lock the owner
//! already holds.

/// A single-assignment value that becomes available after a unit of latency.
#[derive(Debug, Clone, PartialEq)]
pub struct Deferred<T> {
    value: Option<T>,
}

impl<T> Deferred<T> {
    /// Creates an unfulfilled deferred value.
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Creates a deferred value that is already available.
    pub fn ready(value: T) -> Self {
        Self { value: Some(value) }
    }

    /// Returns true once the value has been provided.
    pub fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    /// Returns the value. `None` until fulfilled; callers check `is_ready()` first.
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Provides the value and makes it ready.
    ///
    /// Only the first call takes effect; later calls return the rejected
    /// value to the caller.
    pub fn fulfill(&mut self, value: T) -> Result<(), T> {
        if self.value.is_some() {
            return Err(value);
        }
        self.value = Some(value);
        Ok(())
    }

    /// Consumes the deferred value, returning its contents if ready.
    pub fn into_inner(self) -> Option<T> {
        self.value
    }
}

impl<T: Clone> Deferred<T> {
    /// Adopts another instance's readiness and value.
    pub fn copy_from(&mut self, other: &Deferred<T>) {
        self.value = other.value.clone();
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfulfilled_is_empty() {
        let deferred: Deferred<u64> = Deferred::new();
        assert!(!deferred.is_ready());
        assert_eq!(deferred.get(), None);
    }

    #[test]
    fn test_fulfill_once() {
        let mut deferred = Deferred::new();
        assert!(deferred.fulfill(5u64).is_ok());
        assert!(deferred.is_ready());
        assert_eq!(deferred.get(), Some(&5));

        // Second fulfilment is rejected and the first value survives
        assert_eq!(deferred.fulfill(9), Err(9));
        assert_eq!(deferred.get(), Some(&5));
    }

    #[test]
    fn test_copy_from_adopts_readiness() {
        let mut done = Deferred::new();
        done.fulfill(vec![1, 2, 3]).unwrap();

        let mut target = Deferred::new();
        target.copy_from(&done);
        assert!(target.is_ready());
        assert_eq!(target.get(), Some(&vec![1, 2, 3]));

        // Copying an unfulfilled value resets readiness
        target.copy_from(&Deferred::new());
        assert!(!target.is_ready());
    }
}
