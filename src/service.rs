//! Reference-counted shared services.
//!
//! The UDP router, the watchdog and the per-kind registries are shared by
//! every setup entry in the process. Each is created by the first entry
//! that acquires it and handed back to its owner for shutdown when the last
//! entry releases it.

pub struct RefCounted<T> {
    value: Option<T>,
    refs: usize,
}

impl<T> Default for RefCounted<T> {
    fn default() -> Self {
        Self {
            value: None,
            refs: 0,
        }
    }
}

impl<T> RefCounted<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference, creating the service with `create` if this is the
    /// first one. A failed `create` leaves the count untouched.
    pub fn acquire<E>(&mut self, create: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        let value = match self.value.take() {
            Some(existing) => existing,
            None => create()?,
        };
        self.refs += 1;
        Ok(self.value.insert(value))
    }

    /// Drop a reference. Returns the service when this was the last one so
    /// the caller can shut it down.
    pub fn release(&mut self) -> Option<T> {
        if self.refs == 0 {
            return None;
        }
        self.refs -= 1;
        if self.refs == 0 {
            self.value.take()
        } else {
            None
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn refs(&self) -> usize {
        self.refs
    }
}
