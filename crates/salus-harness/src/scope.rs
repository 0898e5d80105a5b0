//! Deferred exit actions of scoped resources.

use log::{debug, error};

use crate::error::Result;

type ExitFn<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Exit actions run in LIFO order. A failing action does not prevent the ones
/// registered before it from running.
#[derive(Default)]
pub struct Scope<'a> {
    exits: Vec<(String, ExitFn<'a>)>,
}

impl<'a> Scope<'a> {
    pub fn new() -> Self {
        Self { exits: Vec::new() }
    }

    pub fn defer<F>(&mut self, name: &str, exit: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.exits.push((name.to_string(), Box::new(exit)));
    }

    pub fn len(&self) -> usize {
        self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }

    /// Runs every exit action and returns the first error.
    pub fn close(mut self) -> Result<()> {
        self.unwind()
    }

    fn unwind(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some((name, exit)) = self.exits.pop() {
            debug!("leaving {}", name);
            if let Err(e) = exit() {
                error!("exit of {} failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        let _ = self.unwind();
    }
}
