use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use buffers::Param;
use module_abi::{BridgeResult, HostCallbacks, UsageError};
use parking_lot::RwLock;
use smallvec::SmallVec;

/// A host function the module can invoke by name.
pub type Callback = Arc<dyn Fn(Vec<Param>) + Send + Sync>;

/// Wraps a closure as a [`Callback`].
///
/// Under the workers embedding callbacks run on a dedicated context, one at a
/// time in the order the module issued them, and may block on further calls
/// into the module. Under the in-process embedding they run on the thread
/// that is executing the module, before its call returns; a nested call from
/// there fails with a usage error instead of waiting.
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(Vec<Param>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Named host callbacks the module reaches through `call_host`.
///
/// Cloning shares the table. Registration and unregistration are all or
/// nothing: one bad name in a batch leaves the table untouched.
#[derive(Clone, Default)]
pub struct CallbackTable {
    entries: Arc<RwLock<HashMap<String, Callback>>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every callback in `batch`. Fails on a name that is already taken.
    pub fn register<I, S>(&self, batch: I) -> BridgeResult<()>
    where
        I: IntoIterator<Item = (S, Callback)>,
        S: Into<String>,
    {
        let batch: SmallVec<[(String, Callback); 4]> = batch
            .into_iter()
            .map(|(name, callback)| (name.into(), callback))
            .collect();

        let mut entries = self.entries.write();
        let mut seen = HashSet::with_capacity(batch.len());
        for (name, _) in &batch {
            if entries.contains_key(name) || !seen.insert(name.as_str()) {
                return Err(UsageError::DuplicateCallback(name.clone()).into());
            }
        }
        for (name, callback) in batch {
            tracing::debug!("registered host callback {name}");
            entries.insert(name, callback);
        }
        Ok(())
    }

    /// Removes every name in `names`. Fails on a name that is not registered.
    pub fn unregister<I, S>(&self, names: I) -> BridgeResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: SmallVec<[S; 4]> = names.into_iter().collect();
        let mut entries = self.entries.write();
        for name in &names {
            let name: &str = name.as_ref();
            if !entries.contains_key(name) {
                return Err(UsageError::UnknownCallback(name.to_owned()).into());
            }
        }
        for name in &names {
            let name: &str = name.as_ref();
            tracing::debug!("unregistered host callback {name}");
            entries.remove(name);
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl HostCallbacks for CallbackTable {
    fn dispatch(&self, name: &str, params: Vec<Param>) {
        // Cloned out so the callback may touch the table itself.
        let callback = self.entries.read().get(name).cloned();
        match callback {
            Some(callback) => callback(params),
            None => tracing::error!(
                "module called host callback `{name}`, which is not registered; ignoring"
            ),
        }
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}
