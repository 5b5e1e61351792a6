use std::any::Any;
use std::fmt;
use std::sync::Arc;

use buffers::{LinearMemory, Param};

use crate::buffer::ModuleParam;
use crate::error::ModuleError;

/// A native module: a named-function dispatcher over its own memory.
///
/// One instance lives on the context that owns the module. Calls arrive one at
/// a time; returning an `Err` is a normal failure, panicking takes the module
/// offline for the rest of the process.
pub trait NativeModule: Send {
    fn call(
        &mut self,
        cx: &mut dyn ModuleContext,
        function: &str,
        params: Vec<ModuleParam>,
    ) -> Result<Vec<ModuleParam>, ModuleError>;
}

type Factory = dyn Fn() -> Box<dyn NativeModule> + Send + Sync;

/// Loadable description of a native module; instantiated once per runtime.
#[derive(Clone)]
pub struct ModuleImage {
    name: Arc<str>,
    factory: Arc<Factory>,
}

impl ModuleImage {
    pub fn new<M, F>(name: impl Into<String>, factory: F) -> Self
    where
        M: NativeModule + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let name: String = name.into();
        Self {
            name: name.into(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn NativeModule>),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instantiate(&self) -> Box<dyn NativeModule> {
        (self.factory)()
    }
}

impl fmt::Debug for ModuleImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleImage").field(&self.name).finish()
    }
}

/// Which execution context a module call runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    /// The host thread itself (in-process embedding).
    MainThread,
    /// The dedicated context that owns the module instance.
    MainWorker,
    /// A context spawned on the module's request.
    AsyncWorker,
}

/// Services a context offers to module code running on it.
pub trait ModuleContext {
    fn kind(&self) -> ContextKind;

    fn memory(&self) -> &Arc<LinearMemory>;

    /// Invokes the host callback `name`. Fire-and-forget: nothing comes back.
    fn call_host(&mut self, name: &str, params: Vec<ModuleParam>) -> Result<(), ModuleError>;

    /// Runs `entry` on a fresh context.
    fn spawn_thread(&mut self, entry: ThreadEntry) -> Result<(), ModuleError>;

    /// Calls `function` on the module instance from a spawned context.
    fn call_main(
        &mut self,
        function: &str,
        params: Vec<ModuleParam>,
    ) -> Result<Vec<ModuleParam>, ModuleError>;
}

/// Per-thread parameters a module passes along with a spawn request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadSetup {
    /// Requested stack size in bytes; zero keeps the platform default.
    pub stack_size: usize,
}

impl ThreadSetup {
    pub const MIN_STACK: usize = 64 * 1024;

    pub fn with_stack_size(stack_size: usize) -> Self {
        Self { stack_size }
    }

    pub fn stack_size(&self) -> Option<usize> {
        (self.stack_size > 0).then(|| self.stack_size.max(Self::MIN_STACK))
    }
}

/// Work a module asks to run on a new context.
pub struct ThreadEntry {
    setup: ThreadSetup,
    run: Box<dyn FnOnce(&mut dyn ModuleContext) + Send>,
}

impl ThreadEntry {
    pub fn new<F>(setup: ThreadSetup, run: F) -> Self
    where
        F: FnOnce(&mut dyn ModuleContext) + Send + 'static,
    {
        Self {
            setup,
            run: Box::new(run),
        }
    }

    pub fn setup(&self) -> ThreadSetup {
        self.setup
    }

    pub fn run(self, cx: &mut dyn ModuleContext) {
        (self.run)(cx)
    }
}

impl fmt::Debug for ThreadEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEntry")
            .field("setup", &self.setup)
            .finish_non_exhaustive()
    }
}

/// Receives the module's `call_host` invocations on the host side.
pub trait HostCallbacks: Send + Sync {
    fn dispatch(&self, name: &str, params: Vec<Param>);
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "native module panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    struct Nop;

    impl NativeModule for Nop {
        fn call(
            &mut self,
            _cx: &mut dyn ModuleContext,
            function: &str,
            _params: Vec<ModuleParam>,
        ) -> Result<Vec<ModuleParam>, ModuleError> {
            Err(ModuleError::UnknownFunction(function.to_owned()))
        }
    }

    #[test]
    fn images_instantiate_fresh_modules() {
        let image = ModuleImage::new("nop", || Nop);
        assert_eq!(image.name(), "nop");
        let _first = image.instantiate();
        let _second = image.instantiate();
    }

    #[test]
    fn panic_messages_are_recovered() {
        let payload = panic::catch_unwind(|| panic!("static message")).expect_err("panics");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload = panic::catch_unwind(|| panic!("formatted {}", 7)).expect_err("panics");
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }

    #[test]
    fn tiny_stacks_are_rounded_up() {
        assert_eq!(ThreadSetup::default().stack_size(), None);
        assert_eq!(
            ThreadSetup::with_stack_size(1024).stack_size(),
            Some(ThreadSetup::MIN_STACK)
        );
    }
}
