use std::sync::Arc;

use buffers::LinearMemory;
use module_abi::{
    params_to_wire, BridgeError, ContextKind, ModuleContext, ModuleError, ModuleParam, ThreadEntry,
};

use crate::Shared;

/// Context handed to module code running in-process.
pub(crate) struct LocalContext {
    shared: Arc<Shared>,
    kind: ContextKind,
}

impl LocalContext {
    pub(crate) fn new(shared: Arc<Shared>, kind: ContextKind) -> Self {
        Self { shared, kind }
    }
}

impl ModuleContext for LocalContext {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn memory(&self) -> &Arc<LinearMemory> {
        &self.shared.memory
    }

    fn call_host(&mut self, name: &str, params: Vec<ModuleParam>) -> Result<(), ModuleError> {
        let params = self
            .shared
            .transfer
            .deserialize_params(params_to_wire(params))
            .map_err(|err| ModuleError::Failed(err.to_string()))?;
        self.shared.callbacks.dispatch(name, params);
        Ok(())
    }

    fn spawn_thread(&mut self, entry: ThreadEntry) -> Result<(), ModuleError> {
        self.shared
            .spawn(entry)
            .map_err(|err| ModuleError::Failed(format!("failed to spawn module thread: {err}")))
    }

    fn call_main(
        &mut self,
        function: &str,
        params: Vec<ModuleParam>,
    ) -> Result<Vec<ModuleParam>, ModuleError> {
        if self.kind != ContextKind::AsyncWorker {
            return Err(ModuleError::Unsupported(
                "call_main is only available on spawned threads".to_owned(),
            ));
        }
        self.shared
            .availability
            .check()
            .map_err(|err| ModuleError::Unsupported(err.to_string()))?;
        self.shared
            .run_module(ContextKind::MainThread, |module, cx| {
                module.call(cx, function, params)
            })
            .map_err(|err| match err {
                BridgeError::Module(message) => ModuleError::Failed(message),
                other => ModuleError::Failed(other.to_string()),
            })
    }
}
