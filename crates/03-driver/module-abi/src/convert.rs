use std::sync::Arc;

use buffers::{
    BufferError, BufferHandle, BufferMode, LinearMemory, ParamType, ProtocolViolation, WireParam,
};

use crate::buffer::{ModuleBuffer, ModuleParam};
use crate::error::ModuleError;

/// Turns received wire parameters into module parameters.
///
/// Copied host arrays are placed in module memory here, once. Every item is
/// processed even after a failure so that valid descriptors are adopted and
/// released instead of leaking their references.
pub fn params_from_wire(
    memory: &Arc<LinearMemory>,
    wire: Vec<WireParam>,
) -> Result<Vec<ModuleParam>, BufferError> {
    let results: Vec<Result<ModuleParam, BufferError>> = wire
        .into_iter()
        .map(|item| match item {
            WireParam::Str(s) => Ok(ModuleParam::Str(s)),
            WireParam::Buffer(descriptor) => {
                ModuleBuffer::from_descriptor(memory, descriptor).map(ModuleParam::Buffer)
            }
            WireParam::Copied { bytes, param_type } => place_copy(memory, bytes, param_type),
        })
        .collect();
    results.into_iter().collect()
}

fn place_copy(
    memory: &Arc<LinearMemory>,
    bytes: Vec<u8>,
    param_type: ParamType,
) -> Result<ModuleParam, BufferError> {
    let (Some(element), Some(mode)) = (param_type.element(), param_type.mode()) else {
        return Err(ProtocolViolation::StringDescriptor(BufferHandle(0)).into());
    };
    let placed = match mode {
        BufferMode::ReadOnly => ModuleBuffer::read_only(memory, bytes, element),
        BufferMode::Mutable => ModuleBuffer::mutable(memory, bytes, element),
    };
    match placed {
        Ok(buffer) => Ok(ModuleParam::Buffer(buffer)),
        Err(ModuleError::Memory(err)) => Err(err.into()),
        Err(err) => Err(BufferError::Unavailable(err.to_string())),
    }
}

/// Turns module results into wire parameters, handing each buffer's reference or ownership along.
pub fn params_to_wire(params: Vec<ModuleParam>) -> Vec<WireParam> {
    params
        .into_iter()
        .map(|param| match param {
            ModuleParam::Str(s) => WireParam::Str(s),
            ModuleParam::Buffer(buffer) => WireParam::Buffer(buffer.into_descriptor()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffers::{ElementType, MemoryConfig, TransferDescriptor};

    fn memory() -> Arc<LinearMemory> {
        Arc::new(LinearMemory::reserve(MemoryConfig::default()).expect("memory"))
    }

    #[test]
    fn copies_land_in_module_memory_once() {
        let memory = memory();
        let params = params_from_wire(
            &memory,
            vec![
                WireParam::Str("s".into()),
                WireParam::Copied {
                    bytes: vec![1, 2, 3],
                    param_type: ParamType::ReadOnlyU8Buffer,
                },
            ],
        )
        .expect("convert");
        assert_eq!(params[0].as_str(), Some("s"));
        let buffer = params[1].as_buffer().expect("buffer");
        assert_eq!(buffer.mode(), BufferMode::ReadOnly);
        assert_eq!(memory.stats().allocations, 1);
    }

    #[test]
    fn valid_descriptors_are_released_when_a_sibling_fails() {
        let memory = memory();
        let good = ModuleBuffer::read_only(&memory, vec![0; 4], ElementType::U8)
            .expect("alloc")
            .into_descriptor();
        let bad = TransferDescriptor {
            handle: BufferHandle(3),
            ..good
        };

        let err = params_from_wire(&memory, vec![WireParam::Buffer(good), WireParam::Buffer(bad)])
            .expect_err("bad handle");
        assert!(err.is_violation());
        assert_eq!(memory.stats().frees, 1);
    }

    #[test]
    fn results_hand_over_their_buffers() {
        let memory = memory();
        let buffer = ModuleBuffer::mutable(&memory, vec![7; 2], ElementType::U8).expect("alloc");
        let handle = buffer.handle();
        let wire = params_to_wire(vec![ModuleParam::Buffer(buffer), "done".into()]);
        assert!(matches!(&wire[0], WireParam::Buffer(d) if d.handle == handle));
        // Ownership travelled with the descriptor.
        assert!(memory.region(handle).is_some());
    }
}
