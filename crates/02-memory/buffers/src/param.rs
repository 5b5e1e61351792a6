use std::fmt;

use crate::identity::{BufferMode, ElementType, ParamType};
use crate::view::{Buffer, MutableBuffer, ReadOnlyBuffer};

/// Plain host array that does not live in module memory.
///
/// Passing one to the module costs a copy into module memory on the way in.
#[derive(Clone, PartialEq)]
pub struct HostArray {
    bytes: Vec<u8>,
    element: ElementType,
    mode: BufferMode,
}

impl HostArray {
    pub fn u8(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            element: ElementType::U8,
            mode: BufferMode::Mutable,
        }
    }

    pub fn f32(values: &[f32]) -> Self {
        Self {
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            element: ElementType::F32,
            mode: BufferMode::Mutable,
        }
    }

    /// Marks the array as read-only on the module side.
    pub fn read_only(mut self) -> Self {
        self.mode = BufferMode::ReadOnly;
        self
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn param_type(&self) -> ParamType {
        ParamType::for_buffer(self.element, self.mode)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("param_type", &self.param_type())
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One argument or return value of a call into or out of the module.
#[derive(Debug)]
pub enum Param {
    Str(String),
    /// A buffer backed by module memory; crosses without copying.
    Buffer(Buffer),
    /// A host array; copied into module memory when passed in.
    Array(HostArray),
}

impl Param {
    pub fn param_type(&self) -> ParamType {
        match self {
            Param::Str(_) => ParamType::String,
            Param::Buffer(buffer) => buffer.identity().param_type(),
            Param::Array(array) => array.param_type(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Param::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn into_buffer(self) -> Option<Buffer> {
        match self {
            Param::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Str(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Str(value.to_owned())
    }
}

impl From<Buffer> for Param {
    fn from(value: Buffer) -> Self {
        Param::Buffer(value)
    }
}

impl From<ReadOnlyBuffer> for Param {
    fn from(value: ReadOnlyBuffer) -> Self {
        Param::Buffer(Buffer::ReadOnly(value))
    }
}

impl From<MutableBuffer> for Param {
    fn from(value: MutableBuffer) -> Self {
        Param::Buffer(Buffer::Mutable(value))
    }
}

impl From<HostArray> for Param {
    fn from(value: HostArray) -> Self {
        Param::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_arrays_are_little_endian() {
        let array = HostArray::f32(&[1.0, -2.5]);
        assert_eq!(array.bytes().len(), 8);
        assert_eq!(&array.bytes()[..4], &1.0f32.to_le_bytes());
        assert_eq!(array.param_type(), ParamType::F32Buffer);
        assert_eq!(array.read_only().param_type(), ParamType::ReadOnlyF32Buffer);
    }

    #[test]
    fn strings_report_the_string_tag() {
        assert_eq!(Param::from("hi").param_type(), ParamType::String);
    }
}
