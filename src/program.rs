//! The loaded program image: code, data, type and function segments plus
//! the CStr pool.
//!
//! All segments are immutable once the interpreter runs; the linker is the
//! only writer. Loading is incremental: `init_vm` materializes handles for
//! data descriptors and initializes native types added since the last call.

use crate::error::{VmError, VmResult};
use crate::handle::{HandleRef, TypeFamily, FIRST_USER_TYPE, TYPE_DELEGATE, TYPE_THREAD};

/// The value of one data-segment literal.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum DataValue {
    /// The shared null handle (used by linker-synthesized stubs).
    Null,
    /// A literal integer.
    Int(i64),
    /// A literal float.
    Float(f64),
    /// A literal string, stored in the CStr pool at this offset.
    StrOffset(usize),
}

/// A data-segment entry. Each descriptor yields one runtime handle, created
/// at the first `init_vm` after the descriptor was added.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct DataDescriptor {
    /// The literal value.
    pub value: DataValue,
    /// Pool index of the materialized handle, once created.
    #[cfg_attr(feature = "serde-types", serde(skip))]
    pub(crate) handle: Option<HandleRef>,
}

impl DataDescriptor {
    /// Creates a descriptor for a literal value.
    pub fn new(value: DataValue) -> Self {
        Self {
            value,
            handle: None,
        }
    }
}

/// The four well-known method slots of a class.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct MethodInfo {
    /// Constructor function id, or -1.
    pub ctor: i32,
    /// Copy-constructor function id, or -1.
    pub cctor: i32,
    /// Destructor function id, or -1.
    pub dtor: i32,
    /// Conversion-to-string method slot, or -1.
    pub to_string: i32,
}

impl Default for MethodInfo {
    fn default() -> Self {
        Self {
            ctor: -1,
            cctor: -1,
            dtor: -1,
            to_string: -1,
        }
    }
}

/// A type-segment entry.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct TypeInfo {
    /// The family of this type.
    pub family: TypeFamily,
    /// Offset of the type name in the CStr pool.
    pub name_offset: usize,
    /// Instance size in member slots (classes only).
    pub instance_size: usize,
    /// Base type id, or 0 for none.
    pub base: i32,
    /// Offset of the v-table in the CStr pool, or -1.
    pub vtable_offset: i32,
    /// True if the type is implemented by a registered native type.
    pub native: bool,
    /// The well-known method slots.
    pub methods: MethodInfo,
}

impl TypeInfo {
    fn builtin(family: TypeFamily) -> Self {
        Self {
            family,
            name_offset: 0,
            instance_size: 0,
            base: 0,
            vtable_offset: -1,
            native: false,
            methods: MethodInfo::default(),
        }
    }
}

/// A function-segment entry.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct FuncInfo {
    /// Owning type id (0 for global functions).
    pub type_id: i32,
    /// Start address in the code segment.
    pub code_addr: i32,
    /// Code length in words.
    pub code_size: i32,
    /// Number of arguments consumed from the data stack.
    pub args: usize,
    /// Member index within the owning type.
    pub member_idx: i32,
}

/// The CStr pool: a contiguous byte buffer holding names and packed
/// v-tables, addressed by offsets.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct CStrPool {
    bytes: Vec<u8>,
}

impl CStrPool {
    /// Creates an empty pool. Offset 0 always holds an empty string so that
    /// an unset name offset reads as "".
    pub fn new() -> Self {
        Self { bytes: vec![0] }
    }

    /// Appends a NUL-terminated string, returning its offset.
    pub fn add_string(&mut self, s: &str) -> usize {
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        offset
    }

    /// Reads the NUL-terminated string at `offset`.
    pub fn string_at(&self, offset: usize) -> &str {
        let end = self.bytes[offset..]
            .iter()
            .position(|&b| b == 0)
            .map_or(self.bytes.len(), |p| offset + p);
        std::str::from_utf8(&self.bytes[offset..end]).unwrap_or("")
    }

    /// Appends a packed v-table (one little-endian word per slot),
    /// returning its offset.
    pub fn add_vtable(&mut self, slots: &[i32]) -> usize {
        let offset = self.bytes.len();
        for slot in slots {
            self.bytes.extend_from_slice(&slot.to_le_bytes());
        }
        offset
    }

    /// Reads slot `slot` of the v-table at `offset`.
    pub fn vtable_entry(&self, offset: usize, slot: usize) -> VmResult<i32> {
        let at = offset + slot * 4;
        let bytes: [u8; 4] = self
            .bytes
            .get(at..at + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or(VmError::InvalidMemberIndex {
                index: slot as i32,
                type_id: -1,
            })?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Overwrites slot `slot` of the v-table at `offset`.
    pub fn set_vtable_entry(&mut self, offset: usize, slot: usize, value: i32) {
        let at = offset + slot * 4;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// The complete program image submitted by the host (or produced by the
/// linker): all segments the VM needs to load and execute.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgramImage {
    /// Flat array of instruction words.
    pub code: Vec<i32>,
    /// Literal descriptors.
    pub data: Vec<DataDescriptor>,
    /// Per-type info, indexed by type id.
    pub types: Vec<TypeInfo>,
    /// Per-function info, indexed by function id.
    pub functions: Vec<FuncInfo>,
    /// Names and v-tables.
    pub cstr: CStrPool,
}

impl Default for ProgramImage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramImage {
    /// Creates an image with the built-in type entries (null, int, float,
    /// string, array, delegate, thread) already present.
    pub fn new() -> Self {
        let mut cstr = CStrPool::new();
        let names = ["null", "int", "float", "string", "array", "delegate", "thread"];
        let mut types = Vec::with_capacity(FIRST_USER_TYPE as usize);
        for (id, name) in names.iter().enumerate() {
            let family = match id as i32 {
                TYPE_DELEGATE => TypeFamily::Delegate,
                TYPE_THREAD => TypeFamily::Thread,
                _ => TypeFamily::Integral,
            };
            let mut info = TypeInfo::builtin(family);
            info.name_offset = cstr.add_string(name);
            types.push(info);
        }
        debug_assert_eq!(types.len() as i32, FIRST_USER_TYPE);
        Self {
            code: Vec::new(),
            data: Vec::new(),
            types,
            functions: Vec::new(),
            cstr,
        }
    }

    /// The type-segment entry for `type_id`.
    pub fn type_info(&self, type_id: i32) -> VmResult<&TypeInfo> {
        self.types
            .get(type_id as usize)
            .ok_or(VmError::InvalidHandleType { type_id })
    }

    /// The function-segment entry for `fn_id`.
    pub fn func_info(&self, fn_id: i32) -> VmResult<&FuncInfo> {
        self.functions
            .get(fn_id as usize)
            .ok_or(VmError::InvalidFunctionIndex { index: fn_id })
    }

    /// Adds a data descriptor, returning its segment index.
    pub fn add_data(&mut self, value: DataValue) -> usize {
        self.data.push(DataDescriptor::new(value));
        self.data.len() - 1
    }

    /// Adds a literal string to the pool and a descriptor referencing it.
    pub fn add_string_literal(&mut self, s: &str) -> usize {
        let offset = self.cstr.add_string(s);
        self.add_data(DataValue::StrOffset(offset))
    }

    /// True if `base` equals `type_id` or appears in its base chain.
    pub fn is_base_type(&self, base: i32, type_id: i32) -> bool {
        if type_id == base {
            return true;
        }
        let mut current = type_id;
        while let Ok(info) = self.type_info(current) {
            if info.base == 0 {
                return false;
            }
            if info.base == base {
                return true;
            }
            current = info.base;
        }
        false
    }

    /// Name of a type, from the CStr pool.
    pub fn type_name(&self, type_id: i32) -> &str {
        self.types
            .get(type_id as usize)
            .map_or("<invalid>", |t| self.cstr.string_at(t.name_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{TYPE_ARRAY, TYPE_INT};

    #[test]
    fn test_builtin_types_present() {
        let image = ProgramImage::new();
        assert_eq!(image.types.len(), FIRST_USER_TYPE as usize);
        assert_eq!(image.type_name(TYPE_INT), "int");
        assert_eq!(image.type_name(TYPE_ARRAY), "array");
        assert_eq!(
            image.type_info(TYPE_THREAD).unwrap().family,
            TypeFamily::Thread
        );
    }

    #[test]
    fn test_cstr_pool_round_trip() {
        let mut pool = CStrPool::new();
        let a = pool.add_string("alpha");
        let b = pool.add_string("beta");
        assert_eq!(pool.string_at(a), "alpha");
        assert_eq!(pool.string_at(b), "beta");
        assert_eq!(pool.string_at(0), "");
    }

    #[test]
    fn test_vtable_round_trip() {
        let mut pool = CStrPool::new();
        let vt = pool.add_vtable(&[10, 11, 12]);
        assert_eq!(pool.vtable_entry(vt, 0).unwrap(), 10);
        assert_eq!(pool.vtable_entry(vt, 2).unwrap(), 12);
        pool.set_vtable_entry(vt, 1, 99);
        assert_eq!(pool.vtable_entry(vt, 1).unwrap(), 99);
    }

    #[test]
    fn test_base_chain() {
        let mut image = ProgramImage::new();
        let name = image.cstr.add_string("Base");
        image.types.push(TypeInfo {
            family: TypeFamily::Class,
            name_offset: name,
            instance_size: 2,
            base: 0,
            vtable_offset: -1,
            native: false,
            methods: MethodInfo::default(),
        });
        let base_id = (image.types.len() - 1) as i32;
        let name = image.cstr.add_string("Derived");
        image.types.push(TypeInfo {
            family: TypeFamily::Class,
            name_offset: name,
            instance_size: 3,
            base: base_id,
            vtable_offset: -1,
            native: false,
            methods: MethodInfo::default(),
        });
        let derived_id = (image.types.len() - 1) as i32;
        assert!(image.is_base_type(base_id, derived_id));
        assert!(image.is_base_type(derived_id, derived_id));
        assert!(!image.is_base_type(derived_id, base_id));
    }
}
