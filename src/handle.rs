//! The handle: the VM's universal value container.
//!
//! Every runtime value lives behind a reference-counted handle owned by the
//! [`HandlePool`](crate::handle_pool::HandlePool). A handle pairs a type id
//! with a tagged payload; compound payloads (strings, arrays, objects,
//! delegates, contexts, native objects) share their bodies, which is what
//! makes weak references cheap: a weak handle aliases the same body with the
//! `PERSIST` flag set so destruction leaves the body alone.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::execution_context::ExecutionContext;

/// Type id of the shared null handle.
pub const TYPE_NULL: i32 = 0;
/// Type id of integer handles.
pub const TYPE_INT: i32 = 1;
/// Type id of float handles.
pub const TYPE_FLOAT: i32 = 2;
/// Type id of string handles.
pub const TYPE_STRING: i32 = 3;
/// Type id of array handles.
pub const TYPE_ARRAY: i32 = 4;
/// Type id of the generic delegate type.
pub const TYPE_DELEGATE: i32 = 5;
/// Type id of the generic thread (coroutine context) type.
pub const TYPE_THREAD: i32 = 6;
/// First type id available to user-defined classes and interfaces.
pub const FIRST_USER_TYPE: i32 = 7;

bitflags! {
    /// Per-handle flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u8 {
        /// Set during garbage collection mark phase.
        const MARKED = 0b001;
        /// First handle of an allocation bucket.
        const NEW_BUCKET = 0b010;
        /// Weak reference: payload is an alias, never destroyed.
        const PERSIST = 0b100;
    }
}

/// Index of a handle in the pool. Stable for the lifetime of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRef(pub(crate) usize);

impl HandleRef {
    /// The pool index of this handle.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Shared body of a string payload.
pub type StrBody = Rc<RefCell<String>>;
/// Shared body of an array or object payload: a vector of handle references.
pub type SlotBody = Rc<RefCell<Vec<HandleRef>>>;
/// Shared body of a native object payload.
pub type NativeBody = Rc<RefCell<Box<dyn Any>>>;
/// Shared body of a delegate payload.
pub type DelegateBody = Rc<RefCell<Delegate>>;
/// Shared body of a coroutine context payload.
pub type ContextBody = Rc<RefCell<ExecutionContext>>;

/// A delegate: a function or method reference, optionally bound to a `this`
/// handle, optionally closing over a slice of its creator's data stack.
#[derive(Debug)]
pub struct Delegate {
    /// Function id (plain delegates, closures) or v-table slot (method
    /// delegates with a `this` object).
    pub index: i32,
    /// Bound `this` object for method delegates.
    pub this: Option<HandleRef>,
    /// Captured stack slots, top of stack last.
    pub closure: Option<Vec<HandleRef>>,
}

/// The tagged payload of a handle, selected by the handle's type id.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    /// The null payload.
    #[default]
    Null,
    /// An integer value, stored inline.
    Int(i64),
    /// A float value, stored inline.
    Float(f64),
    /// An owned growable string.
    Str(StrBody),
    /// A growable vector of handle references.
    Array(SlotBody),
    /// A class instance: a fixed-size vector of handle references.
    Object(SlotBody),
    /// An opaque object owned by a native type.
    Native(NativeBody),
    /// A delegate or closure.
    Delegate(DelegateBody),
    /// A coroutine execution context.
    Context(ContextBody),
}

/// A single handle: type id, flags, reference count and payload.
#[derive(Debug)]
pub struct Handle {
    /// Key into the type segment.
    pub type_id: i32,
    /// Flag bits.
    pub flags: HandleFlags,
    /// Non-negative reference count; 0 means the handle is free.
    pub ref_count: u32,
    /// The value, selected by `type_id`.
    pub payload: Payload,
}

impl Handle {
    pub(crate) fn free() -> Self {
        Handle {
            type_id: TYPE_NULL,
            flags: HandleFlags::empty(),
            ref_count: 0,
            payload: Payload::Null,
        }
    }

    /// The integer value, if this is an int handle.
    pub fn as_int(&self) -> Option<i64> {
        match self.payload {
            Payload::Int(v) => Some(v),
            _ => None,
        }
    }

    /// The float value, if this is a float handle.
    pub fn as_float(&self) -> Option<f64> {
        match self.payload {
            Payload::Float(v) => Some(v),
            _ => None,
        }
    }

    /// The string body, if this is a string handle.
    pub fn as_str(&self) -> Option<&StrBody> {
        match &self.payload {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The element vector, if this is an array handle.
    pub fn as_array(&self) -> Option<&SlotBody> {
        match &self.payload {
            Payload::Array(a) => Some(a),
            _ => None,
        }
    }

    /// The member vector, if this is an object handle.
    pub fn as_object(&self) -> Option<&SlotBody> {
        match &self.payload {
            Payload::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The delegate body, if this is a delegate handle.
    pub fn as_delegate(&self) -> Option<&DelegateBody> {
        match &self.payload {
            Payload::Delegate(d) => Some(d),
            _ => None,
        }
    }

    /// The context body, if this is a coroutine handle.
    pub fn as_context(&self) -> Option<&ContextBody> {
        match &self.payload {
            Payload::Context(c) => Some(c),
            _ => None,
        }
    }

    /// The native body, if this is a native object handle.
    pub fn as_native(&self) -> Option<&NativeBody> {
        match &self.payload {
            Payload::Native(n) => Some(n),
            _ => None,
        }
    }

    /// True if the handle currently holds the null payload.
    pub fn is_null(&self) -> bool {
        self.type_id == TYPE_NULL
    }
}

/// The family of a type: what shape of payload and dispatch it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum TypeFamily {
    /// Built-in value and container types (null, int, float, string, array).
    Integral,
    /// A script or native class.
    Class,
    /// An interface; only instantiable through factories.
    Interface,
    /// A coroutine thread class.
    Thread,
    /// A delegate type.
    Delegate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_handle_is_null() {
        let h = Handle::free();
        assert!(h.is_null());
        assert_eq!(h.ref_count, 0);
        assert!(h.as_int().is_none());
    }

    #[test]
    fn test_accessors_check_discriminant() {
        let h = Handle {
            type_id: TYPE_INT,
            flags: HandleFlags::empty(),
            ref_count: 1,
            payload: Payload::Int(42),
        };
        assert_eq!(h.as_int(), Some(42));
        assert!(h.as_float().is_none());
        assert!(h.as_str().is_none());
    }

    #[test]
    fn test_flags() {
        let mut f = HandleFlags::NEW_BUCKET;
        f |= HandleFlags::MARKED;
        assert!(f.contains(HandleFlags::NEW_BUCKET));
        f &= HandleFlags::NEW_BUCKET;
        assert_eq!(f, HandleFlags::NEW_BUCKET);
    }
}
