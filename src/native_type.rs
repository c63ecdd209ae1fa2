//! The native-type interface: host-implemented classes.
//!
//! Every native class exposes one implementation of [`NativeType`]. The VM
//! resolves implementations by class name at `init_vm` time and dispatches
//! object construction, member calls and garbage-collection marking through
//! the trait. Binding to a particular host language is out of scope; this
//! trait is the entire contract.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::error::{VmError, VmResult};
use crate::execution_context::RETURN_REGISTER;
use crate::execution_engine::Vm;
use crate::handle::{HandleRef, NativeBody, Payload, TYPE_FLOAT, TYPE_INT, TYPE_STRING};

/// Callback used by [`NativeType::mark_handles`] to report each handle
/// reference a native object holds.
pub type HandleMarker<'a> = dyn FnMut(HandleRef) -> VmResult<()> + 'a;

/// A host-implemented class.
///
/// Contract: `new_object` must produce a fresh opaque object which the VM's
/// handle then owns; `destroy_object` runs when that handle's reference
/// count hits zero; `mark_handles` must report every handle reference the
/// object holds, or the collector will reclaim reachable handles.
pub trait NativeType {
    /// The class name, matched against the type segment.
    fn name(&self) -> &str;

    /// Informational declaration string shown in diagnostics.
    fn declaration(&self) -> &str {
        ""
    }

    /// Implementation version, checked against the type segment on import.
    fn author_version(&self) -> i32 {
        0
    }

    /// Called once when the type is first initialized by `init_vm`.
    fn initialize(&mut self, _vm: &mut Vm) -> VmResult<()> {
        Ok(())
    }

    /// Produces a fresh object for an `allocn` instruction or a factory.
    fn new_object(&self, vm: &mut Vm) -> VmResult<Box<dyn Any>>;

    /// Invoked when the owning handle is destroyed. Resource cleanup beyond
    /// what `Drop` provides goes here.
    fn destroy_object(&self, _obj: &mut dyn Any) {}

    /// Reports every handle reference held by `obj` to the collector.
    fn mark_handles(&self, _obj: &dyn Any, _mark: &mut HandleMarker) -> VmResult<()> {
        Ok(())
    }

    /// Calls a static function of this type.
    fn call_static(&self, vm: &mut Vm, member: i32) -> VmResult<()>;

    /// Calls a member function on `obj`.
    fn call_member(&self, vm: &mut Vm, member: i32, obj: &NativeBody) -> VmResult<()>;

    /// Called once during `term_vm`.
    fn terminate(&mut self, _vm: &mut Vm) -> VmResult<()> {
        Ok(())
    }
}

/// Shared ownership of a native type implementation.
pub type NativeProc = Rc<RefCell<dyn NativeType>>;

/// Registry of native types by class name.
#[derive(Default)]
pub struct NativeRegistry {
    by_name: HashMap<String, NativeProc>,
}

impl NativeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an implementation under its own name.
    pub fn register(&mut self, proc_: NativeProc) {
        let name = proc_.borrow().name().to_string();
        self.by_name.insert(name, proc_);
    }

    /// Looks up an implementation by class name.
    pub fn resolve(&self, name: &str) -> Option<NativeProc> {
        self.by_name.get(name).cloned()
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("types", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Argument and return-value marshaling for native implementations.
///
/// Arguments sit on the caller's data stack, argument 0 topmost. Return
/// values go into the return register.
impl Vm {
    /// Reads integer argument `index`.
    pub fn arg_int(&self, index: usize) -> VmResult<i64> {
        let h = self.arg_handle(index);
        self.pool
            .handle(h)
            .as_int()
            .ok_or_else(|| VmError::type_mismatch("int", self.handle_type_name(h)))
    }

    /// Reads float argument `index`.
    pub fn arg_float(&self, index: usize) -> VmResult<f64> {
        let h = self.arg_handle(index);
        self.pool
            .handle(h)
            .as_float()
            .ok_or_else(|| VmError::type_mismatch("float", self.handle_type_name(h)))
    }

    /// Reads string argument `index` as an owned string.
    pub fn arg_string(&self, index: usize) -> VmResult<String> {
        let h = self.arg_handle(index);
        self.pool
            .handle(h)
            .as_str()
            .map(|s| s.borrow().clone())
            .ok_or_else(|| VmError::type_mismatch("string", self.handle_type_name(h)))
    }

    /// Reads object argument `index`, checking it against `type_id`.
    pub fn arg_object(&self, index: usize, type_id: i32) -> VmResult<HandleRef> {
        let h = self.arg_handle(index);
        let actual = self.pool.handle(h).type_id;
        if actual != type_id && !self.image.is_base_type(type_id, actual) {
            return Err(VmError::type_mismatch(
                self.image.type_name(type_id),
                self.image.type_name(actual),
            ));
        }
        Ok(h)
    }

    /// The raw handle of argument `index`.
    pub fn arg_handle(&self, index: usize) -> HandleRef {
        let ctx = self.current_context();
        let ctx = ctx.borrow();
        ctx.stack_slot(index)
    }

    /// Returns an int from a native call.
    pub fn return_int(&mut self, v: i64) {
        let h = self.pool.new_int(v);
        self.set_return_register(h);
    }

    /// Returns a float from a native call.
    pub fn return_float(&mut self, v: f64) {
        let h = self.pool.new_float(v);
        self.set_return_register(h);
    }

    /// Returns a string from a native call.
    pub fn return_string(&mut self, s: impl Into<String>) {
        let body = Rc::new(RefCell::new(s.into()));
        let h = self.pool.acquire_with(TYPE_STRING, Payload::Str(body));
        self.set_return_register(h);
    }

    /// Returns an existing handle from a native call (takes a reference).
    pub fn return_handle(&mut self, h: HandleRef) {
        self.pool.add_ref(h);
        self.set_return_register(h);
    }

    /// Wraps a native object in a fresh handle of the given type.
    pub fn new_handle_for_object(&mut self, type_id: i32, obj: Box<dyn Any>) -> HandleRef {
        self.pool
            .acquire_with(type_id, Payload::Native(Rc::new(RefCell::new(obj))))
    }

    /// Creates a weak reference for a native implementation.
    pub fn new_weak_ref(&mut self, h: HandleRef) -> HandleRef {
        self.pool.weak_ref(h)
    }

    fn set_return_register(&mut self, h: HandleRef) {
        let ctx = self.current_context();
        let old = {
            let mut ctx = ctx.borrow_mut();
            let old = ctx.register(RETURN_REGISTER);
            ctx.set_register(RETURN_REGISTER, h);
            old
        };
        self.release_handle(old);
    }

    pub(crate) fn handle_type_name(&self, h: HandleRef) -> String {
        match self.pool.handle(h).type_id {
            TYPE_INT => "int".to_string(),
            TYPE_FLOAT => "float".to_string(),
            TYPE_STRING => "string".to_string(),
            t => self.image.type_name(t).to_string(),
        }
    }
}
