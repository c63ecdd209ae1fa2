//! Payload construction: objects, multi-dimensional arrays, delegates,
//! closures and interface factories.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::execution_engine::Vm;
use crate::handle::{
    Delegate, HandleRef, Payload, TypeFamily, TYPE_ARRAY, TYPE_FLOAT, TYPE_INT, TYPE_STRING,
};

impl Vm {
    /// Allocates a script class instance: `instance_size` member slots, all
    /// referencing the null handle.
    pub fn alloc_object(&mut self, type_id: i32) -> VmResult<HandleRef> {
        let size = self.image.type_info(type_id)?.instance_size;
        let null = self.pool.null_ref();
        self.pool.add_ref_n(null, size as u32);
        let members = vec![null; size];
        Ok(self
            .pool
            .acquire_with(type_id, Payload::Object(Rc::new(RefCell::new(members)))))
    }

    /// Allocates a native class instance through its registered type.
    pub fn alloc_native_object(&mut self, type_id: i32) -> VmResult<HandleRef> {
        let proc_ = self.native_proc(type_id)?;
        let obj = proc_
            .borrow()
            .new_object(self)
            .map_err(|_| VmError::AllocationFailed { type_id })?;
        Ok(self.new_handle_for_object(type_id, obj))
    }

    /// Allocates a `dim`-dimensional array of `elem_type`, reading one
    /// dimension count per level from the caller's data stack starting at
    /// slot `arg_offset`. Inner arrays are filled with the element type's
    /// default value.
    pub fn alloc_array_multi(
        &mut self,
        elem_type: i32,
        dim: i32,
        arg_offset: usize,
    ) -> VmResult<HandleRef> {
        if dim < 0 {
            return Err(VmError::invalid_operand("negative array dimension"));
        }
        if dim == 0 {
            return Ok(self.new_array_handle(Vec::new()));
        }
        let size_handle = {
            let ctx = self.current_context();
            let c = ctx.borrow();
            c.stack_slot(arg_offset)
        };
        let size = self
            .pool
            .handle(size_handle)
            .as_int()
            .ok_or_else(|| VmError::invalid_operand("array dimension is not an int"))?;
        if size < 0 {
            return Err(VmError::invalid_operand("negative array dimension"));
        }
        let mut elems = Vec::with_capacity(size as usize);
        if dim == 1 {
            for _ in 0..size {
                let v = self.default_value(elem_type);
                elems.push(v);
            }
        } else {
            for _ in 0..size {
                match self.alloc_array_multi(elem_type, dim - 1, arg_offset + 1) {
                    Ok(inner) => elems.push(inner),
                    Err(e) => {
                        for h in elems {
                            self.release_handle(h);
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(self.new_array_handle(elems))
    }

    /// Wraps a vector of owned handle references in a fresh array handle.
    pub fn new_array_handle(&mut self, elems: Vec<HandleRef>) -> HandleRef {
        self.pool
            .acquire_with(TYPE_ARRAY, Payload::Array(Rc::new(RefCell::new(elems))))
    }

    /// The default value of a type: 0, 0.0, "" or null.
    pub fn default_value(&mut self, type_id: i32) -> HandleRef {
        match type_id {
            TYPE_INT => self.pool.new_int(0),
            TYPE_FLOAT => self.pool.new_float(0.0),
            TYPE_STRING => self.new_string_handle(""),
            _ => {
                let null = self.pool.null_ref();
                self.pool.add_ref(null);
                null
            }
        }
    }

    /// Allocates a delegate handle of the given delegate type.
    pub fn alloc_delegate(
        &mut self,
        type_id: i32,
        index: i32,
        this: Option<HandleRef>,
    ) -> HandleRef {
        if let Some(obj) = this {
            self.pool.add_ref(obj);
        }
        self.pool.acquire_with(
            type_id,
            Payload::Delegate(Rc::new(RefCell::new(Delegate {
                index,
                this,
                closure: None,
            }))),
        )
    }

    /// Allocates a closure delegate capturing `count` handles from the top
    /// of the current data stack.
    pub fn alloc_closure(
        &mut self,
        type_id: i32,
        index: i32,
        count: usize,
        this: Option<HandleRef>,
    ) -> VmResult<HandleRef> {
        let captured: Vec<HandleRef> = {
            let ctx = self.current_context();
            let c = ctx.borrow();
            if c.data_sp + count > c.data_stack_size() {
                return Err(VmError::invalid_operand("closure capture exceeds stack"));
            }
            (0..count).map(|i| c.stack_slot(i)).collect()
        };
        for &h in &captured {
            self.pool.add_ref(h);
        }
        if let Some(obj) = this {
            self.pool.add_ref(obj);
        }
        Ok(self.pool.acquire_with(
            type_id,
            Payload::Delegate(Rc::new(RefCell::new(Delegate {
                index,
                this,
                closure: Some(captured),
            }))),
        ))
    }

    /// Builds an interface factory: an array holding one fresh instance of
    /// every class whose base chain reaches `iface`. Constructors are not
    /// run here; `calli` with the constructor slot does that.
    pub fn alloc_factory(&mut self, iface: i32) -> VmResult<HandleRef> {
        let candidates: Vec<(i32, bool)> = self
            .image
            .types
            .iter()
            .enumerate()
            .filter(|(id, info)| {
                info.family == TypeFamily::Class && self.image.is_base_type(iface, *id as i32)
            })
            .map(|(id, info)| (id as i32, info.native))
            .collect();
        let mut elems = Vec::with_capacity(candidates.len());
        for (type_id, native) in candidates {
            let instance = if native {
                self.alloc_native_object(type_id)
            } else {
                self.alloc_object(type_id)
            };
            match instance {
                Ok(h) => elems.push(h),
                Err(e) => {
                    for h in elems {
                        self.release_handle(h);
                    }
                    return Err(e);
                }
            }
        }
        Ok(self.new_array_handle(elems))
    }
}
