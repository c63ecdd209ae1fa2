//! The execution engine: VM state, lifecycle and the host call surface.
//!
//! One [`Vm`] owns the handle pool, the loaded program image, the native
//! type registry and the context tree. Hosts drive it through
//! `init_vm` / `run_init_code` / `call_func` / `call_method` /
//! `call_delegate` / `collect_garbage` / `term_vm`; native implementations
//! re-enter it through the same calls wrapped in
//! `push_stack_frame` / `pop_stack_frame`.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use log::info;

use crate::error::{VmError, VmResult};
use crate::execution_context::{
    ExecutionContext, StackFrame, GLOBAL_REGISTER, NUM_REGISTERS, RETURN_REGISTER,
    RETURN_TO_NATIVE, THIS_REGISTER,
};
use crate::handle::{
    ContextBody, Delegate, HandleRef, Payload, TypeFamily, TYPE_NULL, TYPE_STRING,
};
use crate::handle_pool::{HandlePool, DEFAULT_ALLOC_GRAIN};
use crate::native_type::{NativeProc, NativeRegistry, NativeType};
use crate::program::{DataValue, ProgramImage};

/// How much the garbage collector and teardown report about leaked handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum LogGarbageMode {
    /// No reporting.
    #[default]
    Off,
    /// One line per collected handle.
    Brief,
    /// One line per leaked handle before collection, plus collection lines.
    All,
}

/// VM configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct VmConfig {
    /// Depth of the data stack (per context), register window included.
    pub stack_size: usize,
    /// Depth of the call stack (per context).
    pub call_stack_size: usize,
    /// Bucket size of the handle pool.
    pub handle_alloc_grain: usize,
    /// Leak reporting mode.
    pub log_garbage_mode: LogGarbageMode,
    /// Raise a trace exception before every instruction.
    pub trace_enabled: bool,
    /// Enable type and stack-overflow checks in the hot loop.
    pub runtime_checks: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: 1024,
            call_stack_size: 256,
            handle_alloc_grain: DEFAULT_ALLOC_GRAIN,
            log_garbage_mode: LogGarbageMode::Off,
            trace_enabled: false,
            runtime_checks: true,
        }
    }
}

/// Which user-installable exception handler to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Raised by the `throw` instruction.
    Software,
    /// Raised before each instruction while tracing.
    Trace,
    /// Raised by the `brk` instruction.
    Break,
    /// Every other machine exception.
    Machine,
}

/// A user-installed exception handler.
pub type ExceptionCallback = Box<dyn FnMut(&mut Vm)>;

#[derive(Default)]
pub(crate) struct ExceptionHandlers {
    pub(crate) software: Option<ExceptionCallback>,
    pub(crate) trace: Option<ExceptionCallback>,
    pub(crate) brk: Option<ExceptionCallback>,
    pub(crate) machine: Option<ExceptionCallback>,
}

/// Garbage-collection events delivered to host-registered callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcEvent {
    /// Mark phase: the callback must mark every external root it owns.
    Mark,
    /// The VM is shutting down.
    Shutdown,
}

/// A host-registered external-roots callback.
pub type GcEventCallback = Box<dyn FnMut(&mut Vm, GcEvent) -> VmResult<()>>;

/// The virtual machine.
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) pool: HandlePool,
    pub(crate) image: ProgramImage,
    pub(crate) registry: NativeRegistry,
    pub(crate) native_procs: HashMap<i32, NativeProc>,
    pub(crate) root: Option<ContextBody>,
    pub(crate) current: Option<ContextBody>,
    pub(crate) run_level: i32,
    pub(crate) running: bool,
    blocked: bool,
    initialized: bool,
    init_data_incr: usize,
    init_type_incr: usize,
    run_init_incr: i32,
    pub(crate) instruction_counter: u64,
    pub(crate) trace_flag: bool,
    // exception state
    pub(crate) err: Option<VmError>,
    pub(crate) err_pc: i32,
    pub(crate) err_call_sp: usize,
    pub(crate) err_data_sp: usize,
    pub(crate) throw_handle: Option<HandleRef>,
    pub(crate) exception_flag: bool,
    pub(crate) handlers: ExceptionHandlers,
    exception_iface: Option<i32>,
    pub(crate) gc_events: Vec<GcEventCallback>,
    pub(crate) handles_leaked: usize,
}

impl Vm {
    /// Creates a VM over a program image.
    pub fn new(config: VmConfig, image: ProgramImage) -> Self {
        let trace_flag = config.trace_enabled;
        let pool = HandlePool::new(config.handle_alloc_grain);
        Self {
            config,
            pool,
            image,
            registry: NativeRegistry::new(),
            native_procs: HashMap::new(),
            root: None,
            current: None,
            run_level: 0,
            running: false,
            blocked: false,
            initialized: false,
            init_data_incr: 0,
            init_type_incr: 0,
            run_init_incr: 0,
            instruction_counter: 0,
            trace_flag,
            err: None,
            err_pc: 0,
            err_call_sp: 0,
            err_data_sp: 0,
            throw_handle: None,
            exception_flag: false,
            handlers: ExceptionHandlers::default(),
            exception_iface: None,
            gc_events: Vec::new(),
            handles_leaked: 0,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The loaded program image.
    pub fn image(&self) -> &ProgramImage {
        &self.image
    }

    /// Mutable access to the image for incremental loading. Not available
    /// while the interpreter runs.
    pub fn image_mut(&mut self) -> VmResult<&mut ProgramImage> {
        if self.running {
            return Err(VmError::RuntimeLocked);
        }
        Ok(&mut self.image)
    }

    /// The handle pool.
    pub fn pool(&self) -> &HandlePool {
        &self.pool
    }

    /// Registers a native type implementation. Must happen before the
    /// `init_vm` that loads the type entry referencing it.
    pub fn register_native_type(&mut self, proc_: Rc<RefCell<dyn NativeType>>) {
        self.registry.register(proc_);
    }

    /// Initializes the VM. Idempotent and incremental: data handles and
    /// native types added to the image since the last call are picked up.
    pub fn init_vm(&mut self) -> VmResult<()> {
        if !self.initialized {
            if self.config.runtime_checks {
                crate::op_code::check_instruction_tables()?;
            }
            let root = self.alloc_context(0, 0)?;
            self.root = Some(root.clone());
            self.current = Some(root);
        }

        // incrementally create handles from the data segment
        for i in self.init_data_incr..self.image.data.len() {
            let value = self.image.data[i].value;
            let h = match value {
                DataValue::Null => {
                    let null = self.pool.null_ref();
                    self.pool.add_ref(null);
                    null
                }
                DataValue::Int(v) => self.pool.new_int(v),
                DataValue::Float(v) => self.pool.new_float(v),
                DataValue::StrOffset(offset) => {
                    let s = self.image.cstr.string_at(offset).to_string();
                    self.pool
                        .acquire_with(TYPE_STRING, Payload::Str(Rc::new(RefCell::new(s))))
                }
            };
            self.image.data[i].handle = Some(h);
        }
        self.init_data_incr = self.image.data.len();

        // incrementally initialize native types
        for type_id in self.init_type_incr..self.image.types.len() {
            let info = &self.image.types[type_id];
            if !info.native {
                continue;
            }
            let name = self.image.cstr.string_at(info.name_offset).to_string();
            let proc_ = self
                .registry
                .resolve(&name)
                .ok_or(VmError::UndefinedType { name })?;
            proc_.borrow_mut().initialize(self)?;
            self.native_procs.insert(type_id as i32, proc_);
        }
        self.init_type_incr = self.image.types.len();

        self.initialized = true;
        Ok(())
    }

    /// Executes module-initialization code not yet run. The init code is
    /// the prefix of the code segment up to the first function body.
    pub fn run_init_code(&mut self, init_end: i32) -> VmResult<()> {
        if self.blocked {
            return Err(VmError::RuntimeBlocked);
        }
        self.init_vm()?;
        if self.run_init_incr >= init_end {
            return Ok(());
        }
        let start = self.run_init_incr;
        let root = self.root.clone().expect("initialized");
        let result = self.execute_at_in(&root, start, None);
        self.run_init_incr = if result.is_ok() {
            init_end
        } else {
            root.borrow().pc
        };
        result
    }

    /// Tears the VM down: releases every context, data handle and leftover
    /// handle, reporting leaks per the configured log mode.
    pub fn term_vm(&mut self) -> VmResult<()> {
        if !self.initialized {
            return Ok(());
        }
        self.blocked = true;

        // shutdown events for external-roots owners
        let mut events = std::mem::take(&mut self.gc_events);
        for cb in events.iter_mut() {
            let _ = cb(self, GcEvent::Shutdown);
        }

        // free the root context; nested contexts die through their handles
        if let Some(root) = self.root.take() {
            self.free_context(&root);
        }
        self.current = None;

        if let Some(t) = self.throw_handle.take() {
            self.release_handle(t);
        }
        for i in 0..self.image.data.len() {
            if let Some(h) = self.image.data[i].handle.take() {
                self.release_handle(h);
            }
        }
        self.init_data_incr = 0;

        let procs: Vec<NativeProc> = self.native_procs.drain().map(|(_, p)| p).collect();
        for p in procs {
            p.borrow_mut().terminate(self)?;
        }
        self.init_type_incr = 0;

        // leak report and forced destruction
        let mode = self.config.log_garbage_mode;
        if mode == LogGarbageMode::All {
            for r in self.pool.iter_refs().skip(1) {
                let h = self.pool.handle(r);
                if h.ref_count > 0 {
                    info!(
                        "leaked handle {}, ref count {}, type {}",
                        r.index(),
                        h.ref_count,
                        self.image.type_name(h.type_id)
                    );
                }
            }
        }
        let mut leaked = 0;
        for r in self.pool.iter_refs().skip(1).collect::<Vec<_>>() {
            let h = self.pool.handle(r);
            if h.ref_count > 0 {
                if mode == LogGarbageMode::Brief {
                    info!(
                        "collecting handle {}, ref count {}, type {}",
                        r.index(),
                        h.ref_count,
                        self.image.type_name(h.type_id)
                    );
                }
                leaked += 1;
                self.pool.handle_mut(r).ref_count = 1;
                self.release_handle(r);
            }
        }
        if leaked > 0 {
            self.handles_leaked += leaked;
            let left = self.pool.live_count();
            info!("--- teardown collected {} handles, {} left ---", leaked, left);
        }
        self.pool.log_bucket_shutdown();

        self.initialized = false;
        self.running = false;
        self.run_level = 0;
        Ok(())
    }

    /// Number of handles that were still live when teardown or a
    /// collection had to reclaim them.
    pub fn leaked_handles(&self) -> usize {
        self.handles_leaked
    }

    /// Executed-instruction counter.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_counter
    }

    /// Enables or disables the per-instruction trace exception.
    pub fn set_trace_flag(&mut self, on: bool) {
        self.trace_flag = on;
    }

    /// Installs an exception handler; returns the previous one.
    pub fn set_exception_handler(
        &mut self,
        kind: HandlerKind,
        callback: Option<ExceptionCallback>,
    ) -> Option<ExceptionCallback> {
        let slot = match kind {
            HandlerKind::Software => &mut self.handlers.software,
            HandlerKind::Trace => &mut self.handlers.trace,
            HandlerKind::Break => &mut self.handlers.brk,
            HandlerKind::Machine => &mut self.handlers.machine,
        };
        std::mem::replace(slot, callback)
    }

    /// Declares which interface type plays the `Exception` role for
    /// [`Vm::exception_get_error`] and [`Vm::exception_get_message`].
    pub fn set_exception_interface(&mut self, type_id: i32) {
        self.exception_iface = Some(type_id);
    }

    /// Registers a GC event callback providing external roots.
    pub fn add_gc_event(&mut self, callback: GcEventCallback) {
        self.gc_events.push(callback);
    }

    /// The current (possibly coroutine) context.
    pub(crate) fn current_context(&self) -> ContextBody {
        self.current.clone().expect("VM not initialized")
    }

    // ------------------------------------------------------------------
    // context management
    // ------------------------------------------------------------------

    /// Allocates a context: fresh stacks, registers all null, r2 a weak
    /// reference to `__global`, and `num_args` arguments copied from the
    /// current context's stack top.
    pub(crate) fn alloc_context(&mut self, num_args: usize, func_addr: i32) -> VmResult<ContextBody> {
        let null = self.pool.null_ref();
        let mut ctx = ExecutionContext::new(self.config.call_stack_size, self.config.stack_size, null);
        ctx.pc = func_addr;
        self.pool.add_ref_n(null, NUM_REGISTERS as u32);

        if let Some(root) = &self.root {
            let global = root.borrow().register(GLOBAL_REGISTER);
            let weak = self.pool.weak_ref(global);
            let old = ctx.register(GLOBAL_REGISTER);
            ctx.set_register(GLOBAL_REGISTER, weak);
            self.release_handle(old);
        }

        if num_args > 0 {
            let src = self.current_context();
            let src = src.borrow();
            for i in (0..num_args).rev() {
                let h = src.stack_slot(i);
                self.pool.add_ref(h);
                ctx.push_data(h)?;
            }
        }
        Ok(Rc::new(RefCell::new(ctx)))
    }

    /// Releases every live slot of a context (register window included).
    pub(crate) fn free_context(&mut self, ctx: &ContextBody) {
        let live: Vec<HandleRef> = {
            let mut c = ctx.borrow_mut();
            let live = c.live_slots().to_vec();
            let size = c.data_stack_size();
            c.data_sp = size;
            live
        };
        for h in live {
            self.release_handle(h);
        }
    }

    // ------------------------------------------------------------------
    // handle destruction and deep copy
    // ------------------------------------------------------------------

    /// Drops one reference, destroying the payload graph when the count
    /// reaches zero.
    pub fn release_handle(&mut self, r: HandleRef) {
        let mut work = vec![r];
        while let Some(r) = work.pop() {
            if let Some((type_id, payload)) = self.pool.release(r) {
                self.destroy_payload(type_id, payload, &mut work);
            }
        }
    }

    fn destroy_payload(&mut self, type_id: i32, payload: Payload, work: &mut Vec<HandleRef>) {
        match payload {
            Payload::Null | Payload::Int(_) | Payload::Float(_) | Payload::Str(_) => {}
            Payload::Array(body) | Payload::Object(body) => {
                work.extend(body.borrow_mut().drain(..));
            }
            Payload::Native(body) => {
                if let Some(proc_) = self.native_procs.get(&type_id).cloned() {
                    let mut obj = body.borrow_mut();
                    proc_.borrow().destroy_object(obj.as_mut());
                }
            }
            Payload::Delegate(body) => {
                let mut d = body.borrow_mut();
                if let Some(this) = d.this.take() {
                    work.push(this);
                }
                if let Some(closure) = d.closure.take() {
                    work.extend(closure);
                }
            }
            Payload::Context(body) => {
                let mut c = body.borrow_mut();
                let size = c.data_stack_size();
                let live: Vec<HandleRef> = c.live_slots().to_vec();
                c.data_sp = size;
                work.extend(live);
            }
        }
    }

    /// Deep copy of a handle (§ handle system). Classes with a copy
    /// constructor run it through the interpreter; classes without one copy
    /// member-wise by value type. Contexts cannot be copied.
    pub fn copy_handle(&mut self, src: HandleRef) -> VmResult<HandleRef> {
        let (type_id, payload) = {
            let h = self.pool.handle(src);
            (h.type_id, h.payload.clone())
        };
        match payload {
            Payload::Null => {
                let null = self.pool.null_ref();
                self.pool.add_ref(null);
                Ok(null)
            }
            Payload::Int(v) => Ok(self.pool.new_int(v)),
            Payload::Float(v) => Ok(self.pool.new_float(v)),
            Payload::Str(body) => {
                let copy = body.borrow().clone();
                Ok(self
                    .pool
                    .acquire_with(TYPE_STRING, Payload::Str(Rc::new(RefCell::new(copy)))))
            }
            Payload::Array(body) => {
                let elems: Vec<HandleRef> = body.borrow().iter().copied().collect();
                let mut copied = Vec::with_capacity(elems.len());
                for e in elems {
                    copied.push(self.pool.copy_value_type(e));
                }
                Ok(self.pool.acquire_with(
                    type_id,
                    Payload::Array(Rc::new(RefCell::new(copied))),
                ))
            }
            Payload::Native(_) => {
                let info = self.image.type_info(type_id)?;
                let cctor = info.methods.cctor;
                if cctor < 0 {
                    return Err(VmError::UnsupportedNativeCall {
                        type_id,
                        member: cctor,
                    });
                }
                let proc_ = self
                    .native_procs
                    .get(&type_id)
                    .cloned()
                    .ok_or(VmError::UndefinedType {
                        name: self.image.type_name(type_id).to_string(),
                    })?;
                let obj = proc_.borrow().new_object(self)?;
                let dest = self.new_handle_for_object(type_id, obj);
                // push the source for the copy constructor, argument 0
                let ctx = self.current_context();
                self.pool.add_ref(src);
                ctx.borrow_mut().push_data(src)?;
                let body = self.pool.handle(dest).as_native().cloned().expect("native");
                let result = proc_.borrow().call_member(self, cctor, &body);
                let popped = ctx.borrow_mut().pop_data()?;
                self.release_handle(popped);
                if let Err(e) = result {
                    self.release_handle(dest);
                    return Err(e);
                }
                Ok(dest)
            }
            Payload::Object(body) => {
                let info = self.image.type_info(type_id)?;
                let (cctor, size) = (info.methods.cctor, info.instance_size);
                if cctor < 0 {
                    let members: Vec<HandleRef> = body.borrow().iter().copied().collect();
                    let mut copied = Vec::with_capacity(size);
                    for m in members {
                        copied.push(self.pool.copy_value_type(m));
                    }
                    Ok(self
                        .pool
                        .acquire_with(type_id, Payload::Object(Rc::new(RefCell::new(copied)))))
                } else {
                    let dest = self.alloc_object(type_id)?;
                    if let Err(e) = self.call_copy_constructor(dest, src) {
                        self.release_handle(dest);
                        return Err(e);
                    }
                    Ok(dest)
                }
            }
            Payload::Delegate(body) => {
                let (index, this) = {
                    let d = body.borrow();
                    (d.index, d.this)
                };
                if let Some(t) = this {
                    self.pool.add_ref(t);
                }
                Ok(self.pool.acquire_with(
                    type_id,
                    Payload::Delegate(Rc::new(RefCell::new(Delegate {
                        index,
                        this,
                        closure: None,
                    }))),
                ))
            }
            Payload::Context(_) => Err(VmError::unsupported_type(type_id, "copy")),
        }
    }

    // ------------------------------------------------------------------
    // host call surface
    // ------------------------------------------------------------------

    /// Calls a global function by function id.
    pub fn call_func(&mut self, fn_id: i32) -> VmResult<()> {
        if self.blocked {
            return Err(VmError::RuntimeBlocked);
        }
        self.init_vm()?;
        let func = self.image.func_info(fn_id)?.clone();
        let type_info = self.image.type_info(func.type_id)?;
        if type_info.native {
            let proc_ = self.native_proc(func.type_id)?;
            let result = proc_.borrow().call_static(self, func.member_idx);
            result
        } else {
            let ctx = self.current_context();
            self.execute_at_in(&ctx, func.code_addr, None)
        }
    }

    /// Calls member `slot` of the object's class through its v-table.
    pub fn call_method(&mut self, obj: HandleRef, slot: i32) -> VmResult<()> {
        if self.blocked {
            return Err(VmError::RuntimeBlocked);
        }
        self.init_vm()?;
        let type_id = self.pool.handle(obj).type_id;
        let info = self.image.type_info(type_id)?;
        if info.family != TypeFamily::Class && info.family != TypeFamily::Thread {
            return Err(VmError::InvalidHandleType { type_id });
        }
        if info.native {
            let proc_ = self.native_proc(type_id)?;
            let body = self
                .pool
                .handle(obj)
                .as_native()
                .cloned()
                .ok_or(VmError::InvalidHandleType { type_id })?;
            let result = proc_.borrow().call_member(self, slot, &body);
            result
        } else {
            let vtab = info.vtable_offset;
            if vtab < 0 {
                return Err(VmError::InvalidMemberIndex {
                    index: slot,
                    type_id,
                });
            }
            let fn_id = self.image.cstr.vtable_entry(vtab as usize, slot as usize)?;
            let func = self.image.func_info(fn_id)?.clone();
            let ctx = self.current_context();
            self.execute_at_in(&ctx, func.code_addr, Some(obj))
        }
    }

    /// Calls a delegate handle: closure, method delegate or plain function.
    /// A null handle stores null into the return register and succeeds.
    pub fn call_delegate(&mut self, dg: HandleRef) -> VmResult<()> {
        if self.blocked {
            return Err(VmError::RuntimeBlocked);
        }
        self.init_vm()?;
        let (is_null, type_id, body) = {
            let h = self.pool.handle(dg);
            (h.is_null(), h.type_id, h.as_delegate().cloned())
        };
        if is_null {
            let null = self.pool.null_ref();
            self.pool.add_ref(null);
            self.set_return_register_raw(null);
            return Ok(());
        }
        let body = body.ok_or(VmError::InvalidHandleType { type_id })?;
        if self.config.runtime_checks
            && self.image.type_info(type_id)?.family != TypeFamily::Delegate
        {
            return Err(VmError::InvalidHandleType { type_id });
        }
        let (index, this, has_closure) = {
            let d = body.borrow();
            (d.index, d.this, d.closure.is_some())
        };
        if has_closure {
            self.call_closure(&body)
        } else if let Some(obj) = this {
            self.call_method(obj, index)
        } else {
            self.call_func(index)
        }
    }

    /// Calls a closure: the captured stack slice is pushed first, the call
    /// arguments are re-pushed above it, and after the call returns the
    /// captured slots are copied back into the delegate.
    fn call_closure(&mut self, body: &crate::handle::DelegateBody) -> VmResult<()> {
        let (index, this, captured) = {
            let d = body.borrow();
            (
                d.index,
                d.this,
                d.closure.as_ref().cloned().unwrap_or_default(),
            )
        };
        let ncap = captured.len();
        let func = self.image.func_info(index)?.clone();
        let ctx = self.current_context();
        let old_sp = ctx.borrow().data_sp;

        // push the captured stack; slot 0 of the capture ends up on top
        for &h in captured.iter().rev() {
            self.pool.add_ref(h);
            ctx.borrow_mut().push_data(h)?;
        }
        // the call arguments sit at the saved stack pointer; re-push them
        // so the callee sees them on top, argument 0 topmost
        for i in (0..func.args).rev() {
            let h = {
                let c = ctx.borrow();
                c.stack_slot(old_sp - c.data_sp + i)
            };
            self.pool.add_ref(h);
            ctx.borrow_mut().push_data(h)?;
        }

        let result = self.execute_at_in(&ctx, func.code_addr, this);

        // move the (possibly rewritten) captured block back into the
        // closure: new value gains a reference, the old stored one is
        // released
        let new_vals: Vec<HandleRef> = {
            let c = ctx.borrow();
            (0..ncap)
                .map(|i| c.stack_slot(old_sp - ncap + i - c.data_sp))
                .collect()
        };
        for (i, &new) in new_vals.iter().enumerate() {
            self.pool.add_ref(new);
            let old = {
                let mut d = body.borrow_mut();
                let slots = d.closure.as_mut().expect("closure");
                std::mem::replace(&mut slots[i], new)
            };
            self.release_handle(old);
        }

        // pop everything down to the saved stack pointer
        loop {
            let sp = ctx.borrow().data_sp;
            if sp >= old_sp {
                break;
            }
            let h = ctx.borrow_mut().pop_data()?;
            self.release_handle(h);
        }
        result
    }

    /// Runs the class copy constructor on `object`, passing `src` as its
    /// single argument, under a saved stack frame.
    pub fn call_copy_constructor(&mut self, object: HandleRef, src: HandleRef) -> VmResult<()> {
        let object_type = self.pool.handle(object).type_id;
        let src_type = self.pool.handle(src).type_id;
        let info = self.image.type_info(object_type)?;
        if object_type != src_type || info.family != TypeFamily::Class {
            return Err(VmError::InvalidHandleType {
                type_id: object_type,
            });
        }
        let cctor = info.methods.cctor;
        let frame = self.push_stack_frame()?;
        let ctx = self.current_context();
        self.pool.add_ref(src);
        ctx.borrow_mut().push_data(src)?;
        let result = self.call_method(object, cctor);
        self.pop_stack_frame(frame);
        result
    }

    /// Snapshots pc, both stack pointers and r0/r1 around a re-entrant
    /// host call. Must be balanced with [`Vm::pop_stack_frame`].
    pub fn push_stack_frame(&mut self) -> VmResult<StackFrame> {
        let ctx = self.current_context();
        let (pc, call_sp) = {
            let c = ctx.borrow();
            (c.pc, c.call_sp)
        };
        for reg in [THIS_REGISTER, RETURN_REGISTER] {
            let h = ctx.borrow().register(reg);
            self.pool.add_ref(h);
            ctx.borrow_mut().push_data(h)?;
        }
        let data_sp = ctx.borrow().data_sp;
        Ok(StackFrame {
            ctx,
            pc,
            call_sp,
            data_sp,
        })
    }

    /// Restores the machine state saved by [`Vm::push_stack_frame`].
    pub fn pop_stack_frame(&mut self, frame: StackFrame) {
        let ctx = frame.ctx.clone();
        // unroll anything left above the saved stack pointer
        loop {
            let sp = ctx.borrow().data_sp;
            if sp >= frame.data_sp {
                break;
            }
            let h = ctx.borrow_mut().pop_data().expect("frame unroll");
            self.release_handle(h);
        }
        for reg in [RETURN_REGISTER, THIS_REGISTER] {
            let h = ctx.borrow_mut().pop_data().expect("frame registers");
            let old = {
                let mut c = ctx.borrow_mut();
                let old = c.register(reg);
                c.set_register(reg, h);
                old
            };
            self.release_handle(old);
        }
        {
            let mut c = ctx.borrow_mut();
            c.call_sp = frame.call_sp;
            c.pc = frame.pc;
        }
        self.current = Some(frame.ctx);
    }

    /// Enters the interpreter at `address` in context `ctx`, optionally
    /// moving a `this` object into r0 first. Returns when the matching
    /// `ret` pops the return-to-native sentinel.
    pub(crate) fn execute_at_in(
        &mut self,
        ctx: &ContextBody,
        address: i32,
        this: Option<HandleRef>,
    ) -> VmResult<()> {
        if address < 0 || address as usize >= self.image.code.len() {
            return Err(VmError::InvalidCodeAddress { address });
        }
        ctx.borrow_mut().push_call(RETURN_TO_NATIVE)?;
        ctx.borrow_mut().pc = address;
        if let Some(obj) = this {
            self.pool.add_ref(obj);
            let old = {
                let mut c = ctx.borrow_mut();
                let old = c.register(THIS_REGISTER);
                c.set_register(THIS_REGISTER, obj);
                old
            };
            self.release_handle(old);
        }
        self.current = Some(ctx.clone());
        self.run()
    }

    pub(crate) fn native_proc(&self, type_id: i32) -> VmResult<NativeProc> {
        self.native_procs
            .get(&type_id)
            .cloned()
            .ok_or(VmError::UndefinedType {
                name: self.image.type_name(type_id).to_string(),
            })
    }

    pub(crate) fn set_return_register_raw(&mut self, h: HandleRef) {
        let ctx = self.current_context();
        let old = {
            let mut c = ctx.borrow_mut();
            let old = c.register(RETURN_REGISTER);
            c.set_register(RETURN_REGISTER, h);
            old
        };
        self.release_handle(old);
    }

    /// The handle in the return register (r1).
    pub fn return_register(&self) -> HandleRef {
        self.current_context().borrow().register(RETURN_REGISTER)
    }

    /// Pushes a call argument onto the current data stack; the VM takes
    /// its own reference. Arguments are pushed last-first so argument 0
    /// ends up on top.
    pub fn push_arg(&mut self, h: HandleRef) -> VmResult<()> {
        self.init_vm()?;
        self.pool.add_ref(h);
        let ctx = self.current_context();
        let pushed = ctx.borrow_mut().push_data(h);
        if pushed.is_err() {
            self.release_handle(h);
        }
        pushed
    }

    /// Pops and releases one previously pushed argument.
    pub fn pop_arg(&mut self) -> VmResult<()> {
        let ctx = self.current_context();
        let h = ctx.borrow_mut().pop_data()?;
        self.release_handle(h);
        Ok(())
    }

    // ------------------------------------------------------------------
    // runtime type checks and dynamic conversion
    // ------------------------------------------------------------------

    /// Runtime type assertion: true if `obj` may be stored where a value of
    /// `type_id` is expected (exact match, null, delegate-for-delegate, or
    /// derived class).
    pub fn rt_check(&self, type_id: i32, obj: HandleRef) -> bool {
        let actual = self.pool.handle(obj).type_id;
        if actual == type_id || actual == TYPE_NULL {
            return true;
        }
        if let Ok(info) = self.image.type_info(actual) {
            if info.family == TypeFamily::Delegate {
                return self
                    .image
                    .type_info(type_id)
                    .map(|t| t.family == TypeFamily::Delegate)
                    .unwrap_or(false);
            }
        }
        self.image.is_base_type(type_id, actual)
    }

    /// Dynamic conversion. Only conversion to string is defined: null and
    /// strings pass through, int/float format themselves, classes with a
    /// `to-string` method call it, anything else converts to its type name.
    pub fn dynamic_convert(&mut self, dest_type: i32, src: HandleRef) -> VmResult<HandleRef> {
        if dest_type != TYPE_STRING {
            return Err(VmError::unsupported_type(dest_type, "dcvt"));
        }
        let (type_id, payload) = {
            let h = self.pool.handle(src);
            (h.type_id, h.payload.clone())
        };
        let text = match payload {
            Payload::Null | Payload::Str(_) => {
                self.pool.add_ref(src);
                return Ok(src);
            }
            Payload::Int(v) => v.to_string(),
            Payload::Float(v) => v.to_string(),
            _ => {
                let to_string = self.image.type_info(type_id)?.methods.to_string;
                if to_string >= 0 {
                    let frame = self.push_stack_frame()?;
                    let result = self.call_method(src, to_string);
                    let out = if result.is_ok() {
                        let h = frame.ctx.borrow().register(RETURN_REGISTER);
                        self.pool.add_ref(h);
                        Some(h)
                    } else {
                        None
                    };
                    self.pop_stack_frame(frame);
                    result?;
                    return Ok(out.expect("to-string result"));
                }
                self.image.type_name(type_id).to_string()
            }
        };
        Ok(self
            .pool
            .acquire_with(TYPE_STRING, Payload::Str(Rc::new(RefCell::new(text)))))
    }

    /// If `exception` derives from the configured exception interface,
    /// calls its `getError` slot and returns the error code.
    pub fn exception_get_error(&mut self, exception: HandleRef) -> VmResult<i64> {
        let iface = match self.exception_iface {
            Some(t) => t,
            None => return Ok(0),
        };
        let type_id = self.pool.handle(exception).type_id;
        let info = self.image.type_info(type_id)?;
        if info.family != TypeFamily::Class || !self.image.is_base_type(iface, type_id) {
            return Ok(0);
        }
        let frame = self.push_stack_frame()?;
        let result = self.call_method(exception, EXCEPTION_GET_ERROR_SLOT);
        let code = if result.is_ok() {
            let h = frame.ctx.borrow().register(RETURN_REGISTER);
            self.pool.handle(h).as_int().unwrap_or(0)
        } else {
            0
        };
        self.pop_stack_frame(frame);
        result?;
        Ok(code)
    }

    /// If `exception` derives from the configured exception interface,
    /// calls its `getMessage` slot and returns the message string.
    pub fn exception_get_message(&mut self, exception: HandleRef) -> VmResult<Option<String>> {
        let iface = match self.exception_iface {
            Some(t) => t,
            None => return Ok(None),
        };
        let type_id = self.pool.handle(exception).type_id;
        let info = self.image.type_info(type_id)?;
        if info.family != TypeFamily::Class || !self.image.is_base_type(iface, type_id) {
            return Ok(None);
        }
        let frame = self.push_stack_frame()?;
        let result = self.call_method(exception, EXCEPTION_GET_MESSAGE_SLOT);
        let message = if result.is_ok() {
            let h = frame.ctx.borrow().register(RETURN_REGISTER);
            self.pool.handle(h).as_str().map(|s| s.borrow().clone())
        } else {
            None
        };
        self.pop_stack_frame(frame);
        result?;
        Ok(message)
    }

    /// The handle thrown by the most recent `throw`, if any.
    pub fn throw_handle(&self) -> Option<HandleRef> {
        self.throw_handle
    }

    // ------------------------------------------------------------------
    // convenience constructors for hosts and tests
    // ------------------------------------------------------------------

    /// Creates an int handle owned by the caller.
    pub fn new_int_handle(&mut self, v: i64) -> HandleRef {
        self.pool.new_int(v)
    }

    /// Creates a float handle owned by the caller.
    pub fn new_float_handle(&mut self, v: f64) -> HandleRef {
        self.pool.new_float(v)
    }

    /// Creates a string handle owned by the caller.
    pub fn new_string_handle(&mut self, s: impl Into<String>) -> HandleRef {
        self.pool
            .acquire_with(TYPE_STRING, Payload::Str(Rc::new(RefCell::new(s.into()))))
    }

    /// Reads the int value of a handle.
    pub fn int_value(&self, h: HandleRef) -> Option<i64> {
        self.pool.handle(h).as_int()
    }

    /// Reads the float value of a handle.
    pub fn float_value(&self, h: HandleRef) -> Option<f64> {
        self.pool.handle(h).as_float()
    }

    /// Reads the string value of a handle.
    pub fn string_value(&self, h: HandleRef) -> Option<String> {
        self.pool.handle(h).as_str().map(|s| s.borrow().clone())
    }

    /// The type id of a handle.
    pub fn type_of(&self, h: HandleRef) -> i32 {
        self.pool.handle(h).type_id
    }
}

/// Well-known v-table slot of `Exception.getError`.
pub const EXCEPTION_GET_ERROR_SLOT: i32 = 0;
/// Well-known v-table slot of `Exception.getMessage`.
pub const EXCEPTION_GET_MESSAGE_SLOT: i32 = 1;

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("initialized", &self.initialized)
            .field("running", &self.running)
            .field("run_level", &self.run_level)
            .field("used_handles", &self.pool.used_handles())
            .finish()
    }
}
