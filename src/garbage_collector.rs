//! Mark-and-sweep garbage collection.
//!
//! Reference counting reclaims everything acyclic; the collector exists for
//! reference cycles. It is externally triggered and refuses to run while
//! the interpreter is active. Roots are the data-segment handles, the
//! pending throw handle, every slot of the root context (the register
//! window lives on the stack, so registers are covered), and every
//! host-registered external root. After marking, every unmarked live
//! handle is forcibly dropped; finally all marks are cleared.

use std::time::Instant;

use log::{info, warn};

use crate::error::{VmError, VmResult};
use crate::execution_engine::{GcEvent, LogGarbageMode, Vm};
use crate::handle::{ContextBody, HandleFlags, HandleRef, Payload};

impl Vm {
    /// Marks a handle and everything reachable from it. Safe to call from
    /// GC event callbacks and native `mark_handles` implementations.
    pub fn mark_handle(&mut self, root: HandleRef) -> VmResult<()> {
        let mut work = vec![root];
        while let Some(r) = work.pop() {
            {
                let h = self.pool.handle_mut(r);
                if h.ref_count == 0 || h.flags.contains(HandleFlags::MARKED) {
                    continue;
                }
                h.flags |= HandleFlags::MARKED;
            }
            let (type_id, payload) = {
                let h = self.pool.handle(r);
                (h.type_id, h.payload.clone())
            };
            match payload {
                Payload::Null | Payload::Int(_) | Payload::Float(_) | Payload::Str(_) => {}
                Payload::Array(body) | Payload::Object(body) => {
                    work.extend(body.borrow().iter().copied());
                }
                Payload::Delegate(body) => {
                    let d = body.borrow();
                    if let Some(this) = d.this {
                        work.push(this);
                    }
                    if let Some(closure) = &d.closure {
                        work.extend(closure.iter().copied());
                    }
                }
                Payload::Context(body) => {
                    work.extend(body.borrow().live_slots().iter().copied());
                }
                Payload::Native(body) => {
                    let proc_ = self.native_proc(type_id).map_err(|e| {
                        VmError::MarkHandleError {
                            reason: e.to_string(),
                        }
                    })?;
                    let obj = body.borrow();
                    proc_
                        .borrow()
                        .mark_handles(obj.as_ref(), &mut |h| {
                            work.push(h);
                            Ok(())
                        })
                        .map_err(|e| VmError::MarkHandleError {
                            reason: e.to_string(),
                        })?;
                }
            }
        }
        Ok(())
    }

    /// Marks every live slot of a context.
    pub fn mark_context(&mut self, ctx: &ContextBody) -> VmResult<()> {
        let slots: Vec<HandleRef> = ctx.borrow().live_slots().to_vec();
        for h in slots {
            self.mark_handle(h)?;
        }
        Ok(())
    }

    fn mark_roots(&mut self) -> VmResult<()> {
        for i in 0..self.image.data.len() {
            if let Some(h) = self.image.data[i].handle {
                self.mark_handle(h)?;
            }
        }
        if let Some(t) = self.throw_handle {
            self.mark_handle(t)?;
        }
        if let Some(root) = self.root.clone() {
            self.mark_context(&root)?;
        }
        let mut events = std::mem::take(&mut self.gc_events);
        let mut result = Ok(());
        for cb in events.iter_mut() {
            result = cb(self, GcEvent::Mark);
            if result.is_err() {
                break;
            }
        }
        self.gc_events.append(&mut events);
        result
    }

    fn unmark_all(&mut self) {
        for r in self.pool.iter_refs().collect::<Vec<_>>() {
            self.pool.handle_mut(r).flags.remove(HandleFlags::MARKED);
        }
    }

    /// Runs a full collection and returns the number of handles reclaimed.
    ///
    /// Fails with `RuntimeLocked` while the interpreter is running and with
    /// `MarkHandleError` if a mark callback fails; a failed mark phase
    /// leaves no marks behind and reclaims nothing.
    pub fn collect_garbage(&mut self) -> VmResult<usize> {
        if self.running {
            return Err(VmError::RuntimeLocked);
        }
        let started = Instant::now();

        if let Err(e) = self.mark_roots() {
            warn!("GC mark error: {}", e);
            self.unmark_all();
            return Err(VmError::MarkHandleError {
                reason: e.to_string(),
            });
        }

        let mode = self.config.log_garbage_mode;
        if mode == LogGarbageMode::All {
            for r in self.pool.iter_refs().skip(1).collect::<Vec<_>>() {
                let h = self.pool.handle(r);
                if h.ref_count > 0 && !h.flags.contains(HandleFlags::MARKED) {
                    info!(
                        "leaked handle {}, ref count {}, type {}",
                        r.index(),
                        h.ref_count,
                        self.image.type_name(h.type_id)
                    );
                }
            }
        }

        // two-phase sweep: pick every unreachable handle first, then drop
        // them. The forced count of 1 makes each destruction run exactly
        // once even when the victims reference each other.
        let mut victims = Vec::new();
        for r in self.pool.iter_refs() {
            let h = self.pool.handle(r);
            if h.ref_count > 0 && !h.flags.contains(HandleFlags::MARKED) && r.index() != 0 {
                victims.push(r);
            }
        }
        for &r in &victims {
            if mode == LogGarbageMode::Brief {
                let h = self.pool.handle(r);
                info!(
                    "collecting handle {}, ref count {}, type {}",
                    r.index(),
                    h.ref_count,
                    self.image.type_name(h.type_id)
                );
            }
            self.pool.handle_mut(r).ref_count = 1;
        }
        for &r in &victims {
            self.release_handle(r);
        }
        self.unmark_all();

        let collected = victims.len();
        if collected > 0 {
            self.handles_leaked += collected;
            info!(
                "--- GC collected {} handles in {:?} ---",
                collected,
                started.elapsed()
            );
        }
        Ok(collected)
    }
}
