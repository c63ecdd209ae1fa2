//! End-to-end interpreter tests over hand-assembled programs.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use lapis_vm::native_type::NativeType;
use lapis_vm::{
    DataValue, FuncInfo, HandlerKind, MethodInfo, OpCode, ProgramImage, TypeFamily, TypeInfo, Vm,
    VmConfig, VmError,
};

fn op(o: OpCode) -> i32 {
    o as i32
}

fn push_function(image: &mut ProgramImage, type_id: i32, code: &[i32]) -> i32 {
    let addr = image.code.len() as i32;
    image.code.extend_from_slice(code);
    image.functions.push(FuncInfo {
        type_id,
        code_addr: addr,
        code_size: code.len() as i32,
        args: 0,
        member_idx: image.functions.len() as i32,
    });
    (image.functions.len() - 1) as i32
}

fn push_class_type(image: &mut ProgramImage, name: &str, family: TypeFamily, base: i32) -> i32 {
    let name_offset = image.cstr.add_string(name);
    image.types.push(TypeInfo {
        family,
        name_offset,
        instance_size: 0,
        base,
        vtable_offset: -1,
        native: false,
        methods: MethodInfo::default(),
    });
    (image.types.len() - 1) as i32
}

#[test]
fn test_integer_arithmetic() {
    // (7 * 6) + 1 == 43
    let mut image = ProgramImage::new();
    let d7 = image.add_data(DataValue::Int(7)) as i32;
    let d6 = image.add_data(DataValue::Int(6)) as i32;
    let d1 = image.add_data(DataValue::Int(1)) as i32;
    let code = [
        op(OpCode::CopyhR), d7, 3,
        op(OpCode::MovehR), d6, 4,
        op(OpCode::MullRR), 4, 3,
        op(OpCode::CopyhR), d1, 1,
        op(OpCode::AddlRR), 3, 1,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(43));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_division_by_zero_reports_faulting_pc() {
    // 10 / 0 with no handler installed
    let mut image = ProgramImage::new();
    let d10 = image.add_data(DataValue::Int(10)) as i32;
    let d0 = image.add_data(DataValue::Int(0)) as i32;
    let code = [
        op(OpCode::CopyhR), d10, 1,
        op(OpCode::MovehR), d0, 3,
        op(OpCode::DivlRR), 3, 1,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    let err = vm.call_func(f).unwrap_err();
    assert!(matches!(err, VmError::DivisionByZero { .. }));
    assert_eq!(err.code(), 4);
    // the recorded pc points at the div instruction
    assert_eq!(vm.err_pc(), 6);
    vm.clear_exception_state();
    vm.term_vm().unwrap();
}

#[test]
fn test_string_concatenation() {
    let mut image = ProgramImage::new();
    let hello = image.add_string_literal("hello, ") as i32;
    let world = image.add_string_literal("world") as i32;
    let code = [
        op(OpCode::CopyhR), hello, 1,
        op(OpCode::MovehR), world, 3,
        op(OpCode::StraddRR), 3, 1,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);
    let size_code = [
        op(OpCode::CopyhR), hello, 3,
        op(OpCode::MovehR), world, 4,
        op(OpCode::StraddRR), 4, 3,
        op(OpCode::Size), 3, 1,
        op(OpCode::Ret),
    ];
    let g = push_function(&mut image, 0, &size_code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(
        vm.string_value(vm.return_register()).as_deref(),
        Some("hello, world")
    );
    vm.call_func(g).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(12));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_coroutine_ping_pong() {
    let mut image = ProgramImage::new();
    let thread_type = push_class_type(&mut image, "Counter", TypeFamily::Thread, 0);
    let d1 = image.add_data(DataValue::Int(1)) as i32;
    let d2 = image.add_data(DataValue::Int(2)) as i32;
    let d3 = image.add_data(DataValue::Int(3)) as i32;
    let dnull = image.add_data(DataValue::Null) as i32;

    // the coroutine body: yield 1, 2, 3, then null forever
    let body = [
        op(OpCode::CopyhR), d1, 1,
        op(OpCode::Yield),
        op(OpCode::CopyhR), d2, 1,
        op(OpCode::Yield),
        op(OpCode::CopyhR), d3, 1,
        op(OpCode::Yield),
        op(OpCode::MovehR), dnull, 1,
        op(OpCode::Yield),
        op(OpCode::Bra), -1,
    ];
    let cofunc = push_function(&mut image, thread_type, &body);

    // spawn the context and park it in the global register
    let spawn = [
        op(OpCode::Newctx), thread_type, cofunc, 0, 3,
        op(OpCode::MoveRR), 3, 2,
        op(OpCode::Ret),
    ];
    let spawn_fn = push_function(&mut image, 0, &spawn);
    // resume the parked context once
    let pump = [op(OpCode::ResumeR), 2, op(OpCode::Ret)];
    let pump_fn = push_function(&mut image, 0, &pump);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(spawn_fn).unwrap();
    for expected in [1, 2, 3] {
        vm.call_func(pump_fn).unwrap();
        assert_eq!(vm.int_value(vm.return_register()), Some(expected));
    }
    // a fourth resume finds the coroutine finished
    vm.call_func(pump_fn).unwrap();
    assert_eq!(vm.type_of(vm.return_register()), 0);
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_gc_reclaims_cycle() {
    let mut image = ProgramImage::new();
    let node = push_class_type(&mut image, "Node", TypeFamily::Class, 0);
    image.types[node as usize].instance_size = 1;
    let dnull = image.add_data(DataValue::Null) as i32;
    let code = [
        op(OpCode::Alloc), node, 3,
        op(OpCode::Alloc), node, 4,
        op(OpCode::MoveRD), 4, 3, 0, // a.next = b
        op(OpCode::MoveRD), 3, 4, 0, // b.next = a
        op(OpCode::MovehR), dnull, 3,
        op(OpCode::MovehR), dnull, 4,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    // the cycle is invisible to reference counting
    assert_eq!(vm.collect_garbage().unwrap(), 2);
    assert_eq!(vm.collect_garbage().unwrap(), 0);
    vm.term_vm().unwrap();
}

#[test]
fn test_gc_refuses_to_run_while_running() {
    // checked indirectly: collect_garbage from a native callback during
    // execution returns RuntimeLocked
    struct Locker;
    impl NativeType for Locker {
        fn name(&self) -> &str {
            "Locker"
        }
        fn new_object(&self, _vm: &mut Vm) -> lapis_vm::VmResult<Box<dyn Any>> {
            Ok(Box::new(()))
        }
        fn call_static(&self, vm: &mut Vm, _member: i32) -> lapis_vm::VmResult<()> {
            assert!(matches!(
                vm.collect_garbage(),
                Err(VmError::RuntimeLocked)
            ));
            vm.return_int(1);
            Ok(())
        }
        fn call_member(
            &self,
            _vm: &mut Vm,
            _member: i32,
            _obj: &lapis_vm::handle::NativeBody,
        ) -> lapis_vm::VmResult<()> {
            Ok(())
        }
    }

    let mut image = ProgramImage::new();
    let name_offset = image.cstr.add_string("Locker");
    image.types.push(TypeInfo {
        family: TypeFamily::Class,
        name_offset,
        instance_size: 0,
        base: 0,
        vtable_offset: -1,
        native: true,
        methods: MethodInfo::default(),
    });
    let locker = (image.types.len() - 1) as i32;
    let code = [op(OpCode::Calln), locker, 0, op(OpCode::Ret)];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.register_native_type(Rc::new(RefCell::new(Locker)));
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(1));
    vm.term_vm().unwrap();
}

#[test]
fn test_exception_handler_resumes_after_clear() {
    let mut image = ProgramImage::new();
    let d10 = image.add_data(DataValue::Int(10)) as i32;
    let d0 = image.add_data(DataValue::Int(0)) as i32;
    let d5 = image.add_data(DataValue::Int(5)) as i32;
    let code = [
        op(OpCode::CopyhR), d10, 1,
        op(OpCode::MovehR), d0, 3,
        op(OpCode::DivlRR), 3, 1,
        op(OpCode::CopyhR), d5, 1,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.set_exception_handler(
        HandlerKind::Machine,
        Some(Box::new(|vm: &mut Vm| {
            vm.clear_exception_state();
        })),
    );
    vm.call_func(f).unwrap();
    // execution resumed at the instruction after the faulting div
    assert_eq!(vm.int_value(vm.return_register()), Some(5));
    vm.term_vm().unwrap();
}

#[test]
fn test_throw_and_software_exception() {
    let mut image = ProgramImage::new();
    let msg = image.add_string_literal("boom") as i32;
    let code = [
        op(OpCode::MovehR), msg, 1,
        op(OpCode::Throw),
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    let err = vm.call_func(f).unwrap_err();
    assert_eq!(err, VmError::SoftwareException);
    let thrown = vm.throw_handle().expect("throw handle");
    assert_eq!(vm.string_value(thrown).as_deref(), Some("boom"));
    vm.clear_exception_state();
    assert!(vm.throw_handle().is_none());
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_branches_and_compare() {
    // r1 = (4 > 3) ? 11 : 22, via tsteq over the compare result
    let mut image = ProgramImage::new();
    let d4 = image.add_data(DataValue::Int(4)) as i32;
    let d3 = image.add_data(DataValue::Int(3)) as i32;
    let d11 = image.add_data(DataValue::Int(11)) as i32;
    let d22 = image.add_data(DataValue::Int(22)) as i32;
    let code = [
        op(OpCode::MovehR), d3, 3,        // 0
        op(OpCode::MovehR), d4, 4,        // 3
        op(OpCode::CsgtlRR), 3, 4, 5,     // 6: r5 = (r4 > r3)
        op(OpCode::TsteqR), 5, 8,         // 10: if !r5 -> 18
        op(OpCode::CopyhR), d11, 1,       // 13
        op(OpCode::Ret),                  // 16 (skipped? no: fallthrough ret)
        op(OpCode::Nop),                  // 17
        op(OpCode::CopyhR), d22, 1,       // 18
        op(OpCode::Ret),                  // 21
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(11));
    vm.term_vm().unwrap();
}

#[test]
fn test_array_alloc_and_indexing() {
    // alloca with one dimension of size 3, fill with ints, sum them
    let mut image = ProgramImage::new();
    let d3 = image.add_data(DataValue::Int(3)) as i32;
    let d0 = image.add_data(DataValue::Int(0)) as i32;
    let d10 = image.add_data(DataValue::Int(10)) as i32;
    let code = [
        op(OpCode::MovehR), d3, 3,         // r3 = 3
        op(OpCode::PushR), 3,              // dimension on stack
        op(OpCode::Alloca), 1, 1, 4,       // r4 = int[3] (filled with 0)
        op(OpCode::Pop),                   // drop the dimension
        op(OpCode::MovehR), d0, 5,         // r5 = index 0
        op(OpCode::CopyhR), d10, 6,        // r6 = 10
        op(OpCode::MoveRX), 6, 4, 5,       // a[0] = 10
        op(OpCode::CopyhR), d0, 1,         // r1 = 0
        op(OpCode::AddlXR), 4, 5, 1,       // r1 += a[0]
        op(OpCode::Size), 4, 7,            // r7 = 3
        op(OpCode::AddlRR), 7, 1,          // r1 += 3
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(13));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_delegate_call() {
    let mut image = ProgramImage::new();
    let d9 = image.add_data(DataValue::Int(9)) as i32;
    // target function: r1 = 9
    let target_code = [op(OpCode::CopyhR), d9, 1, op(OpCode::Ret)];
    let target = push_function(&mut image, 0, &target_code);
    // delegate type entry
    let dg_type = push_class_type(&mut image, "IntFn", TypeFamily::Delegate, 0);
    let code = [
        op(OpCode::Newdg), dg_type, target, 3,
        op(OpCode::CalldgR), 3,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(9));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_null_delegate_call_returns_null() {
    let mut image = ProgramImage::new();
    let d9 = image.add_data(DataValue::Int(9)) as i32;
    let code = [
        op(OpCode::CopyhR), d9, 1, // r1 non-null first
        op(OpCode::CalldgR), 3,    // r3 is null
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.type_of(vm.return_register()), 0);
    vm.term_vm().unwrap();
}

#[test]
fn test_weak_reference_does_not_own() {
    let mut image = ProgramImage::new();
    let hello = image.add_string_literal("keep") as i32;
    // store a weak ref to a fresh string in r3, the strong one in r4
    let code = [
        op(OpCode::CopyhR), hello, 4,
        op(OpCode::WrefRR), 4, 3,
        op(OpCode::Size), 3, 1, // reading through the weak ref works
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(4));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_runtime_type_check() {
    let mut image = ProgramImage::new();
    let d1 = image.add_data(DataValue::Int(1)) as i32;
    let code = [
        op(OpCode::MovehR), d1, 3,
        op(OpCode::RtchkR), lapis_vm::TYPE_STRING, 3, // int where string expected
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    let err = vm.call_func(f).unwrap_err();
    assert!(matches!(err, VmError::TypeMismatch { .. }));
    vm.clear_exception_state();
    vm.term_vm().unwrap();
}

#[test]
fn test_dynamic_convert_to_string() {
    let mut image = ProgramImage::new();
    let d42 = image.add_data(DataValue::Int(42)) as i32;
    let code = [
        op(OpCode::MovehR), d42, 3,
        op(OpCode::Dcvt), lapis_vm::TYPE_STRING, 3, 1,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.string_value(vm.return_register()).as_deref(), Some("42"));
    vm.term_vm().unwrap();
}

#[test]
fn test_instruction_counter_and_trace() {
    let mut image = ProgramImage::new();
    let code = [op(OpCode::Nop), op(OpCode::Nop), op(OpCode::Ret)];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.instruction_count(), 3);

    // with tracing on and a clearing handler, execution still completes
    vm.set_trace_flag(true);
    vm.set_exception_handler(
        HandlerKind::Trace,
        Some(Box::new(|vm: &mut Vm| vm.clear_exception_state())),
    );
    vm.call_func(f).unwrap();
    vm.term_vm().unwrap();
}

#[test]
fn test_interface_factory() {
    let mut image = ProgramImage::new();
    let iface = push_class_type(&mut image, "Greeter", TypeFamily::Interface, 0);
    let impl_a = push_class_type(&mut image, "A", TypeFamily::Class, iface);
    let impl_b = push_class_type(&mut image, "B", TypeFamily::Class, iface);
    image.types[impl_a as usize].instance_size = 1;
    image.types[impl_b as usize].instance_size = 1;

    let code = [
        op(OpCode::Alloci), iface, 3,
        op(OpCode::Size), 3, 1,
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    // both implementing classes got an instance
    assert_eq!(vm.int_value(vm.return_register()), Some(2));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_closure_capture_and_write_back() {
    let mut image = ProgramImage::new();
    let dg_type = push_class_type(&mut image, "Adder", TypeFamily::Delegate, 0);
    let d5 = image.add_data(DataValue::Int(5)) as i32;

    // closure body: increments the captured slot (sp+0) and returns it
    let body = [
        op(OpCode::CopySR), 0, 3,     // private copy of the captured value
        op(OpCode::InclR), 3,
        op(OpCode::MoveRS), 3, 0,     // write back into the captured slot
        op(OpCode::MoveRR), 3, 1,
        op(OpCode::Ret),
    ];
    let body_fn = push_function(&mut image, 0, &body);

    // main: push 5, capture it in a closure, call twice
    let code = [
        op(OpCode::CopyhR), d5, 3,
        op(OpCode::PushR), 3,                       // captured slot
        op(OpCode::Newdgc), dg_type, 1, body_fn, 4, // capture 1 slot
        op(OpCode::Pop),
        op(OpCode::CalldgR), 4,                     // returns 6
        op(OpCode::CalldgR), 4,                     // returns 7
        op(OpCode::Ret),
    ];
    let f = push_function(&mut image, 0, &code);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(f).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(7));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}
