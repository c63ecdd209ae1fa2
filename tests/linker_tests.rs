//! Linker and optimizer tests: relocation, stub synthesis, register
//! saving and peephole rewrites, verified by executing the linked code.

use lapis_vm::linker::{self, optimizer, ClassDef, CodeBlock, FuncDef, Module, OptimizeReport};
use lapis_vm::{
    DataValue, FuncInfo, MethodInfo, OpCode, ProgramImage, TypeFamily, TypeInfo, Vm, VmConfig,
};

fn op(o: OpCode) -> i32 {
    o as i32
}

fn add_class_type(image: &mut ProgramImage, name: &str, base: i32) -> i32 {
    let name_offset = image.cstr.add_string(name);
    image.types.push(TypeInfo {
        family: TypeFamily::Class,
        name_offset,
        instance_size: 0,
        base,
        vtable_offset: -1,
        native: false,
        methods: MethodInfo::default(),
    });
    (image.types.len() - 1) as i32
}

fn reserve_functions(image: &mut ProgramImage, n: usize) {
    for _ in 0..n {
        image.functions.push(FuncInfo {
            type_id: 0,
            code_addr: 0,
            code_size: 0,
            args: 0,
            member_idx: 0,
        });
    }
}

/// Derived class D inherits B::sum unchanged, with D's own field in front
/// of B's members, so the relocated code must shift every `(r0+d)` member
/// access by the variable offset.
#[test]
fn test_inheritance_by_relocation() {
    let mut image = ProgramImage::new();
    let b = add_class_type(&mut image, "B", 0);
    let d = add_class_type(&mut image, "D", b);
    let globals = add_class_type(&mut image, "Globals", 0);
    reserve_functions(&mut image, 3);
    image.functions[0].type_id = b;
    image.functions[1].type_id = d;
    image.functions[1].member_idx = 0;
    image.functions[2].type_id = globals;

    let d3 = image.add_data(DataValue::Int(3)) as i32;
    let d4 = image.add_data(DataValue::Int(4)) as i32;
    let d99 = image.add_data(DataValue::Int(99)) as i32;

    // B::sum() { return this.a + this.b; }  a = slot 0, b = slot 1
    let sum_code = vec![
        op(OpCode::CopyDR), 0, 0, 1,
        op(OpCode::AddlDR), 0, 1, 1,
        op(OpCode::Ret),
    ];
    let mut sum = FuncDef::new(0, "int B::sum()", 0, sum_code);
    sum.is_method = true;

    // D inherits sum; D's layout is [c, a, b] so the base members sit at
    // offset 1
    let mut d_sum = FuncDef::new(1, "int D::sum()", 0, Vec::new());
    d_sum.is_method = true;
    d_sum.link_class = b;
    d_sum.link_rel_idx = 0;
    d_sum.var_offset = 1;

    // main() { D x; x.c = 99; x.a = 3; x.b = 4; return x.sum(); }
    let main_code = vec![
        op(OpCode::Alloc), d, 3,
        op(OpCode::CopyhD), d99, 3, 0,
        op(OpCode::CopyhD), d3, 3, 1,
        op(OpCode::CopyhD), d4, 3, 2,
        op(OpCode::MoveRR), 3, 0,
        op(OpCode::Callm), d, 0,
        op(OpCode::Ret),
    ];
    let main = FuncDef::new(2, "int main()", 0, main_code);

    let mut module = Module {
        classes: vec![
            ClassDef {
                type_id: b,
                var_count: 2,
                funcs: vec![sum],
            },
            ClassDef {
                type_id: d,
                var_count: 3,
                funcs: vec![d_sum],
            },
            ClassDef {
                type_id: globals,
                var_count: 0,
                funcs: vec![main],
            },
        ],
    };
    linker::link_main(&mut module, &mut image).unwrap();
    linker::post_link(&module, &mut image).unwrap();

    // the relocated body addresses a and b one slot further in
    let relocated = &module.classes[1].funcs[0].code;
    assert_eq!(
        relocated,
        &vec![
            op(OpCode::CopyDR), 0, 1, 1,
            op(OpCode::AddlDR), 0, 2, 1,
            op(OpCode::Ret),
        ]
    );

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(2).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(7));
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_missing_body_stub_returns_null() {
    let mut image = ProgramImage::new();
    let globals = add_class_type(&mut image, "Globals", 0);
    reserve_functions(&mut image, 1);
    image.functions[0].type_id = globals;

    // a non-strict function without a body auto-completes to return null
    let empty = FuncDef::new(0, "void nothing()", 0, Vec::new());
    let mut module = Module {
        classes: vec![ClassDef {
            type_id: globals,
            var_count: 0,
            funcs: vec![empty],
        }],
    };
    linker::link_main(&mut module, &mut image).unwrap();

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(0).unwrap();
    assert_eq!(vm.type_of(vm.return_register()), 0);
    vm.term_vm().unwrap();
}

#[test]
fn test_strict_missing_body_is_an_error() {
    let mut image = ProgramImage::new();
    let globals = add_class_type(&mut image, "Globals", 0);
    reserve_functions(&mut image, 1);

    let mut empty = FuncDef::new(0, "void required()", 0, Vec::new());
    empty.strict = true;
    let mut module = Module {
        classes: vec![ClassDef {
            type_id: globals,
            var_count: 0,
            funcs: vec![empty],
        }],
    };
    assert!(linker::link_main(&mut module, &mut image).is_err());
}

#[test]
fn test_register_saving_inserted_and_stack_offsets_fixed() {
    let mut image = ProgramImage::new();
    let globals = add_class_type(&mut image, "Globals", 0);
    reserve_functions(&mut image, 1);
    image.functions[0].type_id = globals;
    let d2 = image.add_data(DataValue::Int(2)) as i32;

    // f(x) { return x + 2; } — argument read through (sp+0), r3 modified
    let code = vec![
        op(OpCode::CopySR), 0, 3,
        op(OpCode::CopyhR), d2, 1,
        op(OpCode::AddlRR), 3, 1,
        op(OpCode::Ret),
    ];
    let f = FuncDef::new(0, "int f(int)", 1, code);
    let mut module = Module {
        classes: vec![ClassDef {
            type_id: globals,
            var_count: 0,
            funcs: vec![f],
        }],
    };
    linker::link_main(&mut module, &mut image).unwrap();

    // r3 is saved, and the argument access compensates for the push
    let linked = &module.classes[0].funcs[0].code;
    assert_eq!(linked[0], op(OpCode::PushR));
    assert_eq!(linked[1], 3);
    assert_eq!(&linked[2..5], &[op(OpCode::CopySR), 1, 3]);
    let ret_at = linked.len() - 1;
    assert_eq!(linked[ret_at], op(OpCode::Ret));
    assert_eq!(&linked[ret_at - 2..ret_at], &[op(OpCode::PopR), 3]);

    // drive it: push the argument, call, pop
    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    let arg = vm.new_int_handle(40);
    vm.push_arg(arg).unwrap();
    vm.call_func(0).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(42));
    vm.pop_arg().unwrap();
    vm.release_handle(arg);
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_cofunc_stub_yields_null_forever() {
    let mut image = ProgramImage::new();
    let globals = add_class_type(&mut image, "Globals", 0);
    let thread_name = image.cstr.add_string("Task");
    image.types.push(TypeInfo {
        family: TypeFamily::Thread,
        name_offset: thread_name,
        instance_size: 0,
        base: 0,
        vtable_offset: -1,
        native: false,
        methods: MethodInfo::default(),
    });
    let task = (image.types.len() - 1) as i32;
    reserve_functions(&mut image, 2);
    image.functions[0].type_id = task;
    image.functions[1].type_id = globals;

    let mut cofunc = FuncDef::new(0, "cofunc task()", 0, Vec::new());
    cofunc.is_cofunc = true;

    let main_code = vec![
        op(OpCode::Newctx), task, 0, 0, 3,
        op(OpCode::ResumeR), 3,
        op(OpCode::ResumeR), 3,
        op(OpCode::Ret),
    ];
    let main = FuncDef::new(1, "int main()", 0, main_code);

    let mut module = Module {
        classes: vec![
            ClassDef {
                type_id: task,
                var_count: 0,
                funcs: vec![cofunc],
            },
            ClassDef {
                type_id: globals,
                var_count: 0,
                funcs: vec![main],
            },
        ],
    };
    linker::link_main(&mut module, &mut image).unwrap();

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(1).unwrap();
    // every resume of the stub yields null
    assert_eq!(vm.type_of(vm.return_register()), 0);
    vm.term_vm().unwrap();
    assert_eq!(vm.leaked_handles(), 0);
}

#[test]
fn test_post_link_rewrites_calls_to_jsr() {
    let mut image = ProgramImage::new();
    let globals = add_class_type(&mut image, "Globals", 0);
    reserve_functions(&mut image, 2);
    image.functions[0].type_id = globals;
    image.functions[1].type_id = globals;
    let d5 = image.add_data(DataValue::Int(5)) as i32;

    let callee = FuncDef::new(0, "int five()", 0, vec![
        op(OpCode::CopyhR), d5, 1,
        op(OpCode::Ret),
    ]);
    let caller = FuncDef::new(1, "int main()", 0, vec![
        op(OpCode::Calls), 0,
        op(OpCode::Ret),
    ]);
    let mut module = Module {
        classes: vec![ClassDef {
            type_id: globals,
            var_count: 0,
            funcs: vec![callee, caller],
        }],
    };
    linker::link_main(&mut module, &mut image).unwrap();
    linker::post_link(&module, &mut image).unwrap();

    // the calls instruction became a jsr to the callee's code address
    let caller_addr = image.functions[1].code_addr as usize;
    assert_eq!(image.code[caller_addr], op(OpCode::Jsr));
    assert_eq!(image.code[caller_addr + 1], image.functions[0].code_addr);

    let mut vm = Vm::new(VmConfig::default(), image);
    vm.init_vm().unwrap();
    vm.call_func(1).unwrap();
    assert_eq!(vm.int_value(vm.return_register()), Some(5));
    vm.term_vm().unwrap();
}

#[test]
fn test_peephole_combine_push_pop() {
    let mut block = CodeBlock::new(vec![
        op(OpCode::Push),
        op(OpCode::Push),
        op(OpCode::Pushm), 2,
        op(OpCode::Nop),
        op(OpCode::Pop),
        op(OpCode::Pop),
        op(OpCode::Ret),
    ]);
    let mut report = OptimizeReport::default();
    optimizer::optimize(&mut block, 1, 0, &mut report).unwrap();
    assert_eq!(
        block.words(),
        &[
            op(OpCode::Pushm), 4,
            op(OpCode::Nop),
            op(OpCode::Popm), 2,
            op(OpCode::Ret),
        ]
    );
}

#[test]
fn test_peephole_move_merge() {
    // move (sp+2), r3 ; move r3, (r4+1)  =>  move (sp+2), (r4+1)
    let mut block = CodeBlock::new(vec![
        op(OpCode::MoveSR), 2, 3,
        op(OpCode::MoveRD), 3, 4, 1,
        op(OpCode::Ret),
    ]);
    let mut report = OptimizeReport::default();
    optimizer::optimize(&mut block, 1, 0, &mut report).unwrap();
    assert_eq!(
        block.words(),
        &[op(OpCode::MoveSD), 2, 4, 1, op(OpCode::Ret)]
    );
}

#[test]
fn test_peephole_degenerate_move_deleted() {
    // move r5, r3 ; move r3, r5  =>  nothing
    let mut block = CodeBlock::new(vec![
        op(OpCode::MoveRR), 5, 3,
        op(OpCode::MoveRR), 3, 5,
        op(OpCode::Ret),
    ]);
    let mut report = OptimizeReport::default();
    optimizer::optimize(&mut block, 1, 0, &mut report).unwrap();
    assert_eq!(block.words(), &[op(OpCode::Ret)]);
}

#[test]
fn test_peephole_math_merge() {
    // move (sp+1), r3 ; addl r3, r4  =>  addl (sp+1), r4
    let mut block = CodeBlock::new(vec![
        op(OpCode::MoveSR), 1, 3,
        op(OpCode::AddlRR), 3, 4,
        op(OpCode::Ret),
    ]);
    let mut report = OptimizeReport::default();
    optimizer::optimize(&mut block, 2, 0, &mut report).unwrap();
    assert_eq!(
        block.words(),
        &[op(OpCode::AddlSR), 1, 4, op(OpCode::Ret)]
    );
}

#[test]
fn test_peephole_temp_reg_copying() {
    // move (sp+0), r3 ; copy r3, r3 ; incl r3
    //   =>  copy (sp+0), r3 ; incl r3
    let mut block = CodeBlock::new(vec![
        op(OpCode::MoveSR), 0, 3,
        op(OpCode::CopyRR), 3, 3,
        op(OpCode::InclR), 3,
        op(OpCode::Ret),
    ]);
    let mut report = OptimizeReport::default();
    optimizer::optimize(&mut block, 2, 0, &mut report).unwrap();
    assert_eq!(
        block.words(),
        &[
            op(OpCode::CopySR), 0, 3,
            op(OpCode::InclR), 3,
            op(OpCode::Ret),
        ]
    );
}

#[test]
fn test_peephole_operation_and_move() {
    // addl (sp+0), r3 ; move r3, (sp+0)  =>  addl r3, (sp+0)
    let mut block = CodeBlock::new(vec![
        op(OpCode::AddlSR), 0, 3,
        op(OpCode::MoveRS), 3, 0,
        op(OpCode::Ret),
    ]);
    let mut report = OptimizeReport::default();
    optimizer::optimize(&mut block, 2, 0, &mut report).unwrap();
    assert_eq!(
        block.words(),
        &[op(OpCode::AddlRS), 3, 0, op(OpCode::Ret)]
    );
}

#[test]
fn test_peephole_compare_merge() {
    // move (sp+0), r3 ; move (sp+1), r4 ; csgel r4, r3, r3
    //   =>  move (sp+0), r3 ; csgel (sp+1), r3, r3
    let mut block = CodeBlock::new(vec![
        op(OpCode::MoveSR), 0, 3,
        op(OpCode::MoveSR), 1, 4,
        op(OpCode::CsgelRR), 4, 3, 3,
        op(OpCode::Ret),
    ]);
    let mut report = OptimizeReport::default();
    optimizer::optimize(&mut block, 2, 0, &mut report).unwrap();
    assert_eq!(
        block.words(),
        &[
            op(OpCode::MoveSR), 0, 3,
            op(OpCode::CsgelSR), 1, 3, 3,
            op(OpCode::Ret),
        ]
    );
}

#[test]
fn test_peephole_preserves_behavior_under_execution() {
    // the same function body, linked once at opt level 0 and once at 3,
    // must produce the same result
    fn build(opt_level: u8) -> (ProgramImage, Module) {
        let mut image = ProgramImage::new();
        let globals = add_class_type(&mut image, "Globals", 0);
        reserve_functions(&mut image, 1);
        image.functions[0].type_id = globals;
        let d6 = image.add_data(DataValue::Int(6)) as i32;
        let d7 = image.add_data(DataValue::Int(7)) as i32;
        let code = vec![
            op(OpCode::CopyhR), d6, 3,
            op(OpCode::MoveRR), 3, 4,
            op(OpCode::CopyRR), 4, 4,
            op(OpCode::MovehR), d7, 5,
            op(OpCode::MullRR), 5, 4,
            op(OpCode::MoveRR), 4, 1,
            op(OpCode::Ret),
        ];
        let mut f = FuncDef::new(0, "int f()", 0, code);
        f.opt_level = opt_level;
        let module = Module {
            classes: vec![ClassDef {
                type_id: globals,
                var_count: 0,
                funcs: vec![f],
            }],
        };
        (image, module)
    }

    let mut results = Vec::new();
    for level in [0u8, 3u8] {
        let (mut image, mut module) = build(level);
        linker::link_main(&mut module, &mut image).unwrap();
        let mut vm = Vm::new(VmConfig::default(), image);
        vm.init_vm().unwrap();
        vm.call_func(0).unwrap();
        results.push(vm.int_value(vm.return_register()));
        vm.term_vm().unwrap();
    }
    assert_eq!(results[0], Some(42));
    assert_eq!(results[0], results[1]);
}
