// Compiler: folding, register/constant shapes, scope and upvalue
// resolution, goto rules, control-flow emission
use crate::gc::ProtoId;
use crate::lua_vm::{Instruction, LuaVM, OpCode, SafeOption};

fn compile_ok(src: &str) -> (LuaVM, ProtoId) {
    let mut vm = LuaVM::new(SafeOption::default());
    let closure = vm.load(src, "=test").expect("chunk should compile");
    let pid = vm.closure_proto(&closure).expect("lua closure");
    (vm, pid)
}

fn compile_err(src: &str) -> String {
    let mut vm = LuaVM::new(SafeOption::default());
    match vm.load(src, "=test") {
        Ok(_) => panic!("expected a syntax error for {src:?}"),
        Err(e) => vm.into_full_error(e).message,
    }
}

fn opcodes(vm: &LuaVM, pid: ProtoId) -> Vec<OpCode> {
    vm.proto(pid).code.iter().map(|&i| Instruction::get_op(i)).collect()
}

#[test]
fn test_constant_folding_shapes_the_chunk() {
    let (vm, pid) = compile_ok("local a = 1 + 2 return a");
    let f = vm.proto(pid);
    // folded to a single integer constant 3
    assert_eq!(f.k.len(), 1);
    assert_eq!(f.k[0].as_integer(), Some(3));
    assert_eq!(
        opcodes(&vm, pid),
        vec![OpCode::LoadK, OpCode::Return, OpCode::Return]
    );
    assert_eq!(Instruction::get_a(f.code[0]), 0);
    assert_eq!(Instruction::get_bx(f.code[0]), 0);
    // RETURN R0, 2 (one value)
    assert_eq!(Instruction::get_a(f.code[1]), 0);
    assert_eq!(Instruction::get_b(f.code[1]), 2);
}

#[test]
fn test_main_chunk_shape() {
    let (vm, pid) = compile_ok("return 1");
    let f = vm.proto(pid);
    assert!(f.is_vararg);
    assert_eq!(f.numparams, 0);
    assert_eq!(f.upvalues.len(), 1);
    assert_eq!(f.upvalues[0].name.as_str(), "_ENV");
    assert!(f.upvalues[0].instack);
    assert_eq!(f.upvalues[0].idx, 0);
    assert!(f.maxstacksize >= 2);
}

#[test]
fn test_folding_respects_arithmetic_rules() {
    // division by zero never folds
    let (vm, pid) = compile_ok("local a = 1 // 0 return a");
    assert!(opcodes(&vm, pid).contains(&OpCode::IDiv));
    // ^ and / always produce floats
    let (vm, pid) = compile_ok("local a = 2 ^ 2 return a");
    let f = vm.proto(pid);
    assert_eq!(f.k[0].as_float(), Some(4.0));
    // integer arithmetic stays integer
    let (vm, pid) = compile_ok("local a = 7 % 3 return a");
    let f = vm.proto(pid);
    assert_eq!(f.k[0].as_integer(), Some(1));
    // mixed operands widen to float
    let (vm, pid) = compile_ok("local a = 1 + 0.5 return a");
    let f = vm.proto(pid);
    assert_eq!(f.k[0].as_float(), Some(1.5));
}

#[test]
fn test_concat_chains_merge_into_one_instruction() {
    let (vm, pid) = compile_ok("return 'a' .. 'b' .. 'c'");
    let ops = opcodes(&vm, pid);
    assert_eq!(ops.iter().filter(|&&op| op == OpCode::Concat).count(), 1);
}

#[test]
fn test_globals_resolve_through_env() {
    let (vm, pid) = compile_ok("print(1)");
    let f = vm.proto(pid);
    assert_eq!(Instruction::get_op(f.code[0]), OpCode::GetTabUp);
    assert_eq!(Instruction::get_b(f.code[0]), 0); // upvalue 0 = _ENV
    let key = Instruction::get_c(f.code[0]);
    assert!(Instruction::is_k(key));
    let ks = f.k[Instruction::index_k(key) as usize];
    assert_eq!(vm.string_bytes(ks.as_string_id().unwrap()), b"print");

    let (vm, pid) = compile_ok("answer = 42");
    assert!(opcodes(&vm, pid).contains(&OpCode::SetTabUp));
}

#[test]
fn test_upvalue_chain_descriptors() {
    let (vm, pid) = compile_ok(
        "local x = 1\n\
         local function outer()\n\
           return function() return x end\n\
         end\n\
         return outer",
    );
    let main = vm.proto(pid);
    let outer = vm.proto(main.p[0]);
    // outer captures main's local directly
    let x_up = outer
        .upvalues
        .iter()
        .find(|u| u.name.as_str() == "x")
        .expect("outer captures x");
    assert!(x_up.instack);
    assert_eq!(x_up.idx, 0);
    // the inner function reaches x through outer's upvalue list
    let inner = vm.proto(outer.p[0]);
    let x_in = inner
        .upvalues
        .iter()
        .find(|u| u.name.as_str() == "x")
        .expect("inner captures x");
    assert!(!x_in.instack);
    assert_eq!(x_in.idx, x_up.idx);
    // a CLOSE is required when outer's frame drops x? x belongs to main:
    // main's outermost block holds it, so no JMP-close inside outer
    assert!(opcodes(&vm, pid).contains(&OpCode::Closure));
}

#[test]
fn test_captured_local_gets_closed_on_block_exit() {
    let (vm, pid) = compile_ok(
        "do\n\
           local x = 1\n\
           f = function() return x end\n\
         end\n\
         return f",
    );
    // leaving the do-block must emit a close (JMP with A > 0)
    let f = vm.proto(pid);
    let has_close = f.code.iter().any(|&i| {
        Instruction::get_op(i) == OpCode::Jmp && Instruction::get_a(i) > 0
    });
    assert!(has_close, "no upvalue-closing jump emitted");
}

#[test]
fn test_goto_rules() {
    // jumping into a local's scope is rejected
    let msg = compile_err("goto L local x = 1 ::L:: x = 2");
    assert!(msg.contains("jumps into the scope of local 'x'"), "{msg}");
    // a label at the end of the block is reachable past dying locals
    compile_ok("do goto L local x = 1 ::L:: end");
    // backward gotos resolve immediately
    compile_ok("::top:: goto top");
    // unresolved goto at chunk end
    let msg = compile_err("goto nowhere");
    assert!(msg.contains("no visible label"), "{msg}");
    // duplicate labels in one block
    let msg = compile_err("::a:: ::a::");
    assert!(msg.contains("already defined"), "{msg}");
}

#[test]
fn test_break_statements() {
    compile_ok("while true do break end");
    compile_ok("for i = 1, 10 do if i > 5 then break end end");
    assert!(compile_err("break").contains("break"));
}

#[test]
fn test_numeric_for_reserves_control_locals() {
    let (vm, pid) = compile_ok("for i = 1, 10 do end");
    let f = vm.proto(pid);
    let names: Vec<&str> = f.locvars.iter().map(|l| l.varname.as_str()).collect();
    assert_eq!(
        names,
        vec!["(for index)", "(for limit)", "(for step)", "i"]
    );
    let ops = opcodes(&vm, pid);
    assert!(ops.contains(&OpCode::ForPrep));
    assert!(ops.contains(&OpCode::ForLoop));
}

#[test]
fn test_generic_for_uses_tforcall() {
    let (vm, pid) = compile_ok("for k, v in next, t do end");
    let f = vm.proto(pid);
    let names: Vec<&str> = f.locvars.iter().map(|l| l.varname.as_str()).collect();
    assert_eq!(
        names,
        vec!["(for generator)", "(for state)", "(for control)", "k", "v"]
    );
    let ops = opcodes(&vm, pid);
    assert!(ops.contains(&OpCode::TForCall));
    assert!(ops.contains(&OpCode::TForLoop));
}

#[test]
fn test_vararg_use_outside_vararg_function() {
    compile_ok("return ..."); // the main chunk is vararg
    let msg = compile_err("local function f() return ... end");
    assert!(msg.contains("cannot use '...'"), "{msg}");
}

#[test]
fn test_multi_assignment_adjustment() {
    // a single call on the right expands to fill three targets
    let (vm, pid) = compile_ok("local a, b, c = f()");
    let f = vm.proto(pid);
    let call = f
        .code
        .iter()
        .find(|&&i| Instruction::get_op(i) == OpCode::Call)
        .expect("call emitted");
    assert_eq!(Instruction::get_c(*call), 4); // 3 results wanted
    // surplus values are dropped
    compile_ok("local a = 1, 2, 3");
    // missing values pad with nil
    let (vm, pid) = compile_ok("local a, b, c");
    let f = vm.proto(pid);
    assert_eq!(Instruction::get_op(f.code[0]), OpCode::LoadNil);
    assert_eq!(Instruction::get_b(f.code[0]), 2); // R0..R2 in one go
}

#[test]
fn test_assignment_conflict_saves_a_copy() {
    let (vm, pid) = compile_ok("local a, i = {}, 1  a[i], i = 10, 20");
    // the indexed store of a[i] must read i from a saved copy
    assert!(opcodes(&vm, pid).contains(&OpCode::Move));
}

#[test]
fn test_tail_call_shape() {
    let (vm, pid) = compile_ok("local function f() end return f()");
    assert!(opcodes(&vm, pid).contains(&OpCode::TailCall));
}

#[test]
fn test_method_definitions_and_calls() {
    let (vm, pid) = compile_ok("local t = {} function t:m(a) return self end");
    let f = vm.proto(pid);
    let m = vm.proto(f.p[0]);
    assert_eq!(m.numparams, 2); // implicit self + a
    assert_eq!(m.locvars[0].varname.as_str(), "self");

    let (vm, pid) = compile_ok("local t = {} t:m()");
    assert!(opcodes(&vm, pid).contains(&OpCode::SelfOp));
}

#[test]
fn test_constructor_sizing_hints() {
    let (vm, pid) = compile_ok("local t = {10, 20, 30, x = 1}");
    let f = vm.proto(pid);
    let newtable = f.code[0];
    assert_eq!(Instruction::get_op(newtable), OpCode::NewTable);
    assert_eq!(Instruction::get_b(newtable), 3); // 3 array items
    assert_eq!(Instruction::get_c(newtable), 1); // 1 hash item
    let ops = opcodes(&vm, pid);
    assert!(ops.contains(&OpCode::SetList));
    assert!(ops.contains(&OpCode::SetTable));
}

#[test]
fn test_while_loop_jumps_backward() {
    let (vm, pid) = compile_ok("local i = 0 while i < 10 do i = i + 1 end");
    let f = vm.proto(pid);
    assert!(opcodes(&vm, pid).contains(&OpCode::Lt));
    let has_back_jump = f.code.iter().any(|&i| {
        Instruction::get_op(i) == OpCode::Jmp && Instruction::get_sbx(i) < -1
    });
    assert!(has_back_jump);
}

#[test]
fn test_repeat_condition_sees_body_locals() {
    compile_ok("repeat local done = true until done");
}

#[test]
fn test_and_or_produce_test_instructions() {
    let (vm, pid) = compile_ok("local a, b = 1, 2 local c = a and b or 3 return c");
    let ops = opcodes(&vm, pid);
    assert!(ops.iter().any(|&op| op == OpCode::Test || op == OpCode::TestSet));
}

#[test]
fn test_error_messages_carry_location() {
    let msg = compile_err("local = 5");
    assert!(msg.starts_with("test:1:"), "{msg}");
    assert!(msg.contains("<name> expected"), "{msg}");

    let msg = compile_err("x = 1 +\n+ 2");
    assert!(msg.contains("test:2:"), "{msg}");

    let msg = compile_err("if true then");
    assert!(msg.contains("'end' expected"), "{msg}");
}

#[test]
fn test_deep_nesting_hits_the_syntax_limit() {
    let mut src = String::from("return ");
    for _ in 0..300 {
        src.push('(');
    }
    src.push('1');
    for _ in 0..300 {
        src.push(')');
    }
    let msg = compile_err(&src);
    assert!(msg.contains("too many syntax levels"), "{msg}");
}

#[test]
fn test_line_info_tracks_statements() {
    let (vm, pid) = compile_ok("local a = 1\nlocal b = 2\nreturn a");
    let f = vm.proto(pid);
    assert_eq!(f.lineinfo.len(), f.code.len());
    assert_eq!(f.lineinfo[0], 1);
    assert_eq!(f.lineinfo[1], 2);
}

#[test]
fn test_local_name_lookup_by_pc() {
    let (vm, pid) = compile_ok("local alpha = 1 local beta = 2 return alpha + beta");
    let f = vm.proto(pid);
    // both locals are live at the RETURN
    let ret_pc = (f.code.len() - 2) as u32;
    assert_eq!(f.local_name(0, ret_pc), Some("alpha"));
    assert_eq!(f.local_name(1, ret_pc), Some("beta"));
}
