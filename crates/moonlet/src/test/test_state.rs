// State plumbing: stack discipline, host calls, protected calls, open
// upvalues, frame recycling
use crate::gc::ThreadId;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, SafeOption};

fn c_add(vm: &mut LuaVM, th: ThreadId) -> LuaResult<i32> {
    let a = vm.c_arg(th, 0).as_integer().unwrap_or(0);
    let b = vm.c_arg(th, 1).as_integer().unwrap_or(0);
    vm.push(th, LuaValue::integer(a + b))?;
    Ok(1)
}

fn c_fail(vm: &mut LuaVM, th: ThreadId) -> LuaResult<i32> {
    vm.throw_runtime(th, "boom")?;
    Ok(0)
}

fn c_three(vm: &mut LuaVM, th: ThreadId) -> LuaResult<i32> {
    vm.push(th, LuaValue::integer(1))?;
    vm.push(th, LuaValue::integer(2))?;
    vm.push(th, LuaValue::integer(3))?;
    Ok(3)
}

fn c_recurse(vm: &mut LuaVM, th: ThreadId) -> LuaResult<i32> {
    vm.push(th, LuaValue::cfunction(c_recurse))?;
    vm.call(th, 0, 0)?;
    Ok(0)
}

#[test]
fn test_push_pop_roundtrip() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    let base = vm.stack_top(th);
    vm.push(th, LuaValue::integer(11)).unwrap();
    vm.push(th, LuaValue::boolean(true)).unwrap();
    assert_eq!(vm.stack_top(th), base + 2);
    assert_eq!(vm.pop(th).as_boolean(), Some(true));
    assert_eq!(vm.pop(th).as_integer(), Some(11));
    assert_eq!(vm.stack_top(th), base);
}

#[test]
fn test_host_function_call() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    vm.push(th, LuaValue::cfunction(c_add)).unwrap();
    vm.push(th, LuaValue::integer(10)).unwrap();
    vm.push(th, LuaValue::integer(20)).unwrap();
    vm.call(th, 2, 1).unwrap();
    assert_eq!(vm.pop(th).as_integer(), Some(30));
}

#[test]
fn test_result_count_adjustment() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    let base = vm.stack_top(th);
    // ask for more results than produced: padded with nil
    vm.push(th, LuaValue::cfunction(c_three)).unwrap();
    vm.call(th, 0, 5).unwrap();
    assert_eq!(vm.stack_top(th), base + 5);
    assert_eq!(vm.stack_value(th, base).as_integer(), Some(1));
    assert_eq!(vm.stack_value(th, base + 2).as_integer(), Some(3));
    assert!(vm.stack_value(th, base + 4).is_nil());
    // reset, then ask for fewer
    for _ in 0..5 {
        vm.pop(th);
    }
    vm.push(th, LuaValue::cfunction(c_three)).unwrap();
    vm.call(th, 0, 1).unwrap();
    assert_eq!(vm.stack_top(th), base + 1);
    assert_eq!(vm.pop(th).as_integer(), Some(1));
}

#[test]
fn test_pcall_catches_runtime_errors() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    let base = vm.stack_top(th);
    vm.push(th, LuaValue::cfunction(c_fail)).unwrap();
    let err = vm.pcall(th, 0, 0).unwrap_err();
    assert_eq!(err, LuaError::Runtime);
    // the error value replaced the function slot
    assert_eq!(vm.stack_top(th), base + 1);
    let ev = vm.pop(th);
    assert_eq!(vm.string_bytes(ev.as_string_id().unwrap()), b"boom");
}

#[test]
fn test_pcall_success_passthrough() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    vm.push(th, LuaValue::cfunction(c_add)).unwrap();
    vm.push(th, LuaValue::integer(1)).unwrap();
    vm.push(th, LuaValue::integer(2)).unwrap();
    vm.pcall(th, 2, 1).unwrap();
    assert_eq!(vm.pop(th).as_integer(), Some(3));
}

#[test]
fn test_calling_a_non_function_fails() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    vm.push(th, LuaValue::integer(7)).unwrap();
    let err = vm.pcall(th, 0, 0).unwrap_err();
    assert_eq!(err, LuaError::Runtime);
    let msg = vm.into_full_error(err).message;
    assert!(msg.contains("attempt to call a number value"), "{msg}");
}

#[test]
fn test_lua_closure_needs_an_executor() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.load("return 1", "=chunk").unwrap(); // closure now on the stack
    let th = vm.main_thread();
    let err = vm.pcall(th, 0, 0).unwrap_err();
    let msg = vm.into_full_error(err).message;
    assert!(msg.contains("no bytecode executor"), "{msg}");
}

#[test]
fn test_executor_seam_receives_prepared_frames() {
    fn trivial_executor(vm: &mut LuaVM, th: ThreadId) -> LuaResult<()> {
        // frame is set up: report zero results
        let first = vm.stack_top(th);
        vm.poscall(th, first, 0);
        Ok(())
    }
    let mut vm = LuaVM::new(SafeOption::default());
    vm.set_executor(trivial_executor);
    vm.load("return 1", "=chunk").unwrap();
    let th = vm.main_thread();
    vm.pcall(th, 0, 0).unwrap();
}

#[test]
fn test_host_call_depth_is_bounded() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    vm.push(th, LuaValue::cfunction(c_recurse)).unwrap();
    let err = vm.pcall(th, 0, 0).unwrap_err();
    assert_eq!(err, LuaError::Runtime);
    let msg = vm.into_full_error(err).message;
    assert!(msg.contains("stack overflow"), "{msg}");
}

#[test]
fn test_one_open_upvalue_per_slot() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop(); // raw upvalues are unanchored until a closure holds them
    let th = vm.main_thread();
    vm.push(th, LuaValue::integer(100)).unwrap();
    vm.push(th, LuaValue::integer(200)).unwrap();

    let u0a = vm.find_upvalue(th, 0);
    let u0b = vm.find_upvalue(th, 0);
    let u1 = vm.find_upvalue(th, 1);
    assert_eq!(u0a, u0b); // at most one open upvalue per slot
    assert_ne!(u0a, u1);
    assert_eq!(vm.get_upvalue(u0a).as_integer(), Some(100));

    // writes through an open upvalue hit the stack slot
    vm.set_upvalue(u1, LuaValue::integer(201));
    assert_eq!(vm.stack_value(th, 1).as_integer(), Some(201));
}

#[test]
fn test_close_upvalues_transitions_to_owned() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let th = vm.main_thread();
    vm.push(th, LuaValue::integer(1)).unwrap();
    vm.push(th, LuaValue::integer(2)).unwrap();
    vm.push(th, LuaValue::integer(3)).unwrap();
    let u0 = vm.find_upvalue(th, 0);
    let u2 = vm.find_upvalue(th, 2);

    vm.close_upvalues(th, 1); // close slots >= 1
    assert!(!vm.pool.upvalues.get(u2.0).is_open());
    assert!(vm.pool.upvalues.get(u0.0).is_open()); // below the level
    assert_eq!(vm.get_upvalue(u2).as_integer(), Some(3));

    // the closed upvalue now owns its value: stack changes are invisible
    {
        let state = &mut vm.pool.threads.get_mut(th.0).state;
        state.stack[2] = LuaValue::integer(99);
    }
    assert_eq!(vm.get_upvalue(u2).as_integer(), Some(3));
    // a fresh capture of slot 2 is a new upvalue
    let u2b = vm.find_upvalue(th, 2);
    assert_ne!(u2, u2b);
}

#[test]
fn test_call_frames_are_recycled() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    for _ in 0..100 {
        vm.push(th, LuaValue::cfunction(c_three)).unwrap();
        vm.call(th, 0, 0).unwrap();
    }
    // sequential calls reuse one frame; the vector never grows past a
    // handful of entries
    assert!(vm.pool.threads.get(th.0).state.call_infos.len() <= 4);
}

#[test]
fn test_stack_grows_on_demand() {
    let mut vm = LuaVM::new(SafeOption::default());
    let th = vm.main_thread();
    vm.check_stack(th, 500).unwrap();
    for i in 0..500 {
        vm.push(th, LuaValue::integer(i)).unwrap();
    }
    assert_eq!(vm.stack_value(th, 499).as_integer(), Some(499));
    for _ in 0..500 {
        vm.pop(th);
    }
}

#[test]
fn test_multiple_states_are_independent() {
    let mut vm1 = LuaVM::new(SafeOption::default());
    let mut vm2 = LuaVM::new(SafeOption::default());
    let t1 = vm1.new_table().unwrap();
    let reg1 = vm1.registry();
    vm1.raw_set_int(reg1, 100, LuaValue::table(t1));
    vm1.raw_set_int(t1, 1, LuaValue::integer(1));
    // collecting one state leaves the other untouched
    vm2.full_gc(false);
    vm1.full_gc(false);
    assert_eq!(vm1.raw_get_int(t1, 1).as_integer(), Some(1));
}
