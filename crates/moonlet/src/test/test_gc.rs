// Collector: reachability, write barriers, weak tables, finalization,
// allocation pressure
use std::cell::Cell;

use crate::gc::{GcState, ThreadId};
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVM, SafeOption};

thread_local! {
    static FINALIZED: Cell<usize> = const { Cell::new(0) };
}

fn count_finalizer(_vm: &mut LuaVM, _th: ThreadId) -> LuaResult<i32> {
    FINALIZED.with(|c| c.set(c.get() + 1));
    Ok(0)
}

/// Registry slot used by tests to anchor objects.
const ANCHOR: i64 = 100;

#[test]
fn test_unreachable_objects_are_collected() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop(); // build the object graph without collector interference
    let baseline = vm.pool.tables.live_count();
    for _ in 0..10 {
        vm.new_table().unwrap(); // unreachable immediately
    }
    assert_eq!(vm.pool.tables.live_count(), baseline + 10);
    vm.full_gc(false);
    assert_eq!(vm.pool.tables.live_count(), baseline);
}

#[test]
fn test_reachable_objects_survive_cycles() {
    let mut vm = LuaVM::new(SafeOption::default());
    let t = vm.new_table().unwrap();
    let reg = vm.registry();
    vm.raw_set_int(reg, ANCHOR, LuaValue::table(t));
    let s = vm.new_string("keepsake").unwrap();
    vm.raw_set_int(t, 1, s);
    for _ in 0..3 {
        vm.full_gc(false);
    }
    let back = vm.raw_get_int(t, 1);
    assert_eq!(
        vm.string_bytes(back.as_string_id().unwrap()),
        b"keepsake"
    );
    // after a full cycle nothing reachable is dead-white
    let white = vm.gc.white();
    assert!(!vm.pool.header(t.into()).is_dead(white));
}

#[test]
fn test_write_barrier_preserves_mid_cycle_stores() {
    let mut vm = LuaVM::new(SafeOption::default());
    let t = vm.new_table().unwrap();
    let reg = vm.registry();
    vm.raw_set_int(reg, ANCHOR, LuaValue::table(t));
    // Drive the collector in single steps while mutating the (possibly
    // black) table; the backward barrier must keep every child alive
    for i in 0..200i64 {
        let child = vm.new_table().unwrap();
        vm.raw_set_int(t, i + 1, LuaValue::table(child));
        vm.single_step();
    }
    vm.full_gc(false);
    for i in 0..200i64 {
        let v = vm.raw_get_int(t, i + 1);
        assert!(v.is_table());
        // touching the table proves the id is still live
        let tid = v.as_table_id().unwrap();
        assert_eq!(vm.raw_len(tid), 0);
    }
}

#[test]
fn test_collection_runs_incrementally() {
    let mut vm = LuaVM::new(SafeOption::default());
    assert_eq!(vm.gc_state(), GcState::Pause);
    vm.single_step(); // pause -> propagate (roots marked)
    assert_eq!(vm.gc_state(), GcState::Propagate);
    // keep stepping; the machine must cycle back to pause
    for _ in 0..10_000 {
        vm.single_step();
        if vm.gc_state() == GcState::Pause {
            break;
        }
    }
    assert_eq!(vm.gc_state(), GcState::Pause);
    assert!(vm.gc.stats.cycles >= 1);
}

#[test]
fn test_finalizer_runs_once_then_object_is_freed() {
    FINALIZED.with(|c| c.set(0));
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop(); // build the object graph without collector interference
    let baseline = vm.pool.tables.live_count();

    let doomed = vm.new_table().unwrap();
    let mt = vm.new_table().unwrap();
    let gc_key = vm.new_string("__gc").unwrap();
    vm.raw_set(mt, &gc_key, LuaValue::cfunction(count_finalizer))
        .unwrap();
    vm.set_metatable(&LuaValue::table(doomed), Some(mt));

    // First cycle: the table is separated, resurrected, finalized
    vm.full_gc(false);
    assert_eq!(FINALIZED.with(|c| c.get()), 1);
    // Second cycle: still unreachable, now actually freed
    vm.full_gc(false);
    assert_eq!(FINALIZED.with(|c| c.get()), 1); // exactly once
    assert_eq!(vm.pool.tables.live_count(), baseline);
}

#[test]
fn test_finalizers_do_not_run_for_reachable_objects() {
    FINALIZED.with(|c| c.set(0));
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop(); // build the object graph without collector interference
    let kept = vm.new_table().unwrap();
    let reg = vm.registry();
    vm.raw_set_int(reg, ANCHOR, LuaValue::table(kept));
    let mt = vm.new_table().unwrap();
    let gc_key = vm.new_string("__gc").unwrap();
    vm.raw_set(mt, &gc_key, LuaValue::cfunction(count_finalizer))
        .unwrap();
    vm.set_metatable(&LuaValue::table(kept), Some(mt));
    vm.full_gc(false);
    assert_eq!(FINALIZED.with(|c| c.get()), 0);
    // dropping the anchor makes it collectable on the next cycle
    vm.raw_set_int(reg, ANCHOR, LuaValue::nil());
    vm.full_gc(false);
    assert_eq!(FINALIZED.with(|c| c.get()), 1);
}

#[test]
fn test_weak_values_are_cleared() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop(); // build the object graph without collector interference
    let t = vm.new_table().unwrap();
    let reg = vm.registry();
    vm.raw_set_int(reg, ANCHOR, LuaValue::table(t));
    let mt = vm.new_table().unwrap();
    let mode_key = vm.new_string("__mode").unwrap();
    let mode_v = vm.new_string("v").unwrap();
    vm.raw_set(mt, &mode_key, mode_v).unwrap();
    vm.set_metatable(&LuaValue::table(t), Some(mt));

    let garbage = vm.new_table().unwrap();
    vm.raw_set_int(t, 1, LuaValue::table(garbage));
    let kept = vm.new_table().unwrap();
    vm.raw_set_int(reg, ANCHOR + 1, LuaValue::table(kept));
    vm.raw_set_int(t, 2, LuaValue::table(kept));

    vm.full_gc(false);
    assert!(vm.raw_get_int(t, 1).is_nil(), "dead value not cleared");
    assert!(vm.raw_get_int(t, 2).is_table(), "live value wrongly cleared");
}

#[test]
fn test_ephemeron_values_live_through_their_keys() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop(); // build the object graph without collector interference
    let t = vm.new_table().unwrap();
    let reg = vm.registry();
    vm.raw_set_int(reg, ANCHOR, LuaValue::table(t));
    let mt = vm.new_table().unwrap();
    let mode_key = vm.new_string("__mode").unwrap();
    let mode_k = vm.new_string("k").unwrap();
    vm.raw_set(mt, &mode_key, mode_k).unwrap();
    vm.set_metatable(&LuaValue::table(t), Some(mt));

    // k1 is anchored; k2 is reachable only as the value under k1
    let k1 = vm.new_table().unwrap();
    vm.raw_set_int(reg, ANCHOR + 1, LuaValue::table(k1));
    let k2 = vm.new_table().unwrap();
    let v2 = vm.new_table().unwrap();
    vm.raw_set(t, &LuaValue::table(k1), LuaValue::table(k2))
        .unwrap();
    vm.raw_set(t, &LuaValue::table(k2), LuaValue::table(v2))
        .unwrap();
    // dead key, dead entry
    let dead = vm.new_table().unwrap();
    let dv = vm.new_table().unwrap();
    vm.raw_set(t, &LuaValue::table(dead), LuaValue::table(dv))
        .unwrap();
    let dead_val = LuaValue::table(dead);

    vm.full_gc(false);
    // the k1 -> k2 -> v2 chain converges to reachable
    assert!(vm.raw_get(t, &LuaValue::table(k1)).is_table());
    assert!(vm.raw_get(t, &LuaValue::table(k2)).is_table());
    // the entry under the dead key is gone (lookup by the stale value
    // would touch a freed object, so check the table is down to 2 entries)
    let mut seen = 0;
    let mut key = LuaValue::nil();
    while let Some((k, _)) = vm.raw_next(t, &key).unwrap() {
        seen += 1;
        key = k;
    }
    assert_eq!(seen, 2);
    let _ = dead_val;
}

#[test]
fn test_memory_limit_triggers_emergency_then_oom() {
    let mut vm = LuaVM::new(SafeOption {
        max_memory_limit: 200_000,
        ..SafeOption::default()
    });
    // Unreachable garbage: emergency collections keep us under the limit
    for _ in 0..5000 {
        vm.new_table().expect("garbage is collectable under pressure");
    }
    // Anchored tables eventually exhaust the budget
    let reg = vm.registry();
    let mut failed = false;
    for i in 0..100_000 {
        match vm.new_table() {
            Ok(t) => vm.raw_set_int(reg, ANCHOR + i, LuaValue::table(t)),
            Err(_) => {
                failed = true;
                break;
            }
        }
    }
    assert!(failed, "allocation must fail once live data exceeds the limit");
}

#[test]
fn test_string_cache_survives_collection() {
    let mut vm = LuaVM::new(SafeOption::default());
    // An unanchored literal dies with the cycle; the cache slot must not
    // hand back the dead object afterwards
    let first = vm.new_string("ephemeral-literal").unwrap();
    let first_id = first.as_string_id().unwrap();
    vm.full_gc(false);
    let again = vm.new_string("ephemeral-literal").unwrap();
    assert_eq!(
        vm.string_bytes(again.as_string_id().unwrap()),
        b"ephemeral-literal"
    );
    let _ = first_id; // the old id may be gone; only content matters
}

#[test]
fn test_compile_under_gc_pressure() {
    // Force steps at every allocation: the parser's anchors (closure on
    // the stack, scanner table, constant tables) must keep everything alive
    let mut vm = LuaVM::new(SafeOption::default());
    let src = "local acc = 0\n\
               for i = 1, 100 do\n\
                 acc = acc + i\n\
               end\n\
               local function helper(n) return n * 2 end\n\
               return helper(acc)";
    for _ in 0..10 {
        vm.pool.gc_debt = 4096; // owe the collector work on every check
        let closure = vm.load(src, "=pressure").expect("compiles under pressure");
        let pid = vm.closure_proto(&closure).unwrap();
        assert!(!vm.proto(pid).code.is_empty());
        // drop the chunk again
        let th = vm.main_thread();
        vm.pop(th);
    }
}
