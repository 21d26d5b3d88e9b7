// Table engine: hybrid layout, rehash policy, boundary length, traversal
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, SafeOption};

#[test]
fn test_get_set_basic_types() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    let ks = vm.new_string("key").unwrap();

    vm.raw_set_int(t, 1, LuaValue::integer(10));
    vm.raw_set(t, &ks, LuaValue::integer(20)).unwrap();
    vm.raw_set(t, &LuaValue::boolean(true), LuaValue::integer(30))
        .unwrap();
    vm.raw_set(t, &LuaValue::float(2.5), LuaValue::integer(40))
        .unwrap();

    assert_eq!(vm.raw_get_int(t, 1).as_integer(), Some(10));
    assert_eq!(vm.raw_get(t, &ks).as_integer(), Some(20));
    assert_eq!(
        vm.raw_get(t, &LuaValue::boolean(true)).as_integer(),
        Some(30)
    );
    assert_eq!(
        vm.raw_get(t, &LuaValue::float(2.5)).as_integer(),
        Some(40)
    );
    assert!(vm.raw_get_int(t, 99).is_nil());
}

#[test]
fn test_float_keys_normalize_to_integers() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    vm.raw_set(t, &LuaValue::float(4.0), LuaValue::integer(44))
        .unwrap();
    // reads through both spellings hit the same slot
    assert_eq!(vm.raw_get_int(t, 4).as_integer(), Some(44));
    assert_eq!(
        vm.raw_get(t, &LuaValue::float(4.0)).as_integer(),
        Some(44)
    );
}

#[test]
fn test_nil_and_nan_keys_rejected() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    assert!(vm.raw_set(t, &LuaValue::nil(), LuaValue::integer(1)).is_err());
    assert!(
        vm.raw_set(t, &LuaValue::float(f64::NAN), LuaValue::integer(1))
            .is_err()
    );
    // NaN lookups are fine, they just miss
    assert!(vm.raw_get(t, &LuaValue::float(f64::NAN)).is_nil());
}

#[test]
fn test_integer_stress_converges_to_dense_array() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    for i in 1..=64 {
        vm.raw_set_int(t, i, LuaValue::integer(i * 100));
    }
    let data = &vm.pool.tables.get(t.0).data;
    // pure integer keys 1..n must live in the array part at >= 50% density
    assert!(data.array_size() >= 64);
    assert_eq!(data.size_node(), 0);
    for i in 1..=64 {
        assert_eq!(vm.raw_get_int(t, i).as_integer(), Some(i * 100));
    }
}

#[test]
fn test_constructor_sizing_scenario() {
    // {10,20,30} then t[4]=40: array grows to hold 4, hash stays empty
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table_sized(3, 0).unwrap();
    for i in 1..=3 {
        vm.raw_set_int(t, i, LuaValue::integer(i * 10));
    }
    vm.raw_set_int(t, 4, LuaValue::integer(40));
    assert_eq!(vm.raw_len(t), 4);
    let data = &vm.pool.tables.get(t.0).data;
    assert!(data.array_size() >= 4);
    assert_eq!(data.size_node(), 0);
}

#[test]
fn test_length_boundary_with_trailing_nils() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table_sized(8, 0).unwrap();
    vm.raw_set_int(t, 1, LuaValue::integer(1));
    vm.raw_set_int(t, 2, LuaValue::integer(2));
    // slots 3..8 stay nil: binary search must find the boundary at 2
    assert_eq!(vm.raw_len(t), 2);
}

#[test]
fn test_length_through_hash_part() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    for i in 1..=5 {
        vm.raw_set_int(t, i, LuaValue::boolean(true));
    }
    let n = vm.raw_len(t);
    // boundary semantics: t[n] ~= nil and t[n+1] == nil
    assert!(!vm.raw_get_int(t, n).is_nil());
    assert!(vm.raw_get_int(t, n + 1).is_nil());
    assert_eq!(n, 5);
}

#[test]
fn test_overwrite_and_clear() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    let k = vm.new_string("slot").unwrap();
    vm.raw_set(t, &k, LuaValue::integer(1)).unwrap();
    vm.raw_set(t, &k, LuaValue::integer(2)).unwrap();
    assert_eq!(vm.raw_get(t, &k).as_integer(), Some(2));
    vm.raw_set(t, &k, LuaValue::nil()).unwrap();
    assert!(vm.raw_get(t, &k).is_nil());
}

#[test]
fn test_collision_chains_stay_deterministic() {
    // Mixed keys force node-part collisions; every key must keep reading
    // back its own value (Brent relocation preserves chains)
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    let mut keys = Vec::new();
    for i in 0..200 {
        let k = vm.new_string(&format!("k{i}")).unwrap();
        keys.push(k);
        vm.raw_set(t, &k, LuaValue::integer(i)).unwrap();
    }
    for i in 0..100 {
        // negative integers stay in the node part
        vm.raw_set_int(t, -(i as i64) - 1, LuaValue::integer(1000 + i));
    }
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(vm.raw_get(t, k).as_integer(), Some(i as i64));
    }
    for i in 0..100i64 {
        assert_eq!(vm.raw_get_int(t, -i - 1).as_integer(), Some(1000 + i));
    }
}

#[test]
fn test_long_string_keys_compare_by_content() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    let payload = vec![b'q'; 80];
    let k1 = vm.new_lua_string(&payload).unwrap();
    let k2 = vm.new_lua_string(&payload).unwrap();
    assert_ne!(k1, k2); // distinct objects
    let v1 = vm.string_value(k1);
    let v2 = vm.string_value(k2);
    vm.raw_set(t, &v1, LuaValue::integer(7)).unwrap();
    // a different object with equal content finds the same entry
    assert_eq!(vm.raw_get(t, &v2).as_integer(), Some(7));
}

#[test]
fn test_next_visits_every_entry_once() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    for i in 1..=10 {
        vm.raw_set_int(t, i, LuaValue::integer(i));
    }
    for i in 0..10 {
        let k = vm.new_string(&format!("s{i}")).unwrap();
        vm.raw_set(t, &k, LuaValue::integer(100 + i)).unwrap();
    }
    let mut seen = 0;
    let mut key = LuaValue::nil();
    while let Some((k, v)) = vm.raw_next(t, &key).unwrap() {
        assert!(!v.is_nil());
        seen += 1;
        key = k;
    }
    assert_eq!(seen, 20);
}

#[test]
fn test_next_rejects_absent_key() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    vm.raw_set_int(t, 1, LuaValue::integer(1));
    let bogus = vm.new_string("never-inserted").unwrap();
    assert!(vm.raw_next(t, &bogus).is_err());
}

#[test]
fn test_shrinking_rehash_moves_sparse_keys_to_hash() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let t = vm.new_table().unwrap();
    for i in 1..=32 {
        vm.raw_set_int(t, i, LuaValue::integer(i));
    }
    for i in 1..=30 {
        vm.raw_set_int(t, i, LuaValue::nil());
    }
    // Force a rehash with a sparse key set
    vm.raw_set_int(t, 1_000_000, LuaValue::integer(1));
    assert_eq!(vm.raw_get_int(t, 31).as_integer(), Some(31));
    assert_eq!(vm.raw_get_int(t, 32).as_integer(), Some(32));
    assert_eq!(vm.raw_get_int(t, 1_000_000).as_integer(), Some(1));
}
