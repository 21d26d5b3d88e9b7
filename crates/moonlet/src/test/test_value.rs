// Tagged value basics: tags, truthiness, raw equality, conversions
use crate::lua_value::{float_to_integer, LuaValue};
use crate::lua_vm::{LuaVM, SafeOption};

#[test]
fn test_tags_and_predicates() {
    assert!(LuaValue::nil().is_nil());
    assert!(LuaValue::boolean(true).is_boolean());
    assert!(LuaValue::integer(7).is_integer());
    assert!(LuaValue::integer(7).is_number());
    assert!(LuaValue::float(0.5).is_float());
    assert!(LuaValue::float(0.5).is_number());
    assert!(!LuaValue::integer(7).is_float());
    assert!(!LuaValue::nil().is_collectable());
}

#[test]
fn test_truthiness() {
    // only nil and false are falsy
    assert!(!LuaValue::nil().truthy());
    assert!(!LuaValue::boolean(false).truthy());
    assert!(LuaValue::boolean(true).truthy());
    assert!(LuaValue::integer(0).truthy());
    assert!(LuaValue::float(0.0).truthy());
}

#[test]
fn test_raw_equality_numbers() {
    let a = LuaValue::integer(3);
    let b = LuaValue::float(3.0);
    assert!(a.raw_equal_nostr(&b)); // 3 == 3.0 mathematically
    assert!(!a.raw_equal_nostr(&LuaValue::float(3.5)));
    let nan = LuaValue::float(f64::NAN);
    assert!(!nan.raw_equal_nostr(&nan));
}

#[test]
fn test_float_to_integer() {
    assert_eq!(float_to_integer(3.0), Some(3));
    assert_eq!(float_to_integer(-0.0), Some(0));
    assert_eq!(float_to_integer(3.5), None);
    assert_eq!(float_to_integer(f64::NAN), None);
    assert_eq!(float_to_integer(f64::INFINITY), None);
    assert_eq!(float_to_integer(2f64.powi(62)), Some(1 << 62));
    assert_eq!(float_to_integer(2f64.powi(63)), None); // just out of range
}

#[test]
fn test_display_values() {
    let vm = LuaVM::new(SafeOption::default());
    assert_eq!(vm.display_value(&LuaValue::nil()), "nil");
    assert_eq!(vm.display_value(&LuaValue::boolean(true)), "true");
    assert_eq!(vm.display_value(&LuaValue::integer(-42)), "-42");
    assert_eq!(vm.display_value(&LuaValue::float(3.0)), "3.0");
    assert_eq!(vm.display_value(&LuaValue::float(0.5)), "0.5");
}

#[test]
fn test_string_values_carry_variant() {
    let mut vm = LuaVM::new(SafeOption::default());
    let short = vm.new_lua_string(b"short").unwrap();
    let long = vm.new_lua_string(&[b'x'; 100]).unwrap();
    assert!(vm.string_value(short).is_short_string());
    assert!(vm.string_value(long).is_long_string());
    assert!(vm.string_value(short).is_string());
    assert!(vm.string_value(long).is_string());
}
