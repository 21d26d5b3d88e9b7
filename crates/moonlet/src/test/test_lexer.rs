// Lexer: token kinds, literals, escapes, long brackets, line counting
use smol_str::SmolStr;

use crate::compiler::lexer::{Lexer, Token};
use crate::compiler::reader::SourceReader;
use crate::lua_vm::{LuaVM, SafeOption};

fn lex_all(src: &str) -> (LuaVM, Vec<Token>) {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop(); // the anchor table lives outside any root here
    let h = vm.new_table().unwrap();
    let mut lx = Lexer::new(SourceReader::from_bytes(src.as_bytes()), SmolStr::new("=test"));
    let mut out = Vec::new();
    loop {
        lx.next_token(&mut vm, h).unwrap();
        if lx.t == Token::Eos {
            break;
        }
        out.push(lx.t);
    }
    (vm, out)
}

fn lex_error(src: &str) -> bool {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let h = vm.new_table().unwrap();
    let mut lx = Lexer::new(SourceReader::from_bytes(src.as_bytes()), SmolStr::new("=test"));
    loop {
        match lx.next_token(&mut vm, h) {
            Err(_) => return true,
            Ok(()) if lx.t == Token::Eos => return false,
            Ok(()) => {}
        }
    }
}

fn first_string(src: &str) -> Vec<u8> {
    let (vm, toks) = lex_all(src);
    for t in toks {
        if let Token::Str(s) = t {
            return vm.string_bytes(s).to_vec();
        }
    }
    panic!("no string token in {src:?}");
}

#[test]
fn test_operators_and_punctuation() {
    let (_, toks) = lex_all("== ~= <= >= << >> // .. ... :: < > = ( ) ;");
    assert_eq!(
        toks,
        vec![
            Token::Eq,
            Token::Ne,
            Token::Le,
            Token::Ge,
            Token::Shl,
            Token::Shr,
            Token::IDiv,
            Token::Concat,
            Token::Dots,
            Token::DbColon,
            Token::Char(b'<'),
            Token::Char(b'>'),
            Token::Char(b'='),
            Token::Char(b'('),
            Token::Char(b')'),
            Token::Char(b';'),
        ]
    );
}

#[test]
fn test_keywords_versus_names() {
    let (vm, toks) = lex_all("while whilex do ando end");
    assert_eq!(toks[0], Token::While);
    assert!(matches!(toks[1], Token::Name(_)));
    assert_eq!(toks[2], Token::Do);
    assert!(matches!(toks[3], Token::Name(_)));
    assert_eq!(toks[4], Token::End);
    if let Token::Name(s) = toks[1] {
        assert_eq!(vm.string_bytes(s), b"whilex");
    }
}

#[test]
fn test_numerals_reference_forms() {
    // the numeral gallery from the reference manual
    let (_, toks) = lex_all("3 345 0xff 0xBEBADA 3.0 3.1416 314.16e-2 0.31416E1 34e1 0x0.1E 0x3p-1");
    assert_eq!(toks[0], Token::Int(3));
    assert_eq!(toks[1], Token::Int(345));
    assert_eq!(toks[2], Token::Int(0xff));
    assert_eq!(toks[3], Token::Int(0xBEBADA));
    assert_eq!(toks[4], Token::Flt(3.0));
    assert_eq!(toks[5], Token::Flt(3.1416));
    assert_eq!(toks[6], Token::Flt(3.1416));
    assert_eq!(toks[7], Token::Flt(3.1416));
    assert_eq!(toks[8], Token::Flt(340.0));
    assert_eq!(toks[9], Token::Flt(0.1171875));
    assert_eq!(toks[10], Token::Flt(1.5));
}

#[test]
fn test_integer_overflow_falls_back_to_float() {
    let (_, toks) = lex_all("123456789012345678901234567890");
    assert!(matches!(toks[0], Token::Flt(_)));
    // hex integers wrap instead
    let (_, toks) = lex_all("0xFFFFFFFFFFFFFFFF");
    assert_eq!(toks[0], Token::Int(-1));
}

#[test]
fn test_malformed_numbers() {
    assert!(lex_error("3.."));
    assert!(lex_error("0x"));
    assert!(lex_error("1e"));
}

#[test]
fn test_string_escapes() {
    assert_eq!(first_string(r#""a\tb""#), b"a\tb");
    assert_eq!(first_string(r#""\110\x41\u{48}""#), b"nAH");
    assert_eq!(first_string(r#""q\65z""#), b"qAz");
    // \z skips whitespace including newlines
    assert_eq!(first_string("\"a\\z  \n\t  b\""), b"ab");
    // escaped newline becomes a real newline
    assert_eq!(first_string("\"a\\\nb\""), b"a\nb");
}

#[test]
fn test_utf8_escape_limits() {
    assert_eq!(first_string(r#""\u{10FFFF}""#), b"\xF4\x8F\xBF\xBF");
    assert!(lex_error(r#""\u{110000}""#));
    assert!(lex_error(r#""\x4""#)); // exactly two hex digits required
    assert!(lex_error(r#""\256""#)); // decimal escape too large
    assert!(lex_error(r#""\q""#)); // invalid escape
}

#[test]
fn test_unfinished_strings() {
    assert!(lex_error("\"abc"));
    assert!(lex_error("\"abc\ndef\"")); // raw newline ends a short string
    assert!(lex_error("[[never closed"));
}

#[test]
fn test_long_brackets() {
    assert_eq!(first_string("[[hello]]"), b"hello");
    // leading newline is elided
    assert_eq!(first_string("[[\nhello]]"), b"hello");
    // inner brackets of a different level are content
    assert_eq!(first_string("[==[a]=]b]==]"), b"a]=]b");
    assert_eq!(first_string("[=[x[[y]]z]=]"), b"x[[y]]z");
}

#[test]
fn test_comments() {
    let (_, toks) = lex_all("-- line comment\n42 --[[ block\ncomment ]] 43 --[==[ lvl ]==] 44");
    assert_eq!(toks, vec![Token::Int(42), Token::Int(43), Token::Int(44)]);
}

#[test]
fn test_line_counting_mixed_endings() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let h = vm.new_table().unwrap();
    let src = b"a\nb\r\nc\rd";
    let mut lx = Lexer::new(SourceReader::from_bytes(src), SmolStr::new("=test"));
    let mut lines = Vec::new();
    loop {
        lx.next_token(&mut vm, h).unwrap();
        if lx.t == Token::Eos {
            break;
        }
        lines.push(lx.linenumber);
    }
    assert_eq!(lines, vec![1, 2, 3, 4]);
}

#[test]
fn test_lookahead_is_transparent() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc_stop();
    let h = vm.new_table().unwrap();
    let mut lx = Lexer::new(SourceReader::from_bytes(b"a . b"), SmolStr::new("=test"));
    lx.next_token(&mut vm, h).unwrap();
    assert!(matches!(lx.t, Token::Name(_)));
    assert_eq!(lx.lookahead(&mut vm, h).unwrap(), Token::Char(b'.'));
    lx.next_token(&mut vm, h).unwrap();
    assert_eq!(lx.t, Token::Char(b'.'));
    lx.next_token(&mut vm, h).unwrap();
    assert!(matches!(lx.t, Token::Name(_)));
}

#[test]
fn test_token_spellings_relex() {
    // lexing a rendered token yields the same kind and value
    for (src, want) in [
        ("12345", Token::Int(12345)),
        ("0.5", Token::Flt(0.5)),
        ("..", Token::Concat),
        ("==", Token::Eq),
    ] {
        let (_, toks) = lex_all(src);
        assert_eq!(toks, vec![want]);
    }
    let (vm, toks) = lex_all("somename");
    if let Token::Name(s) = toks[0] {
        let spelling = vm.string_str(s).to_owned();
        let (vm2, toks2) = lex_all(&spelling);
        if let Token::Name(s2) = toks2[0] {
            assert_eq!(vm2.string_bytes(s2), spelling.as_bytes());
        } else {
            panic!("name did not relex");
        }
    }
}
