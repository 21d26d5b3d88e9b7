// moonletc: compile a chunk and print a luac-style listing of the
// prototype tree. No execution - this is the compiler half only.

use mimalloc::MiMalloc;
use moonlet::{Instruction, LuaVM, OpCode, OpMode, Proto, ProtoId};
use std::env;
use std::fs;
use std::process;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    let args: Vec<String> = env::args().collect();
    let (source, filename) = match args.get(1) {
        Some(name) if name != "-" => match fs::read_to_string(name) {
            Ok(content) => (content, name.clone()),
            Err(e) => {
                eprintln!("moonletc: cannot open '{name}': {e}");
                process::exit(1);
            }
        },
        _ => {
            eprintln!("usage: moonletc <script.lua>");
            process::exit(1);
        }
    };

    // Chunk names follow the '@file' convention
    let chunk_name = format!("@{filename}");
    let vm = match moonlet::compile_chunk(&source, &chunk_name) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("moonletc: {e}");
            process::exit(1);
        }
    };
    let th = vm.main_thread();
    let closure = vm.stack_value(th, vm.stack_top(th) - 1);
    let pid = vm.closure_proto(&closure).expect("chunk closure");
    dump_proto(&vm, pid, true);
}

fn dump_proto(vm: &LuaVM, pid: ProtoId, is_main: bool) {
    let f = vm.proto(pid);
    let what = if is_main { "main" } else { "function" };
    let vararg = if f.is_vararg { "+" } else { "" };
    println!(
        "\n{} <{}:{},{}> ({} instructions)",
        what,
        f.source,
        f.linedefined,
        f.lastlinedefined,
        f.code.len()
    );
    println!(
        "{}{} params, {} slots, {} upvalues, {} locals, {} constants, {} functions",
        f.numparams,
        vararg,
        f.maxstacksize,
        f.upvalues.len(),
        f.locvars.len(),
        f.k.len(),
        f.p.len()
    );
    for (pc, &i) in f.code.iter().enumerate() {
        let line = f.lineinfo.get(pc).copied().unwrap_or(0);
        println!("\t{}\t[{}]\t{}", pc + 1, line, format_instruction(vm, f, pc, i));
    }
    println!("constants ({}):", f.k.len());
    for (idx, k) in f.k.iter().enumerate() {
        println!("\t{}\t{}", idx + 1, format_constant(vm, k));
    }
    println!("locals ({}):", f.locvars.len());
    for (idx, lv) in f.locvars.iter().enumerate() {
        println!(
            "\t{}\t{}\t{}\t{}",
            idx,
            lv.varname,
            lv.startpc + 1,
            lv.endpc + 1
        );
    }
    println!("upvalues ({}):", f.upvalues.len());
    for (idx, uv) in f.upvalues.iter().enumerate() {
        println!(
            "\t{}\t{}\t{}\t{}",
            idx,
            uv.name,
            uv.instack as u8,
            uv.idx
        );
    }
    for &child in &f.p {
        dump_proto(vm, child, false);
    }
}

fn format_instruction(vm: &LuaVM, f: &Proto, pc: usize, i: u32) -> String {
    let op = Instruction::get_op(i);
    let a = Instruction::get_a(i);
    let mut out = format!("{:<12}", op.name());
    match op.mode() {
        OpMode::IABC => {
            out.push_str(&format!("{a}"));
            if op == OpCode::NewTable {
                // decode the floating-byte size hints
                out.push_str(&format!(
                    " {} {}",
                    moonlet::compiler::fb_to_int(Instruction::get_b(i)),
                    moonlet::compiler::fb_to_int(Instruction::get_c(i))
                ));
            } else {
                let props = op.props();
                if props.barg != moonlet::OpArg::N {
                    out.push_str(&format!(" {}", rk_operand(Instruction::get_b(i))));
                }
                if props.carg != moonlet::OpArg::N {
                    out.push_str(&format!(" {}", rk_operand(Instruction::get_c(i))));
                }
            }
        }
        OpMode::IABx => {
            let bx = Instruction::get_bx(i);
            match op {
                OpCode::LoadK => {
                    out.push_str(&format!("{a} -{}", bx + 1));
                    out.push_str(&format!("\t; {}", format_constant(vm, &f.k[bx as usize])));
                }
                OpCode::Closure => out.push_str(&format!("{a} {bx}")),
                _ => out.push_str(&format!("{a} {bx}")),
            }
        }
        OpMode::IAsBx => {
            let sbx = Instruction::get_sbx(i);
            out.push_str(&format!("{a} {sbx}\t; to {}", pc as i32 + sbx + 2));
        }
        OpMode::IAx => {
            out.push_str(&format!("{}", Instruction::get_ax(i)));
        }
    }
    out
}

fn rk_operand(x: u32) -> String {
    if Instruction::is_k(x) {
        format!("-{}", Instruction::index_k(x) + 1)
    } else {
        format!("{x}")
    }
}

fn format_constant(vm: &LuaVM, k: &moonlet::LuaValue) -> String {
    if let Some(s) = k.as_string_id() {
        let mut out = String::from("\"");
        for &b in vm.string_bytes(s) {
            match b {
                b'"' => out.push_str("\\\""),
                b'\\' => out.push_str("\\\\"),
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                0x20..=0x7e => out.push(b as char),
                _ => out.push_str(&format!("\\{b}")),
            }
        }
        out.push('"');
        out
    } else {
        vm.display_value(k)
    }
}
