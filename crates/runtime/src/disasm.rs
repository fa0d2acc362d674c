//! Bytecode disassembler.
//!
//! One instruction per line: offset, source line:column (`|` marks a run
//! continuing from the previous instruction), mnemonic, decoded operands
//! and constant values. Used by `--trace`, `orus disasm` and tests.

use orus_core::chunk::Conversion;
use orus_core::{Chunk, Context, OpCode};
use std::fmt::Write as _;

/// Disassemble a whole chunk.
pub fn disassemble(chunk: &Chunk, ctx: &Context, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = instruction_at(chunk, ctx, offset);
        let _ = writeln!(out, "{}", line);
        offset = next;
    }
    out
}

/// Render the instruction at `offset`; returns the text and the offset of
/// the next instruction.
pub fn instruction_at(chunk: &Chunk, ctx: &Context, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    let (line, column) = chunk.position(offset);
    if offset > 0 && chunk.position(offset - 1) == (line, column) {
        text.push_str("     | ");
    } else {
        let _ = write!(text, "{:4}:{:<2} ", line, column);
    }
    let Some(byte) = chunk.read_byte(offset) else {
        text.push_str("<eof>");
        return (text, offset + 1);
    };
    let Ok(op) = OpCode::try_from(byte) else {
        let _ = write!(text, "<bad opcode {:#04x}>", byte);
        return (text, offset + 1);
    };
    let _ = write!(text, "{:<16}", format!("{:?}", op));
    let next = match op {
        OpCode::Constant => {
            let index = chunk.read_byte(offset + 1).unwrap_or(0) as usize;
            let rendered = chunk
                .constant(index)
                .map(|v| ctx.format_value(v))
                .unwrap_or_else(|| "<bad index>".to_string());
            let _ = write!(text, " {} ({})", index, rendered);
            offset + 2
        }
        OpCode::ConstantLong => {
            let hi = chunk.read_byte(offset + 1).unwrap_or(0) as usize;
            let mid = chunk.read_byte(offset + 2).unwrap_or(0) as usize;
            let lo = chunk.read_byte(offset + 3).unwrap_or(0) as usize;
            let index = (hi << 16) | (mid << 8) | lo;
            let rendered = chunk
                .constant(index)
                .map(|v| ctx.format_value(v))
                .unwrap_or_else(|| "<bad index>".to_string());
            let _ = write!(text, " {} ({})", index, rendered);
            offset + 4
        }
        OpCode::GetGlobal | OpCode::SetGlobal => {
            let slot = chunk.read_byte(offset + 1).unwrap_or(0);
            let name = ctx.global_name(slot).unwrap_or("?");
            let _ = write!(text, " {} ({})", slot, name);
            offset + 2
        }
        OpCode::Convert => {
            let tag = chunk.read_byte(offset + 1).unwrap_or(0);
            match Conversion::try_from(tag) {
                Ok(conversion) => {
                    let _ = write!(text, " {:?}", conversion);
                }
                Err(_) => {
                    let _ = write!(text, " <bad tag {}>", tag);
                }
            }
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = chunk.read_u16(offset + 1).unwrap_or(0) as usize;
            let _ = write!(text, " -> {}", offset + 3 + jump);
            offset + 3
        }
        OpCode::Loop => {
            let jump = chunk.read_u16(offset + 1).unwrap_or(0) as usize;
            let _ = write!(text, " -> {}", (offset + 3).saturating_sub(jump));
            offset + 3
        }
        OpCode::SetupExcept => {
            let jump = chunk.read_u16(offset + 1).unwrap_or(0) as usize;
            let slot = chunk.read_byte(offset + 3).unwrap_or(0);
            let _ = write!(text, " handler -> {} slot {}", offset + 3 + jump, slot);
            offset + 4
        }
        OpCode::MakeArray | OpCode::Slice | OpCode::GetField | OpCode::SetField
        | OpCode::Import => {
            let operand = chunk.read_byte(offset + 1).unwrap_or(0);
            let _ = write!(text, " {}", operand);
            offset + 2
        }
        OpCode::MakeStruct => {
            let type_id = chunk.read_byte(offset + 1).unwrap_or(0);
            let count = chunk.read_byte(offset + 2).unwrap_or(0);
            let _ = write!(text, " type {} fields {}", type_id, count);
            offset + 3
        }
        OpCode::MakeEnum => {
            let type_id = chunk.read_byte(offset + 1).unwrap_or(0);
            let variant = chunk.read_byte(offset + 2).unwrap_or(0);
            let count = chunk.read_byte(offset + 3).unwrap_or(0);
            let _ = write!(text, " type {} variant {} fields {}", type_id, variant, count);
            offset + 4
        }
        OpCode::Call => {
            let slot = chunk.read_byte(offset + 1).unwrap_or(0);
            let argc = chunk.read_byte(offset + 2).unwrap_or(0);
            let name = ctx.global_name(slot).unwrap_or("?");
            let _ = write!(text, " {} ({}) argc {}", slot, name, argc);
            offset + 3
        }
        OpCode::CallNative => {
            let index = chunk.read_byte(offset + 1).unwrap_or(0);
            let argc = chunk.read_byte(offset + 2).unwrap_or(0);
            let name = orus_core::natives::NATIVES
                .get(index as usize)
                .map(|n| n.name)
                .unwrap_or("?");
            let _ = write!(text, " {} ({}) argc {}", index, name, argc);
            offset + 3
        }
        _ => offset + 1,
    };
    (text, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orus_core::Value;

    #[test]
    fn test_disassemble_constant_and_jump() {
        let mut chunk = Chunk::new();
        let mut ctx = Context::new();
        let index = chunk.add_constant(Value::I32(42));
        chunk.write_op(OpCode::Constant, 1, 1);
        chunk.write_byte(index as u8, 1, 1);
        chunk.write_op(OpCode::JumpIfFalse, 1, 5);
        chunk.write_u16(2, 1, 5);
        chunk.write_op(OpCode::Pop, 2, 1);
        chunk.write_op(OpCode::Return, 2, 1);
        let _ = &mut ctx;
        let listing = disassemble(&chunk, &ctx, "test");
        assert!(listing.contains("== test =="));
        assert!(listing.contains("Constant"));
        assert!(listing.contains("(42)"));
        // Jump target resolves past the pop.
        assert!(listing.contains("JumpIfFalse"));
        assert!(listing.contains("-> 7"));
    }

    #[test]
    fn test_instruction_width_matches_operands() {
        let mut chunk = Chunk::new();
        let ctx = Context::new();
        chunk.write_op(OpCode::Nil, 1, 1);
        chunk.write_op(OpCode::GetGlobal, 1, 1);
        chunk.write_byte(0, 1, 1);
        let (_, next) = instruction_at(&chunk, &ctx, 0);
        assert_eq!(next, 1);
        let (_, next) = instruction_at(&chunk, &ctx, 1);
        assert_eq!(next, 3);
    }
}
