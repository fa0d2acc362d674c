//! The stack-based execution engine.
//!
//! A fetch-decode-dispatch loop over one chunk. State: program counter,
//! operand stack, call-frame stack, exception-frame stack, and the shared
//! [`Context`] (global slots, function table, module registry, heap).
//!
//! Error handling follows two tiers: recoverable runtime errors unwind into
//! the innermost exception frame (truncate the operand and call stacks,
//! bind the message, jump to the handler); fatal errors (stack/frame
//! exhaustion, corrupted bytecode) halt unconditionally.

use crate::disasm;
use crate::error::RuntimeError;
use crate::natives::{call_native, NativeEnv};
use orus_core::chunk::{Conversion, SLICE_HAS_END, SLICE_HAS_START};
use orus_core::types::{EnumId, StructId};
use orus_core::{Chunk, Context, EnumInstance, Obj, OpCode, StructInstance, Value};
use std::io::Write;
use tracing::trace;

const DEFAULT_STACK_SIZE: usize = 4096;
const DEFAULT_FRAME_DEPTH: usize = 256;
const DEFAULT_EXCEPT_DEPTH: usize = 64;

/// VM tuning and identity options.
pub struct VmOptions {
    pub stack_size: usize,
    pub frame_depth: usize,
    pub except_depth: usize,
    /// Per-instruction dispatch tracing via `tracing::trace!`.
    pub trace: bool,
    pub program_name: String,
    pub program_path: String,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            stack_size: DEFAULT_STACK_SIZE,
            frame_depth: DEFAULT_FRAME_DEPTH,
            except_depth: DEFAULT_EXCEPT_DEPTH,
            trace: false,
            program_name: "main".to_string(),
            program_path: "main.orus".to_string(),
        }
    }
}

/// A call activation record.
struct CallFrame {
    return_pc: usize,
    /// Caller's operand-stack height before the arguments were pushed.
    stack_base: usize,
    /// Module initializers discard their return value.
    discard_result: bool,
}

/// An installed `try` handler.
struct ExceptFrame {
    handler_pc: usize,
    stack_depth: usize,
    frame_depth: usize,
    error_slot: u8,
}

enum Flow {
    Continue,
    Halt,
}

pub struct Vm<'a, W: Write> {
    ctx: &'a mut Context,
    chunk: &'a Chunk,
    out: &'a mut W,
    pc: usize,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    excepts: Vec<ExceptFrame>,
    options: VmOptions,
    env: NativeEnv,
}

impl<'a, W: Write> Vm<'a, W> {
    pub fn new(ctx: &'a mut Context, chunk: &'a Chunk, out: &'a mut W, options: VmOptions) -> Self {
        let env = NativeEnv {
            program_name: options.program_name.clone(),
            program_path: options.program_path.clone(),
        };
        Vm {
            ctx,
            chunk,
            out,
            pc: 0,
            stack: Vec::with_capacity(options.stack_size.min(DEFAULT_STACK_SIZE)),
            frames: Vec::new(),
            excepts: Vec::new(),
            options,
            env,
        }
    }

    /// Current operand-stack depth (the stack is balanced at every
    /// statement boundary; tests assert on this).
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Execute from `start` until the final return.
    pub fn run(&mut self, start: usize) -> Result<(), RuntimeError> {
        self.pc = start;
        loop {
            if self.ctx.heap.should_collect() {
                self.collect();
            }
            let op_pc = self.pc;
            if self.options.trace {
                let (text, _) = disasm::instruction_at(self.chunk, self.ctx, op_pc);
                trace!(target: "orus_vm", "{}", text);
            }
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => return Ok(()),
                Err(error) => {
                    let (line, column) = self.chunk.position(op_pc);
                    let error = error.at(line, column);
                    if error.fatal || self.excepts.is_empty() {
                        return Err(error);
                    }
                    self.throw(error);
                }
            }
        }
    }

    /// Unwind into the innermost exception frame.
    fn throw(&mut self, error: RuntimeError) {
        let Some(frame) = self.excepts.pop() else {
            return;
        };
        self.stack.truncate(frame.stack_depth);
        self.frames.truncate(frame.frame_depth);
        let message = Value::Obj(self.ctx.heap.alloc_str(&error.message));
        self.ctx.set_global_value(frame.error_slot, message);
        self.pc = frame.handler_pc;
    }

    fn collect(&mut self) {
        let roots: Vec<Value> = self
            .stack
            .iter()
            .copied()
            .chain(self.chunk.constants().iter().copied())
            .collect();
        self.ctx.collect(roots);
    }

    // ---- fetch helpers ----

    fn corrupted(what: &str) -> RuntimeError {
        RuntimeError::fatal(format!("corrupted bytecode: {}", what))
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let byte = self
            .chunk
            .read_byte(self.pc)
            .ok_or_else(|| Self::corrupted("truncated instruction"))?;
        self.pc += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, RuntimeError> {
        let value = self
            .chunk
            .read_u16(self.pc)
            .ok_or_else(|| Self::corrupted("truncated operand"))?;
        self.pc += 2;
        Ok(value)
    }

    // ---- stack helpers ----

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.options.stack_size {
            return Err(RuntimeError::fatal("operand stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| Self::corrupted("operand stack underflow"))
    }

    fn peek(&self) -> Result<Value, RuntimeError> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| Self::corrupted("operand stack underflow"))
    }

    fn pop_int_index(&mut self) -> Result<i64, RuntimeError> {
        let value = self.pop()?;
        value
            .as_int()
            .ok_or_else(|| RuntimeError::type_error("index must be an integer"))
    }

    // ---- dispatch ----

    fn step(&mut self) -> Result<Flow, RuntimeError> {
        macro_rules! int_binary {
            ($variant:ident, $method:ident) => {{
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::$variant(x), Value::$variant(y)) => {
                        self.push(Value::$variant(x.$method(y)))?
                    }
                    _ => return Err(Self::corrupted("operand type mismatch")),
                }
            }};
        }
        macro_rules! int_divide {
            ($variant:ident, $method:ident) => {{
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::$variant(x), Value::$variant(y)) => {
                        if y == 0 {
                            return Err(RuntimeError::runtime("division by zero"));
                        }
                        self.push(Value::$variant(x.$method(y)))?
                    }
                    _ => return Err(Self::corrupted("operand type mismatch")),
                }
            }};
        }
        macro_rules! float_binary {
            ($op:tt) => {{
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::F64(x), Value::F64(y)) => self.push(Value::F64(x $op y))?,
                    _ => return Err(Self::corrupted("operand type mismatch")),
                }
            }};
        }
        macro_rules! compare {
            ($op:tt) => {{
                let b = self.pop()?;
                let a = self.pop()?;
                let result = match (a, b) {
                    (Value::I32(x), Value::I32(y)) => x $op y,
                    (Value::I64(x), Value::I64(y)) => x $op y,
                    (Value::U32(x), Value::U32(y)) => x $op y,
                    (Value::U64(x), Value::U64(y)) => x $op y,
                    (Value::F64(x), Value::F64(y)) => x $op y,
                    _ => return Err(Self::corrupted("operand type mismatch")),
                };
                self.push(Value::Bool(result))?
            }};
        }

        let op = OpCode::try_from(self.read_byte()?)
            .map_err(|_| Self::corrupted("unknown opcode"))?;
        match op {
            OpCode::Constant => {
                let index = self.read_byte()? as usize;
                let value = self
                    .chunk
                    .constant(index)
                    .ok_or_else(|| Self::corrupted("invalid constant index"))?;
                self.push(value)?;
            }
            OpCode::ConstantLong => {
                let hi = self.read_byte()? as usize;
                let mid = self.read_byte()? as usize;
                let lo = self.read_byte()? as usize;
                let index = (hi << 16) | (mid << 8) | lo;
                let value = self
                    .chunk
                    .constant(index)
                    .ok_or_else(|| Self::corrupted("invalid constant index"))?;
                self.push(value)?;
            }
            OpCode::Nil => self.push(Value::Nil)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let top = self.peek()?;
                self.push(top)?;
            }

            OpCode::GetGlobal => {
                let slot = self.read_byte()?;
                let value = self.ctx.global_value(slot);
                self.push(value)?;
            }
            OpCode::SetGlobal => {
                let slot = self.read_byte()?;
                let value = self.peek()?;
                self.ctx.set_global_value(slot, value);
            }

            OpCode::AddI32 => int_binary!(I32, wrapping_add),
            OpCode::AddI64 => int_binary!(I64, wrapping_add),
            OpCode::AddU32 => int_binary!(U32, wrapping_add),
            OpCode::AddU64 => int_binary!(U64, wrapping_add),
            OpCode::AddF64 => float_binary!(+),
            OpCode::SubI32 => int_binary!(I32, wrapping_sub),
            OpCode::SubI64 => int_binary!(I64, wrapping_sub),
            OpCode::SubU32 => int_binary!(U32, wrapping_sub),
            OpCode::SubU64 => int_binary!(U64, wrapping_sub),
            OpCode::SubF64 => float_binary!(-),
            OpCode::MulI32 => int_binary!(I32, wrapping_mul),
            OpCode::MulI64 => int_binary!(I64, wrapping_mul),
            OpCode::MulU32 => int_binary!(U32, wrapping_mul),
            OpCode::MulU64 => int_binary!(U64, wrapping_mul),
            OpCode::MulF64 => float_binary!(*),
            OpCode::DivI32 => int_divide!(I32, wrapping_div),
            OpCode::DivI64 => int_divide!(I64, wrapping_div),
            OpCode::DivU32 => int_divide!(U32, wrapping_div),
            OpCode::DivU64 => int_divide!(U64, wrapping_div),
            // IEEE 754: float division by zero yields an infinity or NaN.
            OpCode::DivF64 => float_binary!(/),
            OpCode::ModI32 => int_divide!(I32, wrapping_rem),
            OpCode::ModI64 => int_divide!(I64, wrapping_rem),
            OpCode::ModU32 => int_divide!(U32, wrapping_rem),
            OpCode::ModU64 => int_divide!(U64, wrapping_rem),
            OpCode::NegI32 => match self.pop()? {
                Value::I32(v) => self.push(Value::I32(v.wrapping_neg()))?,
                _ => return Err(Self::corrupted("operand type mismatch")),
            },
            OpCode::NegI64 => match self.pop()? {
                Value::I64(v) => self.push(Value::I64(v.wrapping_neg()))?,
                _ => return Err(Self::corrupted("operand type mismatch")),
            },
            OpCode::NegF64 => match self.pop()? {
                Value::F64(v) => self.push(Value::F64(-v))?,
                _ => return Err(Self::corrupted("operand type mismatch")),
            },

            OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor | OpCode::Shl | OpCode::Shr => {
                self.bitwise(op)?
            }
            OpCode::BitNot => {
                let value = self.pop()?;
                let result = match value {
                    Value::I32(v) => Value::I32(!v),
                    Value::I64(v) => Value::I64(!v),
                    Value::U32(v) => Value::U32(!v),
                    Value::U64(v) => Value::U64(!v),
                    _ => return Err(Self::corrupted("operand type mismatch")),
                };
                self.push(result)?;
            }

            OpCode::Convert => {
                let tag = Conversion::try_from(self.read_byte()?)
                    .map_err(|_| Self::corrupted("unknown conversion tag"))?;
                let value = self.pop()?;
                let converted = self.convert(value, tag)?;
                self.push(converted)?;
            }
            OpCode::Concat => {
                let b = self.pop()?;
                let a = self.pop()?;
                let left = self.expect_string(a)?;
                let right = self.expect_string(b)?;
                let mut joined = String::with_capacity(left.len() + right.len());
                joined.push_str(&left);
                joined.push_str(&right);
                let id = self.ctx.heap.alloc_str(&joined);
                self.push(Value::Obj(id))?;
            }

            OpCode::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = self.ctx.values_equal(a, b);
                self.push(Value::Bool(equal))?;
            }
            OpCode::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                let equal = self.ctx.values_equal(a, b);
                self.push(Value::Bool(!equal))?;
            }
            OpCode::Less => compare!(<),
            OpCode::LessEqual => compare!(<=),
            OpCode::Greater => compare!(>),
            OpCode::GreaterEqual => compare!(>=),
            OpCode::Not => match self.pop()? {
                Value::Bool(b) => self.push(Value::Bool(!b))?,
                _ => return Err(Self::corrupted("operand type mismatch")),
            },

            OpCode::Jump => {
                let offset = self.read_u16()? as usize;
                self.pc += offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16()? as usize;
                match self.peek()? {
                    Value::Bool(condition) => {
                        if !condition {
                            self.pc += offset;
                        }
                    }
                    _ => return Err(Self::corrupted("condition is not a bool")),
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16()? as usize;
                self.pc = self
                    .pc
                    .checked_sub(offset)
                    .ok_or_else(|| Self::corrupted("loop target before chunk start"))?;
            }
            OpCode::Return => {
                let value = self.pop()?;
                match self.frames.pop() {
                    Some(frame) => {
                        self.stack.truncate(frame.stack_base);
                        if !frame.discard_result {
                            self.push(value)?;
                        }
                        self.pc = frame.return_pc;
                    }
                    None => return Ok(Flow::Halt),
                }
            }

            OpCode::MakeArray => {
                let count = self.read_byte()? as usize;
                if self.stack.len() < count {
                    return Err(Self::corrupted("operand stack underflow"));
                }
                let values = self.stack.split_off(self.stack.len() - count);
                let id = self.ctx.heap.alloc(Obj::Array(values));
                self.push(Value::Obj(id))?;
            }
            OpCode::ArrayGet => self.array_get()?,
            OpCode::ArraySet => self.array_set()?,
            OpCode::Slice => {
                let flags = self.read_byte()?;
                self.slice(flags)?;
            }

            OpCode::MakeStruct => {
                let type_id = StructId(self.read_byte()? as u16);
                let count = self.read_byte()? as usize;
                if self.stack.len() < count {
                    return Err(Self::corrupted("operand stack underflow"));
                }
                let fields = self.stack.split_off(self.stack.len() - count);
                let id = self
                    .ctx
                    .heap
                    .alloc(Obj::Struct(StructInstance { type_id, fields }));
                self.push(Value::Obj(id))?;
            }
            OpCode::GetField => {
                let index = self.read_byte()? as usize;
                let receiver = self.pop()?;
                let value = match receiver.as_obj().and_then(|id| self.ctx.heap.get(id)) {
                    Some(Obj::Struct(instance)) => instance
                        .fields
                        .get(index)
                        .copied()
                        .ok_or_else(|| Self::corrupted("field index out of range"))?,
                    _ => return Err(Self::corrupted("field access on non-struct")),
                };
                self.push(value)?;
            }
            OpCode::SetField => {
                let index = self.read_byte()? as usize;
                let value = self.pop()?;
                let receiver = self.pop()?;
                match receiver.as_obj().and_then(|id| self.ctx.heap.get_mut(id)) {
                    Some(Obj::Struct(instance)) => {
                        let slot = instance
                            .fields
                            .get_mut(index)
                            .ok_or_else(|| Self::corrupted("field index out of range"))?;
                        *slot = value;
                    }
                    _ => return Err(Self::corrupted("field store on non-struct")),
                }
                self.push(value)?;
            }
            OpCode::MakeEnum => {
                let type_id = EnumId(self.read_byte()? as u16);
                let variant = self.read_byte()?;
                let count = self.read_byte()? as usize;
                if self.stack.len() < count {
                    return Err(Self::corrupted("operand stack underflow"));
                }
                let fields = self.stack.split_off(self.stack.len() - count);
                let id = self.ctx.heap.alloc(Obj::Enum(EnumInstance {
                    type_id,
                    variant,
                    fields,
                }));
                self.push(Value::Obj(id))?;
            }

            OpCode::Call => {
                let slot = self.read_byte()?;
                let argc = self.read_byte()? as usize;
                self.call(slot, argc, false)?;
            }
            OpCode::CallNative => {
                let index = self.read_byte()?;
                let argc = self.read_byte()? as usize;
                if self.stack.len() < argc {
                    return Err(Self::corrupted("operand stack underflow"));
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                let result = call_native(index, &args, self.ctx, &self.env)?;
                self.push(result)?;
            }

            OpCode::SetupExcept => {
                let offset = self.read_u16()? as usize;
                let handler_pc = self.pc + offset;
                let error_slot = self.read_byte()?;
                if self.excepts.len() >= self.options.except_depth {
                    return Err(RuntimeError::fatal("exception frame overflow"));
                }
                self.excepts.push(ExceptFrame {
                    handler_pc,
                    stack_depth: self.stack.len(),
                    frame_depth: self.frames.len(),
                    error_slot,
                });
            }
            OpCode::PopExcept => {
                self.excepts
                    .pop()
                    .ok_or_else(|| Self::corrupted("exception frame underflow"))?;
            }

            OpCode::Print => {
                let value = self.pop()?;
                let text = self.ctx.format_value(value);
                writeln!(self.out, "{}", text)
                    .map_err(|e| RuntimeError::io(format!("write failed: {}", e)))?;
            }
            OpCode::PrintNoNewline => {
                let value = self.pop()?;
                let text = self.ctx.format_value(value);
                write!(self.out, "{}", text)
                    .map_err(|e| RuntimeError::io(format!("write failed: {}", e)))?;
                self.out
                    .flush()
                    .map_err(|e| RuntimeError::io(format!("flush failed: {}", e)))?;
            }
            OpCode::FormatPrint => self.format_print(true)?,
            OpCode::FormatPrintNoNewline => self.format_print(false)?,

            OpCode::Import => {
                let index = self.read_byte()?;
                self.import(index)?;
            }
        }
        Ok(Flow::Continue)
    }

    fn bitwise(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        macro_rules! apply {
            ($x:ident, $y:ident, $make:expr, $shift_bits:expr) => {{
                let result = match op {
                    OpCode::BitAnd => $x & $y,
                    OpCode::BitOr => $x | $y,
                    OpCode::BitXor => $x ^ $y,
                    OpCode::Shl => $x.wrapping_shl(($y as u32) & ($shift_bits - 1)),
                    OpCode::Shr => $x.wrapping_shr(($y as u32) & ($shift_bits - 1)),
                    _ => return Err(Self::corrupted("not a bitwise opcode")),
                };
                $make(result)
            }};
        }
        let result = match (a, b) {
            (Value::I32(x), Value::I32(y)) => apply!(x, y, Value::I32, 32),
            (Value::I64(x), Value::I64(y)) => apply!(x, y, Value::I64, 64),
            (Value::U32(x), Value::U32(y)) => apply!(x, y, Value::U32, 32),
            (Value::U64(x), Value::U64(y)) => apply!(x, y, Value::U64, 64),
            _ => return Err(Self::corrupted("operand type mismatch")),
        };
        self.push(result)
    }

    fn convert(&mut self, value: Value, tag: Conversion) -> Result<Value, RuntimeError> {
        use Conversion::*;
        if tag == ToString {
            let text = self.ctx.format_value(value);
            return Ok(Value::Obj(self.ctx.heap.alloc_str(&text)));
        }
        let mismatch = || Self::corrupted("conversion source mismatch");
        Ok(match (tag, value) {
            (I32ToI64, Value::I32(v)) => Value::I64(v as i64),
            (I32ToU32, Value::I32(v)) => Value::U32(v as u32),
            (I32ToU64, Value::I32(v)) => Value::U64(v as i64 as u64),
            (I32ToF64, Value::I32(v)) => Value::F64(v as f64),
            (I64ToI32, Value::I64(v)) => Value::I32(v as i32),
            (I64ToU32, Value::I64(v)) => Value::U32(v as u32),
            (I64ToU64, Value::I64(v)) => Value::U64(v as u64),
            (I64ToF64, Value::I64(v)) => Value::F64(v as f64),
            (U32ToI32, Value::U32(v)) => Value::I32(v as i32),
            (U32ToI64, Value::U32(v)) => Value::I64(v as i64),
            (U32ToU64, Value::U32(v)) => Value::U64(v as u64),
            (U32ToF64, Value::U32(v)) => Value::F64(v as f64),
            (U64ToI32, Value::U64(v)) => Value::I32(v as i32),
            (U64ToI64, Value::U64(v)) => Value::I64(v as i64),
            (U64ToU32, Value::U64(v)) => Value::U32(v as u32),
            (U64ToF64, Value::U64(v)) => Value::F64(v as f64),
            (F64ToI32, Value::F64(v)) => Value::I32(v as i32),
            (F64ToI64, Value::F64(v)) => Value::I64(v as i64),
            (F64ToU32, Value::F64(v)) => Value::U32(v as u32),
            (F64ToU64, Value::F64(v)) => Value::U64(v as u64),
            (I32ToBool, Value::I32(v)) => Value::Bool(v != 0),
            (I64ToBool, Value::I64(v)) => Value::Bool(v != 0),
            (U32ToBool, Value::U32(v)) => Value::Bool(v != 0),
            (U64ToBool, Value::U64(v)) => Value::Bool(v != 0),
            (F64ToBool, Value::F64(v)) => Value::Bool(v != 0.0),
            (BoolToI32, Value::Bool(v)) => Value::I32(v as i32),
            (BoolToI64, Value::Bool(v)) => Value::I64(v as i64),
            (BoolToU32, Value::Bool(v)) => Value::U32(v as u32),
            (BoolToU64, Value::Bool(v)) => Value::U64(v as u64),
            (BoolToF64, Value::Bool(v)) => Value::F64(v as u8 as f64),
            _ => return Err(mismatch()),
        })
    }

    fn expect_string(&self, value: Value) -> Result<String, RuntimeError> {
        value
            .as_obj()
            .and_then(|id| self.ctx.heap.str_value(id))
            .map(str::to_string)
            .ok_or_else(|| Self::corrupted("expected a string operand"))
    }

    fn array_get(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop_int_index()?;
        let target = self.pop()?;
        let Some(id) = target.as_obj() else {
            return Err(RuntimeError::type_error("cannot index a non-array value"));
        };
        let value = match self.ctx.heap.get(id) {
            Some(Obj::Array(values)) => {
                if index < 0 || index as usize >= values.len() {
                    return Err(RuntimeError::runtime(format!(
                        "array index {} out of bounds (len {})",
                        index,
                        values.len()
                    )));
                }
                values[index as usize]
            }
            Some(Obj::IntArray(values)) => {
                if index < 0 || index as usize >= values.len() {
                    return Err(RuntimeError::runtime(format!(
                        "array index {} out of bounds (len {})",
                        index,
                        values.len()
                    )));
                }
                Value::I64(values[index as usize])
            }
            Some(Obj::Range(r)) => {
                if index < 0 || index >= r.count() {
                    return Err(RuntimeError::runtime(format!(
                        "array index {} out of bounds (len {})",
                        index,
                        r.count()
                    )));
                }
                Value::I64(r.start + index * r.step)
            }
            _ => return Err(RuntimeError::type_error("cannot index a non-array value")),
        };
        self.push(value)
    }

    fn array_set(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let index = self.pop_int_index()?;
        let target = self.pop()?;
        let Some(id) = target.as_obj() else {
            return Err(RuntimeError::type_error("cannot index a non-array value"));
        };
        match self.ctx.heap.get_mut(id) {
            Some(Obj::Array(values)) => {
                if index < 0 || index as usize >= values.len() {
                    return Err(RuntimeError::runtime(format!(
                        "array index {} out of bounds (len {})",
                        index,
                        values.len()
                    )));
                }
                values[index as usize] = value;
            }
            Some(Obj::IntArray(values)) => {
                if index < 0 || index as usize >= values.len() {
                    return Err(RuntimeError::runtime(format!(
                        "array index {} out of bounds (len {})",
                        index,
                        values.len()
                    )));
                }
                let Some(int) = value.as_int() else {
                    return Err(RuntimeError::type_error(
                        "integer array element must be an integer",
                    ));
                };
                values[index as usize] = int;
            }
            _ => return Err(RuntimeError::type_error("cannot index a non-array value")),
        }
        self.push(value)
    }

    fn slice(&mut self, flags: u8) -> Result<(), RuntimeError> {
        let end = if flags & SLICE_HAS_END != 0 {
            Some(self.pop_int_index()?)
        } else {
            None
        };
        let start = if flags & SLICE_HAS_START != 0 {
            Some(self.pop_int_index()?)
        } else {
            None
        };
        let target = self.pop()?;
        let Some(id) = target.as_obj() else {
            return Err(RuntimeError::type_error("cannot slice a non-array value"));
        };
        let clamp = |bound: Option<i64>, default: usize, len: usize| -> usize {
            match bound {
                Some(v) if v < 0 => 0,
                Some(v) => (v as usize).min(len),
                None => default,
            }
        };
        let result = match self.ctx.heap.get(id) {
            Some(Obj::Array(values)) => {
                let len = values.len();
                let from = clamp(start, 0, len);
                let to = clamp(end, len, len).max(from);
                Obj::Array(values[from..to].to_vec())
            }
            Some(Obj::IntArray(values)) => {
                let len = values.len();
                let from = clamp(start, 0, len);
                let to = clamp(end, len, len).max(from);
                Obj::IntArray(values[from..to].to_vec())
            }
            Some(Obj::Range(r)) => {
                let values: Vec<i64> = r.iter().collect();
                let len = values.len();
                let from = clamp(start, 0, len);
                let to = clamp(end, len, len).max(from);
                Obj::IntArray(values[from..to].to_vec())
            }
            _ => return Err(RuntimeError::type_error("cannot slice a non-array value")),
        };
        let id = self.ctx.heap.alloc(result);
        self.push(Value::Obj(id))
    }

    fn call(&mut self, slot: u8, argc: usize, discard_result: bool) -> Result<(), RuntimeError> {
        let Some(entry) = self.ctx.function(slot) else {
            let name = self.ctx.global_name(slot).unwrap_or("<unknown>");
            return Err(RuntimeError::runtime(format!(
                "call to undefined function '{}'",
                name
            )));
        };
        if entry.arity as usize != argc {
            let name = self
                .ctx
                .global_name(slot)
                .unwrap_or("<unknown>")
                .to_string();
            return Err(RuntimeError::runtime(format!(
                "function '{}' takes {} argument(s), got {}",
                name, entry.arity, argc
            )));
        }
        if self.frames.len() >= self.options.frame_depth {
            return Err(RuntimeError::fatal("call stack overflow"));
        }
        if self.stack.len() < argc {
            return Err(Self::corrupted("operand stack underflow"));
        }
        self.frames.push(CallFrame {
            return_pc: self.pc,
            stack_base: self.stack.len() - argc,
            discard_result,
        });
        self.pc = entry.offset;
        Ok(())
    }

    fn format_print(&mut self, newline: bool) -> Result<(), RuntimeError> {
        let argc = self
            .pop()?
            .as_int()
            .ok_or_else(|| Self::corrupted("format argc is not an integer"))?
            as usize;
        if self.stack.len() < argc + 1 {
            return Err(Self::corrupted("operand stack underflow"));
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let format_value = self.pop()?;
        let format = self.expect_string(format_value)?;
        let mut text = String::with_capacity(format.len());
        let mut rest = format.as_str();
        let mut values = args.iter();
        while let Some(at) = rest.find("{}") {
            text.push_str(&rest[..at]);
            match values.next() {
                Some(value) => text.push_str(&self.ctx.format_value(*value)),
                None => text.push_str("{}"),
            }
            rest = &rest[at + 2..];
        }
        text.push_str(rest);
        if newline {
            writeln!(self.out, "{}", text)
                .map_err(|e| RuntimeError::io(format!("write failed: {}", e)))?;
        } else {
            write!(self.out, "{}", text)
                .map_err(|e| RuntimeError::io(format!("write failed: {}", e)))?;
            self.out
                .flush()
                .map_err(|e| RuntimeError::io(format!("flush failed: {}", e)))?;
        }
        Ok(())
    }

    /// Run a module's initializer exactly once.
    fn import(&mut self, index: u8) -> Result<(), RuntimeError> {
        let (initialized, init_slot) = match self.ctx.module(index) {
            Some(module) => (module.initialized, module.init_slot),
            None => return Err(Self::corrupted("unknown module index")),
        };
        if initialized {
            return Ok(());
        }
        if let Some(module) = self.ctx.module_mut(index) {
            module.initialized = true;
        }
        let Some(init_slot) = init_slot else {
            return Ok(());
        };
        self.call(init_slot, 0, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_chunk(chunk: &Chunk, ctx: &mut Context) -> (Result<(), RuntimeError>, String, usize) {
        let mut out = Vec::new();
        let mut vm = Vm::new(ctx, chunk, &mut out, VmOptions::default());
        let result = vm.run(0);
        let depth = vm.depth();
        (result, String::from_utf8(out).unwrap_or_default(), depth)
    }

    fn chunk_of(ops: impl Fn(&mut Chunk, &mut Context)) -> (Chunk, Context) {
        let mut chunk = Chunk::new();
        let mut ctx = Context::new();
        ops(&mut chunk, &mut ctx);
        chunk.write_op(OpCode::Return, 9, 1);
        (chunk, ctx)
    }

    fn emit_constant(chunk: &mut Chunk, value: Value) {
        let index = chunk.add_constant(value);
        chunk.write_op(OpCode::Constant, 1, 1);
        chunk.write_byte(index as u8, 1, 1);
    }

    #[test]
    fn test_typed_addition() {
        let (chunk, mut ctx) = chunk_of(|chunk, _| {
            emit_constant(chunk, Value::I32(2));
            emit_constant(chunk, Value::I32(3));
            chunk.write_op(OpCode::AddI32, 1, 1);
            chunk.write_op(OpCode::Print, 1, 1);
            // The final Return pops a value.
            chunk.write_op(OpCode::Nil, 1, 1);
        });
        let (result, output, depth) = run_chunk(&chunk, &mut ctx);
        assert!(result.is_ok());
        assert_eq!(output, "5\n");
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_integer_division_by_zero_errors() {
        let (chunk, mut ctx) = chunk_of(|chunk, _| {
            emit_constant(chunk, Value::I32(1));
            emit_constant(chunk, Value::I32(0));
            chunk.write_op(OpCode::DivI32, 2, 5);
            chunk.write_op(OpCode::Pop, 2, 5);
            chunk.write_op(OpCode::Nil, 2, 5);
        });
        let (result, _, _) = run_chunk(&chunk, &mut ctx);
        let error = result.unwrap_err();
        assert!(error.message.contains("division by zero"));
        assert_eq!(error.line, 2);
        assert!(!error.fatal);
    }

    #[test]
    fn test_float_division_by_zero_is_infinite() {
        let (chunk, mut ctx) = chunk_of(|chunk, _| {
            emit_constant(chunk, Value::F64(1.0));
            emit_constant(chunk, Value::F64(0.0));
            chunk.write_op(OpCode::DivF64, 1, 1);
            chunk.write_op(OpCode::Print, 1, 1);
            chunk.write_op(OpCode::Nil, 1, 1);
        });
        let (result, output, _) = run_chunk(&chunk, &mut ctx);
        assert!(result.is_ok());
        assert_eq!(output, "inf\n");
    }

    #[test]
    fn test_equality_is_heterogeneous() {
        let (chunk, mut ctx) = chunk_of(|chunk, ctx| {
            let a = Value::Obj(ctx.heap.alloc_str("abc"));
            let b = Value::Obj(ctx.heap.alloc_str("abc"));
            emit_constant(chunk, a);
            emit_constant(chunk, b);
            chunk.write_op(OpCode::Equal, 1, 1);
            chunk.write_op(OpCode::Print, 1, 1);
            emit_constant(chunk, Value::I32(1));
            emit_constant(chunk, Value::I64(1));
            chunk.write_op(OpCode::Equal, 1, 1);
            chunk.write_op(OpCode::Print, 1, 1);
            chunk.write_op(OpCode::Nil, 1, 1);
        });
        let (result, output, _) = run_chunk(&chunk, &mut ctx);
        assert!(result.is_ok());
        assert_eq!(output, "true\nfalse\n");
    }

    #[test]
    fn test_array_index_out_of_bounds() {
        let (chunk, mut ctx) = chunk_of(|chunk, _| {
            emit_constant(chunk, Value::I32(7));
            chunk.write_op(OpCode::MakeArray, 1, 1);
            chunk.write_byte(1, 1, 1);
            emit_constant(chunk, Value::I32(1));
            chunk.write_op(OpCode::ArrayGet, 1, 1);
            chunk.write_op(OpCode::Pop, 1, 1);
            chunk.write_op(OpCode::Nil, 1, 1);
        });
        let (result, _, _) = run_chunk(&chunk, &mut ctx);
        let error = result.unwrap_err();
        assert!(error.message.contains("out of bounds"));
    }

    #[test]
    fn test_setup_except_catches_runtime_error() {
        // try { 1 / 0 } catch e -> print(e)
        let (chunk, mut ctx) = chunk_of(|chunk, ctx| {
            let err_slot = ctx
                .declare_global("e", orus_core::types::Type::Str, false)
                .unwrap();
            chunk.write_op(OpCode::SetupExcept, 1, 1);
            // Handler offset patched below; slot follows the offset.
            let patch_at = chunk.len();
            chunk.write_u16(0xFFFF, 1, 1);
            chunk.write_byte(err_slot, 1, 1);
            emit_constant(chunk, Value::I32(1));
            emit_constant(chunk, Value::I32(0));
            chunk.write_op(OpCode::DivI32, 1, 1);
            chunk.write_op(OpCode::Pop, 1, 1);
            chunk.write_op(OpCode::PopExcept, 1, 1);
            // Handler: print the bound message.
            let handler = chunk.len();
            chunk.patch_u16(patch_at, (handler - (patch_at + 2)) as u16);
            chunk.write_op(OpCode::GetGlobal, 2, 1);
            chunk.write_byte(err_slot, 2, 1);
            chunk.write_op(OpCode::Print, 2, 1);
            chunk.write_op(OpCode::Nil, 2, 1);
        });
        let (result, output, depth) = run_chunk(&chunk, &mut ctx);
        assert!(result.is_ok(), "{:?}", result);
        assert!(output.contains("division by zero"));
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut chunk = Chunk::new();
        chunk.write_byte(0xFE, 1, 1);
        let mut ctx = Context::new();
        let (result, _, _) = run_chunk(&chunk, &mut ctx);
        let error = result.unwrap_err();
        assert!(error.fatal);
        assert!(error.message.contains("unknown opcode"));
    }

    #[test]
    fn test_format_print_substitutes() {
        let (chunk, mut ctx) = chunk_of(|chunk, ctx| {
            let fmt = Value::Obj(ctx.heap.alloc_str("{} and {}"));
            emit_constant(chunk, fmt);
            emit_constant(chunk, Value::I32(1));
            emit_constant(chunk, Value::Bool(true));
            emit_constant(chunk, Value::I32(2));
            chunk.write_op(OpCode::FormatPrint, 1, 1);
            chunk.write_op(OpCode::Nil, 1, 1);
        });
        let (result, output, _) = run_chunk(&chunk, &mut ctx);
        assert!(result.is_ok());
        assert_eq!(output, "1 and true\n");
    }

    #[test]
    fn test_gc_runs_during_execution_preserves_stack() {
        // Allocate in a loop far past the first GC threshold; everything
        // reachable must survive.
        let mut ctx = Context::new();
        let mut chunk = Chunk::new();
        let s = Value::Obj(ctx.heap.alloc_str("payload-payload-payload"));
        let c = chunk.add_constant(s);
        for _ in 0..8 {
            chunk.write_op(OpCode::Constant, 1, 1);
            chunk.write_byte(c as u8, 1, 1);
            chunk.write_op(OpCode::Convert, 1, 1);
            chunk.write_byte(Conversion::ToString.into(), 1, 1);
            chunk.write_op(OpCode::Pop, 1, 1);
        }
        chunk.write_op(OpCode::Constant, 1, 1);
        chunk.write_byte(c as u8, 1, 1);
        chunk.write_op(OpCode::Print, 1, 1);
        chunk.write_op(OpCode::Nil, 1, 1);
        chunk.write_op(OpCode::Return, 1, 1);
        let (result, output, _) = run_chunk(&chunk, &mut ctx);
        assert!(result.is_ok());
        assert_eq!(output, "payload-payload-payload\n");
    }
}
