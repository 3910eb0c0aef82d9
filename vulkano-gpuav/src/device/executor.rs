//! Execution of shader programs on host threads.
//!
//! Each invocation gets its own register file and runs the program from the first instruction
//! until a `Return` or the end of the program. The invocations of one draw or dispatch are
//! spread over scoped worker threads, which pull invocation indices from a shared atomic counter.
//!
//! `BoundsCheck` instructions are the device side of validation: they search the range snapshot
//! bound at submission, and on failure reserve a slot in the bound diagnostic buffer and write a
//! violation record to it.

use super::{memory::DeviceMemory, Buffer};
use crate::{
    address_range::RangeSnapshot,
    diagnostic::{AccessKind, DiagnosticBuffer, ViolationRecord},
    shader::ir::{AccessIndex, BinaryOp, Instruction, Label, Program, Register, Type},
    DeviceSize,
};
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
};

/// Everything an invocation can read, other than its own registers.
pub(crate) struct DispatchContext<'a> {
    pub(crate) memory: &'a DeviceMemory,
    pub(crate) push_constants: &'a [u8],
    pub(crate) uniforms: &'a HashMap<(u32, u32), Arc<Buffer>>,
    pub(crate) validation: Option<ValidationBindings<'a>>,
    pub(crate) max_steps: u64,
}

/// What the bounds-check routine of an instrumented shader is bound to.
#[derive(Clone, Copy)]
pub(crate) struct ValidationBindings<'a> {
    pub(crate) diagnostic: &'a DiagnosticBuffer,
    pub(crate) snapshot: &'a RangeSnapshot,
    pub(crate) module_id: u32,
}

/// Runs `invocations` invocations of `program`, spread over at most `workers` threads.
///
/// If any invocation fails, the invocations that haven't started yet are not run, and the first
/// error is returned.
pub(crate) fn dispatch(
    program: &Program,
    context: &DispatchContext<'_>,
    invocations: u32,
    workers: usize,
) -> Result<(), ExecutionError> {
    if invocations == 0 {
        return Ok(());
    }

    let labels: HashMap<Label, usize> = program
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(pc, instruction)| match *instruction {
            Instruction::Label(label) => Some((label, pc)),
            _ => None,
        })
        .collect();
    let register_sizes: Vec<usize> = program
        .registers
        .iter()
        .map(|&ty| program.size_of(ty).unwrap_or(0) as usize)
        .collect();

    let next_invocation = AtomicU32::new(0);
    let failure = Mutex::new(None);
    let workers = workers.clamp(1, invocations as usize);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failure.lock().is_some() {
                    break;
                }

                let index = next_invocation.fetch_add(1, Ordering::Relaxed);

                if index >= invocations {
                    break;
                }

                let mut invocation = Invocation {
                    program,
                    context,
                    labels: &labels,
                    registers: register_sizes
                        .iter()
                        .map(|&size| SmallVec::from_elem(0, size))
                        .collect(),
                    index,
                };

                if let Err(err) = invocation.run() {
                    failure.lock().get_or_insert(err);
                    break;
                }
            });
        }
    });

    match failure.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

type Value = SmallVec<[u8; 16]>;

struct Invocation<'a> {
    program: &'a Program,
    context: &'a DispatchContext<'a>,
    labels: &'a HashMap<Label, usize>,
    registers: Vec<Value>,
    index: u32,
}

impl Invocation<'_> {
    fn run(&mut self) -> Result<(), ExecutionError> {
        let program = self.program;
        let context = self.context;
        let mut pc = 0;
        let mut steps = 0u64;

        while let Some(instruction) = program.instructions.get(pc) {
            steps += 1;

            if steps > context.max_steps {
                return Err(ExecutionError::StepLimit {
                    invocation: self.index,
                    limit: context.max_steps,
                });
            }

            pc += 1;

            match *instruction {
                Instruction::Constant { result, value } => {
                    let value = value.to_le_bytes();
                    let dst = self.register_mut(result);
                    let len = dst.len().min(value.len());
                    dst.fill(0);
                    dst[..len].copy_from_slice(&value[..len]);
                }
                Instruction::LoadPushConstant { result, offset } => {
                    let dst = self.register_mut(result);
                    dst.fill(0);

                    if let Some(src) = context.push_constants.get(offset as usize..) {
                        let len = dst.len().min(src.len());
                        dst[..len].copy_from_slice(&src[..len]);
                    }
                }
                Instruction::LoadUniform {
                    result,
                    set,
                    binding,
                    offset,
                } => {
                    let buffer = context
                        .uniforms
                        .get(&(set, binding))
                        .ok_or(ExecutionError::MissingUniformBuffer { set, binding })?;
                    let base = buffer.allocation().base();
                    let address = base + DeviceSize::from(offset);
                    // Reads past the end of the uniform buffer itself return zeroes.
                    let end = base + buffer.size();
                    let dst = self.register_mut(result);
                    dst.fill(0);
                    let len = (end.saturating_sub(address) as usize).min(dst.len());
                    context.memory.read(address, &mut dst[..len]);
                }
                Instruction::InvocationIndex { result } => {
                    let index = u64::from(self.index);
                    self.set_scalar(result, index);
                }
                Instruction::Binary {
                    result,
                    op,
                    lhs,
                    rhs,
                } => {
                    let a = self.scalar(lhs);
                    let b = self.scalar(rhs);
                    let value = match op {
                        BinaryOp::Add => a.wrapping_add(b),
                        BinaryOp::Sub => a.wrapping_sub(b),
                        BinaryOp::Mul => a.wrapping_mul(b),
                        BinaryOp::ULessThan => (a < b).into(),
                        BinaryOp::SLessThan => (self.signed(lhs) < self.signed(rhs)).into(),
                        BinaryOp::Equal => (a == b).into(),
                        BinaryOp::NotEqual => (a != b).into(),
                    };
                    self.set_scalar(result, value);
                }
                Instruction::ConvertUToPtr { result, address } => {
                    let address = self.scalar(address);
                    self.set_scalar(result, address);
                }
                Instruction::AccessChain {
                    result,
                    base,
                    ref indices,
                } => {
                    let address = self.access_chain(base, indices);
                    self.set_scalar(result, address);
                }
                Instruction::Load { result, pointer } => {
                    let address = self.scalar(pointer);
                    context.memory.read(address, self.register_mut(result));
                }
                Instruction::Store { pointer, value } => {
                    let address = self.scalar(pointer);
                    context.memory.write(address, self.register(value));
                }
                Instruction::BoundsCheck {
                    result,
                    pointer,
                    size,
                    instruction,
                    kind,
                } => {
                    let address = self.scalar(pointer);
                    let size = self.scalar(size);
                    let ok = self.bounds_check(address, size, instruction, kind);
                    self.set_scalar(result, ok.into());
                }
                Instruction::Label(_) => {}
                Instruction::Branch { target } => {
                    pc = self.jump(target);
                }
                Instruction::BranchConditional {
                    condition,
                    true_target,
                    false_target,
                } => {
                    let target = if self.scalar(condition) != 0 {
                        true_target
                    } else {
                        false_target
                    };
                    pc = self.jump(target);
                }
                Instruction::Return => break,
            }
        }

        Ok(())
    }

    /// The bounds-check routine. Returns whether the access may proceed.
    fn bounds_check(
        &self,
        address: u64,
        size: u64,
        instruction: u32,
        access_kind: AccessKind,
    ) -> bool {
        let Some(validation) = self.context.validation else {
            return true;
        };

        if validation.snapshot.validate_access(address, size).is_ok() {
            return true;
        }

        // If the buffer is full this only raises the overflow flag.
        validation.diagnostic.push(&ViolationRecord {
            address,
            access_size: size as u32,
            shader_module_id: validation.module_id,
            instruction_index: instruction,
            shader_stage: self.program.stage.into(),
            access_kind,
        });

        false
    }

    fn access_chain(&self, base: Register, indices: &[AccessIndex]) -> u64 {
        let mut address = self.scalar(base);
        let mut current = self.program.pointee(base);

        for index in indices {
            let Some(ty) = current.and_then(|ty| self.program.ty(ty)) else {
                break;
            };

            match (ty, index) {
                (Type::Struct { members }, &AccessIndex::Member(member)) => {
                    let member = members.get(member as usize);
                    address = address.wrapping_add(member.map_or(0, |m| m.offset.into()));
                    current = member.map(|m| m.ty);
                }
                (
                    &Type::Array {
                        element, stride, ..
                    }
                    | &Type::RuntimeArray { element, stride },
                    &AccessIndex::Element(register),
                ) => {
                    let offset = self.signed(register).wrapping_mul(stride.into());
                    address = address.wrapping_add_signed(offset);
                    current = Some(element);
                }
                _ => break,
            }
        }

        address
    }

    fn jump(&self, label: Label) -> usize {
        // `Program::validate` guarantees that every branch target exists.
        self.labels
            .get(&label)
            .copied()
            .unwrap_or(self.program.instructions.len())
    }

    fn register(&self, register: Register) -> &[u8] {
        match self.registers.get(register.0 as usize) {
            Some(value) => value,
            None => &[],
        }
    }

    fn register_mut(&mut self, register: Register) -> &mut [u8] {
        match self.registers.get_mut(register.0 as usize) {
            Some(value) => value,
            None => &mut [],
        }
    }

    fn scalar(&self, register: Register) -> u64 {
        let bytes = self.register(register);
        let mut value = [0; 8];
        let len = bytes.len().min(8);
        value[..len].copy_from_slice(&bytes[..len]);

        u64::from_le_bytes(value)
    }

    fn signed(&self, register: Register) -> i64 {
        let width = self.register(register).len().clamp(1, 8);
        let shift = 64 - 8 * width as u32;

        ((self.scalar(register) << shift) as i64) >> shift
    }

    fn set_scalar(&mut self, register: Register, value: u64) {
        let value = value.to_le_bytes();
        let dst = self.register_mut(register);
        let len = dst.len().min(8);
        dst.fill(0);
        dst[..len].copy_from_slice(&value[..len]);
    }
}

/// Error that can happen when executing a shader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionError {
    /// An invocation executed more instructions than the device allows.
    StepLimit { invocation: u32, limit: u64 },

    /// The shader loaded from a uniform buffer binding that nothing was bound to.
    MissingUniformBuffer { set: u32, binding: u32 },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepLimit { invocation, limit } => write!(
                f,
                "invocation {invocation} did not finish within {limit} instructions",
            ),
            Self::MissingUniformBuffer { set, binding } => write!(
                f,
                "no uniform buffer is bound to set {set}, binding {binding}",
            ),
        }
    }
}

impl Error for ExecutionError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address_range::{AddressRange, AddressRangeRegistry, OwnerHandle},
        shader::{
            instrument,
            ir::{ShaderStage, StructMember},
        },
    };
    use smallvec::smallvec;

    /// Sums `a[0] + a[1] + a[2]` of a `{ int a[3]; }` block (stride 16) into `out`, both reached
    /// through pointers in push constants.
    fn sum_program() -> Program {
        let mut program = Program::new("sum", ShaderStage::Compute);
        let int = program.add_type(Type::Scalar { width: 4 });
        let long = program.add_type(Type::Scalar { width: 8 });
        let array = program.add_type(Type::Array {
            element: int,
            length: 3,
            stride: 16,
        });
        let block = program.add_type(Type::Struct {
            members: vec![StructMember {
                ty: array,
                offset: 0,
            }],
        });
        let block_ptr = program.add_type(Type::BufferReference { pointee: block });
        let int_ptr = program.add_type(Type::BufferReference { pointee: int });

        let address = program.add_register(long);
        let input = program.add_register(block_ptr);
        let output = program.add_register(int_ptr);
        let i = program.add_register(int);
        let n = program.add_register(int);
        let one = program.add_register(int);
        let cond = program.add_register(int);
        let element = program.add_register(int_ptr);
        let value = program.add_register(int);
        let sum = program.add_register(int);

        program.push(Instruction::LoadPushConstant {
            result: address,
            offset: 0,
        });
        program.push(Instruction::ConvertUToPtr {
            result: input,
            address,
        });
        program.push(Instruction::LoadPushConstant {
            result: address,
            offset: 8,
        });
        program.push(Instruction::ConvertUToPtr {
            result: output,
            address,
        });
        program.push(Instruction::Constant { result: i, value: 0 });
        program.push(Instruction::Constant { result: n, value: 3 });
        program.push(Instruction::Constant { result: one, value: 1 });
        program.push(Instruction::Constant { result: sum, value: 0 });
        program.push(Instruction::Label(Label(0)));
        program.push(Instruction::Binary {
            result: cond,
            op: BinaryOp::SLessThan,
            lhs: i,
            rhs: n,
        });
        program.push(Instruction::BranchConditional {
            condition: cond,
            true_target: Label(1),
            false_target: Label(2),
        });
        program.push(Instruction::Label(Label(1)));
        program.push(Instruction::AccessChain {
            result: element,
            base: input,
            indices: smallvec![AccessIndex::Member(0), AccessIndex::Element(i)],
        });
        program.push(Instruction::Load {
            result: value,
            pointer: element,
        });
        program.push(Instruction::Binary {
            result: sum,
            op: BinaryOp::Add,
            lhs: sum,
            rhs: value,
        });
        program.push(Instruction::Binary {
            result: i,
            op: BinaryOp::Add,
            lhs: i,
            rhs: one,
        });
        program.push(Instruction::Branch { target: Label(0) });
        program.push(Instruction::Label(Label(2)));
        program.push(Instruction::Store {
            pointer: output,
            value: sum,
        });
        program.push(Instruction::Return);

        program
    }

    fn push_constants(input: u64, output: u64) -> Vec<u8> {
        [input.to_le_bytes(), output.to_le_bytes()].concat()
    }

    #[test]
    fn instrumented_program_computes_the_same() {
        let memory = DeviceMemory::new();
        let input = memory.allocate(48).unwrap();
        let outputs = [memory.allocate(4).unwrap(), memory.allocate(4).unwrap()];
        memory.write(input.base(), &5u32.to_le_bytes());
        memory.write(input.base() + 16, &7u32.to_le_bytes());
        memory.write(input.base() + 32, &(-2i32).to_le_bytes());

        let registry = AddressRangeRegistry::new();
        for (raw, allocation) in [&input, &outputs[0], &outputs[1]].into_iter().enumerate() {
            registry
                .register(AddressRange::new(
                    allocation.base(),
                    allocation.size(),
                    OwnerHandle::from_raw(raw as u64 + 1),
                ))
                .unwrap();
        }
        let snapshot = registry.snapshot();
        let diagnostic = DiagnosticBuffer::new(4);
        let uniforms = HashMap::default();

        let original = sum_program();
        let instrumented = instrument(&original).unwrap().program;

        for (program, output, validation) in [
            (&original, &outputs[0], None),
            (
                &instrumented,
                &outputs[1],
                Some(ValidationBindings {
                    diagnostic: &diagnostic,
                    snapshot: &snapshot,
                    module_id: 1,
                }),
            ),
        ] {
            let push_constants = push_constants(input.base(), output.base());
            let context = DispatchContext {
                memory: &memory,
                push_constants: &push_constants,
                uniforms: &uniforms,
                validation,
                max_steps: 1000,
            };
            dispatch(program, &context, 1, 1).unwrap();
        }

        let mut results = [[0; 4]; 2];
        memory.read(outputs[0].base(), &mut results[0]);
        memory.read(outputs[1].base(), &mut results[1]);
        assert_eq!(i32::from_le_bytes(results[0]), 10);
        assert_eq!(results[0], results[1]);
        assert_eq!(diagnostic.write_cursor(), 0);
    }

    #[test]
    fn step_limit() {
        let mut program = Program::new("spin", ShaderStage::Compute);
        program.push(Instruction::Label(Label(0)));
        program.push(Instruction::Branch { target: Label(0) });

        let memory = DeviceMemory::new();
        let uniforms = HashMap::default();
        let context = DispatchContext {
            memory: &memory,
            push_constants: &[],
            uniforms: &uniforms,
            validation: None,
            max_steps: 100,
        };

        // Which invocation hits the limit first depends on scheduling.
        assert!(matches!(
            dispatch(&program, &context, 3, 2),
            Err(ExecutionError::StepLimit { limit: 100, .. }),
        ));
    }

    #[test]
    fn missing_uniform_buffer() {
        let mut program = Program::new("uniform", ShaderStage::Fragment);
        let long = program.add_type(Type::Scalar { width: 8 });
        let value = program.add_register(long);
        program.push(Instruction::LoadUniform {
            result: value,
            set: 0,
            binding: 1,
            offset: 0,
        });

        let memory = DeviceMemory::new();
        let uniforms = HashMap::default();
        let context = DispatchContext {
            memory: &memory,
            push_constants: &[],
            uniforms: &uniforms,
            validation: None,
            max_steps: 100,
        };

        assert_eq!(
            dispatch(&program, &context, 1, 1),
            Err(ExecutionError::MissingUniformBuffer { set: 0, binding: 1 }),
        );
    }
}
