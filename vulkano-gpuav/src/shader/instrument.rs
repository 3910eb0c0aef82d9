//! The bounds-check instrumentation pass.

use super::ir::{Instruction, Label, Program, ProgramError, Register, Type, TypeId};
use crate::diagnostic::AccessKind;
use std::{error::Error, fmt};

/// The result of instrumenting a program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instrumented {
    /// The instrumented program.
    pub program: Program,

    /// The number of accesses that are now guarded by a bounds check.
    pub checked_accesses: u32,

    /// Accesses that could not be guarded, and are executed unchecked.
    pub unsupported: Vec<UnsupportedConstruct>,
}

/// An access through a buffer reference that the pass could not guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnsupportedConstruct {
    /// Index of the access in the original program.
    pub instruction: u32,
    pub kind: AccessKind,
    pub pointee: TypeId,
}

impl fmt::Display for UnsupportedConstruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} at instruction {} accesses a value whose size is not known statically",
            self.kind.as_str(),
            self.instruction,
        )
    }
}

/// Inserts a bounds check before every load and store through a buffer reference in `program`.
///
/// For an access at index `k` of `program`, the inserted code computes the access size, asks the
/// bounds-check routine whether the access is inside a live allocation, and only performs the
/// access if it is. A load that is skipped produces zero. All other instructions are copied
/// unchanged and in the same order, so a program without buffer reference accesses comes out
/// identical.
///
/// Accesses to values without a static size (runtime arrays) can't be checked; they are copied
/// unchanged and listed in [`Instrumented::unsupported`].
///
/// # Errors
///
/// - Returns [`InstrumentError::InvalidProgram`] if `program` fails [`Program::validate`].
/// - Returns [`InstrumentError::LabelsExhausted`] if `program` uses labels so close to
///   `u32::MAX` that the labels of the inserted checks don't fit after them.
pub fn instrument(program: &Program) -> Result<Instrumented, InstrumentError> {
    program.validate()?;

    let mut out = Program {
        name: program.name.clone(),
        stage: program.stage,
        types: program.types.clone(),
        registers: program.registers.clone(),
        instructions: Vec::with_capacity(program.instructions.len()),
    };
    let mut scratch = None;
    let mut next_label = match program.max_label() {
        Some(label) => label.0.checked_add(1),
        None => Some(0),
    };
    let mut checked_accesses = 0;
    let mut unsupported = Vec::new();

    for (index, instruction) in program.instructions.iter().enumerate() {
        let index = index as u32;

        let (pointer, kind, load_result) = match *instruction {
            Instruction::Load { result, pointer } => (pointer, AccessKind::Read, Some(result)),
            Instruction::Store { pointer, .. } => (pointer, AccessKind::Write, None),
            _ => {
                out.push(instruction.clone());
                continue;
            }
        };

        // `validate` guarantees that loads and stores go through pointers.
        let Some(pointee) = program.pointee(pointer) else {
            out.push(instruction.clone());
            continue;
        };

        let Some(size) = program.size_of(pointee) else {
            unsupported.push(UnsupportedConstruct {
                instruction: index,
                kind,
                pointee,
            });
            out.push(instruction.clone());
            continue;
        };

        let &mut Scratch {
            size: size_register,
            ok,
        } = scratch.get_or_insert_with(|| Scratch::new(&mut out));
        let Some([access, skip, merge]) = next_label
            .and_then(|first| Some([first, first.checked_add(1)?, first.checked_add(2)?]))
            .map(|labels| labels.map(Label))
        else {
            return Err(InstrumentError::LabelsExhausted);
        };
        next_label = merge.0.checked_add(1);

        out.push(Instruction::Constant {
            result: size_register,
            value: size.into(),
        });
        out.push(Instruction::BoundsCheck {
            result: ok,
            pointer,
            size: size_register,
            instruction: index,
            kind,
        });
        out.push(Instruction::BranchConditional {
            condition: ok,
            true_target: access,
            false_target: skip,
        });
        out.push(Instruction::Label(access));
        out.push(instruction.clone());
        out.push(Instruction::Branch { target: merge });
        out.push(Instruction::Label(skip));

        if let Some(result) = load_result {
            out.push(Instruction::Constant { result, value: 0 });
        }

        out.push(Instruction::Branch { target: merge });
        out.push(Instruction::Label(merge));

        checked_accesses += 1;
    }

    Ok(Instrumented {
        program: out,
        checked_accesses,
        unsupported,
    })
}

/// Registers shared by every inserted check. They are rewritten before each use.
#[derive(Clone, Copy)]
struct Scratch {
    size: Register,
    ok: Register,
}

impl Scratch {
    fn new(program: &mut Program) -> Self {
        let uint = program.add_type(Type::Scalar { width: 4 });

        Scratch {
            size: program.add_register(uint),
            ok: program.add_register(uint),
        }
    }
}

/// Error that can happen when instrumenting a program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstrumentError {
    /// The program is malformed.
    InvalidProgram(ProgramError),

    /// There are no unused labels left for the inserted checks.
    LabelsExhausted,
}

impl fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidProgram(_) => write!(f, "the program is malformed"),
            Self::LabelsExhausted => write!(
                f,
                "the program's labels leave no room for the labels of the bounds checks",
            ),
        }
    }
}

impl Error for InstrumentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidProgram(err) => Some(err),
            Self::LabelsExhausted => None,
        }
    }
}

impl From<ProgramError> for InstrumentError {
    fn from(err: ProgramError) -> Self {
        Self::InvalidProgram(err)
    }
}
