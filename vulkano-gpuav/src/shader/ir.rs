//! The intermediate representation that shaders are instrumented in.
//!
//! A [`Program`] is a flat list of [`Instruction`]s operating on a typed register file. Control
//! flow uses [`Label`]s rather than instruction indices, so inserting instructions never
//! invalidates a branch. Registers may be written more than once (a loop counter is just a
//! register that gets reassigned), but a register's type never changes.
//!
//! Pointers are always physical: a register of [`Type::BufferReference`] type holds a raw device
//! address, and dereferencing it reads or writes device memory directly. These are the accesses
//! that instrumentation guards.

use crate::diagnostic::AccessKind;
use ash::vk;
use foldhash::{fast::FixedState, HashSet};
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt,
    hash::{BuildHasher, Hash},
};

/// The index of a register in [`Program::registers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u32);

/// The index of a type in [`Program::types`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// A branch target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// The pipeline stage a program runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::TessellationControl => "tessellation control",
            ShaderStage::TessellationEvaluation => "tessellation evaluation",
            ShaderStage::Geometry => "geometry",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    #[inline]
    fn from(val: ShaderStage) -> Self {
        match val {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// A type in a program's type table.
///
/// Every type with an explicit layout carries its offsets and strides, the same way SPIR-V
/// requires `Offset` and `ArrayStride` decorations on types in physical storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// An integer or float of `width` bytes (4 or 8).
    Scalar { width: u32 },

    /// An array with a length known at compile time.
    Array {
        element: TypeId,
        length: u32,
        stride: u32,
    },

    /// An array whose length is only known at runtime. It has no static size.
    RuntimeArray { element: TypeId, stride: u32 },

    /// A struct with explicitly laid out members.
    Struct { members: Vec<StructMember> },

    /// A physical pointer to a value of type `pointee`, 8 bytes wide.
    BufferReference { pointee: TypeId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StructMember {
    pub ty: TypeId,
    pub offset: u32,
}

/// Binary operators. Comparisons produce 1 or 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    ULessThan,
    SLessThan,
    Equal,
    NotEqual,
}

/// One step of an [`Instruction::AccessChain`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessIndex {
    /// Selects a struct member.
    Member(u32),

    /// Selects an array element by the value of a register.
    Element(Register),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Instruction {
    Constant {
        result: Register,
        value: u64,
    },

    /// Reads the register's type from the push constant block at `offset`.
    LoadPushConstant {
        result: Register,
        offset: u32,
    },

    /// Reads the register's type from the uniform buffer bound at `set`/`binding`.
    LoadUniform {
        result: Register,
        set: u32,
        binding: u32,
        offset: u32,
    },

    /// The index of the current invocation within the draw or dispatch.
    InvocationIndex {
        result: Register,
    },

    Binary {
        result: Register,
        op: BinaryOp,
        lhs: Register,
        rhs: Register,
    },

    /// Reinterprets an integer as a pointer of the result register's type.
    ConvertUToPtr {
        result: Register,
        address: Register,
    },

    /// Computes a pointer to a sub-element of the value that `base` points to.
    AccessChain {
        result: Register,
        base: Register,
        indices: SmallVec<[AccessIndex; 2]>,
    },

    /// Reads the value that `pointer` points to.
    Load {
        result: Register,
        pointer: Register,
    },

    /// Writes `value` to where `pointer` points to.
    Store {
        pointer: Register,
        value: Register,
    },

    /// Calls the embedded bounds-check routine for an access of `size` bytes through `pointer`,
    /// and writes 1 to `result` if the access may proceed.
    ///
    /// This is only ever emitted by instrumentation. `instruction` is the index of the guarded
    /// access in the original program.
    BoundsCheck {
        result: Register,
        pointer: Register,
        size: Register,
        instruction: u32,
        kind: AccessKind,
    },

    Label(Label),

    Branch {
        target: Label,
    },

    BranchConditional {
        condition: Register,
        true_target: Label,
        false_target: Label,
    },

    Return,
}

impl Instruction {
    /// Returns the register this instruction writes to, if any.
    pub fn result(&self) -> Option<Register> {
        match *self {
            Instruction::Constant { result, .. }
            | Instruction::LoadPushConstant { result, .. }
            | Instruction::LoadUniform { result, .. }
            | Instruction::InvocationIndex { result }
            | Instruction::Binary { result, .. }
            | Instruction::ConvertUToPtr { result, .. }
            | Instruction::AccessChain { result, .. }
            | Instruction::Load { result, .. }
            | Instruction::BoundsCheck { result, .. } => Some(result),
            Instruction::Store { .. }
            | Instruction::Label(_)
            | Instruction::Branch { .. }
            | Instruction::BranchConditional { .. }
            | Instruction::Return => None,
        }
    }

    /// Returns the registers this instruction reads.
    pub fn operands(&self) -> SmallVec<[Register; 4]> {
        let mut operands = SmallVec::new();

        match self {
            Instruction::Constant { .. }
            | Instruction::LoadPushConstant { .. }
            | Instruction::LoadUniform { .. }
            | Instruction::InvocationIndex { .. }
            | Instruction::Label(_)
            | Instruction::Branch { .. }
            | Instruction::Return => {}
            Instruction::Binary { lhs, rhs, .. } => operands.extend([*lhs, *rhs]),
            Instruction::ConvertUToPtr { address, .. } => operands.push(*address),
            Instruction::AccessChain { base, indices, .. } => {
                operands.push(*base);
                operands.extend(indices.iter().filter_map(|index| match index {
                    AccessIndex::Element(register) => Some(*register),
                    AccessIndex::Member(_) => None,
                }));
            }
            Instruction::Load { pointer, .. } => operands.push(*pointer),
            Instruction::Store { pointer, value } => operands.extend([*pointer, *value]),
            Instruction::BoundsCheck { pointer, size, .. } => operands.extend([*pointer, *size]),
            Instruction::BranchConditional { condition, .. } => operands.push(*condition),
        }

        operands
    }
}

/// A shader program.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Program {
    /// A name used in validation messages.
    pub name: String,
    pub stage: ShaderStage,
    pub types: Vec<Type>,
    pub registers: Vec<TypeId>,
    pub instructions: Vec<Instruction>,
}

impl Program {
    /// Creates an empty program.
    pub fn new(name: impl Into<String>, stage: ShaderStage) -> Self {
        Program {
            name: name.into(),
            stage,
            types: Vec::new(),
            registers: Vec::new(),
            instructions: Vec::new(),
        }
    }

    /// Adds a type to the type table, reusing an identical one if it exists.
    pub fn add_type(&mut self, ty: Type) -> TypeId {
        if let Some(index) = self.types.iter().position(|existing| *existing == ty) {
            return TypeId(index as u32);
        }

        self.types.push(ty);

        TypeId(self.types.len() as u32 - 1)
    }

    /// Adds a register of type `ty`.
    pub fn add_register(&mut self, ty: TypeId) -> Register {
        self.registers.push(ty);

        Register(self.registers.len() as u32 - 1)
    }

    #[inline]
    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    #[inline]
    pub fn ty(&self, id: TypeId) -> Option<&Type> {
        self.types.get(id.0 as usize)
    }

    #[inline]
    pub fn register_type(&self, register: Register) -> Option<TypeId> {
        self.registers.get(register.0 as usize).copied()
    }

    /// If `register` holds a pointer, returns the type it points to.
    pub fn pointee(&self, register: Register) -> Option<TypeId> {
        match self.ty(self.register_type(register)?)? {
            Type::BufferReference { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// Returns the number of bytes occupied by a value of type `id`, or `None` if that isn't
    /// known statically.
    pub fn size_of(&self, id: TypeId) -> Option<u32> {
        self.size_of_inner(id, 0)
    }

    fn size_of_inner(&self, id: TypeId, depth: u32) -> Option<u32> {
        // Types can't legally be cyclic, but `validate` isn't required before calling this.
        if depth > 64 {
            return None;
        }

        match self.ty(id)? {
            &Type::Scalar { width } => Some(width),
            &Type::Array {
                element,
                length,
                stride,
            } => {
                self.size_of_inner(element, depth + 1)?;
                stride.checked_mul(length)
            }
            Type::RuntimeArray { .. } => None,
            Type::Struct { members } => members.iter().try_fold(0, |size, member| {
                let end = member
                    .offset
                    .checked_add(self.size_of_inner(member.ty, depth + 1)?)?;
                Some(size.max(end))
            }),
            Type::BufferReference { .. } => Some(8),
        }
    }

    /// Returns the largest label in use, if any.
    pub fn max_label(&self) -> Option<Label> {
        self.instructions
            .iter()
            .flat_map(|instruction| -> SmallVec<[Label; 2]> {
                match *instruction {
                    Instruction::Label(label) | Instruction::Branch { target: label } => {
                        SmallVec::from_slice(&[label])
                    }
                    Instruction::BranchConditional {
                        true_target,
                        false_target,
                        ..
                    } => SmallVec::from_slice(&[true_target, false_target]),
                    _ => SmallVec::new(),
                }
            })
            .max()
    }

    /// Returns a hash of the program's contents that is stable across runs.
    pub fn content_hash(&self) -> u64 {
        FixedState::with_seed(CONTENT_HASH_SEED).hash_one(self)
    }

    /// Checks that the program is well-formed.
    ///
    /// # Errors
    ///
    /// - Returns an error if any register, type or label reference is out of range or unknown,
    ///   if a label is defined more than once, or if a pointer operation is applied to a
    ///   register that doesn't hold a pointer.
    pub fn validate(&self) -> Result<(), ProgramError> {
        for (index, ty) in self.types.iter().enumerate() {
            let referenced: SmallVec<[TypeId; 4]> = match ty {
                Type::Scalar { width } => {
                    if !matches!(width, 4 | 8) {
                        return Err(ProgramError::InvalidScalarWidth {
                            ty: TypeId(index as u32),
                            width: *width,
                        });
                    }
                    SmallVec::new()
                }
                Type::Array { element, .. }
                | Type::RuntimeArray { element, .. }
                | Type::BufferReference { pointee: element } => SmallVec::from_slice(&[*element]),
                Type::Struct { members } => members.iter().map(|member| member.ty).collect(),
            };

            for ty in referenced {
                self.ty(ty).ok_or(ProgramError::UnknownType { ty })?;
            }
        }

        for &ty in &self.registers {
            self.ty(ty).ok_or(ProgramError::UnknownType { ty })?;
        }

        let mut labels = HashSet::default();

        for instruction in &self.instructions {
            if let &Instruction::Label(label) = instruction {
                if !labels.insert(label) {
                    return Err(ProgramError::DuplicateLabel { label });
                }
            }
        }

        for (index, instruction) in self.instructions.iter().enumerate() {
            let index = index as u32;

            for register in instruction.result().into_iter().chain(instruction.operands()) {
                self.register_type(register)
                    .ok_or(ProgramError::UnknownRegister {
                        instruction: index,
                        register,
                    })?;
            }

            let targets: SmallVec<[Label; 2]> = match *instruction {
                Instruction::Branch { target } => SmallVec::from_slice(&[target]),
                Instruction::BranchConditional {
                    true_target,
                    false_target,
                    ..
                } => SmallVec::from_slice(&[true_target, false_target]),
                _ => SmallVec::new(),
            };

            for label in targets {
                if !labels.contains(&label) {
                    return Err(ProgramError::UnknownLabel {
                        instruction: index,
                        label,
                    });
                }
            }

            match instruction {
                Instruction::ConvertUToPtr { result, .. } => {
                    self.expect_pointer(index, *result)?;
                }
                Instruction::AccessChain {
                    result,
                    base,
                    indices,
                } => {
                    let pointee = self.expect_pointer(index, *base)?;
                    let selected = self.walk_access_chain(index, pointee, indices)?;
                    let result_pointee = self.expect_pointer(index, *result)?;

                    if self.ty(selected) != self.ty(result_pointee) {
                        return Err(ProgramError::TypeMismatch { instruction: index });
                    }
                }
                Instruction::Load { result, pointer } => {
                    let pointee = self.expect_pointer(index, *pointer)?;

                    if self.register_type(*result).and_then(|ty| self.ty(ty)) != self.ty(pointee)
                    {
                        return Err(ProgramError::TypeMismatch { instruction: index });
                    }
                }
                Instruction::Store { pointer, value } => {
                    let pointee = self.expect_pointer(index, *pointer)?;

                    if self.register_type(*value).and_then(|ty| self.ty(ty)) != self.ty(pointee) {
                        return Err(ProgramError::TypeMismatch { instruction: index });
                    }
                }
                Instruction::BoundsCheck { pointer, .. } => {
                    self.expect_pointer(index, *pointer)?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn expect_pointer(&self, instruction: u32, register: Register) -> Result<TypeId, ProgramError> {
        self.pointee(register).ok_or(ProgramError::NotAPointer {
            instruction,
            register,
        })
    }

    /// Follows `indices` starting from the type `base`, returning the selected type.
    fn walk_access_chain(
        &self,
        instruction: u32,
        base: TypeId,
        indices: &[AccessIndex],
    ) -> Result<TypeId, ProgramError> {
        indices.iter().try_fold(base, |current, index| {
            match (self.ty(current), index) {
                (Some(Type::Struct { members }), &AccessIndex::Member(member)) => members
                    .get(member as usize)
                    .map(|member| member.ty)
                    .ok_or(ProgramError::InvalidAccessChain { instruction }),
                (
                    Some(
                        Type::Array { element, .. } | Type::RuntimeArray { element, .. },
                    ),
                    AccessIndex::Element(_),
                ) => Ok(*element),
                _ => Err(ProgramError::InvalidAccessChain { instruction }),
            }
        })
    }
}

const CONTENT_HASH_SEED: u64 = 0x6770_7561_765f_6972;

/// Error that can happen when validating a [`Program`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramError {
    UnknownType { ty: TypeId },
    InvalidScalarWidth { ty: TypeId, width: u32 },
    UnknownRegister { instruction: u32, register: Register },
    UnknownLabel { instruction: u32, label: Label },
    DuplicateLabel { label: Label },
    NotAPointer { instruction: u32, register: Register },
    InvalidAccessChain { instruction: u32 },
    TypeMismatch { instruction: u32 },
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { ty } => write!(f, "type {} is not in the type table", ty.0),
            Self::InvalidScalarWidth { ty, width } => {
                write!(f, "scalar type {} has an invalid width of {width} bytes", ty.0)
            }
            Self::UnknownRegister {
                instruction,
                register,
            } => write!(
                f,
                "instruction {instruction} uses register {}, which doesn't exist",
                register.0,
            ),
            Self::UnknownLabel { instruction, label } => write!(
                f,
                "instruction {instruction} branches to label {}, which isn't defined",
                label.0,
            ),
            Self::DuplicateLabel { label } => {
                write!(f, "label {} is defined more than once", label.0)
            }
            Self::NotAPointer {
                instruction,
                register,
            } => write!(
                f,
                "instruction {instruction} uses register {} as a pointer, but it doesn't hold one",
                register.0,
            ),
            Self::InvalidAccessChain { instruction } => write!(
                f,
                "the indices of access chain {instruction} don't match the pointed-to type",
            ),
            Self::TypeMismatch { instruction } => {
                write!(f, "the operand types of instruction {instruction} don't match")
            }
        }
    }
}

impl Error for ProgramError {}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn std140_int_array_size() {
        let mut program = Program::new("test", ShaderStage::Vertex);
        let int = program.add_type(Type::Scalar { width: 4 });
        let array = program.add_type(Type::Array {
            element: int,
            length: 4,
            stride: 16,
        });
        let block = program.add_type(Type::Struct {
            members: vec![StructMember {
                ty: array,
                offset: 0,
            }],
        });
        let runtime = program.add_type(Type::RuntimeArray {
            element: int,
            stride: 4,
        });
        let unsized_block = program.add_type(Type::Struct {
            members: vec![
                StructMember { ty: int, offset: 0 },
                StructMember {
                    ty: runtime,
                    offset: 4,
                },
            ],
        });

        assert_eq!(program.size_of(int), Some(4));
        assert_eq!(program.size_of(array), Some(64));
        assert_eq!(program.size_of(block), Some(64));
        assert_eq!(program.size_of(runtime), None);
        assert_eq!(program.size_of(unsized_block), None);
        assert_eq!(program.add_type(Type::Scalar { width: 4 }), int);
    }

    #[test]
    fn validate_rejects_malformed_programs() {
        let mut program = Program::new("test", ShaderStage::Vertex);
        let int = program.add_type(Type::Scalar { width: 4 });
        let value = program.add_register(int);

        program.push(Instruction::Branch { target: Label(3) });
        assert_eq!(
            program.validate(),
            Err(ProgramError::UnknownLabel {
                instruction: 0,
                label: Label(3),
            }),
        );

        program.instructions.clear();
        program.push(Instruction::Load {
            result: value,
            pointer: value,
        });
        assert_eq!(
            program.validate(),
            Err(ProgramError::NotAPointer {
                instruction: 0,
                register: value,
            }),
        );

        program.instructions.clear();
        program.push(Instruction::Constant {
            result: Register(9),
            value: 0,
        });
        assert!(matches!(
            program.validate(),
            Err(ProgramError::UnknownRegister { .. }),
        ));

        program.instructions.clear();
        program.push(Instruction::Label(Label(0)));
        program.push(Instruction::Label(Label(0)));
        assert_eq!(
            program.validate(),
            Err(ProgramError::DuplicateLabel { label: Label(0) }),
        );
    }

    #[test]
    fn access_chain_types_must_match() {
        let mut program = Program::new("test", ShaderStage::Compute);
        let int = program.add_type(Type::Scalar { width: 4 });
        let long = program.add_type(Type::Scalar { width: 8 });
        let array = program.add_type(Type::Array {
            element: int,
            length: 4,
            stride: 4,
        });
        let array_ptr = program.add_type(Type::BufferReference { pointee: array });
        let long_ptr = program.add_type(Type::BufferReference { pointee: long });
        let base = program.add_register(array_ptr);
        let index = program.add_register(int);
        let element = program.add_register(long_ptr);

        program.push(Instruction::AccessChain {
            result: element,
            base,
            indices: smallvec![AccessIndex::Element(index)],
        });
        assert_eq!(
            program.validate(),
            Err(ProgramError::TypeMismatch { instruction: 0 }),
        );
    }

    #[test]
    fn content_hash_is_stable() {
        let mut a = Program::new("a", ShaderStage::Vertex);
        let int = a.add_type(Type::Scalar { width: 4 });
        let register = a.add_register(int);
        a.push(Instruction::Constant {
            result: register,
            value: 1,
        });
        let b = a.clone();

        assert_eq!(a.content_hash(), b.content_hash());

        a.push(Instruction::Return);
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
