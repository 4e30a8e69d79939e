//! ABI descriptors and calling sequences
//!
//! An [`AbiDescriptor`] is pure data describing one platform calling
//! convention: register files, stack rules and how composites are passed.
//! The [`CallingSequenceBuilder`] combines a descriptor with a
//! `FunctionDescriptor` to produce a [`CallingSequence`], the concrete
//! register/stack placement every thunk is generated from.
//!
//! Platform differences are expressed as distinct descriptor values rather
//! than branches in the builder; see `platforms` for the provided instances.

mod classify;
mod platforms;
mod sequence;

pub use sequence::{
    ArgumentBinding, CallingSequence, CallingSequenceBuilder, MemoryPassing, Passing,
    ReturnBinding, Slot, SlotType, Storage, CELL_SIZE, MIN_RESULT_AREA,
};

use serde::Serialize;
use std::fmt;

/// Register file a value travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegClass {
    Integer,
    Float,
}

/// One architectural register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Register {
    pub class: RegClass,
    /// Hardware encoding number within its class
    pub index: u8,
    pub name: &'static str,
}

impl Register {
    pub const fn int(index: u8, name: &'static str) -> Self {
        Self {
            class: RegClass::Integer,
            index,
            name,
        }
    }

    pub const fn float(index: u8, name: &'static str) -> Self {
        Self {
            class: RegClass::Float,
            index,
            name,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Instruction set a descriptor targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Architecture {
    X86_64,
    Aarch64,
}

impl Architecture {
    /// Architecture of the compiling target, if supported
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::Aarch64)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
        }
    }
}

/// Native calling convention identifier
///
/// Restricted descriptors keep the convention of the descriptor they were
/// derived from, so the code generator knows which native rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Convention {
    SystemV,
    WindowsFastcall,
    Aapcs64,
    AppleAarch64,
}

/// How composites are split into register pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompositeClassifier {
    /// Eightbyte classification (INTEGER / SSE per eightbyte)
    SysV,
    /// Homogeneous float aggregates, otherwise doublewords
    Aapcs64,
    /// Only sizes 1, 2, 4 and 8 travel in registers
    Win64,
}

/// Where composites too large for registers go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LargeComposite {
    /// The bytes are copied into the outgoing argument area
    OnStack,
    /// The caller makes a copy and passes its address
    ByReference,
}

/// Where the address of a caller-allocated return buffer is passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReturnBuffer {
    /// Consumes the first integer argument register and is returned in the first integer return register
    LeadingArgument,
    /// A register outside the argument file
    Register(Register),
}

/// Stack argument slot rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StackSlots {
    /// Every argument occupies whole slots of `stack_slot_size` bytes
    Uniform,
    /// Arguments are packed at their natural alignment
    Natural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StackGrowth {
    Down,
    Up,
}

/// Static calling-convention rules for one platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AbiDescriptor {
    pub(crate) name: String,
    pub(crate) arch: Architecture,
    pub(crate) convention: Convention,
    pub(crate) integer_args: Vec<Register>,
    pub(crate) float_args: Vec<Register>,
    pub(crate) integer_returns: Vec<Register>,
    pub(crate) float_returns: Vec<Register>,
    pub(crate) stack_slot_size: usize,
    pub(crate) stack_alignment: usize,
    pub(crate) stack_slots: StackSlots,
    pub(crate) stack_growth: StackGrowth,
    pub(crate) shadow_space: usize,
    pub(crate) max_register_composite: usize,
    pub(crate) max_float_aggregate: usize,
    pub(crate) classifier: CompositeClassifier,
    pub(crate) large_composite: LargeComposite,
    pub(crate) return_buffer: ReturnBuffer,
    pub(crate) positional_slots: bool,
    pub(crate) spill_closes_class: bool,
}

impl AbiDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    /// Argument registers of `class`, in assignment order
    pub fn argument_registers(&self, class: RegClass) -> &[Register] {
        match class {
            RegClass::Integer => &self.integer_args,
            RegClass::Float => &self.float_args,
        }
    }

    /// Return registers of `class`, in assignment order
    pub fn return_registers(&self, class: RegClass) -> &[Register] {
        match class {
            RegClass::Integer => &self.integer_returns,
            RegClass::Float => &self.float_returns,
        }
    }

    pub fn stack_slot_size(&self) -> usize {
        self.stack_slot_size
    }

    /// Alignment the total stack argument area is padded to
    pub fn stack_alignment(&self) -> usize {
        self.stack_alignment
    }

    pub fn stack_slots(&self) -> StackSlots {
        self.stack_slots
    }

    pub fn stack_growth(&self) -> StackGrowth {
        self.stack_growth
    }

    /// Bytes the caller reserves below stack arguments for register spills
    pub fn shadow_space(&self) -> usize {
        self.shadow_space
    }

    /// Largest composite (in bytes) that may travel in registers
    pub fn max_register_composite(&self) -> usize {
        self.max_register_composite
    }

    /// Largest member count of a homogeneous float aggregate (0 when the ABI has none)
    pub fn max_float_aggregate(&self) -> usize {
        self.max_float_aggregate
    }

    pub fn classifier(&self) -> CompositeClassifier {
        self.classifier
    }

    pub fn large_composite(&self) -> LargeComposite {
        self.large_composite
    }

    pub fn return_buffer(&self) -> ReturnBuffer {
        self.return_buffer
    }

    /// Whether argument N always uses register slot N of its class
    pub fn positional_slots(&self) -> bool {
        self.positional_slots
    }

    /// Whether spilling a composite to the stack closes its register class for later arguments
    pub fn spill_closes_class(&self) -> bool {
        self.spill_closes_class
    }

    /// Copy of this descriptor keeping only the first `count` integer argument registers
    pub fn with_integer_registers(&self, count: usize) -> Self {
        let mut abi = self.clone();
        abi.integer_args.truncate(count);
        abi.name = format!("{}[int={}]", self.name, abi.integer_args.len());
        abi
    }

    /// Copy of this descriptor keeping only the first `count` float argument registers
    pub fn with_float_registers(&self, count: usize) -> Self {
        let mut abi = self.clone();
        abi.float_args.truncate(count);
        abi.name = format!("{}[float={}]", self.name, abi.float_args.len());
        abi
    }
}

impl fmt::Display for AbiDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
