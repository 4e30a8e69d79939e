//! Calling sequence computation
//!
//! Parameters are placed in declared order. Each one is classified, given
//! the next free register(s) of its class, and otherwise placed on the stack
//! at the ABI's slot alignment. Register classes are never revisited once an
//! argument has been pushed past them.

use super::classify::{classify, Classification, Piece};
use super::{
    AbiDescriptor, Convention, LargeComposite, RegClass, Register, ReturnBuffer, StackSlots,
};
use crate::error::{UpcallError, UpcallResult};
use crate::layout::{align_up, FunctionDescriptor, MemoryLayout};
use serde::Serialize;
use std::fmt;

/// Bytes per transfer-buffer cell
pub const CELL_SIZE: usize = 8;

/// Smallest result area handed to the handler
pub const MIN_RESULT_AREA: usize = 16;

/// Machine type of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Address,
}

impl SlotType {
    pub fn size(self) -> usize {
        match self {
            SlotType::I8 => 1,
            SlotType::I16 => 2,
            SlotType::I32 | SlotType::F32 => 4,
            SlotType::I64 | SlotType::F64 | SlotType::Address => 8,
        }
    }

    pub fn class(self) -> RegClass {
        match self {
            SlotType::F32 | SlotType::F64 => RegClass::Float,
            _ => RegClass::Integer,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SlotType::I8 => "i8",
            SlotType::I16 => "i16",
            SlotType::I32 => "i32",
            SlotType::I64 => "i64",
            SlotType::F32 => "f32",
            SlotType::F64 => "f64",
            SlotType::Address => "address",
        }
    }
}

/// Where a slot lives at the native call boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Storage {
    Register(Register),
    /// Byte offset into the caller's outgoing argument area
    Stack { offset: usize },
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Register(register) => write!(f, "{}", register),
            Storage::Stack { offset } => write!(f, "stack[{}]", offset),
        }
    }
}

/// One machine value of an argument or return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Slot {
    pub storage: Storage,
    pub ty: SlotType,
    /// Offset of the carried bytes within the logical value
    pub value_offset: usize,
    /// Number of bytes of the logical value this slot carries
    pub size: usize,
    /// Offset of this slot's cell in the transfer buffer (or result area, for returns)
    pub cell: usize,
}

/// How a composite held in memory reaches the callee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemoryPassing {
    /// The bytes themselves sit in the outgoing argument area
    InArgumentArea,
    /// The slot carries the address of a caller-owned copy
    ByReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Passing {
    /// Carried directly by one or more slots
    Value(Vec<Slot>),
    /// The slot's cell receives the address of the composite's bytes
    Memory { slot: Slot, kind: MemoryPassing },
    /// Zero-sized composite, nothing is passed
    Empty,
}

/// Placement of one declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArgumentBinding {
    pub index: usize,
    pub layout: MemoryLayout,
    pub passing: Passing,
    /// Registers burned without carrying a value, in assignment order
    pub skipped: Vec<Register>,
}

impl ArgumentBinding {
    /// Slots in native parameter order
    pub fn slots(&self) -> &[Slot] {
        match &self.passing {
            Passing::Value(slots) => slots,
            Passing::Memory { slot, .. } => std::slice::from_ref(slot),
            Passing::Empty => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ReturnBinding {
    Void,
    /// Returned in registers; an empty slot list is a zero-sized composite
    Value {
        layout: MemoryLayout,
        slots: Vec<Slot>,
    },
    /// Written through a caller-supplied pointer found at `pointer`
    Buffer {
        layout: MemoryLayout,
        pointer: Storage,
    },
}

impl ReturnBinding {
    pub fn layout(&self) -> Option<&MemoryLayout> {
        match self {
            ReturnBinding::Void => None,
            ReturnBinding::Value { layout, .. } | ReturnBinding::Buffer { layout, .. } => {
                Some(layout)
            }
        }
    }

    pub fn slots(&self) -> &[Slot] {
        match self {
            ReturnBinding::Value { slots, .. } => slots,
            _ => &[],
        }
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, ReturnBinding::Buffer { .. })
    }
}

/// Concrete placement of one signature under one ABI
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallingSequence {
    abi: String,
    convention: Convention,
    arguments: Vec<ArgumentBinding>,
    ret: ReturnBinding,
    stack_size: usize,
    argument_area: usize,
    result_area: usize,
}

impl CallingSequence {
    /// Name of the descriptor this sequence was built for
    pub fn abi(&self) -> &str {
        &self.abi
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    pub fn arguments(&self) -> &[ArgumentBinding] {
        &self.arguments
    }

    pub fn ret(&self) -> &ReturnBinding {
        &self.ret
    }

    /// Bytes of stack arguments, padded to the ABI's frame alignment
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Bytes of the transfer buffer holding argument cells
    pub fn argument_area(&self) -> usize {
        self.argument_area
    }

    /// Bytes of the result area holding return cells
    pub fn result_area(&self) -> usize {
        self.result_area
    }

    /// Whether both sequences place every value identically, regardless of the descriptor name
    pub fn same_placement(&self, other: &CallingSequence) -> bool {
        self.convention == other.convention
            && self.arguments == other.arguments
            && self.ret == other.ret
            && self.stack_size == other.stack_size
    }
}

impl fmt::Display for CallingSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stack={}", self.abi, self.stack_size)?;
        for binding in &self.arguments {
            write!(f, "\n  arg{} {}: ", binding.index, binding.layout)?;
            match &binding.passing {
                Passing::Value(slots) => write_slots(f, slots)?,
                Passing::Memory { slot, kind } => {
                    let kind = match kind {
                        MemoryPassing::InArgumentArea => "copy",
                        MemoryPassing::ByReference => "ref",
                    };
                    write!(f, "{}@{}", kind, slot.storage)?;
                }
                Passing::Empty => f.write_str("empty")?,
            }
            if !binding.skipped.is_empty() {
                let names: Vec<_> = binding.skipped.iter().map(|r| r.name).collect();
                write!(f, " skips {}", names.join(" "))?;
            }
        }
        match &self.ret {
            ReturnBinding::Void => write!(f, "\n  ret void"),
            ReturnBinding::Value { layout, slots } => {
                write!(f, "\n  ret {}: ", layout)?;
                if slots.is_empty() {
                    f.write_str("empty")
                } else {
                    write_slots(f, slots)
                }
            }
            ReturnBinding::Buffer { layout, pointer } => {
                write!(f, "\n  ret {}: buffer@{}", layout, pointer)
            }
        }
    }
}

fn write_slots(f: &mut fmt::Formatter<'_>, slots: &[Slot]) -> fmt::Result {
    for (i, slot) in slots.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}:{}", slot.storage, slot.ty.name())?;
    }
    Ok(())
}

fn class_index(class: RegClass) -> usize {
    match class {
        RegClass::Integer => 0,
        RegClass::Float => 1,
    }
}

/// Computes a [`CallingSequence`] from a descriptor and an ABI
pub struct CallingSequenceBuilder<'a> {
    abi: &'a AbiDescriptor,
    next: [usize; 2],
    closed: [bool; 2],
    next_position: usize,
    stack: usize,
    cells: usize,
}

impl<'a> CallingSequenceBuilder<'a> {
    pub fn new(abi: &'a AbiDescriptor) -> Self {
        Self {
            abi,
            next: [0; 2],
            closed: [false; 2],
            next_position: 0,
            stack: abi.shadow_space(),
            cells: 0,
        }
    }

    /// Build the calling sequence for `descriptor` under `abi`
    ///
    /// Fails with `UnsupportedLayout` when a layout has no mapping for the
    /// ABI, or when the descriptor is variadic.
    pub fn build(descriptor: &FunctionDescriptor, abi: &AbiDescriptor) -> UpcallResult<CallingSequence> {
        CallingSequenceBuilder::new(abi).run(descriptor)
    }

    fn run(mut self, descriptor: &FunctionDescriptor) -> UpcallResult<CallingSequence> {
        if let Some(position) = descriptor.variadic_from() {
            return Err(UpcallError::UnsupportedLayout {
                layout: descriptor.to_string(),
                abi: self.abi.name().to_string(),
                reason: format!("variadic arguments from position {}", position),
            });
        }

        // A hidden return pointer takes the first argument position
        let ret = self.bind_return(descriptor.ret())?;
        let mut arguments = Vec::with_capacity(descriptor.arity());
        for (index, layout) in descriptor.params().iter().enumerate() {
            arguments.push(self.bind_argument(index, layout)?);
        }

        let stack_size = align_up(
            self.stack.max(self.abi.shadow_space()),
            self.abi.stack_alignment(),
        );
        let result_area = (ret.slots().len() * CELL_SIZE).max(MIN_RESULT_AREA);
        let sequence = CallingSequence {
            abi: self.abi.name().to_string(),
            convention: self.abi.convention(),
            arguments,
            ret,
            stack_size,
            argument_area: self.cells * CELL_SIZE,
            result_area,
        };

        tracing::debug!(
            abi = %self.abi,
            descriptor = %descriptor,
            stack_size,
            argument_area = sequence.argument_area,
            "built calling sequence"
        );
        Ok(sequence)
    }

    fn classification(&self, layout: &MemoryLayout) -> UpcallResult<Classification> {
        classify(layout, self.abi).map_err(|reason| UpcallError::UnsupportedLayout {
            layout: layout.to_string(),
            abi: self.abi.name().to_string(),
            reason,
        })
    }

    fn bind_return(&mut self, layout: Option<&MemoryLayout>) -> UpcallResult<ReturnBinding> {
        let Some(layout) = layout else {
            return Ok(ReturnBinding::Void);
        };
        let pieces = match self.classification(layout)? {
            Classification::Scalar(piece) => vec![piece],
            Classification::Empty => Vec::new(),
            Classification::Pieces(pieces) => pieces,
            Classification::Memory => return Ok(self.return_buffer(layout)),
        };

        let mut used = [0usize; 2];
        let mut slots = Vec::with_capacity(pieces.len());
        for (i, piece) in pieces.iter().enumerate() {
            let class = class_index(piece.class);
            let Some(register) = self.abi.return_registers(piece.class).get(used[class]) else {
                return Ok(self.return_buffer(layout));
            };
            used[class] += 1;
            slots.push(Slot {
                storage: Storage::Register(*register),
                ty: piece.ty,
                value_offset: piece.offset,
                size: piece.size,
                cell: i * CELL_SIZE,
            });
        }
        Ok(ReturnBinding::Value {
            layout: layout.clone(),
            slots,
        })
    }

    fn return_buffer(&mut self, layout: &MemoryLayout) -> ReturnBinding {
        let pointer = match self.abi.return_buffer() {
            ReturnBuffer::LeadingArgument => self.place(RegClass::Integer, 8),
            ReturnBuffer::Register(register) => Storage::Register(register),
        };
        ReturnBinding::Buffer {
            layout: layout.clone(),
            pointer,
        }
    }

    fn bind_argument(&mut self, index: usize, layout: &MemoryLayout) -> UpcallResult<ArgumentBinding> {
        let (passing, skipped) = match self.classification(layout)? {
            Classification::Scalar(piece) => {
                let storage = self.place(piece.class, piece.size);
                (Passing::Value(vec![self.slot(storage, piece)]), Vec::new())
            }
            Classification::Empty => (Passing::Empty, Vec::new()),
            Classification::Pieces(pieces) => self.bind_pieces(layout, &pieces),
            Classification::Memory => (self.bind_memory(layout), Vec::new()),
        };
        Ok(ArgumentBinding {
            index,
            layout: layout.clone(),
            passing,
            skipped,
        })
    }

    fn bind_pieces(&mut self, layout: &MemoryLayout, pieces: &[Piece]) -> (Passing, Vec<Register>) {
        if let Some(registers) = self.take_registers(pieces) {
            let slots = pieces
                .iter()
                .zip(registers)
                .map(|(piece, register)| self.slot(Storage::Register(register), *piece))
                .collect();
            return (Passing::Value(slots), Vec::new());
        }

        if self.abi.large_composite() == LargeComposite::OnStack {
            return (self.copy_to_stack(layout), Vec::new());
        }

        // Spilled by value as doublewords of the composite's class
        let class = pieces.first().map(|p| p.class).unwrap_or(RegClass::Integer);
        let skipped = if self.abi.spill_closes_class() {
            self.close(class)
        } else {
            Vec::new()
        };
        let ty = match class {
            RegClass::Integer => SlotType::I64,
            RegClass::Float => SlotType::F64,
        };
        let size = layout.size();
        let count = size.div_ceil(8);
        let base = self.stack_slot(count * 8, 8);
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(Slot {
                storage: Storage::Stack { offset: base + i * 8 },
                ty,
                value_offset: i * 8,
                size: (size - i * 8).min(8),
                cell: self.next_cell(),
            });
        }
        (Passing::Value(slots), skipped)
    }

    fn bind_memory(&mut self, layout: &MemoryLayout) -> Passing {
        match self.abi.large_composite() {
            LargeComposite::OnStack => self.copy_to_stack(layout),
            LargeComposite::ByReference => {
                let storage = self.place(RegClass::Integer, 8);
                Passing::Memory {
                    slot: Slot {
                        storage,
                        ty: SlotType::Address,
                        value_offset: 0,
                        size: layout.size(),
                        cell: self.next_cell(),
                    },
                    kind: MemoryPassing::ByReference,
                }
            }
        }
    }

    fn copy_to_stack(&mut self, layout: &MemoryLayout) -> Passing {
        let offset = self.stack_slot(align_up(layout.size(), 8), layout.align().max(8));
        Passing::Memory {
            slot: Slot {
                storage: Storage::Stack { offset },
                ty: SlotType::Address,
                value_offset: 0,
                size: layout.size(),
                cell: self.next_cell(),
            },
            kind: MemoryPassing::InArgumentArea,
        }
    }

    /// Storage for a single scalar of `class`
    fn place(&mut self, class: RegClass, size: usize) -> Storage {
        let piece = Piece {
            class,
            ty: SlotType::I64,
            offset: 0,
            size,
        };
        match self.take_registers(&[piece]) {
            Some(registers) if registers.len() == 1 => Storage::Register(registers[0]),
            _ => Storage::Stack {
                offset: self.stack_slot(size, size),
            },
        }
    }

    /// Registers for every piece, or `None` (consuming nothing unless slots are positional)
    fn take_registers(&mut self, pieces: &[Piece]) -> Option<Vec<Register>> {
        let abi = self.abi;
        if abi.positional_slots() {
            let start = self.next_position;
            self.next_position += pieces.len();
            return pieces
                .iter()
                .enumerate()
                .map(|(i, piece)| abi.argument_registers(piece.class).get(start + i).copied())
                .collect();
        }

        let mut needed = [0usize; 2];
        for piece in pieces {
            needed[class_index(piece.class)] += 1;
        }
        for class in [RegClass::Integer, RegClass::Float] {
            let i = class_index(class);
            if needed[i] == 0 {
                continue;
            }
            if self.closed[i] || self.next[i] + needed[i] > abi.argument_registers(class).len() {
                return None;
            }
        }

        let mut registers = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let i = class_index(piece.class);
            registers.push(abi.argument_registers(piece.class)[self.next[i]]);
            self.next[i] += 1;
        }
        Some(registers)
    }

    /// Close `class` for later arguments, returning the registers left unused
    fn close(&mut self, class: RegClass) -> Vec<Register> {
        let abi = self.abi;
        let registers = abi.argument_registers(class);
        let i = class_index(class);
        let skipped = registers.get(self.next[i]..).unwrap_or(&[]).to_vec();
        self.next[i] = registers.len();
        self.closed[i] = true;
        skipped
    }

    fn stack_slot(&mut self, size: usize, align: usize) -> usize {
        let unit = self.abi.stack_slot_size();
        let (size, align) = match self.abi.stack_slots() {
            StackSlots::Uniform => (align_up(size, unit), align.max(unit)),
            StackSlots::Natural => (size, align.max(1)),
        };
        let offset = align_up(self.stack, align);
        self.stack = offset + size;
        offset
    }

    fn slot(&mut self, storage: Storage, piece: Piece) -> Slot {
        Slot {
            storage,
            ty: piece.ty,
            value_offset: piece.offset,
            size: piece.size,
            cell: self.next_cell(),
        }
    }

    fn next_cell(&mut self) -> usize {
        let cell = self.cells * CELL_SIZE;
        self.cells += 1;
        cell
    }
}
