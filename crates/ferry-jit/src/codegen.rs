//! CallingSequence-to-IR translation
//!
//! Every thunk has the same shape:
//!
//! ```text
//! thunk(native params...) {
//!     atomic add 1 to the session's active count
//!     args   = stack slot (argument_area bytes)
//!     result = stack slot (result_area bytes) | caller's return buffer
//!     store each param into its cell of `args`
//!     upcall_entry(context, &args, result)
//!     load return slots from `result`
//!     atomic sub 1 from the active count
//!     return them
//! }
//! ```
//!
//! The native signature is derived from the sequence's slots, so Cranelift's
//! own ABI lowering puts every parameter where the sequence says it lives.

use cranelift_codegen::ir::{
    types, AbiParam, ArgumentPurpose, AtomicRmwOp, Function, InstBuilder, MemFlags, Signature,
    StackSlot, StackSlotData, StackSlotKind, Type, UserFuncName, Value,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use ferry_runtime::abi::{
    MemoryPassing, Passing, RegClass, ReturnBinding, SlotType, CELL_SIZE,
};
use ferry_runtime::layout::align_up;
use ferry_runtime::{CallingSequence, Convention, UpcallError, UpcallResult};

/// What a thunk does with one native parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Address of the caller-supplied return buffer
    ReturnBuffer,
    /// Register consumed without carrying a value
    Filler,
    /// Stored into the transfer-buffer cell at this offset
    Cell(usize),
}

/// Native signature of a thunk plus the role of each parameter
#[derive(Debug, Clone)]
pub struct ThunkSignature {
    pub signature: Signature,
    pub roles: Vec<ParamRole>,
}

/// Cranelift calling convention implementing a native convention
pub fn call_conv(convention: Convention) -> CallConv {
    match convention {
        Convention::SystemV => CallConv::SystemV,
        Convention::WindowsFastcall => CallConv::WindowsFastcall,
        // Cranelift names the Linux AAPCS64 variant after System V
        Convention::Aapcs64 => CallConv::SystemV,
        Convention::AppleAarch64 => CallConv::AppleAarch64,
    }
}

fn ir_type(ty: SlotType, pointer: Type) -> Type {
    match ty {
        SlotType::I8 => types::I8,
        SlotType::I16 => types::I16,
        SlotType::I32 => types::I32,
        SlotType::I64 => types::I64,
        SlotType::F32 => types::F32,
        SlotType::F64 => types::F64,
        SlotType::Address => pointer,
    }
}

fn filler_type(class: RegClass) -> Type {
    match class {
        RegClass::Integer => types::I64,
        RegClass::Float => types::F64,
    }
}

/// Derive the native signature of the thunk for `sequence`
pub fn thunk_signature(sequence: &CallingSequence, pointer: Type) -> UpcallResult<ThunkSignature> {
    let mut signature = Signature::new(call_conv(sequence.convention()));
    let mut roles = Vec::new();

    match sequence.ret() {
        ReturnBinding::Buffer { .. } if has_return_register(sequence.convention()) => {
            signature
                .params
                .push(AbiParam::special(pointer, ArgumentPurpose::StructReturn));
            roles.push(ParamRole::ReturnBuffer);
        }
        ReturnBinding::Buffer { .. } => {
            signature.params.push(AbiParam::new(pointer));
            signature.returns.push(AbiParam::new(pointer));
            roles.push(ParamRole::ReturnBuffer);
        }
        ReturnBinding::Value { slots, .. } => {
            for slot in slots {
                signature.returns.push(AbiParam::new(ir_type(slot.ty, pointer)));
            }
        }
        ReturnBinding::Void => {}
    }

    for binding in sequence.arguments() {
        for register in &binding.skipped {
            signature.params.push(AbiParam::new(filler_type(register.class)));
            roles.push(ParamRole::Filler);
        }
        match &binding.passing {
            Passing::Value(slots) => {
                for slot in slots {
                    signature.params.push(AbiParam::new(ir_type(slot.ty, pointer)));
                    roles.push(ParamRole::Cell(slot.cell));
                }
            }
            Passing::Memory {
                slot,
                kind: MemoryPassing::InArgumentArea,
            } => {
                let size = to_u32(align_up(slot.size, CELL_SIZE), "on-stack composite")?;
                signature
                    .params
                    .push(AbiParam::special(pointer, ArgumentPurpose::StructArgument(size)));
                roles.push(ParamRole::Cell(slot.cell));
            }
            Passing::Memory {
                slot,
                kind: MemoryPassing::ByReference,
            } => {
                signature.params.push(AbiParam::new(pointer));
                roles.push(ParamRole::Cell(slot.cell));
            }
            Passing::Empty => {}
        }
    }

    Ok(ThunkSignature { signature, roles })
}

/// Whether the return buffer address arrives in a dedicated register (x8)
/// rather than as the leading integer argument
fn has_return_register(convention: Convention) -> bool {
    matches!(convention, Convention::Aapcs64 | Convention::AppleAarch64)
}

/// Addresses baked into a thunk as immediates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThunkBindings {
    /// `UpcallContext` passed to the handler
    pub context: usize,
    /// `upcall_entry`, called with the host's C convention
    pub handler: usize,
    /// Pointer-sized counter of threads executing the session's code
    pub active: usize,
}

/// Translate `sequence` into the IR of a thunk
pub fn translate(
    sequence: &CallingSequence,
    thunk: &ThunkSignature,
    pointer: Type,
    host_call_conv: CallConv,
    bindings: ThunkBindings,
) -> UpcallResult<Function> {
    let mut func = Function::with_name_signature(UserFuncName::user(0, 0), thunk.signature.clone());
    let mut func_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut func, &mut func_ctx);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);
    let params = builder.block_params(entry_block).to_vec();

    let active = builder.ins().iconst(pointer, bindings.active as i64);
    let one = builder.ins().iconst(pointer, 1);
    builder
        .ins()
        .atomic_rmw(pointer, MemFlags::trusted(), AtomicRmwOp::Add, active, one);

    // Capture every incoming value into its cell
    let args = stack_slot(&mut builder, sequence.argument_area().max(CELL_SIZE))?;
    let mut return_buffer = None;
    for (role, value) in thunk.roles.iter().zip(&params) {
        match role {
            ParamRole::ReturnBuffer => return_buffer = Some(*value),
            ParamRole::Filler => {}
            ParamRole::Cell(cell) => {
                let offset = to_i32(*cell)?;
                builder.ins().stack_store(*value, args, offset);
            }
        }
    }
    let args_addr = builder.ins().stack_addr(pointer, args, 0);

    let (result_addr, result_slot) = match return_buffer {
        Some(buffer) => (buffer, None),
        None => {
            let slot = stack_slot(&mut builder, sequence.result_area())?;
            (builder.ins().stack_addr(pointer, slot, 0), Some(slot))
        }
    };

    // One call into the handler
    let mut handler_sig = Signature::new(host_call_conv);
    for _ in 0..3 {
        handler_sig.params.push(AbiParam::new(pointer));
    }
    let handler_sig = builder.import_signature(handler_sig);
    let context = builder.ins().iconst(pointer, bindings.context as i64);
    let callee = builder.ins().iconst(pointer, bindings.handler as i64);
    builder
        .ins()
        .call_indirect(handler_sig, callee, &[context, args_addr, result_addr]);

    let returns = return_values(&mut builder, sequence, thunk, pointer, return_buffer, result_slot)?;
    // Last access to session state; only the epilogue runs after this
    builder
        .ins()
        .atomic_rmw(pointer, MemFlags::trusted(), AtomicRmwOp::Sub, active, one);
    builder.ins().return_(&returns);
    builder.finalize();

    Ok(func)
}

fn return_values(
    builder: &mut FunctionBuilder,
    sequence: &CallingSequence,
    thunk: &ThunkSignature,
    pointer: Type,
    return_buffer: Option<Value>,
    result_slot: Option<StackSlot>,
) -> UpcallResult<Vec<Value>> {
    let mut returns = Vec::new();
    match (sequence.ret(), result_slot) {
        (ReturnBinding::Value { slots, .. }, Some(result)) => {
            for slot in slots {
                let offset = to_i32(slot.cell)?;
                returns.push(builder.ins().stack_load(ir_type(slot.ty, pointer), result, offset));
            }
        }
        (ReturnBinding::Buffer { .. }, _) => {
            // A leading buffer pointer goes back in the first return register
            if let (false, Some(buffer)) = (thunk.signature.returns.is_empty(), return_buffer) {
                returns.push(buffer);
            }
        }
        _ => {}
    }
    Ok(returns)
}

fn stack_slot(builder: &mut FunctionBuilder, size: usize) -> UpcallResult<StackSlot> {
    let size = to_u32(size, "transfer buffer")?;
    Ok(builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 3)))
}

fn to_u32(value: usize, what: &str) -> UpcallResult<u32> {
    u32::try_from(value).map_err(|_| UpcallError::Resource(format!("{} of {} bytes is too large", what, value)))
}

fn to_i32(value: usize) -> UpcallResult<i32> {
    i32::try_from(value).map_err(|_| UpcallError::Resource(format!("cell offset {} is too large", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::InstructionData;
    use ferry_runtime::{AbiDescriptor, CallingSequenceBuilder, FunctionDescriptor, MemoryLayout};
    use pretty_assertions::assert_eq;

    fn sequence(descriptor: FunctionDescriptor, abi: &AbiDescriptor) -> CallingSequence {
        CallingSequenceBuilder::build(&descriptor, abi).unwrap()
    }

    fn bindings() -> ThunkBindings {
        ThunkBindings {
            context: 0x1000,
            handler: 0x2000,
            active: 0x3000,
        }
    }

    fn param_types(sig: &Signature) -> Vec<Type> {
        sig.params.iter().map(|p| p.value_type).collect()
    }

    #[test]
    fn test_scalar_signature() {
        let seq = sequence(
            FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32, MemoryLayout::F64]),
            &AbiDescriptor::sysv_x86_64(),
        );
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        assert_eq!(thunk.signature.call_conv, CallConv::SystemV);
        assert_eq!(param_types(&thunk.signature), vec![types::I32, types::F64]);
        assert_eq!(thunk.signature.returns, vec![AbiParam::new(types::I32)]);
        assert_eq!(thunk.roles, vec![ParamRole::Cell(0), ParamRole::Cell(8)]);
    }

    #[test]
    fn test_sysv_large_return_uses_leading_pointer() {
        let large = MemoryLayout::structure(vec![MemoryLayout::I64; 4]);
        let seq = sequence(
            FunctionDescriptor::of(large, vec![MemoryLayout::I64]),
            &AbiDescriptor::sysv_x86_64(),
        );
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        assert_eq!(
            thunk.signature.params,
            vec![AbiParam::new(types::I64), AbiParam::new(types::I64)]
        );
        assert_eq!(thunk.signature.returns, vec![AbiParam::new(types::I64)]);
        assert_eq!(thunk.roles, vec![ParamRole::ReturnBuffer, ParamRole::Cell(0)]);
    }

    #[test]
    fn test_aapcs64_large_return_uses_struct_return() {
        let large = MemoryLayout::structure(vec![MemoryLayout::I64; 4]);
        let seq = sequence(FunctionDescriptor::of(large, vec![]), &AbiDescriptor::aapcs64());
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        assert_eq!(
            thunk.signature.params,
            vec![AbiParam::special(types::I64, ArgumentPurpose::StructReturn)]
        );
        assert!(thunk.signature.returns.is_empty());
    }

    #[test]
    fn test_sysv_large_argument_is_struct_argument() {
        let large = MemoryLayout::structure(vec![MemoryLayout::I32; 5]);
        let seq = sequence(FunctionDescriptor::of_void(vec![large]), &AbiDescriptor::sysv_x86_64());
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        assert_eq!(
            thunk.signature.params,
            vec![AbiParam::special(types::I64, ArgumentPurpose::StructArgument(24))]
        );
    }

    #[test]
    fn test_win64_large_argument_is_pointer() {
        let large = MemoryLayout::structure(vec![MemoryLayout::I32; 3]);
        let seq = sequence(FunctionDescriptor::of_void(vec![large]), &AbiDescriptor::win64());
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        assert_eq!(thunk.signature.call_conv, CallConv::WindowsFastcall);
        assert_eq!(thunk.signature.params, vec![AbiParam::new(types::I64)]);
    }

    #[test]
    fn test_aapcs64_spill_adds_fillers() {
        let pair = MemoryLayout::structure(vec![MemoryLayout::I64, MemoryLayout::I64]);
        let mut params = vec![MemoryLayout::I64; 7];
        params.push(pair);
        let seq = sequence(FunctionDescriptor::of_void(params), &AbiDescriptor::aapcs64());
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        assert_eq!(thunk.roles.len(), 7 + 1 + 2);
        assert_eq!(thunk.roles[7], ParamRole::Filler);
        assert_eq!(param_types(&thunk.signature)[8..].to_vec(), vec![types::I64, types::I64]);
    }

    #[test]
    fn test_empty_composite_has_no_param() {
        let empty = MemoryLayout::structure(vec![]);
        let seq = sequence(
            FunctionDescriptor::of(empty.clone(), vec![empty, MemoryLayout::I32]),
            &AbiDescriptor::sysv_x86_64(),
        );
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        assert_eq!(param_types(&thunk.signature), vec![types::I32]);
        assert!(thunk.signature.returns.is_empty());
    }

    #[test]
    fn test_translate_verifies() {
        let pair = MemoryLayout::structure(vec![MemoryLayout::I64, MemoryLayout::F64]);
        let seq = sequence(
            FunctionDescriptor::of(pair.clone(), vec![pair, MemoryLayout::I8]),
            &AbiDescriptor::sysv_x86_64(),
        );
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        let func = translate(&seq, &thunk, types::I64, CallConv::SystemV, bindings()).unwrap();

        let flags = cranelift_codegen::settings::Flags::new(cranelift_codegen::settings::builder());
        cranelift_codegen::verify_function(&func, &flags).unwrap();
        assert_eq!(func.sized_stack_slots.len(), 2);
    }

    #[test]
    fn test_translate_brackets_body_with_active_count() {
        let seq = sequence(FunctionDescriptor::of(MemoryLayout::I32, vec![]), &AbiDescriptor::sysv_x86_64());
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        let func = translate(&seq, &thunk, types::I64, CallConv::SystemV, bindings()).unwrap();

        let ops: Vec<_> = func
            .layout
            .blocks()
            .flat_map(|block| func.layout.block_insts(block))
            .filter_map(|inst| match func.dfg.insts[inst] {
                InstructionData::AtomicRmw { op, .. } => Some(op),
                _ => None,
            })
            .collect();
        assert_eq!(ops, vec![AtomicRmwOp::Add, AtomicRmwOp::Sub]);
    }

    #[test]
    fn test_translate_buffer_return_has_no_result_slot() {
        let large = MemoryLayout::structure(vec![MemoryLayout::I64; 3]);
        let seq = sequence(FunctionDescriptor::of(large, vec![]), &AbiDescriptor::sysv_x86_64());
        let thunk = thunk_signature(&seq, types::I64).unwrap();
        let func = translate(&seq, &thunk, types::I64, CallConv::SystemV, bindings()).unwrap();
        assert_eq!(func.sized_stack_slots.len(), 1);
    }
}
