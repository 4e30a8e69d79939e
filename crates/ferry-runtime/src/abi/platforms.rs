//! Concrete ABI descriptors
//!
//! Each constructor returns the full register file of its convention.
//! Stack offsets in calling sequences are measured from the first byte of
//! the caller's outgoing argument area (the return address on x86_64 is not
//! part of it).

use super::{
    AbiDescriptor, Architecture, CompositeClassifier, Convention, LargeComposite, Register,
    ReturnBuffer, StackGrowth, StackSlots,
};

const SYSV_INT_ARGS: [Register; 6] = [
    Register::int(7, "rdi"),
    Register::int(6, "rsi"),
    Register::int(2, "rdx"),
    Register::int(1, "rcx"),
    Register::int(8, "r8"),
    Register::int(9, "r9"),
];

const WIN64_INT_ARGS: [Register; 4] = [
    Register::int(1, "rcx"),
    Register::int(2, "rdx"),
    Register::int(8, "r8"),
    Register::int(9, "r9"),
];

const XMM: [Register; 8] = [
    Register::float(0, "xmm0"),
    Register::float(1, "xmm1"),
    Register::float(2, "xmm2"),
    Register::float(3, "xmm3"),
    Register::float(4, "xmm4"),
    Register::float(5, "xmm5"),
    Register::float(6, "xmm6"),
    Register::float(7, "xmm7"),
];

const RAX: Register = Register::int(0, "rax");
const RDX: Register = Register::int(2, "rdx");

const X_REGS: [Register; 8] = [
    Register::int(0, "x0"),
    Register::int(1, "x1"),
    Register::int(2, "x2"),
    Register::int(3, "x3"),
    Register::int(4, "x4"),
    Register::int(5, "x5"),
    Register::int(6, "x6"),
    Register::int(7, "x7"),
];

const V_REGS: [Register; 8] = [
    Register::float(0, "v0"),
    Register::float(1, "v1"),
    Register::float(2, "v2"),
    Register::float(3, "v3"),
    Register::float(4, "v4"),
    Register::float(5, "v5"),
    Register::float(6, "v6"),
    Register::float(7, "v7"),
];

const X8: Register = Register::int(8, "x8");

impl AbiDescriptor {
    /// System V AMD64 (Linux, macOS, BSD on x86_64)
    pub fn sysv_x86_64() -> Self {
        Self {
            name: "sysv-x86_64".to_string(),
            arch: Architecture::X86_64,
            convention: Convention::SystemV,
            integer_args: SYSV_INT_ARGS.to_vec(),
            float_args: XMM.to_vec(),
            integer_returns: vec![RAX, RDX],
            float_returns: XMM[..2].to_vec(),
            stack_slot_size: 8,
            stack_alignment: 16,
            stack_slots: StackSlots::Uniform,
            stack_growth: StackGrowth::Down,
            shadow_space: 0,
            max_register_composite: 16,
            max_float_aggregate: 0,
            classifier: CompositeClassifier::SysV,
            large_composite: LargeComposite::OnStack,
            return_buffer: ReturnBuffer::LeadingArgument,
            positional_slots: false,
            spill_closes_class: false,
        }
    }

    /// Microsoft x64
    pub fn win64() -> Self {
        Self {
            name: "win64".to_string(),
            arch: Architecture::X86_64,
            convention: Convention::WindowsFastcall,
            integer_args: WIN64_INT_ARGS.to_vec(),
            float_args: XMM[..4].to_vec(),
            integer_returns: vec![RAX],
            float_returns: XMM[..1].to_vec(),
            stack_slot_size: 8,
            stack_alignment: 16,
            stack_slots: StackSlots::Uniform,
            stack_growth: StackGrowth::Down,
            shadow_space: 32,
            max_register_composite: 8,
            max_float_aggregate: 0,
            classifier: CompositeClassifier::Win64,
            large_composite: LargeComposite::ByReference,
            return_buffer: ReturnBuffer::LeadingArgument,
            positional_slots: true,
            spill_closes_class: false,
        }
    }

    /// AAPCS64 as used on Linux
    pub fn aapcs64() -> Self {
        Self {
            name: "aapcs64".to_string(),
            arch: Architecture::Aarch64,
            convention: Convention::Aapcs64,
            integer_args: X_REGS.to_vec(),
            float_args: V_REGS.to_vec(),
            integer_returns: X_REGS[..2].to_vec(),
            float_returns: V_REGS[..4].to_vec(),
            stack_slot_size: 8,
            stack_alignment: 16,
            stack_slots: StackSlots::Uniform,
            stack_growth: StackGrowth::Down,
            shadow_space: 0,
            max_register_composite: 16,
            max_float_aggregate: 4,
            classifier: CompositeClassifier::Aapcs64,
            large_composite: LargeComposite::ByReference,
            return_buffer: ReturnBuffer::Register(X8),
            positional_slots: false,
            spill_closes_class: true,
        }
    }

    /// Apple arm64: AAPCS64 with naturally aligned stack arguments
    pub fn aapcs64_apple() -> Self {
        Self {
            name: "aapcs64-apple".to_string(),
            convention: Convention::AppleAarch64,
            stack_slots: StackSlots::Natural,
            ..Self::aapcs64()
        }
    }

    /// Unrestricted descriptor for a native convention
    pub fn for_convention(convention: Convention) -> Self {
        match convention {
            Convention::SystemV => Self::sysv_x86_64(),
            Convention::WindowsFastcall => Self::win64(),
            Convention::Aapcs64 => Self::aapcs64(),
            Convention::AppleAarch64 => Self::aapcs64_apple(),
        }
    }

    /// Descriptor for the compiling target, `None` on unsupported hosts
    pub fn host() -> Option<Self> {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Some(Self::win64())
        } else if cfg!(target_arch = "x86_64") {
            Some(Self::sysv_x86_64())
        } else if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            Some(Self::aapcs64_apple())
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::aapcs64())
        } else {
            None
        }
    }

    /// Look up a descriptor by configuration name
    ///
    /// Accepts `host` plus the names of the provided descriptors.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "host" => Self::host(),
            "sysv-x86_64" => Some(Self::sysv_x86_64()),
            "win64" => Some(Self::win64()),
            "aapcs64" => Some(Self::aapcs64()),
            "aapcs64-apple" => Some(Self::aapcs64_apple()),
            _ => None,
        }
    }
}
