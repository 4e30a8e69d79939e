//! Upcall benchmarks
//!
//! - Thunk generation cost (link into a long-lived session)
//! - Native-to-managed round trip through a generated thunk

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ferry_jit::{LinkerConfig, UpcallLinker};
use ferry_runtime::{FunctionDescriptor, MemoryLayout, MethodType, UpcallTarget, Value, ValueType};

fn add_target() -> UpcallTarget {
    UpcallTarget::closure(
        MethodType::of(ValueType::I64, vec![ValueType::I64; 2]),
        |args| match args {
            [Value::I64(a), Value::I64(b)] => Ok(Value::I64(a.wrapping_add(*b))),
            _ => Ok(Value::I64(0)),
        },
    )
}

fn add_descriptor() -> FunctionDescriptor {
    FunctionDescriptor::of(MemoryLayout::I64, vec![MemoryLayout::I64; 2])
}

fn bench_link(c: &mut Criterion) {
    let linker = UpcallLinker::new(LinkerConfig::default());
    let descriptor = add_descriptor();
    c.bench_function("link_i64_pair", |b| {
        b.iter_batched(
            || linker.open_session(),
            |session| {
                let address = linker.link_default(add_target(), black_box(&descriptor), &session);
                black_box(address.ok());
                session
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let linker = UpcallLinker::new(LinkerConfig::default());
    let session = linker.open_session();
    let Ok(address) = linker.link_default(add_target(), &add_descriptor(), &session) else {
        return;
    };
    let thunk: extern "C" fn(i64, i64) -> i64 = unsafe { address.to_fn() };
    c.bench_function("round_trip_i64_pair", |b| {
        b.iter(|| thunk(black_box(20), black_box(22)))
    });
}

criterion_group!(benches, bench_link, bench_round_trip);
criterion_main!(benches);
