use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tallyvault_core::core_store::model::FieldValue;
use tallyvault_core::test_utils::{acme, memory_vault, paired_vaults, transaction};

fn bench_field_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("vault_field_writes");

    let vault = memory_vault("bench");
    vault.provision_company(&acme()).unwrap();
    let tx = transaction("tx-hot");
    let mut n = 0u64;
    group.bench_function("same_entity", |b| {
        b.iter(|| {
            n += 1;
            let op = vault
                .mutate_field(&tx, "memo", FieldValue::text(format!("memo {}", n)))
                .unwrap();
            black_box(op)
        });
    });

    for size in [64usize, 1024, 16384].iter() {
        let memo = "x".repeat(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("memo_bytes", size), &memo, |b, memo| {
            b.iter(|| {
                let op = vault
                    .mutate_field(&tx, "memo", FieldValue::text(memo.clone()))
                    .unwrap();
                black_box(op)
            });
        });
    }

    group.finish();
}

fn bench_remote_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("vault_remote_merge");

    for batch_size in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("disjoint_entities", batch_size), batch_size, |b, &n| {
            b.iter_batched(
                || {
                    let vaults = paired_vaults(&["laptop", "phone"], &acme()).unwrap();
                    for i in 0..n {
                        vaults[1]
                            .mutate_field(&transaction(&format!("tx-{}", i)), "amount", FieldValue::money(1250, "USD"))
                            .unwrap();
                    }
                    let ops = vaults[1].outbound_operations(&acme(), 0, n).unwrap();
                    (vaults, ops)
                },
                |(vaults, ops)| black_box(vaults[0].apply_remote_operations(ops).unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.bench_function("concurrent_conflict", |b| {
        b.iter_batched(
            || {
                let vaults = paired_vaults(&["laptop", "phone"], &acme()).unwrap();
                let tx = transaction("tx-1");
                vaults[0].mutate_field(&tx, "memo", FieldValue::text("laptop")).unwrap();
                vaults[1].mutate_field(&tx, "memo", FieldValue::text("phone")).unwrap();
                let ops = vaults[1].outbound_operations(&acme(), 0, 10).unwrap();
                (vaults, ops)
            },
            |(vaults, ops)| black_box(vaults[0].apply_remote_operations(ops).unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_field_writes, bench_remote_merge);
criterion_main!(benches);
