use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tessera_core::common::{BoundedMap, EvictionOrder, Prque};

const SIZE: u64 = 10_000;

fn bench_prque_push_pop(c: &mut Criterion) {
    c.bench_function("prque push then drain", |b| {
        let mut rng = StdRng::from_seed([7; 32]);
        let priorities: Vec<i64> = (0..SIZE).map(|_| rng.gen_range(0..1_000_000)).collect();
        b.iter(|| {
            let mut q = Prque::new();
            for (i, p) in priorities.iter().enumerate() {
                q.push(i as u64, *p);
            }
            while let Some(item) = q.pop() {
                black_box(item);
            }
        });
    });
}

fn bench_prque_reprioritise(c: &mut Criterion) {
    let mut q = Prque::new();
    for i in 0..SIZE {
        q.push(i, i as i64);
    }
    c.bench_function("prque update existing", move |b| {
        let mut rng = StdRng::from_seed([9; 32]);
        b.iter(|| {
            let key = rng.gen_range(0..SIZE);
            q.push(key, rng.gen_range(0..1_000_000));
            black_box(q.peek().map(|(_, p)| p));
        });
    });
}

fn bench_bounded_map(c: &mut Criterion) {
    for (name, order) in [
        ("bounded map lru insert", EvictionOrder::LeastRecentlyUsed),
        ("bounded map fifo insert", EvictionOrder::InsertionOrder),
    ] {
        c.bench_function(name, move |b| {
            let mut map = BoundedMap::new(1_024, order);
            let mut key = 0u64;
            b.iter(|| {
                key = key.wrapping_add(1);
                black_box(map.insert(key % 4_096, key));
            });
        });
    }

    let mut map = BoundedMap::lru(1_024);
    for i in 0..1_024u64 {
        map.insert(i, i);
    }
    c.bench_function("bounded map lru get", move |b| {
        let mut rng = StdRng::from_seed([3; 32]);
        b.iter(|| {
            let key = rng.gen_range(0..2_048u64);
            black_box(map.get(&key).copied());
        });
    });
}

criterion_group!(benches, bench_prque_push_pop, bench_prque_reprioritise, bench_bounded_map);
criterion_main!(benches);
