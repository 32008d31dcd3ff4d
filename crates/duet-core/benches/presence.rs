//! Presence and group benchmarks for duet-core.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use duet_core::{group_name, Connection, Group, PresenceRegistry};

fn bench_register_unregister(c: &mut Criterion) {
    let presence = PresenceRegistry::new();

    c.bench_function("presence_register_unregister", |b| {
        b.iter(|| {
            presence.register(black_box("amy"), black_box("c1"));
            presence.unregister(black_box("amy"), black_box("c1"))
        })
    });
}

fn bench_online_users(c: &mut Criterion) {
    let presence = PresenceRegistry::new();
    for i in 0..1_000 {
        presence.register(&format!("user{i}"), &format!("conn{i}"));
    }

    c.bench_function("presence_online_users_1000", |b| {
        b.iter(|| presence.online_users())
    });
}

fn bench_group_membership(c: &mut Criterion) {
    let mut group = Group::new(group_name("amy", "bob"));
    for i in 0..16 {
        group.add(Connection::new(format!("conn{i}"), if i % 2 == 0 { "amy" } else { "bob" }));
    }

    c.bench_function("group_has_user_16", |b| {
        b.iter(|| group.has_user(black_box("bob")))
    });
}

criterion_group!(
    benches,
    bench_register_unregister,
    bench_online_users,
    bench_group_membership
);
criterion_main!(benches);
