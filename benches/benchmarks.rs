use binix_launcher::process::{ConnectionAllocator, EventSink, SimulatedDevice};
use binix_launcher::{AllocatorKey, Launcher, LauncherConfig, SpawnRequest};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const HOST: &str = "org.binix.browser";

/// Fill a pool and free every slot again
fn benchmark_allocator(c: &mut Criterion) {
    let key = AllocatorKey::sandboxed(HOST);
    let mut allocator =
        ConnectionAllocator::new(key.clone(), 20, "org.binix.app.SandboxedProcessService", HOST);
    let request = SpawnRequest::new(key);

    c.bench_function("allocate_free_20", |b| {
        b.iter(|| {
            let mut generation = 0;
            while allocator.allocate(&request, generation).is_some() {
                generation += 1;
            }
            for index in 0..20 {
                black_box(allocator.free(index));
            }
        })
    });
}

/// Launch, connect, set up and crash workers against the simulated binder
fn benchmark_launcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("launcher");

    group.bench_function("launch_crash_cycle", |b| {
        let (sink, events) = EventSink::channel();
        let device = SimulatedDevice::new(sink);
        let mut launcher = Launcher::new(LauncherConfig::default(), device.binder());
        let key = AllocatorKey::sandboxed(HOST);

        b.iter(|| {
            let dispatch = launcher.launch(SpawnRequest::new(key.clone()));
            while let Ok(event) = events.try_recv() {
                launcher.handle_event(event);
            }
            if let Some(id) = dispatch.ok().and_then(|d| d.connection().cloned()) {
                device.crash(&id);
            }
            while let Ok(event) = events.try_recv() {
                launcher.handle_event(event);
            }
            black_box(launcher.allocated_connections_count(&key))
        })
    });

    group.bench_function("queue_drain_1_slot", |b| {
        let config = LauncherConfig {
            sandboxed_capacity: 1,
            ..LauncherConfig::default()
        };
        let (sink, events) = EventSink::channel();
        let device = SimulatedDevice::new(sink);
        let mut launcher = Launcher::new(config, device.binder());
        let key = AllocatorKey::sandboxed(HOST);

        b.iter(|| {
            for _ in 0..8 {
                let _ = launcher.launch(SpawnRequest::new(key.clone()));
            }
            loop {
                while let Ok(event) = events.try_recv() {
                    launcher.handle_event(event);
                }
                let Some(id) = device.live_connections().into_iter().next() else {
                    break;
                };
                device.crash(&id);
            }
            black_box(launcher.pending_spawns_count(&key))
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_allocator, benchmark_launcher);
criterion_main!(benches);
