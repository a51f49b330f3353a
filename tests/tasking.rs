use dart::{Backend, DartError, Dependency, Priority, TaskStatus, WorldBuilder};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn builder(threads: usize) -> WorldBuilder {
    WorldBuilder::new()
        .with_backend(Backend::Shmem)
        .with_threads(threads)
        .with_deadlock_timeout(30.0)
}

#[test]
#[serial]
fn local_chain_runs_in_creation_order() {
    let world = WorldBuilder::new()
        .with_backend(Backend::Local)
        .with_threads(1)
        .build()
        .unwrap();
    let x = world.segment_alloc_local(8).unwrap();
    world.put_value(&x, 0u64).unwrap();
    for i in 0..100u64 {
        world
            .task_create(
                &[Dependency::input(x), Dependency::output(x)],
                Priority::Low,
                move |ctx| async move {
                    let rt = ctx.runtime();
                    let v: u64 = rt.get_value(&x).unwrap();
                    assert_eq!(v, i);
                    rt.put_value(&x, v + 1).unwrap();
                },
            )
            .unwrap();
    }
    assert_eq!(world.task_num_active(), 100);
    world.task_complete().unwrap();
    assert_eq!(world.task_num_active(), 0);
    assert_eq!(world.get_value::<u64>(&x).unwrap(), 100);
    world.segment_free(x).unwrap();
}

#[test]
#[serial]
fn readers_between_writers_see_the_earlier_write() {
    let world = builder(4).build().unwrap();
    let x = world.segment_alloc_local(8).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for round in 1..=5u64 {
        world
            .task_create(&[Dependency::output(x)], Priority::Low, move |ctx| async move {
                ctx.runtime().put_value(&x, round).unwrap();
            })
            .unwrap();
        for _ in 0..4 {
            let seen = seen.clone();
            world
                .task_create(&[Dependency::input(x)], Priority::Low, move |ctx| async move {
                    let v: u64 = ctx.runtime().get_value(&x).unwrap();
                    seen.lock().push((round, v));
                })
                .unwrap();
        }
    }
    world.task_complete().unwrap();
    let seen = seen.lock();
    assert_eq!(seen.len(), 20);
    assert!(seen.iter().all(|(round, v)| round == v));
    world.segment_free(x).unwrap();
}

#[test]
#[serial]
fn remote_chain_alternates_units() {
    let results = builder(2).launch(2, |world| {
        let me = world.my_unit();
        let other = 1 - me;
        let seg = world.segment_alloc_sym(world.team_all(), 11 * 8).unwrap();
        world.put_slice(&seg.with_unit(me), &[0u64; 11]).unwrap();
        world.barrier(world.team_all()).unwrap();
        for i in 1..=10i64 {
            let local = seg.with_unit(me).add_elems::<u64>(i);
            let remote = seg.with_unit(other).add_elems::<u64>(i - 1);
            world
                .task_create(
                    &[Dependency::output(local), Dependency::input(remote)],
                    Priority::Low,
                    move |ctx| async move {
                        let rt = ctx.runtime();
                        let v: u64 = rt.get_value(&remote).unwrap();
                        rt.put_value(&local, v + 1).unwrap();
                    },
                )
                .unwrap();
            world.task_phase_advance().unwrap();
        }
        assert_eq!(world.task_phase(), 10);
        world.task_complete().unwrap();
        assert_eq!(world.task_phase(), 0);
        let v = world
            .get_value::<u64>(&seg.with_unit(me).add_elems::<u64>(10))
            .unwrap();
        world.barrier(world.team_all()).unwrap();
        world.segment_free(seg).unwrap();
        v
    });
    assert_eq!(results, vec![10, 10]);
}

#[test]
#[serial]
fn cancel_broadcast_stops_every_unit() {
    let n = 4;
    let counts = builder(1).launch(n, |world| {
        let me = world.my_unit();
        let seg = world.segment_alloc_sym(world.team_all(), 8).unwrap();
        let mine = seg.with_unit(me);
        world.put_value(&mine, 0u64).unwrap();
        world.barrier(world.team_all()).unwrap();
        for i in 0..100u64 {
            let mut deps = vec![Dependency::output(mine)];
            if me != 0 {
                deps.push(Dependency::input(seg.with_unit(0)));
            } else if i > 0 {
                for unit in 1..n {
                    deps.push(Dependency::input(seg.with_unit(unit)).at_phase(i - 1));
                }
            }
            world
                .task_create(&deps, Priority::Low, move |ctx| async move {
                    if me == 0 && i == 5 {
                        ctx.cancel_bcast().await;
                    }
                    let rt = ctx.runtime();
                    let v: u64 = rt.get_value(&mine).unwrap();
                    rt.put_value(&mine, v + 1).unwrap();
                })
                .unwrap();
            world.task_phase_advance().unwrap();
        }
        world.task_complete().unwrap();
        assert!(!world.task_should_abort());
        let count = world.get_value::<u64>(&mine).unwrap();
        world.barrier(world.team_all()).unwrap();
        world.segment_free(seg).unwrap();
        count
    });
    assert_eq!(counts, vec![5; n]);
}

#[test]
#[serial]
fn cancel_barrier_stops_local_tasks() {
    let counts = builder(1).launch(2, |world| {
        let x = world.segment_alloc_local(8).unwrap();
        world.put_value(&x, 0u64).unwrap();
        for i in 0..10u64 {
            world
                .task_create(&[Dependency::inout(x)], Priority::Low, move |ctx| async move {
                    if i == 3 {
                        ctx.cancel_barrier().await;
                    }
                    let rt = ctx.runtime();
                    let v: u64 = rt.get_value(&x).unwrap();
                    rt.put_value(&x, v + 1).unwrap();
                })
                .unwrap();
        }
        world.task_complete().unwrap();
        let count = world.get_value::<u64>(&x).unwrap();
        world.segment_free(x).unwrap();
        count
    });
    assert_eq!(counts, vec![3, 3]);
}

#[test]
#[serial]
fn task_wait_returns_the_result() {
    let world = builder(2).build().unwrap();
    let start = Instant::now();
    let handle = world
        .task_create_handle(&[], Priority::Low, |_ctx| async move {
            std::thread::sleep(Duration::from_millis(10));
            42
        })
        .unwrap();
    assert_eq!(world.task_wait(handle).unwrap(), Some(42));
    assert!(start.elapsed() >= Duration::from_millis(10));
    world.task_complete().unwrap();
}

#[test]
#[serial]
fn direct_dependencies_order_tasks() {
    let world = builder(4).build().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let order = order.clone();
        world
            .task_create_handle(&[], Priority::Low, move |_ctx| async move {
                std::thread::sleep(Duration::from_millis(5));
                order.lock().push("first");
            })
            .unwrap()
    };
    let second = {
        let order = order.clone();
        world
            .task_create_handle(
                &[Dependency::direct(first.task_ref()), Dependency::ignore()],
                Priority::Low,
                move |ctx| async move {
                    order.lock().push("second");
                    ctx.runtime().task_status(ctx.task_ref())
                },
            )
            .unwrap()
    };
    assert_eq!(world.task_wait(second).unwrap(), Some(Some(TaskStatus::Running)));
    assert_eq!(world.task_wait(first).unwrap(), Some(()));
    world.task_complete().unwrap();
    assert_eq!(*order.lock(), vec!["first", "second"]);
}

#[test]
#[serial]
fn high_priority_tasks_run_first() {
    let world = builder(1).build().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = order.clone();
        world
            .task_create(&[], Priority::Low, move |_ctx| async move {
                order.lock().push(i);
            })
            .unwrap();
    }
    {
        let order = order.clone();
        world
            .task_create(&[], Priority::High, move |_ctx| async move {
                order.lock().push(100);
            })
            .unwrap();
    }
    world.task_complete().unwrap();
    let order = order.lock();
    assert_eq!(order.len(), 6);
    assert_eq!(order[0], 100);
}

#[test]
#[serial]
fn tasks_may_create_tasks() {
    let world = builder(3).build().unwrap();
    let cnt = Arc::new(AtomicUsize::new(0));
    {
        let cnt = cnt.clone();
        world
            .task_create(&[], Priority::Low, move |ctx| async move {
                for _ in 0..10 {
                    let cnt = cnt.clone();
                    ctx.create(&[], Priority::Low, move |ctx| async move {
                        ctx.yield_now().await;
                        cnt.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            })
            .unwrap();
    }
    world.task_complete().unwrap();
    assert_eq!(cnt.load(Ordering::SeqCst), 10);
    assert_eq!(world.task_num_threads(), 3);
}

#[test]
#[serial]
fn repeated_yields_let_other_tasks_finish() {
    let world = builder(1).build().unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let (done, seen) = (done.clone(), seen.clone());
        world
            .task_create(&[], Priority::Low, move |ctx| async move {
                for _ in 0..4 {
                    let done = done.clone();
                    ctx.create(&[], Priority::High, move |_ctx| async move {
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
                ctx.yield_for(0).await;
                ctx.yield_for(16).await;
                seen.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
            })
            .unwrap();
    }
    world.task_complete().unwrap();
    // high-priority tasks are always picked before a yielded low one
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}

#[test]
#[serial]
fn blocked_tasks_report_created() {
    let world = builder(1).build().unwrap();
    let x = world.segment_alloc_local(8).unwrap();
    let writer = world
        .task_create_handle(&[Dependency::output(x)], Priority::Low, |_ctx| async move {})
        .unwrap();
    let reader = world
        .task_create_handle(&[Dependency::input(x)], Priority::Low, |_ctx| async move {})
        .unwrap();
    assert_eq!(world.task_status(reader.task_ref()), Some(TaskStatus::Created));
    assert_eq!(world.task_status(writer.task_ref()), Some(TaskStatus::Runnable));
    let reader_ref = reader.task_ref();
    drop(reader);
    drop(writer);
    world.task_complete().unwrap();
    assert_eq!(world.task_status(reader_ref), None);
    world.segment_free(x).unwrap();
}

#[test]
#[serial]
fn task_complete_is_restricted_to_the_master_thread() {
    let world = builder(1).build().unwrap();
    let rt = world.runtime();
    let res = std::thread::spawn(move || rt.task_complete()).join().unwrap();
    assert!(matches!(res, Err(DartError::InvalidArgument(_))));
    world.task_complete().unwrap();
}

#[test]
#[serial]
fn dependencies_on_null_pointers_fail() {
    let world = builder(1).build().unwrap();
    let res = world.task_create(
        &[Dependency::input(dart::GlobalPtr::NULL)],
        Priority::Low,
        |_ctx| async move {},
    );
    assert!(matches!(res, Err(DartError::InvalidArgument(_))));

    // a valid dependency ahead of the bad one must not let the action run
    let x = world.segment_alloc_local(8).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let res = world.task_create(
        &[Dependency::output(x), Dependency::input(dart::GlobalPtr::NULL)],
        Priority::High,
        move |_ctx| async move { flag.store(true, Ordering::SeqCst) },
    );
    assert!(matches!(res, Err(DartError::InvalidArgument(_))));
    world.task_complete().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(world.task_num_active(), 0);

    // later tasks on the same pointer are not blocked by the rejected one
    let flag = ran.clone();
    world
        .task_create(&[Dependency::input(x)], Priority::Low, move |_ctx| async move {
            flag.store(true, Ordering::SeqCst)
        })
        .unwrap();
    world.task_complete().unwrap();
    assert!(ran.load(Ordering::SeqCst));
    world.segment_free(x).unwrap();
}
