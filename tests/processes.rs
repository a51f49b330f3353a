use dart::{Backend, ReduceOp, WorldBuilder};
use serial_test::serial;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

const NUM_UNITS: usize = 3;

/// Runs `test` of this binary once per unit, each as its own process.
fn spawn_job(test: &str, seq: usize) -> Vec<Child> {
    let exe = std::env::current_exe().unwrap();
    let job_id = (std::process::id() as usize * 16 + seq).to_string();
    (0..NUM_UNITS)
        .map(|unit| {
            Command::new(&exe)
                .args([test, "--exact", "--nocapture", "--test-threads=1"])
                .env("DART_NUM_UNITS", NUM_UNITS.to_string())
                .env("DART_UNIT_ID", unit.to_string())
                .env("DART_JOB_ID", &job_id)
                .env("DART_TASK_NUM_THREADS", "1")
                .env("DART_SHMEM_HEAP_SIZE", (32 << 20).to_string())
                .env("DART_LOCAL_HEAP_SIZE", (1 << 20).to_string())
                .spawn()
                .unwrap()
        })
        .collect()
}

fn wait_job(mut children: Vec<Child>) {
    let deadline = Instant::now() + Duration::from_secs(120);
    let mut failed = None;
    while !children.is_empty() && failed.is_none() && Instant::now() < deadline {
        let mut running = vec![];
        for mut child in children {
            match child.try_wait().unwrap() {
                Some(status) if !status.success() => failed = Some(status),
                Some(_) => {}
                None => running.push(child),
            }
        }
        children = running;
        std::thread::sleep(Duration::from_millis(20));
    }
    let timed_out = !children.is_empty();
    for child in children.iter_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
    assert_eq!(failed, None, "a unit process failed");
    assert!(!timed_out, "unit processes did not finish");
}

fn in_child() -> bool {
    std::env::var("DART_UNIT_ID").is_ok()
}

#[test]
#[serial]
fn units_in_separate_processes_share_segments() {
    if !in_child() {
        wait_job(spawn_job("units_in_separate_processes_share_segments", 1));
        return;
    }
    let world = WorldBuilder::new().with_backend(Backend::Shmem).build().unwrap();
    let (me, n) = (world.my_unit(), world.num_units());
    assert_eq!(n, NUM_UNITS);
    // a row of neighbour values followed by a row of counters
    let seg = world.segment_alloc_sym(world.team_all(), 16 * n).unwrap();
    let right = (me + 1) % n;
    world
        .put_value(&seg.with_unit(right).add_elems::<u64>(me as i64), 100 + me as u64)
        .unwrap();
    let handle = world
        .accumulate(
            &seg.with_unit(0).add_elems::<u64>((n + me) as i64),
            &[me as u64 + 1],
            ReduceOp::Sum,
        )
        .unwrap();
    world.wait(handle).unwrap();
    world.barrier(world.team_all()).unwrap();
    let left = (me + n - 1) % n;
    let got: u64 = world
        .get_value(&seg.with_unit(me).add_elems::<u64>(left as i64))
        .unwrap();
    assert_eq!(got, 100 + left as u64);
    if me == 0 {
        let mut row = vec![0u64; n];
        world
            .get_slice(&seg.with_unit(0).add_elems::<u64>(n as i64), &mut row)
            .unwrap();
        assert_eq!(row, (1..=n as u64).collect::<Vec<_>>());
    }

    let local = world.segment_alloc_local(8).unwrap();
    world.put_value(&local, me as u64 * 7).unwrap();
    world.barrier(world.team_all()).unwrap();
    let theirs: u64 = world.get_value(&local.with_unit(right)).unwrap();
    assert_eq!(theirs, right as u64 * 7);
    world.barrier(world.team_all()).unwrap();
    world.segment_free(local).unwrap();
    world.barrier(world.team_all()).unwrap();
    world.segment_free(seg).unwrap();
}

#[test]
#[serial]
fn teams_split_across_processes() {
    if !in_child() {
        wait_job(spawn_job("teams_split_across_processes", 2));
        return;
    }
    let world = WorldBuilder::new().with_backend(Backend::Shmem).build().unwrap();
    let me = world.my_unit();
    let team = world
        .team_split(world.team_all(), (me == 0) as i64, -(me as i64))
        .unwrap()
        .unwrap();
    let expected = if me == 0 { 1 } else { NUM_UNITS - 1 };
    assert_eq!(world.team_size(team).unwrap(), expected);
    let seg = world.segment_alloc_sym(team, 8).unwrap();
    world.fetch_and_op(&seg.with_unit(0), 1u64, ReduceOp::Sum).unwrap();
    world.barrier(team).unwrap();
    assert_eq!(world.get_value::<u64>(&seg.with_unit(0)).unwrap(), expected as u64);
    world.barrier(team).unwrap();
    world.segment_free(seg).unwrap();
    world.team_destroy(team).unwrap();
}
