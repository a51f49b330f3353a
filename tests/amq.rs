use dart::{
    action_name, record_len, register_action, ActionContext, AmqImpl, Backend, DartError,
    WorldBuilder,
};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_UNITS: usize = 4;

static RECEIVED: Mutex<Vec<(usize, u64)>> = parking_lot::const_mutex(Vec::new());

lazy_static::lazy_static! {
    static ref PER_UNIT: Vec<AtomicUsize> = (0..MAX_UNITS).map(|_| AtomicUsize::new(0)).collect();
    static ref SENDER_SUM: Vec<AtomicUsize> = (0..MAX_UNITS).map(|_| AtomicUsize::new(0)).collect();
}

fn reset_counters() {
    RECEIVED.lock().clear();
    for cnt in PER_UNIT.iter().chain(SENDER_SUM.iter()) {
        cnt.store(0, Ordering::SeqCst);
    }
}

fn record_value(ctx: &ActionContext<'_>, payload: &[u8]) {
    let mut val = [0u8; 8];
    val.copy_from_slice(&payload[..8]);
    RECEIVED.lock().push((ctx.sender(), u64::from_le_bytes(val)));
}
register_action!(record_value);

fn count_message(ctx: &ActionContext<'_>, _payload: &[u8]) {
    let me = ctx.runtime().my_unit();
    PER_UNIT[me].fetch_add(1, Ordering::SeqCst);
    SENDER_SUM[me].fetch_add(ctx.sender(), Ordering::SeqCst);
}
register_action!(count_message);

fn builder() -> WorldBuilder {
    WorldBuilder::new()
        .with_backend(Backend::Shmem)
        .with_threads(1)
        .with_deadlock_timeout(30.0)
}

fn full_ring_delivers_in_order(imp: AmqImpl) {
    reset_counters();
    builder().launch(2, |world| {
        let amq = world.amq_open_with(imp, 48, 16, world.team_all()).unwrap();
        assert_eq!(amq.queue_size(), 1024);
        assert_eq!(record_len(48), 64);
        let token = world.action_id(action_name!(record_value)).unwrap();
        if world.my_unit() == 0 {
            for i in 0..100u64 {
                let mut payload = [0u8; 48];
                payload[..8].copy_from_slice(&i.to_le_bytes());
                loop {
                    match amq.try_send(1, token, &payload) {
                        Ok(()) => break,
                        Err(DartError::Again) => {
                            amq.process().unwrap();
                            std::thread::yield_now();
                        }
                        Err(e) => panic!("try_send failed: {}", e),
                    }
                }
            }
        } else {
            while RECEIVED.lock().len() < 100 {
                amq.process().unwrap();
                std::thread::yield_now();
            }
        }
        amq.close().unwrap();
    });
    let received = RECEIVED.lock().clone();
    assert_eq!(received.len(), 100);
    assert!(received.iter().all(|(sender, _)| *sender == 0));
    let values: Vec<u64> = received.iter().map(|(_, v)| *v).collect();
    assert_eq!(values, (0..100).collect::<Vec<u64>>());
}

#[test]
#[serial]
fn nolock_queue_delivers_every_message_in_order() {
    full_ring_delivers_in_order(AmqImpl::NoLock);
}

#[test]
#[serial]
fn atomic_queue_delivers_every_message_in_order() {
    full_ring_delivers_in_order(AmqImpl::Atomic);
}

fn concurrent_senders_keep_their_own_order(imp: AmqImpl) {
    const PER_SENDER: u64 = 2000;
    reset_counters();
    builder().launch(4, |world| {
        // a 32-byte ring holds a single eight-byte message
        let amq = world.amq_open_with(imp, 0, 2, world.team_all()).unwrap();
        assert_eq!(amq.queue_size(), 32);
        let token = world.action_id(action_name!(record_value)).unwrap();
        if world.my_unit() == 0 {
            while RECEIVED.lock().len() < 3 * PER_SENDER as usize {
                amq.process().unwrap();
                std::thread::yield_now();
            }
        } else {
            for i in 0..PER_SENDER {
                amq.send(0, token, &i.to_le_bytes()).unwrap();
            }
        }
        amq.close().unwrap();
    });
    let received = RECEIVED.lock().clone();
    assert_eq!(received.len(), 3 * PER_SENDER as usize);
    for sender in 1..4 {
        let values: Vec<u64> = received
            .iter()
            .filter(|(s, _)| *s == sender)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(values, (0..PER_SENDER).collect::<Vec<u64>>(), "sender {}", sender);
    }
}

#[test]
#[serial]
fn nolock_queue_keeps_per_sender_order() {
    concurrent_senders_keep_their_own_order(AmqImpl::NoLock);
}

#[test]
#[serial]
fn atomic_queue_keeps_per_sender_order() {
    concurrent_senders_keep_their_own_order(AmqImpl::Atomic);
}

#[test]
#[serial]
fn blocking_send_waits_for_room() {
    for imp in [AmqImpl::NoLock, AmqImpl::Atomic] {
        reset_counters();
        builder().launch(3, |world| {
            // room for two messages per ring
            let amq = world.amq_open_with(imp, 8, 2, world.team_all()).unwrap();
            let token = world.action_id(action_name!(count_message)).unwrap();
            for _ in 0..20 {
                for target in 0..world.num_units() {
                    if target != world.my_unit() {
                        amq.send(target, token, &[0u8; 8]).unwrap();
                    }
                }
            }
            amq.process_blocking().unwrap();
            assert_eq!(PER_UNIT[world.my_unit()].load(Ordering::SeqCst), 40);
            amq.close().unwrap();
        });
    }
}

#[test]
#[serial]
fn buffered_messages_arrive_after_process_blocking() {
    reset_counters();
    builder().launch(3, |world| {
        let amq = world.amq_open(16, 8, world.team_all()).unwrap();
        let token = world.action_id(action_name!(count_message)).unwrap();
        // twenty messages overflow one cached batch
        for _ in 0..20 {
            for target in 0..world.num_units() {
                if target != world.my_unit() {
                    amq.buffered_send(target, token, &[1u8; 16]).unwrap();
                }
            }
        }
        amq.process_blocking().unwrap();
        assert_eq!(PER_UNIT[world.my_unit()].load(Ordering::SeqCst), 40);
        amq.close().unwrap();
    });
}

#[test]
#[serial]
fn broadcast_reaches_every_other_unit() {
    let n = 4;
    reset_counters();
    builder().with_amq_impl(AmqImpl::Atomic).launch(n, |world| {
        let amq = world.amq_open(8, 4, world.team_all()).unwrap();
        let token = world.action_id(action_name!(count_message)).unwrap();
        amq.send_bcast(token, &[]).unwrap();
        amq.process_blocking().unwrap();
        let me = world.my_unit();
        assert_eq!(PER_UNIT[me].load(Ordering::SeqCst), n - 1);
        let others: usize = (0..n).filter(|u| *u != me).sum();
        assert_eq!(SENDER_SUM[me].load(Ordering::SeqCst), others);
        amq.close().unwrap();
    });
}

#[test]
#[serial]
fn senders_are_relative_to_the_queue_team() {
    reset_counters();
    builder().launch(4, |world| {
        let me = world.my_unit();
        let team = world
            .team_split(world.team_all(), (me % 2) as i64, me as i64)
            .unwrap()
            .unwrap();
        let amq = world.amq_open(8, 4, team).unwrap();
        assert_eq!(amq.team(), team);
        let token = world.action_id(action_name!(count_message)).unwrap();
        let peer = 1 - world.team_myid(team).unwrap();
        amq.send(peer, token, &[]).unwrap();
        amq.process_blocking().unwrap();
        assert_eq!(PER_UNIT[me].load(Ordering::SeqCst), 1);
        assert_eq!(SENDER_SUM[me].load(Ordering::SeqCst), peer);
        amq.close().unwrap();
        world.team_destroy(team).unwrap();
    });
}

#[test]
#[serial]
fn malformed_requests_are_invalid() {
    let world = builder().build().unwrap();
    assert!(matches!(
        world.action_id("no::such::action"),
        Err(DartError::NotFound(_))
    ));
    assert!(matches!(
        world.amq_open(8, 0, world.team_all()),
        Err(DartError::InvalidArgument(_))
    ));
    let amq = world.amq_open(8, 2, world.team_all()).unwrap();
    let token = world.action_id(action_name!(count_message)).unwrap();
    assert!(matches!(
        amq.try_send(0, token, &[0u8; 100]),
        Err(DartError::InvalidArgument(_))
    ));
    assert!(matches!(
        amq.try_send(1, token, &[0u8; 8]),
        Err(DartError::InvalidArgument(_))
    ));
    amq.close().unwrap();
}

#[test]
#[serial]
fn messages_to_self_run_locally() {
    reset_counters();
    let world = builder().build().unwrap();
    let amq = world.amq_open(8, 4, world.team_all()).unwrap();
    let token = world.action_id(action_name!(count_message)).unwrap();
    amq.send(0, token, &[]).unwrap();
    amq.send(0, token, &[]).unwrap();
    assert_eq!(amq.process().unwrap(), 2);
    assert_eq!(amq.process().unwrap(), 0);
    assert_eq!(PER_UNIT[0].load(Ordering::SeqCst), 2);
    amq.close().unwrap();
}
