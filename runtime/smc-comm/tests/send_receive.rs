//! Integration tests for the send paths: correlation, cancellation,
//! compensation and ring-full retry

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::*;
use smc_comm::layout::{status, QUEUE_CAPACITY};
use smc_comm::sim::{SecurePeer, DEVICE_CONTEXT_BASE};
use smc_comm::*;
use smc_platform::PAGE_SIZE;

#[test]
fn test_round_trip_and_device_context() {
    let _serial = serial();
    let rig = Rig::new();
    SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);

    let conn = Connection::new();
    let create = CommandMessage::new(MessageType::CreateDeviceContext);
    let answer = monitor.send_receive(&create, &conn, None).unwrap();
    assert_eq!(answer.status, status::S_SUCCESS);
    assert_eq!(
        conn.state(),
        DeviceContextState::Valid {
            device_context: DEVICE_CONTEXT_BASE + 1
        }
    );

    let answer = monitor.send_receive(&invoke(0xABCD), &conn, None).unwrap();
    assert_eq!(answer.kind(), Some(MessageType::InvokeClientCommand));
    assert_eq!(answer.body[0], 0xABCD);
    assert_eq!(monitor.pending_operations(), 0);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

#[test]
fn test_messages_checked_against_connection_state() {
    let _serial = serial();
    let rig = Rig::new();
    SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();

    let conn = Connection::new();
    assert!(matches!(
        monitor.send_receive(&CommandMessage::new(MessageType::CreateDeviceContext), &conn, None),
        Err(CommError::NotStarted)
    ));

    start_active(&monitor);
    assert!(matches!(
        monitor.send_receive(&invoke(1), &conn, None),
        Err(CommError::MessageRejected)
    ));
    assert!(matches!(
        monitor.send(&CommandMessage::prepare_shutdown(), &conn, None),
        Err(CommError::MessageRejected)
    ));

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

#[test]
fn test_fire_and_forget_send() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    let before = control.stats();
    monitor.send(&invoke(5), &conn, None).unwrap();
    wait_until("command consumed", || control.stats().commands > before.commands);
    assert_eq!(control.stats().answers, before.answers);
    assert_eq!(monitor.pending_operations(), 0);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Test that concurrent callers each observe only their own answer
#[test]
fn test_concurrent_callers_no_cross_talk() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);
    control.reverse_answers(true);

    const CALLERS: u32 = 8;
    const ROUNDS: u32 = 64;
    thread::scope(|s| {
        for caller in 0..CALLERS {
            let monitor = &monitor;
            let conn = &conn;
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let tag = (caller << 16) | round;
                    let answer = monitor.send_receive(&invoke(tag), conn, None).unwrap();
                    assert_eq!(answer.body[0], tag);
                }
            });
        }
    });

    assert_eq!(monitor.pending_operations(), 0);
    assert_eq!(control.stats().answers as u32, 1 + CALLERS * ROUNDS);
    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Test that a batch of answers drained newest first still reaches each caller
#[test]
fn test_answers_drained_out_of_order() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    const CALLERS: u32 = 8;
    control.hold_answers(true);
    control.reverse_answers(true);
    thread::scope(|s| {
        let waiters: Vec<_> = (0..CALLERS)
            .map(|tag| {
                let monitor = &monitor;
                let conn = &conn;
                s.spawn(move || monitor.send_receive(&invoke(tag), conn, None))
            })
            .collect();
        wait_until("batch consumed", || {
            monitor.pending_operations() == CALLERS as usize && control.stats().commands == 1 + CALLERS as usize
        });
        control.hold_answers(false);
        for (tag, waiter) in waiters.into_iter().enumerate() {
            let answer = waiter.join().unwrap().unwrap();
            assert_eq!(answer.body[0], tag as u32);
        }
    });
    assert_eq!(monitor.pending_operations(), 0);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

#[test]
fn test_killed_before_send() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    let kill = KillSwitch::new();
    kill.kill();
    let commands = control.stats().commands;
    assert!(matches!(
        monitor.send_receive(&invoke(1), &conn, Some(&kill)),
        Err(CommError::Interrupted)
    ));
    assert!(matches!(monitor.send(&invoke(2), &conn, Some(&kill)), Err(CommError::Interrupted)));
    assert_eq!(monitor.pending_operations(), 0);
    assert_eq!(control.stats().commands, commands);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Test that a device context created for a killed caller is destroyed
#[test]
fn test_kill_compensates_created_context() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);

    control.hold_answers(true);
    let conn = Connection::new();
    let kill = KillSwitch::new();
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| {
            let create = CommandMessage::new(MessageType::CreateDeviceContext);
            monitor.send_receive(&create, &conn, Some(&kill))
        });
        wait_until("context created", || control.stats().live_device_contexts == 1);
        kill.kill();
        waiter.join().unwrap()
    });
    assert!(matches!(result, Err(CommError::Interrupted)));
    assert_eq!(conn.state(), DeviceContextState::NoDeviceContext);
    assert_eq!(monitor.pending_operations(), 1);

    control.hold_answers(false);
    wait_until("orphan settled", || monitor.pending_operations() == 0);
    wait_until("context destroyed", || control.stats().live_device_contexts == 0);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Rule that would tear down its own teardown answers
struct DestroyAgain;

impl CompensationRule for DestroyAgain {
    fn compensate(&self, answer: &AnswerMessage) -> Option<CommandMessage> {
        (answer.kind() == Some(MessageType::DestroyDeviceContext))
            .then(|| CommandMessage::new(MessageType::DestroyDeviceContext).with_body(&[answer.body[0]]))
    }
}

/// Test that an orphan is compensated once even if a rule matches the teardown
#[test]
fn test_compensation_issued_once() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.builder().compensation_rule(DestroyAgain).build().unwrap();
    start_active(&monitor);

    control.hold_answers(true);
    let conn = Connection::new();
    let kill = KillSwitch::new();
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| {
            let create = CommandMessage::new(MessageType::CreateDeviceContext);
            monitor.send_receive(&create, &conn, Some(&kill))
        });
        wait_until("context created", || control.stats().live_device_contexts == 1);
        kill.kill();
        waiter.join().unwrap()
    });
    assert!(matches!(result, Err(CommError::Interrupted)));

    control.hold_answers(false);
    wait_until("orphan settled", || monitor.pending_operations() == 0);
    let stats = control.stats();
    assert_eq!(stats.live_device_contexts, 0);
    // The create and exactly one teardown
    assert_eq!(stats.commands, 2);
    assert_eq!(stats.answers, 2);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Test that a killed caller whose answer carries no teardown leaves nothing
#[test]
fn test_kill_without_compensation() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    control.hold_answers(true);
    let kill = KillSwitch::new();
    let answers = control.stats().answers;
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| monitor.send_receive(&invoke(9), &conn, Some(&kill)));
        wait_until("invoke consumed", || monitor.pending_operations() == 1 && control.stats().commands >= 2);
        kill.kill();
        waiter.join().unwrap()
    });
    assert!(matches!(result, Err(CommError::Interrupted)));

    control.hold_answers(false);
    wait_until("orphan released", || monitor.pending_operations() == 0);
    assert_eq!(control.stats().answers, answers + 1);
    assert_eq!(control.stats().live_device_contexts, 1);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Test that the 33rd command waits in the retry loop until a slot frees
#[test]
fn test_ring_full_retries_through_hook() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let retries = Arc::new(AtomicUsize::new(0));
    let monitor = {
        let retries = retries.clone();
        rig.builder()
            .retry_hook(move || {
                retries.fetch_add(1, Ordering::SeqCst);
                thread::yield_now();
            })
            .build()
            .unwrap()
    };
    start_active(&monitor);
    let conn = open_connection(&monitor);

    control.hold_commands(true);
    for tag in 0..QUEUE_CAPACITY {
        monitor.send(&invoke(tag), &conn, None).unwrap();
    }
    assert_eq!(retries.load(Ordering::SeqCst), 0);

    let consumed = control.stats().commands;
    thread::scope(|s| {
        let sender = s.spawn(|| monitor.send(&invoke(QUEUE_CAPACITY), &conn, None));
        wait_until("sender retrying", || retries.load(Ordering::SeqCst) > 0);
        assert!(!sender.is_finished());
        control.hold_commands(false);
        sender.join().unwrap().unwrap();
    });
    wait_until("ring drained", || control.stats().commands == consumed + QUEUE_CAPACITY as usize + 1);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

#[test]
fn test_ring_full_retry_is_killable() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    control.hold_commands(true);
    for tag in 0..QUEUE_CAPACITY {
        monitor.send(&invoke(tag), &conn, None).unwrap();
    }
    let kill = KillSwitch::new();
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| monitor.send_receive(&invoke(99), &conn, Some(&kill)));
        wait_until("entry registered", || monitor.pending_operations() == 1);
        kill.kill();
        waiter.join().unwrap()
    });
    assert!(matches!(result, Err(CommError::Interrupted)));
    // Never published, so the entry is gone at once
    assert_eq!(monitor.pending_operations(), 0);

    control.hold_commands(false);
    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Test that callers still waiting when the channel stops are released
#[test]
fn test_shutdown_aborts_waiting_callers() {
    let _serial = serial();
    let rig = Rig::new();
    let control = SecurePeer::new().install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    control.hold_answers(true);
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| monitor.send_receive(&invoke(3), &conn, None));
        wait_until("entry registered", || monitor.pending_operations() == 1);
        monitor.power_management(PowerOperation::Shutdown).unwrap();
        waiter.join().unwrap()
    });
    assert!(matches!(result, Err(CommError::ChannelClosed)));
    assert_eq!(monitor.pending_operations(), 0);
}

#[test]
fn test_error_status_is_an_answer() {
    let _serial = serial();
    let rig = Rig::new();
    SecurePeer::new()
        .with_responder(|cmd: &CommandMessage| {
            let kind = cmd.kind().unwrap_or(MessageType::InvokeClientCommand);
            let code = if kind == MessageType::InvokeClientCommand {
                status::S_ERROR_BAD_STATE
            } else {
                status::S_SUCCESS
            };
            AnswerMessage::new(kind, 0, code)
        })
        .install(&rig.platform);
    let monitor = rig.monitor();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    let answer = monitor.send_receive(&invoke(1), &conn, None).unwrap();
    assert_eq!(answer.status, status::S_ERROR_BAD_STATE);

    monitor.power_management(PowerOperation::Shutdown).unwrap();
}

/// Test that ranged mode flushes the connection's buffers for client messages
#[test]
fn test_ranged_mode_flushes_client_buffers() {
    let _serial = serial();
    let rig = Rig::new();
    SecurePeer::new().install(&rig.platform);
    let config = MonitorConfig {
        cache_flush: CacheFlushMode::SharedRanges,
        ..MonitorConfig::default()
    };
    let monitor = rig.builder().config(config).build().unwrap();
    start_active(&monitor);
    let conn = open_connection(&monitor);

    let (_, filled) = conn
        .shmem()
        .register(monitor.memory(), None, 2 * PAGE_SIZE, ShmemFlags::INPUT | ShmemFlags::OUTPUT)
        .unwrap();
    monitor.send_receive(&invoke(1), &conn, None).unwrap();
    assert!(rig
        .platform
        .range_flushes()
        .contains(&(filled.phys_addr, 2 * PAGE_SIZE)));

    monitor.power_management(PowerOperation::Shutdown).unwrap();
    conn.shmem().release_all(monitor.memory());
    assert_eq!(rig.mem.live_allocations(), 0);
}
