//! Cross-queue dependencies and stage ordering within a frame.

mod common;

use common::{TestDevice, record_empty, small_config};
use redlilium_submit::{
    DummyConfig, ExecutionMode, GraphicsError, QueueKind, TimelineSemaphore,
};

#[test]
fn test_transfer_feeds_graphics_without_host_wait() {
    let t = TestDevice::with_depth(2);
    let mut context = t.context("upload");
    let uploaded = TimelineSemaphore::new(t.device.backend(), "uploaded").unwrap();

    let info = t.device.begin_frame(None).unwrap();
    context.reset(info.slot).unwrap();

    let copy = record_empty(&mut context, QueueKind::Transfer);
    let value = context
        .queue_transfer(copy, None, Some(&uploaded))
        .unwrap()
        .expect("signal value");
    let draw = record_empty(&mut context, QueueKind::Graphics);
    context.queue_graphics(draw, Some(uploaded.op(value)), None).unwrap();
    context.flush();

    let host_waits = t.backend.host_wait_count();
    let frame_value = t.device.end_frame(None, None).unwrap();
    assert_eq!(t.backend.host_wait_count(), host_waits);
    assert_eq!(frame_value, 2);

    let subs = t.backend.submissions();
    assert_eq!(subs.len(), 2);
    let frame_id = t.device.frame_semaphore().id();

    assert_eq!(subs[0].queue, QueueKind::Transfer);
    assert!(subs[0].signals.contains(&(uploaded.id(), value)));
    assert!(subs[0].signals.contains(&(frame_id, 1)));

    assert_eq!(subs[1].queue, QueueKind::Graphics);
    assert!(subs[1].waits.contains(&(uploaded.id(), value)));
    assert!(subs[1].waits.contains(&(frame_id, 1)));
    assert_eq!(subs[1].signals, vec![(frame_id, 2)]);

    assert_eq!(uploaded.current_value().unwrap(), value);
    assert!(t.backend.violations().is_empty());
}

#[test]
fn test_graphics_runs_after_transfer_when_pumped() {
    let t = TestDevice::new(
        DummyConfig::default().with_mode(ExecutionMode::Manual),
        small_config().with_buffering_depth(2),
    );
    let mut context = t.context("upload");
    let uploaded = TimelineSemaphore::new(t.device.backend(), "uploaded").unwrap();

    let info = t.device.begin_frame(None).unwrap();
    context.reset(info.slot).unwrap();

    let draw_first = record_empty(&mut context, QueueKind::Graphics);
    let copy = record_empty(&mut context, QueueKind::Transfer);
    let copy_id = copy.command_buffer().id();
    let draw_id = draw_first.command_buffer().id();

    let value = context
        .queue_transfer(copy, None, Some(&uploaded))
        .unwrap()
        .expect("signal value");
    context.queue_graphics(draw_first, Some(uploaded.op(value)), None).unwrap();
    context.flush();
    t.device.end_frame(None, None).unwrap();

    assert!(t.backend.executions().is_empty());
    assert_eq!(t.backend.execute_pending(), 2);
    assert_eq!(t.backend.executed_command_buffers(), vec![copy_id, draw_id]);
}

#[test]
fn test_stages_submit_transfer_compute_graphics() {
    let t = TestDevice::with_depth(2);
    let mut context = t.context("stages");

    let info = t.device.begin_frame(None).unwrap();
    context.reset(info.slot).unwrap();

    // Queued in reverse order on purpose
    for kind in [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer] {
        let handle = record_empty(&mut context, kind);
        match kind {
            QueueKind::Graphics => context.queue_graphics(handle, None, None).unwrap(),
            QueueKind::Compute => context.queue_compute(handle, None, None).unwrap(),
            QueueKind::Transfer => context.queue_transfer(handle, None, None).unwrap(),
        };
    }
    context.flush();
    assert_eq!(t.device.end_frame(None, None).unwrap(), 3);

    let frame_id = t.device.frame_semaphore().id();
    let subs = t.backend.submissions();
    let queues: Vec<QueueKind> = subs.iter().map(|s| s.queue).collect();
    assert_eq!(
        queues,
        vec![QueueKind::Transfer, QueueKind::Compute, QueueKind::Graphics]
    );

    assert!(subs[0].waits.is_empty());
    assert_eq!(subs[0].signals, vec![(frame_id, 1)]);
    assert_eq!(subs[1].waits, vec![(frame_id, 1)]);
    assert_eq!(subs[1].signals, vec![(frame_id, 2)]);
    // Waits on one semaphore collapse to the highest value
    assert_eq!(subs[2].waits, vec![(frame_id, 2)]);
    assert_eq!(subs[2].signals, vec![(frame_id, 3)]);

    let hardware: Vec<usize> = subs.iter().map(|s| s.hardware_queue).collect();
    assert_eq!(hardware, vec![2, 1, 0]);
}

#[test]
fn test_aliased_queues_share_one_hardware_queue() {
    let t = TestDevice::new(
        DummyConfig::default().with_single_queue(),
        small_config().with_buffering_depth(2),
    );
    let queues = t.device.queues();
    assert_eq!(queues.hardware_queue_count(), 1);
    for kind in QueueKind::ALL {
        assert!(queues.is_aliased(kind));
    }

    let mut context = t.context("aliased");
    for _ in 0..4 {
        let info = t.device.begin_frame(None).unwrap();
        context.reset(info.slot).unwrap();
        for kind in QueueKind::ALL {
            let handle = record_empty(&mut context, kind);
            match kind {
                QueueKind::Graphics => context.queue_graphics(handle, None, None).unwrap(),
                QueueKind::Compute => context.queue_compute(handle, None, None).unwrap(),
                QueueKind::Transfer => context.queue_transfer(handle, None, None).unwrap(),
            };
        }
        context.flush();
        t.device.end_frame(None, None).unwrap();
    }

    let subs = t.backend.submissions();
    assert_eq!(subs.len(), 12);
    assert!(subs.iter().all(|s| s.hardware_queue == 0));
    assert_eq!(queues.submission_count(QueueKind::Transfer), 12);
    assert!(t.backend.violations().is_empty(), "{:?}", t.backend.violations());
}

#[test]
fn test_extra_wait_holds_frame_back() {
    let t = TestDevice::with_depth(2);
    let mut context = t.context("main");
    let external = TimelineSemaphore::new(t.device.backend(), "external").unwrap();

    let info = t.device.begin_frame(None).unwrap();
    context.reset(info.slot).unwrap();
    let handle = record_empty(&mut context, QueueKind::Graphics);
    context.queue_graphics(handle, None, None).unwrap();
    context.flush();

    let value = t.device.end_frame(Some(external.op(5)), None).unwrap();
    assert_eq!(t.backend.pending_batches(), 1);
    assert!(!t.device.frame_semaphore().is_reached(value).unwrap());

    external.signal(5).unwrap();
    assert_eq!(t.backend.pending_batches(), 0);
    assert!(t.device.frame_semaphore().is_reached(value).unwrap());
}

#[test]
fn test_last_signal_tracks_each_queue() {
    let t = TestDevice::with_depth(2);
    let mut context = t.context("main");

    let info = t.device.begin_frame(None).unwrap();
    context.reset(info.slot).unwrap();
    let handle = record_empty(&mut context, QueueKind::Compute);
    context.queue_compute(handle, None, None).unwrap();
    context.flush();
    t.device.end_frame(None, None).unwrap();

    let queues = t.device.queues();
    let last = queues.last_signal(QueueKind::Compute).expect("compute signal");
    assert_eq!(last.key(), (t.device.frame_semaphore().id(), 1));
    assert!(queues.last_signal(QueueKind::Graphics).is_none());
    assert_eq!(queues.submission_count(QueueKind::Graphics), 0);
}

#[test]
fn test_signal_cannot_be_queued_ahead_of_a_later_stage() {
    let t = TestDevice::with_depth(2);
    let mut context = t.context("main");
    let user = TimelineSemaphore::new(t.device.backend(), "user").unwrap();

    let info = t.device.begin_frame(None).unwrap();
    context.reset(info.slot).unwrap();

    let draw = record_empty(&mut context, QueueKind::Graphics);
    assert_eq!(context.queue_graphics(draw, None, Some(&user)).unwrap(), Some(1));

    // Transfer and compute are submitted before graphics, so their higher
    // value would reach the GPU first
    let copy = record_empty(&mut context, QueueKind::Transfer);
    assert!(matches!(
        context.queue_transfer(copy, None, Some(&user)),
        Err(GraphicsError::InvalidParameter(_))
    ));
    let dispatch = record_empty(&mut context, QueueKind::Compute);
    assert!(matches!(
        context.queue_compute(dispatch, None, Some(&user)),
        Err(GraphicsError::InvalidParameter(_))
    ));
    assert_eq!(context.pending_count(QueueKind::Transfer), 0);
    assert_eq!(context.pending_count(QueueKind::Compute), 0);

    // A host signal would overtake the queued value as well
    assert!(matches!(
        user.signal(5),
        Err(GraphicsError::InvalidParameter(_))
    ));

    context.flush();
    t.device.end_frame(None, None).unwrap();
    assert_eq!(user.current_value().unwrap(), 1);
    assert_eq!(user.queued_signals(), 0);

    user.signal(5).unwrap();
    assert_eq!(user.current_value().unwrap(), 5);
    assert!(t.backend.violations().is_empty(), "{:?}", t.backend.violations());
}

#[test]
fn test_signal_queued_in_stage_order_across_frames() {
    let t = TestDevice::with_depth(2);
    let mut context = t.context("main");
    let user = TimelineSemaphore::new(t.device.backend(), "user").unwrap();

    for frame in 0..2u64 {
        let info = t.device.begin_frame(None).unwrap();
        context.reset(info.slot).unwrap();

        let copy = record_empty(&mut context, QueueKind::Transfer);
        let dispatch = record_empty(&mut context, QueueKind::Compute);
        let draw = record_empty(&mut context, QueueKind::Graphics);
        // Each frame starts over on transfer once the last one was submitted
        assert_eq!(
            context.queue_transfer(copy, None, Some(&user)).unwrap(),
            Some(frame * 3 + 1)
        );
        context.queue_compute(dispatch, None, Some(&user)).unwrap();
        context.queue_graphics(draw, None, Some(&user)).unwrap();
        context.flush();
        t.device.end_frame(None, None).unwrap();
    }

    assert_eq!(user.current_value().unwrap(), 6);
    assert!(t.backend.violations().is_empty(), "{:?}", t.backend.violations());
}
