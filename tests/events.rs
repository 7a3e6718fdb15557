//! Edge-event callbacks and waits through the simulated driver.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::thread;
use std::time::{Duration, Instant};

use sbc_gpio::gpio::{
    CallbackId, CancelToken, Error, GpioController, PinEventTypes, PinMode, PinNumberingScheme,
    PinValue, SimulatedDriver,
};

fn controller() -> (GpioController, SimulatedDriver) {
    let driver = SimulatedDriver::new();
    let stimulus = driver.clone();

    (
        GpioController::with_driver(PinNumberingScheme::Logical, driver),
        stimulus,
    )
}

// Minimal executor for the async wait tests. The future is completed by a
// background thread, so polling at an interval is good enough.
fn block_on<F: Future>(fut: F) -> F::Output {
    fn noop_raw_waker() -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }

    static VTABLE: RawWakerVTable =
        RawWakerVTable::new(|_| noop_raw_waker(), |_| {}, |_| {}, |_| {});

    let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
    let mut cx = Context::from_waker(&waker);

    let mut fut = Box::pin(fut);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::sleep(Duration::from_millis(1)),
        }
    }
}

#[test]
fn rising_callback_fires_once_per_edge() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(7, PinMode::Input).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let cb_events = events.clone();
    controller
        .register_callback(7, PinEventTypes::RISING, move |event| {
            cb_events.lock().unwrap().push(event);
        })
        .unwrap();

    stimulus.drive(7, PinValue::High).unwrap();
    stimulus.drive(7, PinValue::Low).unwrap();
    stimulus.drive(7, PinValue::High).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    for event in events.iter() {
        assert_eq!(event.pin, 7);
        assert_eq!(event.edge, PinEventTypes::RISING);
    }
}

#[test]
fn duplicate_registration_fires_twice() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(3, PinMode::Input).unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let cb_counter = counter.clone();
        controller
            .register_callback(3, PinEventTypes::RISING, move |_| {
                cb_counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    stimulus.drive(3, PinValue::High).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn unregister_removes_exactly_one_registration() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(4, PinMode::Input).unwrap();

    let first_count = Arc::new(AtomicUsize::new(0));
    let second_count = Arc::new(AtomicUsize::new(0));

    let cb_count = first_count.clone();
    let first = controller
        .register_callback(4, PinEventTypes::RISING, move |_| {
            cb_count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let cb_count = second_count.clone();
    controller
        .register_callback(4, PinEventTypes::RISING, move |_| {
            cb_count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    controller.unregister_callback(4, first).unwrap();

    stimulus.drive(4, PinValue::High).unwrap();
    assert_eq!(first_count.load(Ordering::SeqCst), 0);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_can_unregister_itself() {
    let driver = SimulatedDriver::new();
    let stimulus = driver.clone();
    let controller = Arc::new(GpioController::with_driver(
        PinNumberingScheme::Logical,
        driver,
    ));
    controller.open_pin_with_mode(7, PinMode::Input).unwrap();

    // The id isn't known until registration returns, so the handler reads
    // it from a shared slot.
    let id_slot: Arc<Mutex<Option<CallbackId>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel();

    let cb_controller = controller.clone();
    let cb_id_slot = id_slot.clone();
    let id = controller
        .register_callback(7, PinEventTypes::RISING, move |event| {
            let id = cb_id_slot.lock().unwrap().unwrap();
            cb_controller.unregister_callback(event.pin, id).unwrap();
            tx.send(event).unwrap();
        })
        .unwrap();
    *id_slot.lock().unwrap() = Some(id);

    // Drive from another thread so a dispatch deadlock fails the test
    // instead of hanging it.
    let driver_thread = thread::spawn(move || {
        stimulus.drive(7, PinValue::High).unwrap();
        stimulus.drive(7, PinValue::Low).unwrap();
        stimulus.drive(7, PinValue::High).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(2))
        .expect("handler blocked unregistering itself");
    driver_thread.join().unwrap();

    // The registration is gone after the first edge.
    assert!(rx.try_recv().is_err());
}

#[test]
fn callbacks_filter_by_edge_type() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(5, PinMode::Input).unwrap();

    let falling = Arc::new(AtomicUsize::new(0));
    let cb_falling = falling.clone();
    controller
        .register_callback(5, PinEventTypes::FALLING, move |event| {
            assert_eq!(event.edge, PinEventTypes::FALLING);
            cb_falling.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    stimulus.drive(5, PinValue::High).unwrap();
    assert_eq!(falling.load(Ordering::SeqCst), 0);

    stimulus.drive(5, PinValue::Low).unwrap();
    assert_eq!(falling.load(Ordering::SeqCst), 1);
}

#[test]
fn close_removes_callbacks() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(6, PinMode::Input).unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let cb_counter = counter.clone();
    controller
        .register_callback(6, PinEventTypes::RISING, move |_| {
            cb_counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    controller.close_pin(6).unwrap();

    stimulus.drive(6, PinValue::High).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn registration_requires_open_pin_and_edge_types() {
    let (controller, _) = controller();

    assert!(matches!(
        controller.register_callback(2, PinEventTypes::RISING, |_| {}),
        Err(Error::PinNotOpen(2))
    ));

    controller.open_pin_with_mode(2, PinMode::Input).unwrap();
    assert!(matches!(
        controller.register_callback(2, PinEventTypes::empty(), |_| {}),
        Err(Error::InvalidEventTypes)
    ));
}

#[test]
fn wait_times_out_without_stimulus() {
    let (controller, _) = controller();
    controller.open_pin_with_mode(1, PinMode::Input).unwrap();

    let started = Instant::now();
    let result = controller
        .wait_for_event(1, PinEventTypes::RISING, Some(Duration::from_millis(50)))
        .unwrap();

    assert!(result.timed_out);
    assert!(result.event_types.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn wait_observes_a_matching_edge() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(8, PinMode::Input).unwrap();

    let driver_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        stimulus.drive(8, PinValue::High).unwrap();
    });

    let result = controller
        .wait_for_event(8, PinEventTypes::RISING, Some(Duration::from_secs(2)))
        .unwrap();

    driver_thread.join().unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.event_types, PinEventTypes::RISING);
}

#[test]
fn wait_ignores_unsubscribed_edges() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(9, PinMode::Input).unwrap();

    // Drive high, so the only transition during the wait is a falling edge.
    stimulus.drive(9, PinValue::High).unwrap();

    let driver_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        stimulus.drive(9, PinValue::Low).unwrap();
    });

    let result = controller
        .wait_for_event(9, PinEventTypes::RISING, Some(Duration::from_millis(200)))
        .unwrap();

    driver_thread.join().unwrap();
    assert!(result.timed_out);
}

#[test]
fn cancellation_ends_the_wait() {
    let (controller, _) = controller();
    controller.open_pin_with_mode(10, PinMode::Input).unwrap();

    let cancel = CancelToken::new().unwrap();
    let canceller = cancel.clone();
    let cancel_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        canceller.cancel();
    });

    let started = Instant::now();
    let result = controller
        .wait_for_event_cancellable(10, PinEventTypes::RISING, &cancel)
        .unwrap();

    cancel_thread.join().unwrap();
    assert!(result.timed_out);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn async_wait_resolves_on_stimulus() {
    let (controller, stimulus) = controller();
    controller.open_pin_with_mode(11, PinMode::Input).unwrap();

    let driver_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        stimulus.drive(11, PinValue::High).unwrap();
    });

    let future = controller
        .wait_for_event_async(11, PinEventTypes::RISING, Some(Duration::from_secs(2)))
        .unwrap();
    let result = block_on(future).unwrap();

    driver_thread.join().unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.event_types, PinEventTypes::RISING);
}

#[test]
fn async_wait_resolves_on_timeout() {
    let (controller, _) = controller();
    controller.open_pin_with_mode(12, PinMode::Input).unwrap();

    let future = controller
        .wait_for_event_async(12, PinEventTypes::RISING, Some(Duration::from_millis(50)))
        .unwrap();
    let result = block_on(future).unwrap();

    assert!(result.timed_out);
}

#[test]
fn async_wait_can_be_cancelled() {
    let (controller, _) = controller();
    controller.open_pin_with_mode(13, PinMode::Input).unwrap();

    let future = controller
        .wait_for_event_async(13, PinEventTypes::RISING, None)
        .unwrap();
    future.cancel();

    let result = block_on(future).unwrap();
    assert!(result.timed_out);
}

#[test]
fn callbacks_and_waits_are_mutually_exclusive() {
    let (controller, _) = controller();
    controller.open_pin_with_mode(14, PinMode::Input).unwrap();

    controller
        .register_callback(14, PinEventTypes::RISING, |_| {})
        .unwrap();

    assert!(matches!(
        controller.wait_for_event(14, PinEventTypes::RISING, Some(Duration::from_millis(10))),
        Err(Error::PinBusy(14))
    ));
}
