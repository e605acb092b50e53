//! Coordinated motion over simulated soft axes with real travel delays.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use beamline_core::positioner::{MoveOptions, Positioner, SoftPositioner};
use beamline_core::pseudo::PseudoPositioner;
use beamline_core::{Event, HalError};

fn delayed(name: &str, delay_ms: u64) -> Arc<dyn Positioner> {
    Arc::new(SoftPositioner::new(name).with_delay(Duration::from_millis(delay_ms)))
}

/// Two-theta style mapping: pseudo `[energy]` drives two axes whose
/// positions are a scaled pair of the request.
fn analyzer(concurrent: bool, delay_ms: u64) -> Arc<PseudoPositioner> {
    let mut builder = PseudoPositioner::builder("analyzer")
        .axis("energy")
        .real(delayed("theta", delay_ms))
        .real(delayed("ttheta", delay_ms))
        .forward(|p| Ok(vec![p[0] / 2.0, p[0]]))
        .inverse(|r| Ok(vec![r[1]]));
    if concurrent {
        builder = builder.concurrent();
    }
    builder.build().unwrap()
}

#[test]
fn concurrent_legs_overlap_in_time() {
    let pseudo = analyzer(true, 80);
    let start = std::time::Instant::now();
    let status = pseudo.move_to(&[10.0], MoveOptions::new()).unwrap();
    status.wait(Some(Duration::from_secs(2))).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(pseudo.position(), vec![10.0]);
    // Both 80 ms legs ran at once; a sequential chain would need ~160 ms.
    assert!(elapsed < Duration::from_millis(150), "took {elapsed:?}");
}

#[test]
fn concurrent_move_stays_moving_until_slower_leg_lands() {
    let fast = delayed("fast", 40);
    let slow = delayed("slow", 250);
    let pseudo = PseudoPositioner::builder("pair")
        .axis("sum")
        .axis("diff")
        .real(fast.clone())
        .real(slow.clone())
        .forward(|p| Ok(vec![p[0] + p[1], p[0] - p[1]]))
        .inverse(|r| Ok(vec![(r[0] + r[1]) / 2.0, (r[0] - r[1]) / 2.0]))
        .concurrent()
        .build()
        .unwrap();

    let status = pseudo.move_to(&[2.0, 1.0], MoveOptions::new()).unwrap();
    // Well after the fast leg has landed, the slow leg is still traveling
    // and the coordinated move must still report in motion.
    std::thread::sleep(Duration::from_millis(120));
    assert!(!fast.moving());
    assert!(slow.moving());
    assert!(pseudo.moving());

    status.wait(Some(Duration::from_secs(2))).unwrap();
    assert!(!pseudo.moving());
    assert_eq!(pseudo.position(), vec![2.0, 1.0]);
}

#[test]
fn sequential_legs_run_back_to_back() {
    let pseudo = analyzer(false, 60);
    let start = std::time::Instant::now();
    pseudo
        .move_to(&[4.0], MoveOptions::new().wait())
        .unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(110), "took {elapsed:?}");
    assert_eq!(pseudo.position(), vec![4.0]);
}

#[test]
fn blocking_move_with_callback_and_final_position() {
    let pseudo = analyzer(true, 30);
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let status = pseudo
        .move_to(
            &[6.0],
            MoveOptions::new()
                .wait()
                .on_complete(move || flag.store(true, Ordering::SeqCst)),
        )
        .unwrap();
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(status.finish_pos(), Some(vec![6.0]));
    assert_eq!(status.error(), Some(vec![0.0]));
    assert!(status.elapsed() > 0.0);
}

#[test]
fn pseudo_readback_tracks_reals_during_motion() {
    let pseudo = analyzer(true, 50);
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    pseudo
        .subscribe_readback(
            Arc::new(move |e: &Event| {
                if let Some(v) = &e.value {
                    sink.lock().push(v.clone());
                }
            }),
            false,
        )
        .unwrap();

    pseudo
        .move_to(&[8.0], MoveOptions::new())
        .unwrap()
        .wait(Some(Duration::from_secs(2)))
        .unwrap();

    let seen = updates.lock();
    assert!(!seen.is_empty());
    assert_eq!(*seen.last().unwrap(), serde_json::json!([8.0]));
}

#[test]
fn timed_out_coordinated_move_stops_the_reals() {
    let pseudo = analyzer(true, 400);
    let err = pseudo
        .move_to(
            &[5.0],
            MoveOptions::new().wait().timeout(Duration::from_millis(60)),
        )
        .unwrap_err();
    assert!(matches!(err, HalError::FailedStatus { .. }));
    assert!(!pseudo.moving());
    // The stop cancelled travel short of the target.
    std::thread::sleep(Duration::from_millis(450));
    assert_ne!(pseudo.position(), vec![5.0]);
}
