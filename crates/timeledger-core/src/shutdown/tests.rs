use super::*;

#[tokio::test]
async fn test_shutdown_phases() {
    let controller = ShutdownController::new();
    assert_eq!(controller.phase(), ShutdownPhase::Running);
    assert!(controller.is_accepting_work());

    assert!(controller.shutdown().await);

    assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    assert!(!controller.is_accepting_work());
    assert!(controller.is_shutting_down());
}

#[tokio::test]
async fn test_task_guard_counts() {
    let controller = ShutdownController::new();
    {
        let _a = controller.register_task().unwrap();
        let b = controller.register_task().unwrap();
        assert_eq!(controller.active_task_count(), 2);
        b.complete();
        assert_eq!(controller.active_task_count(), 1);
    }
    assert_eq!(controller.active_task_count(), 0);
}

#[tokio::test]
async fn test_no_new_tasks_after_shutdown() {
    let controller = ShutdownController::new();
    controller.shutdown().await;
    assert!(controller.register_task().is_none());
}

#[tokio::test]
async fn test_shutdown_waits_for_guard() {
    let controller = ShutdownController::new();
    let guard = controller.register_task().unwrap();
    let token = guard.token();

    let worker = tokio::spawn(async move {
        token.cancelled().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
    });

    assert!(controller.shutdown().await);
    assert_eq!(controller.active_task_count(), 0);
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_times_out() {
    let controller = ShutdownController::with_timeout(Duration::from_secs(1));
    let _stuck = controller.register_task().unwrap();
    let mut phases = controller.subscribe();

    assert!(!controller.shutdown().await);

    let mut seen = Vec::new();
    while let Ok(phase) = phases.try_recv() {
        seen.push(phase);
    }
    assert!(seen.contains(&ShutdownPhase::Terminating));
    assert_eq!(seen.last(), Some(&ShutdownPhase::Terminated));
}

#[tokio::test]
async fn test_second_shutdown_is_noop() {
    let controller = ShutdownController::new();
    let (a, b) = tokio::join!(controller.shutdown(), controller.shutdown());
    assert!(a && b);
    assert_eq!(controller.phase(), ShutdownPhase::Terminated);
}

#[test]
fn test_force_shutdown() {
    let controller = ShutdownController::new();
    let token = controller.token();
    controller.force_shutdown();
    assert_eq!(controller.phase(), ShutdownPhase::Terminated);
    assert!(token.is_cancelled());
}
