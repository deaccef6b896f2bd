use sheet_export::{OperationRegistry, OperationStatus};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_progress_and_cancel() {
    let registry = Arc::new(OperationRegistry::default());
    let ids: Vec<_> = (0..16).map(|_| registry.register()).collect();

    let mut tasks = Vec::new();
    for (n, id) in ids.iter().copied().enumerate() {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            for current in 0..=1_000u64 {
                registry.update_progress(id, current, 1_000);
                if n % 2 == 0 && current == 500 {
                    registry.cancel(id);
                }
                tokio::task::yield_now().await;
            }
            if n % 2 == 1 {
                registry.mark_completed(id);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for (n, id) in ids.iter().enumerate() {
        let op = registry.status(*id).unwrap();
        if n % 2 == 0 {
            assert_eq!(op.status, OperationStatus::Cancelled);
            // updates after cancellation were dropped
            assert_eq!(op.progress.current, 500);
            assert_eq!(op.progress.percentage, 50);
        } else {
            assert_eq!(op.status, OperationStatus::Completed);
            assert_eq!(op.progress.percentage, 100);
        }
    }
}

#[tokio::test]
async fn test_percentage_never_divides_by_zero() {
    let registry = OperationRegistry::default();
    let id = registry.register();
    for current in [0, 1, 10_000] {
        registry.update_progress(id, current, 0);
        assert_eq!(registry.status(id).unwrap().progress.percentage, 0);
    }
}
