use super::*;
use crate::testonly::{electing, ready, FakePlatform};
use assert_matches::assert_matches;
use failover_concurrency::testonly::abort_on_panic;

fn tracker(platform: &Arc<FakePlatform>) -> LeaderTracker {
    LeaderTracker::new(platform.clone())
}

#[tokio::test]
async fn refresh_replaces_snapshots() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![
        ready(0, "consensus-store-1", 3),
        ready(1, "consensus-store-2", 1),
    ]));
    let tracker = tracker(&platform);
    assert!(tracker.current_leader(PartitionId(0)).is_none());

    let changes = tracker.refresh(ctx).await.unwrap();
    assert_eq!(2, changes.len());
    assert!(changes.iter().all(LeaderChange::is_initial));
    let old = tracker.current_leader(PartitionId(0)).unwrap();
    assert_eq!(3, old.term);
    assert!(old.is_ready());

    platform.push([Ok(vec![
        ready(0, "consensus-store-0", 4),
        ready(1, "consensus-store-2", 1),
    ])]);
    let changes = tracker.refresh(ctx).await.unwrap();
    assert_eq!(1, changes.len());
    assert_eq!(PartitionId(0), changes[0].partition);
    assert_eq!(Some(3), changes[0].before.as_ref().map(|b| b.term));
    assert_eq!(4, changes[0].after.term);

    // Snapshots handed out earlier are not affected by the refresh.
    assert_eq!(3, old.term);
    assert_eq!(Some(ReplicaId::from("consensus-store-1")), old.replica);
    let new = tracker.current_leader(PartitionId(0)).unwrap();
    assert!(!new.same_leadership(&old));
}

#[tokio::test]
async fn unavailable_partition_is_stale_no_leader() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![
        ready(0, "consensus-store-1", 5),
        ready(1, "consensus-store-2", 2),
    ]));
    let tracker = tracker(&platform);
    tracker.refresh(ctx).await.unwrap();

    platform.push([Ok(vec![
        PartitionStatus::Unavailable {
            partition: PartitionId(0),
            reason: "missing status.leader".to_owned(),
        },
        ready(1, "consensus-store-2", 2),
    ])]);
    let changes = tracker.refresh(ctx).await.unwrap();
    assert_eq!(1, changes.len());
    let p0 = tracker.current_leader(PartitionId(0)).unwrap();
    assert!(p0.stale);
    assert_eq!(LeaderState::NoLeader, p0.state);
    assert_eq!(None, p0.replica);
    assert_eq!(5, p0.term);
    assert!(!tracker.current_leader(PartitionId(1)).unwrap().stale);
}

#[tokio::test]
async fn failed_refresh_keeps_cache() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![ready(0, "consensus-store-1", 1)]));
    let tracker = tracker(&platform);
    tracker.refresh(ctx).await.unwrap();
    let generation = *tracker.subscribe().borrow();

    platform.push([Err("connection refused".to_owned())]);
    assert_matches!(tracker.refresh(ctx).await, Err(PlatformError::Api(_)));
    assert_eq!(1, tracker.current_leader(PartitionId(0)).unwrap().term);
    assert_eq!(generation, *tracker.subscribe().borrow());
}

#[tokio::test]
async fn subscribe_observes_refreshes() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![ready(0, "consensus-store-1", 1)]));
    let tracker = tracker(&platform);
    let mut sub = tracker.subscribe();
    tracker.refresh(ctx).await.unwrap();
    sub.changed().await.unwrap();
    assert_eq!(1, *sub.borrow_and_update());
    tracker.refresh(ctx).await.unwrap();
    sub.changed().await.unwrap();
    assert_eq!(2, *sub.borrow_and_update());
}

#[tokio::test(start_paused = true)]
async fn run_retries_after_failures() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![ready(0, "consensus-store-1", 1)]));
    platform.push([Err("timeout".to_owned()), Err("timeout".to_owned())]);
    let tracker = tracker(&platform);
    let interval = time::Duration::from_secs(1);
    let res = tracker
        .run(&ctx.with_timeout(interval * 3 + interval / 2), interval)
        .await;
    assert_matches!(res, Err(ctx::Canceled));
    assert_eq!(4, platform.queries());
    assert!(tracker.current_leader(PartitionId(0)).is_some());
}

#[tokio::test(start_paused = true)]
async fn wait_for_ready_polls_until_ready() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![electing(0, None, 1)]));
    platform.push([
        Ok(vec![electing(0, None, 1)]),
        Ok(vec![electing(0, Some("consensus-store-1"), 2)]),
        Ok(vec![ready(0, "consensus-store-1", 2)]),
    ]);
    let tracker = tracker(&platform);
    let leader = tracker
        .wait_for_ready(ctx, PartitionId(0), time::Duration::from_secs(45))
        .await
        .unwrap();
    assert_eq!(2, leader.term);
    assert_eq!(3, platform.queries());
}

#[tokio::test(start_paused = true)]
async fn wait_for_ready_times_out() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![electing(0, None, 1)]));
    let tracker = tracker(&platform);
    let res = tracker
        .wait_for_ready(ctx, PartitionId(0), time::Duration::from_secs(5))
        .await;
    assert_matches!(res, Err(RecoveryError::Timeout { partition, elapsed }) => {
        assert_eq!(PartitionId(0), partition);
        assert!(elapsed >= time::Duration::from_secs(5));
    });
}

#[tokio::test]
async fn wait_for_ready_canceled() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![electing(0, None, 1)]));
    let tracker = tracker(&platform);
    ctx.cancel();
    let res = tracker
        .wait_for_ready(ctx, PartitionId(0), time::Duration::from_secs(5))
        .await;
    assert_matches!(res, Err(RecoveryError::Canceled(_)));
}

#[tokio::test(start_paused = true)]
async fn slow_refresh_does_not_overwrite_newer_one() {
    abort_on_panic();
    let ctx = &ctx::root();
    let platform = Arc::new(FakePlatform::new(vec![]));
    platform.push([
        Ok(vec![ready(0, "consensus-store-1", 3)]),
        Ok(vec![ready(0, "consensus-store-2", 4)]),
    ]);
    platform.push_delays([time::Duration::from_secs(2), time::Duration::ZERO]);
    let tracker = tracker(&platform);

    let (slow, fast) = tokio::join!(tracker.refresh(ctx), async {
        ctx.sleep(time::Duration::from_millis(100)).await.unwrap();
        tracker.refresh(ctx).await
    });
    assert_matches!(&slow.unwrap()[..], [change] => {
        assert!(change.is_initial());
        assert_eq!(3, change.after.term);
    });
    assert_matches!(&fast.unwrap()[..], [change] => {
        assert_eq!(Some(3), change.before.as_ref().map(|b| b.term));
        assert_eq!(4, change.after.term);
    });
    assert_eq!(4, tracker.current_leader(PartitionId(0)).unwrap().term);
    assert_eq!(2, platform.queries());
}
