mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use twallet::progress::{ProgressLog, ProgressSink, RescanEvent};
use twallet::rescan::{auto_unlock, RescanSettings, INVALID_PASSPHRASE_PROMPT};
use twallet::{Rescan, RescanError, WalletControl};
use twallet_flnd::{DaemonError, RpcCode, RpcError, Status};

use support::{
    drain, finished, idle, invalid_passphrase, not_ready, recovering, FakeWallet,
};

fn line_ends_with(events: &[RescanEvent], suffix: &str) -> bool {
    events.iter().any(|event| match event {
        RescanEvent::Line(line) => line.ends_with(suffix),
        _ => false,
    })
}

#[tokio::test(start_paused = true)]
async fn unlock_survives_thirty_not_ready_failures() {
    let wallet = FakeWallet::in_state(Status::Locked);
    wallet.script_unlock((0..30).map(|_| Err(not_ready())));
    let (sink, rx) = ProgressSink::channel();

    auto_unlock(
        wallet.as_ref(),
        "hunter2",
        &RescanSettings::default(),
        &CancellationToken::new(),
        &sink,
    )
    .await
    .expect("unlock after retries");

    assert_eq!(wallet.unlock_calls(), 31);
    let events = drain(&rx);
    assert!(line_ends_with(&events, "Attempting to unlock wallet (31/31)…"));
    assert!(line_ends_with(&events, "Wallet unlock confirmed."));
}

#[tokio::test(start_paused = true)]
async fn unlock_gives_up_after_thirty_one_failures() {
    let wallet = FakeWallet::in_state(Status::Locked);
    wallet.script_unlock((0..31).map(|_| Err(not_ready())));
    let (sink, rx) = ProgressSink::channel();

    let err = auto_unlock(
        wallet.as_ref(),
        "hunter2",
        &RescanSettings::default(),
        &CancellationToken::new(),
        &sink,
    )
    .await
    .expect_err("attempts exhausted");

    assert_eq!(err, RescanError::UnlockAttemptsExhausted);
    assert_eq!(wallet.unlock_calls(), 31);
    assert!(line_ends_with(&drain(&rx), "Exceeded maximum unlock attempts."));
}

#[tokio::test(start_paused = true)]
async fn unlock_treats_already_unlocked_as_success() {
    let wallet = FakeWallet::in_state(Status::Locked);
    wallet.confirm_unlock.store(false, std::sync::atomic::Ordering::SeqCst);
    wallet.script_unlock([Err(DaemonError::Rpc(RpcError::new(
        RpcCode::Unknown,
        "wallet already unlocked, WalletUnlocker service is no longer available",
    )))]);
    let (sink, _rx) = ProgressSink::channel();

    auto_unlock(
        wallet.as_ref(),
        "hunter2",
        &RescanSettings::default(),
        &CancellationToken::new(),
        &sink,
    )
    .await
    .expect("already unlocked");
    assert_eq!(wallet.unlock_calls(), 1);
}

fn rescan_for(wallet: &Arc<FakeWallet>) -> (Arc<Rescan>, crossbeam_channel::Receiver<RescanEvent>) {
    let (sink, rx) = ProgressSink::channel();
    let control: Arc<dyn WalletControl> = wallet.clone();
    (Arc::new(Rescan::new(control, sink)), rx)
}

#[tokio::test(start_paused = true)]
async fn rescan_reports_best_utxo_count() {
    let wallet = FakeWallet::in_state(Status::Ready);
    wallet.script_recovery([
        idle(),
        recovering(0.1, 5),
        recovering(0.5, 3),
        recovering(0.9, 8),
        finished(2),
    ]);
    let (rescan, rx) = rescan_for(&wallet);

    let summary = rescan
        .run("  hunter2 ", &CancellationToken::new())
        .await
        .expect("rescan");

    assert_eq!(summary.utxo_count, 8);
    assert_eq!(wallet.rescans(), 1);
    assert_eq!(wallet.stops(), 0);
    assert!(!rescan.is_busy());
    assert!(!rescan.is_active());

    let events = drain(&rx);
    assert!(line_ends_with(&events, "Rescan complete! [8] UTXO recovered"));
    assert!(matches!(
        events.last(),
        Some(RescanEvent::Completed { utxo_count: 8, .. })
    ));

    let mut log = ProgressLog::default();
    for event in &events {
        log.apply(event);
    }
    let progress: Vec<_> = log
        .lines()
        .iter()
        .filter(|line| line.contains("% complete"))
        .collect();
    assert_eq!(progress.len(), 1, "progress replaces itself: {:?}", log.lines());
    assert!(progress[0].contains("100.00% complete"));
}

#[tokio::test(start_paused = true)]
async fn empty_passphrase_is_rejected_up_front() {
    let wallet = FakeWallet::in_state(Status::Ready);
    let (rescan, _rx) = rescan_for(&wallet);

    let err = rescan
        .run("   ", &CancellationToken::new())
        .await
        .expect_err("no passphrase");
    assert_eq!(err, RescanError::PassphraseRequired);
    assert_eq!(wallet.rescans(), 0);
}

#[tokio::test(start_paused = true)]
async fn unfinished_recovery_blocks_a_new_rescan() {
    let wallet = FakeWallet::in_state(Status::Ready);
    wallet.script_recovery([recovering(0.3, 4)]);
    let (rescan, _rx) = rescan_for(&wallet);

    let err = rescan
        .run("hunter2", &CancellationToken::new())
        .await
        .expect_err("already running");
    assert_eq!(err, RescanError::AlreadyRunning);
    assert_eq!(
        err.to_string(),
        "A wallet recovery/rescan is already in progress."
    );
    assert_eq!(wallet.rescans(), 0);
    assert!(!rescan.is_busy());
}

#[tokio::test(start_paused = true)]
async fn rejected_passphrase_prompts_again_without_stopping() {
    let wallet = FakeWallet::in_state(Status::Ready);
    wallet.script_unlock([Err(invalid_passphrase())]);
    let (rescan, rx) = rescan_for(&wallet);

    let err = rescan
        .run("wrong", &CancellationToken::new())
        .await
        .expect_err("bad passphrase");

    assert_eq!(err, RescanError::InvalidPassphrase);
    assert_eq!(wallet.unlock_calls(), 1);
    assert_eq!(wallet.stops(), 0);
    let events = drain(&rx);
    assert!(events.contains(&RescanEvent::PromptAgain(
        INVALID_PASSPHRASE_PROMPT.to_string()
    )));
    assert!(!events.iter().any(|e| matches!(e, RescanEvent::Failed(_))));
}

#[tokio::test(start_paused = true)]
async fn trigger_failure_stops_the_service() {
    let wallet = FakeWallet::in_state(Status::Ready);
    wallet.fail_trigger(DaemonError::NotRunning);
    let (rescan, rx) = rescan_for(&wallet);

    let err = rescan
        .run("hunter2", &CancellationToken::new())
        .await
        .expect_err("trigger failed");

    assert_eq!(err.to_string(), "failed to start rescan: daemon is not running");
    assert_eq!(wallet.stops(), 1);

    let mut log = ProgressLog::default();
    log.drain(&rx);
    assert_eq!(
        log.outcome(),
        Some("Rescan failed: failed to start rescan: daemon is not running")
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_unlock_error_is_wrapped_and_stops() {
    let wallet = FakeWallet::in_state(Status::Ready);
    wallet.script_unlock([Err(DaemonError::Rpc(RpcError::new(
        RpcCode::PermissionDenied,
        "verification failed: signature mismatch",
    )))]);
    let (rescan, _rx) = rescan_for(&wallet);

    let err = rescan
        .run("hunter2", &CancellationToken::new())
        .await
        .expect_err("fatal unlock");

    assert!(matches!(
        &err,
        RescanError::Step { step: "failed to unlock wallet after restart", .. }
    ));
    assert!(matches!(err.root(), RescanError::Daemon(_)));
    assert_eq!(wallet.unlock_calls(), 1);
    assert_eq!(wallet.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_unwinds_a_running_rescan() {
    let wallet = FakeWallet::in_state(Status::Ready);
    wallet.script_recovery([idle(), recovering(0.2, 1)]);
    let (rescan, rx) = rescan_for(&wallet);
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let rescan = rescan.clone();
        let cancel = cancel.clone();
        async move { rescan.run("hunter2", &cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rescan.is_busy());
    assert!(rescan.is_active());

    let second = rescan
        .run("hunter2", &CancellationToken::new())
        .await
        .expect_err("second run");
    assert_eq!(second, RescanError::Busy);

    cancel.cancel();
    let err = task.await.expect("join").expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(!rescan.is_busy());
    assert!(!rescan.is_active());
    assert_eq!(wallet.stops(), 0);
    assert_eq!(wallet.rescans(), 1);
    assert!(!drain(&rx).iter().any(|e| matches!(e, RescanEvent::Failed(_))));
}
