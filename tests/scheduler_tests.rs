mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{eventually, harness, reply, MockArp, MockSyn};
use lan_watch_rs::config::ScannerConfig;
use lan_watch_rs::scheduler::SchedulerState;
use lan_watch_rs::store::HostStore;
use lan_watch_rs::types::{HostStatus, ScanEvent};

fn config(interval_ms: u64) -> ScannerConfig {
    ScannerConfig::new(
        "10.0.0.0/24".parse().unwrap(),
        20,
        90,
        Duration::from_millis(50),
        Duration::from_millis(interval_ms),
    )
    .unwrap()
}

#[tokio::test]
async fn cycle_discovers_then_probes_live_hosts() {
    let h = harness(
        MockArp::new(vec![reply("10.0.0.5", "aa:bb:cc:dd:ee:ff")]),
        MockSyn::new(&[22, 80]),
    );
    assert_eq!(h.scheduler.state(), SchedulerState::Stopped);

    h.scheduler.start(config(60_000));
    assert_eq!(h.scheduler.state(), SchedulerState::Running);

    let reg = h.registry.clone();
    let mut done = false;
    for _ in 0..200 {
        if let Some(host) = reg.get("10.0.0.5").await {
            if !host.open_ports.is_empty() && !host.port_scan_in_progress {
                done = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(done, "host was never probed");

    let host = reg.get("10.0.0.5").await.unwrap();
    assert_eq!(host.status, HostStatus::Online);
    assert_eq!(host.open_ports, [22, 80].into_iter().collect::<BTreeSet<u16>>());
    assert_eq!(host.vendor, "Acme Networks");
    assert_eq!(h.store.get("10.0.0.5").unwrap().unwrap().open_ports, host.open_ports);

    h.scheduler.stop();
    h.scheduler.join().await;
}

#[tokio::test]
async fn paused_scheduler_keeps_ticking_without_scanning() {
    let h = harness(MockArp::new(vec![]), MockSyn::new(&[]));
    h.scheduler.start(config(20));
    let arp = h.arp.clone();
    assert!(eventually(|| arp.sweeps() >= 2).await);

    assert_eq!(h.scheduler.pause(), SchedulerState::Paused);
    // Let any in-flight cycle drain.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let frozen = h.arp.sweeps();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.arp.sweeps(), frozen);

    assert_eq!(h.scheduler.resume(), SchedulerState::Running);
    assert!(eventually(|| arp.sweeps() > frozen).await);

    h.scheduler.stop();
    h.scheduler.join().await;
}

#[tokio::test]
async fn stop_ends_the_loop_and_start_revives_it() {
    let h = harness(MockArp::new(vec![]), MockSyn::new(&[]));
    h.scheduler.start(config(20));
    let arp = h.arp.clone();
    assert!(eventually(|| arp.sweeps() >= 1).await);

    assert_eq!(h.scheduler.stop(), SchedulerState::Stopped);
    tokio::time::timeout(Duration::from_secs(2), h.scheduler.join())
        .await
        .expect("loop should exit after stop");
    let after_stop = h.arp.sweeps();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.arp.sweeps(), after_stop);

    h.scheduler.start(config(20));
    assert_eq!(h.scheduler.state(), SchedulerState::Running);
    assert!(eventually(|| arp.sweeps() > after_stop).await);
    h.scheduler.stop();
    h.scheduler.join().await;
}

#[tokio::test]
async fn stop_from_paused_ends_the_loop() {
    let h = harness(MockArp::new(vec![]), MockSyn::new(&[]));
    h.scheduler.start(config(20));
    let arp = h.arp.clone();
    assert!(eventually(|| arp.sweeps() >= 1).await);

    assert_eq!(h.scheduler.pause(), SchedulerState::Paused);
    assert_eq!(h.scheduler.stop(), SchedulerState::Stopped);
    tokio::time::timeout(Duration::from_secs(2), h.scheduler.join())
        .await
        .expect("loop should exit after stop");

    let after_stop = arp.sweeps();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(arp.sweeps(), after_stop);
    assert_eq!(h.scheduler.resume(), SchedulerState::Stopped);
}

#[tokio::test]
async fn pause_and_resume_are_noops_when_stopped() {
    let h = harness(MockArp::new(vec![]), MockSyn::new(&[]));
    assert_eq!(h.scheduler.pause(), SchedulerState::Stopped);
    assert_eq!(h.scheduler.resume(), SchedulerState::Stopped);
}

#[tokio::test]
async fn restart_while_running_applies_new_config_immediately() {
    let h = harness(MockArp::new(vec![]), MockSyn::new(&[]));
    h.scheduler.start(config(60_000));
    let arp = h.arp.clone();
    assert!(eventually(|| arp.sweeps() == 1).await);

    h.scheduler.start(config(60_000).with_cycle_deadline(Some(Duration::from_secs(5))));
    assert!(eventually(|| arp.sweeps() == 2).await);
    // A second live loop would sweep again on its own first cycle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(arp.sweeps(), 2);
    assert_eq!(
        h.scheduler.status().config.unwrap().cycle_deadline,
        Some(Duration::from_secs(5))
    );
    h.scheduler.stop();
    h.scheduler.join().await;
}

#[tokio::test]
async fn failing_discovery_does_not_kill_the_loop() {
    let h = harness(MockArp::failing(), MockSyn::new(&[]));
    h.scheduler.start(config(20));
    let arp = h.arp.clone();
    assert!(eventually(|| arp.sweeps() >= 3).await);
    assert_eq!(h.scheduler.state(), SchedulerState::Running);
    h.scheduler.stop();
    h.scheduler.join().await;
}

#[tokio::test]
async fn cycle_deadline_abandons_slow_probes() {
    let h = harness(
        MockArp::new(vec![reply("10.0.0.8", "aa")]),
        MockSyn::new(&[22]).with_delay(Duration::from_secs(5)),
    );
    h.scheduler
        .start(config(60_000).with_cycle_deadline(Some(Duration::from_millis(100))));

    let reg = h.registry.clone();
    let mut cleared = false;
    for _ in 0..100 {
        if let Some(host) = reg.get("10.0.0.8").await {
            if !host.port_scan_in_progress && !h.syn.calls().is_empty() {
                cleared = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared, "in-progress flag should be cleared at the deadline");
    assert!(reg.get("10.0.0.8").await.unwrap().open_ports.is_empty());
    h.scheduler.stop();
}

#[tokio::test]
async fn on_demand_scan_merges_and_reports() {
    let h = harness(MockArp::new(vec![]), MockSyn::new(&[443]));
    let mut rx = h.events.subscribe();
    let existing: BTreeSet<u16> = [22].into_iter().collect();
    h.registry.finish_port_scan("10.0.0.5", &existing).await;

    let found = h
        .scheduler
        .scan_host_now("10.0.0.5".parse().unwrap(), &[22, 443], Duration::from_millis(50))
        .await;
    assert_eq!(found, [443].into_iter().collect::<BTreeSet<u16>>());

    let host = h.registry.get("10.0.0.5").await.unwrap();
    assert_eq!(host.open_ports, [22, 443].into_iter().collect::<BTreeSet<u16>>());
    assert!(!host.port_scan_in_progress);

    match rx.recv().await.unwrap() {
        ScanEvent::ScanUpdate(snap) => assert!(snap["10.0.0.5"].port_scan_in_progress),
        other => panic!("expected snapshot first, got {other:?}"),
    }
    match rx.recv().await.unwrap() {
        ScanEvent::PortScanResult { host, open_ports } => {
            assert_eq!(host, "10.0.0.5");
            assert_eq!(open_ports, vec![443]);
        }
        other => panic!("expected port_scan_result, got {other:?}"),
    }
}
