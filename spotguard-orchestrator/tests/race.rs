use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use spotguard_orchestrator::probe::ScriptedProbe;
use spotguard_orchestrator::race::{RaceConfig, RaceProvisioner};
use spotguard_providers::inventory::{Offer, OfferFilters};
use spotguard_providers::mock::{MockBehavior, MockMarketplace};

fn offer(id: &str, reliability: f64, price: f64) -> Offer {
    Offer {
        id: id.to_string(),
        gpu_name: "RTX 4090".to_string(),
        price_per_hour: price,
        reliability,
        internet_down_mbps: 800.0,
        region: "EU".to_string(),
        disk_gb: 100.0,
        num_gpus: 1,
    }
}

fn config(batch_size: usize, batch_timeout_s: u64, max_batches: u32) -> RaceConfig {
    RaceConfig {
        filters: OfferFilters::default(),
        batch_size,
        batch_timeout: Duration::from_secs(batch_timeout_s),
        check_interval: Duration::from_secs(2),
        max_batches,
        create_stagger: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn fastest_machine_wins_and_losers_are_destroyed_once() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    let delays = [40u64, 25, 12, 30, 50];
    for (i, delay) in delays.iter().enumerate() {
        let host = format!("10.0.0.{}", i + 1);
        market.add_offer(
            offer(&format!("o{}", i + 1), 0.99 - i as f64 * 0.01, 0.4),
            MockBehavior::ready_after(*delay, &host),
        );
        probe.set_tcp(&host, 22, true);
    }

    let race = RaceProvisioner::new(market.clone(), probe.clone());
    let res = race.provision(&config(5, 60, 1)).await;

    assert!(res.success, "race failed: {:?}", res.error);
    assert_eq!(res.offer_id.as_deref(), Some("o3"));
    assert_eq!(res.ssh_host.as_deref(), Some("10.0.0.3"));
    let ttr = res.time_to_ready.unwrap();
    assert!((ttr - 12.0).abs() < 0.5, "time_to_ready = {}", ttr);
    assert_eq!(res.rounds_attempted, 1);
    assert_eq!(res.machines_created, 5);

    let winner = res.instance_id.clone().unwrap();
    let destroyed = market.destroy_calls();
    assert_eq!(destroyed.len(), 4);
    let unique: HashSet<_> = destroyed.iter().collect();
    assert_eq!(unique.len(), 4, "an instance was destroyed twice");
    assert!(!destroyed.contains(&winner));
    assert_eq!(market.live_ids(), vec![winner]);
}

#[tokio::test(start_paused = true)]
async fn running_but_unreachable_machine_does_not_win() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    market.add_offer(offer("closed", 0.99, 0.3), MockBehavior::ready_after(5, "10.0.1.1"));
    market.add_offer(offer("open", 0.98, 0.3), MockBehavior::ready_after(9, "10.0.1.2"));
    probe.set_tcp("10.0.1.2", 22, true);

    let race = RaceProvisioner::new(market.clone(), probe.clone());
    let res = race.provision(&config(5, 60, 1)).await;

    assert!(res.success);
    assert_eq!(res.offer_id.as_deref(), Some("open"));
    assert_eq!(market.destroy_calls().len(), 1);
    assert!(probe.calls().iter().any(|c| c == "10.0.1.1:22"));
}

#[tokio::test(start_paused = true)]
async fn batch_timeout_moves_to_next_round() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    market.add_offer(offer("slow-a", 0.99, 0.3), MockBehavior::never_ready("10.0.2.1"));
    market.add_offer(offer("slow-b", 0.98, 0.3), MockBehavior::never_ready("10.0.2.2"));
    market.add_offer(offer("fast-a", 0.97, 0.3), MockBehavior::ready_after(5, "10.0.2.3"));
    market.add_offer(offer("fast-b", 0.96, 0.3), MockBehavior::ready_after(8, "10.0.2.4"));
    for host in ["10.0.2.3", "10.0.2.4"] {
        probe.set_tcp(host, 22, true);
    }

    let race = RaceProvisioner::new(market.clone(), probe.clone());
    let res = race.provision(&config(2, 20, 3)).await;

    assert!(res.success);
    assert_eq!(res.offer_id.as_deref(), Some("fast-a"));
    assert_eq!(res.rounds_attempted, 2);
    assert_eq!(res.machines_created, 4);
    // Both round-one machines plus the round-two loser.
    let destroyed = market.destroy_calls();
    assert_eq!(destroyed.len(), 3);
    assert_eq!(market.live_ids(), vec![res.instance_id.unwrap()]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_batches_leave_nothing_running() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    for i in 0..4 {
        market.add_offer(
            offer(&format!("o{}", i), 0.9, 0.3),
            MockBehavior::never_ready(&format!("10.0.3.{}", i)),
        );
    }

    let race = RaceProvisioner::new(market.clone(), probe.clone());
    let res = race.provision(&config(2, 10, 2)).await;

    assert!(!res.success);
    assert!(res.error.is_some());
    assert_eq!(res.rounds_attempted, 2);
    assert_eq!(market.create_count(), 4);
    assert!(market.live_ids().is_empty());
    assert_eq!(market.destroy_calls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn unavailable_offers_are_skipped() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    market.add_offer(offer("gone", 0.99, 0.3), MockBehavior::unavailable());
    market.add_offer(offer("ok", 0.90, 0.3), MockBehavior::ready_after(3, "10.0.4.1"));
    probe.set_tcp("10.0.4.1", 22, true);

    let race = RaceProvisioner::new(market.clone(), probe.clone());
    let res = race.provision(&config(5, 30, 1)).await;

    assert!(res.success);
    assert_eq!(res.machines_tried, 2);
    assert_eq!(res.machines_created, 1);
    assert!(market.destroy_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_matching_offers_fails_without_creating() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    market.add_offer(offer("pricey", 0.99, 3.0), MockBehavior::ready_after(1, "10.0.5.1"));

    let mut cfg = config(5, 30, 1);
    cfg.filters.max_price = Some(1.0);
    let race = RaceProvisioner::new(market.clone(), probe);
    let res = race.provision(&cfg).await;

    assert!(!res.success);
    assert!(res.error.unwrap().contains("no offers"));
    assert_eq!(res.rounds_attempted, 0);
    assert_eq!(market.create_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn overall_timeout_releases_everything() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    for i in 0..3 {
        market.add_offer(
            offer(&format!("o{}", i), 0.9, 0.3),
            MockBehavior::never_ready(&format!("10.0.6.{}", i)),
        );
    }

    let mut cfg = config(3, 600, 1);
    cfg.overall_timeout = Some(Duration::from_secs(30));
    let race = RaceProvisioner::new(market.clone(), probe);
    let res = race.provision(&cfg).await;

    assert!(!res.success);
    assert!(res.error.unwrap().contains("overall"));
    assert!(res.total_time < 31.0);
    assert!(market.live_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_race_destroys_its_machines() {
    let market = Arc::new(MockMarketplace::new());
    let probe = Arc::new(ScriptedProbe::new());
    for i in 0..3 {
        market.add_offer(
            offer(&format!("o{}", i), 0.9, 0.3),
            MockBehavior::never_ready(&format!("10.0.7.{}", i)),
        );
    }

    let race = Arc::new(RaceProvisioner::new(market.clone(), probe));
    let task = {
        let race = race.clone();
        tokio::spawn(async move { race.provision(&config(3, 120, 1)).await })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(market.live_ids().len(), 3);

    task.abort();
    let _ = task.await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(market.live_ids().is_empty());
    let destroyed = market.destroy_calls();
    let unique: HashSet<_> = destroyed.iter().collect();
    assert_eq!(destroyed.len(), unique.len());
    assert_eq!(destroyed.len(), 3);
}
