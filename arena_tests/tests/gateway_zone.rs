//! End-to-end gameplay: inputs, movement replication, combat.

use std::time::Duration;

use arena_shared::packet::{encode_action, encode_input, ActionCmd, InputCmd, PacketType};
use arena_tests::{Cluster, ZoneSpec};

/// Extracts the entity id from a `SPAWN <eid> ...` line.
fn spawn_eid(line: &str) -> Option<u32> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "SPAWN" {
        return None;
    }
    parts.next()?.parse().ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn input_drives_movement_replication() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;
    let mut client = cluster.client(7).await?;

    // Own spawn arrives first.
    let lines = client.collect_rep_lines(Duration::from_millis(500)).await;
    let eid = lines
        .iter()
        .filter(|l| l.contains("kind=1"))
        .find_map(|l| spawn_eid(l))
        .expect("own spawn line");

    // A few inputs; velocity persists so x keeps growing.
    for tick in 0..3u32 {
        client.send_unreliable(
            PacketType::Input,
            encode_input(InputCmd {
                tick,
                mx: 1,
                my: 0,
            }),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let lines = client.collect_rep_lines(Duration::from_millis(600)).await;
    let moves: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with(&format!("MOV {eid} ")))
        .collect();
    assert!(!moves.is_empty(), "expected movement lines, got {lines:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn npcs_replicate_to_players() -> anyhow::Result<()> {
    let cluster = Cluster::start(
        &[ZoneSpec {
            zone_id: 1,
            target: 2,
            boundary: 1000,
            npc_count: 4,
        }],
        &[],
        5_000,
    )
    .await?;
    let mut client = cluster.client(7).await?;

    let lines = client.collect_rep_lines(Duration::from_millis(700)).await;
    let npc_eids: std::collections::HashSet<u32> = lines
        .iter()
        .filter(|l| l.contains("kind=2"))
        .filter_map(|l| spawn_eid(l))
        .collect();
    assert_eq!(npc_eids.len(), 4, "expected 4 NPC spawns, got {lines:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn melee_hit_lands_and_replicates() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;

    // Attach the victim first so its entity id is the smaller one.
    let mut victim = cluster.client(1).await?;
    let lines = victim.collect_rep_lines(Duration::from_millis(500)).await;
    let victim_eid = lines
        .iter()
        .find_map(|l| spawn_eid(l))
        .expect("victim spawn");

    let mut attacker = cluster.client(2).await?;
    let lines = attacker.collect_rep_lines(Duration::from_millis(500)).await;
    assert!(
        lines.iter().any(|l| spawn_eid(l) == Some(victim_eid)),
        "attacker should see the victim: {lines:?}"
    );

    // The victim oscillates in place; its movement keeps fresh server
    // ticks flowing to the attacker, whose reader tracks the TICK header.
    for tick in 0..15u32 {
        victim.send_unreliable(
            PacketType::Input,
            encode_input(InputCmd {
                tick,
                mx: if tick % 2 == 0 { 1 } else { -1 },
                my: 0,
            }),
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let action_tick = attacker.server_tick();
    assert!(action_tick > 0, "no server tick observed");

    // Strike at the last observed tick so the rewind window is satisfied.
    attacker.send_reliable(
        PacketType::Action,
        encode_action(ActionCmd {
            tick: action_tick,
            skill: 1,
            target: victim_eid,
        }),
    )?;

    // The attacker hears the hit event; the victim's HP delta follows on
    // the state cadence.
    let lines = attacker.collect_rep_lines(Duration::from_secs(2)).await;
    assert!(
        lines.iter().any(|l| l == "EV hit"),
        "expected hit event, got {lines:?}"
    );
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with(&format!("STAT {victim_eid} ")) && l.ends_with("hp=95")),
        "expected hp 95 state, got {lines:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_range_attack_reports_error() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;

    let mut victim = cluster.client(1).await?;
    let lines = victim.collect_rep_lines(Duration::from_millis(500)).await;
    let victim_eid = lines
        .iter()
        .find_map(|l| spawn_eid(l))
        .expect("victim spawn");

    // Walk the victim far away, then stop it there.
    for tick in 0..5u32 {
        victim.send_unreliable(
            PacketType::Input,
            encode_input(InputCmd {
                tick,
                mx: 10,
                my: 0,
            }),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    victim.send_unreliable(
        PacketType::Input,
        encode_input(InputCmd {
            tick: 5,
            mx: 0,
            my: 0,
        }),
    );

    // The attacker wiggles in place to keep its observed tick fresh.
    let mut attacker = cluster.client(2).await?;
    let _ = attacker.collect_rep_lines(Duration::from_millis(300)).await;
    for tick in 0..10u32 {
        attacker.send_unreliable(
            PacketType::Input,
            encode_input(InputCmd {
                tick,
                mx: if tick % 2 == 0 { 1 } else { -1 },
                my: 0,
            }),
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let action_tick = attacker.server_tick();
    assert!(action_tick > 0, "no server tick observed");

    attacker.send_reliable(
        PacketType::Action,
        encode_action(ActionCmd {
            tick: action_tick,
            skill: 1,
            target: victim_eid,
        }),
    )?;

    let err = attacker
        .expect_text("ERR", Duration::from_secs(2))
        .await
        .expect("combat error text");
    // OutOfRange is code 5 on the wire.
    assert!(err.starts_with("ERR code=5"), "got {err}");
    Ok(())
}
