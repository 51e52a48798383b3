//! Console client binary.
//!
//! Usage:
//!   cargo run -p arena_client -- [--addr 127.0.0.1:7777] [--proto 1]
//!       [--char 1] [--interest 15] [--token <jwt>] [--token-secret s]
//!
//! With `--token-secret` a development token is minted locally; otherwise
//! pass a real `--token`. Commands once connected:
//!   m dx dy            movement input (unreliable)
//!   a <skill> <eid>    skill action at the last seen server tick (reliable)
//!   q                  quit

use std::env;
use std::io::BufRead;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::info;

use arena_client::peer::ClientPeer;
use arena_shared::interest::Interest;
use arena_shared::packet::{encode_action, encode_input, ActionCmd, InputCmd, PacketType};
use arena_shared::token::{mint_hs256, Claims};

struct Args {
    addr: String,
    proto: u16,
    char_id: u64,
    interest: u32,
    token: Option<String>,
    token_secret: Option<String>,
}

fn parse_args() -> Args {
    let mut out = Args {
        addr: "127.0.0.1:7777".to_string(),
        proto: 1,
        char_id: 1,
        interest: Interest::all_channels().bits(),
        token: None,
        token_secret: None,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                out.addr = args[i + 1].clone();
                i += 2;
            }
            "--proto" if i + 1 < args.len() => {
                out.proto = args[i + 1].parse().unwrap_or(1);
                i += 2;
            }
            "--char" if i + 1 < args.len() => {
                out.char_id = args[i + 1].parse().unwrap_or(1);
                i += 2;
            }
            "--interest" if i + 1 < args.len() => {
                out.interest = args[i + 1].parse().unwrap_or(out.interest);
                i += 2;
            }
            "--token" if i + 1 < args.len() => {
                out.token = Some(args[i + 1].clone());
                i += 2;
            }
            "--token-secret" if i + 1 < args.len() => {
                out.token_secret = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = parse_args();
    let token = match (&args.token, &args.token_secret) {
        (Some(t), _) => t.clone(),
        (None, Some(secret)) => mint_hs256(
            secret.as_bytes(),
            &Claims {
                sub: args.char_id.to_string(),
                exp: i64::MAX,
                ..Claims::default()
            },
        ),
        (None, None) => anyhow::bail!("pass --token or --token-secret"),
    };

    let mut peer = ClientPeer::connect(&args.addr, args.proto)
        .await
        .context("connect")?;
    let nonce: u64 = rand::random();
    let hello = peer.handshake(nonce, &token).await.context("handshake")?;
    println!("{hello}");
    peer.attach(args.char_id, args.interest)?;
    info!(char_id = args.char_id, "attached; type commands");

    println!("commands:");
    println!("  m dx dy            (movement, unreliable)");
    println!("  a skill targetEID  (action, reliable)");
    println!("  q");

    // Blocking stdin reader feeding the async loop, one line at a time.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let mut input_tick: u32 = 0;
    loop {
        // Console lines first (non-blocking), then pump the socket.
        while let Ok(line) = line_rx.try_recv() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["q"] => return Ok(()),
                ["m", dx, dy] => {
                    let (Ok(mx), Ok(my)) = (dx.parse::<i16>(), dy.parse::<i16>()) else {
                        println!("usage: m dx dy");
                        continue;
                    };
                    peer.send_unreliable(
                        PacketType::Input,
                        encode_input(InputCmd { tick: input_tick, mx, my }),
                    );
                    input_tick += 1;
                }
                ["a", skill, target] => {
                    let (Ok(skill), Ok(target)) = (skill.parse::<u16>(), target.parse::<u32>())
                    else {
                        println!("usage: a skill targetEID");
                        continue;
                    };
                    let tick = peer.server_tick();
                    if let Err(e) = peer.send_reliable(
                        PacketType::Action,
                        encode_action(ActionCmd { tick, skill, target }),
                    ) {
                        println!("action not sent: {e}");
                    }
                }
                [] => {}
                _ => println!("unknown command"),
            }
        }

        if let Some(inc) = peer
            .recv_timeout(std::time::Duration::from_millis(100))
            .await
        {
            match inc.ptype {
                PacketType::Text | PacketType::Rep => print_payload(&inc.payload),
                PacketType::AuthResp => {
                    println!("auth: {}", String::from_utf8_lossy(&inc.payload));
                }
                _ => {}
            }
        }
    }
}

fn print_payload(payload: &Bytes) {
    for line in String::from_utf8_lossy(payload).lines() {
        println!("{line}");
    }
}
