//! `status` subcommand: report tunnel and lease state without touching
//! the network.

use piawg_core::config::Config;
use piawg_core::error::Result;
use piawg_core::forward;
use piawg_core::reconcile;
use piawg_core::state::{unix_now, StateDir};
use piawg_core::tunnel::wg_quick::{WgQuick, INTERFACE};
use piawg_core::tunnel::TunnelControl;

pub fn run(config: &Config) -> Result<()> {
    let state = StateDir::new(config.state_dir.clone());
    let wg = WgQuick::new();

    match wg.current()? {
        Some(snapshot) if !snapshot.endpoint.is_empty() => {
            println!("{INTERFACE}: up, endpoint {}", snapshot.endpoint);
        }
        Some(_) => println!("{INTERFACE}: up"),
        None => println!("{INTERFACE}: down"),
    }

    if let Ok(Some(stats)) = wg.stats() {
        if stats.latest_handshake == 0 {
            println!("latest handshake: never");
        } else {
            let minutes = unix_now().saturating_sub(stats.latest_handshake) as f64 / 60.0;
            println!("latest handshake: {minutes:.1}m ago");
        }
        println!(
            "transfer: {:.1} MiB received, {:.1} MiB sent",
            stats.rx_bytes as f64 / 1_048_576.0,
            stats.tx_bytes as f64 / 1_048_576.0
        );
    }

    match reconcile::last_success(&state) {
        Some(ts) => {
            let minutes = unix_now().saturating_sub(ts) as f64 / 60.0;
            println!("last successful run: {minutes:.1}m ago");
        }
        None => println!("last successful run: never"),
    }

    if let Some(port) = forward::recorded_port(&state) {
        println!("forwarded port: {port}");
    }
    if let Some(lease) = forward::stored_lease(&state) {
        let days = lease.expires_at.saturating_sub(unix_now()) as f64 / 86400.0;
        println!("lease expires in: {days:.1}d");
    }
    Ok(())
}
