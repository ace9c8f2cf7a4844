//! `list-regions` subcommand

use piawg_core::api::http::PiaHttpClient;
use piawg_core::catalog::Catalog;
use piawg_core::config::Config;
use piawg_core::error::Result;
use piawg_core::retry::RetryPolicy;
use piawg_core::state::StateDir;

pub fn run(config: &Config) -> Result<()> {
    let state = StateDir::new(config.state_dir.clone());
    let api = PiaHttpClient::new(state.clone())?;
    let retry = RetryPolicy::default();

    let mut regions = Catalog::new(&api, &state, &retry).regions()?;
    regions.sort_by(|a, b| a.id.cmp(&b.id));

    println!("(*) marks regions that support port forwarding\n");
    for region in &regions {
        let marker = if region.port_forward { "(*)" } else { "   " };
        println!("{marker} {:<22} {}", region.id, region.name);
    }
    Ok(())
}
