//! Default command: run one reconciliation pass

use piawg_core::api::http::PiaHttpClient;
use piawg_core::config::Config;
use piawg_core::error::Result;
use piawg_core::forward::HookCommand;
use piawg_core::reconcile;
use piawg_core::requirements;
use piawg_core::retry::RetryPolicy;
use piawg_core::state::StateDir;
use piawg_core::tunnel::probe::IpCheck;
use piawg_core::tunnel::wg_quick::WgQuick;

pub fn run(config: &Config) -> Result<()> {
    requirements::check_all()?;

    let state = StateDir::new(config.state_dir.clone());
    let api = PiaHttpClient::new(state.clone())?;
    let control = WgQuick::new();
    let probe = IpCheck::new()?;
    let retry = RetryPolicy::default();
    let hook = config.port_forward_command.clone().map(HookCommand::new);

    let result = reconcile::reconcile(
        config,
        &state,
        &api,
        &control,
        Some(&probe),
        hook.as_ref(),
        &retry,
    )?;

    println!("tunnel {} ({})", result.state, result.action);
    if let Some(port) = result.forwarded_port {
        println!("forwarded port {port}");
    }
    Ok(())
}
