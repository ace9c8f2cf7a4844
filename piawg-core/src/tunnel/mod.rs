//! Tunnel state reconciliation
//!
//! The reconciler derives the live tunnel state from a [`TunnelControl`]
//! implementation and applies only the transition needed to reach the
//! desired configuration. On the routine timer tick the live interface
//! already matches and nothing is touched.
//!
//! A configuration artifact that matches on paper does not prove the
//! tunnel carries traffic, so a [`ConnectivityProbe`] can additionally
//! confirm that the public IP equals the desired endpoint. A tunnel that
//! fails that check is torn down and brought back up.

pub mod probe;
pub mod wg_quick;

use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::error::TunnelError;
use crate::registrar::TunnelPeerConfig;
use crate::retry::{retry, RetryPolicy};

/// Derived state of the live tunnel relative to the desired config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No interface present
    Down,
    /// Interface up with the desired peer configuration
    UpMatching,
    /// Interface up but its peer configuration differs from desired
    UpStale,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Down => write!(f, "down"),
            TunnelState::UpMatching => write!(f, "up"),
            TunnelState::UpStale => write!(f, "up (stale)"),
        }
    }
}

/// What the reconciler did this invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Live state already matched; nothing was touched
    None,
    /// Interface was brought up from Down
    Activated,
    /// Stale interface was torn down and brought back up
    Reactivated,
}

impl std::fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileAction::None => write!(f, "no change"),
            ReconcileAction::Activated => write!(f, "activated"),
            ReconcileAction::Reactivated => write!(f, "reactivated"),
        }
    }
}

/// Peer configuration observed on the live interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub public_key: String,
    pub endpoint: String,
    pub address: String,
}

impl PeerSnapshot {
    fn matches(&self, desired: &TunnelPeerConfig) -> bool {
        self.public_key == desired.peer_public_key
            && self.endpoint == desired.endpoint
            && self.address == desired.address
    }
}

/// Capability interface over the external tunnel-management facility
pub trait TunnelControl {
    /// Observe the live interface: `None` when absent
    fn current(&self) -> Result<Option<PeerSnapshot>, TunnelError>;

    /// Bring the interface up with the desired configuration
    fn activate(&self, desired: &TunnelPeerConfig) -> Result<(), TunnelError>;

    /// Tear the interface down
    fn deactivate(&self) -> Result<(), TunnelError>;
}

/// Capability interface for end-to-end connectivity verification
pub trait ConnectivityProbe {
    /// The public IP the host currently egresses through
    fn public_ip(&self) -> Result<Ipv4Addr, TunnelError>;
}

pub struct Reconciler<'a, C: TunnelControl> {
    control: &'a C,
    retry: &'a RetryPolicy,
    probe: Option<&'a dyn ConnectivityProbe>,
}

impl<'a, C: TunnelControl> Reconciler<'a, C> {
    pub fn new(control: &'a C, retry: &'a RetryPolicy) -> Self {
        Self {
            control,
            retry,
            probe: None,
        }
    }

    /// Verify connectivity through `probe` after any state transition,
    /// and on the steady-state tick.
    pub fn with_probe(mut self, probe: &'a dyn ConnectivityProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Derive the live tunnel state without mutating anything
    pub fn observe(&self, desired: &TunnelPeerConfig) -> Result<TunnelState, TunnelError> {
        Ok(match self.control.current()? {
            None => TunnelState::Down,
            Some(snapshot) if snapshot.matches(desired) => TunnelState::UpMatching,
            Some(_) => TunnelState::UpStale,
        })
    }

    /// Bring the live tunnel to the desired configuration.
    ///
    /// The desired config is fully computed before this is called, so a
    /// failure here leaves the interface Down rather than half-applied.
    pub fn reconcile(
        &self,
        desired: &TunnelPeerConfig,
    ) -> Result<(ReconcileAction, TunnelState), TunnelError> {
        let observed = self.observe(desired)?;
        debug!(state = %observed, "observed tunnel state");

        let action = match observed {
            TunnelState::UpMatching => match self.verified(desired) {
                Ok(()) => {
                    debug!("tunnel already matches desired configuration");
                    ReconcileAction::None
                }
                Err(e) => {
                    info!(error = %e, "tunnel matches on paper but fails verification");
                    self.teardown()?;
                    self.activate(desired)?;
                    info!("tunnel reactivated");
                    ReconcileAction::Reactivated
                }
            },
            TunnelState::Down => {
                self.activate(desired)?;
                info!("tunnel activated");
                ReconcileAction::Activated
            }
            TunnelState::UpStale => {
                info!("tunnel configuration is stale, reconfiguring");
                self.teardown()?;
                self.activate(desired)?;
                info!("tunnel reactivated");
                ReconcileAction::Reactivated
            }
        };
        Ok((action, TunnelState::UpMatching))
    }

    /// One activation attempt is `up` plus the connectivity check; a
    /// tunnel that comes up routing to the wrong place is torn down
    /// before the next attempt.
    fn activate(&self, desired: &TunnelPeerConfig) -> Result<(), TunnelError> {
        retry(self.retry, "tunnel_activate", || {
            self.control.activate(desired)?;
            if let Err(e) = self.verified(desired) {
                self.control.deactivate()?;
                return Err(e);
            }
            Ok(())
        })
        .map(|_| ())
        .map_err(|e| e.into_last())
    }

    fn teardown(&self) -> Result<(), TunnelError> {
        retry(self.retry, "tunnel_teardown", || self.control.deactivate())
            .map(|_| ())
            .map_err(|e| e.into_last())
    }

    /// Confirm the host egresses through the desired endpoint. The probe
    /// fetch itself is retried; the comparison is done once on the
    /// fetched address.
    fn verified(&self, desired: &TunnelPeerConfig) -> Result<(), TunnelError> {
        let Some(probe) = self.probe else {
            return Ok(());
        };
        let observed = retry(self.retry, "public_ip_probe", || probe.public_ip())
            .map_err(|e| e.into_last())?
            .into_inner();
        if observed != desired.endpoint_ip {
            return Err(TunnelError::RouteMismatch {
                expected: desired.endpoint_ip,
                observed,
            });
        }
        debug!(%observed, "egress address matches the tunnel endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;

    fn desired() -> TunnelPeerConfig {
        TunnelPeerConfig {
            private_key: KeyPair::generate().private,
            address: "10.20.30.40".into(),
            dns: Ipv4Addr::new(10, 0, 0, 241),
            peer_public_key: "server-pubkey".into(),
            endpoint: "4.3.2.1:1337".into(),
            hostname: "toronto401".into(),
            endpoint_ip: Ipv4Addr::new(4, 3, 2, 1),
        }
    }

    #[derive(Default)]
    struct FakeControl {
        live: RefCell<Option<PeerSnapshot>>,
        activations: RefCell<u32>,
        teardowns: RefCell<u32>,
        fail_activations: RefCell<u32>,
        fail_teardowns: RefCell<u32>,
    }

    impl FakeControl {
        fn with_live(snapshot: PeerSnapshot) -> Self {
            Self {
                live: RefCell::new(Some(snapshot)),
                ..Default::default()
            }
        }

        fn matching(desired: &TunnelPeerConfig) -> PeerSnapshot {
            PeerSnapshot {
                public_key: desired.peer_public_key.clone(),
                endpoint: desired.endpoint.clone(),
                address: desired.address.clone(),
            }
        }
    }

    impl TunnelControl for FakeControl {
        fn current(&self) -> Result<Option<PeerSnapshot>, TunnelError> {
            Ok(self.live.borrow().clone())
        }

        fn activate(&self, desired: &TunnelPeerConfig) -> Result<(), TunnelError> {
            if *self.fail_activations.borrow() > 0 {
                *self.fail_activations.borrow_mut() -= 1;
                return Err(TunnelError::ActivationFailed {
                    reason: "injected".into(),
                });
            }
            *self.activations.borrow_mut() += 1;
            *self.live.borrow_mut() = Some(Self::matching(desired));
            Ok(())
        }

        fn deactivate(&self) -> Result<(), TunnelError> {
            if *self.fail_teardowns.borrow() > 0 {
                *self.fail_teardowns.borrow_mut() -= 1;
                return Err(TunnelError::TeardownFailed {
                    reason: "injected".into(),
                });
            }
            *self.teardowns.borrow_mut() += 1;
            *self.live.borrow_mut() = None;
            Ok(())
        }
    }

    /// Probe returning a scripted sequence of addresses; the last entry
    /// repeats once the script is exhausted.
    struct FakeProbe {
        ips: RefCell<Vec<Ipv4Addr>>,
        fail_probes: RefCell<u32>,
        calls: RefCell<u32>,
    }

    impl FakeProbe {
        fn with_ips(ips: Vec<Ipv4Addr>) -> Self {
            Self {
                ips: RefCell::new(ips),
                fail_probes: RefCell::new(0),
                calls: RefCell::new(0),
            }
        }
    }

    impl ConnectivityProbe for FakeProbe {
        fn public_ip(&self) -> Result<Ipv4Addr, TunnelError> {
            *self.calls.borrow_mut() += 1;
            if *self.fail_probes.borrow() > 0 {
                *self.fail_probes.borrow_mut() -= 1;
                return Err(TunnelError::ProbeFailed {
                    reason: "injected".into(),
                });
            }
            let mut ips = self.ips.borrow_mut();
            if ips.len() > 1 {
                Ok(ips.remove(0))
            } else {
                Ok(ips[0])
            }
        }
    }

    fn endpoint_ip() -> Ipv4Addr {
        Ipv4Addr::new(4, 3, 2, 1)
    }

    fn wrong_ip() -> Ipv4Addr {
        Ipv4Addr::new(9, 9, 9, 9)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            multiplier: 2,
            max_delay: std::time::Duration::from_millis(2),
        }
    }

    #[test]
    fn down_activates_once() {
        let control = FakeControl::default();
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy);

        let (action, state) = reconciler.reconcile(&desired()).unwrap();
        assert_eq!(action, ReconcileAction::Activated);
        assert_eq!(state, TunnelState::UpMatching);
        assert_eq!(*control.activations.borrow(), 1);
        assert_eq!(*control.teardowns.borrow(), 0);
    }

    #[test]
    fn matching_interface_is_left_alone() {
        let config = desired();
        let control = FakeControl::with_live(FakeControl::matching(&config));
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy);

        let (action, _) = reconciler.reconcile(&config).unwrap();
        assert_eq!(action, ReconcileAction::None);
        assert_eq!(*control.activations.borrow(), 0);
        assert_eq!(*control.teardowns.borrow(), 0);
    }

    #[test]
    fn stale_peer_key_triggers_one_teardown_and_one_activation() {
        let config = desired();
        let mut stale = FakeControl::matching(&config);
        stale.public_key = "previous-server-key".into();
        let control = FakeControl::with_live(stale);
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy);

        let (action, state) = reconciler.reconcile(&config).unwrap();
        assert_eq!(action, ReconcileAction::Reactivated);
        assert_eq!(state, TunnelState::UpMatching);
        assert_eq!(*control.teardowns.borrow(), 1);
        assert_eq!(*control.activations.borrow(), 1);
    }

    #[test]
    fn stale_endpoint_is_detected() {
        let config = desired();
        let mut stale = FakeControl::matching(&config);
        stale.endpoint = "9.9.9.9:1337".into();
        let control = FakeControl::with_live(stale);
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy);

        assert_eq!(reconciler.observe(&config).unwrap(), TunnelState::UpStale);
    }

    #[test]
    fn activation_retries_transient_failures() {
        let control = FakeControl {
            fail_activations: RefCell::new(2),
            ..Default::default()
        };
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy);

        let (action, _) = reconciler.reconcile(&desired()).unwrap();
        assert_eq!(action, ReconcileAction::Activated);
        assert_eq!(*control.activations.borrow(), 1);
    }

    #[test]
    fn activation_exhaustion_is_fatal_and_leaves_tunnel_down() {
        let control = FakeControl {
            fail_activations: RefCell::new(10),
            ..Default::default()
        };
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy);

        let err = reconciler.reconcile(&desired()).unwrap_err();
        assert!(matches!(err, TunnelError::ActivationFailed { .. }));
        assert!(control.live.borrow().is_none(), "tunnel must stay down");
    }

    #[test]
    fn teardown_transient_failure_is_retried() {
        let config = desired();
        let mut stale = FakeControl::matching(&config);
        stale.public_key = "previous-server-key".into();
        let control = FakeControl {
            fail_teardowns: RefCell::new(1),
            ..FakeControl::with_live(stale)
        };
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy);

        let (action, _) = reconciler.reconcile(&config).unwrap();
        assert_eq!(action, ReconcileAction::Reactivated);
        assert_eq!(*control.teardowns.borrow(), 1);
        assert_eq!(*control.activations.borrow(), 1);
    }

    #[test]
    fn verified_matching_tunnel_is_left_alone() {
        let config = desired();
        let control = FakeControl::with_live(FakeControl::matching(&config));
        let probe = FakeProbe::with_ips(vec![endpoint_ip()]);
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy).with_probe(&probe);

        let (action, _) = reconciler.reconcile(&config).unwrap();
        assert_eq!(action, ReconcileAction::None);
        assert_eq!(*probe.calls.borrow(), 1);
        assert_eq!(*control.activations.borrow(), 0);
    }

    #[test]
    fn matching_artifact_with_wrong_egress_is_reactivated() {
        let config = desired();
        let control = FakeControl::with_live(FakeControl::matching(&config));
        let probe = FakeProbe::with_ips(vec![wrong_ip(), endpoint_ip()]);
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy).with_probe(&probe);

        let (action, state) = reconciler.reconcile(&config).unwrap();
        assert_eq!(action, ReconcileAction::Reactivated);
        assert_eq!(state, TunnelState::UpMatching);
        assert_eq!(*control.teardowns.borrow(), 1);
        assert_eq!(*control.activations.borrow(), 1);
    }

    #[test]
    fn wrong_egress_after_activation_retries_the_whole_attempt() {
        let control = FakeControl::default();
        let probe = FakeProbe::with_ips(vec![wrong_ip(), endpoint_ip()]);
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy).with_probe(&probe);

        let (action, _) = reconciler.reconcile(&desired()).unwrap();
        assert_eq!(action, ReconcileAction::Activated);
        // First attempt came up routing elsewhere and was torn down
        assert_eq!(*control.activations.borrow(), 2);
        assert_eq!(*control.teardowns.borrow(), 1);
    }

    #[test]
    fn transient_probe_failures_are_retried_without_reactivation() {
        let config = desired();
        let control = FakeControl::with_live(FakeControl::matching(&config));
        let probe = FakeProbe::with_ips(vec![endpoint_ip()]);
        *probe.fail_probes.borrow_mut() = 2;
        let policy = fast_policy();
        let reconciler = Reconciler::new(&control, &policy).with_probe(&probe);

        let (action, _) = reconciler.reconcile(&config).unwrap();
        assert_eq!(action, ReconcileAction::None);
        assert_eq!(*probe.calls.borrow(), 3);
        assert_eq!(*control.teardowns.borrow(), 0);
    }
}
