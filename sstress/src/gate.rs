//! Readiness gate.
//!
//! Observes lifecycle transitions and applies at most one side effect per
//! stage: the fault-simulation overlay when the policy becomes valid, the
//! canned credential while registering, and the request for the first
//! attempt once operational. It never blocks a transition; faults are
//! expressed as policy content.

use crate::config::FaultSimulation;
use crate::policy::Policy;
use crate::system::{AUTH_IDX_ROOT, BlobKind, BlobStore, StageTransition, SystemState};
use crate::trace::{error, info};

/// Points the connectivity check at a host that answers with a redirect.
pub const CAPTIVE_PORTAL_OVERLAY: &str = r#"{"s": [{"captive_portal_detect": {"endpoint": "google.com", "http_url": "/", "port": 80}}]}"#;

/// Points the connectivity check at a port nothing listens on.
pub const NO_INTERNET_OVERLAY: &str = r#"{"s": [{"captive_portal_detect": {"endpoint": "warmcat.com", "http_url": "/", "port": 999}}]}"#;

/// Refresh-token grant seeded into the root auth blob when it is empty.
pub const CANNED_ROOT_GRANT: &str = "grant_type=refresh_token\
    &refresh_token=Atzr|sstress-canned-root-token-0001\
    &client_id=sstress.application.0001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEffect {
    PolicyOverlay(FaultSimulation),
    CredentialSeeded,
    StartAttempts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Applied(GateEffect),
}

/// State the gate may touch during a transition.
pub struct GateContext<'a> {
    pub policy: &'a mut Policy,
    pub blobs: &'a mut BlobStore,
}

#[derive(Debug)]
pub struct ReadinessGate {
    fault: FaultSimulation,
    overlay_done: bool,
    attempts_requested: bool,
}

impl ReadinessGate {
    #[must_use]
    pub const fn new(fault: FaultSimulation) -> Self {
        Self {
            fault,
            overlay_done: false,
            attempts_requested: false,
        }
    }

    pub fn handle(&mut self, transition: StageTransition, ctx: &mut GateContext<'_>) -> GateDecision {
        match (transition.target, transition.is_arrival()) {
            (SystemState::PolicyValid, true) => self.overlay(ctx),
            (SystemState::Registered, false) => Self::seed_credential(ctx),
            (SystemState::Operational, true) if !self.attempts_requested => {
                self.attempts_requested = true;
                info!("operational, requesting first attempt");
                GateDecision::Applied(GateEffect::StartAttempts)
            }
            _ => GateDecision::Proceed,
        }
    }

    fn overlay(&mut self, ctx: &mut GateContext<'_>) -> GateDecision {
        if self.overlay_done {
            return GateDecision::Proceed;
        }
        let overlay = match self.fault {
            FaultSimulation::None => return GateDecision::Proceed,
            FaultSimulation::CaptivePortal => CAPTIVE_PORTAL_OVERLAY,
            FaultSimulation::NoInternet => NO_INTERNET_OVERLAY,
        };
        self.overlay_done = true;
        match ctx.policy.apply_overlay(overlay) {
            Ok(()) => {
                info!(fault = ?self.fault, "applied fault-simulation overlay");
                GateDecision::Applied(GateEffect::PolicyOverlay(self.fault))
            }
            Err(e) => {
                error!(error = %e, "fault-simulation overlay rejected");
                GateDecision::Proceed
            }
        }
    }

    fn seed_credential(ctx: &mut GateContext<'_>) -> GateDecision {
        let kind = BlobKind::Auth(AUTH_IDX_ROOT);
        if ctx.blobs.size(kind) != 0 {
            return GateDecision::Proceed;
        }
        ctx.blobs.direct_set(kind, CANNED_ROOT_GRANT.as_bytes());
        info!("seeded root auth blob");
        GateDecision::Applied(GateEffect::CredentialSeeded)
    }
}
