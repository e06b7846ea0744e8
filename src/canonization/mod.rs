//! Canonization service (spec.md §4.F).
//!
//! Owns a control plane (`CONFIGURE`/`START`, spoken only by the
//! supervisor) and a data plane: a timer-driven loop that pulls queued
//! transactions out of the data service and tries to mint one block per
//! wakeup.

use std::time::Duration;

use log::{debug, info, warn};

use crate::dataservice::{BlockCertificate, CertTransaction, DataServiceEngine, Engine};
use crate::error::{CoreError, CoreResult};
use crate::random::{os_entropy, RandomRequest};

/// Control-plane state machine. Mirrors the `CONFIGURE` → `START`
/// ordering constraint verbatim from spec.md §4.F.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Unconfigured,
    Configured,
    Running,
}

/// Parameters set by `CONFIGURE` (spec.md §4.F: `sleep_ms`,
/// `max_txns_per_block`).
#[derive(Debug, Clone, Copy)]
pub struct CanonizationConfig {
    pub sleep_ms: u64,
    pub max_txns_per_block: u64,
}

/// The canonization service's own process-local state. It retains no
/// queue state across attempts — the data service is the single source
/// of truth (spec.md §4.F, final paragraph).
pub struct CanonizationService {
    state: ControlState,
    config: Option<CanonizationConfig>,
}

impl CanonizationService {
    pub fn new() -> Self {
        Self {
            state: ControlState::Unconfigured,
            config: None,
        }
    }

    pub fn configure(&mut self, config: CanonizationConfig) -> CoreResult<()> {
        self.config = Some(config);
        self.state = ControlState::Configured;
        debug!(
            "canonization configured: sleep_ms={} max_txns_per_block={}",
            config.sleep_ms, config.max_txns_per_block
        );
        Ok(())
    }

    pub fn start(&mut self) -> CoreResult<()> {
        match self.state {
            ControlState::Running => Err(CoreError::from(crate::error::ALREADY_RUNNING)),
            ControlState::Unconfigured => {
                Err(CoreError::from(crate::error::START_BEFORE_CONFIGURE))
            }
            ControlState::Configured => {
                self.state = ControlState::Running;
                info!("canonization service started");
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ControlState::Running
    }

    pub fn config(&self) -> Option<CanonizationConfig> {
        self.config
    }

    /// Runs the data-plane loop until `exit.is_set()`. Caller must have
    /// already called `start()`.
    pub async fn run_loop<E: Engine>(
        &self,
        engine: &mut E,
        mask: &crate::capability::CapabilitySet,
        exit: &crate::reactor::ExitFlag,
    ) -> CoreResult<()> {
        let config = self
            .config
            .ok_or_else(|| CoreError::from(crate::error::START_BEFORE_CONFIGURE))?;
        while !exit.is_set() {
            crate::reactor::sleep_ms(config.sleep_ms).await;
            if exit.is_set() {
                break;
            }
            if let Err(err) = attempt_one_block(engine, mask, config.max_txns_per_block) {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!("block-make attempt skipped: {err}");
            }
        }
        Ok(())
    }
}

impl Default for CanonizationService {
    fn default() -> Self {
        Self::new()
    }
}

/// One wakeup's worth of work (spec.md §4.F data-plane steps 1-6).
fn attempt_one_block<E: Engine>(
    engine: &mut E,
    mask: &crate::capability::CapabilitySet,
    max_txns_per_block: u64,
) -> CoreResult<()> {
    let child = engine.create_child(mask)?;
    let result = try_make_block(engine, child, max_txns_per_block);
    // The child context is always released, win or lose (spec.md §4.F
    // steps 3 and 6 both end by closing it).
    let _ = engine.close_child(child);
    result
}

fn try_make_block<E: Engine>(
    engine: &mut E,
    child: u32,
    max_txns_per_block: u64,
) -> CoreResult<()> {
    let queued = engine.transaction_walk(child, max_txns_per_block as usize)?;
    if queued.is_empty() {
        return Ok(());
    }

    let latest_id = engine.latest_block_id_get(child)?;
    let latest = engine.block_get(child, latest_id)?;

    let mut new_id = [0u8; 16];
    let entropy = os_entropy(16).map_err(|e| CoreError::Fatal(anyhow::anyhow!(e)))?;
    new_id.copy_from_slice(&entropy);
    // Reserved for the random-service round trip this stands in for; a
    // real deployment issues a `RandomRequest` over the socket to the
    // random service rather than calling `os_entropy` in-process.
    let _ = RandomRequest::new(0, 16);

    let children: Vec<CertTransaction> = queued
        .iter()
        .map(|node| CertTransaction {
            txn_id: node.txn_id,
            artifact_id: node.artifact_id,
        })
        .collect();

    let cert = BlockCertificate {
        block_id: new_id,
        prev_block_id: latest_id,
        height: latest.height + 1,
        children,
    };

    engine.block_make(child, cert.encode())?;
    info!(
        "canonized block at height {} with {} transactions",
        cert.height,
        queued.len()
    );
    Ok(())
}

/// Minimum caps a canonization attempt needs (spec.md §4.F step 1: "queue
/// read/drop, block write, artifact read/update, latest-block read,
/// height-index write").
pub fn canonization_caps() -> crate::capability::CapabilitySet {
    use crate::capability::Capability;
    crate::capability::CapabilitySet::from_bits(&{
        let mut bits = vec![false; crate::capability::CAPABILITY_BITS];
        for cap in [
            Capability::TransactionGetFirst,
            Capability::TransactionGet,
            Capability::TransactionDrop,
            Capability::BlockMake,
            Capability::BlockRead,
            Capability::ArtifactRead,
            Capability::LatestBlockIdRead,
        ] {
            bits[cap as usize] = true;
        }
        bits
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_before_configure_is_rejected() {
        let mut svc = CanonizationService::new();
        assert!(svc.start().is_err());
    }

    #[test]
    fn double_start_is_already_running() {
        let mut svc = CanonizationService::new();
        svc.configure(CanonizationConfig {
            sleep_ms: 10,
            max_txns_per_block: 500,
        })
        .unwrap();
        svc.start().unwrap();
        assert!(svc.start().is_err());
    }

    #[test]
    fn configure_then_start_succeeds() {
        let mut svc = CanonizationService::new();
        svc.configure(CanonizationConfig {
            sleep_ms: 10,
            max_txns_per_block: 500,
        })
        .unwrap();
        assert!(svc.start().is_ok());
        assert!(svc.is_running());
    }

    #[test]
    fn attempt_with_empty_queue_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = DataServiceEngine::open(&dir.path().join("store.redb")).unwrap();
        let mask = canonization_caps();
        attempt_one_block(&mut engine, &mask, 10).unwrap();
    }

    #[test]
    fn attempt_canonizes_queued_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = DataServiceEngine::open(&dir.path().join("store.redb")).unwrap();
        let setup_child = engine
            .create_child(&crate::capability::CapabilitySet::all())
            .unwrap();
        let txn_id = [7u8; 16];
        let artifact_id = [8u8; 16];
        engine
            .transaction_submit(setup_child, txn_id, artifact_id, vec![1, 2, 3])
            .unwrap();
        engine.close_child(setup_child).unwrap();

        let mask = canonization_caps();
        attempt_one_block(&mut engine, &mask, 10).unwrap();

        let check_child = engine
            .create_child(&crate::capability::CapabilitySet::all())
            .unwrap();
        assert!(engine.transaction_get(check_child, txn_id).is_err());
        let (_entry, node) = engine
            .canonized_transaction_get(check_child, txn_id)
            .unwrap();
        assert_eq!(node.cert_bytes, vec![1, 2, 3]);
    }
}
