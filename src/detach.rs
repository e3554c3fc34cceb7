//! EMM Detach Procedure
//!
//! Implements the detach related EMM procedure executed by the NAS task:
//! the UE initiated detach (3GPP TS 24.301, section 5.5.2.2.2), the network
//! initiated detach guarded by T3422 (section 5.5.2.3.1), detach accept
//! processing and the SGS detach for non-EPS services.

use std::sync::Arc;

use thiserror::Error;

use crate::context::{
    AttachType, EmmContext, EpsGuti, Imei, Imsi, UeId, UeStore, FEATURE_CSFB_SMS, FEATURE_SMS,
};
use crate::metrics::{CounterSink, UE_DETACH};
use crate::sap::{DataReq, NasInfo, SapHub, SecurityData};
use crate::sm::EmmState;
use crate::t3422::{NwDetachData, TimerScheduler, DETACH_REQ_COUNTER_MAX};

// ============================================================================
// Detach Types
// ============================================================================

/// Detach type signalled by the UE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachType {
    /// EPS detach
    #[default]
    EpsOnly,
    /// IMSI detach
    ImsiOnly,
    /// Combined EPS/IMSI detach
    Combined,
    /// Re-attach required
    ReattachRequired,
    /// Re-attach not required
    ReattachNotRequired,
    /// Reserved
    Reserved,
}

impl DetachType {
    /// Decode the 3-bit detach type of the DETACH REQUEST type octet
    pub fn from_iei(bits: u8) -> Self {
        match bits & 0x07 {
            1 => DetachType::EpsOnly,
            2 => DetachType::ImsiOnly,
            3 => DetachType::Combined,
            4 => DetachType::ReattachRequired,
            5 => DetachType::ReattachNotRequired,
            _ => DetachType::Reserved,
        }
    }

    /// Human readable label, for logging only
    pub fn label(&self) -> &'static str {
        match self {
            DetachType::EpsOnly => "EPS",
            DetachType::ImsiOnly => "IMSI",
            DetachType::Combined => "EPS/IMSI",
            DetachType::ReattachRequired => "RE-ATTACH REQUIRED",
            DetachType::ReattachNotRequired => "RE-ATTACH NOT REQUIRED",
            DetachType::Reserved => "RESERVED",
        }
    }
}

/// Detach type signalled to the UE on the network initiated path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NwDetachType {
    /// Re-attach required
    Reattach = 1,
    /// Re-attach not required
    NoReattach = 2,
    /// IMSI detach
    ImsiDetach = 3,
}

impl NwDetachType {
    /// Human readable label, for logging only
    pub fn label(&self) -> &'static str {
        match self {
            NwDetachType::Reattach => "RE-ATTACH REQUIRED",
            NwDetachType::NoReattach => "RE-ATTACH NOT REQUIRED",
            NwDetachType::ImsiDetach => "IMSI DETACH",
        }
    }
}

/// SGS detach type for non-EPS service registration teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgsDetachType {
    /// EPS detach
    EpsOnly,
    /// UE initiated explicit non-EPS detach
    UeExplicitNonEps,
    /// Combined detach
    Combined,
    /// Network initiated EPS detach
    NwInitiatedEps,
    /// Network initiated implicit non-EPS detach
    NwInitiatedImplicitNonEps,
    /// Reserved
    Reserved,
}

impl SgsDetachType {
    /// Human readable label, for logging only
    pub fn label(&self) -> &'static str {
        match self {
            SgsDetachType::EpsOnly => "EPS",
            SgsDetachType::UeExplicitNonEps => "UE-INITIATED-EXPLICIT-NONEPS",
            SgsDetachType::Combined => "COMBINED",
            SgsDetachType::NwInitiatedEps => "NW-INITIATED-EPS",
            SgsDetachType::NwInitiatedImplicitNonEps => "NW-INITIATED-IMPLICIT-NONEPS",
            SgsDetachType::Reserved => "RESERVED",
        }
    }
}

// ============================================================================
// Detach Request Parameters
// ============================================================================

/// Parsed DETACH REQUEST information elements, owned by the procedure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetachRequestParams {
    /// Detach type
    pub detach_type: DetachType,
    /// The UE is switching off
    pub switch_off: bool,
    /// GUTI, if provided by the UE
    pub guti: Option<EpsGuti>,
    /// IMSI, if provided by the UE
    pub imsi: Option<Imsi>,
    /// IMEI, if provided by the UE
    pub imei: Option<Imei>,
}

/// Decode the DETACH REQUEST type octet into (detach type, switch-off, KSI)
pub fn parse_detach_request_iei(octet: u8) -> (DetachType, bool, u8) {
    let detach_type = DetachType::from_iei(octet & 0x07);
    let switch_off = (octet & 0x08) != 0;
    let nas_ksi = (octet >> 4) & 0x07;
    (detach_type, switch_off, nas_ksi)
}

// ============================================================================
// Errors
// ============================================================================

/// Detach procedure error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmmError {
    /// The UE identifier does not resolve to an EMM context
    #[error("no EMM context exists for the UE (ue_id={0})")]
    UnknownSubscriber(UeId),
    /// The access stratum could not transmit the NAS message
    #[error("failed to transmit {0} (ue_id={1})")]
    TransmitFailure(&'static str, UeId),
    /// T3422 fired for a UE whose EMM context is gone
    #[error("T3422 expiry without EMM context (ue_id={0})")]
    InvariantViolation(UeId),
}

// ============================================================================
// EMM Core
// ============================================================================

/// The detach slice of the mobility task
///
/// Owns the UE context store, the T3422 scheduler and the sending side of
/// every SAP. All operations run to completion on the single NAS task;
/// there are no suspension points within an operation.
pub struct EmmCore {
    /// UE context store
    pub(crate) ues: UeStore,
    /// SAP senders towards sibling tasks
    pub(crate) sap: SapHub,
    /// T3422 scheduler
    pub(crate) timers: TimerScheduler,
    /// Counter sink
    pub(crate) counters: Arc<dyn CounterSink>,
}

impl EmmCore {
    /// Create the core around a SAP hub and counter sink
    pub fn new(sap: SapHub, counters: Arc<dyn CounterSink>) -> Self {
        Self {
            ues: UeStore::new(),
            sap,
            timers: TimerScheduler::new(),
            counters,
        }
    }

    /// UE context store
    pub fn ues(&self) -> &UeStore {
        &self.ues
    }

    // ------------------------------------------------------------------------
    // UE initiated detach
    // ------------------------------------------------------------------------

    /// Handle a DETACH REQUEST received from the UE
    ///
    /// Sends DETACH ACCEPT unless the UE is switching off, deactivates the
    /// EPS bearer contexts locally and enters state EMM-DEREGISTERED. An
    /// IMSI-only detach leaves the EPS registration and context untouched.
    /// The UE's view is honoured best-effort: a missing context is reported
    /// to the user-context manager and the operation still succeeds.
    pub fn detach_request(
        &self,
        ue_id: UeId,
        params: DetachRequestParams,
    ) -> Result<(), EmmError> {
        log::info!(
            "Detach type = {} requested (ue_id={}, switch_off={})",
            params.detach_type.label(),
            ue_id,
            params.switch_off
        );

        let found = self.ues.with_ctx(ue_id, |ctx| {
            let mut transmit_ok = true;

            if params.switch_off {
                self.counters
                    .increment(UE_DETACH, 1, &[("result", "success")]);
                self.counters
                    .increment(UE_DETACH, 1, &[("action", "detach_accept_not_sent")]);
            } else {
                let sctx = SecurityData::from_context(ctx.security.as_ref(), false, true);
                let req = DataReq {
                    ue_id,
                    info: NasInfo::DetachAccept,
                    nas_msg: None,
                    guti: None,
                    sctx,
                };
                if let Err(e) = self.sap.data_req(req) {
                    log::error!("[{ue_id}] Failed to transmit DETACH ACCEPT: {e}");
                    transmit_ok = false;
                }
                self.counters
                    .increment(UE_DETACH, 1, &[("result", "success")]);
                self.counters
                    .increment(UE_DETACH, 1, &[("action", "detach_accept_sent")]);
            }

            if params.detach_type == DetachType::ImsiOnly {
                log::info!("[{ue_id}] IMSI-only detach, keeping the EMM context");
                return;
            }

            if transmit_ok {
                if let Err(e) = self.sap.emm_reg_detach_req(ue_id) {
                    log::error!("[{ue_id}] {e}");
                }
                if let Err(e) = self.sap.app_detach_req(ue_id) {
                    log::error!("[{ue_id}] {e}");
                }
            }
            self.clear_emm_context(ue_id, ctx);
        });

        if found.is_none() {
            log::warn!("No EMM context exists for the UE (ue_id={ue_id})");
            self.counters.increment(
                UE_DETACH,
                1,
                &[("result", "failure"), ("cause", "no_emm_context")],
            );
            // There may still be application level context for the UE
            if let Err(e) = self.sap.app_detach_req(ue_id) {
                log::error!("[{ue_id}] {e}");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Detach accept
    // ------------------------------------------------------------------------

    /// Handle a DETACH ACCEPT received from the UE
    ///
    /// Acknowledges a network initiated detach: stops T3422 and, unless an
    /// IMSI-only detach is in progress, releases the EMM and ESM context.
    pub fn detach_accept(&self, ue_id: UeId) -> Result<(), EmmError> {
        let found = self.ues.with_ctx(ue_id, |ctx| {
            self.disarm_t3422(ue_id, ctx);

            if !ctx.is_imsi_only_detach {
                if let Err(e) = self.sap.emm_reg_detach_req(ue_id) {
                    log::error!("[{ue_id}] {e}");
                }
                if let Err(e) = self.sap.app_detach_req(ue_id) {
                    log::error!("[{ue_id}] {e}");
                }
                self.clear_emm_context(ue_id, ctx);
            }
            ctx.is_imsi_only_detach = false;
        });

        if found.is_none() {
            log::warn!("No EMM context exists for the UE (ue_id={ue_id})");
            if let Err(e) = self.sap.app_detach_req(ue_id) {
                log::error!("[{ue_id}] {e}");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Network initiated detach
    // ------------------------------------------------------------------------

    /// Initiate a network initiated detach by sending DETACH REQUEST to the
    /// UE and starting T3422
    ///
    /// In state EMM-REGISTERED the transmission moves the UE to state
    /// EMM-DEREGISTERED-INITIATED. A missing context is a hard error on
    /// this path.
    pub fn nw_initiated_detach_request(
        &self,
        ue_id: UeId,
        detach_type: NwDetachType,
    ) -> Result<(), EmmError> {
        log::info!(
            "NW Initiated Detach type = {} requested (ue_id={})",
            detach_type.label(),
            ue_id
        );
        self.nw_detach_transmit(ue_id, detach_type, None)
    }

    /// Transmit DETACH REQUEST and (re)arm T3422
    ///
    /// `carried` is the retransmission record handed back by the expiry
    /// path; a record reclaimed from a still pending timer takes precedence
    /// so the accumulated retransmission count is never lost.
    fn nw_detach_transmit(
        &self,
        ue_id: UeId,
        detach_type: NwDetachType,
        carried: Option<NwDetachData>,
    ) -> Result<(), EmmError> {
        let res = self.ues.with_ctx(ue_id, |ctx| {
            let sctx = SecurityData::from_context(ctx.security.as_ref(), false, true);
            let req = DataReq {
                ue_id,
                info: NasInfo::DetachRequest { detach_type },
                nas_msg: None,
                guti: None,
                sctx,
            };
            if let Err(e) = self.sap.data_req(req) {
                log::error!("[{ue_id}] Failed to transmit DETACH REQUEST: {e}");
                return Err(EmmError::TransmitFailure("DETACH REQUEST", ue_id));
            }

            let data = match ctx.t3422.take() {
                Some(handle) => self.timers.stop(handle),
                None => carried,
            }
            .unwrap_or_else(|| NwDetachData::new(ue_id, detach_type));

            let handle = self.timers.start(ctx.t3422_sec, 0, data);
            log::debug!(
                "[{ue_id}] Start timer T3422 ({}s, retransmission counter = {})",
                ctx.t3422_sec,
                data.retransmission_count
            );
            ctx.t3422 = Some(handle);

            if ctx.state() == EmmState::Registered {
                ctx.fsm.transition(EmmState::DeregisteredInitiated);
            }
            Ok(())
        });

        match res {
            Some(r) => r,
            None => {
                log::warn!("No EMM context exists for the UE (ue_id={ue_id})");
                Err(EmmError::UnknownSubscriber(ue_id))
            }
        }
    }

    /// T3422 expiry path
    ///
    /// Retransmits the DETACH REQUEST until the retransmission ceiling is
    /// reached, then aborts the procedure and performs an implicit detach
    /// (unless the pending detach is an IMSI detach).
    pub(crate) fn t3422_expired(&self, mut data: NwDetachData) -> Result<(), EmmError> {
        let ue_id = data.ue_id;
        data.retransmission_count += 1;
        log::warn!(
            "T3422 timer expired, retransmission counter = {} (ue_id={})",
            data.retransmission_count,
            ue_id
        );

        // The scheduler already reclaimed the entry; drop the stale handle
        // before any rearm.
        self.ues
            .with_ctx(ue_id, |ctx| ctx.t3422 = None)
            .ok_or(EmmError::InvariantViolation(ue_id))?;

        if data.retransmission_count < DETACH_REQ_COUNTER_MAX {
            self.nw_detach_transmit(ue_id, data.detach_type, Some(data))
        } else if data.detach_type != NwDetachType::ImsiDetach {
            // Abort the detach procedure and perform implicit detach
            let params = DetachRequestParams {
                detach_type: DetachType::EpsOnly,
                switch_off: false,
                guti: None,
                imsi: None,
                imei: None,
            };
            self.detach_request(ue_id, params)
        } else {
            Ok(())
        }
    }

    /// Drain expired T3422 timers and run the expiry path for each
    ///
    /// Errors other than an invariant violation are logged and the task
    /// continues; they never cross over to another UE.
    pub fn process_expired_timers(&self) -> Result<usize, EmmError> {
        let fired = self.timers.pop_expired();
        let n = fired.len();
        for data in fired {
            match self.t3422_expired(data) {
                Ok(()) => {}
                Err(e @ EmmError::InvariantViolation(_)) => return Err(e),
                Err(e) => log::error!("T3422 expiry handling failed: {e}"),
            }
        }
        Ok(n)
    }

    /// Stop T3422 and release its retransmission record, if running
    pub(crate) fn disarm_t3422(&self, ue_id: UeId, ctx: &mut EmmContext) {
        if let Some(handle) = ctx.t3422.take() {
            if self.timers.stop(handle).is_some() {
                log::debug!("[{ue_id}] Stop timer T3422");
            }
        }
    }

    // ------------------------------------------------------------------------
    // SGS detach
    // ------------------------------------------------------------------------

    /// Handle a UE or network initiated SGS detach for non-EPS services
    ///
    /// Notifies the SGs gateway only when non-EPS service control is
    /// enabled and the UE performed a combined EPS/IMSI attach; EPS state
    /// is never torn down here.
    pub fn sgs_detach_request(
        &self,
        ue_id: UeId,
        detach_type: SgsDetachType,
    ) -> Result<(), EmmError> {
        log::info!(
            "SGS Detach type = {} requested (ue_id={})",
            detach_type.label(),
            ue_id
        );

        self.ues.with_ctx(ue_id, |ctx| {
            if ctx.has_any_feature(FEATURE_SMS | FEATURE_CSFB_SMS)
                && ctx.attach_type == AttachType::CombinedEpsImsi
            {
                if let Err(e) = self.sap.sgs_detach_req(ue_id, detach_type) {
                    log::error!("[{ue_id}] {e}");
                }
            }
        });
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
