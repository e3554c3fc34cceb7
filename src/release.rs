//! EMM Context Release
//!
//! The single release path every detach flavour converges on: abort any
//! in-progress common procedure, disarm T3422, deactivate the bearer
//! contexts locally and wipe the identities and key material from the EMM
//! context. Idempotent, so overlapping detach triggers are harmless.

use crate::context::{EmmContext, UeId};
use crate::detach::EmmCore;
use crate::sm::EmmState;

impl EmmCore {
    /// Release the mobility context of a detached UE
    ///
    /// The context record itself stays in the store; ownership of the slot
    /// belongs to the user-context manager.
    pub(crate) fn clear_emm_context(&self, ue_id: UeId, ctx: &mut EmmContext) {
        for proc in ctx.procedures.drain(..) {
            log::debug!("[{ue_id}] Abort {proc} procedure");
        }
        self.disarm_t3422(ue_id, ctx);

        if let Err(e) = self.sap.esm_deactivate_all_bearers(ue_id) {
            log::error!("[{ue_id}] {e}");
        }
        ctx.esm_msg = None;

        if ctx.state() != EmmState::Deregistered {
            ctx.fsm.transition(EmmState::Deregistered);
        }

        ctx.old_guti = None;
        ctx.guti = None;
        ctx.imsi = None;
        ctx.imei = None;
        ctx.auth_vectors.clear();
        ctx.security = None;
        ctx.non_current_security = None;

        log::info!("[{ue_id}] EMM context released");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::context::{
        AuthVector, EmmContext, EmmProcedure, EpsGuti, Imei, Imsi, SecurityContext,
    };
    use crate::detach::{EmmCore, NwDetachType};
    use crate::metrics::RecordingSink;
    use crate::sap::{EsmPrimitive, SapHub, ESM_ALL_EBI};
    use crate::sm::EmmState;
    use crate::t3422::NwDetachData;

    fn populated_ctx(ue_id: u32) -> EmmContext {
        let mut ctx = EmmContext::new(ue_id);
        ctx.fsm.transition(EmmState::Registered);
        ctx.guti = Some(EpsGuti::default());
        ctx.old_guti = Some(EpsGuti::default());
        ctx.imsi = Some(Imsi::new("001010123456789"));
        ctx.imei = Some(Imei::new("3542900000000001"));
        ctx.auth_vectors.push(AuthVector::default());
        ctx.security = Some(SecurityContext::default());
        ctx.non_current_security = Some(SecurityContext::default());
        ctx.esm_msg = Some(vec![0x52, 0x00]);
        ctx.procedures.push(EmmProcedure::GutiReallocation);
        ctx
    }

    #[test]
    fn test_clear_wipes_identities_and_keys() {
        let (hub, endpoints) = SapHub::channel();
        let core = EmmCore::new(hub, Arc::new(RecordingSink::default()));
        let mut ctx = populated_ctx(1);

        core.clear_emm_context(1, &mut ctx);

        assert_eq!(ctx.state(), EmmState::Deregistered);
        assert!(ctx.guti.is_none());
        assert!(ctx.old_guti.is_none());
        assert!(ctx.imsi.is_none());
        assert!(ctx.imei.is_none());
        assert!(ctx.auth_vectors.is_empty());
        assert!(ctx.security.is_none());
        assert!(ctx.non_current_security.is_none());
        assert!(ctx.esm_msg.is_none());
        assert!(ctx.procedures.is_empty());
        assert_eq!(
            endpoints.esm.try_recv().unwrap(),
            EsmPrimitive::DeactivateBearers {
                ue_id: 1,
                ebi: ESM_ALL_EBI
            }
        );
    }

    #[test]
    fn test_clear_disarms_t3422() {
        let (hub, _endpoints) = SapHub::channel();
        let core = EmmCore::new(hub, Arc::new(RecordingSink::default()));
        let mut ctx = populated_ctx(1);
        let h = core
            .timers
            .start(6, 0, NwDetachData::new(1, NwDetachType::NoReattach));
        ctx.t3422 = Some(h);

        core.clear_emm_context(1, &mut ctx);

        assert!(ctx.t3422.is_none());
        assert!(!core.timers.is_active(h));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (hub, endpoints) = SapHub::channel();
        let core = EmmCore::new(hub, Arc::new(RecordingSink::default()));
        let mut ctx = populated_ctx(1);

        core.clear_emm_context(1, &mut ctx);
        core.clear_emm_context(1, &mut ctx);

        assert_eq!(ctx.state(), EmmState::Deregistered);
        assert!(ctx.guti.is_none());
        // The local deactivation request is re-issued; it is itself a no-op
        // on an already empty bearer set.
        assert_eq!(endpoints.esm.try_iter().count(), 2);
    }

    #[test]
    fn test_clear_survives_missing_esm_peer() {
        let (hub, endpoints) = SapHub::channel();
        drop(endpoints.esm);
        let core = EmmCore::new(hub, Arc::new(RecordingSink::default()));
        let mut ctx = populated_ctx(1);

        core.clear_emm_context(1, &mut ctx);

        assert_eq!(ctx.state(), EmmState::Deregistered);
        assert!(ctx.security.is_none());
    }
}
