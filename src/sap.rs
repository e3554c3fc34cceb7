//! Service Access Points
//!
//! Typed primitives the detach procedure hands off to its sibling tasks:
//! EMM-AS (NAS transmission towards the UE), ESM (bearer release), EMMREG
//! (mobility FSM registry), the SGs gateway and the application level user
//! context manager. Each SAP is a dedicated channel; dispatch is a
//! non-blocking hand-off and the core owns only the sending side.

use std::sync::mpsc::{channel, Receiver, Sender};

use thiserror::Error;

use crate::context::{EpsGuti, SecurityContext, UeId, NAS_KSI_NO_KEY_IS_AVAILABLE};
use crate::detach::{NwDetachType, SgsDetachType};

/// All-bearers sentinel for the ESM deactivation primitive
pub const ESM_ALL_EBI: u8 = 0xff;

/// SAP dispatch error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SapError {
    /// The peer task is gone and the primitive could not be handed off
    #[error("{0} SAP send failed")]
    SendFailed(&'static str),
}

/// SAP operation result
pub type SapResult = Result<(), SapError>;

// ============================================================================
// EMM-AS SAP
// ============================================================================

/// NAS information to transfer in a `DataReq`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasInfo {
    /// DETACH REQUEST (to UE), carrying the 1-octet network detach type
    DetachRequest {
        /// Network initiated detach type
        detach_type: NwDetachType,
    },
    /// DETACH ACCEPT, no payload
    DetachAccept,
}

/// EPS NAS security data descriptor for the access stratum encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityData {
    /// Key set identifier
    pub ksi: u8,
    /// True if the key set identifier is of native type
    pub ksi_native: bool,
    /// A new security context is taken into use
    pub new_security_context: bool,
    /// Current and non-current contexts are merged
    pub security_contexts_merged: bool,
}

impl SecurityData {
    /// Derive the descriptor from the UE's current security context
    pub fn from_context(
        security: Option<&SecurityContext>,
        new_security_context: bool,
        security_contexts_merged: bool,
    ) -> Self {
        match security {
            Some(sec) => Self {
                ksi: sec.ksi.ksi,
                ksi_native: sec.ksi.tsc == 0,
                new_security_context,
                security_contexts_merged,
            },
            None => Self {
                ksi: NAS_KSI_NO_KEY_IS_AVAILABLE,
                ksi_native: true,
                new_security_context,
                security_contexts_merged,
            },
        }
    }
}

/// EMM-AS data request towards the access stratum
///
/// The NAS message body is left to the access stratum encoder; the core
/// only names the message and supplies the security descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReq {
    /// UE identifier
    pub ue_id: UeId,
    /// NAS information to encode
    pub info: NasInfo,
    /// Pre-encoded NAS message, if any
    pub nas_msg: Option<Vec<u8>>,
    /// GUTI to include, if any
    pub guti: Option<EpsGuti>,
    /// Security data descriptor
    pub sctx: SecurityData,
}

// ============================================================================
// Sibling Task Primitives
// ============================================================================

/// ESM SAP primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsmPrimitive {
    /// Deactivate EPS bearer contexts locally, without peer signalling
    DeactivateBearers {
        /// UE identifier
        ue_id: UeId,
        /// EPS bearer identity selector (`ESM_ALL_EBI` for all bearers)
        ebi: u8,
    },
}

/// EMMREG SAP primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmRegPrimitive {
    /// The UE has been detached
    DetachReq {
        /// UE identifier
        ue_id: UeId,
    },
}

/// SGs gateway primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgsPrimitive {
    /// Trigger an SGs detach indication towards the VLR
    DetachReq {
        /// UE identifier
        ue_id: UeId,
        /// SGS detach type
        detach_type: SgsDetachType,
    },
}

/// Application level user-context manager primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppPrimitive {
    /// Release any residual application state for the UE
    DetachReq {
        /// UE identifier
        ue_id: UeId,
    },
}

// ============================================================================
// SAP Hub
// ============================================================================

/// Sending side of every SAP the detach procedure consumes
pub struct SapHub {
    emm_as: Sender<DataReq>,
    esm: Sender<EsmPrimitive>,
    emm_reg: Sender<EmmRegPrimitive>,
    sgs: Sender<SgsPrimitive>,
    app: Sender<AppPrimitive>,
}

/// Receiving side of every SAP, owned by the sibling tasks
pub struct SapEndpoints {
    /// EMM-AS data requests
    pub emm_as: Receiver<DataReq>,
    /// ESM primitives
    pub esm: Receiver<EsmPrimitive>,
    /// EMMREG primitives
    pub emm_reg: Receiver<EmmRegPrimitive>,
    /// SGs primitives
    pub sgs: Receiver<SgsPrimitive>,
    /// Application primitives
    pub app: Receiver<AppPrimitive>,
}

impl SapHub {
    /// Create the hub together with the receiving endpoints
    pub fn channel() -> (SapHub, SapEndpoints) {
        let (emm_as_tx, emm_as_rx) = channel();
        let (esm_tx, esm_rx) = channel();
        let (emm_reg_tx, emm_reg_rx) = channel();
        let (sgs_tx, sgs_rx) = channel();
        let (app_tx, app_rx) = channel();
        (
            SapHub {
                emm_as: emm_as_tx,
                esm: esm_tx,
                emm_reg: emm_reg_tx,
                sgs: sgs_tx,
                app: app_tx,
            },
            SapEndpoints {
                emm_as: emm_as_rx,
                esm: esm_rx,
                emm_reg: emm_reg_rx,
                sgs: sgs_rx,
                app: app_rx,
            },
        )
    }

    /// Hand a NAS data request to the access stratum
    pub fn data_req(&self, req: DataReq) -> SapResult {
        self.emm_as
            .send(req)
            .map_err(|_| SapError::SendFailed("EMM-AS"))
    }

    /// Ask the session manager to deactivate every bearer of the UE
    pub fn esm_deactivate_all_bearers(&self, ue_id: UeId) -> SapResult {
        self.esm
            .send(EsmPrimitive::DeactivateBearers {
                ue_id,
                ebi: ESM_ALL_EBI,
            })
            .map_err(|_| SapError::SendFailed("ESM"))
    }

    /// Notify the mobility FSM registry that the UE has been detached
    pub fn emm_reg_detach_req(&self, ue_id: UeId) -> SapResult {
        self.emm_reg
            .send(EmmRegPrimitive::DetachReq { ue_id })
            .map_err(|_| SapError::SendFailed("EMMREG"))
    }

    /// Notify the SGs gateway task of a non-EPS detach
    pub fn sgs_detach_req(&self, ue_id: UeId, detach_type: SgsDetachType) -> SapResult {
        self.sgs
            .send(SgsPrimitive::DetachReq {
                ue_id,
                detach_type,
            })
            .map_err(|_| SapError::SendFailed("SGS"))
    }

    /// Ask the user-context manager to clean up application state
    pub fn app_detach_req(&self, ue_id: UeId) -> SapResult {
        self.app
            .send(AppPrimitive::DetachReq { ue_id })
            .map_err(|_| SapError::SendFailed("APP"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NasKsi;

    #[test]
    fn test_data_req_hand_off() {
        let (hub, endpoints) = SapHub::channel();
        let req = DataReq {
            ue_id: 1,
            info: NasInfo::DetachAccept,
            nas_msg: None,
            guti: None,
            sctx: SecurityData::from_context(None, false, true),
        };
        hub.data_req(req.clone()).unwrap();
        assert_eq!(endpoints.emm_as.try_recv().unwrap(), req);
    }

    #[test]
    fn test_data_req_fails_when_peer_is_gone() {
        let (hub, endpoints) = SapHub::channel();
        drop(endpoints.emm_as);
        let req = DataReq {
            ue_id: 1,
            info: NasInfo::DetachAccept,
            nas_msg: None,
            guti: None,
            sctx: SecurityData::from_context(None, false, true),
        };
        assert_eq!(hub.data_req(req), Err(SapError::SendFailed("EMM-AS")));
    }

    #[test]
    fn test_esm_deactivation_carries_all_ebi_sentinel() {
        let (hub, endpoints) = SapHub::channel();
        hub.esm_deactivate_all_bearers(9).unwrap();
        assert_eq!(
            endpoints.esm.try_recv().unwrap(),
            EsmPrimitive::DeactivateBearers {
                ue_id: 9,
                ebi: ESM_ALL_EBI
            }
        );
    }

    #[test]
    fn test_security_data_without_context() {
        let sctx = SecurityData::from_context(None, false, true);
        assert_eq!(sctx.ksi, NAS_KSI_NO_KEY_IS_AVAILABLE);
        assert!(sctx.ksi_native);
        assert!(!sctx.new_security_context);
        assert!(sctx.security_contexts_merged);
    }

    #[test]
    fn test_security_data_from_context() {
        let sec = SecurityContext {
            ksi: NasKsi { tsc: 0, ksi: 3 },
            ..Default::default()
        };
        let sctx = SecurityData::from_context(Some(&sec), false, true);
        assert_eq!(sctx.ksi, 3);
        assert!(sctx.ksi_native);
    }
}
