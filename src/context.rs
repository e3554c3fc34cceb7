//! EMM Context Management
//!
//! Mobility context slice consumed by the detach procedure (identities,
//! security contexts, T3422 bookkeeping, attach type, pending procedures)
//! and the UE context store keyed by the subscriber identifier.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::sm::{EmmFsm, EmmState};
use crate::t3422::TimerHandle;

// ============================================================================
// Constants
// ============================================================================

/// MAX IMSI BCD length
pub const MAX_IMSI_BCD_LEN: usize = 15;
/// MAX IMEISV BCD length
pub const MAX_IMEISV_BCD_LEN: usize = 16;
/// Key length (KNASint / KNASenc)
pub const KEY_LEN: usize = 16;
/// KASME length
pub const SHA256_DIGEST_SIZE: usize = 32;
/// RAND length
pub const RAND_LEN: usize = 16;
/// AUTN length
pub const AUTN_LEN: usize = 16;
/// MAX RES length
pub const MAX_RES_LEN: usize = 16;

/// NAS KSI no key available
pub const NAS_KSI_NO_KEY_IS_AVAILABLE: u8 = 7;

/// SMS over SGs supported
pub const FEATURE_SMS: u32 = 1 << 0;
/// SMS over CSFB supported
pub const FEATURE_CSFB_SMS: u32 = 1 << 1;

/// Default T3422 duration (seconds)
pub const T3422_DEFAULT_SEC: u64 = 6;

/// UE identifier assigned by the user-context manager
pub type UeId = u32;

// ============================================================================
// Identities
// ============================================================================

/// PLMN ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    /// MCC digit 1
    pub mcc1: u8,
    /// MCC digit 2
    pub mcc2: u8,
    /// MCC digit 3
    pub mcc3: u8,
    /// MNC digit 1
    pub mnc1: u8,
    /// MNC digit 2
    pub mnc2: u8,
    /// MNC digit 3 (0xf if 2-digit MNC)
    pub mnc3: u8,
}

impl PlmnId {
    /// Create a new PLMN ID from MCC/MNC digit strings
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let mcc_bytes: Vec<u8> = mcc
            .chars()
            .filter_map(|c| c.to_digit(10).map(|d| d as u8))
            .collect();
        let mnc_bytes: Vec<u8> = mnc
            .chars()
            .filter_map(|c| c.to_digit(10).map(|d| d as u8))
            .collect();

        Self {
            mcc1: mcc_bytes.first().copied().unwrap_or(0),
            mcc2: mcc_bytes.get(1).copied().unwrap_or(0),
            mcc3: mcc_bytes.get(2).copied().unwrap_or(0),
            mnc1: mnc_bytes.first().copied().unwrap_or(0),
            mnc2: mnc_bytes.get(1).copied().unwrap_or(0),
            mnc3: mnc_bytes.get(2).copied().unwrap_or(0xf),
        }
    }
}

/// EPS GUTI
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    /// PLMN ID
    pub plmn_id: PlmnId,
    /// MME Group ID
    pub mme_gid: u16,
    /// MME Code
    pub mme_code: u8,
    /// M-TMSI
    pub m_tmsi: u32,
}

/// IMSI in BCD string form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Imsi {
    /// BCD digit string
    pub bcd: String,
}

impl Imsi {
    /// Create an IMSI from a BCD digit string, truncated to the maximum length
    pub fn new(bcd: &str) -> Self {
        Self {
            bcd: bcd.chars().take(MAX_IMSI_BCD_LEN).collect(),
        }
    }
}

/// IMEI(SV) in BCD string form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Imei {
    /// BCD digit string
    pub bcd: String,
}

impl Imei {
    /// Create an IMEI from a BCD digit string, truncated to the maximum length
    pub fn new(bcd: &str) -> Self {
        Self {
            bcd: bcd.chars().take(MAX_IMEISV_BCD_LEN).collect(),
        }
    }
}

// ============================================================================
// Security Context
// ============================================================================

/// NAS key set identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NasKsi {
    /// TSC (Type of Security Context; 0 = native)
    pub tsc: u8,
    /// KSI (Key Set Identifier)
    pub ksi: u8,
}

/// EPS NAS security context
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    /// Key set identifier
    pub ksi: NasKsi,
    /// NAS integrity key
    pub knas_int: [u8; KEY_LEN],
    /// NAS encryption key
    pub knas_enc: [u8; KEY_LEN],
    /// Downlink NAS count
    pub dl_count: u32,
    /// Uplink NAS count
    pub ul_count: u32,
    /// Selected encryption algorithm
    pub selected_enc_algorithm: u8,
    /// Selected integrity algorithm
    pub selected_int_algorithm: u8,
}

/// EPS authentication vector from the HSS
#[derive(Debug, Clone, Default)]
pub struct AuthVector {
    /// RAND
    pub rand: [u8; RAND_LEN],
    /// AUTN
    pub autn: [u8; AUTN_LEN],
    /// Expected response (XRES)
    pub xres: [u8; MAX_RES_LEN],
    /// XRES length
    pub xres_len: u8,
    /// KASME
    pub kasme: [u8; SHA256_DIGEST_SIZE],
}

// ============================================================================
// Attach Type / Pending Procedures
// ============================================================================

/// Attach type recorded at attach time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachType {
    /// EPS attach
    #[default]
    EpsOnly,
    /// Combined EPS/IMSI attach
    CombinedEpsImsi,
}

/// In-progress EMM common procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmProcedure {
    /// Authentication procedure
    Authentication,
    /// Identification procedure
    Identification,
    /// Security mode control procedure
    SecurityModeControl,
    /// GUTI reallocation procedure
    GutiReallocation,
}

impl std::fmt::Display for EmmProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmmProcedure::Authentication => write!(f, "AUTHENTICATION"),
            EmmProcedure::Identification => write!(f, "IDENTIFICATION"),
            EmmProcedure::SecurityModeControl => write!(f, "SECURITY_MODE_CONTROL"),
            EmmProcedure::GutiReallocation => write!(f, "GUTI_REALLOCATION"),
        }
    }
}

// ============================================================================
// EMM Context
// ============================================================================

/// Per-UE EMM context
#[derive(Debug, Clone)]
pub struct EmmContext {
    /// UE identifier
    pub ue_id: UeId,
    /// Mobility FSM
    pub fsm: EmmFsm,
    /// Attach type recorded at attach time
    pub attach_type: AttachType,

    /// Current GUTI
    pub guti: Option<EpsGuti>,
    /// Old GUTI (pending reallocation)
    pub old_guti: Option<EpsGuti>,
    /// IMSI
    pub imsi: Option<Imsi>,
    /// IMEI
    pub imei: Option<Imei>,

    /// Authentication vectors
    pub auth_vectors: Vec<AuthVector>,
    /// Current security context
    pub security: Option<SecurityContext>,
    /// Non-current (mapped or pending) security context
    pub non_current_security: Option<SecurityContext>,

    /// In-progress ESM message buffer
    pub esm_msg: Option<Vec<u8>>,
    /// In-progress EMM common procedures
    pub procedures: Vec<EmmProcedure>,

    /// T3422 duration (seconds), populated at attach time
    pub t3422_sec: u64,
    /// T3422 handle; `Some` if and only if the timer is running
    pub t3422: Option<TimerHandle>,
    /// IMSI-only detach in progress flag
    pub is_imsi_only_detach: bool,

    /// Non-EPS service feature bitmap, populated at attach time
    pub features: u32,
}

impl EmmContext {
    /// Create a new EMM context in the de-registered state
    pub fn new(ue_id: UeId) -> Self {
        Self {
            ue_id,
            fsm: EmmFsm::new(ue_id),
            attach_type: AttachType::default(),
            guti: None,
            old_guti: None,
            imsi: None,
            imei: None,
            auth_vectors: Vec::new(),
            security: None,
            non_current_security: None,
            esm_msg: None,
            procedures: Vec::new(),
            t3422_sec: T3422_DEFAULT_SEC,
            t3422: None,
            is_imsi_only_detach: false,
            features: 0,
        }
    }

    /// Current EMM state
    pub fn state(&self) -> EmmState {
        self.fsm.state()
    }

    /// Check whether any of the given features is enabled
    pub fn has_any_feature(&self, mask: u32) -> bool {
        self.features & mask != 0
    }
}

// ============================================================================
// UE Context Store
// ============================================================================

/// UE context store keyed by UE identifier
///
/// Each operation takes the per-pool lock for its whole duration, which
/// serialises access per UE for the single NAS task.
#[derive(Debug, Default)]
pub struct UeStore {
    pool: RwLock<HashMap<UeId, EmmContext>>,
}

impl UeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a context, replacing any previous one for the same UE
    pub fn insert(&self, ctx: EmmContext) {
        self.pool.write().unwrap().insert(ctx.ue_id, ctx);
    }

    /// Remove a context
    pub fn remove(&self, ue_id: UeId) -> bool {
        self.pool.write().unwrap().remove(&ue_id).is_some()
    }

    /// Check whether a context exists
    pub fn contains(&self, ue_id: UeId) -> bool {
        self.pool.read().unwrap().contains_key(&ue_id)
    }

    /// Run a closure against the locked context, if present
    pub fn with_ctx<R>(&self, ue_id: UeId, f: impl FnOnce(&mut EmmContext) -> R) -> Option<R> {
        self.pool.write().unwrap().get_mut(&ue_id).map(f)
    }

    /// Clone the context out of the store for inspection
    pub fn snapshot(&self, ue_id: UeId) -> Option<EmmContext> {
        self.pool.read().unwrap().get(&ue_id).cloned()
    }

    /// Number of stored contexts
    pub fn len(&self) -> usize {
        self.pool.read().unwrap().len()
    }

    /// Check whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.pool.read().unwrap().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
