//! MME EMM Detach Procedure
//!
//! Implements the detach related EMM procedure executed by the NAS task of
//! the MME: UE initiated detach, network initiated detach guarded by T3422,
//! detach accept processing and SGS (non-EPS services) detach, together with
//! the release of EMM/ESM state for the detached subscriber.
//!
//! NAS wire encoding, the session manager, the SGs gateway task and the
//! lower layers are external collaborators; the crate only dispatches typed
//! primitives towards them.

pub mod context;
pub mod detach;
pub mod metrics;
pub mod release;
pub mod sap;
pub mod sm;
pub mod t3422;
