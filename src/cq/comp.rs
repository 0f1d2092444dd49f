use rdma_sys::*;
use thiserror::Error;

use crate::err::{Error as CrateError, Result};
use crate::types::WrId;

/// Kind of a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Op {
    /// One-sided remote read.
    Read,
}

/// Status of a completed operation, carried verbatim from the provider's
/// work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompletionStatus {
    /// The work request (and all unsignaled requests posted before it)
    /// finished; its buffers may be reused.
    #[error("success")]
    Success,

    /// A scatter/gather entry exceeded the port's message size limits.
    #[error("local length error")]
    LocLenErr,

    /// Internal QP consistency error.
    #[error("local QP operation error")]
    LocQpOpErr,

    /// A local buffer does not reference a memory region valid for the
    /// requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// The work request was outstanding when the QP transitioned into the
    /// error state. A tail of these follows every disconnect.
    #[error("work request flushed")]
    WrFlushErr,

    /// Memory-window bind failure.
    #[error("memory window bind error")]
    MwBindErr,

    /// The responder returned an unexpected transport-layer opcode.
    #[error("bad response error")]
    BadRespErr,

    /// Local buffer protection error while handling an incoming operation.
    #[error("local access error")]
    LocAccessErr,

    /// The responder detected an invalid message, e.g. an operation its
    /// receive queue was not configured to support.
    #[error("remote invalid request error")]
    RemInvReqErr,

    /// Protection error on the remote buffer named by this operation.
    #[error("remote access error")]
    RemAccessErr,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr,

    /// Transport retries exhausted without an acknowledgement; the remote QP
    /// is misconfigured or gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// Receiver-not-ready retries exhausted.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    /// The responder aborted the operation.
    #[error("remote aborted error")]
    RemAbortErr,

    /// A fatal, likely unrecoverable, provider error.
    #[error("fatal error")]
    FatalErr,

    /// A response timed out.
    #[error("response timeout error")]
    RespTimeoutErr,

    /// Any other provider error.
    #[error("general error")]
    GeneralErr,

    /// A provider-defined status outside the common table.
    #[error("provider-specific completion status {0}")]
    Other(u32),
}

impl From<u32> for CompletionStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => CompletionStatus::Success,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => CompletionStatus::LocLenErr,
            ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => CompletionStatus::LocQpOpErr,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => CompletionStatus::LocProtErr,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => CompletionStatus::WrFlushErr,
            ibv_wc_status::IBV_WC_MW_BIND_ERR => CompletionStatus::MwBindErr,
            ibv_wc_status::IBV_WC_BAD_RESP_ERR => CompletionStatus::BadRespErr,
            ibv_wc_status::IBV_WC_LOC_ACCESS_ERR => CompletionStatus::LocAccessErr,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => CompletionStatus::RemInvReqErr,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => CompletionStatus::RemAccessErr,
            ibv_wc_status::IBV_WC_REM_OP_ERR => CompletionStatus::RemOpErr,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => CompletionStatus::RetryExcErr,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => CompletionStatus::RnrRetryExcErr,
            ibv_wc_status::IBV_WC_REM_ABORT_ERR => CompletionStatus::RemAbortErr,
            ibv_wc_status::IBV_WC_FATAL_ERR => CompletionStatus::FatalErr,
            ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR => CompletionStatus::RespTimeoutErr,
            ibv_wc_status::IBV_WC_GENERAL_ERR => CompletionStatus::GeneralErr,
            other => CompletionStatus::Other(other),
        }
    }
}

impl CompletionStatus {
    /// Whether the operation completed successfully.
    #[inline]
    pub fn is_success(self) -> bool {
        self == CompletionStatus::Success
    }
}

/// A delivered work completion.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// The caller token passed when the operation was posted.
    pub op_context: WrId,
    /// The kind of the completed operation.
    pub op: Op,
    /// The provider's completion status, verbatim.
    pub status: CompletionStatus,
}

impl Completion {
    pub(crate) fn from_wc(wc: &ibv_wc) -> Result<Self> {
        let status = CompletionStatus::from(wc.status);
        let op = match wc.opcode {
            ibv_wc_opcode::IBV_WC_RDMA_READ => Op::Read,
            // A flushed work request carries an undefined opcode; reads are
            // the only kind this connection ever posts.
            _ if !status.is_success() => Op::Read,
            _ => return Err(CrateError::NoSupp),
        };
        Ok(Completion {
            op_context: wc.wr_id,
            op,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    fn wc(wr_id: u64, status: u32, opcode: u32) -> ibv_wc {
        // SAFETY: POD type.
        let mut wc: ibv_wc = unsafe { mem::zeroed() };
        wc.wr_id = wr_id;
        wc.status = status;
        wc.opcode = opcode;
        wc
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            CompletionStatus::from(ibv_wc_status::IBV_WC_SUCCESS),
            CompletionStatus::Success
        );
        assert_eq!(
            CompletionStatus::from(ibv_wc_status::IBV_WC_WR_FLUSH_ERR),
            CompletionStatus::WrFlushErr
        );
        assert_eq!(CompletionStatus::from(4096), CompletionStatus::Other(4096));
        assert!(CompletionStatus::Success.is_success());
        assert!(!CompletionStatus::RetryExcErr.is_success());
    }

    #[test]
    fn read_completion_carries_context() {
        let wc = wc(
            0xB0A710AD,
            ibv_wc_status::IBV_WC_SUCCESS,
            ibv_wc_opcode::IBV_WC_RDMA_READ,
        );
        let cmpl = Completion::from_wc(&wc).unwrap();
        assert_eq!(cmpl.op_context, 0xB0A710AD);
        assert_eq!(cmpl.op, Op::Read);
        assert!(cmpl.status.is_success());
    }

    #[test]
    fn flushed_completion_defaults_to_read() {
        let wc = wc(7, ibv_wc_status::IBV_WC_WR_FLUSH_ERR, 0);
        let cmpl = Completion::from_wc(&wc).unwrap();
        assert_eq!(cmpl.op, Op::Read);
        assert_eq!(cmpl.status, CompletionStatus::WrFlushErr);
    }

    #[test]
    fn successful_foreign_opcode_is_unsupported() {
        let wc = wc(7, ibv_wc_status::IBV_WC_SUCCESS, ibv_wc_opcode::IBV_WC_SEND);
        assert!(Completion::from_wc(&wc).is_err());
    }
}
