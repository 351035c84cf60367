//! Block transactions: one per client request.

use core::fmt;

use block::{BlockOp, CompletionFn};
use driver_base::DriverResult;

/// A queued client operation together with its completion callback.
///
/// The driver owns the transaction from submission until [`SdmmcTxn::complete`]
/// consumes it, which hands the operation back to the client.
pub struct SdmmcTxn {
    op: BlockOp,
    callback: CompletionFn,
    cookie: usize,
}

impl SdmmcTxn {
    pub fn new(op: BlockOp, callback: CompletionFn, cookie: usize) -> Self {
        Self {
            op,
            callback,
            cookie,
        }
    }

    #[inline]
    pub fn op(&self) -> &BlockOp {
        &self.op
    }

    /// Reports `status` to the client.
    pub fn complete(self, status: DriverResult) {
        trace!(
            "sdmmc: complete {} cookie {:#x}: {:?}",
            self.op.name(),
            self.cookie,
            status
        );
        (self.callback)(self.cookie, status, self.op);
    }
}

impl fmt::Debug for SdmmcTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdmmcTxn")
            .field("op", &self.op)
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}
