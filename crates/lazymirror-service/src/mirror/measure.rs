use std::time::Instant;

use super::{Completion, MirrorError, Role};

/// State of the [`TransferGuard`].
#[derive(Clone, Copy, Debug)]
enum TransferState {
    /// The transfer is still running, or was dropped while running.
    Pending,
    /// The transfer has terminated with a status and a byte count.
    Done(&'static str, u64),
}

/// Reports the duration and size of a transfer, even when it is cancelled.
///
/// Emits `download.duration`, tagged with the role the transfer started in and its status, and
/// for finished transfers `download.size`.
pub struct TransferGuard {
    role: Role,
    state: TransferState,
    creation_time: Instant,
}

impl TransferGuard {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: TransferState::Pending,
            creation_time: Instant::now(),
        }
    }

    /// Marks the transfer as terminated.
    pub fn done(mut self, result: &Result<Completion, MirrorError>) {
        self.state = match result {
            Ok(completion) => TransferState::Done(completion.as_str(), completion.size()),
            Err(MirrorError::ClientGone) => TransferState::Done("client_gone", 0),
            Err(MirrorError::Abandoned { relayed }) => TransferState::Done("abandoned", *relayed),
            Err(_) => TransferState::Done("aborted", 0),
        };
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let status = match self.state {
            TransferState::Pending => "canceled",
            TransferState::Done(status, size) => {
                metric!(
                    histogram("download.size") = size,
                    "role" => self.role.as_str(),
                    "status" => status,
                );
                status
            }
        };

        metric!(
            timer("download.duration") = self.creation_time.elapsed(),
            "role" => self.role.as_str(),
            "status" => status,
        );
    }
}
