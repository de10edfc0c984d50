/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Why a worker or scheduler loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExitReason {
    #[error("idle flag is set")]
    Idle,

    #[error("worker is no longer registered")]
    Deregistered,

    #[error("another scheduler holds a fresh lease")]
    AlreadyRunning,

    #[error("shutdown requested")]
    Shutdown,
}

impl ExitReason {
    /// Exits that should end the process with a non-zero status.
    pub fn is_failure(self) -> bool {
        matches!(self, ExitReason::AlreadyRunning)
    }
}
