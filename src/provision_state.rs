//! Provisioning state machine
//!
//! Authoritative record of how far an apply run has progressed. Transitions are
//! validated: stages move forward one at a time, the destructive stage needs a
//! prior confirmation, and any non-terminal stage may fail.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! Validating
//!     ↓
//! CheckingDevices
//!     ↓
//! Wiping                (destructive, requires confirmation)
//!     ↓
//! Partitioning
//!     ↓
//! WaitingForPartitions
//!     ↓
//! Formatting
//!     ↓
//! CreatingSubvolumes
//!     ↓
//! Mounting
//!     ↓
//! WritingMountTable
//!     ↓
//! Completed
//!
//! (Any stage can transition to Failed)
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::ProvisionError;

/// Provisioning stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u8)]
pub enum ProvisionStage {
    #[default]
    NotStarted = 0,
    /// Static plan checks against probed devices
    Validating = 1,
    /// Busy and existing-LUKS checks on target disks
    CheckingDevices = 2,
    /// First stage that mutates devices
    Wiping = 3,
    Partitioning = 4,
    WaitingForPartitions = 5,
    /// LUKS format plus filesystem creation
    Formatting = 6,
    CreatingSubvolumes = 7,
    Mounting = 8,
    WritingMountTable = 9,
    Completed = 10,
    Failed = 255,
}

impl ProvisionStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The stage that must be explicitly confirmed before entry.
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Wiping)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Validating),
            Self::Validating => Some(Self::CheckingDevices),
            Self::CheckingDevices => Some(Self::Wiping),
            Self::Wiping => Some(Self::Partitioning),
            Self::Partitioning => Some(Self::WaitingForPartitions),
            Self::WaitingForPartitions => Some(Self::Formatting),
            Self::Formatting => Some(Self::CreatingSubvolumes),
            Self::CreatingSubvolumes => Some(Self::Mounting),
            Self::Mounting => Some(Self::WritingMountTable),
            Self::WritingMountTable => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Validating => "Validating plan",
            Self::CheckingDevices => "Checking target devices",
            Self::Wiping => "Wiping signatures",
            Self::Partitioning => "Partitioning",
            Self::WaitingForPartitions => "Waiting for partition nodes",
            Self::Formatting => "Formatting",
            Self::CreatingSubvolumes => "Creating subvolumes",
            Self::Mounting => "Mounting",
            Self::WritingMountTable => "Writing mount table",
            Self::Completed => "Provisioning complete",
            Self::Failed => "Provisioning failed",
        }
    }

    /// All stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::Validating,
            Self::CheckingDevices,
            Self::Wiping,
            Self::Partitioning,
            Self::WaitingForPartitions,
            Self::Formatting,
            Self::CreatingSubvolumes,
            Self::Mounting,
            Self::WritingMountTable,
            Self::Completed,
        ]
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageTransitionError {
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: ProvisionStage },

    #[error("Stage {stage} requires explicit confirmation (destructive operation)")]
    MissingConfirmation { stage: ProvisionStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: ProvisionStage },
}

impl From<StageTransitionError> for ProvisionError {
    fn from(err: StageTransitionError) -> Self {
        ProvisionError::refused(err.to_string())
    }
}

/// Owns the current stage of one apply run.
///
/// ```
/// use archdisk::provision_state::{ProvisionContext, ProvisionStage};
///
/// let mut ctx = ProvisionContext::new();
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current_stage(), ProvisionStage::Validating);
/// assert!(ctx.transition_to(ProvisionStage::Formatting).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProvisionContext {
    current: ProvisionStage,
    failed_at: Option<ProvisionStage>,
    /// (stage, unix timestamp) for every entered stage
    stage_history: Vec<(ProvisionStage, u64)>,
    destructive_confirmed: bool,
}

impl ProvisionContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current_stage(&self) -> ProvisionStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<ProvisionStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == ProvisionStage::Completed
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == ProvisionStage::Failed
    }

    pub fn stage_history(&self) -> &[(ProvisionStage, u64)] {
        &self.stage_history
    }

    /// Authorize the destructive stage. One-way.
    pub fn confirm_destructive_operations(&mut self) {
        self.destructive_confirmed = true;
    }

    #[inline]
    pub fn is_destructive_confirmed(&self) -> bool {
        self.destructive_confirmed
    }

    /// Advance to the next stage in sequence.
    pub fn advance(&mut self) -> Result<ProvisionStage, StageTransitionError> {
        let current = self.current;
        let next_stage = current
            .next()
            .ok_or(StageTransitionError::FromTerminalState { from: current })?;
        self.transition_to(next_stage)
    }

    /// Transition to `target`, which must be the immediate next stage.
    pub fn transition_to(
        &mut self,
        target: ProvisionStage,
    ) -> Result<ProvisionStage, StageTransitionError> {
        let current = self.current;
        if current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: current });
        }
        if target == current {
            return Err(StageTransitionError::AlreadyAtStage { stage: target });
        }
        // Failed is only reachable through fail()
        if target == ProvisionStage::Failed {
            return Err(StageTransitionError::SkippedStage {
                from: current,
                to: target,
            });
        }
        if target.order() < current.order() {
            return Err(StageTransitionError::BackwardTransition {
                from: current,
                to: target,
            });
        }
        if current.next() != Some(target) {
            return Err(StageTransitionError::SkippedStage {
                from: current,
                to: target,
            });
        }
        if target.is_destructive() && !self.destructive_confirmed {
            return Err(StageTransitionError::MissingConfirmation { stage: target });
        }

        debug!("stage: {} -> {}", current, target);
        self.record_stage_transition(target);
        self.current = target;
        Ok(target)
    }

    /// Mark the run as failed at the current stage.
    pub fn fail(&mut self) -> Result<(), StageTransitionError> {
        let current = self.current;
        if current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: current });
        }
        self.failed_at = Some(current);
        self.record_stage_transition(ProvisionStage::Failed);
        self.current = ProvisionStage::Failed;
        Ok(())
    }

    fn record_stage_transition(&mut self, stage: ProvisionStage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.stage_history.push((stage, timestamp));
    }
}
