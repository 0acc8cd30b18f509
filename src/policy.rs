//! What a mirror run is allowed to do, and the decision table built on it.

use crate::diff::Classification;
use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Policy {
    /// Overwrite targets whose size differs from the source
    pub force: bool,
    /// Plan and report without touching the target
    pub fake: bool,
    /// Delete target objects absent from the source. Only honored with `force`.
    pub remove: bool,
}

impl Policy {
    pub fn new(force: bool, fake: bool, remove: bool) -> Self {
        Self { force, fake, remove }
    }

    pub fn validate(&self) -> Result<()> {
        if self.remove && !self.force {
            return Err(MirrorError::InvalidArgument(
                "--remove is only supported with --force".to_string(),
            ));
        }
        Ok(())
    }

    pub fn deletes(&self) -> bool {
        self.remove && self.force
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Copy,
    Delete,
    Skip,
    /// Target exists with a different size and overwriting is not allowed
    RejectOverwrite,
    /// Source and target disagree on file vs directory
    RejectType,
}

/// Map a classification to an action under `policy`.
///
/// Time-only differences never act: content is compared by size alone.
/// Fake mode plans exactly what a real run would, so it does not change the
/// outcome here.
pub fn decide(classification: Classification, policy: &Policy) -> Decision {
    match classification {
        Classification::OnlyInSource => Decision::Copy,
        Classification::OnlyInTarget if policy.deletes() => Decision::Delete,
        Classification::OnlyInTarget => Decision::Skip,
        Classification::DiffersInSize if policy.force => Decision::Copy,
        Classification::DiffersInSize => Decision::RejectOverwrite,
        Classification::DiffersInType => Decision::RejectType,
        Classification::DiffersInTimeOnly | Classification::Identical => Decision::Skip,
    }
}
