//! Two-phase unlogged index builds
//!
//! Some indexes are built by first populating the relation through the
//! buffer cache with WAL-logging skipped, then logging the finished relation
//! wholesale. The page server can only reconstruct what the WAL contains, so
//! during the first phase the relation impersonates an unlogged one and all
//! its blocks live on local disk; once the relation has been fully
//! WAL-logged the local copy is dropped.

use tracing::{trace, warn};

use crate::api::TransactionEvent;
use crate::error::{PageStoreError, Result};
use crate::store::PageStore;
use crate::tag::{ForkNumber, Persistence, RelTag, Relation};

/// Phase of the (single) in-progress unlogged build.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UnloggedBuildPhase {
    /// No build in progress
    #[default]
    NotInProgress,
    /// Populating the relation locally, WAL-logging skipped
    Phase1,
    /// Population done, relation being WAL-logged
    Phase2,
    /// The built relation is temp/unlogged anyway; nothing special to do
    NotPermanent,
}

/// State of the single live unlogged build.
#[derive(Debug, Default)]
pub(crate) struct UnloggedBuildState {
    pub(crate) rel: Option<RelTag>,
    pub(crate) phase: UnloggedBuildPhase,
}

impl PageStore {
    /// Phase of the in-progress unlogged build, if any.
    pub fn unlogged_build_phase(&self) -> UnloggedBuildPhase {
        self.unlogged_build.phase
    }

    /// Begin a build operation on `rel`.
    ///
    /// A permanent relation must be empty; it then impersonates an unlogged
    /// relation until [`PageStore::end_unlogged_build`], so every write
    /// lands on local disk.
    pub fn start_unlogged_build(&mut self, rel: &mut Relation) -> Result<()> {
        // Only one build can be live at a time; that covers the engine's
        // usage.
        if self.unlogged_build.phase != UnloggedBuildPhase::NotInProgress {
            return Err(PageStoreError::internal(
                "unlogged relation build is already in progress",
            ));
        }
        debug_assert!(self.unlogged_build.rel.is_none());

        trace!(rel = %rel.tag, "starting unlogged build");

        match rel.persistence {
            Persistence::Unknown => {
                return Err(PageStoreError::unsupported("start an unlogged build on"));
            }
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                self.unlogged_build = UnloggedBuildState {
                    rel: Some(rel.tag),
                    phase: UnloggedBuildPhase::NotPermanent,
                };
                return Ok(());
            }
        }

        if self.nblocks(rel, ForkNumber::Main)? != 0 {
            return Err(PageStoreError::internal(
                "cannot perform unlogged index build, index is not empty",
            ));
        }

        self.unlogged_build = UnloggedBuildState {
            rel: Some(rel.tag),
            phase: UnloggedBuildPhase::Phase1,
        };

        rel.persistence = Persistence::Unlogged;
        self.local.create(&rel.tag, ForkNumber::Main, false)?;
        Ok(())
    }

    /// Finish populating the relation; call before WAL-logging it.
    pub fn finish_unlogged_build_phase_1(&mut self, rel: &Relation) -> Result<()> {
        if self.unlogged_build.rel != Some(rel.tag) {
            return Err(PageStoreError::internal(format!(
                "phase 1 finished for {} but that build is not in progress",
                rel.tag
            )));
        }

        trace!(rel = %rel.tag, "finishing phase 1 of unlogged build");

        if self.unlogged_build.phase == UnloggedBuildPhase::NotPermanent {
            return Ok(());
        }
        if self.unlogged_build.phase != UnloggedBuildPhase::Phase1 {
            return Err(PageStoreError::internal(format!(
                "unlogged build of {} is not in phase 1",
                rel.tag
            )));
        }
        debug_assert_eq!(rel.persistence, Persistence::Unlogged);

        self.unlogged_build.phase = UnloggedBuildPhase::Phase2;
        Ok(())
    }

    /// End the build after the relation has been fully WAL-logged.
    ///
    /// The relation becomes permanent again and its local copy is removed:
    /// it is now served by the page server like any other permanent
    /// relation.
    pub fn end_unlogged_build(&mut self, rel: &mut Relation) -> Result<()> {
        if self.unlogged_build.rel != Some(rel.tag) {
            return Err(PageStoreError::internal(format!(
                "build ended for {} but that build is not in progress",
                rel.tag
            )));
        }

        trace!(rel = %rel.tag, "ending unlogged build");

        if self.unlogged_build.phase != UnloggedBuildPhase::NotPermanent {
            if self.unlogged_build.phase != UnloggedBuildPhase::Phase2 {
                return Err(PageStoreError::internal(format!(
                    "unlogged build of {} ended before phase 1 was finished",
                    rel.tag
                )));
            }
            debug_assert_eq!(rel.persistence, Persistence::Unlogged);

            rel.persistence = Persistence::Permanent;

            for fork in ForkNumber::ALL {
                trace!(rel = %rel.tag, %fork, "forgetting cached relsize");
                self.relsize.forget(&rel.tag, fork);
                self.local.close(&rel.tag, fork);
                // Drop the file immediately; there is no conflicting
                // relation to worry about at this point.
                if let Err(error) = self.local.unlink(&rel.tag, Some(fork), true) {
                    warn!(rel = %rel.tag, %fork, %error, "could not unlink local build file");
                }
            }
        }

        self.unlogged_build = UnloggedBuildState::default();
        Ok(())
    }

    /// Transaction lifecycle hook.
    ///
    /// Abort always resets the build state; the local file is cleaned up by
    /// the engine's pending-delete machinery. Reaching commit or prepare
    /// with a build still in progress is an internal error.
    pub fn at_transaction_end(&mut self, event: TransactionEvent) -> Result<()> {
        match event {
            TransactionEvent::Abort => {
                self.unlogged_build = UnloggedBuildState::default();
                Ok(())
            }
            TransactionEvent::Commit
            | TransactionEvent::PreCommit
            | TransactionEvent::Prepare
            | TransactionEvent::PrePrepare => {
                if self.unlogged_build.phase != UnloggedBuildPhase::NotInProgress {
                    self.unlogged_build = UnloggedBuildState::default();
                    return Err(PageStoreError::internal(
                        "unlogged index build was not properly finished",
                    ));
                }
                Ok(())
            }
        }
    }
}
