//! Matching a stored resume document against the device being dumped
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::extents::ExtentMap;

use super::state::{DumpHardwareAttempt, ResumeState, SoftwareIdentity};

/// What the device probe reports about the device about to be dumped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProbe {
    pub is_lba: bool,
    pub removable: bool,
    pub block_count: u64,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
}

fn media(removable: &bool) -> &'static str {
    if *removable {
        "removable"
    } else {
        "non-removable"
    }
}

/// Reasons a stored resume document cannot be continued
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResumeError {
    #[error("Resuming CHS devices is not supported")]
    UnsupportedMode,
    #[error(
        "Resume file is for {} media but the device is {}",
        media(.expected),
        media(.found)
    )]
    RemovableMismatch { expected: bool, found: bool },
    #[error("Resume file is for a device of {expected} blocks but the device has {found} blocks")]
    CapacityMismatch { expected: u64, found: u64 },
    #[error("Resume file belongs to a different device: {field} is {expected:?} but the device reports {found:?}")]
    DeviceMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },
    #[error("Found corrupt resume file: attempt {0} has no software identity")]
    CorruptResumeFile(usize),
    #[error("Device reports no addressable blocks")]
    EmptyDevice,
}

/// The reconciled resume document, the attempt being continued and the
/// sectors that attempt already holds
#[derive(Debug, Clone)]
pub struct ResumeSession {
    state: ResumeState,
    attempt: usize,
    extents: ExtentMap<u64>,
    resumed: bool,
}

impl ResumeSession {
    pub fn state(&self) -> &ResumeState {
        &self.state
    }

    pub fn attempt_index(&self) -> usize {
        self.attempt
    }

    pub fn current_attempt(&self) -> &DumpHardwareAttempt {
        &self.state.tries[self.attempt]
    }

    pub fn extents(&self) -> &ExtentMap<u64> {
        &self.extents
    }

    /// Whether an earlier attempt is being continued
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn bad_blocks(&self) -> &BTreeSet<u64> {
        &self.state.bad_blocks
    }

    pub fn next_block(&self) -> u64 {
        self.state.next_block
    }

    /// Advance the linear pass position. Never moves backwards.
    pub fn advance_to(&mut self, block: u64) {
        self.state.next_block = self.state.next_block.max(block);
    }

    pub fn record_success(&mut self, block: u64) {
        self.extents.add(block);
        self.state.bad_blocks.remove(&block);
    }

    pub fn record_success_run(&mut self, start: u64, count: u64) {
        if count == 0 {
            return;
        }
        self.extents.add_run(start, count);
        let end = start.saturating_add(count - 1);
        let cleared: Vec<u64> = self.state.bad_blocks.range(start..=end).copied().collect();
        for block in cleared {
            self.state.bad_blocks.remove(&block);
        }
    }

    pub fn record_failure(&mut self, block: u64) {
        self.state.bad_blocks.insert(block);
    }

    /// Write the live extents back into the current attempt
    pub fn sync(&mut self) {
        self.state.tries[self.attempt].extents = self.extents.to_vec();
    }

    /// Synchronized document ready to be persisted
    pub fn snapshot(&mut self) -> &ResumeState {
        self.sync();
        self.state.last_write_date = Some(chrono::Utc::now());
        &self.state
    }

    pub fn into_parts(mut self) -> (ResumeState, usize, ExtentMap<u64>) {
        self.sync();
        (self.state, self.attempt, self.extents)
    }
}

/// Decides whether a stored dump may be continued and on which attempt
#[derive(Debug, Clone)]
pub struct ResumeReconciler {
    software: SoftwareIdentity,
}

impl Default for ResumeReconciler {
    fn default() -> Self {
        Self::new(SoftwareIdentity::current())
    }
}

impl ResumeReconciler {
    pub fn new(software: SoftwareIdentity) -> Self {
        Self { software }
    }

    pub fn software(&self) -> &SoftwareIdentity {
        &self.software
    }

    fn new_attempt(&self, probe: &DeviceProbe) -> DumpHardwareAttempt {
        DumpHardwareAttempt::new(
            probe.manufacturer.clone(),
            probe.model.clone(),
            probe.serial.clone(),
            self.software.clone(),
        )
    }

    /// Reconcile `existing` with the probed device.
    ///
    /// Every error is returned before anything is changed; the caller must not
    /// start reading sectors when this fails.
    pub fn process(
        &self,
        probe: &DeviceProbe,
        existing: Option<ResumeState>,
    ) -> Result<ResumeSession, ResumeError> {
        let Some(mut state) = existing else {
            if probe.block_count == 0 {
                return Err(ResumeError::EmptyDevice);
            }

            let mut state = ResumeState::new(probe.removable, probe.block_count - 1);
            state.tries.push(self.new_attempt(probe));

            tracing::info!(
                "Starting new dump of {} blocks with {}",
                probe.block_count,
                self.software
            );

            return Ok(ResumeSession {
                state,
                attempt: 0,
                extents: ExtentMap::new(),
                resumed: false,
            });
        };

        if !probe.is_lba {
            return Err(ResumeError::UnsupportedMode);
        }

        if state.removable != probe.removable {
            return Err(ResumeError::RemovableMismatch {
                expected: state.removable,
                found: probe.removable,
            });
        }

        if state.last_block.checked_add(1) != Some(probe.block_count) {
            return Err(ResumeError::CapacityMismatch {
                expected: state.block_count(),
                found: probe.block_count,
            });
        }

        let selected = self.select_attempt(probe, &state.tries)?;

        match selected {
            Some(index) => {
                let extents = ExtentMap::from_extents(state.tries[index].extents.iter().copied());
                tracing::info!(
                    "Resuming attempt {} with {} blocks already captured and {} bad blocks",
                    index,
                    extents.covered(),
                    state.bad_blocks.len()
                );
                Ok(ResumeSession {
                    state,
                    attempt: index,
                    extents,
                    resumed: true,
                })
            }
            None => {
                // A new attempt starts its linear pass from the beginning
                state.next_block = 0;
                state.tries.push(self.new_attempt(probe));
                let attempt = state.tries.len() - 1;
                tracing::info!(
                    "No resumable attempt for {}, recording attempt {}",
                    self.software,
                    attempt
                );
                Ok(ResumeSession {
                    state,
                    attempt,
                    extents: ExtentMap::new(),
                    resumed: false,
                })
            }
        }
    }

    /// First attempt produced by this exact software on this hardware.
    ///
    /// On fixed media any identity difference aborts the whole scan; on
    /// removable media it only disqualifies that attempt.
    fn select_attempt(
        &self,
        probe: &DeviceProbe,
        tries: &[DumpHardwareAttempt],
    ) -> Result<Option<usize>, ResumeError> {
        for (index, attempt) in tries.iter().enumerate() {
            if !probe.removable {
                check_field("manufacturer", &attempt.manufacturer, &probe.manufacturer)?;
                check_field("model", &attempt.model, &probe.model)?;
                check_field("serial", &attempt.serial, &probe.serial)?;
            }

            let software = attempt
                .software
                .as_ref()
                .ok_or(ResumeError::CorruptResumeFile(index))?;

            if *software != self.software {
                tracing::debug!("Skipping attempt {} made by {}", index, software);
                continue;
            }

            if probe.removable
                && !attempt.same_hardware(&probe.manufacturer, &probe.model, &probe.serial)
            {
                tracing::debug!("Skipping attempt {} made on another drive", index);
                continue;
            }

            return Ok(Some(index));
        }

        Ok(None)
    }
}

fn check_field(field: &'static str, expected: &str, found: &str) -> Result<(), ResumeError> {
    if expected == found {
        Ok(())
    } else {
        Err(ResumeError::DeviceMismatch {
            field,
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extents::Extent;

    fn dic() -> SoftwareIdentity {
        SoftwareIdentity::new("DIC", "linux", "1.0")
    }

    fn acme(block_count: u64) -> DeviceProbe {
        DeviceProbe {
            is_lba: true,
            removable: false,
            block_count,
            manufacturer: "ACME".to_string(),
            model: "Model1".to_string(),
            serial: "SN123".to_string(),
        }
    }

    fn attempt(software: Option<SoftwareIdentity>, extents: Vec<(u64, u64)>) -> DumpHardwareAttempt {
        DumpHardwareAttempt {
            manufacturer: "ACME".to_string(),
            model: "Model1".to_string(),
            serial: "SN123".to_string(),
            software,
            extents: extents.into_iter().map(Extent::from).collect(),
        }
    }

    #[test]
    fn test_fresh_dump_stamps_new_attempt() {
        let reconciler = ResumeReconciler::new(dic());
        let session = reconciler.process(&acme(1000), None).unwrap();

        let state = session.state();
        assert_eq!(state.last_block, 999);
        assert!(!state.removable);
        assert!(state.bad_blocks.is_empty());
        assert_eq!(state.tries.len(), 1);

        let attempt = session.current_attempt();
        assert_eq!(attempt.manufacturer, "ACME");
        assert_eq!(attempt.model, "Model1");
        assert_eq!(attempt.serial, "SN123");
        assert_eq!(attempt.software.as_ref(), Some(&dic()));
        assert!(session.extents().is_empty());
        assert!(!session.is_resumed());
    }

    #[test]
    fn test_fresh_dump_of_empty_device_fails() {
        let reconciler = ResumeReconciler::new(dic());
        assert_eq!(
            reconciler.process(&acme(0), None).unwrap_err(),
            ResumeError::EmptyDevice
        );
    }

    #[test]
    fn test_chs_resume_always_fails() {
        let reconciler = ResumeReconciler::new(dic());
        let mut probe = acme(1000);
        probe.is_lba = false;

        // Even a document that disagrees on everything reports the mode first
        let mut state = ResumeState::new(true, 5);
        state.tries.push(attempt(None, vec![]));

        assert_eq!(
            reconciler.process(&probe, Some(state)).unwrap_err(),
            ResumeError::UnsupportedMode
        );
    }

    #[test]
    fn test_removable_mismatch_fails() {
        let reconciler = ResumeReconciler::new(dic());
        let state = ResumeState::new(true, 999);

        assert_eq!(
            reconciler.process(&acme(1000), Some(state)).unwrap_err(),
            ResumeError::RemovableMismatch {
                expected: true,
                found: false
            }
        );
    }

    #[test]
    fn test_capacity_mismatch_fails() {
        let reconciler = ResumeReconciler::new(dic());
        for block_count in [0, 1, 999, 1001, u64::MAX] {
            let state = ResumeState::new(false, 999);
            let err = reconciler.process(&acme(block_count), Some(state)).unwrap_err();
            assert!(matches!(err, ResumeError::CapacityMismatch { expected: 1000, .. }));
        }
    }

    #[test]
    fn test_fixed_media_identity_mismatch_aborts() {
        let reconciler = ResumeReconciler::new(dic());
        let mut state = ResumeState::new(false, 999);
        // An attempt from another version that would otherwise be skipped
        let mut other = attempt(Some(SoftwareIdentity::new("DIC", "linux", "0.9")), vec![]);
        other.serial = "SN999".to_string();
        state.tries.push(other);
        state.tries.push(attempt(Some(dic()), vec![(0, 10)]));

        let err = reconciler.process(&acme(1000), Some(state)).unwrap_err();
        assert_eq!(
            err,
            ResumeError::DeviceMismatch {
                field: "serial",
                expected: "SN999".to_string(),
                found: "SN123".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_software_is_corrupt() {
        let reconciler = ResumeReconciler::new(dic());
        let mut state = ResumeState::new(false, 999);
        state.tries.push(attempt(None, vec![]));
        state.tries.push(attempt(Some(dic()), vec![]));

        assert_eq!(
            reconciler.process(&acme(1000), Some(state)).unwrap_err(),
            ResumeError::CorruptResumeFile(0)
        );
    }

    #[test]
    fn test_resume_restores_extents() {
        let reconciler = ResumeReconciler::new(dic());
        let mut state = ResumeState::new(false, 999);
        state.tries.push(attempt(Some(dic()), vec![(0, 499)]));

        let mut session = reconciler.process(&acme(1000), Some(state)).unwrap();
        assert!(session.is_resumed());
        assert_eq!(session.extents().to_vec(), vec![Extent::new(0, 499)]);

        session.record_success(500);
        assert_eq!(session.extents().to_vec(), vec![Extent::new(0, 500)]);

        let (state, index, _) = session.into_parts();
        assert_eq!(index, 0);
        assert_eq!(state.tries[0].extents, vec![Extent::new(0, 500)]);
    }

    #[test]
    fn test_matching_attempt_need_not_be_first() {
        let reconciler = ResumeReconciler::new(dic());
        let mut state = ResumeState::new(false, 999);
        state.tries.push(attempt(
            Some(SoftwareIdentity::new("DIC", "windows", "1.0")),
            vec![(0, 99)],
        ));
        state.tries.push(attempt(Some(dic()), vec![(0, 199)]));

        let session = reconciler.process(&acme(1000), Some(state)).unwrap();
        assert_eq!(session.attempt_index(), 1);
        assert_eq!(session.extents().covered(), 200);
    }

    #[test]
    fn test_first_match_wins() {
        let reconciler = ResumeReconciler::new(dic());
        let mut state = ResumeState::new(false, 999);
        state.tries.push(attempt(Some(dic()), vec![(0, 9)]));
        state.tries.push(attempt(Some(dic()), vec![(0, 99)]));

        let session = reconciler.process(&acme(1000), Some(state)).unwrap();
        assert_eq!(session.attempt_index(), 0);
        assert_eq!(session.extents().covered(), 10);
        assert_eq!(session.state().tries.len(), 2);
    }

    #[test]
    fn test_no_match_appends_attempt() {
        let reconciler = ResumeReconciler::new(dic());
        let mut state = ResumeState::new(false, 999);
        state.tries.push(attempt(
            Some(SoftwareIdentity::new("DIC", "linux", "0.9")),
            vec![(0, 99)],
        ));
        state.bad_blocks.insert(42);
        state.next_block = 100;

        let session = reconciler.process(&acme(1000), Some(state)).unwrap();
        assert_eq!(session.attempt_index(), 1);
        assert!(session.extents().is_empty());
        assert!(!session.is_resumed());
        assert_eq!(session.state().tries.len(), 2);
        assert!(session.bad_blocks().contains(&42));
        assert_eq!(session.next_block(), 0);
    }

    #[test]
    fn test_removable_media_skips_other_drives() {
        let reconciler = ResumeReconciler::new(dic());
        let mut probe = acme(1000);
        probe.removable = true;

        let mut state = ResumeState::new(true, 999);
        let mut other_drive = attempt(Some(dic()), vec![(0, 9)]);
        other_drive.model = "Model2".to_string();
        state.tries.push(other_drive);
        state.tries.push(attempt(Some(dic()), vec![(0, 49)]));

        let session = reconciler.process(&probe, Some(state)).unwrap();
        assert_eq!(session.attempt_index(), 1);
        assert_eq!(session.extents().covered(), 50);
    }

    #[test]
    fn test_success_clears_bad_blocks() {
        let reconciler = ResumeReconciler::new(dic());
        let mut session = reconciler.process(&acme(100), None).unwrap();

        session.record_failure(10);
        session.record_failure(11);
        session.record_failure(50);
        session.record_success(10);
        session.record_success_run(11, 45);

        assert_eq!(session.bad_blocks().iter().copied().collect::<Vec<_>>(), Vec::<u64>::new());
        assert_eq!(session.extents().to_vec(), vec![Extent::new(10, 55)]);

        session.advance_to(56);
        session.advance_to(20);
        assert_eq!(session.next_block(), 56);
    }
}
