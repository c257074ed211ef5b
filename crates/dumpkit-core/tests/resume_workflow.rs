/// Resume reconciliation across sessions: fresh start, continuation of a
/// stored attempt, and persistence through the resume store
use dumpkit_core::resume::{DeviceProbe, ResumeError, ResumeReconciler, ResumeStore};
use dumpkit_core::{Extent, SoftwareIdentity};
use tempfile::TempDir;

fn acme_probe() -> DeviceProbe {
    DeviceProbe {
        is_lba: true,
        removable: false,
        block_count: 1000,
        manufacturer: "ACME".to_string(),
        model: "Model1".to_string(),
        serial: "SN123".to_string(),
    }
}

fn dic() -> ResumeReconciler {
    ResumeReconciler::new(SoftwareIdentity::new("DIC", "linux", "1.0"))
}

#[test]
fn test_fresh_dump_creates_single_attempt() {
    let session = dic().process(&acme_probe(), None).unwrap();

    assert!(!session.is_resumed());
    assert!(session.extents().is_empty());
    assert_eq!(session.state().last_block, 999);
    assert_eq!(session.state().tries.len(), 1);

    let attempt = session.current_attempt();
    assert_eq!(attempt.manufacturer, "ACME");
    assert_eq!(attempt.model, "Model1");
    assert_eq!(attempt.serial, "SN123");
    assert_eq!(
        attempt.software,
        Some(SoftwareIdentity::new("DIC", "linux", "1.0"))
    );
}

#[test]
fn test_resumed_extents_grow_from_stored_attempt() {
    let mut session = dic().process(&acme_probe(), None).unwrap();
    session.record_success_run(0, 500);
    let (state, attempt, _) = session.into_parts();
    assert_eq!(state.tries[attempt].extents, vec![Extent::new(0, 499)]);

    let mut resumed = dic().process(&acme_probe(), Some(state)).unwrap();
    assert!(resumed.is_resumed());
    assert_eq!(resumed.attempt_index(), 0);
    assert_eq!(resumed.extents().to_vec(), vec![Extent::new(0, 499)]);

    resumed.record_success(500);
    assert_eq!(resumed.extents().to_vec(), vec![Extent::new(0, 500)]);
}

#[test]
fn test_state_survives_store_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let store = ResumeStore::for_image(temp_dir.path().join("disk.img"));

    let mut session = dic().process(&acme_probe(), None).unwrap();
    session.record_success_run(0, 100);
    session.record_failure(100);
    session.record_success_run(101, 50);
    session.advance_to(151);
    store.save(session.snapshot()).unwrap();

    let loaded = store.load().unwrap().expect("resume document");
    assert_eq!(loaded.next_block, 151);
    assert!(loaded.last_write_date.is_some());

    let resumed = dic().process(&acme_probe(), Some(loaded)).unwrap();
    assert!(resumed.is_resumed());
    assert_eq!(resumed.next_block(), 151);
    assert_eq!(
        resumed.extents().to_vec(),
        vec![Extent::new(0, 99), Extent::new(101, 150)]
    );
    assert!(resumed.bad_blocks().contains(&100));
}

#[test]
fn test_other_software_starts_new_attempt() {
    let mut session = dic().process(&acme_probe(), None).unwrap();
    session.record_success_run(0, 10);
    let state = session.snapshot().clone();

    let other = ResumeReconciler::new(SoftwareIdentity::new("DIC", "linux", "2.0"));
    let session = other.process(&acme_probe(), Some(state)).unwrap();

    assert!(!session.is_resumed());
    assert_eq!(session.attempt_index(), 1);
    assert_eq!(session.state().tries.len(), 2);
    assert!(session.extents().is_empty());
}

#[test]
fn test_different_drive_rejected() {
    let state = dic().process(&acme_probe(), None).unwrap().snapshot().clone();

    let mut probe = acme_probe();
    probe.serial = "SN999".to_string();

    let err = dic().process(&probe, Some(state)).unwrap_err();
    assert!(matches!(err, ResumeError::DeviceMismatch { field: "serial", .. }));
}
