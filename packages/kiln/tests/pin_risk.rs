//! The risk-threshold pin: content with too few location records is never
//! promised on record count alone; the pin verifies or copies, and the copy
//! raises the replica count.

mod common;

use pretty_assertions::assert_eq as pretty_assert_eq;
use wire::ContentHash;

use kiln::{
    cas::{
        PinOutcome, PinUrgency,
        directory::{GlobalDirectory, LocationRecord},
        pin::{PinSource, min_unverified_records, min_verified_records},
        remote::RemoteStore,
    },
    config::PinConfig,
};

use common::TestCluster;

/// A tolerance/risk combination chosen so that three unverified records are
/// needed but only one exists.
fn thin_pin_config() -> PinConfig {
    let config = PinConfig::builder()
        .machine_risk(0.1)
        .file_risk(0.2)
        .risk_tolerance(0.03)
        .replica_threshold(2)
        .build();
    // Sanity-check the synthetic risks rather than hardcoding thresholds.
    pretty_assert_eq!(min_unverified_records(&config), 3);
    pretty_assert_eq!(min_verified_records(&config), 2);
    config
}

#[tokio::test]
async fn pin_with_one_record_copies_instead_of_trusting_the_count() {
    let cluster = TestCluster::new();
    let holder = cluster.machine("holder", vec![]);
    let content = b"scarce content";
    let hash = ContentHash::from_buffer(content);

    // One machine holds the content; one location record exists.
    holder.cas.write(&hash, content).await.unwrap();
    cluster
        .global
        .publish(
            &hash,
            LocationRecord {
                location: cluster.peer_of(&holder).location(),
                verified_at: None,
            },
        )
        .await
        .unwrap();

    let pinner = cluster.machine("pinner", vec![cluster.peer_of(&holder)]);
    let store = pinner.store.clone().with_pin_config(thin_pin_config());

    // One record < n_u: the pin must not succeed by record count; it
    // materializes a local copy instead.
    let outcome = store.pin(&hash, PinUrgency::Nominal).await.unwrap();
    pretty_assert_eq!(outcome, PinOutcome::Success(PinSource::LocalCopy));
    assert!(store.local().contains(&hash).await);

    // The copy registered a second replica.
    assert!(store.known_replicas(&hash).await.unwrap() >= 2);

    // And the pin cache carries a positive TTL: the next pin answers from
    // it without touching the directory.
    let outcome = store.pin(&hash, PinUrgency::Nominal).await.unwrap();
    assert!(matches!(
        outcome,
        PinOutcome::Success(PinSource::Local) | PinOutcome::Success(PinSource::PinCache)
    ));
}
