mod common;

use common::*;
use haversine::auth::{AuthorizationCache, TokenResponse, TokenSource};
use haversine::metadata::{SatelliteMetadata, TagMetadataCodec};
use haversine::policy::{AnyUserPermissions, PermissionMode, PermissionsPolicy, UserPermissions};
use haversine::satellite::ManufacturerData;
use haversine::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const STATE_HASH: u32 = 0x5A5A_0000;

fn advertisement_owned_by(owner: Option<u32>) -> Advertisement {
    Advertisement {
        id: satellite_id(1),
        name: None,
        rssi: -60,
        manufacturer_data: ManufacturerData {
            persistent_state_fingerprint: TagMetadataCodec::fingerprint_for(owner, STATE_HASH),
            truncated_collection_count: 0,
        },
    }
}

fn state_owned_by(owner: Option<u32>, sealed: bool, fail_safe: bool) -> SatelliteState {
    let mut reported = state(fail_safe);
    reported.persistent.application_data = TagMetadataCodec::encode(
        &SatelliteMetadata {
            user_id: owner,
            club_id: None,
            timestamp: 1_700_000_000,
        },
        sealed,
    );
    reported
}

/// A satellite as the manager sees it after a state report.
fn known_satellite(reported: SatelliteState) -> Satellite {
    let manager = manager_with(MockTransport::powered_on(), Environment::new());
    let id = satellite_id(1);
    manager.handle_event(TransportEvent::Advertisement(advertisement(&id, -60)));
    manager.handle_event(TransportEvent::Connected(id.clone()));
    manager.handle_event(TransportEvent::StateUpdated {
        id: id.clone(),
        state: reported,
        collections: CollectionIndexes::empty_at(0),
    });
    manager.satellite(&id).unwrap()
}

struct FixedSource {
    response: TokenResponse,
    fetches: Arc<AtomicUsize>,
}

impl TokenSource for FixedSource {
    fn fetch_token(&self, _hardware_id: &str) -> haversine::Result<TokenResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

fn fixed_clock() -> u64 {
    1_000
}

fn cache_answering(response: TokenResponse) -> (Arc<AuthorizationCache>, Arc<AtomicUsize>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let source = FixedSource {
        response,
        fetches: Arc::clone(&fetches),
    };
    (Arc::new(AuthorizationCache::new(Box::new(source))), fetches)
}

#[test]
fn test_any_user_mode_accepts_everything() {
    let permissions = UserPermissions::new();
    assert_eq!(permissions.mode(), PermissionMode::AnyUser);

    assert!(permissions.should_handle_advertisement(&advertisement_owned_by(Some(1234))));
    let satellite = known_satellite(state_owned_by(Some(1234), false, false));
    assert!(permissions.should_handle_satellite(&satellite));
    assert!(permissions.should_transfer_collections(&satellite));
}

#[test]
fn test_advertisement_filter_matches_users_and_unassigned() {
    let permissions = UserPermissions::new();
    permissions.set_multi_user(&[42, 7]).unwrap();

    assert!(permissions.should_handle_advertisement(&advertisement_owned_by(Some(42))));
    assert!(permissions.should_handle_advertisement(&advertisement_owned_by(Some(7))));
    assert!(permissions.should_handle_advertisement(&advertisement_owned_by(None)));
    assert!(!permissions.should_handle_advertisement(&advertisement_owned_by(Some(1000))));
}

#[test]
fn test_single_user_zero_means_nobody() {
    let permissions = UserPermissions::new();
    permissions.set_single_user(0);

    assert_eq!(permissions.mode(), PermissionMode::MultiUser(Default::default()));
    assert!(permissions.should_handle_advertisement(&advertisement_owned_by(None)));
    assert!(!permissions.should_handle_advertisement(&advertisement_owned_by(Some(42))));
}

#[test]
fn test_satellite_filter_uses_owner_metadata() {
    let permissions = UserPermissions::new();
    permissions.set_single_user(42);

    assert!(permissions.should_handle_satellite(&known_satellite(state_owned_by(Some(42), false, false))));
    assert!(!permissions.should_handle_satellite(&known_satellite(state_owned_by(Some(7), false, false))));
    // Unassigned satellites may advertise through but are not handled
    assert!(!permissions.should_handle_satellite(&known_satellite(state_owned_by(None, false, false))));
}

#[test]
fn test_unreadable_metadata_denies() {
    let permissions = UserPermissions::new();
    permissions.set_single_user(42);

    let mut garbage = state(false);
    garbage.persistent.application_data = vec![9, 9, 9];
    let satellite = known_satellite(garbage);
    assert!(!permissions.should_handle_satellite(&satellite));
    assert!(!permissions.should_transfer_collections(&satellite));

    // Sealed metadata cannot be read without a token
    let sealed = known_satellite(state_owned_by(Some(42), true, false));
    assert!(!permissions.should_handle_satellite(&sealed));
}

#[test]
fn test_fail_safe_satellite_always_handled() {
    let permissions = UserPermissions::new();
    permissions.set_single_user(42);

    let satellite = known_satellite(state_owned_by(Some(7), false, true));
    assert!(permissions.should_handle_satellite(&satellite));
    assert!(!permissions.should_transfer_collections(&satellite));
}

#[test]
fn test_transfer_switch() {
    let permissions = UserPermissions::new();
    let satellite = known_satellite(state_owned_by(Some(42), false, false));
    permissions.set_should_transfer(false);
    assert!(permissions.should_handle_satellite(&satellite));
    assert!(!permissions.should_transfer_collections(&satellite));

    let any = AnyUserPermissions::new();
    assert!(any.should_transfer_collections(&satellite));
    any.set_should_transfer(false);
    assert!(!any.should_transfer_collections(&satellite));
}

#[test]
fn test_user_filter_is_bounded() {
    let permissions = UserPermissions::new();
    let too_many: Vec<u32> = (1..=40).collect();
    assert!(matches!(
        permissions.set_multi_user(&too_many),
        Err(SatelliteError::InvalidConfig(_))
    ));
    assert_eq!(permissions.mode(), PermissionMode::AnyUser);
}

#[test]
fn test_authorization_token_required() {
    let (cache, fetches) = cache_answering(TokenResponse::NoMembership);
    let permissions = UserPermissions::new()
        .with_authorization(cache)
        .with_clock(fixed_clock);
    let satellite = known_satellite(state_owned_by(Some(42), false, false));

    assert!(!permissions.should_handle_satellite(&satellite));
    assert!(!permissions.should_transfer_collections(&satellite));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn test_authorization_token_unlocks_sealed_metadata() {
    let (cache, fetches) = cache_answering(TokenResponse::Token {
        value: "signed".to_string(),
        expires_at_ms: 10_000_000,
    });
    let permissions = UserPermissions::new()
        .with_authorization(Arc::clone(&cache))
        .with_clock(fixed_clock);
    permissions.set_single_user(42);
    let satellite = known_satellite(state_owned_by(Some(42), true, false));

    assert!(permissions.should_handle_satellite(&satellite));
    assert!(permissions.should_transfer_collections(&satellite));
    // The transfer check reuses the cached token
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(cache.has_token("HV-0001", fixed_clock()));
}

#[test]
fn test_manager_applies_user_filter() {
    let transport = MockTransport::powered_on();
    let permissions = Arc::new(UserPermissions::new());
    permissions.set_single_user(42);
    let transfers = RecordingTransfers::new();
    let manager = manager_with(
        transport.clone(),
        Environment::new()
            .with_permissions(permissions)
            .with_transfers(transfers.clone()),
    );

    let stranger = satellite_id(1);
    let mut stranger_ad = advertisement_owned_by(Some(7));
    stranger_ad.id = stranger.clone();
    manager.handle_event(TransportEvent::Advertisement(stranger_ad));
    assert!(manager.get_discovered_satellites().is_empty());

    // An owner change hidden from the fingerprint is caught once the state is known
    let mislabelled = satellite_id(2);
    let mut mislabelled_ad = advertisement_owned_by(Some(42));
    mislabelled_ad.id = mislabelled.clone();
    manager.handle_event(TransportEvent::Advertisement(mislabelled_ad));
    manager.handle_event(TransportEvent::Connected(mislabelled.clone()));
    manager.handle_event(TransportEvent::StateUpdated {
        id: mislabelled.clone(),
        state: state_owned_by(Some(7), false, false),
        collections: CollectionIndexes::new(0, 2),
    });
    assert!(manager.satellite(&mislabelled).unwrap().is_suppressed());
    assert_eq!(transport.count(&Call::Disconnect(mislabelled.clone())), 1);

    let owned = satellite_id(3);
    let mut owned_ad = advertisement_owned_by(Some(42));
    owned_ad.id = owned.clone();
    manager.handle_event(TransportEvent::Advertisement(owned_ad));
    manager.handle_event(TransportEvent::Connected(owned.clone()));
    manager.handle_event(TransportEvent::StateUpdated {
        id: owned.clone(),
        state: state_owned_by(Some(42), false, false),
        collections: CollectionIndexes::new(0, 2),
    });
    assert_eq!(transfers.finished(), vec![0, 1]);
}
