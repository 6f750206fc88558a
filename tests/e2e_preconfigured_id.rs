//! Spec §8 scenario 2: an endpoint constructed with a preconfigured id
//! announces it directly instead of requesting one, and is usable from its
//! very first `update()`. A second, auto-assigned endpoint can still reach
//! it by that id through the router.

use meshbus::connection::in_process::in_process_pair;
use meshbus::message::{EndpointId, MessageId, Priority};
use meshbus::{Endpoint, IdRange, Router};

#[tokio::test]
async fn preconfigured_endpoint_is_usable_immediately_and_keeps_its_chosen_id() {
    // Deliberately outside the router's own allocation range, to show a
    // preconfigured id doesn't need to come from it.
    let mut router = Router::new(IdRange::new(500, 1000));
    let (preconfigured_router_side, preconfigured_endpoint_side) = in_process_pair(1 << 16);
    let (auto_router_side, auto_endpoint_side) = in_process_pair(1 << 16);
    router.add_pending_connection(Box::new(preconfigured_router_side));
    router.add_pending_connection(Box::new(auto_router_side));

    let preconfigured = EndpointId(50);
    let mut fixed_endpoint = Endpoint::new(Box::new(preconfigured_endpoint_side), Some(preconfigured));
    let mut auto_endpoint = Endpoint::new(Box::new(auto_endpoint_side), None);

    // Usable and carrying its id before a single tick runs.
    assert!(fixed_endpoint.is_usable());
    assert_eq!(fixed_endpoint.get_id(), Some(preconfigured));

    for _ in 0..20 {
        router.update().await.unwrap();
        fixed_endpoint.update().await.unwrap();
        auto_endpoint.update().await.unwrap();
        if auto_endpoint.get_id().is_some() {
            break;
        }
    }
    assert_eq!(fixed_endpoint.get_id(), Some(preconfigured), "announcing must not change the id");
    let auto_id = auto_endpoint.get_id().expect("auto endpoint never acquired an id");

    let hello = MessageId::new("eagiTest", "hello");
    fixed_endpoint.subscribe(hello.clone());
    auto_endpoint.post(preconfigured, hello.clone(), Priority::Normal, vec![9]);

    let mut delivered = None;
    for _ in 0..10 {
        auto_endpoint.update().await.unwrap();
        router.update().await.unwrap();
        fixed_endpoint.update().await.unwrap();
        if fixed_endpoint.process_one(&hello, |m| {
            assert_eq!(m.source_id, auto_id);
        }) {
            delivered = Some(());
            break;
        }
    }
    assert!(delivered.is_some(), "message addressed to the preconfigured id never arrived");
}
