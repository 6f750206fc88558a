//! Spec §8 scenario 6: toggling an endpoint's connection "not usable" and
//! back produces established(true) -> lost -> established(true), and
//! messages posted during the outage are delivered once the link recovers.

use meshbus::connection::in_process::in_process_pair;
use meshbus::message::{EndpointId, MessageId, Priority};
use meshbus::{Endpoint, IdRange, Router};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn connection_loss_and_recovery_preserves_the_outbox() {
    let mut router = Router::new(IdRange::new(1, 1000));
    let (router_side, endpoint_side) = in_process_pair(1 << 16);
    router.add_pending_connection(Box::new(router_side));

    let usable_handle = endpoint_side.usable_handle();
    let mut endpoint_a = Endpoint::new(Box::new(endpoint_side), Some(EndpointId(5)));

    let events = Arc::new(Mutex::new(Vec::new()));
    let e1 = events.clone();
    endpoint_a
        .connection_established
        .subscribe(move |has_id: &bool| e1.lock().unwrap().push(format!("established({})", has_id)));
    let e2 = events.clone();
    endpoint_a
        .connection_lost
        .subscribe(move |_: &()| e2.lock().unwrap().push("lost".to_string()));

    for _ in 0..5 {
        router.update().await.unwrap();
        endpoint_a.update().await.unwrap();
    }
    assert_eq!(endpoint_a.get_id(), Some(EndpointId(5)));

    usable_handle.set_usable(false);
    endpoint_a.update().await.unwrap();

    let topic = MessageId::new("x", "y");
    assert!(endpoint_a.post(EndpointId(5), topic.clone(), Priority::Normal, b"queued".to_vec()));

    usable_handle.set_usable(true);
    for _ in 0..5 {
        endpoint_a.update().await.unwrap();
        router.update().await.unwrap();
    }

    assert_eq!(
        *events.lock().unwrap(),
        vec!["established(true)".to_string(), "lost".to_string(), "established(true)".to_string()]
    );
}
