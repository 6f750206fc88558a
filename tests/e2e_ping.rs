//! Spec §8 scenario 1: a router with two in-process endpoints attached; one
//! pings the other, the other pongs back.

use meshbus::connection::in_process::in_process_pair;
use meshbus::message::{MessageId, Priority};
use meshbus::{Endpoint, IdRange, Router};
use std::sync::{Arc, Mutex};

async fn run_until_both_have_ids(router: &mut Router, a: &mut Endpoint, b: &mut Endpoint) {
    for _ in 0..50 {
        router.update().await.unwrap();
        a.update().await.unwrap();
        b.update().await.unwrap();
        if a.get_id().is_some() && b.get_id().is_some() {
            return;
        }
    }
    panic!("endpoints never acquired ids");
}

#[tokio::test]
async fn ping_pong_round_trips_through_the_router() {
    let mut router = Router::new(IdRange::new(1, 1000));
    let (a_router_side, a_endpoint_side) = in_process_pair(1 << 16);
    let (b_router_side, b_endpoint_side) = in_process_pair(1 << 16);
    router.add_pending_connection(Box::new(a_router_side));
    router.add_pending_connection(Box::new(b_router_side));

    let mut endpoint_a = Endpoint::new(Box::new(a_endpoint_side), None);
    let mut endpoint_b = Endpoint::new(Box::new(b_endpoint_side), None);
    run_until_both_have_ids(&mut router, &mut endpoint_a, &mut endpoint_b).await;

    let a_id = endpoint_a.get_id().unwrap();
    let b_id = endpoint_b.get_id().unwrap();
    assert_ne!(a_id, b_id);

    let ping = MessageId::new("eagiTest", "ping");
    let pong = MessageId::new("eagiTest", "pong");
    endpoint_b.subscribe(ping.clone());
    endpoint_a.subscribe(pong.clone());
    assert!(endpoint_a.post(b_id, ping.clone(), Priority::Normal, b"hello".to_vec()));

    let ping_payload = Arc::new(Mutex::new(None));
    let pong_seen = Arc::new(Mutex::new(false));
    for _ in 0..20 {
        endpoint_a.update().await.unwrap();
        router.update().await.unwrap();
        endpoint_b.update().await.unwrap();

        let captured = ping_payload.clone();
        endpoint_b.process_one(&ping, move |message| {
            *captured.lock().unwrap() = Some(message.payload.clone());
        });
        if ping_payload.lock().unwrap().is_some() && !*pong_seen.lock().unwrap() {
            endpoint_b.post(a_id, pong.clone(), Priority::Normal, vec![]);
        }

        router.update().await.unwrap();
        endpoint_a.update().await.unwrap();
        let seen = pong_seen.clone();
        endpoint_a.process_one(&pong, move |_| *seen.lock().unwrap() = true);

        if *pong_seen.lock().unwrap() {
            break;
        }
    }

    assert_eq!(ping_payload.lock().unwrap().as_deref(), Some(b"hello".as_slice()));
    assert!(*pong_seen.lock().unwrap(), "B's pong never reached A");
}
