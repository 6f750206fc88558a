//! Spec §8 scenario 5: endpoint A broadcasts `("x","y")`; only the endpoint
//! subscribed to that exact message id sees it.

use meshbus::connection::in_process::in_process_pair;
use meshbus::message::{MessageId, Priority};
use meshbus::{Endpoint, IdRange, Router};

async fn run_until_all_have_ids(router: &mut Router, endpoints: &mut [&mut Endpoint]) {
    for _ in 0..50 {
        router.update().await.unwrap();
        for e in endpoints.iter_mut() {
            e.update().await.unwrap();
        }
        if endpoints.iter().all(|e| e.get_id().is_some()) {
            return;
        }
    }
    panic!("endpoints never acquired ids");
}

#[tokio::test]
async fn broadcast_reaches_only_the_matching_subscriber() {
    let mut router = Router::new(IdRange::new(1, 1000));
    let (a_side, a_conn) = in_process_pair(1 << 16);
    let (b_side, b_conn) = in_process_pair(1 << 16);
    let (c_side, c_conn) = in_process_pair(1 << 16);
    router.add_pending_connection(Box::new(a_side));
    router.add_pending_connection(Box::new(b_side));
    router.add_pending_connection(Box::new(c_side));

    let mut endpoint_a = Endpoint::new(Box::new(a_conn), None);
    let mut endpoint_b = Endpoint::new(Box::new(b_conn), None);
    let mut endpoint_c = Endpoint::new(Box::new(c_conn), None);
    run_until_all_have_ids(&mut router, &mut [&mut endpoint_a, &mut endpoint_b, &mut endpoint_c]).await;

    let topic_y = MessageId::new("x", "y");
    let topic_z = MessageId::new("x", "z");
    assert!(endpoint_b.subscribe(topic_y.clone()));
    assert!(endpoint_c.subscribe(topic_z.clone()));

    // Let the subscribe notices reach the router before broadcasting.
    for _ in 0..5 {
        endpoint_b.update().await.unwrap();
        endpoint_c.update().await.unwrap();
        router.update().await.unwrap();
    }

    assert!(endpoint_a.broadcast(topic_y.clone(), Priority::Normal, b"hello".to_vec()));

    for _ in 0..10 {
        endpoint_a.update().await.unwrap();
        router.update().await.unwrap();
        endpoint_b.update().await.unwrap();
        endpoint_c.update().await.unwrap();
    }

    let mut b_hits = 0;
    endpoint_b.process_all(&topic_y, |_| b_hits += 1);
    let mut c_hits = 0;
    endpoint_c.process_all(&topic_z, |_| c_hits += 1);

    assert_eq!(b_hits, 1, "B's matching subscription should fire exactly once");
    assert_eq!(c_hits, 0, "C subscribed to a different message id and must not see it");
}
