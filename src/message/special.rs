//! Reserved bus-internal message ids (§6).
//!
//! All special messages share the `CLASS` below, marking them as routing
//! control traffic rather than application payloads.

use super::MessageId;

/// The bus-internal message class. Anything with this class is dispatched by
/// routers and endpoints themselves rather than handed to application code.
pub const CLASS: &str = "eagiBus";

macro_rules! special_ids {
    ($($(#[$meta:meta])* $fn_name:ident => $wire_name:expr),+ $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $fn_name() -> MessageId {
                MessageId::new(CLASS, $wire_name)
            }
        )+
    };
}

special_ids! {
    /// Endpoint → router: "I have no id yet, please assign or confirm one."
    request_id => "requestId",
    /// Router → endpoint: a freshly allocated id.
    assign_id => "assignId",
    /// Router → endpoint: accepted the endpoint's preconfigured id.
    confirm_id => "confirmId",
    /// Endpoint → router (on every connection change): "here is my id."
    announce_id => "annEndptId",
    /// Endpoint → router: graceful detach.
    bye_bye_endpoint => "byeByeEndp",
    /// Router → attached nodes: this router is going away.
    bye_bye_router => "byeByeRutr",
    /// Bridge → attached nodes: this bridge is going away.
    bye_bye_bridge => "byeByeBrdg",
    /// Endpoint → router, periodic: liveness beacon carrying the process instance id.
    still_alive => "stillAlive",
    /// Endpoint → router: register interest in a message id.
    subscribes_to => "subscribTo",
    /// Endpoint → router: withdraw interest in a message id.
    unsubscribes_from => "unsubFrom",
    /// Router → asker: "that endpoint is not subscribed to that id."
    not_subscribed_to => "notSubTo",
    /// Query an endpoint's or router's subscription set.
    query_subscriptions => "qrySubscrp",
    /// Query whether a specific endpoint subscribes to a specific id.
    query_subscriber => "qrySubscrb",
    /// Clear a routed node's block-list.
    clear_block_list => "clrBlkList",
    /// Add entries to a routed node's block-list.
    message_block_list => "msgBlkList",
    /// Clear a routed node's allow-list.
    clear_allow_list => "clrAlwList",
    /// Add entries to a routed node's allow-list.
    message_allow_list => "msgAlwList",
    /// A BLOB fragment payload.
    blob_fragment => "blobFrgmnt",
    /// A request to resend specific byte ranges of a BLOB.
    blob_resend => "blobResend",
    /// Router → attached nodes, periodic: observed average message age.
    message_flow_info => "msgFlowInf",
    /// Query bus topology.
    topology_query => "topoQuery",
    /// Topology info: router connection.
    topology_router_connection => "topoRutrCn",
    /// Topology info: bridge connection.
    topology_bridge_connection => "topoBrdgCn",
    /// Topology info: endpoint.
    topology_endpoint => "topoEndpt",
    /// Query bus statistics.
    stats_query => "statsQuery",
    /// Statistics: router.
    stats_router => "statsRutr",
    /// Statistics: bridge.
    stats_bridge => "statsBrdg",
    /// Statistics: endpoint.
    stats_endpoint => "statsEndpt",
    /// Query an endpoint's certificate.
    endpoint_cert_query => "eptCertQry",
    /// An endpoint's certificate, PEM-encoded.
    endpoint_cert_pem => "eptCertPem",
    /// Request the endpoint to sign a nonce.
    endpoint_sign_nonce => "eptSigNnce",
    /// The signed nonce response.
    endpoint_nonce_signed => "eptNnceSig",
    /// Query a router's certificate.
    router_cert_query => "rtrCertQry",
    /// A router's certificate, PEM-encoded.
    router_cert_pem => "rtrCertPem",
    /// Router → pending connection: "prove you know the password for this nonce."
    request_router_password => "reqRutrPwd",
    /// Pending connection → router: the encrypted password proof.
    encrypted_router_password => "encRutrPwd",
    /// Ping request.
    ping => "ping",
    /// Ping reply.
    pong => "pong",
    /// Peer → router: "I am not a router, stop treating me as maybe-one."
    not_a_router => "notARouter",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_ids_share_the_bus_internal_class() {
        assert!(ping().is_special());
        assert!(assign_id().is_special());
        assert_eq!(ping().class, CLASS);
    }

    #[test]
    fn special_ids_are_distinct() {
        assert_ne!(ping(), pong());
        assert_ne!(assign_id(), confirm_id());
    }
}
