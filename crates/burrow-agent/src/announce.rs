//! Peer announcement adapter.
//!
//! After the first successful AUTH, the pool publishes one peer record
//! pointing at the rendezvous server and the relay port it assigned. The
//! domain is included only when the server granted it. Later connections
//! attach to the same session and never re-announce.

use std::sync::Arc;

use tracing::{info, warn};

use crate::connection::AuthGrant;
use crate::node::PeerInfo;
use crate::state::AgentContext;

/// Build the peer record for this agent run.
pub(crate) fn peer_record(ctx: &AgentContext, grant: AuthGrant) -> PeerInfo {
    let domain = if grant.domain_enabled {
        ctx.domain_name.clone()
    } else {
        None
    };
    PeerInfo {
        keypair: ctx.peer_keys.clone(),
        server_id: ctx.server_id,
        node_id: ctx.node.id(),
        port: grant.assigned_port,
        domain,
    }
}

/// Submit the record to the node for persistent announcement. Runs as its
/// own task so a slow index never stalls the pool.
pub(crate) fn announce_peer(ctx: &Arc<AgentContext>, grant: AuthGrant) {
    let info = peer_record(ctx, grant);
    info!(
        peer = %info.id(),
        server = %ctx.server_name,
        port = info.port,
        domain = info.domain.as_deref().unwrap_or(""),
        "announcing peer"
    );

    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = ctx.node.announce_peer(info, true).await {
            warn!(error = %e, "peer announcement failed");
        }
    });
}
