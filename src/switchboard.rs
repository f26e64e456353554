//! Server-side TCP/IP forwarding registry (component C6, spec.md §4.6).
//!
//! Maps a bound address to the connection that requested `tcpip-forward`
//! for it. When something external accepts a connection on that address
//! (accepting the raw socket is out of scope, spec.md §1), the host
//! application looks the binding up here and calls back through it to
//! open a `forwarded-tcpip` channel on the *originating* connection.
//!
//! Registrations hold only a `Weak` handle to the connection (spec.md §9
//! design notes): the switchboard must never be the reason a connection
//! object stays alive after its owner drops it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::Mutex;

use crate::config::{DuplexHandler, Identity};
use crate::error::{Error, Result};
use crate::name::Address;

/// Something capable of opening a `forwarded-tcpip` channel back on the
/// connection that registered a forwarding, implemented by the connection
/// itself (spec.md §4.6 "opener"). `handler` pumps the externally-accepted
/// socket (accepting it is out of scope, spec.md §1) against the new
/// channel once it's confirmed.
#[async_trait]
pub trait ForwardOpener: Send + Sync {
    async fn open_forwarded_tcpip(
        &self,
        bound: Address,
        originator: Address,
        handler: Box<dyn DuplexHandler>,
    ) -> Result<()>;
}

struct Registration {
    identity: Identity,
    opener: Weak<dyn ForwardOpener>,
}

/// Global (per-process) registry, shared by every connection's dispatcher.
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct Switchboard {
    registrations: Arc<Mutex<HashMap<Address, Registration>>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Switchboard::default()
    }

    /// Registers `opener` as the handler for `bound`, failing if something
    /// else already holds that binding (spec.md §4.6).
    pub async fn request_forwarding(
        &self,
        identity: Identity,
        bound: Address,
        opener: Weak<dyn ForwardOpener>,
    ) -> bool {
        let mut regs = self.registrations.lock().await;
        if let Some(existing) = regs.get(&bound) {
            if existing.opener.upgrade().is_some() {
                return false;
            }
        }
        trace!("switchboard: registering forwarding for {bound}");
        regs.insert(bound, Registration { identity, opener });
        true
    }

    pub async fn cancel_forwarding(&self, bound: &Address) {
        self.registrations.lock().await.remove(bound);
    }

    /// Looks up the opener for `bound`, pruning the entry if its
    /// connection has already gone away.
    pub async fn get_forwarding(&self, bound: &Address) -> Option<Arc<dyn ForwardOpener>> {
        let mut regs = self.registrations.lock().await;
        match regs.get(bound).and_then(|r| r.opener.upgrade()) {
            Some(opener) => Some(opener),
            None => {
                regs.remove(bound);
                None
            }
        }
    }

    /// Opens a forwarded-tcpip channel for an externally-accepted
    /// connection at `bound`, failing if nothing registered it.
    pub async fn open(
        &self,
        bound: &Address,
        originator: Address,
        handler: Box<dyn DuplexHandler>,
    ) -> Result<()> {
        let opener = self
            .get_forwarding(bound)
            .await
            .ok_or_else(|| Error::protocol(format!("no forwarding registered for {bound}")))?;
        opener
            .open_forwarded_tcpip(bound.clone(), originator, handler)
            .await
    }

    /// Removes every forwarding registered by `identity` (spec.md §4.6
    /// "on connection teardown").
    pub async fn cancel_all_for(&self, identity: &Identity) {
        let mut regs = self.registrations.lock().await;
        let before = regs.len();
        regs.retain(|_, r| &r.identity != identity);
        let removed = before - regs.len();
        if removed > 0 {
            debug!("switchboard: cancelled {removed} forwarding(s) for identity on teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyOpener;

    #[async_trait]
    impl ForwardOpener for DummyOpener {
        async fn open_forwarded_tcpip(
            &self,
            _bound: Address,
            _originator: Address,
            _handler: Box<dyn DuplexHandler>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let sb = Switchboard::new();
        let owner: Arc<dyn ForwardOpener> = Arc::new(DummyOpener);
        let addr = Address::new("0.0.0.0", 2222);
        assert!(
            sb.request_forwarding(Identity::unauthenticated(), addr.clone(), Arc::downgrade(&owner))
                .await
        );
        assert!(
            !sb
                .request_forwarding(Identity::unauthenticated(), addr, Arc::downgrade(&owner))
                .await
        );
    }

    #[tokio::test]
    async fn dead_registration_is_pruned_and_rebindable() {
        let sb = Switchboard::new();
        let addr = Address::new("0.0.0.0", 2222);
        {
            let owner: Arc<dyn ForwardOpener> = Arc::new(DummyOpener);
            assert!(
                sb.request_forwarding(Identity::unauthenticated(), addr.clone(), Arc::downgrade(&owner))
                    .await
            );
        } // owner dropped, weak handle now dangling

        assert!(sb.get_forwarding(&addr).await.is_none());

        let owner2: Arc<dyn ForwardOpener> = Arc::new(DummyOpener);
        assert!(
            sb.request_forwarding(Identity::unauthenticated(), addr, Arc::downgrade(&owner2))
                .await
        );
    }

    #[tokio::test]
    async fn cancel_all_for_identity_removes_only_its_own() {
        let sb = Switchboard::new();
        let owner: Arc<dyn ForwardOpener> = Arc::new(DummyOpener);
        let mine = Identity("alice".into());
        let theirs = Identity("bob".into());
        sb.request_forwarding(mine.clone(), Address::new("a", 1), Arc::downgrade(&owner))
            .await;
        sb.request_forwarding(theirs, Address::new("b", 2), Arc::downgrade(&owner))
            .await;
        sb.cancel_all_for(&mine).await;
        assert!(sb.get_forwarding(&Address::new("a", 1)).await.is_none());
        assert!(sb.get_forwarding(&Address::new("b", 2)).await.is_some());
    }
}
