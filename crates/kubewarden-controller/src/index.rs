//! Reverse lookup from policies to the policy server they are bound to.
//!
//! The index is kept current from the same watch streams that trigger policy
//! server reconciles, so a reconcile never sees a request before the index
//! holds the policy behind it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::{Stream, TryStreamExt};
use kube::{
    Api, Client,
    runtime::{WatchStreamExt, reflector::ObjectRef, watcher},
};
use parking_lot::RwLock;

use crate::crds::{AnyPolicy, Policy, PolicyServer};

/// Order in which bound policies are reported.
const KIND_ORDER: [&str; 4] = [
    "ClusterAdmissionPolicy",
    "AdmissionPolicy",
    "AdmissionPolicyGroup",
    "ClusterAdmissionPolicyGroup",
];

/// Kind rank and unique name.
type PolicyKey = (usize, String);

fn kind_rank(kind: &str) -> usize {
    KIND_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(KIND_ORDER.len())
}

fn key(policy: &AnyPolicy) -> PolicyKey {
    (kind_rank(policy.kind()), policy.unique_name())
}

#[derive(Debug, Default)]
struct IndexState {
    by_server: HashMap<String, BTreeMap<PolicyKey, AnyPolicy>>,
    servers: HashMap<PolicyKey, String>,
    /// Objects received since the last `Init`, per kind.
    relisting: HashMap<String, Vec<AnyPolicy>>,
}

impl IndexState {
    fn apply(&mut self, policy: AnyPolicy) {
        let key = key(&policy);
        let server = policy.policy_server().to_string();
        if let Some(previous) = self.servers.insert(key.clone(), server.clone()) {
            if previous != server {
                self.remove_from(&previous, &key);
            }
        }
        self.by_server.entry(server).or_default().insert(key, policy);
    }

    fn delete(&mut self, policy: &AnyPolicy) {
        let key = key(policy);
        if let Some(server) = self.servers.remove(&key) {
            self.remove_from(&server, &key);
        }
    }

    fn remove_from(&mut self, server: &str, key: &PolicyKey) {
        if let Some(policies) = self.by_server.get_mut(server) {
            policies.remove(key);
            if policies.is_empty() {
                self.by_server.remove(server);
            }
        }
    }

    /// Replaces every entry of `kind` with `policies`.
    fn reset(&mut self, kind: &str, policies: Vec<AnyPolicy>) {
        let rank = kind_rank(kind);
        let stale: Vec<_> = self
            .servers
            .iter()
            .filter(|((r, _), _)| *r == rank)
            .map(|(key, server)| (key.clone(), server.clone()))
            .collect();
        for (key, server) in stale {
            self.servers.remove(&key);
            self.remove_from(&server, &key);
        }
        for policy in policies {
            self.apply(policy);
        }
    }
}

/// Policies of every kind keyed by the name of their policy server.
#[derive(Debug, Clone, Default)]
pub struct PolicyIndex {
    state: Arc<RwLock<IndexState>>,
}

impl PolicyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every policy of kind `P` with `policies`.
    pub fn reset<P>(&self, policies: impl IntoIterator<Item = P>)
    where
        P: Policy,
        AnyPolicy: From<P>,
    {
        let policies = policies.into_iter().map(AnyPolicy::from).collect();
        self.state.write().reset(&P::kind(&()), policies);
    }

    /// Folds one watch event into the index. A relist only replaces the
    /// indexed objects once it is complete.
    pub fn handle<P>(&self, event: &watcher::Event<P>)
    where
        P: Policy,
        AnyPolicy: From<P>,
    {
        let kind = P::kind(&()).into_owned();
        let mut state = self.state.write();
        match event {
            watcher::Event::Apply(policy) => state.apply(policy.clone().into()),
            watcher::Event::Delete(policy) => state.delete(&policy.clone().into()),
            watcher::Event::Init => {
                state.relisting.insert(kind, Vec::new());
            }
            watcher::Event::InitApply(policy) => {
                state.relisting.entry(kind).or_default().push(policy.clone().into());
            }
            watcher::Event::InitDone => {
                let listed = state.relisting.remove(&kind).unwrap_or_default();
                state.reset(&kind, listed);
            }
        }
    }

    /// Every policy of every kind bound to `policy_server`: cluster policies,
    /// policies, policy groups, then cluster policy groups.
    pub fn bound_policies(&self, policy_server: &str) -> Vec<AnyPolicy> {
        self.state
            .read()
            .by_server
            .get(policy_server)
            .map(|policies| policies.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Watches every policy of kind `P`, updating `index` before the objects are
/// handed on as reconcile triggers.
pub fn indexed_policies<P>(
    client: Client,
    index: PolicyIndex,
) -> impl Stream<Item = Result<P, watcher::Error>> + Send + 'static
where
    P: Policy,
    AnyPolicy: From<P>,
{
    watcher(Api::<P>::all(client), watcher::Config::default())
        .map_ok(move |event| {
            index.handle(&event);
            event
        })
        .touched_objects()
        .default_backoff()
}

/// Maps a change on a policy to a reconcile request for its policy server.
///
/// Watches report both the old and the new object of an update, so the same
/// server may be requested twice for one change.
pub fn policy_server_request<P: Policy>(policy: P) -> Option<ObjectRef<PolicyServer>> {
    Some(ObjectRef::new(policy.policy_server()))
}
