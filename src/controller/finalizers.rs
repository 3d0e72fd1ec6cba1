//! Finalizer bookkeeping and the cleanup performed before permanent deletion
//!
//! GameServers carry the finalizer while they are egress enabled so the
//! generated policy is deleted first. Policies carry the same token as a
//! no-op hook.

use std::marker::PhantomData;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::retry::{read_modify_write, Transaction, TxOutcome};
use super::Context;
use crate::crd::keys::ContractKey;
use crate::crd::{CiliumEgressGatewayPolicy, GameServer};
use crate::error::{Error, Result};
use crate::store::{ResourceStore, StoreKind};

/// Finalizer token placed on GameServers and generated policies
pub const EGRESS_POLICY_FINALIZER: &str = ContractKey::EgressPolicyFinalizer.key();

pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == EGRESS_POLICY_FINALIZER)
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Bound a future by the operation timeout
pub(crate) async fn bounded<T>(
    operation: &str,
    ctx_timeout: std::time::Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(ctx_timeout, fut)
        .await
        .map_err(|_| Error::Timeout {
            operation: operation.to_string(),
            seconds: ctx_timeout.as_secs(),
        })?
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerEdit {
    Attach,
    Detach,
}

/// Add or remove the finalizer token on any kind, compare-and-swap on resourceVersion
pub struct EditFinalizer<'a, S, K> {
    store: &'a S,
    namespace: Option<String>,
    name: String,
    edit: FinalizerEdit,
    kind: PhantomData<fn() -> K>,
}

impl<'a, S: ResourceStore, K: StoreKind> EditFinalizer<'a, S, K> {
    pub fn new(store: &'a S, obj: &K, edit: FinalizerEdit) -> Self {
        Self {
            store,
            namespace: obj.namespace(),
            name: obj.name_any(),
            edit,
            kind: PhantomData,
        }
    }
}

#[async_trait]
impl<'a, S: ResourceStore, K: StoreKind> Transaction for EditFinalizer<'a, S, K> {
    type Fetched = K;
    /// Whether the object was written
    type Output = bool;

    fn name(&self) -> &'static str {
        match self.edit {
            FinalizerEdit::Attach => "attach-finalizer",
            FinalizerEdit::Detach => "detach-finalizer",
        }
    }

    /// A vanished object needs no finalizer edit
    fn admit_missing(&self) -> bool {
        true
    }

    async fn fetch(&self) -> Result<Option<K>> {
        self.store.get(self.namespace.as_deref(), &self.name).await
    }

    async fn transact(&self, fetched: Option<K>) -> Result<bool> {
        let Some(mut obj) = fetched else {
            return Ok(false);
        };
        let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
        let present = finalizers.iter().any(|f| f == EGRESS_POLICY_FINALIZER);
        match (self.edit, present) {
            (FinalizerEdit::Attach, false) => {
                finalizers.push(EGRESS_POLICY_FINALIZER.to_string());
            }
            (FinalizerEdit::Detach, true) => {
                finalizers.retain(|f| f != EGRESS_POLICY_FINALIZER);
            }
            _ => return Ok(false),
        }
        self.store.update(&obj).await?;
        info!(
            "{} finalizer on {} {}",
            match self.edit {
                FinalizerEdit::Attach => "Attached",
                FinalizerEdit::Detach => "Removed",
            },
            K::kind(&()),
            self.name
        );
        Ok(true)
    }
}

/// Result of [`DeletePolicy`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDeletion {
    Deleted,
    Absent,
    /// Same name, but not generated by this operator
    Unmanaged,
    /// A different incarnation than the one the verdict was made on
    Replaced,
}

/// Delete a managed egress gateway policy by name.
///
/// With `expected_uid` set, only that exact object is deleted; the uid is also
/// sent as a delete precondition.
pub struct DeletePolicy<'a, S> {
    pub store: &'a S,
    pub name: String,
    pub expected_uid: Option<String>,
}

#[async_trait]
impl<'a, S: ResourceStore> Transaction for DeletePolicy<'a, S> {
    type Fetched = CiliumEgressGatewayPolicy;
    type Output = PolicyDeletion;

    fn name(&self) -> &'static str {
        "delete-policy"
    }

    fn admit_missing(&self) -> bool {
        true
    }

    async fn fetch(&self) -> Result<Option<CiliumEgressGatewayPolicy>> {
        self.store.get(None, &self.name).await
    }

    async fn transact(
        &self,
        fetched: Option<CiliumEgressGatewayPolicy>,
    ) -> Result<PolicyDeletion> {
        let Some(policy) = fetched else {
            info!("Egress gateway policy {} already gone", self.name);
            return Ok(PolicyDeletion::Absent);
        };
        if !policy.is_managed() {
            warn!(
                "Egress gateway policy {} is not managed by this operator, leaving it alone",
                self.name
            );
            return Ok(PolicyDeletion::Unmanaged);
        }
        let uid = policy.uid();
        if self.expected_uid.is_some() && self.expected_uid != uid {
            info!(
                "Egress gateway policy {} was recreated since it was checked, keeping it",
                self.name
            );
            return Ok(PolicyDeletion::Replaced);
        }
        self.store
            .delete::<CiliumEgressGatewayPolicy>(None, &self.name, uid.as_deref())
            .await?;
        info!("Deleted egress gateway policy {}", self.name);
        Ok(PolicyDeletion::Deleted)
    }
}

/// Cleanup before a GameServer goes away: delete its generated policy.
///
/// Returns whether the finalizer may be removed.
pub async fn finalize_game_server<S: ResourceStore>(
    ctx: &Context<S>,
    gs: &GameServer,
) -> Result<bool> {
    if !gs.egress_policy_enabled() {
        return Ok(true);
    }
    let tx = DeletePolicy {
        store: &ctx.store,
        name: gs.egress_policy_name(),
        expected_uid: None,
    };
    let outcome = bounded(
        "delete-policy",
        ctx.settings.operation_timeout,
        read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel),
    )
    .await?;
    Ok(outcome.is_committed())
}

/// Cleanup before a generated policy goes away. Nothing to do yet.
pub async fn finalize_egress_policy<S: ResourceStore>(
    _ctx: &Context<S>,
    _policy: &CiliumEgressGatewayPolicy,
) -> Result<bool> {
    Ok(true)
}

/// Run the finalizer edit through the retry executor, bounded by the operation timeout
pub async fn edit_finalizer<S: ResourceStore, K: StoreKind>(
    ctx: &Context<S>,
    obj: &K,
    edit: FinalizerEdit,
) -> Result<TxOutcome<K, bool>> {
    let tx = EditFinalizer::new(&ctx.store, obj, edit);
    bounded(
        tx.name(),
        ctx.settings.operation_timeout,
        read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Context;
    use crate::crd::{CiliumEgressGatewayPolicySpec, GameServerSpec};
    use crate::store::memory::{Fault, MemoryStore};
    use std::collections::BTreeMap;

    fn game_server() -> GameServer {
        let mut gs = GameServer::new("arena", GameServerSpec::default());
        gs.metadata.namespace = Some("games".to_string());
        gs
    }

    fn managed_policy(name: &str) -> CiliumEgressGatewayPolicy {
        let mut policy = CiliumEgressGatewayPolicy::new(name, CiliumEgressGatewayPolicySpec::default());
        policy.metadata.labels = Some(BTreeMap::from([(
            ContractKey::IsManaged.key().to_string(),
            "true".to_string(),
        )]));
        policy
    }

    #[tokio::test]
    async fn attach_then_detach_is_idempotent() {
        let ctx = Context::for_tests(MemoryStore::new());
        let gs = ctx.store.insert(game_server());

        let outcome = edit_finalizer(&ctx, &gs, FinalizerEdit::Attach).await.unwrap();
        assert_eq!(outcome.output(), Some(true));
        let stored: GameServer = ctx.store.peek(Some("games"), "arena").unwrap();
        assert!(has_finalizer(&stored));

        let outcome = edit_finalizer(&ctx, &gs, FinalizerEdit::Attach).await.unwrap();
        assert_eq!(outcome.output(), Some(false));
        assert_eq!(ctx.store.writes(), 1);

        edit_finalizer(&ctx, &gs, FinalizerEdit::Detach).await.unwrap();
        let stored: GameServer = ctx.store.peek(Some("games"), "arena").unwrap();
        assert!(!has_finalizer(&stored));
    }

    #[tokio::test]
    async fn finalizer_edit_survives_a_conflict() {
        let ctx = Context::for_tests(MemoryStore::new());
        let gs = ctx.store.insert(game_server());
        ctx.store.fail_next_write(Fault::Conflict);

        let outcome = edit_finalizer(&ctx, &gs, FinalizerEdit::Attach).await.unwrap();
        assert!(matches!(outcome, TxOutcome::Committed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn delete_policy_spares_unmanaged_and_replaced() {
        let ctx = Context::for_tests(MemoryStore::new());
        let mut unmanaged = managed_policy("user-policy");
        unmanaged.metadata.labels = None;
        ctx.store.insert(unmanaged);
        ctx.store.insert(managed_policy("generated"));

        let tx = DeletePolicy {
            store: &ctx.store,
            name: "user-policy".to_string(),
            expected_uid: None,
        };
        let outcome = read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel).await.unwrap();
        assert_eq!(outcome.output(), Some(PolicyDeletion::Unmanaged));

        let tx = DeletePolicy {
            store: &ctx.store,
            name: "generated".to_string(),
            expected_uid: Some("stale".to_string()),
        };
        let outcome = read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel).await.unwrap();
        assert_eq!(outcome.output(), Some(PolicyDeletion::Replaced));
        assert_eq!(ctx.store.all::<CiliumEgressGatewayPolicy>().len(), 2);
        assert_eq!(ctx.store.writes(), 0);
    }

    #[tokio::test]
    async fn delete_policy_treats_absence_as_done() {
        let ctx = Context::for_tests(MemoryStore::new());
        let tx = DeletePolicy {
            store: &ctx.store,
            name: "nothing-here".to_string(),
            expected_uid: None,
        };
        let outcome = read_modify_write(&tx, &ctx.settings.retry, &ctx.cancel).await.unwrap();
        assert_eq!(outcome.output(), Some(PolicyDeletion::Absent));
    }
}
