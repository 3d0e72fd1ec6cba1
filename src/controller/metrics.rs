//! Prometheus metrics for the Agones load balancer operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for the reconciliation counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub kind: String,
}

/// Labels for the transaction outcome counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransactionLabels {
    pub transaction: String,
    pub outcome: String,
}

/// Labels for the policy self-deletion counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SelfHealLabels {
    pub reason: String,
}

/// Reconcile invocations per watched kind
pub static RECONCILIATIONS: Lazy<Family<ReconcileLabels, Counter>> = Lazy::new(Family::default);

/// Read-modify-write outcomes per transaction
pub static TRANSACTIONS: Lazy<Family<TransactionLabels, Counter>> = Lazy::new(Family::default);

/// Managed egress policies deleted by the consistency checker
pub static POLICY_SELF_DELETIONS: Lazy<Family<SelfHealLabels, Counter>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "agones_lb_reconciliations",
        "Reconcile invocations per resource kind",
        RECONCILIATIONS.clone(),
    );
    registry.register(
        "agones_lb_transactions",
        "Read-modify-write transaction outcomes",
        TRANSACTIONS.clone(),
    );
    registry.register(
        "agones_lb_policy_self_deletions",
        "Managed egress gateway policies deleted after a consistency check",
        POLICY_SELF_DELETIONS.clone(),
    );
    registry
});

pub fn record_reconcile(kind: &str) {
    RECONCILIATIONS
        .get_or_create(&ReconcileLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn record_transaction(transaction: &str, outcome: &str) {
    TRANSACTIONS
        .get_or_create(&TransactionLabels {
            transaction: transaction.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn record_self_deletion(reason: &str) {
    POLICY_SELF_DELETIONS
        .get_or_create(&SelfHealLabels {
            reason: reason.to_string(),
        })
        .inc();
}

/// Render the registry in the OpenMetrics text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
