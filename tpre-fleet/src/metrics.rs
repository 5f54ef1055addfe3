//! Metrics definitions for the fleet.

/// Metrics key for the number of known identities across all shards.
pub const METRICS_ID_FLEET_KNOWN_NODES: &str = "tpre.fleet.known_nodes";
/// Metrics key for the number of identities in the verified shard.
pub const METRICS_ID_FLEET_VERIFIED_NODES: &str = "tpre.fleet.verified_nodes";
/// Metrics key for the number of quarantined identities.
pub const METRICS_ID_FLEET_QUARANTINED: &str = "tpre.fleet.quarantined";
/// Metrics key for completed learning rounds.
pub const METRICS_ID_FLEET_ROUNDS: &str = "tpre.fleet.rounds";
/// Metrics key for failed metadata exchanges.
pub const METRICS_ID_FLEET_EXCHANGE_FAILURES: &str = "tpre.fleet.exchange.failures";

/// Describe all metrics used by the fleet.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_FLEET_KNOWN_NODES,
        metrics::Unit::Count,
        "Number of known identities across all shards"
    );

    metrics::describe_gauge!(
        METRICS_ID_FLEET_VERIFIED_NODES,
        metrics::Unit::Count,
        "Number of identities in the verified shard"
    );

    metrics::describe_gauge!(
        METRICS_ID_FLEET_QUARANTINED,
        metrics::Unit::Count,
        "Number of quarantined identities"
    );

    metrics::describe_counter!(
        METRICS_ID_FLEET_ROUNDS,
        metrics::Unit::Count,
        "Number of completed learning rounds"
    );

    metrics::describe_counter!(
        METRICS_ID_FLEET_EXCHANGE_FAILURES,
        metrics::Unit::Count,
        "Number of failed node-metadata exchanges"
    );
}
