use nebula_common::{ReplicaConnectionStatus, Server, CONTROL_PLANE_CONNECTIONS_READY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClassification {
    pub reason: ReplicaConnectionStatus,
    pub ready: bool,
    pub message: String,
}

/// Classify how many of a server's replicas are connected to the scheduler.
///
/// `declared_replicas` is the server's current status replica count, not the
/// expected count carried by the event. Zero declared replicas is trivially
/// ready. Otherwise the server is ready once every declared replica is
/// connected, or once the configured minimum is.
pub fn classify_connections(
    declared_replicas: i32,
    min_replicas: Option<i32>,
    available: i32,
    expected: i32,
) -> ConnectionClassification {
    let all_connected = available >= declared_replicas;
    let min_connected = min_replicas.is_some_and(|min| available >= min);

    let (reason, ready) = if declared_replicas == 0 {
        (ReplicaConnectionStatus::NoReplicasConnected, true)
    } else if all_connected {
        (ReplicaConnectionStatus::AllReplicasConnected, true)
    } else {
        (ReplicaConnectionStatus::SomeReplicasConnected, min_connected)
    };

    ConnectionClassification {
        reason,
        ready,
        message: format!("{available}/{expected} replicas available"),
    }
}

/// Recompute the connection condition on `server` from scratch.
pub fn apply_connection_condition(server: &mut Server, available: i32, expected: i32) -> ConnectionClassification {
    let c = classify_connections(
        server.status.replicas,
        server.spec.min_replicas,
        available,
        expected,
    );
    server.status.conditions.set(
        CONTROL_PLANE_CONNECTIONS_READY,
        c.ready,
        c.reason.as_str(),
        &c.message,
    );
    c
}
