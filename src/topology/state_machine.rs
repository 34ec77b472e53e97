//! Server discovery rules applied to a topology description.

use super::description::{ServerDescription, ServerType, TopologyDescription, TopologyType};

/// Applies one server observation to a topology description.
///
/// Called with a private copy of the current description; the tracker
/// publishes the result.
pub trait TopologyStateMachine: Send + Sync + std::fmt::Debug {
    fn on_server_description(&self, topology: &mut TopologyDescription, server: ServerDescription);
}

/// Server discovery state machine for unknown, single, sharded and replica
/// set deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscoveryStateMachine;

impl DiscoveryStateMachine {
    pub fn new() -> Self {
        Self
    }
}

impl TopologyStateMachine for DiscoveryStateMachine {
    fn on_server_description(&self, topology: &mut TopologyDescription, server: ServerDescription) {
        // Servers dropped from the topology are no longer monitored.
        if !topology.servers.contains_key(&server.address) {
            tracing::debug!(address = %server.address, "Ignoring description of removed server");
            return;
        }

        let from = topology.topology_type;
        match from {
            TopologyType::Single => install(topology, server),
            TopologyType::Unknown => update_unknown(topology, server),
            TopologyType::Sharded => update_sharded(topology, server),
            TopologyType::ReplicaSetNoPrimary => update_rs_no_primary(topology, server),
            TopologyType::ReplicaSetWithPrimary => update_rs_with_primary(topology, server),
        }

        if topology.topology_type != from {
            tracing::info!(
                from = %from,
                to = %topology.topology_type,
                "Topology type changed"
            );
        }
    }
}

fn install(topology: &mut TopologyDescription, server: ServerDescription) {
    topology.servers.insert(server.address.clone(), server);
}

fn remove(topology: &mut TopologyDescription, address: &str) {
    if topology.servers.remove(address).is_some() {
        tracing::debug!(address = address, "Removed server from topology");
    }
}

fn update_unknown(topology: &mut TopologyDescription, server: ServerDescription) {
    match server.server_type {
        ServerType::Unknown | ServerType::RsGhost => install(topology, server),
        ServerType::Standalone => {
            if topology.seed_count == 1 {
                topology.topology_type = TopologyType::Single;
                install(topology, server);
            } else {
                remove(topology, &server.address);
            }
        }
        ServerType::Mongos => {
            topology.topology_type = TopologyType::Sharded;
            install(topology, server);
        }
        ServerType::RsPrimary => {
            topology.topology_type = TopologyType::ReplicaSetWithPrimary;
            update_rs_from_primary(topology, server);
        }
        ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
            topology.topology_type = TopologyType::ReplicaSetNoPrimary;
            update_rs_without_primary(topology, server);
        }
    }
}

fn update_sharded(topology: &mut TopologyDescription, server: ServerDescription) {
    match server.server_type {
        ServerType::Unknown | ServerType::Mongos => install(topology, server),
        _ => remove(topology, &server.address),
    }
}

fn update_rs_no_primary(topology: &mut TopologyDescription, server: ServerDescription) {
    match server.server_type {
        ServerType::Unknown | ServerType::RsGhost => install(topology, server),
        ServerType::Standalone | ServerType::Mongos => remove(topology, &server.address),
        ServerType::RsPrimary => {
            topology.topology_type = TopologyType::ReplicaSetWithPrimary;
            update_rs_from_primary(topology, server);
        }
        ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
            update_rs_without_primary(topology, server);
        }
    }
}

fn update_rs_with_primary(topology: &mut TopologyDescription, server: ServerDescription) {
    match server.server_type {
        ServerType::Unknown | ServerType::RsGhost => {
            install(topology, server);
            check_if_has_primary(topology);
        }
        ServerType::Standalone | ServerType::Mongos => {
            remove(topology, &server.address);
            check_if_has_primary(topology);
        }
        ServerType::RsPrimary => update_rs_from_primary(topology, server),
        ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
            update_rs_with_primary_from_member(topology, server);
        }
    }
}

/// Whether the member's set name disagrees with the topology's. Adopts the
/// member's name when the topology has none yet.
fn set_name_mismatch(topology: &mut TopologyDescription, server: &ServerDescription) -> bool {
    match (&topology.set_name, &server.set_name) {
        (None, name) => {
            topology.set_name = name.clone();
            false
        }
        (Some(expected), Some(name)) => expected != name,
        (Some(_), None) => true,
    }
}

fn me_mismatch(server: &ServerDescription) -> bool {
    matches!(&server.me, Some(me) if *me != server.address)
}

fn add_unknown_hosts(topology: &mut TopologyDescription, hosts: &[String]) {
    for host in hosts {
        if !topology.servers.contains_key(host) {
            tracing::debug!(address = %host, "Discovered new server");
            topology
                .servers
                .insert(host.clone(), ServerDescription::unknown(host.clone()));
        }
    }
}

fn update_rs_without_primary(topology: &mut TopologyDescription, server: ServerDescription) {
    if set_name_mismatch(topology, &server) {
        tracing::warn!(address = %server.address, set_name = ?server.set_name, "Replica set name mismatch");
        remove(topology, &server.address);
        return;
    }
    add_unknown_hosts(topology, &server.hosts);
    if me_mismatch(&server) {
        remove(topology, &server.address);
        return;
    }
    install(topology, server);
}

fn update_rs_with_primary_from_member(
    topology: &mut TopologyDescription,
    server: ServerDescription,
) {
    if set_name_mismatch(topology, &server) || me_mismatch(&server) {
        remove(topology, &server.address);
    } else {
        install(topology, server);
    }
    check_if_has_primary(topology);
}

fn update_rs_from_primary(topology: &mut TopologyDescription, server: ServerDescription) {
    if set_name_mismatch(topology, &server) {
        tracing::warn!(address = %server.address, set_name = ?server.set_name, "Primary from another replica set");
        remove(topology, &server.address);
        check_if_has_primary(topology);
        return;
    }

    if let (Some(set_version), Some(election_id)) = (server.set_version, server.election_id) {
        if let (Some(max_version), Some(max_election)) =
            (topology.max_set_version, topology.max_election_id)
        {
            if (max_version, max_election) > (set_version, election_id) {
                tracing::warn!(
                    address = %server.address,
                    set_version = set_version,
                    election_id = election_id,
                    "Marking stale primary as unknown"
                );
                install(topology, ServerDescription::unknown(server.address.clone()));
                check_if_has_primary(topology);
                return;
            }
        }
        topology.max_election_id = Some(election_id);
    }

    if let Some(set_version) = server.set_version {
        if topology.max_set_version.map_or(true, |max| set_version > max) {
            topology.max_set_version = Some(set_version);
        }
    }

    // Any other primary is now stale.
    let demoted: Vec<String> = topology
        .servers
        .values()
        .filter(|s| s.server_type == ServerType::RsPrimary && s.address != server.address)
        .map(|s| s.address.clone())
        .collect();
    for address in demoted {
        install(topology, ServerDescription::unknown(address));
    }

    add_unknown_hosts(topology, &server.hosts);
    let hosts = server.hosts.clone();
    install(topology, server);
    topology.servers.retain(|address, _| hosts.contains(address));

    check_if_has_primary(topology);
}

fn check_if_has_primary(topology: &mut TopologyDescription) {
    topology.topology_type = if topology.primary().is_some() {
        TopologyType::ReplicaSetWithPrimary
    } else {
        TopologyType::ReplicaSetNoPrimary
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;

    const LOCAL: &str = "localhost:123";
    const LOCAL2: &str = "localhost:456";
    const SET: &str = "replica_set";

    fn two_seeds() -> TopologyConfig {
        TopologyConfig::new(vec![LOCAL.into(), LOCAL2.into()])
    }

    fn two_seeds_rs() -> TopologyConfig {
        two_seeds().with_set_name(SET)
    }

    fn apply(topology: &mut TopologyDescription, server: ServerDescription) {
        DiscoveryStateMachine::new().on_server_description(topology, server);
    }

    /// Start in `starting`, observe one server of type `incoming` at LOCAL.
    fn transition(starting: TopologyType, incoming: ServerType) -> TopologyType {
        let mut topology = TopologyDescription::new(&two_seeds());
        topology.set_topology_type(starting);

        let mut server = ServerDescription::new(LOCAL, incoming).with_hosts([LOCAL, LOCAL2]);
        if matches!(
            incoming,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther
        ) {
            server = server.with_set_name(SET);
        }
        apply(&mut topology, server);
        topology.topology_type()
    }

    #[test]
    fn test_single_topology_installs_directly() {
        let config = TopologyConfig::new(vec![LOCAL.into()]).with_direct_connection(true);
        let mut topology = TopologyDescription::new(&config);
        let server = ServerDescription::new(LOCAL, ServerType::Standalone).with_me("foo:1234");

        apply(&mut topology, server.clone());
        assert_eq!(topology.len(), 1);
        assert_eq!(topology.server(LOCAL), Some(&server));
        assert_eq!(topology.topology_type(), TopologyType::Single);
    }

    #[test]
    fn test_topology_type_unchanged() {
        use ServerType::*;
        use TopologyType::*;

        let mut cases = vec![
            (TopologyType::Unknown, ServerType::Unknown, TopologyType::Unknown),
            (TopologyType::Unknown, Standalone, TopologyType::Unknown),
            (TopologyType::Unknown, RsGhost, TopologyType::Unknown),
            (ReplicaSetNoPrimary, ServerType::Unknown, ReplicaSetNoPrimary),
        ];
        for server_type in ServerType::all() {
            cases.push((Sharded, server_type, Sharded));
            if server_type != RsPrimary {
                cases.push((ReplicaSetNoPrimary, server_type, ReplicaSetNoPrimary));
            }
        }

        for (starting, incoming, ending) in cases {
            assert_eq!(
                transition(starting, incoming),
                ending,
                "starting {} incoming {}",
                starting,
                incoming
            );
        }
    }

    #[test]
    fn test_topology_type_changes() {
        use ServerType::*;
        use TopologyType::*;

        let cases = [
            (TopologyType::Unknown, Mongos, Sharded),
            (TopologyType::Unknown, RsPrimary, ReplicaSetWithPrimary),
            (TopologyType::Unknown, RsSecondary, ReplicaSetNoPrimary),
            (TopologyType::Unknown, RsArbiter, ReplicaSetNoPrimary),
            (TopologyType::Unknown, RsOther, ReplicaSetNoPrimary),
            (ReplicaSetNoPrimary, RsPrimary, ReplicaSetWithPrimary),
            (ReplicaSetWithPrimary, ServerType::Unknown, ReplicaSetNoPrimary),
            (ReplicaSetWithPrimary, Standalone, ReplicaSetNoPrimary),
            (ReplicaSetWithPrimary, Mongos, ReplicaSetNoPrimary),
            (ReplicaSetWithPrimary, RsPrimary, ReplicaSetWithPrimary),
            (ReplicaSetWithPrimary, RsSecondary, ReplicaSetNoPrimary),
            (ReplicaSetWithPrimary, RsOther, ReplicaSetNoPrimary),
            (ReplicaSetWithPrimary, RsArbiter, ReplicaSetNoPrimary),
            (ReplicaSetWithPrimary, RsGhost, ReplicaSetNoPrimary),
        ];

        for (starting, incoming, ending) in cases {
            assert_eq!(
                transition(starting, incoming),
                ending,
                "starting {} incoming {}",
                starting,
                incoming
            );
        }
    }

    #[test]
    fn test_standalone_with_single_seed_becomes_single() {
        let mut topology = TopologyDescription::new(&TopologyConfig::new(vec![LOCAL.into()]));
        apply(&mut topology, ServerDescription::new(LOCAL, ServerType::Standalone));
        assert_eq!(topology.topology_type(), TopologyType::Single);
    }

    #[test]
    fn test_primary_removes_unlisted_servers() {
        let mut topology = TopologyDescription::new(&two_seeds());
        let primary = ServerDescription::new(LOCAL, ServerType::RsPrimary).with_host(LOCAL);

        assert_eq!(topology.len(), 2);
        apply(&mut topology, primary.clone());
        assert_eq!(topology.len(), 1);
        assert_eq!(topology.servers().next(), Some(&primary));
    }

    #[test]
    fn test_primary_adds_new_hosts_as_unknown() {
        let mut topology = TopologyDescription::new(&two_seeds());
        let primary = ServerDescription::new(LOCAL, ServerType::RsPrimary)
            .with_hosts([LOCAL, LOCAL2, "newhost:123"]);

        apply(&mut topology, primary);
        assert_eq!(topology.len(), 3);
        let new_host = topology.server("newhost:123").unwrap();
        assert_eq!(new_host.server_type, ServerType::Unknown);
    }

    #[test]
    fn test_member_without_me_is_kept() {
        let mut topology = TopologyDescription::new(&two_seeds_rs());
        let before = topology.addresses();
        apply(
            &mut topology,
            ServerDescription::new(LOCAL, ServerType::RsSecondary).with_set_name(SET),
        );
        assert_eq!(topology.addresses(), before);

        let primary = ServerDescription::new(LOCAL2, ServerType::RsPrimary)
            .with_me(LOCAL2)
            .with_hosts([LOCAL2, LOCAL])
            .with_set_name(SET);
        apply(&mut topology, primary);
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);

        apply(
            &mut topology,
            ServerDescription::new(LOCAL, ServerType::RsSecondary).with_set_name(SET),
        );
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.addresses(), before);
    }

    #[test]
    fn test_member_with_wrong_me_is_removed() {
        let mut topology = TopologyDescription::new(&two_seeds_rs());
        apply(
            &mut topology,
            ServerDescription::new(LOCAL, ServerType::RsSecondary)
                .with_set_name(SET)
                .with_me(format!("foo{}", LOCAL)),
        );
        assert_eq!(topology.addresses(), vec![LOCAL2]);
    }

    #[test]
    fn test_member_of_other_set_is_removed() {
        let mut topology = TopologyDescription::new(&two_seeds_rs());
        apply(
            &mut topology,
            ServerDescription::new(LOCAL, ServerType::RsSecondary).with_set_name("other"),
        );
        assert_eq!(topology.addresses(), vec![LOCAL2]);
        assert_eq!(topology.set_name(), Some(SET));
    }

    #[test]
    fn test_tracks_max_set_version_and_election_id() {
        let mut topology = TopologyDescription::new(&two_seeds());
        let primary = |set_version, election_id| {
            ServerDescription::new(LOCAL, ServerType::RsPrimary)
                .with_me(LOCAL)
                .with_host(LOCAL)
                .with_set_version(set_version)
                .with_election_id(election_id)
        };

        apply(&mut topology, primary(100, 1));
        assert_eq!(topology.max_set_version(), Some(100));
        assert_eq!(topology.max_election_id(), Some(1));

        apply(&mut topology, primary(200, 2));
        assert_eq!(topology.max_set_version(), Some(200));
        assert_eq!(topology.max_election_id(), Some(2));
    }

    #[test]
    fn test_stale_primary_marked_unknown() {
        let fresh = LOCAL;
        let stale = LOCAL2;
        let mut topology = TopologyDescription::new(&two_seeds_rs());

        apply(
            &mut topology,
            ServerDescription::new(fresh, ServerType::RsPrimary)
                .with_set_name(SET)
                .with_me(fresh)
                .with_hosts([fresh, stale])
                .with_set_version(1)
                .with_election_id(2),
        );
        apply(
            &mut topology,
            ServerDescription::new(stale, ServerType::RsSecondary).with_set_name(SET),
        );
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(
            topology.server(stale).unwrap().server_type,
            ServerType::RsSecondary
        );

        apply(
            &mut topology,
            ServerDescription::new(stale, ServerType::RsPrimary)
                .with_set_name(SET)
                .with_me(stale)
                .with_hosts([stale, fresh])
                .with_set_version(1)
                .with_election_id(1),
        );

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.primary().unwrap().address, fresh);
        assert_eq!(
            topology.server(stale).unwrap().server_type,
            ServerType::Unknown
        );
    }

    #[test]
    fn test_new_primary_demotes_old_one() {
        let mut topology = TopologyDescription::new(&two_seeds_rs());
        for (address, election_id) in [(LOCAL, 1), (LOCAL2, 2)] {
            apply(
                &mut topology,
                ServerDescription::new(address, ServerType::RsPrimary)
                    .with_set_name(SET)
                    .with_hosts([LOCAL, LOCAL2])
                    .with_set_version(1)
                    .with_election_id(election_id),
            );
        }
        assert_eq!(topology.primary().unwrap().address, LOCAL2);
        assert_eq!(
            topology.server(LOCAL).unwrap().server_type,
            ServerType::Unknown
        );
    }

    #[test]
    fn test_removed_server_is_ignored() {
        let mut topology = TopologyDescription::new(&two_seeds());
        apply(&mut topology, ServerDescription::new("elsewhere:1", ServerType::Mongos));
        assert_eq!(topology.topology_type(), TopologyType::Unknown);
        assert!(topology.server("elsewhere:1").is_none());
    }
}
