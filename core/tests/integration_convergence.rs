// Integration test: route convergence over simulated networks
//
// This test verifies that:
// - Every node reaches every other node once probing and tracers settle
// - Forwarding follows the cheapest path
// - Withdrawals re-route around a failed link
// - A foreign gnode stays reachable through a second neighbour inside it
// - A converged network goes quiet (no tracer for an unchanged state)
// - Per-node state stays bounded by levels x group size

use gnodemesh_core::{Nip, RoutingConfig, SimNetwork, Topology};

const NETID: u64 = 0x6e6f6465;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init()
        .ok();
}

fn small_config() -> RoutingConfig {
    RoutingConfig {
        levels: 3,
        group_size: 8,
        probes_per_round: 2,
        ..Default::default()
    }
}

#[test]
fn test_line_converges_along_the_line() {
    init_tracing();
    let mut net = SimNetwork::generate(small_config(), Topology::Line, 6, 10, NETID).unwrap();
    assert!(net.run_until_quiet(2, 20).is_some());
    assert!(net.fully_connected());

    assert_eq!(net.path(0, 5), Some(vec![0, 1, 2, 3, 4, 5]));
    assert_eq!(net.path(4, 1), Some(vec![4, 3, 2, 1]));

    let route = net.node(0).route_to(net.node(5).nip()).unwrap();
    assert_eq!(route.hops, 5);
    assert_eq!(route.rem().rtt_ms, 50.0);
}

#[test]
fn test_hierarchical_line_spans_several_gnodes() {
    init_tracing();
    // 40 nodes in 5 level-1 gnodes of 8
    let mut net = SimNetwork::generate(small_config(), Topology::Line, 40, 4, NETID).unwrap();
    assert!(net.run_until_quiet(2, 30).is_some());

    for (a, b) in [(0, 39), (39, 0), (7, 8), (12, 27), (33, 1)] {
        let path = net.path(a, b).unwrap();
        assert_eq!(path.len(), a.abs_diff(b) + 1, "path {} -> {}", a, b);
    }

    // Node 0 knows its own gnode in detail and the other gnodes as a whole
    let routes = net.node(0).routes();
    assert_eq!(routes.best_routes().iter().filter(|(l, _, _)| *l == 0).count(), 7);
    assert_eq!(routes.best_routes().iter().filter(|(l, _, _)| *l == 1).count(), 4);
    for node in net.nodes() {
        assert!(node.routes().reachable_count() <= 3 * 8);
    }
}

#[test]
fn test_best_route_prefers_cheaper_neighbour_and_falls_back() {
    init_tracing();
    let mut net = SimNetwork::new(small_config()).unwrap();
    let a = net.add_node(Nip::new(vec![1, 0, 0]), NETID).unwrap();
    let b = net.add_node(Nip::new(vec![2, 0, 0]), NETID).unwrap();
    let c = net.add_node(Nip::new(vec![3, 0, 0]), NETID).unwrap();
    let d = net.add_node(Nip::new(vec![4, 0, 0]), NETID).unwrap();
    net.connect(a, b, 10).unwrap();
    net.connect(a, c, 100).unwrap();
    net.connect(b, d, 10).unwrap();
    net.connect(c, d, 10).unwrap();
    net.run_rounds(3);

    let target = net.node(d).nip().clone();
    assert_eq!(&net.node(a).route_to(&target).unwrap().gateway, net.node(b).nip());
    assert_eq!(net.node(a).routes().routes(0, 4).len(), 2);

    net.cut(a, b);
    net.run_rounds(4);
    assert_eq!(&net.node(a).route_to(&target).unwrap().gateway, net.node(c).nip());
    assert_eq!(net.path(a, d), Some(vec![a, c, d]));
}

#[test]
fn test_upper_level_falls_back_to_second_neighbour_in_gnode() {
    init_tracing();
    let config = RoutingConfig {
        levels: 2,
        group_size: 4,
        probes_per_round: 2,
        ..Default::default()
    };
    let mut net = SimNetwork::new(config).unwrap();
    let me = net.add_node(Nip::new(vec![0, 0]), NETID).unwrap();
    let a = net.add_node(Nip::new(vec![1, 1]), NETID).unwrap();
    let b = net.add_node(Nip::new(vec![2, 1]), NETID).unwrap();
    net.connect(me, a, 10).unwrap();
    net.connect(me, b, 100).unwrap();
    net.run_rounds(3);

    // Gnode 1 keeps a single route above level 0
    assert_eq!(&net.node(me).best(1, 1).unwrap().gateway, net.node(a).nip());
    assert_eq!(net.node(me).routes().routes(1, 1).len(), 1);

    net.cut(me, a);
    net.run_rounds(5);
    assert!(net.node(me).neighbours().get(net.node(a).nip()).is_none());
    assert_eq!(&net.node(me).best(1, 1).unwrap().gateway, net.node(b).nip());
    assert!(net.reachable(me, b));
    assert!(net.reachable(b, me));
    assert_eq!(net.path(me, b), Some(vec![me, b]));
}

#[test]
fn test_ring_reroutes_around_cut_link() {
    init_tracing();
    let mut net = SimNetwork::generate(small_config(), Topology::Ring, 6, 10, NETID).unwrap();
    net.run_until_quiet(2, 20).unwrap();
    assert_eq!(net.path(0, 1), Some(vec![0, 1]));

    net.cut(0, 1);
    net.run_rounds(10);
    assert!(net.fully_connected());
    assert_eq!(net.path(0, 1), Some(vec![0, 5, 4, 3, 2, 1]));
    assert_eq!(net.path(1, 0), Some(vec![1, 2, 3, 4, 5, 0]));
}

#[test]
fn test_partitioned_line_withdraws_and_recovers() {
    init_tracing();
    let mut net = SimNetwork::generate(small_config(), Topology::Line, 4, 10, NETID).unwrap();
    net.run_until_quiet(2, 20).unwrap();

    net.cut(1, 2);
    net.run_rounds(5);
    assert!(!net.reachable(0, 3));
    assert!(!net.reachable(3, 0));
    assert!(net.reachable(0, 1));
    assert!(net.node(0).route_to(net.node(2).nip()).is_none());

    net.restore(1, 2);
    net.run_rounds(2);
    assert!(net.fully_connected());
}

#[test]
fn test_converged_network_is_a_fixpoint() {
    init_tracing();
    let mut net = SimNetwork::generate(small_config(), Topology::Ring, 7, 10, NETID).unwrap();
    net.run_until_quiet(2, 20).unwrap();

    let before = net.stats();
    net.run_rounds(3);
    let after = net.stats();
    assert_eq!(after.tracers, before.tracers);
    assert_eq!(after.route_changes, before.route_changes);
    assert!(after.frames > before.frames);
}

#[test]
fn test_star_hub_forwards_between_leaves() {
    init_tracing();
    let mut net = SimNetwork::generate(small_config(), Topology::Star, 6, 10, NETID).unwrap();
    net.run_until_quiet(2, 20).unwrap();
    assert!(net.fully_connected());
    assert_eq!(net.path(3, 5), Some(vec![3, 0, 5]));
}
