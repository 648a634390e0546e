mod common;

use std::time::Duration;

use ccmatrix::config::TopologyReuse;
use ccmatrix::dataset::{read_segment, SegmentLayout, RAW_LOG_FILE};
use ccmatrix::descriptor::ToolMode;
use ccmatrix::shutdown::ShutdownFlag;
use ccmatrix::{Controller, Outcome, StopReason};
use common::{test_config, FakeTestbed, Script};

#[test]
fn matrix_is_complete_despite_failing_cells() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &["reno", "cubic", "hybla"], &["ipv4", "ipv6"], 2);
    let testbed = FakeTestbed::new(Script {
        fail_provision: vec![3],
        ..Default::default()
    });

    let report = Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    assert_eq!(report.planned, 12);
    assert_eq!(report.attempted, 12);
    assert_eq!(report.ok, 7);
    assert_eq!(report.failed, 5);
    assert_eq!(report.unpersisted, 0);
    assert_eq!(report.stopped, None);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.segments.len(), 6);

    let mut rows = 0;
    for algo in ["reno", "cubic", "hybla"] {
        for proto in ["ipv4", "ipv6"] {
            let segment = read_segment(&dir.path().join(format!("dataset_{proto}_{algo}.csv"))).unwrap();
            assert_eq!(segment.len(), 2, "{algo}/{proto}");
            assert_eq!(segment.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
            rows += segment.len();
        }
    }
    assert_eq!(rows, 12);

    let hybla = read_segment(&dir.path().join("dataset_ipv6_hybla.csv")).unwrap();
    assert!(hybla.iter().all(|r| r.outcome == Outcome::ConfigureFailed));
    assert!(hybla[0].note.contains("`hybla` is not supported"));

    let reno_v6 = read_segment(&dir.path().join("dataset_ipv6_reno.csv")).unwrap();
    assert_eq!(reno_v6[0].outcome, Outcome::ProvisionFailed);
    assert_eq!(reno_v6[0].ip_version, "IPv6");
    assert_eq!(reno_v6[1].outcome, Outcome::Ok);

    let events = testbed.events();
    assert_eq!(events.provisioned, 11);
    assert_eq!(events.teardowns, events.provisioned);
    assert_eq!(events.max_live, 1);
    assert_eq!(events.stopped, events.spawned.len());
}

#[test]
fn rows_follow_enumeration_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["bbr", "vegas"], &["ipv4"], 3);
    config.segment_layout = SegmentLayout::Protocol;
    let testbed = FakeTestbed::new(Script::default());

    Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    let rows = read_segment(&dir.path().join("results_ipv4.csv")).unwrap();
    let keys: Vec<(&str, u32)> = rows.iter().map(|r| (r.algorithm.as_str(), r.id)).collect();
    assert_eq!(
        keys,
        vec![("bbr", 1), ("bbr", 2), ("bbr", 3), ("vegas", 1), ("vegas", 2), ("vegas", 3)]
    );
}

#[test]
fn structured_scenario_reaches_the_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["cubic"], &["ipv4"], 1);
    config.traffic.settle_delay = Duration::from_millis(20);
    let testbed = FakeTestbed::new(Script::default());

    let report = Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();
    assert_eq!(report.ok, 1);

    let rows = read_segment(&dir.path().join("dataset_ipv4_cubic.csv")).unwrap();
    let r = &rows[0];
    assert_eq!(r.throughput_gbps, 5.0);
    assert_eq!(r.retransmits, 2);
    assert_eq!(r.total_packets_sent, 684.93);
    assert_eq!(r.packet_loss_pct, 0.29);
    assert_eq!(r.bandwidth_efficiency_pct, 5.0);
    assert_eq!(r.rtt_mean_ms, 2.5);
    assert_eq!(r.rtt_max_ms, 4.0);
    assert_eq!(r.rtt_variance, 1.25);
    assert_eq!(r.max_cwnd_bytes, 64240);
    assert_eq!(r.cpu_sender_pct, 10.5);
    assert_eq!(r.cpu_receiver_pct, 2.25);
    assert_eq!(r.probe_rtt_ms, 200.65);
    assert_eq!(r.probe_jitter_ms, 0.54);
    assert_eq!(r.probe_loss_pct, 0.0);
    assert!(r.recovery_time_s >= 0.02, "recovery {}", r.recovery_time_s);
    assert_eq!(r.outcome, Outcome::Ok);

    let events = testbed.events();
    let set: Vec<_> = events.commands_matching("sysctl -w net.ipv4.tcp_congestion_control=cubic");
    assert_eq!(set.len(), 2, "both hosts");
    assert_eq!(events.commands_matching("ip -4 route replace").len(), 4);
    assert!(events.commands_matching("ip -6").is_empty());
    assert!(events.spawned.iter().any(|s| s.starts_with("h2: iperf3 -s -p 5201")));
    assert!(events.spawned.iter().any(|s| s.starts_with("h1: tcpdump -i h1-eth0")));
    assert_eq!(events.commands_matching("iperf3 -c 10.0.2.2 -p 5201 -t 1 -J").len(), 1);

    let raw = std::fs::read_to_string(dir.path().join(RAW_LOG_FILE)).unwrap();
    assert!(raw.contains("=== cubic/IPv4/#1"));
    assert!(raw.contains("--- traffic (exit Some(0)) ---"));
}

#[test]
fn no_retransmission_marker_means_zero_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &["reno"], &["ipv6"], 1);
    let testbed = FakeTestbed::new(Script {
        query_output: String::new(),
        ..Default::default()
    });

    Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    let rows = read_segment(&dir.path().join("dataset_ipv6_reno.csv")).unwrap();
    assert_eq!(rows[0].recovery_time_s, 0.0);
    assert_eq!(rows[0].outcome, Outcome::Ok);

    let events = testbed.events();
    assert!(!events.commands_matching("ip -6 addr add 2001:db8:0:1::2/64 dev h1-eth0 nodad").is_empty());
    assert_eq!(events.commands_matching("ping -6 -c 3 2001:db8:0:2::2").len(), 1);
}

#[test]
fn exhaustion_stops_the_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &["reno", "cubic"], &["ipv4"], 2);
    let testbed = FakeTestbed::new(Script {
        exhaust_on: Some(2),
        ..Default::default()
    });

    let report = Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    assert_eq!(report.attempted, 2);
    assert!(matches!(report.stopped, Some(StopReason::Exhausted(_))));
    assert_eq!(report.exit_code(), 1);

    let rows = read_segment(&dir.path().join("dataset_ipv4_reno.csv")).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].outcome, Outcome::ProvisionFailed);
    assert!(rows[1].note.starts_with("exhausted: "));
    assert!(!dir.path().join("dataset_ipv4_cubic.csv").exists());

    let events = testbed.events();
    assert_eq!(events.provision_attempts, 2);
    assert_eq!(events.teardowns, 1);
}

#[test]
fn interruption_tears_down_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &["reno"], &["ipv4", "ipv6"], 2);
    let shutdown = ShutdownFlag::new();
    let testbed = FakeTestbed::new(Script {
        interrupt: Some(shutdown.clone()),
        ..Default::default()
    });

    let report = Controller::new(&config, &testbed, shutdown)
        .unwrap()
        .run();

    assert_eq!(report.attempted, 1);
    assert_eq!(report.stopped, Some(StopReason::Interrupted));
    assert_eq!(report.exit_code(), 130);

    let rows = read_segment(&dir.path().join("dataset_ipv4_reno.csv")).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, Outcome::MeasureFailed);
    assert!(rows[0].note.contains("interrupted"));

    let events = testbed.events();
    assert_eq!(events.teardowns, 1);
    assert_eq!(events.stopped, events.spawned.len());
}

#[test]
fn shared_topology_is_provisioned_once_and_restored() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["reno", "bbr"], &["ipv4"], 2);
    config.topology.reuse = TopologyReuse::Matrix;
    let testbed = FakeTestbed::new(Script::default());

    let report = Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    assert_eq!(report.ok, 4);
    let events = testbed.events();
    assert_eq!(events.provisioned, 1);
    assert_eq!(events.teardowns, 1);
    // Each cell puts both hosts back on the original algorithm.
    assert_eq!(
        events
            .commands_matching("sysctl -w net.ipv4.tcp_congestion_control=cubic")
            .len(),
        8
    );
    assert_eq!(
        events
            .commands_matching("sysctl -w net.ipv4.tcp_congestion_control=bbr")
            .len(),
        4
    );
}

#[test]
fn sink_that_never_listens_fails_the_cell_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["veno"], &["ipv4"], 1);
    config.traffic.retries = 1;
    let testbed = FakeTestbed::new(Script {
        sink_never_ready: true,
        ..Default::default()
    });

    let report = Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    assert_eq!(report.failed, 1);
    let rows = read_segment(&dir.path().join("dataset_ipv4_veno.csv")).unwrap();
    assert_eq!(rows[0].outcome, Outcome::MeasureFailed);
    assert!(rows[0].note.starts_with("timing: "));
    assert!(rows[0].note.contains("not listening on port 5201"));

    let events = testbed.events();
    let sinks = events.spawned.iter().filter(|s| s.contains("iperf3 -s")).count();
    assert_eq!(sinks, 2);
    assert_eq!(events.client_runs, 0);
    assert_eq!(events.stopped, events.spawned.len());
}

#[test]
fn refused_connection_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["westwood"], &["ipv4"], 1);
    config.traffic.retries = 1;
    let testbed = FakeTestbed::new(Script {
        connect_failures: 1,
        ..Default::default()
    });

    let report = Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    assert_eq!(report.ok, 1);
    assert_eq!(testbed.events().client_runs, 2);
}

#[test]
fn refused_connection_without_retries_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &["westwood"], &["ipv4"], 1);
    let testbed = FakeTestbed::new(Script {
        connect_failures: 1,
        ..Default::default()
    });

    let report = Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    assert_eq!(report.failed, 1);
    let rows = read_segment(&dir.path().join("dataset_ipv4_westwood.csv")).unwrap();
    assert!(rows[0].note.contains("could not connect"));
}

#[test]
fn text_mode_uses_probe_for_rtt_and_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["cubic"], &["ipv4"], 1);
    config.traffic.tool = ToolMode::IperfText;
    config.traffic.capacity_bps = 100e6;
    let testbed = FakeTestbed::new(Script {
        traffic_output: "[  3]  0.0-10.0 sec  60.0 MBytes  50.0 Mbits/sec\n".into(),
        probe_output: "rtt min/avg/max/mdev = 1.0/2.5/4.0/0.8 ms, 10% packet loss".into(),
        ..Default::default()
    });

    Controller::new(&config, &testbed, ShutdownFlag::new())
        .unwrap()
        .run();

    let rows = read_segment(&dir.path().join("dataset_ipv4_cubic.csv")).unwrap();
    let r = &rows[0];
    assert_eq!(r.throughput_gbps, 0.05);
    assert_eq!(r.bandwidth_efficiency_pct, 50.0);
    assert_eq!(r.rtt_mean_ms, 2.5);
    assert_eq!(r.rtt_max_ms, 4.0);
    assert_eq!(r.packet_loss_pct, 10.0);
    assert_eq!(r.probe_loss_pct, 10.0);
    assert_eq!(r.outcome, Outcome::Ok);

    let events = testbed.events();
    assert!(events.spawned.iter().any(|s| s.starts_with("h2: iperf -s -p 5201")));
    assert_eq!(events.commands_matching("iperf -c 10.0.2.2").len(), 1);
}
