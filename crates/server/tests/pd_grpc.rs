//! Black-box tests over the gRPC surface: bootstrap, store round-trips,
//! heartbeats, TSO monotonicity across leader transfer, forwarding, and
//! the TSO proxy cap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rk_common::config::{PdConfig, ScheduleConfig};
use rk_server::grpc::{self, v1, PlacementDriverClient};
use rk_server::{PdServer, ServerOptions};
use rk_storage::{KvRef, MemoryKv};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Request;

struct TestMember {
    server: Arc<PdServer>,
    addr: String,
}

async fn start_member(kv: KvRef, overrides: impl FnOnce(&mut PdConfig), options: ServerOptions) -> TestMember {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let mut config = PdConfig {
        cluster_name: "pd".to_string(),
        advertise_addr: addr.clone(),
        leader_lease_ms: 300,
        update_physical_interval_ms: 10,
        ..PdConfig::default()
    };
    overrides(&mut config);
    let schedule = ScheduleConfig {
        schedule_interval_ms: 50,
        ..ScheduleConfig::default()
    };
    let server = PdServer::new(kv, config, schedule, options)
        .await
        .expect("server");
    server.start();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_with_listener(listener).await });
    TestMember { server, addr }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn client_for(addr: &str) -> PlacementDriverClient<Channel> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match PlacementDriverClient::connect(format!("http://{addr}")).await {
            Ok(client) => return client,
            Err(err) => {
                assert!(Instant::now() < deadline, "connect {addr} failed: {err}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

fn header(cluster_id: u64) -> Option<v1::RequestHeader> {
    Some(v1::RequestHeader {
        cluster_id,
        sender_id: 0,
    })
}

fn proto_store(id: u64) -> v1::Store {
    v1::Store {
        id,
        address: format!("127.0.0.1:2016{id}"),
        state: v1::StoreState::Up as i32,
        labels: vec![],
    }
}

fn proto_region(id: u64, start: &[u8], end: &[u8], version: u64, conf_ver: u64, stores: &[u64]) -> v1::Region {
    v1::Region {
        id,
        start_key: start.to_vec(),
        end_key: end.to_vec(),
        epoch: Some(v1::RegionEpoch { version, conf_ver }),
        peers: stores
            .iter()
            .enumerate()
            .map(|(i, store_id)| v1::Peer {
                id: id * 100 + i as u64,
                store_id: *store_id,
                role: v1::PeerRole::Voter as i32,
            })
            .collect(),
    }
}

async fn bootstrap_leader(member: &TestMember) -> (PlacementDriverClient<Channel>, u64) {
    wait_until("leader election", || member.server.election().is_serving()).await;
    wait_until("tso sync", || member.server.oracle().is_initialized()).await;
    let cluster_id = member.server.cluster().cluster_id();
    let mut client = client_for(&member.addr).await;
    let response = client
        .bootstrap(Request::new(v1::BootstrapRequest {
            header: header(cluster_id),
            store: Some(proto_store(1)),
            region: Some(proto_region(2, b"", b"", 1, 1, &[1])),
        }))
        .await
        .expect("bootstrap")
        .into_inner();
    assert!(response.header.unwrap().error.is_none());
    (client, cluster_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_and_store_round_trip() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let member = start_member(kv, |_| {}, ServerOptions::default()).await;
    let (mut client, cluster_id) = bootstrap_leader(&member).await;

    // A second bootstrap reports ALREADY_BOOTSTRAPPED in the header.
    let response = client
        .bootstrap(Request::new(v1::BootstrapRequest {
            header: header(cluster_id),
            store: Some(proto_store(1)),
            region: Some(proto_region(2, b"", b"", 1, 1, &[1])),
        }))
        .await
        .expect("second bootstrap")
        .into_inner();
    let error = response.header.unwrap().error.unwrap();
    assert_eq!(error.r#type, v1::ErrorType::AlreadyBootstrapped as i32);

    let response = client
        .is_bootstrapped(Request::new(v1::IsBootstrappedRequest {
            header: header(cluster_id),
        }))
        .await
        .expect("is bootstrapped")
        .into_inner();
    assert!(response.bootstrapped);

    // Put then get returns the exact record.
    let mut store = proto_store(4);
    store.labels.push(v1::StoreLabel {
        key: "zone".to_string(),
        value: "z1".to_string(),
    });
    client
        .put_store(Request::new(v1::PutStoreRequest {
            header: header(cluster_id),
            store: Some(store.clone()),
        }))
        .await
        .expect("put store");
    let response = client
        .get_store(Request::new(v1::GetStoreRequest {
            header: header(cluster_id),
            store_id: 4,
        }))
        .await
        .expect("get store")
        .into_inner();
    assert_eq!(response.store.unwrap(), store);

    // An unknown store reports STORE/REGION errors in band.
    let response = client
        .get_store(Request::new(v1::GetStoreRequest {
            header: header(cluster_id),
            store_id: 99,
        }))
        .await
        .expect("get missing store")
        .into_inner();
    assert!(response.header.unwrap().error.is_some());

    // Mismatched cluster id is a per-request transport failure.
    let status = client
        .get_store(Request::new(v1::GetStoreRequest {
            header: header(cluster_id + 1),
            store_id: 4,
        }))
        .await
        .expect_err("mismatched cluster id");
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alloc_id_hands_out_increasing_blocks() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let member = start_member(kv, |_| {}, ServerOptions::default()).await;
    let (mut client, cluster_id) = bootstrap_leader(&member).await;

    let first = client
        .alloc_id(Request::new(v1::AllocIdRequest {
            header: header(cluster_id),
            count: 10,
        }))
        .await
        .expect("alloc")
        .into_inner();
    let second = client
        .alloc_id(Request::new(v1::AllocIdRequest {
            header: header(cluster_id),
            count: 10,
        }))
        .await
        .expect("alloc")
        .into_inner();
    assert!(second.id >= first.id + 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tso_stream_is_monotonic_and_rejects_zero_count() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let member = start_member(kv, |_| {}, ServerOptions::default()).await;
    let (mut client, cluster_id) = bootstrap_leader(&member).await;

    let (tx, rx) = mpsc::channel(8);
    let mut responses = client
        .tso(Request::new(ReceiverStream::new(rx)))
        .await
        .expect("tso stream")
        .into_inner();

    let mut prev = 0u64;
    for _ in 0..10 {
        tx.send(v1::TsoRequest {
            header: header(cluster_id),
            count: 3,
        })
        .await
        .expect("send");
        let response = responses.message().await.expect("recv").expect("response");
        let ts = response.timestamp.expect("timestamp");
        let composed = (ts.physical << 18) | ts.logical;
        assert!(composed > prev, "timestamps must strictly increase");
        prev = composed;
    }

    // count = 0 fails the stream with the allocator's message.
    tx.send(v1::TsoRequest {
        header: header(cluster_id),
        count: 0,
    })
    .await
    .expect("send");
    let status = responses.message().await.expect_err("zero count");
    assert!(status.message().contains("tso count should be positive"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leader_transfer_preserves_tso_monotonicity() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let a = start_member(kv.clone(), |_| {}, ServerOptions::default()).await;
    let (mut client_a, cluster_id) = bootstrap_leader(&a).await;
    let b = start_member(kv, |_| {}, ServerOptions::default()).await;

    let ts1 = {
        let (tx, rx) = mpsc::channel(1);
        let mut responses = client_a
            .tso(Request::new(ReceiverStream::new(rx)))
            .await
            .expect("tso stream")
            .into_inner();
        tx.send(v1::TsoRequest {
            header: header(cluster_id),
            count: 1,
        })
        .await
        .expect("send");
        let ts = responses
            .message()
            .await
            .expect("recv")
            .expect("response")
            .timestamp
            .expect("timestamp");
        (ts.physical << 18) | ts.logical
    };

    // Stop the current leader; the stand-by takes over.
    a.server.election().resign().await.expect("resign");
    wait_until("new leader", || b.server.election().is_serving()).await;
    wait_until("new tso sync", || b.server.oracle().is_initialized()).await;

    let mut client_b = client_for(&b.addr).await;
    let (tx, rx) = mpsc::channel(1);
    let mut responses = client_b
        .tso(Request::new(ReceiverStream::new(rx)))
        .await
        .expect("tso stream")
        .into_inner();
    tx.send(v1::TsoRequest {
        header: header(cluster_id),
        count: 1,
    })
    .await
    .expect("send");
    let ts = responses
        .message()
        .await
        .expect("recv")
        .expect("response")
        .timestamp
        .expect("timestamp");
    let ts2 = (ts.physical << 18) | ts.logical;
    assert!(ts2 > ts1, "ts2 {ts2} must exceed ts1 {ts1}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn region_heartbeats_update_the_registry_with_epoch_supersession() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let member = start_member(kv, |_| {}, ServerOptions::default()).await;
    let (mut client, cluster_id) = bootstrap_leader(&member).await;

    let (tx, rx) = mpsc::channel(8);
    let _responses = client
        .region_heartbeat(Request::new(ReceiverStream::new(rx)))
        .await
        .expect("heartbeat stream")
        .into_inner();

    let leader = |region: &v1::Region| region.peers.first().cloned();
    // Region 10 covers ["a", "c") at version 1.
    let r10 = proto_region(10, b"a", b"c", 1, 1, &[1]);
    tx.send(v1::RegionHeartbeatRequest {
        header: header(cluster_id),
        leader: leader(&r10),
        region: Some(r10),
        ..Default::default()
    })
    .await
    .expect("send");

    // An overlapping newer-epoch region supersedes it.
    let r11 = proto_region(11, b"a", b"b", 2, 1, &[1]);
    tx.send(v1::RegionHeartbeatRequest {
        header: header(cluster_id),
        leader: leader(&r11),
        region: Some(r11),
        ..Default::default()
    })
    .await
    .expect("send");

    wait_until("heartbeats applied", || {
        member.server.cluster().basic().get_region(11).is_some()
    })
    .await;

    let response = client
        .scan_regions(Request::new(v1::ScanRegionsRequest {
            header: header(cluster_id),
            start_key: b"a".to_vec(),
            end_key: b"z".to_vec(),
            limit: 0,
        }))
        .await
        .expect("scan")
        .into_inner();
    let ids: Vec<u64> = response
        .regions
        .iter()
        .filter_map(|r| r.region.as_ref().map(|m| m.id))
        .collect();
    assert!(ids.contains(&11));
    assert!(!ids.contains(&10), "superseded region must be gone");

    // Batch-scan boundary behaviors.
    let status = client
        .batch_scan_regions(Request::new(v1::BatchScanRegionsRequest {
            header: header(cluster_id),
            ranges: vec![v1::KeyRange {
                start_key: vec![1],
                end_key: vec![0],
            }],
            limit: 0,
            contain_all_key_range: false,
            need_buckets: false,
        }))
        .await
        .expect("batch scan")
        .into_inner();
    let error = status.header.unwrap().error.unwrap();
    assert!(error.message.contains("start key > end key"));

    let status = client
        .batch_scan_regions(Request::new(v1::BatchScanRegionsRequest {
            header: header(cluster_id),
            ranges: vec![
                v1::KeyRange {
                    start_key: vec![0],
                    end_key: vec![2],
                },
                v1::KeyRange {
                    start_key: vec![1],
                    end_key: vec![3],
                },
            ],
            limit: 0,
            contain_all_key_range: false,
            need_buckets: false,
        }))
        .await
        .expect("batch scan")
        .into_inner();
    let error = status.header.unwrap().error.unwrap();
    assert!(error.message.contains("ranges overlapped"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scatter_region_operator_runs_to_success() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let member = start_member(kv, |_| {}, ServerOptions::default()).await;
    let (mut client, cluster_id) = bootstrap_leader(&member).await;
    for id in [2u64, 3] {
        client
            .put_store(Request::new(v1::PutStoreRequest {
                header: header(cluster_id),
                store: Some(proto_store(id)),
            }))
            .await
            .expect("put store");
    }

    let response = client
        .scatter_region(Request::new(v1::ScatterRegionRequest {
            header: header(cluster_id),
            region_ids: vec![2],
            group: String::new(),
            retry_limit: 5,
            skip_store_limit: false,
        }))
        .await
        .expect("scatter")
        .into_inner();
    assert_eq!(response.finished_percentage, 100);

    let response = client
        .get_operator(Request::new(v1::GetOperatorRequest {
            header: header(cluster_id),
            region_id: 2,
        }))
        .await
        .expect("get operator")
        .into_inner();
    assert_eq!(response.desc, b"scatter-region");
    assert_eq!(response.status, v1::OperatorStatus::Running as i32);

    // Report a heartbeat reflecting the added peer; the operator finishes.
    let op = member
        .server
        .cluster()
        .controller()
        .get_operator(2)
        .expect("live operator");
    let (target_store, peer_id) = match &op.steps[0] {
        rk_schedule::OpStep::AddPeer { store_id, peer_id } => (*store_id, *peer_id),
        other => panic!("unexpected scatter step {other}"),
    };

    let (tx, rx) = mpsc::channel(8);
    let _responses = client
        .region_heartbeat(Request::new(ReceiverStream::new(rx)))
        .await
        .expect("heartbeat stream")
        .into_inner();
    let mut region = proto_region(2, b"", b"", 1, 2, &[1]);
    region.peers.push(v1::Peer {
        id: peer_id,
        store_id: target_store,
        role: v1::PeerRole::Voter as i32,
    });
    tx.send(v1::RegionHeartbeatRequest {
        header: header(cluster_id),
        leader: region.peers.first().cloned(),
        region: Some(region),
        ..Default::default()
    })
    .await
    .expect("send");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = client
            .get_operator(Request::new(v1::GetOperatorRequest {
                header: header(cluster_id),
                region_id: 2,
            }))
            .await
            .expect("get operator")
            .into_inner();
        if response.status == v1::OperatorStatus::Success as i32 {
            assert_eq!(response.desc, b"scatter-region");
            break;
        }
        assert!(Instant::now() < deadline, "operator never succeeded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_forwards_marked_requests_to_the_leader() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let leader = start_member(kv.clone(), |_| {}, ServerOptions::default()).await;
    let (mut leader_client, cluster_id) = bootstrap_leader(&leader).await;
    let follower = start_member(kv, |_| {}, ServerOptions::default()).await;

    let store = proto_store(7);
    leader_client
        .put_store(Request::new(v1::PutStoreRequest {
            header: header(cluster_id),
            store: Some(store.clone()),
        }))
        .await
        .expect("put store");

    // Without the marker the follower rejects leader-only requests.
    let mut follower_client = client_for(&follower.addr).await;
    let status = follower_client
        .get_store(Request::new(v1::GetStoreRequest {
            header: header(cluster_id),
            store_id: 7,
        }))
        .await
        .expect_err("follower without marker");
    assert_eq!(status.code(), tonic::Code::Unavailable);

    // With the marker pointing at the leader the follower proxies and the
    // record matches what the leader serves.
    let mut request = Request::new(v1::GetStoreRequest {
        header: header(cluster_id),
        store_id: 7,
    });
    request.metadata_mut().insert(
        grpc::FORWARDED_HOST_KEY,
        leader.addr.parse().expect("metadata value"),
    );
    let response = follower_client
        .get_store(request)
        .await
        .expect("forwarded get store")
        .into_inner();
    assert_eq!(response.store.unwrap(), store);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tso_proxy_cap_limits_concurrent_streamings() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let leader = start_member(kv.clone(), |_| {}, ServerOptions::default()).await;
    let (_leader_client, cluster_id) = bootstrap_leader(&leader).await;
    let follower = start_member(
        kv,
        |config| config.max_concurrent_tso_proxy_streamings = 1,
        ServerOptions::default(),
    )
    .await;

    let open_proxy_stream = |addr: String, leader_addr: String| async move {
        let mut client = client_for(&addr).await;
        let (tx, rx) = mpsc::channel::<v1::TsoRequest>(4);
        let mut request = Request::new(ReceiverStream::new(rx));
        request.metadata_mut().insert(
            grpc::FORWARDED_HOST_KEY,
            leader_addr.parse().expect("metadata value"),
        );
        (client.tso(request).await, tx)
    };

    // The first proxied stream works end to end.
    let (first, first_tx) =
        open_proxy_stream(follower.addr.clone(), leader.addr.clone()).await;
    let mut first_responses = first.expect("first proxy stream").into_inner();
    first_tx
        .send(v1::TsoRequest {
            header: header(cluster_id),
            count: 1,
        })
        .await
        .expect("send");
    assert!(first_responses
        .message()
        .await
        .expect("first response")
        .is_some());

    // The second concurrent stream is rejected immediately.
    let (second, _second_tx) =
        open_proxy_stream(follower.addr.clone(), leader.addr.clone()).await;
    let status = second.expect_err("second proxy stream must fail");
    assert_eq!(status.code(), tonic::Code::ResourceExhausted);

    // Closing the first stream frees the slot for a third attempt.
    drop(first_tx);
    drop(first_responses);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (third, third_tx) =
            open_proxy_stream(follower.addr.clone(), leader.addr.clone()).await;
        match third {
            Ok(stream) => {
                let mut responses = stream.into_inner();
                third_tx
                    .send(v1::TsoRequest {
                        header: header(cluster_id),
                        count: 1,
                    })
                    .await
                    .expect("send");
                assert!(responses.message().await.expect("third response").is_some());
                break;
            }
            Err(status) => {
                assert_eq!(status.code(), tonic::Code::ResourceExhausted);
                assert!(Instant::now() < deadline, "slot never freed");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_timestamp_round_trip() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let member = start_member(kv, |_| {}, ServerOptions::default()).await;
    let (mut client, cluster_id) = bootstrap_leader(&member).await;

    let response = client
        .set_external_timestamp(Request::new(v1::SetExternalTimestampRequest {
            header: header(cluster_id),
            timestamp: 42,
        }))
        .await
        .expect("set external ts")
        .into_inner();
    assert!(response.header.unwrap().error.is_none());

    let response = client
        .get_external_timestamp(Request::new(v1::GetExternalTimestampRequest {
            header: header(cluster_id),
        }))
        .await
        .expect("get external ts")
        .into_inner();
    assert_eq!(response.timestamp, 42);

    // A timestamp beyond the current TSO is rejected.
    let response = client
        .set_external_timestamp(Request::new(v1::SetExternalTimestampRequest {
            header: header(cluster_id),
            timestamp: u64::MAX,
        }))
        .await
        .expect("set external ts")
        .into_inner();
    assert!(response.header.unwrap().error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_config_store_load_watch() {
    let kv: KvRef = Arc::new(MemoryKv::new());
    let member = start_member(kv, |_| {}, ServerOptions::default()).await;
    let (mut client, cluster_id) = bootstrap_leader(&member).await;

    let mut watch = client
        .watch_global_config(Request::new(v1::WatchGlobalConfigRequest {
            header: header(cluster_id),
            revision: 0,
        }))
        .await
        .expect("watch")
        .into_inner();

    client
        .store_global_config(Request::new(v1::StoreGlobalConfigRequest {
            header: header(cluster_id),
            changes: vec![v1::GlobalConfigItem {
                name: "source_id".to_string(),
                payload: b"7".to_vec(),
                deleted: false,
            }],
        }))
        .await
        .expect("store global config");

    let response = client
        .load_global_config(Request::new(v1::LoadGlobalConfigRequest {
            header: header(cluster_id),
            names: vec!["source_id".to_string(), "missing".to_string()],
        }))
        .await
        .expect("load global config")
        .into_inner();
    assert_eq!(response.items.len(), 2);
    assert_eq!(response.items[0].payload, b"7".to_vec());
    assert!(response.items[1].deleted);

    let event = watch.message().await.expect("watch event").expect("event");
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].name, "source_id");
    assert!(!event.changes[0].deleted);
}
