//! End-to-end exercises of the protocol engine: several engines on one
//! in-process hub, with a scripted orchestrator arbitrating between them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use fog_node::domain::{CoS, RequestState, ReservationState};
use fog_node::net::memory::{Hub, MemoryWire};
use fog_node::net::{NodeAddr, Wire};
use fog_node::persistence::MemoryStore;
use fog_node::protocol::{Frame, State};
use fog_node::resources::{Executor, Measures, StaticSource};
use fog_node::{Engine, Settings};

const ORCH_IP: &str = "10.0.0.254";
const ORCH_MAC: &str = "02:00:00:00:00:fe";
const CONSUMER_IP: &str = "10.0.0.1";
const CONSUMER_MAC: &str = "02:00:00:00:00:01";
const PROVIDER_IP: &str = "10.0.0.2";
const PROVIDER_MAC: &str = "02:00:00:00:00:02";
const OTHER_PROVIDER_IP: &str = "10.0.0.3";
const OTHER_PROVIDER_MAC: &str = "02:00:00:00:00:03";

/// The class used by the scenarios: needs 2 CPUs, 1 GB RAM, 10 GB disk.
const HEAVY_COS: u32 = 2;

fn catalogue() -> Vec<CoS> {
    vec![
        CoS::best_effort(),
        CoS {
            id: HEAVY_COS,
            name: "image-recognition".to_string(),
            min_cpu: 2.0,
            min_ram: 1024.0,
            min_disk: 10.0,
            max_response_time: 1.0,
        },
    ]
}

fn settings(ip: &str, mac: &str, is_resource: bool, cpu: f64) -> Settings {
    Settings {
        node_ip: ip.to_string(),
        node_mac: mac.to_string(),
        orch_ip: ORCH_IP.to_string(),
        orch_mac: ORCH_MAC.to_string(),
        proto_timeout: Duration::from_secs(2),
        proto_retries: 3,
        proto_verbose: false,
        proto_port: 9750,
        is_resource,
        simulator_active: true,
        host_cpu: cpu,
        host_ram: 4096.0,
        host_disk: 100.0,
        threshold: 0.0,
        limit: 1.0,
        monitor_period: Duration::from_secs(1),
        exec_min: 0.0,
        exec_max: 0.0,
    }
}

/// Deterministic stand-in for the real executor.
struct FixedExecutor {
    delay: Duration,
}

#[async_trait]
impl Executor for FixedExecutor {
    async fn execute(&self, _payload: &Bytes) -> fog_node::Result<Bytes> {
        tokio::time::sleep(self.delay).await;
        Ok(Bytes::from_static(b"r"))
    }
}

fn start_engine(
    hub: &Arc<Hub>,
    ip: &str,
    mac: &str,
    is_resource: bool,
    cpu: f64,
    exec_delay: Duration,
) -> (Engine, Arc<MemoryStore>) {
    let store = MemoryStore::new();
    let engine = Engine::start(
        settings(ip, mac, is_resource, cpu),
        catalogue(),
        Arc::new(hub.attach(mac, ip)),
        Arc::new(FixedExecutor { delay: exec_delay }),
        store.clone(),
        Arc::new(StaticSource(Measures::default())),
    );
    (engine, store)
}

/// Scripted orchestrator: always selects the same provider, runs the
/// reservation handshake before naming it, and relays acknowledgements
/// back to the provider with the consumer's addresses stamped in.
async fn run_orchestrator(wire: MemoryWire, provider: NodeAddr, direct_host_response: bool) {
    loop {
        let Ok((src, frame)) = wire.recv().await else {
            break;
        };
        match frame.state {
            State::HostRequest => {
                if direct_host_response {
                    let hres = Frame::host_response(
                        &frame.req_id,
                        frame.attempt_no,
                        &provider.mac,
                        &provider.ip,
                    );
                    let _ = wire.send(&src, hres).await;
                } else {
                    let rreq = Frame::reserve_request(
                        &frame.req_id,
                        frame.attempt_no,
                        frame.cos_id,
                        &src.mac,
                        &src.ip,
                    );
                    let _ = wire.send(&provider, rreq).await;
                }
            }
            State::ReserveResponse => {
                let rack = Frame::reserve_ack(
                    &frame.req_id,
                    frame.attempt_no,
                    &frame.src_mac,
                    &frame.src_ip,
                );
                let _ = wire.send(&provider, rack).await;
                let consumer = NodeAddr::new(&frame.src_mac, &frame.src_ip);
                let hres = Frame::host_response(
                    &frame.req_id,
                    frame.attempt_no,
                    &provider.mac,
                    &provider.ip,
                );
                let _ = wire.send(&consumer, hres).await;
            }
            State::DataAck => {
                let target = NodeAddr::new(&frame.host_mac, &frame.host_ip);
                let ack =
                    Frame::data_ack(&frame.req_id, frame.attempt_no, &frame.host_mac, &frame.host_ip)
                        .with_src(&src.mac, &src.ip);
                let _ = wire.send(&target, ack).await;
            }
            State::DataCancel => {
                let target = NodeAddr::new(&frame.host_mac, &frame.host_ip);
                let cancel = Frame::data_cancel(
                    &frame.req_id,
                    frame.attempt_no,
                    &frame.host_mac,
                    &frame.host_ip,
                )
                .with_src(&src.mac, &src.ip);
                let _ = wire.send(&target, cancel).await;
            }
            _ => {}
        }
    }
}

fn spawn_orchestrator(hub: &Arc<Hub>, provider_mac: &str, provider_ip: &str, direct: bool) {
    let wire = hub.attach(ORCH_MAC, ORCH_IP);
    let provider = NodeAddr::new(provider_mac, provider_ip);
    tokio::spawn(run_orchestrator(wire, provider, direct));
}

/// The request id is generated inside the engine; the hub journal is the
/// place the tests can read it back from.
fn first_req_id(hub: &Hub) -> String {
    hub.journal()
        .iter()
        .find(|d| d.state == State::HostRequest)
        .map(|d| d.req_id.clone())
        .expect("no host request routed yet")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Reads frames off a raw endpoint until one matches.
async fn recv_frame(wire: &MemoryWire, want: impl Fn(&Frame) -> bool) -> Frame {
    loop {
        let (_, frame) = wire.recv().await.unwrap();
        if want(&frame) {
            return frame;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn happy_path_delivers_result_and_frees_resources() {
    let hub = Hub::new();
    spawn_orchestrator(&hub, PROVIDER_MAC, PROVIDER_IP, false);
    let (consumer, consumer_store) =
        start_engine(&hub, CONSUMER_IP, CONSUMER_MAC, false, 0.0, Duration::ZERO);
    let (provider, _) =
        start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 4.0, Duration::ZERO);
    let initial = provider.accountant().current();

    let result = consumer.send_request(HEAVY_COS, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(result.as_deref(), Some(b"r".as_ref()));

    settle().await;
    assert_eq!(provider.accountant().current(), initial);
    assert_eq!(hub.delivered(State::DataAck, Some(ORCH_IP)), 1);
    assert_eq!(hub.delivered(State::ReserveRequest, Some(PROVIDER_IP)), 1);

    let req_id = first_req_id(&hub);
    let request = consumer.registry().request(&req_id).unwrap();
    assert_eq!(request.lock().state, RequestState::DataReceived);
    assert_eq!(request.lock().host.as_deref(), Some(PROVIDER_IP));

    let saved = consumer_store.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].state, "DRES");
    assert_eq!(saved[0].result.as_deref(), Some("r"));
    assert_eq!(saved[0].attempts.len(), 1);

    // The terminal reservation lingers for a grace delay, then disappears.
    let key = (CONSUMER_IP.to_string(), req_id);
    assert!(provider.registry().reservation(&key).is_some());
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(provider.registry().reservation(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn exhausted_provider_cancels_reservation() {
    let hub = Hub::new();
    spawn_orchestrator(&hub, PROVIDER_MAC, PROVIDER_IP, false);
    let (consumer, consumer_store) =
        start_engine(&hub, CONSUMER_IP, CONSUMER_MAC, false, 0.0, Duration::ZERO);
    // One CPU on offer; the class needs two, so every reserve fails.
    let (provider, _) = start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 1.0, Duration::ZERO);
    let initial = provider.accountant().current();

    let result = consumer.send_request(HEAVY_COS, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(result, None);

    settle().await;
    assert_eq!(provider.accountant().current(), initial);
    // One host request per outer retry, never more.
    assert_eq!(hub.delivered(State::HostRequest, Some(ORCH_IP)), 3);
    assert!(hub.delivered(State::ReserveCancel, Some(ORCH_IP)) >= 1);
    assert_eq!(hub.delivered(State::DataRequest, None), 0);

    let req_id = first_req_id(&hub);
    let request = consumer.registry().request(&req_id).unwrap();
    assert_eq!(request.lock().state, RequestState::Failed);
    assert_eq!(consumer_store.saved().last().unwrap().state, "FAIL");

    // The reservation never got past the requested state.
    let key = (CONSUMER_IP.to_string(), req_id);
    let reservation = provider.registry().reservation(&key).unwrap();
    assert_eq!(reservation.lock().state, ReservationState::ReserveRequested);
    assert!(reservation.lock().freed);
}

#[tokio::test(start_paused = true)]
async fn lost_data_request_is_retried() {
    let hub = Hub::new();
    spawn_orchestrator(&hub, PROVIDER_MAC, PROVIDER_IP, false);
    let (consumer, _) = start_engine(&hub, CONSUMER_IP, CONSUMER_MAC, false, 0.0, Duration::ZERO);
    let (provider, _) = start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 4.0, Duration::ZERO);
    let initial = provider.accountant().current();

    hub.drop_frames(State::DataRequest, Some(PROVIDER_IP), 1);

    let result = consumer.send_request(HEAVY_COS, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(result.as_deref(), Some(b"r".as_ref()));

    settle().await;
    let journal = hub.journal();
    let dreqs: Vec<_> = journal.iter().filter(|d| d.state == State::DataRequest).collect();
    assert_eq!(dreqs.len(), 2);
    assert!(dreqs.iter().all(|d| d.to == PROVIDER_IP));
    assert_eq!(hub.delivered(State::DataRequest, Some(PROVIDER_IP)), 1);
    assert_eq!(hub.delivered(State::DataResponse, Some(CONSUMER_IP)), 1);
    assert_eq!(hub.delivered(State::DataAck, Some(ORCH_IP)), 1);

    let request = consumer.registry().request(&first_req_id(&hub)).unwrap();
    assert_eq!(request.lock().attempts.len(), 1);
    assert_eq!(provider.accountant().current(), initial);
}

#[tokio::test(start_paused = true)]
async fn late_response_after_failure_is_accepted_and_acked() {
    let hub = Hub::new();
    // The orchestrator names the host directly; the host stays silent, so
    // the consumer exhausts its budgets and fails.
    spawn_orchestrator(&hub, PROVIDER_MAC, PROVIDER_IP, true);
    let (consumer, consumer_store) =
        start_engine(&hub, CONSUMER_IP, CONSUMER_MAC, false, 0.0, Duration::ZERO);
    let provider_wire = hub.attach(PROVIDER_MAC, PROVIDER_IP);

    let result = consumer.send_request(HEAVY_COS, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(result, None);

    let req_id = first_req_id(&hub);
    let request = consumer.registry().request(&req_id).unwrap();
    assert_eq!(request.lock().state, RequestState::Failed);

    // The provider finally answers, long after the consumer gave up.
    let late = Frame::data_response(&req_id, 1, Bytes::from_static(b"late"));
    provider_wire.send(&NodeAddr::new(CONSUMER_MAC, CONSUMER_IP), late).await.unwrap();
    settle().await;

    assert_eq!(request.lock().state, RequestState::DataReceived);
    assert_eq!(request.lock().result.as_deref(), Some(b"late".as_ref()));
    assert_eq!(hub.delivered(State::DataAck, Some(ORCH_IP)), 1);

    // The snapshot written last reflects the terminal that occurred last.
    assert_eq!(consumer_store.saved().last().unwrap().state, "DRES");
}

#[tokio::test(start_paused = true)]
async fn late_response_is_returned_by_the_inflight_call() {
    let hub = Hub::new();
    spawn_orchestrator(&hub, PROVIDER_MAC, PROVIDER_IP, true);
    let (consumer, _) = start_engine(&hub, CONSUMER_IP, CONSUMER_MAC, false, 0.0, Duration::ZERO);
    let provider_wire = hub.attach(PROVIDER_MAC, PROVIDER_IP);

    let consumer = Arc::new(consumer);
    let call = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            consumer.send_request(HEAVY_COS, Bytes::from_static(b"x")).await.unwrap()
        })
    };

    // Let the consumer burn most of its data budget, then answer.
    tokio::time::sleep(Duration::from_secs(9)).await;
    let req_id = first_req_id(&hub);
    let late = Frame::data_response(&req_id, 1, Bytes::from_static(b"late"));
    provider_wire.send(&NodeAddr::new(CONSUMER_MAC, CONSUMER_IP), late).await.unwrap();

    let result = call.await.unwrap();
    assert_eq!(result.as_deref(), Some(b"late".as_ref()));

    settle().await;
    assert_eq!(hub.delivered(State::DataAck, Some(ORCH_IP)), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_response_from_other_host_is_cancelled() {
    let hub = Hub::new();
    spawn_orchestrator(&hub, PROVIDER_MAC, PROVIDER_IP, false);
    let (consumer, _) = start_engine(&hub, CONSUMER_IP, CONSUMER_MAC, false, 0.0, Duration::ZERO);
    let (_provider, _) = start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 4.0, Duration::ZERO);
    let other_wire = hub.attach(OTHER_PROVIDER_MAC, OTHER_PROVIDER_IP);

    let result = consumer.send_request(HEAVY_COS, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(result.as_deref(), Some(b"r".as_ref()));
    settle().await;
    assert_eq!(hub.delivered(State::DataAck, Some(ORCH_IP)), 1);

    // A second host answers the same request later.
    let req_id = first_req_id(&hub);
    let duplicate = Frame::data_response(&req_id, 1, Bytes::from_static(b"other"));
    other_wire.send(&NodeAddr::new(CONSUMER_MAC, CONSUMER_IP), duplicate).await.unwrap();
    settle().await;

    let request = consumer.registry().request(&req_id).unwrap();
    assert_eq!(request.lock().result.as_deref(), Some(b"r".as_ref()));
    assert_eq!(request.lock().host.as_deref(), Some(PROVIDER_IP));
    assert_eq!(hub.delivered(State::DataCancel, Some(ORCH_IP)), 1);
    assert_eq!(hub.delivered(State::DataAck, Some(ORCH_IP)), 1);

    // The cancellation names the offending host.
    let cancel = hub
        .journal()
        .into_iter()
        .find(|d| d.state == State::DataCancel && d.to == ORCH_IP)
        .unwrap();
    assert_eq!(cancel.from, CONSUMER_IP);
}

#[tokio::test(start_paused = true)]
async fn slow_execution_answers_wait_then_delivers() {
    let hub = Hub::new();
    spawn_orchestrator(&hub, PROVIDER_MAC, PROVIDER_IP, false);
    let (consumer, _) = start_engine(&hub, CONSUMER_IP, CONSUMER_MAC, false, 0.0, Duration::ZERO);
    // Execution outlasts one unit timeout, so a repeated data request gets
    // a wait notice instead of silence.
    let (provider, _) =
        start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 4.0, Duration::from_secs(3));
    let initial = provider.accountant().current();

    let result = consumer.send_request(HEAVY_COS, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(result.as_deref(), Some(b"r".as_ref()));

    settle().await;
    assert!(hub.delivered(State::DataWait, Some(CONSUMER_IP)) >= 1);
    assert_eq!(hub.delivered(State::DataAck, Some(ORCH_IP)), 1);
    assert_eq!(provider.accountant().current(), initial);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_reservation_is_cancelled() {
    let hub = Hub::new();
    let orch_wire = hub.attach(ORCH_MAC, ORCH_IP);
    let (provider, _) = start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 4.0, Duration::ZERO);
    let initial = provider.accountant().current();

    // The orchestrator requests a reservation and then goes silent.
    let rreq = Frame::reserve_request("AAAAAAAAAA", 1, HEAVY_COS, CONSUMER_MAC, CONSUMER_IP);
    orch_wire.send(&NodeAddr::new(PROVIDER_MAC, PROVIDER_IP), rreq).await.unwrap();

    tokio::time::sleep(Duration::from_secs(7)).await;
    // Three confirmation attempts, then the reservation is abandoned.
    assert_eq!(hub.delivered(State::ReserveResponse, Some(ORCH_IP)), 3);
    assert_eq!(hub.delivered(State::ReserveCancel, Some(ORCH_IP)), 1);
    assert_eq!(provider.accountant().current(), initial);

    let key = (CONSUMER_IP.to_string(), "AAAAAAAAAA".to_string());
    let reservation = provider.registry().reservation(&key).unwrap();
    assert_eq!(reservation.lock().state, ReservationState::ReserveCancelled);
    assert!(reservation.lock().freed);
}

#[tokio::test(start_paused = true)]
async fn idle_reservation_is_cancelled_then_revived_by_late_request() {
    let hub = Hub::new();
    let orch_wire = hub.attach(ORCH_MAC, ORCH_IP);
    let consumer_wire = hub.attach(CONSUMER_MAC, CONSUMER_IP);
    let (provider, _) = start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 4.0, Duration::ZERO);
    let provider_addr = NodeAddr::new(PROVIDER_MAC, PROVIDER_IP);
    let initial = provider.accountant().current();

    let rreq = Frame::reserve_request("AAAAAAAAAA", 1, HEAVY_COS, CONSUMER_MAC, CONSUMER_IP);
    orch_wire.send(&provider_addr, rreq).await.unwrap();

    // Acknowledge the confirmation, then never send the payload.
    let rres = recv_frame(&orch_wire, |f| f.state == State::ReserveResponse).await;
    let rack = Frame::reserve_ack(&rres.req_id, rres.attempt_no, &rres.src_mac, &rres.src_ip);
    orch_wire.send(&provider_addr, rack).await.unwrap();

    // The idle bound is retries x timeout; the reservation must be freed
    // and the cancellation made visible to the orchestrator.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(hub.delivered(State::ReserveCancel, Some(ORCH_IP)), 1);
    assert_eq!(provider.accountant().current(), initial);
    let key = (CONSUMER_IP.to_string(), "AAAAAAAAAA".to_string());
    assert_eq!(
        provider.registry().reservation(&key).unwrap().lock().state,
        ReservationState::ReserveCancelled
    );

    // The payload arrives late anyway; resources are still available, so
    // the reservation is revived and executed.
    let dreq = Frame::data_request("AAAAAAAAAA", 1, Bytes::from_static(b"x"));
    consumer_wire.send(&provider_addr, dreq).await.unwrap();
    let (_, dres) = consumer_wire.recv().await.unwrap();
    assert_eq!(dres.state, State::DataResponse);
    assert_eq!(dres.data.as_ref(), b"r");

    // Nobody acknowledges the result: the delivery loop exhausts its
    // budget and releases the resources exactly once.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(provider.accountant().current(), initial);
    let reservation = provider.registry().reservation(&key).unwrap();
    assert_eq!(reservation.lock().state, ReservationState::Executed);
    assert!(reservation.lock().freed);
    assert_eq!(hub.delivered(State::DataResponse, Some(CONSUMER_IP)), 3);
}

#[tokio::test(start_paused = true)]
async fn late_request_without_resources_is_data_cancelled() {
    let hub = Hub::new();
    let orch_wire = hub.attach(ORCH_MAC, ORCH_IP);
    let consumer_wire = hub.attach(CONSUMER_MAC, CONSUMER_IP);
    // Capacity for exactly one reservation of the heavy class.
    let (provider, _) = start_engine(&hub, PROVIDER_IP, PROVIDER_MAC, true, 2.0, Duration::ZERO);
    let provider_addr = NodeAddr::new(PROVIDER_MAC, PROVIDER_IP);

    // First reservation is never acknowledged and gets cancelled after the
    // idle bound, freeing the capacity again.
    let rreq_b = Frame::reserve_request("BBBBBBBBBB", 1, HEAVY_COS, CONSUMER_MAC, CONSUMER_IP);
    orch_wire.send(&provider_addr, rreq_b).await.unwrap();
    tokio::time::sleep(Duration::from_secs(7)).await;
    let key_b = (CONSUMER_IP.to_string(), "BBBBBBBBBB".to_string());
    assert_eq!(
        provider.registry().reservation(&key_b).unwrap().lock().state,
        ReservationState::ReserveCancelled
    );

    // A second reservation takes the whole capacity.
    let rreq_a = Frame::reserve_request("AAAAAAAAAA", 1, HEAVY_COS, CONSUMER_MAC, CONSUMER_IP);
    orch_wire.send(&provider_addr, rreq_a).await.unwrap();
    let rres = recv_frame(&orch_wire, |f| {
        f.state == State::ReserveResponse && f.req_id == "AAAAAAAAAA"
    })
    .await;
    let rack = Frame::reserve_ack(&rres.req_id, rres.attempt_no, &rres.src_mac, &rres.src_ip);
    orch_wire.send(&provider_addr, rack).await.unwrap();

    // The payload for the cancelled reservation arrives while nothing is
    // left: the provider declines with a fully addressed cancellation.
    let dreq_b = Frame::data_request("BBBBBBBBBB", 1, Bytes::from_static(b"x"));
    consumer_wire.send(&provider_addr, dreq_b).await.unwrap();
    let (_, cancel) = consumer_wire.recv().await.unwrap();
    assert_eq!(cancel.state, State::DataCancel);
    assert_eq!(cancel.src_ip, CONSUMER_IP);
    assert_eq!(cancel.host_ip, PROVIDER_IP);
    assert_eq!(cancel.host_mac, PROVIDER_MAC);
    assert_eq!(
        provider.registry().reservation(&key_b).unwrap().lock().state,
        ReservationState::DataCancelled
    );
}
