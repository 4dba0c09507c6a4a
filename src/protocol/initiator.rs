use std::sync::Arc;

use bytes::Bytes;
use log::info;

use crate::domain::Request;
use crate::engine::EngineInner;
use crate::error::{Error, Result};
use crate::net::NodeAddr;
use crate::protocol::frame::{Frame, State};
use crate::protocol::registry::gen_req_id;

/// Finds a host for a payload of the given class, exchanges data with it
/// and acknowledges the result toward the orchestrator.
///
/// Two nested retry loops drive the consumer machine: the outer one asks
/// the orchestrator for a host, the inner one exchanges data with the host
/// it named. A response may also land through the listener while this
/// function is between sends, so the accepted-result flag is re-checked at
/// every turn; once set, nothing here mutates the request again.
pub(crate) async fn send_request(
    inner: Arc<EngineInner>,
    cos_id: u32,
    data: Bytes,
) -> Result<Option<Bytes>> {
    let cos = inner.cos_by_id(cos_id).ok_or(Error::UnknownCos(cos_id))?;
    let req_id = gen_req_id();
    let entry = inner
        .registry
        .insert_request(Request::new(req_id.clone(), Arc::clone(&cos), data.clone()));

    let timeout = inner.settings.proto_timeout;
    let retries = inner.settings.proto_retries;
    let orch = inner.orch_addr();

    let mut hreq_budget = retries;
    while hreq_budget > 0 && !entry.has_result() {
        hreq_budget -= 1;
        let attempt_no = entry.lock().begin_attempt();
        info!("Send host request to orchestrator");
        let hreq = Frame::host_request(&req_id, attempt_no, cos.id);
        let Some((_, hres)) = inner.exchange(&orch, hreq, inner.settings.host_wait()).await else {
            if !entry.has_result() {
                info!("No hosts");
            }
            continue;
        };
        if entry.has_result() {
            break;
        }
        let host = NodeAddr::new(&hres.host_mac, &hres.host_ip);
        entry.lock().record_host(attempt_no, &host.ip);
        info!("Recv host response from orchestrator: {}", host.ip);

        let mut dreq_budget = retries;
        while dreq_budget > 0 && !entry.has_result() {
            dreq_budget -= 1;
            info!("Send data exchange request to {}", host.ip);
            let dreq = Frame::data_request(&req_id, attempt_no, data.clone());
            let Some((src, reply)) = inner.exchange(&host, dreq, timeout).await else {
                if !entry.has_result() {
                    info!("No data");
                }
                continue;
            };
            match reply.state {
                State::DataWait => {
                    // The host is still executing: start the data budget
                    // over and give it one more unit wait.
                    info!("{} still executing", req_id);
                    dreq_budget = retries;
                    entry.wait(timeout).await;
                }
                State::DataCancel => {
                    info!("Recv data exchange cancellation from {}", host.ip);
                    entry.lock().cancel_attempt(attempt_no);
                    break;
                }
                State::DataResponse => {
                    let accepted = entry.lock().try_accept(attempt_no, &src.ip, reply.data);
                    if accepted {
                        info!("Recv data exchange response from {}", src.ip);
                        info!("Send data exchange acknowledgement to orchestrator");
                        let ack = Frame::data_ack(&req_id, attempt_no, &host.mac, &host.ip);
                        inner.send(&orch, ack).await;
                    }
                    inner.persist(&entry);
                    return Ok(entry.result());
                }
                _ => {}
            }
        }
        if dreq_budget == 0 {
            // The host may still answer after the budget ran out; the
            // listener will take the late response from here.
            entry.lock().late = true;
        }
    }

    entry.lock().finalize();
    inner.persist(&entry);
    // A late response may have landed between the last turn and here.
    Ok(entry.result())
}
