use tracing::{debug, warn};

use crate::transport::{
    CommandHeader, GuestPacket, PacketOp, PktWrapper, VqToken, CONSUME_RC_COMMAND_RATE,
    CONSUME_RC_DEVICE_TIME, INTERNAL_API, NW_NEW_WORKER,
};
use crate::vm::{checked_vm_id, AppInfo, VmId};
use crate::CheckOutcome;
use crate::Mediator;

/// What the transport should do with an interposed packet. Entry points
/// never fail; errors collapse into a disposition and an internal log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    /// Not command traffic; deliver untouched.
    Passthrough,
    /// Admitted command traffic; enqueue for the worker.
    Forward,
    /// Refused or cancelled; discard.
    Drop,
}

/// An out-of-band consumption report from a worker. The channel supplies
/// the sender's pid; the message reuses the command-header wire shape.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_pid: u32,
    pub msg: CommandHeader,
}

impl Mediator {
    /// Interpose one guest-originated packet.
    ///
    /// Control-port traffic passes through. Zero-length packets carry app
    /// lifecycle: REQUEST creates an app, SHUTDOWN destroys the matching
    /// one. Anything carrying a command header runs the full admission
    /// fan-out and is forwarded or dropped.
    pub async fn on_guest_packet(&self, pkt: &GuestPacket) -> PacketDisposition {
        let hdr = &pkt.hdr;
        if hdr.dst_port == self.config.control_port {
            return PacketDisposition::Passthrough;
        }

        let Some(vm_id) = self.vms.vm_by_cid(hdr.src_cid) else {
            debug!(cid = hdr.src_cid, "packet from unknown guest cid");
            return PacketDisposition::Passthrough;
        };

        if hdr.len == 0 {
            match hdr.op {
                PacketOp::Request => {
                    debug!(
                        vm = vm_id,
                        app_port = hdr.src_port,
                        worker_port = hdr.dst_port,
                        "guest app request"
                    );
                    self.on_app_attach(AppInfo {
                        vm_id,
                        guest_cid: hdr.src_cid,
                        app_port: hdr.src_port,
                        worker_port: hdr.dst_port,
                        worker_pid: None,
                    });
                }
                PacketOp::Shutdown => {
                    debug!(
                        vm = vm_id,
                        app_port = hdr.src_port,
                        worker_port = hdr.dst_port,
                        "guest app shutdown"
                    );
                    self.on_app_detach(hdr.src_cid, hdr.src_port, hdr.dst_port);
                }
                _ => {}
            }
            return PacketDisposition::Passthrough;
        }

        let Some(command) = CommandHeader::parse(&pkt.payload) else {
            // Short data packet, nothing for the policies to read.
            return PacketDisposition::Forward;
        };
        match self.registry.check(vm_id, &command, &self.cancel_rx).await {
            CheckOutcome::Admitted => PacketDisposition::Forward,
            CheckOutcome::Denied => {
                debug!(vm = vm_id, cmd = command.command_id, "admission denied, packet dropped");
                PacketDisposition::Drop
            }
        }
    }

    /// Interpose one worker-originated packet on its way back to the guest.
    /// A zero-length SHUTDOWN means the worker died (crashes happen before
    /// the guestlib notices) and releases the matching app.
    pub fn on_worker_packet(&self, pkt: &GuestPacket) {
        let hdr = &pkt.hdr;
        if hdr.src_port == self.config.control_port {
            return;
        }
        if hdr.len == 0 && hdr.op == PacketOp::Shutdown {
            debug!(
                cid = hdr.dst_cid,
                app_port = hdr.dst_port,
                worker_port = hdr.src_port,
                "worker shutdown"
            );
            self.on_app_detach(hdr.dst_cid, hdr.dst_port, hdr.src_port);
        }
    }

    /// Handle one consumption report from the out-of-band worker channel.
    pub fn on_worker_report(&self, report: &WorkerReport) {
        let msg = &report.msg;
        if msg.api_id != INTERNAL_API {
            debug!(api = msg.api_id, "non-internal worker report ignored");
            return;
        }

        match msg.command_id {
            NW_NEW_WORKER => {
                let worker_port = msg.reserved_u32();
                debug!(port = worker_port, pid = report.worker_pid, "new worker announced");
                self.vms.bind_worker(worker_port, report.worker_pid);
            }
            CONSUME_RC_COMMAND_RATE => {
                let Some(vm_id) = self.report_vm(report.worker_pid) else {
                    return;
                };
                let consumed = msg.reserved_i64();
                debug!(vm = vm_id, consumed, "command-rate report");
                self.registry.consume_command_rate(vm_id, consumed as i32);
            }
            CONSUME_RC_DEVICE_TIME => {
                let Some(vm_id) = self.report_vm(report.worker_pid) else {
                    return;
                };
                let micros = msg.reserved_i64();
                debug!(vm = vm_id, micros, "device-time report");
                self.registry.consume_device_time(vm_id, micros);
            }
            other => {
                warn!(cmd = other, "worker report with unknown command");
            }
        }
    }

    fn report_vm(&self, worker_pid: u32) -> Option<VmId> {
        let vm_id = self.vms.vm_by_pid(worker_pid);
        if vm_id.is_none() {
            debug!(pid = worker_pid, "report from unmapped worker pid");
        }
        vm_id.and_then(|id| checked_vm_id(id as i64))
    }

    /// App-attach cascade: register in the table, then run every policy's
    /// app hook. Allocation is fine here; this is not the packet path.
    pub fn on_app_attach(&self, app: AppInfo) -> Option<AppInfo> {
        let app = self.vms.add_app(app)?;
        self.registry.app_init(&app);
        Some(app)
    }

    /// App-detach cascade; a lookup miss logs and returns without effect.
    pub fn on_app_detach(&self, guest_cid: u64, app_port: u32, worker_port: u32) {
        match self.vms.remove_app(guest_cid, app_port, worker_port) {
            Some(app) => self.registry.app_release(&app),
            None => debug!(cid = guest_cid, app_port, worker_port, "app not found on detach"),
        }
    }

    /// Thin producer wrapper over the VM's send ring. Pushing on a
    /// torn-down or detached transport is swallowed; the packet drops.
    pub async fn push_outbound(&self, vm_id: VmId, pkt: GuestPacket, vq: Option<VqToken>) -> bool {
        let Some(ring) = self.vms.ring(vm_id) else {
            debug!(vm = vm_id, "push on detached vsock, packet dropped");
            return false;
        };
        let pushed = ring.push(PktWrapper { pkt: Some(pkt), vq }).await;
        if !pushed {
            debug!(vm = vm_id, "push on torn-down vsock, packet dropped");
        }
        pushed
    }

    /// Consumer side of the send ring, polled by the transport's delivery
    /// task.
    pub fn poll_outbound(&self, vm_id: VmId) -> Option<PktWrapper> {
        self.vms.ring(vm_id)?.poll()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::MediatorConfig;
    use crate::policy::{CommandRatePolicy, DeviceTimePolicy, KernelPolicy};
    use crate::transport::COMMAND_HEADER_LEN;

    const GUEST_CID: u64 = 3;
    const HOST_CID: u64 = 2;

    fn mediator() -> Mediator {
        let m = Mediator::new(MediatorConfig::default());
        m.install_kernel_policy(KernelPolicy::CommandRate(CommandRatePolicy::new(m.config())));
        m.install_kernel_policy(KernelPolicy::DeviceTime(DeviceTimePolicy::new(m.config())));
        m.on_vm_attach(1, GUEST_CID, Box::new(|_| {}));
        m
    }

    fn command_packet(cmd_id: i64) -> GuestPacket {
        let payload = CommandHeader::new(1, cmd_id, 1).encode();
        GuestPacket::data(GUEST_CID, HOST_CID, 100, 9100, payload)
    }

    fn request_packet() -> GuestPacket {
        GuestPacket::control(GUEST_CID, HOST_CID, 100, 9100, PacketOp::Request)
    }

    #[tokio::test]
    async fn control_port_passes_through() {
        let m = mediator();
        let pkt = GuestPacket::control(GUEST_CID, HOST_CID, 100, m.config().control_port, PacketOp::Rw);
        assert_eq!(m.on_guest_packet(&pkt).await, PacketDisposition::Passthrough);
    }

    #[tokio::test]
    async fn unknown_cid_passes_through() {
        let m = mediator();
        let pkt = GuestPacket::control(99, HOST_CID, 100, 9100, PacketOp::Request);
        assert_eq!(m.on_guest_packet(&pkt).await, PacketDisposition::Passthrough);
        assert_eq!(m.vms().app_count(1), 0);
    }

    #[tokio::test]
    async fn request_creates_app_and_runs_cascade() {
        let m = mediator();
        assert_eq!(m.on_guest_packet(&request_packet()).await, PacketDisposition::Passthrough);
        assert_eq!(m.vms().app_count(1), 1);

        // The device-time policy saw the first live app.
        let snapshot = m.registry().snapshot();
        let dt_totals: Vec<i32> = snapshot
            .kernel
            .iter()
            .filter_map(|p| match p {
                crate::policy::PolicyStateSnapshot::DeviceTime { state, .. } => {
                    Some(state.total_priority)
                }
                _ => None,
            })
            .collect();
        assert_eq!(dt_totals, vec![1]);
    }

    #[tokio::test]
    async fn shutdown_destroys_matching_app() {
        let m = mediator();
        m.on_guest_packet(&request_packet()).await;
        assert_eq!(m.vms().app_count(1), 1);

        let bye = GuestPacket::control(GUEST_CID, HOST_CID, 100, 9100, PacketOp::Shutdown);
        m.on_guest_packet(&bye).await;
        assert_eq!(m.vms().app_count(1), 0);
    }

    #[tokio::test]
    async fn admitted_command_forwards() {
        let m = mediator();
        assert_eq!(m.on_guest_packet(&command_packet(7)).await, PacketDisposition::Forward);
    }

    #[tokio::test]
    async fn short_data_packet_forwards_without_check() {
        let m = mediator();
        let pkt = GuestPacket::data(
            GUEST_CID,
            HOST_CID,
            100,
            9100,
            Bytes::from(vec![0u8; COMMAND_HEADER_LEN / 2]),
        );
        assert_eq!(m.on_guest_packet(&pkt).await, PacketDisposition::Forward);
    }

    #[tokio::test]
    async fn cancelled_check_drops_packet() {
        let m = std::sync::Arc::new(mediator());
        // Exhaust the rate balance so the check parks.
        m.registry().consume_command_rate(1, 1_000);

        let m2 = m.clone();
        let pending = tokio::spawn(async move { m2.on_guest_packet(&command_packet(7)).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        m.shutdown();
        assert_eq!(pending.await.unwrap(), PacketDisposition::Drop);
    }

    #[tokio::test]
    async fn worker_report_binds_then_consumes() {
        let m = mediator();
        m.on_guest_packet(&request_packet()).await;

        // Worker announces itself on the report channel.
        let hello = WorkerReport {
            worker_pid: 4242,
            msg: CommandHeader::new(INTERNAL_API, NW_NEW_WORKER, 0).with_reserved_u32(9100),
        };
        m.on_worker_report(&hello);
        assert_eq!(m.vms().vm_by_pid(4242), Some(1));

        let before = match &m.registry().snapshot().kernel[0] {
            crate::policy::PolicyStateSnapshot::CommandRate { state, .. } => state.vms[0].balance,
            _ => panic!("expected rate policy first"),
        };
        let spend = WorkerReport {
            worker_pid: 4242,
            msg: CommandHeader::new(INTERNAL_API, CONSUME_RC_COMMAND_RATE, 0).with_reserved_i64(3),
        };
        m.on_worker_report(&spend);
        let after = match &m.registry().snapshot().kernel[0] {
            crate::policy::PolicyStateSnapshot::CommandRate { state, .. } => state.vms[0].balance,
            _ => panic!("expected rate policy first"),
        };
        assert_eq!(after, before - 3);
    }

    #[tokio::test]
    async fn report_from_unknown_pid_has_no_effect() {
        let m = mediator();
        m.on_guest_packet(&request_packet()).await;

        let spend = WorkerReport {
            worker_pid: 31337,
            msg: CommandHeader::new(INTERNAL_API, CONSUME_RC_DEVICE_TIME, 0).with_reserved_i64(500),
        };
        m.on_worker_report(&spend);

        let snapshot = m.registry().snapshot();
        for policy in &snapshot.kernel {
            if let crate::policy::PolicyStateSnapshot::DeviceTime { state, .. } = policy {
                assert_eq!(state.total_used_time_us, 0);
            }
        }
    }

    #[tokio::test]
    async fn worker_crash_packet_releases_app() {
        let m = mediator();
        m.on_guest_packet(&request_packet()).await;
        assert_eq!(m.vms().app_count(1), 1);

        // Worker -> guest shutdown: ports are mirrored relative to the
        // guest's request.
        let crash = GuestPacket::control(HOST_CID, GUEST_CID, 9100, 100, PacketOp::Shutdown);
        m.on_worker_packet(&crash);
        assert_eq!(m.vms().app_count(1), 0);
    }

    #[tokio::test]
    async fn outbound_push_to_detached_vm_is_swallowed() {
        let m = mediator();
        assert!(m.push_outbound(1, command_packet(1), None).await);
        assert!(m.poll_outbound(1).is_some());

        m.on_vm_detach(1);
        assert!(!m.push_outbound(1, command_packet(1), None).await);
    }
}
