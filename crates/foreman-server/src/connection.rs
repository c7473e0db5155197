//! One task per TCP connection.
//!
//! The task owns the socket. It decodes inbound frames, drives the job
//! manager, and writes whatever the manager queued on the session's
//! outbound channel. A sleeping worker is woken after the long-poll
//! interval even if nothing arrived for it.

use crate::admin::{self, AdminCommand};
use bytes::BytesMut;
use foreman_core::{ForemanError, ForemanResult};
use foreman_jobs::{Job, JobError, JobManager, Session};
use foreman_protocol::{Frame, Magic, Packet, PacketBody, PacketCodec, ProtocolError};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Decoder item that keeps the stream alive across packets that fail to
/// parse. The inner codec realigns on the next header by itself.
#[derive(Debug)]
enum Inbound {
    Frame(Frame),
    Rejected(ProtocolError),
}

#[derive(Debug)]
struct ConnectionCodec(PacketCodec);

impl ConnectionCodec {
    fn lift(result: Result<Option<Frame>, ProtocolError>) -> Result<Option<Inbound>, ProtocolError> {
        match result {
            Ok(frame) => Ok(frame.map(Inbound::Frame)),
            Err(e) if !e.is_fatal() => Ok(Some(Inbound::Rejected(e))),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for ConnectionCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        Self::lift(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        Self::lift(self.0.decode_eof(src))
    }
}

impl Encoder<Frame> for ConnectionCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        Encoder::<Frame>::encode(&mut self.0, item, dst)
    }
}

/// Codec limits for a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_payload: usize,
    pub max_line: usize,
}

enum Flow {
    Continue,
    Close,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A connected client, worker, or admin peer.
pub struct Connection {
    framed: Framed<TcpStream, ConnectionCodec>,
    peer: SocketAddr,
    manager: Arc<JobManager>,
    session: Arc<Session>,
    outbound: mpsc::UnboundedReceiver<Packet>,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        manager: Arc<JobManager>,
        settings: ConnectionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(peer.to_string(), tx));
        let codec = ConnectionCodec(PacketCodec::new(settings.max_payload, settings.max_line));
        Self {
            framed: Framed::new(stream, codec),
            peer,
            manager,
            session,
            outbound,
            shutdown,
        }
    }

    /// Serves the connection until the peer leaves or the broker stops.
    pub async fn run(self) {
        let span = info_span!("connection", peer = %self.peer, session = %self.session.id());
        self.serve().instrument(span).await;
    }

    async fn serve(mut self) {
        self.manager.register_session(self.session.clone());
        debug!("Connection opened");

        loop {
            let deadline = self.session.sleep_deadline();
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("Broker shutting down, closing connection");
                    break;
                }
                inbound = self.framed.next() => match inbound {
                    Some(Ok(Inbound::Frame(frame))) => match self.handle_frame(frame).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break,
                        Err(e) => {
                            error!(error = %e, "Connection write failed");
                            break;
                        }
                    },
                    Some(Ok(Inbound::Rejected(e))) => {
                        warn!(error = %e, "Dropping malformed packet");
                        let reply = PacketBody::Error {
                            code: "ERR_PROTOCOL".to_string(),
                            text: e.to_string(),
                        };
                        if let Err(e) = self.reply(reply).await {
                            error!(error = %e, "Connection write failed");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Closing connection after decode error");
                        break;
                    }
                    None => {
                        debug!("Peer closed connection");
                        break;
                    }
                },
                Some(packet) = self.outbound.recv() => {
                    if let Err(e) = self.framed.send(Frame::Packet(packet)).await {
                        error!(error = %e, "Connection write failed");
                        break;
                    }
                }
                () = sleep_until_deadline(deadline) => {
                    debug!("Long-poll interval elapsed, waking worker");
                    self.manager.wake_worker(&self.session);
                }
            }
        }

        self.manager.unregister_session(&self.session).await;
        debug!("Connection closed");
    }

    async fn handle_frame(&mut self, frame: Frame) -> ForemanResult<Flow> {
        match frame {
            Frame::Packet(packet) => self.handle_packet(packet).await,
            Frame::Text(line) => self.handle_admin(&line).await,
        }
    }

    async fn handle_admin(&mut self, line: &str) -> ForemanResult<Flow> {
        let command = AdminCommand::parse(line);
        debug!(command = ?command, "Admin command");
        let reply = admin::execute(&command, &self.manager);
        self.send(Frame::Text(reply.text)).await?;

        if reply.shutdown {
            info!(peer = %self.peer, "Shutdown requested over admin connection");
            self.shutdown.cancel();
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn handle_packet(&mut self, packet: Packet) -> ForemanResult<Flow> {
        if packet.magic != Magic::Request {
            warn!(packet_type = %packet.packet_type(), "Ignoring response packet from peer");
            return Ok(Flow::Continue);
        }

        let grab = GrabKind::of(&packet.body);
        match packet.body {
            PacketBody::EchoReq { data } => self.reply(PacketBody::EchoRes { data }).await?,

            // Abilities
            PacketBody::CanDo { function } => {
                self.manager.register_worker_ability(&self.session, &function, None);
            }
            PacketBody::CanDoTimeout { function, timeout } => {
                self.manager
                    .register_worker_ability(&self.session, &function, Some(timeout));
            }
            PacketBody::CantDo { function } => {
                self.manager.unregister_worker_ability(&self.session, &function);
            }
            PacketBody::ResetAbilities => self.manager.reset_abilities(&self.session),
            PacketBody::PreSleep => self.manager.sleeping_worker(&self.session).await,

            // Grabs
            PacketBody::GrabJob | PacketBody::GrabJobUniq | PacketBody::GrabJobAll => {
                let body = match self.manager.next_job_for_worker(&self.session).await {
                    Some(job) => assignment(grab, job),
                    None => PacketBody::NoJob,
                };
                self.reply(body).await?;
            }

            // Submissions
            PacketBody::SubmitJob {
                priority,
                background,
                function,
                unique_id,
                data,
            } => {
                let job = Job::new(function, unique_id, data.to_vec())
                    .with_priority(priority)
                    .with_background(background);
                self.submit(job).await?;
            }
            PacketBody::SubmitJobEpoch {
                function,
                unique_id,
                epoch,
                data,
            } => {
                let job = Job::new(function, unique_id, data.to_vec())
                    .with_background(true)
                    .run_at(epoch);
                self.submit(job).await?;
            }
            PacketBody::SubmitReduceJob {
                background,
                function,
                unique_id,
                reducer,
                data,
            } => {
                let job = Job::new(function, unique_id, data.to_vec())
                    .with_background(background)
                    .with_reducer(reducer);
                self.submit(job).await?;
            }
            PacketBody::SubmitJobSched { function, .. } => {
                debug!(function = %function, "Rejecting recurring job");
                self.reply(PacketBody::Error {
                    code: "ERR_NOT_SUPPORTED".to_string(),
                    text: "Recurring jobs are not supported".to_string(),
                })
                .await?;
            }

            // Worker reports
            PacketBody::WorkStatus {
                handle,
                numerator,
                denominator,
            } => {
                let result = self.manager.handle_work_status(&handle, numerator, denominator);
                self.report(result).await?;
            }
            PacketBody::WorkData { handle, data } => {
                let result = self.manager.handle_work_data(&handle, data);
                self.report(result).await?;
            }
            PacketBody::WorkWarning { handle, data } => {
                let result = self.manager.handle_work_warning(&handle, data);
                self.report(result).await?;
            }
            PacketBody::WorkComplete { handle, data } => {
                let result = self.manager.handle_work_completion(&handle, data).await;
                self.report(result.map(|_| ())).await?;
            }
            PacketBody::WorkFail { handle } => {
                let result = self.manager.handle_work_failure(&handle).await;
                self.report(result.map(|_| ())).await?;
            }
            PacketBody::WorkException { handle, data } => {
                let result = self.manager.handle_work_exception(&handle, data).await;
                self.report(result.map(|_| ())).await?;
            }

            // Status
            PacketBody::GetStatus { handle } => {
                let status = self.manager.get_status(&handle);
                self.reply(PacketBody::StatusRes {
                    known: status.is_known(),
                    running: status.running(),
                    numerator: status.numerator,
                    denominator: status.denominator,
                    handle,
                })
                .await?;
            }
            PacketBody::GetStatusUnique { unique_id } => {
                let (status, waiting) = self.manager.get_status_unique(&unique_id);
                self.reply(PacketBody::StatusResUnique {
                    known: status.is_known(),
                    running: status.running(),
                    numerator: status.numerator,
                    denominator: status.denominator,
                    waiting: u32::try_from(waiting).unwrap_or(u32::MAX),
                    unique_id,
                })
                .await?;
            }

            // Session options
            PacketBody::SetClientId { client_id } => self.session.set_client_id(client_id),
            PacketBody::OptionReq { option } => {
                if option == "exceptions" {
                    self.session.set_exceptions(true);
                    self.reply(PacketBody::OptionRes { option }).await?;
                } else {
                    self.reply(PacketBody::Error {
                        code: "ERR_UNKNOWN_OPTION".to_string(),
                        text: format!("Unknown option: {}", option),
                    })
                    .await?;
                }
            }
            PacketBody::AllYours => debug!("ALL_YOURS ignored"),

            other => {
                warn!(packet_type = %other.packet_type(), "Unexpected request packet");
            }
        }
        Ok(Flow::Continue)
    }

    async fn submit(&mut self, job: Job) -> ForemanResult<()> {
        let client = (!job.background).then(|| self.session.clone());
        match self.manager.store_job_for_client(job, client.as_ref()).await {
            Ok(job) => self.reply(PacketBody::JobCreated { handle: job.handle }).await,
            Err(e) => {
                warn!(error = %e, "Submission rejected");
                self.reply_error(&e).await
            }
        }
    }

    /// Worker reports get no reply unless they are rejected.
    async fn report(&mut self, result: Result<(), JobError>) -> ForemanResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Worker report rejected");
                self.reply_error(&e).await
            }
        }
    }

    async fn reply_error(&mut self, e: &JobError) -> ForemanResult<()> {
        self.reply(PacketBody::Error {
            code: e.code().to_string(),
            text: e.to_string(),
        })
        .await
    }

    async fn reply(&mut self, body: PacketBody) -> ForemanResult<()> {
        self.send(Frame::Packet(Packet::response(body))).await
    }

    async fn send(&mut self, frame: Frame) -> ForemanResult<()> {
        self.framed.send(frame).await.map_err(|e| match e {
            ProtocolError::Io(io) => ForemanError::Io(io),
            other => ForemanError::Protocol(other.to_string()),
        })
    }
}

/// Which assignment packet answers a grab.
#[derive(Debug, Clone, Copy)]
enum GrabKind {
    Plain,
    Uniq,
    All,
}

impl GrabKind {
    fn of(body: &PacketBody) -> Self {
        match body {
            PacketBody::GrabJobUniq => GrabKind::Uniq,
            PacketBody::GrabJobAll => GrabKind::All,
            _ => GrabKind::Plain,
        }
    }
}

fn assignment(kind: GrabKind, job: Job) -> PacketBody {
    let data = job.data.into();
    match kind {
        GrabKind::Plain => PacketBody::JobAssign {
            handle: job.handle,
            function: job.function_name,
            data,
        },
        GrabKind::Uniq => PacketBody::JobAssignUniq {
            handle: job.handle,
            function: job.function_name,
            unique_id: job.unique_id,
            data,
        },
        GrabKind::All => PacketBody::JobAssignAll {
            handle: job.handle,
            function: job.function_name,
            unique_id: job.unique_id,
            reducer: job.reducer.unwrap_or_default(),
            data,
        },
    }
}
