//! ABOUTME: actix-web-actors transport for the worker channel (§4.4.1, §4.4.6)
//! ABOUTME: Thin: all framing/filtering logic lives in protocol.rs and registry.rs

use crate::ingest;
use crate::protocol::WireEvent;
use crate::registry::{Session, WorkerRegistry};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{web, Error as ActixError, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use cronmesh_core::Id;
use cronmesh_db::WorkerRepository;
use cronmesh_scheduler::WorkerMetadata;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub worker: String,
    #[serde(default)]
    pub metadata: Option<String>,
}

/// One actor per live worker connection. Owns nothing but hand-off channels and identity;
/// the registry and the database are the sources of truth.
pub struct WorkerSession {
    client_id: String,
    worker_id: String,
    pool: SqlitePool,
    registry: Arc<WorkerRegistry>,
    outbound_rx: Option<mpsc::Receiver<WireEvent>>,
}

impl Actor for WorkerSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let rx = self.outbound_rx.take().expect("outbound receiver already taken");
        ctx.add_stream(ReceiverStream::new(rx));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let registry = self.registry.clone();
        let client_id = self.client_id.clone();
        actix::spawn(async move { registry.unregister(&client_id).await });
    }
}

/// Outbound events queued for this session are pushed in as a stream and written verbatim.
impl StreamHandler<WireEvent> for WorkerSession {
    fn handle(&mut self, event: WireEvent, ctx: &mut Self::Context) {
        match event.encode() {
            Ok(frame) => ctx.binary(frame),
            Err(e) => warn!(client_id = %self.client_id, error = %e, "failed to encode outbound frame"),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WorkerSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "worker channel protocol error");
                return;
            }
        };

        match msg {
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Binary(bin) => self.ingest_frame(&bin),
            ws::Message::Text(text) => self.ingest_frame(text.as_bytes()),
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl WorkerSession {
    fn ingest_frame(&self, frame: &[u8]) {
        let event = match WireEvent::decode(frame) {
            Ok(e) => e,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "dropping unparsable inbound frame");
                return;
            }
        };

        let pool = self.pool.clone();
        let worker_id = self.worker_id.clone();
        actix::spawn(async move {
            if let Err(e) = ingest::apply_report(&pool, &worker_id, &event).await {
                warn!(worker_id, error = %e, "failed to apply worker report");
            }
        });
    }
}

/// Connection lifecycle entry point (§4.4.1): looks up or creates the Worker, registers a
/// Session, and upgrades to the framed duplex transport.
pub async fn worker_channel(
    req: HttpRequest,
    stream: web::Payload,
    pool: web::Data<SqlitePool>,
    registry: web::Data<Arc<WorkerRegistry>>,
    query: web::Query<ConnectQuery>,
) -> Result<HttpResponse, ActixError> {
    let metadata_blob = query.metadata.clone().unwrap_or_else(|| "{}".to_string());

    let worker = WorkerRepository::new(&pool)
        .get_or_create(&query.worker, &metadata_blob)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    let categories = WorkerMetadata::decode(&worker.metadata).unwrap_or_default().tasks;
    let client_id = Id::new().to_string();

    let (session, outbound_rx) = Session::new(client_id.clone(), worker.id.clone(), worker.name.clone(), categories);
    registry.register(session).await;

    let actor = WorkerSession {
        client_id,
        worker_id: worker.id,
        pool: pool.get_ref().clone(),
        registry: registry.get_ref().clone(),
        outbound_rx: Some(outbound_rx),
    };

    ws::start(actor, &req, stream)
}
