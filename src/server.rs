//! HTTP control surface: start a run, stop it, read its status and telemetry.

use crate::controller::{LoadRequest, LoadTestController, RunHandle, RunId, RunSummary};
use crate::error::{LoadError, LoadResult};
use crate::telemetry::{TelemetrySampler, TelemetrySnapshot};
use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info};

/// Body of `POST /runs`: one request or a list started under one token.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RunBody {
    One(LoadRequest),
    Many(Vec<LoadRequest>),
}

impl RunBody {
    pub fn into_requests(self) -> Vec<LoadRequest> {
        match self {
            RunBody::One(r) => vec![r],
            RunBody::Many(rs) => rs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub running: bool,
    pub id: Option<RunId>,
    /// The run's token is set but its units have not been joined yet
    pub stopping: bool,
    pub elapsed_ms: u64,
    pub units: usize,
    pub alive: usize,
    pub requests: Vec<LoadRequest>,
}

#[derive(Serialize)]
struct Started {
    id: RunId,
}

#[derive(Serialize)]
struct Failure {
    error: String,
}

pub struct AppState {
    controller: LoadTestController,
    active: Mutex<Option<RunHandle>>,
    telemetry: Mutex<TelemetrySampler>,
}

impl AppState {
    pub fn new(controller: LoadTestController) -> Self {
        let sampler = TelemetrySampler::new(controller.config().telemetry.gpu_query_command.clone());
        Self {
            controller,
            active: Mutex::new(None),
            telemetry: Mutex::new(sampler),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a plan. A run whose token was already set (e.g. its window was
    /// closed) is reaped first.
    pub fn start(&self, requests: &[LoadRequest]) -> LoadResult<RunId> {
        self.reap_cancelled();
        let mut active = self.active();
        let run = self.controller.start_plan(requests)?;
        let id = run.id();
        *active = Some(run);
        Ok(id)
    }

    /// Stop and forget the active run if its token is already set.
    ///
    /// The handle leaves the lock before its units are joined, so status
    /// requests are not held up by a slow unit.
    pub fn reap_cancelled(&self) -> Option<RunSummary> {
        let finished = self.active().take_if(|run| run.token().is_set());
        finished.map(|mut run| {
            let summary = run.stop();
            info!("Reaped cancelled run {} ({} unit(s))", summary.id, summary.units);
            summary
        })
    }

    pub fn stop(&self) -> Option<RunSummary> {
        let run = self.active().take();
        run.map(|mut run| run.stop())
    }

    pub fn status(&self) -> RunStatus {
        match self.active().as_ref() {
            Some(run) => RunStatus {
                running: true,
                id: Some(run.id()),
                stopping: run.token().is_set(),
                elapsed_ms: run.elapsed().as_millis() as u64,
                units: run.units(),
                alive: run.alive(),
                requests: run.requests().to_vec(),
            },
            None => RunStatus {
                running: false,
                id: None,
                stopping: false,
                elapsed_ms: 0,
                units: 0,
                alive: 0,
                requests: Vec::new(),
            },
        }
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }
}

fn failure(e: impl ToString) -> Failure {
    Failure { error: e.to_string() }
}

#[post("/runs")]
async fn start_run(state: web::Data<AppState>, body: web::Json<RunBody>) -> impl Responder {
    let requests = body.into_inner().into_requests();
    let state = state.into_inner();
    match web::block(move || state.start(&requests)).await {
        Ok(Ok(id)) => HttpResponse::Accepted().json(Started { id }),
        Ok(Err(e @ LoadError::RunActive)) => HttpResponse::Conflict().json(failure(e)),
        Ok(Err(e)) => HttpResponse::BadRequest().json(failure(e)),
        Err(e) => {
            error!("Start task failed: {}", e);
            HttpResponse::InternalServerError().json(failure(e))
        }
    }
}

#[post("/stop")]
async fn stop_run(state: web::Data<AppState>) -> impl Responder {
    let state = state.into_inner();
    match web::block(move || state.stop()).await {
        Ok(Some(summary)) => HttpResponse::Ok().json(summary),
        Ok(None) => HttpResponse::NotFound().json(failure("no active run")),
        Err(e) => {
            error!("Stop task failed: {}", e);
            HttpResponse::InternalServerError().json(failure(e))
        }
    }
}

#[get("/status")]
async fn status(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.status())
}

#[get("/telemetry")]
async fn telemetry(state: web::Data<AppState>) -> impl Responder {
    let state = state.into_inner();
    match web::block(move || state.telemetry()).await {
        Ok(snapshot) => HttpResponse::Ok().json(snapshot),
        Err(e) => HttpResponse::InternalServerError().json(failure(e)),
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(start_run)
        .service(stop_run)
        .service(status)
        .service(telemetry);
}

/// Serve until the server is shut down, then stop any run still active.
pub async fn serve(state: AppState, bind: &str) -> std::io::Result<()> {
    let data = web::Data::new(state);
    let app_data = data.clone();
    info!("Control surface listening on {}", bind);
    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .app_data(app_data.clone())
            .configure(routes)
    })
    .bind(bind)?
    .run()
    .await?;

    let state = data.into_inner();
    if let Ok(Some(summary)) = web::block(move || state.stop()).await {
        info!("Stopped run {} on shutdown", summary.id);
    }
    Ok(())
}
