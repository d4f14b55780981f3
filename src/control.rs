// Local HTTP control surface
// Thin JSON handlers over the game server's control entry points; runs on
// its own thread with its own actix system so the host runtime stays
// undisturbed

use std::sync::Arc;
use std::thread;

use actix_web::web::{Data, Json};
use actix_web::{get, post, App, HttpResponse, HttpServer, Responder};
use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{error, info};

use crate::game::{GameMode, GameServer};
use crate::signaling::SignalingClient;
use crate::track::TrackLibrary;

pub struct ControlContext {
    pub server: Arc<GameServer>,
    pub signaling: Arc<SignalingClient>,
    pub tracks: Arc<TrackLibrary>,
    /// Handle of the host runtime; every mutation runs there.
    pub runtime: Handle,
}

pub fn spawn(bind: String, context: ControlContext) -> Result<()> {
    thread::Builder::new()
        .name("control-api".to_string())
        .spawn(move || {
            let system = actix_web::rt::System::new();
            if let Err(err) = system.block_on(serve(bind, context)) {
                error!("control API failed: {err}");
            }
        })?;
    Ok(())
}

async fn serve(bind: String, context: ControlContext) -> std::io::Result<()> {
    info!("Control API running on {bind}");
    let data = Data::new(context);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .service(status)
            .service(new_invite)
            .service(swap_track)
            .service(kick)
            .service(end_session)
            .service(start_session)
            .service(set_session)
            .service(players)
    })
    .workers(1)
    .bind(bind)?
    .run()
    .await
}

#[get("/status")]
async fn status(data: Data<ControlContext>) -> impl Responder {
    let ctx = data.clone();
    let result = data
        .runtime
        .spawn(async move {
            let invite = ctx.signaling.current_invite().await;
            let summary = ctx.server.session_summary().await;
            let track = ctx.server.current_track().await;
            (invite, summary, track)
        })
        .await;

    match result {
        Ok((invite, summary, track)) => HttpResponse::Ok().json(json!({
            "invite": invite,
            "tracks": data.tracks.names(),
            "current": data.tracks.name_of(&track),
            "session": summary,
        })),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[post("/invite")]
async fn new_invite(data: Data<ControlContext>) -> impl Responder {
    let ctx = data.clone();
    let result = data
        .runtime
        .spawn(async move {
            ctx.signaling.create_invite().await?;
            Ok::<_, anyhow::Error>(ctx.signaling.current_invite().await)
        })
        .await;

    match result {
        Ok(Ok(invite)) => HttpResponse::Ok().json(json!({ "invite": invite })),
        Ok(Err(err)) => HttpResponse::InternalServerError().body(err.to_string()),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[derive(Deserialize)]
struct TrackRequest {
    name: String,
}

#[post("/track")]
async fn swap_track(data: Data<ControlContext>, body: Json<TrackRequest>) -> impl Responder {
    let Some(track) = data.tracks.get(&body.name) else {
        return HttpResponse::NotFound().body("Track not found");
    };
    info!("Track switched to {}", body.name);

    let ctx = data.clone();
    match data
        .runtime
        .spawn(async move { ctx.server.set_track(track).await })
        .await
    {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[derive(Deserialize)]
struct KickRequest {
    id: u32,
}

#[post("/kick")]
async fn kick(data: Data<ControlContext>, body: Json<KickRequest>) -> impl Responder {
    let id = body.id;
    let ctx = data.clone();
    match data
        .runtime
        .spawn(async move { ctx.server.kick(id).await })
        .await
    {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().body("Player not found"),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[post("/session/end")]
async fn end_session(data: Data<ControlContext>) -> impl Responder {
    let ctx = data.clone();
    match data
        .runtime
        .spawn(async move { ctx.server.end_session().await })
        .await
    {
        Ok(Ok(())) => HttpResponse::NoContent().finish(),
        Ok(Err(err)) => HttpResponse::BadRequest().body(err.to_string()),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[post("/session/start")]
async fn start_session(data: Data<ControlContext>) -> impl Responder {
    let ctx = data.clone();
    match data
        .runtime
        .spawn(async move { ctx.server.start_session().await })
        .await
    {
        Ok(Ok(())) => HttpResponse::NoContent().finish(),
        Ok(Err(err)) => HttpResponse::BadRequest().body(err.to_string()),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[derive(Deserialize)]
struct SessionRequest {
    gamemode: u8,
    track: String,
    #[serde(rename = "maxPlayers")]
    max_players: u16,
}

#[post("/session/set")]
async fn set_session(data: Data<ControlContext>, body: Json<SessionRequest>) -> impl Responder {
    let Some(game_mode) = GameMode::from_u8(body.gamemode) else {
        return HttpResponse::BadRequest().body("Unknown game mode");
    };
    let Some(track) = data.tracks.get(&body.track) else {
        return HttpResponse::BadRequest().body("Track not found");
    };

    let max_players = body.max_players;
    let ctx = data.clone();
    match data
        .runtime
        .spawn(async move { ctx.server.set_session(game_mode, track, max_players).await })
        .await
    {
        Ok(session_id) => {
            info!("Got new session data (session {session_id})");
            HttpResponse::NoContent().finish()
        }
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[get("/players")]
async fn players(data: Data<ControlContext>) -> impl Responder {
    let ctx = data.clone();
    match data
        .runtime
        .spawn(async move { ctx.server.list_players().await })
        .await
    {
        Ok(list) => HttpResponse::Ok().json(json!({ "players": list })),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}
