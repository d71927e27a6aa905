//! Read-only web dashboard listing the connected players.
//!
//! `GET /` renders an HTML table and `GET /players.json` returns the same rows
//! as JSON. Both read the shared session table and never modify it.

use crate::session_table::SessionTable;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use serde::Serialize;
use shared::{BoxError, PlayerSummary};
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};

pub const DEFAULT_DASHBOARD_PORT: u16 = 8080;

/// One row of the player table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerRow {
    pub id: u8,
    pub name: String,
    pub color: String,
    pub room: String,
    pub speedrun_time: Option<String>,
    pub puzzle_pieces: u8,
    pub ping_ms: Option<u32>,
}

impl From<&PlayerSummary> for PlayerRow {
    fn from(player: &PlayerSummary) -> Self {
        Self {
            id: player.player_id.0,
            name: player.name.clone(),
            color: player.color.to_hex(),
            room: format!("World {}-{}", player.snapshot.world, player.snapshot.level),
            speedrun_time: player.format_speedrun_time(),
            puzzle_pieces: player.puzzle_pieces,
            ping_ms: player.ping,
        }
    }
}

#[derive(Debug, Serialize)]
struct PlayersDocument<'a> {
    game_port: u16,
    players: &'a [PlayerRow],
}

pub struct Dashboard {
    listener: TcpListener,
    sessions: Arc<RwLock<SessionTable>>,
    game_port: u16,
}

impl Dashboard {
    pub async fn bind(
        addr: &str,
        sessions: Arc<RwLock<SessionTable>>,
        game_port: u16,
    ) -> Result<Self, BoxError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Web dashboard listening on http://{}", listener.local_addr()?);

        Ok(Dashboard {
            listener,
            sessions,
            game_port,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BoxError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            warn!("Dashboard accept failed: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let sessions = Arc::clone(&self.sessions);
                    let game_port = self.game_port;

                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let sessions = Arc::clone(&sessions);
                            async move {
                                Ok::<_, Infallible>(handle_request(req, &sessions, game_port).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Dashboard connection from {} failed: {}", remote_addr, e);
                        }
                    });
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        info!("Web dashboard stopped");
        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    sessions: &RwLock<SessionTable>,
    game_port: u16,
) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed".into());
    }

    let path = req.uri().path().to_string();
    let rows = player_rows(&sessions.read().await.players());
    match path.as_str() {
        "/" => respond(
            StatusCode::OK,
            "text/html; charset=utf-8",
            render_players_html(&rows, game_port),
        ),
        "/players.json" => {
            let document = PlayersDocument {
                game_port,
                players: &rows,
            };
            match serde_json::to_string(&document) {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("failed to encode players: {}", e),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found".into()),
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub fn player_rows(players: &[PlayerSummary]) -> Vec<PlayerRow> {
    players.iter().map(PlayerRow::from).collect()
}

pub fn render_players_html(rows: &[PlayerRow], game_port: u16) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Players</title></head>\n<body>\n",
    );
    let _ = writeln!(
        html,
        "<h1>{} player(s) on port {}</h1>",
        rows.len(),
        game_port
    );

    if rows.is_empty() {
        html.push_str("<p>Nobody is connected.</p>\n");
    } else {
        html.push_str(
            "<table>\n<tr><th>Id</th><th>Name</th><th>Room</th><th>Speedrun</th><th>Pieces</th><th>Ping</th></tr>\n",
        );
        for row in rows {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td style=\"color: {}\">{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                row.id,
                row.color,
                escape_html(&row.name),
                row.room,
                row.speedrun_time.as_deref().unwrap_or("-"),
                row.puzzle_pieces,
                row.ping_ms
                    .map_or_else(|| "-".to_string(), |ms| format!("{} ms", ms)),
            );
        }
        html.push_str("</table>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
