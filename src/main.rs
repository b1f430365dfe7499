//! `canvas-sim`: drive several simulated clients against one canvas.
//!
//! Runs against the in-process memory feed, or Postgres when `DATABASE_URL`
//! is set. The scenario covers manual edits, a contended drag, a generated
//! 11-object form, undo/redo, and a final convergence check across clients.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tracing::{info, warn};

use collaboard_sync::config::SyncConfig;
use collaboard_sync::db;
use collaboard_sync::feed::ChangeFeed;
use collaboard_sync::feed::memory::MemoryFeed;
use collaboard_sync::feed::pg::PgFeed;
use collaboard_sync::object::{CircleShape, RectShape, Shape, TextShape, UserIdentity, ValidationError};
use collaboard_sync::session::{CanvasSession, SessionError};

const COLORS: [&str; 6] = ["#E53935", "#1E88E5", "#43A047", "#FB8C00", "#8E24AA", "#00ACC1"];

#[derive(Debug, thiserror::Error)]
enum SimError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Parser, Debug)]
#[command(name = "canvas-sim", about = "Simulate concurrent clients on one shared canvas")]
struct Cli {
    #[arg(long, env = "SIM_CANVAS_ID", default_value = "sim-canvas")]
    canvas: String,

    /// Number of simulated clients.
    #[arg(long, default_value_t = 3)]
    clients: usize,

    /// Manual shapes created per client.
    #[arg(long, default_value_t = 5)]
    shapes: usize,

    /// Pause between phases so remote changes can arrive.
    #[arg(long, default_value_t = 200)]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), SimError> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("no .env loaded: {e}");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let feed = open_feed().await?;

    let mut sessions = Vec::with_capacity(cli.clients);
    for i in 0..cli.clients.max(1) {
        let user = UserIdentity::new(format!("sim-{i}"), format!("Sim {i}"), COLORS[i % COLORS.len()]);
        sessions.push(CanvasSession::open(Arc::clone(&feed), &cli.canvas, user, config).await?);
    }
    let settle = Duration::from_millis(cli.settle_ms);
    info!(canvas = %cli.canvas, clients = sessions.len(), "simulation started");

    manual_edits(&sessions, cli.shapes, &config)?;
    tokio::time::sleep(settle).await;

    contended_drag(&sessions).await;
    tokio::time::sleep(settle).await;

    generated_form(&sessions[0])?;
    tokio::time::sleep(settle).await;
    log_counts(&sessions, "after generated form");

    sessions[0].undo();
    tokio::time::sleep(settle).await;
    log_counts(&sessions, "after undo");

    sessions[0].redo();
    tokio::time::sleep(settle).await;
    log_counts(&sessions, "after redo");

    let converged = converged(&sessions);
    info!(converged, online = sessions[0].online_users().len(), "convergence check");
    if !converged {
        warn!("clients disagree on the object set; try a longer --settle-ms");
    }

    match sessions[0].save().await {
        Ok(objects) => info!(objects = objects.len(), "project saved"),
        Err(e) => warn!(error = %e, "save reported failures"),
    }
    for session in sessions {
        session.close().await;
    }
    Ok(())
}

async fn open_feed() -> Result<Arc<dyn ChangeFeed>, SimError> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = db::init_pool(&url).await?;
            info!("using postgres change feed");
            Ok(Arc::new(PgFeed::new(pool)))
        }
        Err(_) => {
            info!("DATABASE_URL not set; using in-memory change feed");
            Ok(Arc::new(MemoryFeed::new()))
        }
    }
}

fn rect(x: f64, y: f64, width: f64, height: f64, fill: &str) -> Shape {
    Shape::Rectangle(RectShape {
        x,
        y,
        width,
        height,
        fill: fill.into(),
        stroke: "#263238".into(),
        stroke_width: 1.0,
        rotation: 0.0,
    })
}

fn text(x: f64, y: f64, body: &str) -> Shape {
    Shape::Text(TextShape {
        x,
        y,
        width: 120.0,
        height: 30.0,
        text: body.into(),
        font_size: 16.0,
        font_family: "sans-serif".into(),
        fill: "#212121".into(),
        rotation: 0.0,
    })
}

fn random_shape(rng: &mut impl Rng, config: &SyncConfig) -> Shape {
    let x = rng.random_range(0.0..config.bounds.width - 200.0);
    let y = rng.random_range(0.0..config.bounds.height - 200.0);
    let fill = COLORS[rng.random_range(0..COLORS.len())];
    match rng.random_range(0..3) {
        0 => rect(x, y, rng.random_range(40.0..200.0), rng.random_range(40.0..200.0), fill),
        1 => Shape::Circle(CircleShape {
            x,
            y,
            radius: rng.random_range(10.0..100.0),
            fill: fill.into(),
            stroke: "#263238".into(),
            stroke_width: 1.0,
            rotation: 0.0,
        }),
        _ => text(x, y, "note"),
    }
}

fn manual_edits(sessions: &[CanvasSession], per_client: usize, config: &SyncConfig) -> Result<(), SimError> {
    let mut rng = rand::rng();
    for session in sessions {
        for _ in 0..per_client {
            session.create_object(random_shape(&mut rng, config))?;
        }
    }
    info!(created = sessions.len() * per_client, "manual edits done");
    Ok(())
}

/// First client drags an object while the second grabs the same one.
async fn contended_drag(sessions: &[CanvasSession]) {
    let [first, second, ..] = sessions else {
        info!("single client; skipping contended drag");
        return;
    };
    let Some(target) = first.context().objects.first().map(|o| o.id.clone()) else {
        return;
    };

    first.begin_drag(&target).await;
    first.drag_to(&target, 300.0, 300.0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    match second.begin_drag(&target).await {
        Some(warning) => info!(object_id = %target, %warning, "contended drag surfaced a warning"),
        None => info!(object_id = %target, "lease not yet visible to second client"),
    }
    second.drag_to(&target, 320.0, 310.0);
    second.end_drag(&target).await;
    first.end_drag(&target).await;
}

/// Eleven objects under one AI operation: title, four labelled inputs, a button.
fn generated_form(session: &CanvasSession) -> Result<(), SimError> {
    let mut shapes = vec![text(1_000.0, 1_000.0, "Sign up")];
    for (y, field) in [1_060.0, 1_110.0, 1_160.0, 1_210.0].into_iter().zip(["Name", "Email", "Password", "Confirm"]) {
        shapes.push(text(1_000.0, y, field));
        shapes.push(rect(1_130.0, y, 260.0, 30.0, "#FFFFFF"));
    }
    shapes.push(rect(1_130.0, 1_280.0, 120.0, 36.0, "#1E88E5"));
    shapes.push(text(1_140.0, 1_283.0, "Submit"));

    session.begin_ai_operation("create a signup form");
    let result = session.ai_create(shapes)?;
    session.end_ai_operation();
    info!(created = result.succeeded(), failed = result.failed_count(), "generated form");
    Ok(())
}

fn log_counts(sessions: &[CanvasSession], phase: &str) {
    for session in sessions {
        info!(%phase, user = %session.user().user_name, objects = session.context().total(), "client view");
    }
}

fn converged(sessions: &[CanvasSession]) -> bool {
    let ids = |s: &CanvasSession| s.context().objects.into_iter().map(|o| o.id).collect::<Vec<_>>();
    let Some((first, rest)) = sessions.split_first() else {
        return true;
    };
    let expected = ids(first);
    rest.iter().all(|s| ids(s) == expected)
}
