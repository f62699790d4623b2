mod alerts;
mod audit;
mod backup;
mod cache;
mod db;
mod grades;
mod ipc;
mod mail;
mod reconcile;
mod resolve;
mod sheet;

use std::io::{self, BufRead, Write};

use serde_json::json;

fn main() {
    // stdout carries protocol lines; diagnostics stay on stderr.
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("ACADEMD_LOG", "info"))
        .format_target(false)
        .init();

    let mut state = ipc::AppState::from_env();
    log::info!(
        "academd {} ready (cache ttl {}s)",
        env!("CARGO_PKG_VERSION"),
        state.cache_ttl_secs()
    );

    let mut stdout = io::stdout();

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            // No id to echo back on a line that never parsed.
            Err(e) => json!({
                "ok": false,
                "error": { "code": "bad_json", "message": e.to_string() }
            }),
        };

        match serde_json::to_string(&resp) {
            Ok(text) => {
                let _ = writeln!(stdout, "{}", text);
            }
            Err(e) => {
                log::error!("response serialization failed: {}", e);
                let _ = writeln!(stdout, "{{\"ok\":false}}");
            }
        }
        let _ = stdout.flush();
    }
}
